//! Backend for hosts without real platform support.
//!
//! Mutating operations succeed without touching the host and queries return
//! empty results. The two settings lookups still read from the bosh and
//! media directories so a provisioner can seed them by hand.

use tracing::debug;

use super::{Platform, PlatformOptions};
use crate::cert::{CertManager, DummyCertManager};
use crate::compressor::{Compressor, TarballCompressor};
use crate::copier::{Copier, CpCopier};
use crate::devicepath::{DevicePathResolver, IdentityDevicePathResolver};
use crate::dirs::DirProvider;
use crate::disk::RawEphemeralDisk;
use crate::error::{PlatformError, PlatformResult};
use crate::fs::{FileSystem, HostPaths};
use crate::network::read_network_record;
use crate::runner::CommandRunner;
use crate::settings::{DiskSettings, Network, Networks};
use crate::supervision::SupervisionCredentials;
use crate::vitals::{ProcStatsCollector, VitalsService};

/// Device reported as the ephemeral disk.
pub const NULL_EPHEMERAL_DISK: &str = "/dev/sdb";

/// Key reported as the host identity.
pub const NULL_HOST_PUBLIC_KEY: &str = "dummy-public-key";

/// Record consulted by [`Platform::default_network`].
pub const NULL_DEFAULT_NETWORK_FILE: &str = "dummy-default-network-settings.json";

/// [`Platform`] whose operations are side-effect free.
pub struct NullPlatform<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    dirs: DirProvider,
    media_settings_file: String,
    compressor: TarballCompressor<R, F>,
    copier: CpCopier<R, F>,
    vitals: VitalsService,
    resolver: IdentityDevicePathResolver,
    cert_manager: DummyCertManager,
}

impl<R, F> std::fmt::Debug for NullPlatform<R, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NullPlatform")
            .field("paths", &self.paths)
            .field("dirs", &self.dirs)
            .finish_non_exhaustive()
    }
}

impl<R, F> NullPlatform<R, F>
where
    R: CommandRunner + Clone + 'static,
    F: FileSystem + Clone + 'static,
{
    /// Creates the backend; `runner` is only reached through the
    /// collaborator accessors.
    #[must_use]
    pub fn new(runner: R, fs: F, options: PlatformOptions) -> Self {
        let paths = options.host_paths();
        let dirs = options.dirs;
        Self {
            compressor: TarballCompressor::new(
                runner.clone(),
                fs.clone(),
                paths.clone(),
                dirs.tmp_dir(),
            ),
            copier: CpCopier::new(runner.clone(), fs.clone(), paths.clone()),
            vitals: VitalsService::new(
                Box::new(ProcStatsCollector::new(runner.clone(), fs.clone(), paths.clone())),
                dirs.clone(),
            ),
            resolver: IdentityDevicePathResolver,
            cert_manager: DummyCertManager,
            media_settings_file: options.media_settings_file,
            runner,
            fs,
            paths,
            dirs,
        }
    }
}

impl<R: CommandRunner, F: FileSystem> Platform for NullPlatform<R, F> {
    fn fs(&self) -> &dyn FileSystem {
        &self.fs
    }

    fn runner(&self) -> &dyn CommandRunner {
        &self.runner
    }

    fn compressor(&self) -> &dyn Compressor {
        &self.compressor
    }

    fn copier(&self) -> &dyn Copier {
        &self.copier
    }

    fn dir_provider(&self) -> &DirProvider {
        &self.dirs
    }

    fn vitals_service(&self) -> &VitalsService {
        &self.vitals
    }

    fn device_path_resolver(&self) -> &dyn DevicePathResolver {
        &self.resolver
    }

    fn cert_manager(&self) -> &dyn CertManager {
        &self.cert_manager
    }

    fn setup_runtime_configuration(&self) -> PlatformResult<()> {
        Ok(())
    }

    fn create_user(&self, username: &str, _password: &str, _base_path: &str) -> PlatformResult<()> {
        debug!(user = username, "null platform: create user");
        Ok(())
    }

    fn add_user_to_groups(&self, _username: &str, _groups: &[String]) -> PlatformResult<()> {
        Ok(())
    }

    fn delete_ephemeral_users_matching(&self, _pattern: &str) -> PlatformResult<usize> {
        Ok(0)
    }

    fn setup_root_disk(&self, _ephemeral_disk_path: &str) -> PlatformResult<()> {
        Ok(())
    }

    fn setup_ssh(&self, _public_key: &str, _username: &str) -> PlatformResult<()> {
        Ok(())
    }

    fn set_user_password(&self, _username: &str, _encrypted: &str) -> PlatformResult<()> {
        Ok(())
    }

    fn setup_hostname(&self, _hostname: &str) -> PlatformResult<()> {
        Ok(())
    }

    fn setup_networking(&self, _networks: &Networks) -> PlatformResult<()> {
        Ok(())
    }

    fn configured_network_interfaces(&self) -> PlatformResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn setup_logrotate(&self, _group: &str, _base_path: &str, _size: &str) -> PlatformResult<()> {
        Ok(())
    }

    fn set_time_with_ntp_servers(&self, _servers: &[String]) -> PlatformResult<()> {
        Ok(())
    }

    fn setup_ephemeral_disk_with_path(&self, _device_path: &str) -> PlatformResult<()> {
        Ok(())
    }

    fn setup_raw_ephemeral_disks(&self, _disks: &[DiskSettings]) -> PlatformResult<Vec<RawEphemeralDisk>> {
        Ok(Vec::new())
    }

    fn setup_data_dir(&self) -> PlatformResult<()> {
        Ok(())
    }

    fn setup_tmp_dir(&self) -> PlatformResult<()> {
        Ok(())
    }

    fn mount_persistent_disk(&self, _disk: &DiskSettings, _mount_point: &str) -> PlatformResult<()> {
        Ok(())
    }

    fn unmount_persistent_disk(&self, _disk: &DiskSettings) -> PlatformResult<bool> {
        Ok(false)
    }

    fn migrate_persistent_disk(&self, _from: &str, _to: &str) -> PlatformResult<()> {
        Ok(())
    }

    fn ephemeral_disk_path(&self, _disk: &DiskSettings) -> String {
        NULL_EPHEMERAL_DISK.to_owned()
    }

    fn file_contents_from_cdrom(&self, _disk_path: &str) -> PlatformResult<Vec<u8>> {
        let logical = self.dirs.media_mount_dir().join(&self.media_settings_file);
        self.fs
            .read(&self.paths.resolve(&logical))
            .map_err(|err| PlatformError::Read {
                path: logical.to_string(),
                message: err.to_string(),
            })
    }

    fn files_contents_from_disk(&self, _disk_path: &str, _file_names: &[String]) -> PlatformResult<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }

    fn is_mount_point(&self, _path: &str) -> PlatformResult<bool> {
        Ok(false)
    }

    fn is_persistent_disk_mounted(&self, _disk: &DiskSettings) -> PlatformResult<bool> {
        Ok(true)
    }

    fn start_monit(&self) -> PlatformResult<()> {
        Ok(())
    }

    fn setup_monit_user(&self) -> PlatformResult<()> {
        Ok(())
    }

    fn monit_credentials(&self) -> PlatformResult<SupervisionCredentials> {
        Ok(SupervisionCredentials {
            username: String::new(),
            password: String::new(),
        })
    }

    fn prepare_for_networking_change(&self) -> PlatformResult<()> {
        Ok(())
    }

    fn default_network(&self) -> PlatformResult<Network> {
        let logical = self.dirs.bosh_dir().join(NULL_DEFAULT_NETWORK_FILE);
        read_network_record(&self.fs, &self.paths.resolve(logical))
    }

    fn host_public_key(&self) -> PlatformResult<String> {
        Ok(NULL_HOST_PUBLIC_KEY.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::HostFileSystem;
    use crate::settings::NetworkType;
    use crate::test_support::ScriptedRunner;
    use camino::Utf8PathBuf;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        root: Utf8PathBuf,
        platform: NullPlatform<ScriptedRunner, HostFileSystem>,
        runner: ScriptedRunner,
    }

    #[fixture]
    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
        let runner = ScriptedRunner::new();
        let options = PlatformOptions {
            host_root: root.clone(),
            ..PlatformOptions::default()
        };
        Harness {
            _tmp: tmp,
            platform: NullPlatform::new(runner.clone(), HostFileSystem, options),
            root,
            runner,
        }
    }

    fn seed(harness: &Harness, logical: &str, contents: &str) {
        let path = HostPaths::new(harness.root.clone()).resolve(logical);
        HostFileSystem
            .write(&path, contents.as_bytes())
            .unwrap_or_else(|err| panic!("seed {logical}: {err}"));
    }

    #[rstest]
    fn mutating_operations_succeed_without_commands(harness: Harness) {
        let platform = &harness.platform;
        let disk = DiskSettings::with_path("disk-1", "/dev/sdc");
        platform
            .create_user("bosh_a", "", "")
            .unwrap_or_else(|err| panic!("create user: {err}"));
        platform
            .setup_ephemeral_disk_with_path("/dev/sdb")
            .unwrap_or_else(|err| panic!("ephemeral: {err}"));
        platform
            .mount_persistent_disk(&disk, "/var/vcap/store")
            .unwrap_or_else(|err| panic!("mount: {err}"));
        platform
            .start_monit()
            .unwrap_or_else(|err| panic!("monit: {err}"));
        assert!(harness.runner.invocations().is_empty());
    }

    #[rstest]
    fn queries_report_stub_values(harness: Harness) {
        let platform = &harness.platform;
        let disk = DiskSettings::with_path("disk-1", "/dev/sdc");
        assert_eq!(platform.ephemeral_disk_path(&disk), "/dev/sdb");
        assert_eq!(
            platform.host_public_key().ok().as_deref(),
            Some("dummy-public-key")
        );
        assert_eq!(platform.is_persistent_disk_mounted(&disk).ok(), Some(true));
        assert_eq!(platform.unmount_persistent_disk(&disk).ok(), Some(false));
        assert_eq!(platform.configured_network_interfaces().ok(), Some(Vec::new()));
        assert_eq!(platform.delete_ephemeral_users_matching("*").ok(), Some(0));
    }

    #[rstest]
    fn default_network_is_zero_value_when_unrecorded(harness: Harness) {
        let network = harness
            .platform
            .default_network()
            .unwrap_or_else(|err| panic!("default network: {err}"));
        assert!(network.is_empty());
    }

    #[rstest]
    fn default_network_reads_seeded_record(harness: Harness) {
        seed(
            &harness,
            "/var/vcap/bosh/dummy-default-network-settings.json",
            r#"{"type":"dynamic","ip":"10.0.0.5","gateway":"10.0.0.1"}"#,
        );
        let network = harness
            .platform
            .default_network()
            .unwrap_or_else(|err| panic!("default network: {err}"));
        assert_eq!(network.network_type, NetworkType::Dynamic);
        assert_eq!(network.ip, "10.0.0.5");
    }

    #[rstest]
    fn corrupt_default_network_surfaces(harness: Harness) {
        seed(
            &harness,
            "/var/vcap/bosh/dummy-default-network-settings.json",
            "{not json",
        );
        assert!(matches!(
            harness.platform.default_network(),
            Err(PlatformError::Read { .. })
        ));
    }

    #[rstest]
    fn cdrom_reads_seeded_payload(harness: Harness) {
        seed(
            &harness,
            "/var/vcap/bosh/settings-media/env.json",
            r#"{"agent_id":"abc"}"#,
        );
        let payload = harness
            .platform
            .file_contents_from_cdrom("/dev/sr0")
            .unwrap_or_else(|err| panic!("cdrom: {err}"));
        assert_eq!(payload, br#"{"agent_id":"abc"}"#.to_vec());
    }
}
