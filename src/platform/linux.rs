//! Linux backend composing the component managers.

use tracing::{info, warn};

use super::{Platform, PlatformOptions};
use crate::accounts::AccountManager;
use crate::cert::{CaBundleCertManager, CertManager};
use crate::compressor::{Compressor, TarballCompressor};
use crate::copier::{Copier, CpCopier};
use crate::devicepath::{DevicePathResolver, IdDevicePathResolver, ResolvedDevicePath};
use crate::dirs::DirProvider;
use crate::disk::{DiskManager, RawEphemeralDisk, ephemeral_disk_path};
use crate::error::{PlatformError, PlatformResult};
use crate::fs::{FileSystem, HostPaths};
use crate::host_key::HostKeyStore;
use crate::media::MediaReader;
use crate::network::NetworkConfigurator;
use crate::runner::CommandRunner;
use crate::settings::{DiskSettings, Network, Networks};
use crate::signal::ShutdownSignal;
use crate::supervision::{MonitBootstrapper, SupervisionCredentials};
use crate::system::SystemConfigurator;
use crate::vitals::{ProcStatsCollector, VitalsService};

/// [`Platform`] backed by Linux host tooling.
///
/// All host access goes through the `runner` and `fs` handed to
/// [`LinuxPlatform::new`], with logical paths mapped under
/// [`PlatformOptions::host_root`].
pub struct LinuxPlatform<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    dirs: DirProvider,
    disks: DiskManager<R, F>,
    accounts: AccountManager<R, F>,
    network: NetworkConfigurator<R, F>,
    monit: MonitBootstrapper<R, F>,
    media: MediaReader<R, F>,
    host_key: HostKeyStore<R, F>,
    system: SystemConfigurator<R, F>,
    compressor: TarballCompressor<R, F>,
    copier: CpCopier<R, F>,
    vitals: VitalsService,
    resolver: Box<dyn DevicePathResolver>,
    cert_manager: Box<dyn CertManager>,
}

impl<R, F> std::fmt::Debug for LinuxPlatform<R, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinuxPlatform")
            .field("paths", &self.paths)
            .field("dirs", &self.dirs)
            .finish_non_exhaustive()
    }
}

impl<R, F> LinuxPlatform<R, F>
where
    R: CommandRunner + Clone + 'static,
    F: FileSystem + Clone + 'static,
{
    /// Wires every component onto the shared `runner` and `fs`.
    #[must_use]
    pub fn new(runner: R, fs: F, options: PlatformOptions, shutdown: ShutdownSignal) -> Self {
        let paths = options.host_paths();
        let dirs = options.dirs.clone();
        let control_user = options.accounts.control_user.clone();
        Self {
            disks: DiskManager::new(
                runner.clone(),
                fs.clone(),
                paths.clone(),
                dirs.clone(),
                options.disks.clone(),
            ),
            accounts: AccountManager::new(
                runner.clone(),
                fs.clone(),
                paths.clone(),
                options.accounts.clone(),
            ),
            network: NetworkConfigurator::new(
                runner.clone(),
                fs.clone(),
                paths.clone(),
                dirs.clone(),
            ),
            monit: MonitBootstrapper::new(
                runner.clone(),
                fs.clone(),
                paths.clone(),
                dirs.monit_credentials_path(),
                control_user.clone(),
                options.monit,
                shutdown.clone(),
            ),
            media: MediaReader::new(
                runner.clone(),
                fs.clone(),
                paths.clone(),
                dirs.media_mount_dir(),
                options.media_settings_file.clone(),
            ),
            host_key: HostKeyStore::new(
                runner.clone(),
                fs.clone(),
                paths.clone(),
                dirs.host_key_path(),
            ),
            system: SystemConfigurator::new(
                runner.clone(),
                fs.clone(),
                paths.clone(),
                dirs.clone(),
                control_user,
                options.runtime_limits_nofile,
            ),
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
            resolver: Box::new(IdDevicePathResolver::new(
                runner.clone(),
                fs.clone(),
                paths.clone(),
                options.device_path_timeout,
                options.device_path_poll_interval,
                shutdown,
            )),
            cert_manager: Box::new(CaBundleCertManager::new(
                runner.clone(),
                fs.clone(),
                paths.clone(),
            )),
            runner,
            fs,
            paths,
            dirs,
        }
    }

    /// Replaces the device-path resolver.
    #[must_use]
    pub fn with_device_path_resolver(mut self, resolver: Box<dyn DevicePathResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replaces the certificate manager.
    #[must_use]
    pub fn with_cert_manager(mut self, cert_manager: Box<dyn CertManager>) -> Self {
        self.cert_manager = cert_manager;
        self
    }
}

impl<R: CommandRunner, F: FileSystem> LinuxPlatform<R, F> {
    fn resolve_device(&self, disk: &DiskSettings) -> PlatformResult<ResolvedDevicePath> {
        let resolved = self.resolver.resolve(disk)?;
        if resolved.timed_out {
            warn!(disk = disk.label(), "device path did not appear");
        }
        Ok(resolved)
    }
}

impl<R: CommandRunner, F: FileSystem> Platform for LinuxPlatform<R, F> {
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
        self.resolver.as_ref()
    }

    fn cert_manager(&self) -> &dyn CertManager {
        self.cert_manager.as_ref()
    }

    fn setup_runtime_configuration(&self) -> PlatformResult<()> {
        self.system.setup_runtime_configuration()
    }

    fn create_user(&self, username: &str, password: &str, base_path: &str) -> PlatformResult<()> {
        self.accounts.create_user(username, password, base_path)
    }

    fn add_user_to_groups(&self, username: &str, groups: &[String]) -> PlatformResult<()> {
        self.accounts.add_user_to_groups(username, groups)
    }

    fn delete_ephemeral_users_matching(&self, pattern: &str) -> PlatformResult<usize> {
        self.accounts.delete_ephemeral_users_matching(pattern)
    }

    fn setup_root_disk(&self, ephemeral_disk_path: &str) -> PlatformResult<()> {
        self.disks.setup_root_disk(ephemeral_disk_path)
    }

    fn setup_ssh(&self, public_key: &str, username: &str) -> PlatformResult<()> {
        self.accounts.setup_ssh(public_key, username)
    }

    fn set_user_password(&self, username: &str, encrypted: &str) -> PlatformResult<()> {
        self.accounts.set_user_password(username, encrypted)
    }

    fn setup_hostname(&self, hostname: &str) -> PlatformResult<()> {
        self.system.setup_hostname(hostname)
    }

    fn setup_networking(&self, networks: &Networks) -> PlatformResult<()> {
        self.network.setup_networking(networks)
    }

    fn configured_network_interfaces(&self) -> PlatformResult<Vec<String>> {
        self.network.configured_interfaces()
    }

    fn setup_logrotate(&self, group: &str, base_path: &str, size: &str) -> PlatformResult<()> {
        self.system.setup_logrotate(group, base_path, size)
    }

    fn set_time_with_ntp_servers(&self, servers: &[String]) -> PlatformResult<()> {
        self.system.set_time_with_ntp_servers(servers)
    }

    fn setup_ephemeral_disk_with_path(&self, device_path: &str) -> PlatformResult<()> {
        self.disks.setup_ephemeral_disk(device_path)
    }

    fn setup_raw_ephemeral_disks(&self, disks: &[DiskSettings]) -> PlatformResult<Vec<RawEphemeralDisk>> {
        self.disks.setup_raw_ephemeral_disks(self.resolver.as_ref(), disks)
    }

    fn setup_data_dir(&self) -> PlatformResult<()> {
        self.system.setup_data_dir()
    }

    fn setup_tmp_dir(&self) -> PlatformResult<()> {
        self.system.setup_tmp_dir()
    }

    fn mount_persistent_disk(&self, disk: &DiskSettings, mount_point: &str) -> PlatformResult<()> {
        let resolved = self.resolve_device(disk)?;
        if resolved.timed_out {
            return Err(PlatformError::DevicePathTimedOut {
                disk_id: disk.label().to_owned(),
            });
        }
        self.disks.mount_persistent(disk, &resolved.path, mount_point)?;
        info!(device = %resolved.path, mount_point, "persistent disk mounted");
        Ok(())
    }

    fn unmount_persistent_disk(&self, disk: &DiskSettings) -> PlatformResult<bool> {
        let resolved = self.resolve_device(disk)?;
        if resolved.timed_out {
            return Ok(false);
        }
        self.disks.unmount_persistent(disk, &resolved.path)
    }

    fn migrate_persistent_disk(&self, from: &str, to: &str) -> PlatformResult<()> {
        self.disks.migrate_persistent(&self.copier, from, to)
    }

    fn ephemeral_disk_path(&self, disk: &DiskSettings) -> String {
        if !disk.path.is_empty() || disk.device_id.is_empty() {
            return ephemeral_disk_path(disk);
        }
        match self.resolve_device(disk) {
            Ok(resolved) if !resolved.timed_out => resolved.path,
            Ok(_) => ephemeral_disk_path(disk),
            Err(err) => {
                warn!(disk = disk.label(), error = %err, "could not resolve ephemeral disk");
                ephemeral_disk_path(disk)
            }
        }
    }

    fn file_contents_from_cdrom(&self, disk_path: &str) -> PlatformResult<Vec<u8>> {
        self.media.settings_payload(disk_path)
    }

    fn files_contents_from_disk(&self, disk_path: &str, file_names: &[String]) -> PlatformResult<Vec<Vec<u8>>> {
        self.media.read_files(disk_path, file_names)
    }

    fn is_mount_point(&self, path: &str) -> PlatformResult<bool> {
        self.disks.is_mount_point(path)
    }

    fn is_persistent_disk_mounted(&self, disk: &DiskSettings) -> PlatformResult<bool> {
        let resolved = self.resolve_device(disk)?;
        if resolved.timed_out {
            return Ok(false);
        }
        self.disks.is_persistent_mounted(disk, &resolved.path)
    }

    fn start_monit(&self) -> PlatformResult<()> {
        self.monit.start_monit()
    }

    fn setup_monit_user(&self) -> PlatformResult<()> {
        self.monit.setup_monit_user()
    }

    fn monit_credentials(&self) -> PlatformResult<SupervisionCredentials> {
        self.monit.monit_credentials()
    }

    fn prepare_for_networking_change(&self) -> PlatformResult<()> {
        self.network.prepare_for_networking_change()
    }

    fn default_network(&self) -> PlatformResult<Network> {
        self.network.default_network()
    }

    fn host_public_key(&self) -> PlatformResult<String> {
        self.host_key.public_key()
    }
}
