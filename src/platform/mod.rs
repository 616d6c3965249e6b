//! The platform contract and its backends.
//!
//! [`Platform`] is the single capability set the agent's bootstrap and
//! apply-settings workflows call into. One concrete type implements it per
//! OS family, chosen at process start by [`PlatformKind`]:
//!
//! - [`LinuxPlatform`] drives the host through its standard tooling.
//! - [`NullPlatform`] satisfies the same contract with operations that
//!   succeed without side effects, for hosts without a real backend.

mod linux;
mod null;

use std::time::Duration;

use camino::Utf8PathBuf;

pub use linux::LinuxPlatform;
pub use null::NullPlatform;

use crate::accounts::AccountOptions;
use crate::cert::CertManager;
use crate::compressor::Compressor;
use crate::config::{AgentConfig, ConfigError};
use crate::copier::Copier;
use crate::devicepath::DevicePathResolver;
use crate::dirs::DirProvider;
use crate::disk::{DiskOptions, RawEphemeralDisk};
use crate::error::PlatformResult;
use crate::fs::{FileSystem, HostFileSystem, HostPaths};
use crate::runner::{CommandRunner, ProcessCommandRunner};
use crate::settings::{DiskSettings, Network, Networks};
use crate::signal::ShutdownSignal;
use crate::supervision::{MonitTiming, SupervisionCredentials};
use crate::vitals::VitalsService;

/// Operating-system family a backend serves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlatformKind {
    /// Linux hosts.
    Linux,
    /// Hosts without a real backend.
    Null,
}

impl PlatformKind {
    /// Detects the backend for the running target.
    #[must_use]
    pub const fn detect() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Null
        }
    }

    /// Parses a configured platform name; `auto` defers to
    /// [`Self::detect`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::detect()),
            "linux" => Some(Self::Linux),
            "null" => Some(Self::Null),
            _ => None,
        }
    }
}

/// Strongly typed backend settings derived from [`AgentConfig`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlatformOptions {
    /// Root the logical host paths are mapped under.
    pub host_root: Utf8PathBuf,
    /// Managed directory layout.
    pub dirs: DirProvider,
    /// Account naming rules.
    pub accounts: AccountOptions,
    /// Disk filesystem choices.
    pub disks: DiskOptions,
    /// Payload read from removable media.
    pub media_settings_file: String,
    /// Supervision start timing.
    pub monit: MonitTiming,
    /// Upper bound on waiting for a disk to appear.
    pub device_path_timeout: Duration,
    /// Delay between device-path probes.
    pub device_path_poll_interval: Duration,
    /// Open-file limit applied by runtime configuration.
    pub runtime_limits_nofile: u64,
}

impl Default for PlatformOptions {
    fn default() -> Self {
        Self {
            host_root: Utf8PathBuf::from("/"),
            dirs: DirProvider::default(),
            accounts: AccountOptions::default(),
            disks: DiskOptions::default(),
            media_settings_file: String::from("env.json"),
            monit: MonitTiming::default(),
            device_path_timeout: Duration::from_secs(30),
            device_path_poll_interval: Duration::from_millis(500),
            runtime_limits_nofile: 65_536,
        }
    }
}

impl PlatformOptions {
    /// Returns the logical-to-host path mapping.
    #[must_use]
    pub fn host_paths(&self) -> HostPaths {
        HostPaths::new(self.host_root.clone())
    }
}

/// The capability set every OS backend provides.
///
/// Operations on the same disk or account must be serialised by the
/// caller. Queries re-read host state on every call.
pub trait Platform {
    /// Filesystem collaborator.
    fn fs(&self) -> &dyn FileSystem;
    /// Command runner collaborator.
    fn runner(&self) -> &dyn CommandRunner;
    /// Archive collaborator.
    fn compressor(&self) -> &dyn Compressor;
    /// Directory-copy collaborator.
    fn copier(&self) -> &dyn Copier;
    /// Managed directory layout.
    fn dir_provider(&self) -> &DirProvider;
    /// Vitals service; the platform never drives its collection.
    fn vitals_service(&self) -> &VitalsService;
    /// Device-path resolver used for persistent disks.
    fn device_path_resolver(&self) -> &dyn DevicePathResolver;
    /// Trusted certificate manager.
    fn cert_manager(&self) -> &dyn CertManager;

    /// Applies runtime tuning such as resource limits. Callers treat
    /// failure as non-fatal.
    ///
    /// # Errors
    ///
    /// Returns the backend's error when tuning fails.
    fn setup_runtime_configuration(&self) -> PlatformResult<()>;

    /// Creates `username`, or reconciles an existing account without
    /// touching its password.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::InvalidInput`] for an invalid name.
    fn create_user(&self, username: &str, password: &str, base_path: &str) -> PlatformResult<()>;

    /// Ensures membership in each of `groups`, keeping other memberships.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::UnknownUser`] when the account is
    /// missing.
    fn add_user_to_groups(&self, username: &str, groups: &[String]) -> PlatformResult<()>;

    /// Deletes ephemeral accounts matching the glob `pattern`, returning the
    /// number removed. Never removes the control account.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] when deletion fails.
    fn delete_ephemeral_users_matching(&self, pattern: &str) -> PlatformResult<usize>;

    /// Grows the root filesystem into free space on the root disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::DiskLayout`] when growing fails.
    fn setup_root_disk(&self, ephemeral_disk_path: &str) -> PlatformResult<()>;

    /// Installs `public_key` as the managed key of `username`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::UnknownUser`] when the account is
    /// missing.
    fn setup_ssh(&self, public_key: &str, username: &str) -> PlatformResult<()>;

    /// Sets an already-encrypted password hash.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::UnknownUser`] when the account is
    /// missing.
    fn set_user_password(&self, username: &str, encrypted: &str) -> PlatformResult<()>;

    /// Sets the host name.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::InvalidInput`] for an empty name.
    fn setup_hostname(&self, hostname: &str) -> PlatformResult<()>;

    /// Applies network definitions; a no-op when already in place.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::NetworkApply`] naming the failing
    /// interface.
    fn setup_networking(&self, networks: &Networks) -> PlatformResult<()>;

    /// Lists interfaces bearing a non-loopback address.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] when interfaces cannot
    /// be listed.
    fn configured_network_interfaces(&self) -> PlatformResult<Vec<String>>;

    /// Installs log rotation for job logs.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::InvalidInput`] for empty arguments.
    fn setup_logrotate(&self, group: &str, base_path: &str, size: &str) -> PlatformResult<()>;

    /// Synchronises the clock against `servers`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] when the sync fails.
    fn set_time_with_ntp_servers(&self, servers: &[String]) -> PlatformResult<()>;

    /// Partitions, formats and mounts the ephemeral disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::DeviceNotFound`] or
    /// [`crate::PlatformError::Format`].
    fn setup_ephemeral_disk_with_path(&self, device_path: &str) -> PlatformResult<()>;

    /// Prepares raw ephemeral disks; the result follows input order.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::RawEphemeral`] naming the disks
    /// prepared before the failure.
    fn setup_raw_ephemeral_disks(&self, disks: &[DiskSettings]) -> PlatformResult<Vec<RawEphemeralDisk>>;

    /// Creates the agent's system directories.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] on failure.
    fn setup_data_dir(&self) -> PlatformResult<()>;

    /// Creates the agent-private temporary directory.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] on failure.
    fn setup_tmp_dir(&self) -> PlatformResult<()>;

    /// Resolves, formats (when needed) and mounts a persistent disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::DevicePathTimedOut`] when the device
    /// did not appear and [`crate::PlatformError::AlreadyMounted`] when the
    /// mount point holds another disk.
    fn mount_persistent_disk(&self, disk: &DiskSettings, mount_point: &str) -> PlatformResult<()>;

    /// Unmounts a persistent disk; `Ok(false)` when it was not mounted.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] when unmounting fails.
    fn unmount_persistent_disk(&self, disk: &DiskSettings) -> PlatformResult<bool>;

    /// Moves persistent data from the disk at `from` to the disk at `to`
    /// and mounts the latter at `from`. Atomic from the caller's view.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Migration`]; the original mount is
    /// left intact.
    fn migrate_persistent_disk(&self, from: &str, to: &str) -> PlatformResult<()>;

    /// Maps settings to the expected ephemeral device path.
    fn ephemeral_disk_path(&self, disk: &DiskSettings) -> String;

    /// Reads the settings payload from removable media.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::MediaNotFound`] or
    /// [`crate::PlatformError::Read`].
    fn file_contents_from_cdrom(&self, disk_path: &str) -> PlatformResult<Vec<u8>>;

    /// Reads named files from a disk, in order, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::MediaNotFound`] or
    /// [`crate::PlatformError::Read`].
    fn files_contents_from_disk(&self, disk_path: &str, file_names: &[String]) -> PlatformResult<Vec<Vec<u8>>>;

    /// Reports whether `path` is a mount point.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] when the mount table
    /// cannot be read.
    fn is_mount_point(&self, path: &str) -> PlatformResult<bool>;

    /// Reports whether a persistent disk is mounted anywhere.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] when the mount table
    /// cannot be read.
    fn is_persistent_disk_mounted(&self, disk: &DiskSettings) -> PlatformResult<bool>;

    /// Starts supervision and blocks until it answers or times out.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::SupervisionStartTimeout`].
    fn start_monit(&self) -> PlatformResult<()>;

    /// Creates and persists supervision credentials once.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] when persisting fails.
    fn setup_monit_user(&self) -> PlatformResult<()>;

    /// Returns the persisted supervision credentials.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::CredentialsNotInitialized`].
    fn monit_credentials(&self) -> PlatformResult<SupervisionCredentials>;

    /// Quiesces dependents before a network change. Failure aborts the
    /// change.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] on failure.
    fn prepare_for_networking_change(&self) -> PlatformResult<()>;

    /// Returns the recorded default network or the zero value.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Read`] when the record is corrupt.
    fn default_network(&self) -> PlatformResult<Network>;

    /// Returns the host identity key, generating it on first call.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] when generation fails.
    fn host_public_key(&self) -> PlatformResult<String>;
}

/// Builds the backend selected by `config` on the real host.
///
/// # Errors
///
/// Returns [`ConfigError`] when the configuration fails validation.
pub fn new_platform(
    config: &AgentConfig,
    shutdown: ShutdownSignal,
) -> Result<Box<dyn Platform>, ConfigError> {
    let kind = config.platform_kind()?;
    let options = config.platform_options()?;
    let platform: Box<dyn Platform> = match kind {
        PlatformKind::Linux => Box::new(LinuxPlatform::new(
            ProcessCommandRunner,
            HostFileSystem,
            options,
            shutdown,
        )),
        PlatformKind::Null => Box::new(NullPlatform::new(
            ProcessCommandRunner,
            HostFileSystem,
            options,
        )),
    };
    Ok(platform)
}
