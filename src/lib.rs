//! Host platform layer for a VM agent.
//!
//! The crate turns the agent's declarative settings into host state: it
//! partitions and mounts disks, manages local accounts, configures network
//! interfaces, bootstraps `monit` supervision and reads settings from
//! removable media. [`Platform`] is the single façade the agent talks to;
//! [`platform::new_platform`] selects the Linux or null backend. The
//! [`control`] module carries the ping/pong liveness check spoken over the
//! agent's control channel.

pub mod accounts;
pub mod bootstrap;
pub mod cert;
pub mod compressor;
pub mod config;
pub mod control;
pub mod copier;
pub mod devicepath;
pub mod dirs;
pub mod disk;
pub mod error;
pub mod fs;
pub mod host_key;
pub mod logging;
pub mod media;
pub mod network;
pub mod platform;
pub mod runner;
pub mod settings;
pub mod signal;
pub mod supervision;
pub mod system;
pub mod test_support;
pub mod vitals;

pub use accounts::{Account, AccountManager, AccountOptions};
pub use bootstrap::{BootstrapError, BootstrapReport, BootstrapStep, Bootstrapper, SettingsSource};
pub use config::{AgentConfig, ConfigError};
pub use dirs::DirProvider;
pub use disk::{DiskManager, DiskOptions, RawEphemeralDisk};
pub use error::{PlatformError, PlatformResult};
pub use fs::{FileSystem, FsError, HostFileSystem, HostPaths};
pub use platform::{LinuxPlatform, NullPlatform, Platform, PlatformKind, PlatformOptions, new_platform};
pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner, RunnerError};
pub use settings::{AgentSettings, DiskSettings, Network, NetworkType, Networks};
pub use signal::ShutdownSignal;
pub use supervision::{MonitTiming, SupervisionCredentials};
