//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::accounts::AccountOptions;
use crate::dirs::{DEFAULT_BASE_DIR, DirProvider};
use crate::disk::DiskOptions;
use crate::platform::{PlatformKind, PlatformOptions};
use crate::supervision::MonitTiming;

/// Agent settings merged from defaults, `hostkit.toml` and `HOSTKIT_*`
/// environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HOSTKIT",
    discovery(
        app_name = "hostkit",
        env_var = "HOSTKIT_CONFIG_PATH",
        config_file_name = "hostkit.toml",
        dotfile_name = ".hostkit.toml",
        project_file_name = "hostkit.toml"
    )
)]
pub struct AgentConfig {
    /// Root of the agent's managed directories.
    #[ortho_config(default = DEFAULT_BASE_DIR.to_owned())]
    pub base_dir: String,
    /// Directory the host's filesystem is addressed under. `/` in
    /// production.
    #[ortho_config(default = "/".to_owned())]
    pub host_root: String,
    /// Backend selection: `auto`, `linux` or `null`.
    #[ortho_config(default = "auto".to_owned())]
    pub platform: String,
    /// Account the agent manages the host as; never purged.
    #[ortho_config(default = "vcap".to_owned())]
    pub control_user: String,
    /// Prefix marking ephemeral accounts.
    #[ortho_config(default = "bosh_".to_owned())]
    pub ephemeral_user_prefix: String,
    /// Login shell for created accounts.
    #[ortho_config(default = "/bin/bash".to_owned())]
    pub user_shell: String,
    /// Filesystem for the ephemeral data partition.
    #[ortho_config(default = "ext4".to_owned())]
    pub ephemeral_fs_type: String,
    /// Filesystem for persistent disks without an explicit type.
    #[ortho_config(default = "ext4".to_owned())]
    pub persistent_fs_type: String,
    /// Swap carved from the ephemeral disk, in MiB. No swap when unset.
    pub swap_size_mib: Option<u64>,
    /// Name of the settings payload on removable media.
    #[ortho_config(default = "env.json".to_owned())]
    pub media_settings_file: String,
    /// Upper bound on waiting for supervision to answer.
    #[ortho_config(default = 60)]
    pub monit_start_timeout_secs: u64,
    /// Delay between supervision probes.
    #[ortho_config(default = 1000)]
    pub monit_poll_interval_ms: u64,
    /// Upper bound on waiting for a persistent disk to appear.
    #[ortho_config(default = 30)]
    pub device_path_timeout_secs: u64,
    /// Delay between device-path probes.
    #[ortho_config(default = 500)]
    pub device_path_poll_interval_ms: u64,
    /// Open-file limit applied by runtime configuration.
    #[ortho_config(default = 65_536)]
    pub runtime_limits_nofile: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_dir: DEFAULT_BASE_DIR.to_owned(),
            host_root: String::from("/"),
            platform: String::from("auto"),
            control_user: String::from("vcap"),
            ephemeral_user_prefix: String::from("bosh_"),
            user_shell: String::from("/bin/bash"),
            ephemeral_fs_type: String::from("ext4"),
            persistent_fs_type: String::from("ext4"),
            swap_size_mib: None,
            media_settings_file: String::from("env.json"),
            monit_start_timeout_secs: 60,
            monit_poll_interval_ms: 1000,
            device_path_timeout_secs: 30,
            device_path_poll_interval_ms: 500,
            runtime_limits_nofile: 65_536,
        }
    }
}

fn require_text(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::invalid(field, "must not be empty"));
    }
    Ok(())
}

fn require_positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be greater than zero"));
    }
    Ok(())
}

impl AgentConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("hostkit")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] naming the first offending
    /// field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("base_dir", &self.base_dir),
            ("host_root", &self.host_root),
            ("control_user", &self.control_user),
            ("ephemeral_user_prefix", &self.ephemeral_user_prefix),
            ("user_shell", &self.user_shell),
            ("ephemeral_fs_type", &self.ephemeral_fs_type),
            ("persistent_fs_type", &self.persistent_fs_type),
            ("media_settings_file", &self.media_settings_file),
        ] {
            require_text(field, value)?;
        }
        if PlatformKind::from_name(&self.platform).is_none() {
            return Err(ConfigError::invalid(
                "platform",
                "expected one of auto, linux, null",
            ));
        }
        if self.swap_size_mib == Some(0) {
            return Err(ConfigError::invalid("swap_size_mib", "must be greater than zero"));
        }
        require_positive("monit_start_timeout_secs", self.monit_start_timeout_secs)?;
        require_positive("monit_poll_interval_ms", self.monit_poll_interval_ms)?;
        require_positive("device_path_timeout_secs", self.device_path_timeout_secs)?;
        require_positive(
            "device_path_poll_interval_ms",
            self.device_path_poll_interval_ms,
        )?;
        require_positive("runtime_limits_nofile", self.runtime_limits_nofile)
    }

    /// Returns the backend named by `platform`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] for an unknown name.
    pub fn platform_kind(&self) -> Result<PlatformKind, ConfigError> {
        PlatformKind::from_name(&self.platform)
            .ok_or_else(|| ConfigError::invalid("platform", "expected one of auto, linux, null"))
    }

    /// Converts the validated configuration into backend options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] when validation fails.
    pub fn platform_options(&self) -> Result<PlatformOptions, ConfigError> {
        self.validate()?;
        Ok(PlatformOptions {
            host_root: Utf8PathBuf::from(&self.host_root),
            dirs: DirProvider::new(&self.base_dir),
            accounts: AccountOptions {
                control_user: self.control_user.clone(),
                ephemeral_user_prefix: self.ephemeral_user_prefix.clone(),
                shell: self.user_shell.clone(),
            },
            disks: DiskOptions {
                ephemeral_fs_type: self.ephemeral_fs_type.clone(),
                persistent_fs_type: self.persistent_fs_type.clone(),
                swap_size_mib: self.swap_size_mib,
            },
            media_settings_file: self.media_settings_file.clone(),
            monit: MonitTiming {
                start_timeout: Duration::from_secs(self.monit_start_timeout_secs),
                poll_interval: Duration::from_millis(self.monit_poll_interval_ms),
            },
            device_path_timeout: Duration::from_secs(self.device_path_timeout_secs),
            device_path_poll_interval: Duration::from_millis(self.device_path_poll_interval_ms),
            runtime_limits_nofile: self.runtime_limits_nofile,
        })
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A field holds an unusable value.
    #[error(
        "invalid configuration field {field}: {message}; fix the HOSTKIT_* environment variable or {field} in hostkit.toml"
    )]
    InvalidField {
        /// TOML key of the field.
        field: String,
        /// What is wrong with the value.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl ConfigError {
    fn invalid(field: &str, message: &str) -> Self {
        Self::InvalidField {
            field: field.to_owned(),
            message: message.to_owned(),
        }
    }
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
