//! Bootstrap workflow driven through the [`Platform`] contract.
//!
//! Steps run in a fixed order. Runtime configuration is best effort; the
//! first failure of any later step aborts the run.

use std::fmt;

use thiserror::Error;
use tracing::{info, warn};

use crate::disk::RawEphemeralDisk;
use crate::error::PlatformError;
use crate::platform::Platform;
use crate::settings::AgentSettings;

/// Phase of the bootstrap sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootstrapStep {
    /// Locating and parsing agent settings.
    Settings,
    /// Network preparation and configuration.
    Networking,
    /// Account purge and control-user provisioning.
    Accounts,
    /// Root, ephemeral, raw ephemeral and persistent disks.
    Disks,
    /// Supervision credentials and start-up.
    Supervision,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Settings => "settings",
            Self::Networking => "networking",
            Self::Accounts => "accounts",
            Self::Disks => "disks",
            Self::Supervision => "supervision",
        };
        f.write_str(name)
    }
}

/// A required bootstrap step failed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("bootstrap step {step} failed: {source}")]
pub struct BootstrapError {
    /// Step that failed.
    pub step: BootstrapStep,
    /// Underlying platform error.
    #[source]
    pub source: PlatformError,
}

fn at(step: BootstrapStep) -> impl FnOnce(PlatformError) -> BootstrapError {
    move |source| BootstrapError { step, source }
}

/// Outcome of a completed bootstrap.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BootstrapReport {
    /// Runtime configuration failure, logged and tolerated.
    pub runtime_configuration_error: Option<PlatformError>,
    /// Ephemeral accounts purged.
    pub purged_accounts: usize,
    /// Raw ephemeral disks prepared, in settings order.
    pub raw_ephemeral: Vec<RawEphemeralDisk>,
    /// Persistent disk mounted at the store directory, if any.
    pub persistent_disk: Option<String>,
}

/// Locates the settings payload.
#[derive(Debug)]
pub struct SettingsSource;

impl SettingsSource {
    /// Prefers settings delivered over the network and otherwise parses the
    /// payload on `media_device`.
    ///
    /// # Errors
    ///
    /// Returns a [`BootstrapStep::Settings`] error when the media cannot be
    /// read or does not hold valid settings JSON.
    pub fn load(
        platform: &dyn Platform,
        network_settings: Option<AgentSettings>,
        media_device: &str,
    ) -> Result<AgentSettings, BootstrapError> {
        if let Some(settings) = network_settings {
            return Ok(settings);
        }
        let payload = platform
            .file_contents_from_cdrom(media_device)
            .map_err(at(BootstrapStep::Settings))?;
        serde_json::from_slice(&payload).map_err(|err| BootstrapError {
            step: BootstrapStep::Settings,
            source: PlatformError::Read {
                path: media_device.to_owned(),
                message: err.to_string(),
            },
        })
    }
}

/// Runs the bootstrap sequence against a platform backend.
pub struct Bootstrapper<'a> {
    platform: &'a dyn Platform,
    control_user: String,
    control_groups: Vec<String>,
}

impl fmt::Debug for Bootstrapper<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("control_user", &self.control_user)
            .field("control_groups", &self.control_groups)
            .finish_non_exhaustive()
    }
}

impl<'a> Bootstrapper<'a> {
    /// Creates a bootstrapper provisioning `control_user`.
    #[must_use]
    pub fn new(platform: &'a dyn Platform, control_user: impl Into<String>) -> Self {
        Self {
            platform,
            control_user: control_user.into(),
            control_groups: Vec::new(),
        }
    }

    /// Adds supplementary groups for the control user.
    #[must_use]
    pub fn with_control_groups(mut self, groups: Vec<String>) -> Self {
        self.control_groups = groups;
        self
    }

    /// Executes every step in order.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] for the first failing required step.
    pub fn run(&self, settings: &AgentSettings) -> Result<BootstrapReport, BootstrapError> {
        let mut report = BootstrapReport::default();

        if let Err(err) = self.platform.setup_runtime_configuration() {
            warn!(error = %err, "runtime configuration failed; continuing");
            report.runtime_configuration_error = Some(err);
        }

        self.networking(settings).map_err(at(BootstrapStep::Networking))?;
        report.purged_accounts = self.accounts(settings).map_err(at(BootstrapStep::Accounts))?;
        self.disks(settings, &mut report)
            .map_err(at(BootstrapStep::Disks))?;
        self.supervision().map_err(at(BootstrapStep::Supervision))?;

        info!(agent_id = %settings.agent_id, "bootstrap complete");
        Ok(report)
    }

    fn networking(&self, settings: &AgentSettings) -> Result<(), PlatformError> {
        self.platform.prepare_for_networking_change()?;
        self.platform.setup_networking(&settings.networks)
    }

    fn accounts(&self, settings: &AgentSettings) -> Result<usize, PlatformError> {
        let purged = self.platform.delete_ephemeral_users_matching("*")?;
        let password = settings.env.password.as_deref().unwrap_or_default();
        self.platform.create_user(&self.control_user, password, "")?;
        if !self.control_groups.is_empty() {
            self.platform
                .add_user_to_groups(&self.control_user, &self.control_groups)?;
        }
        if let Some(hash) = settings.env.password.as_deref() {
            self.platform.set_user_password(&self.control_user, hash)?;
        }
        if let Some(key) = settings.env.authorized_key.as_deref() {
            self.platform.setup_ssh(key, &self.control_user)?;
        }
        Ok(purged)
    }

    fn disks(&self, settings: &AgentSettings, report: &mut BootstrapReport) -> Result<(), PlatformError> {
        let ephemeral_path = settings
            .disks
            .ephemeral
            .as_ref()
            .map(|disk| self.platform.ephemeral_disk_path(disk))
            .unwrap_or_default();
        self.platform.setup_root_disk(&ephemeral_path)?;
        self.platform.setup_ephemeral_disk_with_path(&ephemeral_path)?;
        self.platform.setup_data_dir()?;
        self.platform.setup_tmp_dir()?;
        report.raw_ephemeral = self
            .platform
            .setup_raw_ephemeral_disks(&settings.disks.raw_ephemeral)?;

        if let Some((id, disk)) = settings.disks.persistent.iter().next() {
            let store = self.platform.dir_provider().store_dir();
            self.platform.mount_persistent_disk(disk, store.as_str())?;
            report.persistent_disk = Some(id.clone());
        }
        Ok(())
    }

    fn supervision(&self) -> Result<(), PlatformError> {
        self.platform.setup_monit_user()?;
        self.platform.start_monit()
    }
}
