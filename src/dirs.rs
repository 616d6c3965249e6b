//! Well-known directories managed by the agent.

use camino::{Utf8Path, Utf8PathBuf};

/// Default base directory of the agent on a real host.
pub const DEFAULT_BASE_DIR: &str = "/var/vcap";

/// Resolves the agent's managed directories from a single base directory.
///
/// Paths are logical host paths; backends map them through
/// [`crate::HostPaths`] before touching the filesystem.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirProvider {
    base_dir: Utf8PathBuf,
}

impl DirProvider {
    /// Creates a provider rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Utf8Path {
        &self.base_dir
    }

    /// Directory holding agent state (`<base>/bosh`).
    #[must_use]
    pub fn bosh_dir(&self) -> Utf8PathBuf {
        self.base_dir.join("bosh")
    }

    /// Mount point of the ephemeral data disk (`<base>/data`).
    #[must_use]
    pub fn data_dir(&self) -> Utf8PathBuf {
        self.base_dir.join("data")
    }

    /// Mount point of the persistent disk (`<base>/store`).
    #[must_use]
    pub fn store_dir(&self) -> Utf8PathBuf {
        self.base_dir.join("store")
    }

    /// Agent configuration directory (`<base>/bosh/etc`).
    #[must_use]
    pub fn etc_dir(&self) -> Utf8PathBuf {
        self.bosh_dir().join("etc")
    }

    /// Supervision working directory (`<base>/monit`).
    #[must_use]
    pub fn monit_dir(&self) -> Utf8PathBuf {
        self.base_dir.join("monit")
    }

    /// File holding the persisted supervision credentials.
    #[must_use]
    pub fn monit_credentials_path(&self) -> Utf8PathBuf {
        self.bosh_dir().join("monit").join("monit.user")
    }

    /// Temporary mount point for removable media.
    #[must_use]
    pub fn media_mount_dir(&self) -> Utf8PathBuf {
        self.bosh_dir().join("settings-media")
    }

    /// File recording the last applied default network.
    #[must_use]
    pub fn default_network_path(&self) -> Utf8PathBuf {
        self.bosh_dir().join("default-network-settings.json")
    }

    /// Agent-private temporary directory (`<base>/data/tmp`).
    #[must_use]
    pub fn tmp_dir(&self) -> Utf8PathBuf {
        self.data_dir().join("tmp")
    }

    /// Directory for job logs (`<base>/data/sys/log`).
    #[must_use]
    pub fn log_dir(&self) -> Utf8PathBuf {
        self.data_dir().join("sys").join("log")
    }

    /// Private half of the host identity key.
    #[must_use]
    pub fn host_key_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(HOST_KEY_PATH)
    }
}

impl Default for DirProvider {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DIR)
    }
}

/// Private half of the host identity key; the public half adds `.pub`.
pub const HOST_KEY_PATH: &str = "/etc/ssh/ssh_host_rsa_key";
