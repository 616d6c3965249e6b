//! Settings delivered by the external settings source.
//!
//! Values here are plain data: they are passed into platform operations per
//! call and never retained by a backend beyond that call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifies a disk and carries its partitioning hints.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DiskSettings {
    /// Stable identifier assigned by the orchestrator.
    #[serde(default)]
    pub id: String,
    /// Device identifier used for `/dev/disk/by-id` lookups.
    #[serde(default)]
    pub device_id: String,
    /// Device path (for example `/dev/sdc`) when known up front.
    #[serde(default)]
    pub path: String,
    /// Filesystem type to create when the disk is unformatted.
    #[serde(default)]
    pub file_system_type: Option<String>,
    /// Extra mount options passed to `mount -o`.
    #[serde(default)]
    pub mount_options: Vec<String>,
    /// Whether the disk carries a partition table. Defaults to `true`.
    #[serde(default = "default_partitioned")]
    pub partitioned: bool,
}

const fn default_partitioned() -> bool {
    true
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            device_id: String::new(),
            path: String::new(),
            file_system_type: None,
            mount_options: Vec::new(),
            partitioned: default_partitioned(),
        }
    }
}

impl DiskSettings {
    /// Builds settings for a disk known by its device path.
    #[must_use]
    pub fn with_path(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Returns a human-readable identifier for logs and errors.
    #[must_use]
    pub fn label(&self) -> &str {
        if !self.id.is_empty() {
            return &self.id;
        }
        if !self.device_id.is_empty() {
            return &self.device_id;
        }
        &self.path
    }
}

/// How a network obtains its address.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Statically addressed network.
    #[default]
    Manual,
    /// Address obtained over DHCP.
    Dynamic,
    /// Virtual IP managed outside the host; never configured locally.
    Vip,
}

/// A named network definition.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Network {
    /// Addressing mode.
    #[serde(default, rename = "type")]
    pub network_type: NetworkType,
    /// IPv4 address for manual networks.
    #[serde(default)]
    pub ip: String,
    /// Dotted-quad netmask for manual networks.
    #[serde(default)]
    pub netmask: String,
    /// Gateway address.
    #[serde(default)]
    pub gateway: String,
    /// Properties this network provides by default (`dns`, `gateway`).
    #[serde(default)]
    pub default: Vec<String>,
    /// DNS servers.
    #[serde(default)]
    pub dns: Vec<String>,
    /// MAC address used to locate the interface.
    #[serde(default)]
    pub mac: String,
    /// Explicit interface name, overriding MAC lookup.
    #[serde(default)]
    pub interface: Option<String>,
    /// Whether the interface was configured before the agent started.
    #[serde(default)]
    pub preconfigured: bool,
}

impl Network {
    /// Returns `true` when this network supplies the default gateway.
    #[must_use]
    pub fn is_default_gateway(&self) -> bool {
        self.default.iter().any(|prop| prop == "gateway")
    }

    /// Returns `true` when this network supplies default DNS servers.
    #[must_use]
    pub fn is_default_dns(&self) -> bool {
        self.default.iter().any(|prop| prop == "dns")
    }

    /// Returns `true` for the zero value returned when no default exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Networks keyed by name. Ordered so reconfiguration is deterministic.
pub type Networks = BTreeMap<String, Network>;

/// Returns the unique default-gateway network, if any.
///
/// When several networks claim the gateway, the first by name wins so at
/// most one network is ever reported.
#[must_use]
pub fn default_gateway_network(networks: &Networks) -> Option<(&str, &Network)> {
    networks
        .iter()
        .find(|(_, network)| network.is_default_gateway())
        .map(|(name, network)| (name.as_str(), network))
}

/// Disk layout section of the agent settings.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Disks {
    /// Root disk device path.
    #[serde(default)]
    pub system: String,
    /// Ephemeral disk, when one is attached.
    #[serde(default)]
    pub ephemeral: Option<DiskSettings>,
    /// Raw ephemeral disks handed to workloads unformatted.
    #[serde(default)]
    pub raw_ephemeral: Vec<DiskSettings>,
    /// Persistent disks keyed by disk id.
    #[serde(default)]
    pub persistent: BTreeMap<String, DiskSettings>,
}

/// Environment section of the agent settings.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Env {
    /// Pre-encrypted password for the control user.
    #[serde(default)]
    pub password: Option<String>,
    /// Public key installed for the control user.
    #[serde(default)]
    pub authorized_key: Option<String>,
}

/// Full settings payload consumed by the bootstrap workflow.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct AgentSettings {
    /// Identifier of this agent; the control subject is `agent.<id>`.
    pub agent_id: String,
    /// Networks to configure.
    #[serde(default)]
    pub networks: Networks,
    /// Disks to prepare.
    #[serde(default)]
    pub disks: Disks,
    /// Account material.
    #[serde(default)]
    pub env: Env,
    /// Control-channel address.
    #[serde(default)]
    pub mbus: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(default: &[&str]) -> Network {
        Network {
            ip: String::from("10.0.0.5"),
            default: default.iter().map(|prop| (*prop).to_owned()).collect(),
            ..Network::default()
        }
    }

    #[test]
    fn default_gateway_network_picks_single_match() {
        let mut networks = Networks::new();
        networks.insert(String::from("private"), network(&["dns"]));
        networks.insert(String::from("public"), network(&["dns", "gateway"]));

        let (name, _) = default_gateway_network(&networks)
            .unwrap_or_else(|| panic!("expected a default network"));
        assert_eq!(name, "public");
    }

    #[test]
    fn default_gateway_network_is_none_without_gateway() {
        let mut networks = Networks::new();
        networks.insert(String::from("private"), network(&["dns"]));
        assert!(default_gateway_network(&networks).is_none());
    }

    #[test]
    fn code_and_wire_defaults_agree_on_partitioning() {
        let parsed: DiskSettings = serde_json::from_str(r#"{"device_id": "vol-7"}"#)
            .unwrap_or_else(|err| panic!("parse disk: {err}"));
        let built = DiskSettings {
            device_id: String::from("vol-7"),
            ..DiskSettings::default()
        };
        assert!(built.partitioned);
        assert_eq!(parsed, built);
    }

    #[test]
    fn agent_settings_parse_with_defaults() {
        let settings: AgentSettings = serde_json::from_str(
            r#"{
                "agent_id": "agent-1",
                "networks": {"default": {"type": "dynamic", "default": ["gateway"]}},
                "disks": {"persistent": {"disk-1": {"path": "/dev/sdc"}}}
            }"#,
        )
        .unwrap_or_else(|err| panic!("parse settings: {err}"));

        assert_eq!(settings.agent_id, "agent-1");
        let disk = settings
            .disks
            .persistent
            .get("disk-1")
            .unwrap_or_else(|| panic!("missing disk"));
        assert!(disk.partitioned);
        assert_eq!(
            settings.networks.get("default").map(|net| net.network_type),
            Some(NetworkType::Dynamic)
        );
    }
}
