//! Network interface configuration.
//!
//! Interfaces are located by explicit name or by MAC address under
//! `/sys/class/net`. Every change first checks the live state so applying
//! the same networks twice is a no-op.

use std::net::Ipv4Addr;

use camino::Utf8Path;
use tracing::{debug, info};

use crate::dirs::DirProvider;
use crate::error::{PlatformError, PlatformResult, fs_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};
use crate::settings::{Network, NetworkType, Networks, default_gateway_network};

/// Sysfs directory listing network interfaces.
pub const SYS_CLASS_NET: &str = "/sys/class/net";
/// Resolver configuration written from the default DNS network.
pub const RESOLV_CONF: &str = "/etc/resolv.conf";
/// Udev rules pinning interface names, removed before reconfiguration.
pub const PERSISTENT_NET_RULES: &str = "/etc/udev/rules.d/70-persistent-net.rules";

/// Applies network settings and reports interface state.
#[derive(Clone, Debug)]
pub struct NetworkConfigurator<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    dirs: DirProvider,
}

impl<R: CommandRunner, F: FileSystem> NetworkConfigurator<R, F> {
    /// Creates a configurator.
    #[must_use]
    pub const fn new(runner: R, fs: F, paths: HostPaths, dirs: DirProvider) -> Self {
        Self {
            runner,
            fs,
            paths,
            dirs,
        }
    }

    /// Applies `networks` to the host.
    ///
    /// VIP networks and preconfigured interfaces are left alone. The
    /// default-gateway network installs the default route and is recorded
    /// for [`Self::default_network`].
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::NetworkApply`] naming the interface that
    /// failed.
    pub fn setup_networking(&self, networks: &Networks) -> PlatformResult<()> {
        for (name, network) in networks {
            if network.network_type == NetworkType::Vip || network.preconfigured {
                debug!(network = %name, "network not configured locally");
                continue;
            }
            let interface = self.resolve_interface(name, network)?;
            match network.network_type {
                NetworkType::Manual => self.apply_static(&interface, network)?,
                NetworkType::Dynamic => self.apply_dynamic(&interface)?,
                NetworkType::Vip => {}
            }
            self.ip(&interface, &["link", "set", "dev", interface.as_str(), "up"])?;
            if network.is_default_gateway() && !network.gateway.is_empty() {
                self.ip(
                    &interface,
                    &[
                        "route",
                        "replace",
                        "default",
                        "via",
                        network.gateway.as_str(),
                        "dev",
                        interface.as_str(),
                    ],
                )?;
            }
        }

        if let Some((name, network)) = default_gateway_network(networks) {
            self.record_default_network(name, network)?;
        }
        self.write_resolv_conf(networks)
    }

    fn resolve_interface(&self, name: &str, network: &Network) -> PlatformResult<String> {
        let sys = self.paths.resolve(SYS_CLASS_NET);
        if let Some(interface) = network.interface.as_deref().filter(|value| !value.is_empty()) {
            let present = self
                .fs
                .exists(&sys.join(interface))
                .map_err(fs_error("inspect interface"))?;
            if present {
                return Ok(interface.to_owned());
            }
            return Err(apply_error(interface, "interface does not exist"));
        }
        if network.mac.is_empty() {
            return Err(apply_error(name, "network names neither an interface nor a MAC address"));
        }
        let wanted = network.mac.to_ascii_lowercase();
        let names = self
            .fs
            .list_dir(&sys)
            .map_err(|err| apply_error(&network.mac, &err.to_string()))?;
        for candidate in names {
            let address = self.fs.read_to_string(&sys.join(&candidate).join("address"));
            if address.is_ok_and(|mac| mac.trim().eq_ignore_ascii_case(&wanted)) {
                return Ok(candidate);
            }
        }
        Err(apply_error(&network.mac, "no interface carries this MAC address"))
    }

    fn ip(&self, interface: &str, argv: &[&str]) -> PlatformResult<String> {
        let output = self
            .runner
            .run("ip", &args(argv.iter().copied()))
            .map_err(|err| apply_error(interface, &err.to_string()))?;
        if output.is_success() {
            Ok(output.stdout)
        } else {
            Err(apply_error(interface, &output.failure_message("ip")))
        }
    }

    fn ipv4_addresses(&self, interface: &str) -> PlatformResult<Vec<String>> {
        let stdout = self.ip(interface, &["-o", "-4", "addr", "show", "dev", interface])?;
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace().skip_while(|field| *field != "inet");
                fields.nth(1).map(str::to_owned)
            })
            .collect())
    }

    fn apply_static(&self, interface: &str, network: &Network) -> PlatformResult<()> {
        let ip: Ipv4Addr = network
            .ip
            .parse()
            .map_err(|_| apply_error(interface, &format!("invalid address {:?}", network.ip)))?;
        let prefix = netmask_prefix(&network.netmask)
            .ok_or_else(|| apply_error(interface, &format!("invalid netmask {:?}", network.netmask)))?;
        let cidr = format!("{ip}/{prefix}");
        if self.ipv4_addresses(interface)?.contains(&cidr) {
            debug!(interface, address = %cidr, "address already configured");
            return Ok(());
        }
        info!(interface, address = %cidr, "configuring static address");
        self.ip(interface, &["addr", "replace", cidr.as_str(), "dev", interface])?;
        Ok(())
    }

    fn apply_dynamic(&self, interface: &str) -> PlatformResult<()> {
        if !self.ipv4_addresses(interface)?.is_empty() {
            debug!(interface, "dhcp lease already present");
            return Ok(());
        }
        info!(interface, "requesting dhcp lease");
        let output = self
            .runner
            .run("dhclient", &args(["-1", interface]))
            .map_err(|err| apply_error(interface, &err.to_string()))?;
        if output.is_success() {
            Ok(())
        } else {
            Err(apply_error(interface, &output.failure_message("dhclient")))
        }
    }

    fn record_default_network(&self, name: &str, network: &Network) -> PlatformResult<()> {
        let path = self.paths.resolve(self.dirs.default_network_path());
        let encoded = serde_json::to_vec(network)
            .map_err(|err| PlatformError::collaborator("record default network", name, &err))?;
        self.write_if_changed(&path, &encoded, "record default network")
    }

    fn write_resolv_conf(&self, networks: &Networks) -> PlatformResult<()> {
        let dns_network = networks
            .values()
            .find(|network| network.is_default_dns())
            .or_else(|| default_gateway_network(networks).map(|(_, network)| network));
        let Some(servers) = dns_network.map(|network| &network.dns).filter(|dns| !dns.is_empty())
        else {
            return Ok(());
        };
        let mut contents = String::from("# Generated by hostkit\n");
        for server in servers {
            contents.push_str("nameserver ");
            contents.push_str(server);
            contents.push('\n');
        }
        let path = self.paths.resolve(RESOLV_CONF);
        self.write_if_changed(&path, contents.as_bytes(), "write resolv.conf")
    }

    fn write_if_changed(&self, path: &Utf8Path, contents: &[u8], operation: &str) -> PlatformResult<()> {
        match self.fs.read(path) {
            Ok(current) if current == contents => return Ok(()),
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(fs_error(operation)(err)),
        }
        self.fs.write(path, contents).map_err(fs_error(operation))
    }

    /// Lists interfaces bearing a non-loopback address, in `ip` order.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when `ip` fails.
    pub fn configured_interfaces(&self) -> PlatformResult<Vec<String>> {
        let output = self
            .runner
            .run("ip", &args(["-o", "addr", "show"]))
            .map_err(|err| PlatformError::collaborator("list interfaces", "ip", &err))?;
        if !output.is_success() {
            return Err(PlatformError::command_failed("list interfaces", "ip", "ip", &output));
        }
        let mut interfaces: Vec<String> = Vec::new();
        for line in output.stdout.lines() {
            let Some(raw) = line.split_whitespace().nth(1) else {
                continue;
            };
            let label = raw.trim_end_matches(':');
            let name = label.split('@').next().unwrap_or(label);
            if name != "lo" && !interfaces.iter().any(|known| known == name) {
                interfaces.push(name.to_owned());
            }
        }
        Ok(interfaces)
    }

    /// Returns the recorded default network, or the zero value when none
    /// was recorded.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Read`] when the record exists but cannot be
    /// read or parsed.
    pub fn default_network(&self) -> PlatformResult<Network> {
        read_network_record(&self.fs, &self.paths.resolve(self.dirs.default_network_path()))
    }

    /// Quiesces state that would go stale across an interface change.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when a step fails; callers
    /// must not proceed with reconfiguration.
    pub fn prepare_for_networking_change(&self) -> PlatformResult<()> {
        self.fs
            .remove_file(&self.paths.resolve(PERSISTENT_NET_RULES))
            .map_err(fs_error("remove persistent net rules"))?;
        let output = self
            .runner
            .run("ip", &args(["neigh", "flush", "all"]))
            .map_err(|err| PlatformError::collaborator("flush neighbour cache", "ip", &err))?;
        if output.is_success() {
            Ok(())
        } else {
            Err(PlatformError::command_failed(
                "flush neighbour cache",
                "ip",
                "ip",
                &output,
            ))
        }
    }
}

/// Reads a network record written as JSON; a missing file yields the zero
/// value.
pub(crate) fn read_network_record<F: FileSystem>(fs: &F, path: &Utf8Path) -> PlatformResult<Network> {
    let contents = match fs.read(path) {
        Ok(contents) => contents,
        Err(err) if err.is_not_found() => return Ok(Network::default()),
        Err(err) => {
            return Err(PlatformError::Read {
                path: path.to_string(),
                message: err.to_string(),
            });
        }
    };
    serde_json::from_slice(&contents).map_err(|err| PlatformError::Read {
        path: path.to_string(),
        message: err.to_string(),
    })
}

fn apply_error(interface: &str, message: &str) -> PlatformError {
    PlatformError::NetworkApply {
        interface: interface.to_owned(),
        message: message.to_owned(),
    }
}

/// Converts a dotted-quad netmask into a prefix length, rejecting
/// non-contiguous masks.
#[must_use]
pub fn netmask_prefix(netmask: &str) -> Option<u32> {
    let mask = u32::from(netmask.parse::<Ipv4Addr>().ok()?);
    let prefix = mask.leading_ones();
    (mask.count_ones() == prefix).then_some(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("255.255.255.0", Some(24))]
    #[case("255.255.0.0", Some(16))]
    #[case("0.0.0.0", Some(0))]
    #[case("255.0.255.0", None)]
    #[case("garbage", None)]
    fn netmask_prefixes(#[case] netmask: &str, #[case] expected: Option<u32>) {
        assert_eq!(netmask_prefix(netmask), expected);
    }
}
