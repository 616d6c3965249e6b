//! Device-path resolution for attached disks.
//!
//! A resolver turns [`DiskSettings`] into the block device path the kernel
//! exposes. Waiting for a disk to appear is bounded; running out of time is
//! reported through [`ResolvedDevicePath::timed_out`] rather than as an
//! error so callers can retry.

use std::time::{Duration, Instant};

use camino::Utf8Path;
use tracing::{debug, warn};

use crate::error::{PlatformError, PlatformResult, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};
use crate::settings::DiskSettings;
use crate::signal::ShutdownSignal;

/// Directory holding stable per-device symlinks.
pub const DISK_BY_ID_DIR: &str = "/dev/disk/by-id";

/// Outcome of a resolution attempt.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResolvedDevicePath {
    /// Resolved device path; empty when `timed_out` is set.
    pub path: String,
    /// `true` when the device did not appear before the deadline.
    pub timed_out: bool,
}

impl ResolvedDevicePath {
    /// Builds a successful resolution.
    #[must_use]
    pub fn found(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            timed_out: false,
        }
    }

    /// Builds a timed-out resolution.
    #[must_use]
    pub fn timed_out() -> Self {
        Self {
            path: String::new(),
            timed_out: true,
        }
    }
}

/// Maps disk settings to a device path.
pub trait DevicePathResolver {
    /// Resolves `disk` to a device path.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] when the settings carry
    /// nothing to resolve, or [`PlatformError::Cancelled`] when the shutdown
    /// signal fires while waiting.
    fn resolve(&self, disk: &DiskSettings) -> PlatformResult<ResolvedDevicePath>;
}

/// Resolver that trusts the path carried by the settings.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityDevicePathResolver;

impl DevicePathResolver for IdentityDevicePathResolver {
    fn resolve(&self, disk: &DiskSettings) -> PlatformResult<ResolvedDevicePath> {
        if disk.path.is_empty() {
            return Err(PlatformError::InvalidInput {
                field: String::from("disk path"),
                message: format!("disk {} carries no device path", disk.label()),
            });
        }
        Ok(ResolvedDevicePath::found(disk.path.clone()))
    }
}

/// Resolver that waits for the disk's id to appear under
/// [`DISK_BY_ID_DIR`] and follows the link to the kernel device.
///
/// Settings without a device id fall back to their explicit path.
#[derive(Clone, Debug)]
pub struct IdDevicePathResolver<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    timeout: Duration,
    poll_interval: Duration,
    shutdown: ShutdownSignal,
}

impl<R, F> IdDevicePathResolver<R, F> {
    /// Creates a resolver waiting up to `timeout` for a device to appear.
    #[must_use]
    pub const fn new(
        runner: R,
        fs: F,
        paths: HostPaths,
        timeout: Duration,
        poll_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            runner,
            fs,
            paths,
            timeout,
            poll_interval,
            shutdown,
        }
    }
}

impl<R: CommandRunner, F: FileSystem> IdDevicePathResolver<R, F> {
    fn find_link(&self, device_id: &str) -> Option<String> {
        let dir = self.paths.resolve(DISK_BY_ID_DIR);
        let names = self.fs.list_dir(&dir).ok()?;
        names
            .into_iter()
            .find(|name| name.ends_with(device_id) && !name.contains("-part"))
            .map(|name| Utf8Path::new(DISK_BY_ID_DIR).join(name).into_string())
    }

    fn canonicalise(&self, link: &str) -> PlatformResult<String> {
        let output = self
            .runner
            .run("readlink", &args(["-f", link]))
            .map_err(runner_error("resolve device link", link))?;
        if !output.is_success() {
            return Err(PlatformError::command_failed(
                "resolve device link",
                link,
                "readlink",
                &output,
            ));
        }
        let target = output.stdout.trim();
        if target.is_empty() {
            return Ok(link.to_owned());
        }
        Ok(target.to_owned())
    }
}

impl<R: CommandRunner, F: FileSystem> DevicePathResolver for IdDevicePathResolver<R, F> {
    fn resolve(&self, disk: &DiskSettings) -> PlatformResult<ResolvedDevicePath> {
        if disk.device_id.is_empty() {
            return IdentityDevicePathResolver.resolve(disk);
        }

        let started = Instant::now();
        loop {
            if let Some(link) = self.find_link(&disk.device_id) {
                let path = self.canonicalise(&link)?;
                debug!(disk = %disk.label(), device = %path, "resolved device path");
                return Ok(ResolvedDevicePath::found(path));
            }
            if started.elapsed() >= self.timeout {
                warn!(
                    disk = %disk.label(),
                    device_id = %disk.device_id,
                    "timed out waiting for device"
                );
                return Ok(ResolvedDevicePath::timed_out());
            }
            self.shutdown.sleep(self.poll_interval, "resolve device path")?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::HostFileSystem;
    use crate::test_support::ScriptedRunner;
    use camino::Utf8PathBuf;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Host {
        _tmp: TempDir,
        root: Utf8PathBuf,
    }

    #[fixture]
    fn host() -> Host {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
        Host { _tmp: tmp, root }
    }

    fn resolver(host: &Host, runner: ScriptedRunner) -> IdDevicePathResolver<ScriptedRunner, HostFileSystem> {
        IdDevicePathResolver::new(
            runner,
            HostFileSystem,
            HostPaths::new(host.root.clone()),
            Duration::from_millis(120),
            Duration::from_millis(20),
            ShutdownSignal::new(),
        )
    }

    #[rstest]
    fn identity_rejects_settings_without_path() {
        let err = IdentityDevicePathResolver
            .resolve(&DiskSettings::default())
            .expect_err("empty path should fail");
        assert!(matches!(err, PlatformError::InvalidInput { .. }));
    }

    #[rstest]
    fn id_resolver_follows_by_id_link(host: Host) {
        HostFileSystem
            .write(&host.root.join("dev/disk/by-id/virtio-vol-123"), b"")
            .unwrap_or_else(|err| panic!("seed: {err}"));
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), "/dev/vdc\n", "");
        let disk = DiskSettings {
            device_id: String::from("vol-123"),
            ..DiskSettings::default()
        };

        let resolved = resolver(&host, runner.clone())
            .resolve(&disk)
            .unwrap_or_else(|err| panic!("resolve: {err}"));

        assert_eq!(resolved, ResolvedDevicePath::found("/dev/vdc"));
        let command = runner
            .invocations()
            .first()
            .map(crate::test_support::CommandInvocation::command_string)
            .unwrap_or_default();
        assert_eq!(command, "readlink -f /dev/disk/by-id/virtio-vol-123");
    }

    #[rstest]
    fn id_resolver_reports_timeout_without_error(host: Host) {
        let disk = DiskSettings {
            device_id: String::from("missing"),
            ..DiskSettings::default()
        };
        let resolved = resolver(&host, ScriptedRunner::new())
            .resolve(&disk)
            .unwrap_or_else(|err| panic!("resolve: {err}"));
        assert!(resolved.timed_out);
        assert!(resolved.path.is_empty());
    }
}
