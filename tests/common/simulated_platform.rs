//! Linux platform wired onto a simulated host rooted in a temp directory.

use std::time::Duration;

use camino::Utf8PathBuf;
use hostkit::test_support::SimulatedHost;
use hostkit::{HostFileSystem, LinuxPlatform, MonitTiming, PlatformOptions, ShutdownSignal};
use tempfile::TempDir;

pub type SimulatedLinux = LinuxPlatform<SimulatedHost, HostFileSystem>;

pub struct SimulatedPlatform {
    pub host: SimulatedHost,
    pub platform: SimulatedLinux,
    _root: TempDir,
}

fn fast_options(root: Utf8PathBuf) -> PlatformOptions {
    PlatformOptions {
        host_root: root,
        monit: MonitTiming {
            start_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        },
        device_path_timeout: Duration::from_millis(60),
        device_path_poll_interval: Duration::from_millis(10),
        ..PlatformOptions::default()
    }
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::with_options(|_| {})
    }

    pub fn with_options(adjust: impl FnOnce(&mut PlatformOptions)) -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("create host root: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("host root is not UTF-8: {}", path.display()));
        let host = SimulatedHost::new(root.clone()).unwrap_or_else(|err| panic!("seed host: {err}"));
        let mut options = fast_options(root);
        adjust(&mut options);
        let platform = LinuxPlatform::new(host.clone(), HostFileSystem, options, ShutdownSignal::new());
        Self {
            host,
            platform,
            _root: tmp,
        }
    }

    pub fn disk(&self, device: &str) {
        self.host
            .add_disk(device)
            .unwrap_or_else(|err| panic!("attach {device}: {err}"));
    }

    pub fn write(&self, logical: &str, contents: &str) {
        self.host
            .write_file(logical, contents)
            .unwrap_or_else(|err| panic!("write {logical}: {err}"));
    }
}
