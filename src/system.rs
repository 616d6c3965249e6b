//! Host-level settings that do not belong to a single resource: hostname,
//! log rotation, clock sync, agent directories and runtime limits.

use camino::Utf8Path;
use tracing::{debug, info};

use crate::dirs::DirProvider;
use crate::error::{PlatformError, PlatformResult, fs_error, require_file_name, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};

/// Drop-in file raising per-process resource limits.
pub const LIMITS_FILE: &str = "/etc/security/limits.d/60-hostkit.conf";

/// Applies host-wide configuration.
#[derive(Clone, Debug)]
pub struct SystemConfigurator<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    dirs: DirProvider,
    control_user: String,
    nofile_limit: u64,
}

impl<R: CommandRunner, F: FileSystem> SystemConfigurator<R, F> {
    /// Creates a configurator.
    #[must_use]
    pub fn new(
        runner: R,
        fs: F,
        paths: HostPaths,
        dirs: DirProvider,
        control_user: impl Into<String>,
        nofile_limit: u64,
    ) -> Self {
        Self {
            runner,
            fs,
            paths,
            dirs,
            control_user: control_user.into(),
            nofile_limit,
        }
    }

    fn run_checked(&self, operation: &str, target: &str, program: &str, argv: &[&str]) -> PlatformResult<()> {
        let output = self
            .runner
            .run(program, &args(argv.iter().copied()))
            .map_err(runner_error(operation, target))?;
        if output.is_success() {
            Ok(())
        } else {
            Err(PlatformError::command_failed(operation, target, program, &output))
        }
    }

    fn write_if_changed(&self, logical: &str, contents: &str, operation: &str) -> PlatformResult<bool> {
        let path = self.paths.resolve(logical);
        match self.fs.read_to_string(&path) {
            Ok(current) if current == contents => return Ok(false),
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(fs_error(operation)(err)),
        }
        self.fs
            .write(&path, contents.as_bytes())
            .map_err(fs_error(operation))?;
        Ok(true)
    }

    fn ensure_dir(&self, logical: &Utf8Path, mode: &str) -> PlatformResult<()> {
        self.fs
            .create_dir_all(&self.paths.resolve(logical))
            .map_err(fs_error("create directory"))?;
        let owner = format!("root:{}", self.control_user);
        self.run_checked("own directory", logical.as_str(), "chown", &[owner.as_str(), logical.as_str()])?;
        self.run_checked("protect directory", logical.as_str(), "chmod", &[mode, logical.as_str()])
    }

    /// Raises resource limits for agent-managed processes.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when the limits file cannot
    /// be written.
    pub fn setup_runtime_configuration(&self) -> PlatformResult<()> {
        let limit = self.nofile_limit;
        let contents = format!("* soft nofile {limit}\n* hard nofile {limit}\n");
        if self.write_if_changed(LIMITS_FILE, &contents, "write resource limits")? {
            info!(nofile = limit, "resource limits updated");
        }
        Ok(())
    }

    /// Sets the hostname and keeps `/etc/hostname` and `/etc/hosts` in step.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] for an empty hostname.
    pub fn setup_hostname(&self, hostname: &str) -> PlatformResult<()> {
        if hostname.trim().is_empty() {
            return Err(PlatformError::InvalidInput {
                field: String::from("hostname"),
                message: String::from("must not be empty"),
            });
        }
        self.run_checked("set hostname", hostname, "hostname", &[hostname])?;
        self.write_if_changed("/etc/hostname", &format!("{hostname}\n"), "write hostname")?;
        let hosts = format!(
            "127.0.0.1 localhost {hostname}\n\
             ::1 localhost ip6-localhost ip6-loopback {hostname}\n"
        );
        self.write_if_changed("/etc/hosts", &hosts, "write hosts")?;
        Ok(())
    }

    /// Installs a logrotate policy for job logs under `base_path`.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] when `size` is empty or
    /// `group` is not a plain file name.
    pub fn setup_logrotate(&self, group: &str, base_path: &str, size: &str) -> PlatformResult<()> {
        require_file_name("logrotate group", group)?;
        if size.trim().is_empty() {
            return Err(PlatformError::InvalidInput {
                field: String::from("logrotate size"),
                message: String::from("must not be empty"),
            });
        }
        let log_root = Utf8Path::new(base_path).join("data").join("sys").join("log");
        let policy = format!(
            "{log_root}/*.log {log_root}/*/*.log {log_root}/*/*/*.log {{\n  \
             missingok\n  rotate 7\n  compress\n  delaycompress\n  copytruncate\n  \
             size={size}\n  su root {group}\n}}\n"
        );
        let path = format!("/etc/logrotate.d/{group}");
        if self.write_if_changed(&path, &policy, "write logrotate policy")? {
            info!(group, size, "logrotate policy installed");
        }
        Ok(())
    }

    /// Records NTP servers and performs a one-shot clock sync.
    ///
    /// An empty server list leaves the clock alone.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when the sync fails.
    pub fn set_time_with_ntp_servers(&self, servers: &[String]) -> PlatformResult<()> {
        if servers.is_empty() {
            debug!("no ntp servers supplied");
            return Ok(());
        }
        let record = self.dirs.etc_dir().join("ntpserver");
        self.write_if_changed(record.as_str(), &servers.join(" "), "record ntp servers")?;
        let mut argv = vec!["-b"];
        argv.extend(servers.iter().map(String::as_str));
        self.run_checked("sync clock", "ntpdate", "ntpdate", &argv)
    }

    /// Creates the agent's system directories under the data dir.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when a directory cannot be
    /// created or permissioned.
    pub fn setup_data_dir(&self) -> PlatformResult<()> {
        let sys = self.dirs.data_dir().join("sys");
        self.ensure_dir(&sys, "0750")?;
        self.ensure_dir(&self.dirs.log_dir(), "0750")?;
        self.ensure_dir(&sys.join("run"), "0750")
    }

    /// Creates the agent-private temporary directory.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when the directory cannot be
    /// created or permissioned.
    pub fn setup_tmp_dir(&self) -> PlatformResult<()> {
        self.ensure_dir(&self.dirs.tmp_dir(), "0770")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::HostFileSystem;
    use crate::test_support::ScriptedRunner;
    use camino::Utf8PathBuf;
    use rstest::rstest;
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        paths: HostPaths,
        runner: ScriptedRunner,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
            let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
                .unwrap_or_else(|path| panic!("non-utf8 tempdir {}", path.display()));
            Self {
                _tmp: tmp,
                paths: HostPaths::new(root),
                runner: ScriptedRunner::new(),
            }
        }

        fn configurator(&self) -> SystemConfigurator<ScriptedRunner, HostFileSystem> {
            SystemConfigurator::new(
                self.runner.clone(),
                HostFileSystem,
                self.paths.clone(),
                DirProvider::new("/var/vcap"),
                "vcap",
                4096,
            )
        }

        fn read(&self, logical: &str) -> String {
            HostFileSystem
                .read_to_string(&self.paths.resolve(logical))
                .unwrap_or_else(|err| panic!("read {logical}: {err}"))
        }
    }

    #[test]
    fn runtime_limits_are_written_once() {
        let harness = Harness::new();
        let configurator = harness.configurator();
        configurator
            .setup_runtime_configuration()
            .unwrap_or_else(|err| panic!("limits: {err}"));
        configurator
            .setup_runtime_configuration()
            .unwrap_or_else(|err| panic!("limits again: {err}"));
        assert_eq!(
            harness.read(LIMITS_FILE),
            "* soft nofile 4096\n* hard nofile 4096\n"
        );
        assert!(harness.runner.invocations().is_empty());
    }

    #[test]
    fn hostname_updates_host_files() {
        let harness = Harness::new();
        harness.runner.push_success();
        harness
            .configurator()
            .setup_hostname("web-0")
            .unwrap_or_else(|err| panic!("hostname: {err}"));
        assert_eq!(harness.read("/etc/hostname"), "web-0\n");
        assert!(harness.read("/etc/hosts").contains("127.0.0.1 localhost web-0"));
        assert_eq!(harness.runner.commands(), vec![String::from("hostname web-0")]);
    }

    #[rstest]
    #[case("", "1M", "logrotate group")]
    #[case("vcap", " ", "logrotate size")]
    #[case("../cron.d/evil", "1M", "logrotate group")]
    #[case("..", "1M", "logrotate group")]
    fn logrotate_rejects_unusable_inputs(#[case] group: &str, #[case] size: &str, #[case] field: &str) {
        let harness = Harness::new();
        let err = harness
            .configurator()
            .setup_logrotate(group, "/var/vcap", size)
            .expect_err("unusable input");
        assert!(
            matches!(&err, PlatformError::InvalidInput { field: actual, .. } if actual == field),
            "{err:?}"
        );
    }

    #[test]
    fn logrotate_policy_targets_job_logs() {
        let harness = Harness::new();
        harness
            .configurator()
            .setup_logrotate("vcap", "/var/vcap", "50M")
            .unwrap_or_else(|err| panic!("logrotate: {err}"));
        let policy = harness.read("/etc/logrotate.d/vcap");
        assert!(policy.starts_with("/var/vcap/data/sys/log/*.log"));
        assert!(policy.contains("size=50M"));
        assert!(policy.contains("su root vcap"));
    }

    #[test]
    fn empty_ntp_server_list_leaves_clock_alone() {
        let harness = Harness::new();
        harness
            .configurator()
            .set_time_with_ntp_servers(&[])
            .unwrap_or_else(|err| panic!("ntp: {err}"));
        assert!(harness.runner.invocations().is_empty());
    }

    #[test]
    fn ntp_sync_uses_every_server() {
        let harness = Harness::new();
        harness.runner.push_success();
        harness
            .configurator()
            .set_time_with_ntp_servers(&[String::from("0.pool"), String::from("1.pool")])
            .unwrap_or_else(|err| panic!("ntp: {err}"));
        assert_eq!(harness.runner.commands(), vec![String::from("ntpdate -b 0.pool 1.pool")]);
        assert_eq!(harness.read("/var/vcap/bosh/etc/ntpserver"), "0.pool 1.pool");
    }

    #[test]
    fn tmp_dir_is_owned_and_protected() {
        let harness = Harness::new();
        harness.runner.push_success();
        harness.runner.push_success();
        harness
            .configurator()
            .setup_tmp_dir()
            .unwrap_or_else(|err| panic!("tmp dir: {err}"));
        assert_eq!(
            harness.runner.commands(),
            vec![
                String::from("chown root:vcap /var/vcap/data/tmp"),
                String::from("chmod 0770 /var/vcap/data/tmp"),
            ]
        );
    }
}
