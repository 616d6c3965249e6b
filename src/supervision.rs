//! Supervision (monit) bootstrap.

use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PlatformError, PlatformResult, fs_error, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};
use crate::signal::ShutdownSignal;

/// Username/password pair for the supervision control endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SupervisionCredentials {
    /// Control endpoint username.
    pub username: String,
    /// Control endpoint password.
    pub password: String,
}

/// How long [`MonitBootstrapper::start_monit`] waits, and how often it
/// probes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MonitTiming {
    /// Upper bound on the wait for a responsive endpoint.
    pub start_timeout: Duration,
    /// Delay between probes.
    pub poll_interval: Duration,
}

impl Default for MonitTiming {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Provisions supervision credentials and starts the supervisor.
#[derive(Clone, Debug)]
pub struct MonitBootstrapper<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    credentials_path: Utf8PathBuf,
    username: String,
    timing: MonitTiming,
    shutdown: ShutdownSignal,
}

impl<R: CommandRunner, F: FileSystem> MonitBootstrapper<R, F> {
    /// Creates a bootstrapper persisting credentials at `credentials_path`.
    #[must_use]
    pub fn new(
        runner: R,
        fs: F,
        paths: HostPaths,
        credentials_path: impl Into<Utf8PathBuf>,
        username: impl Into<String>,
        timing: MonitTiming,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            runner,
            fs,
            paths,
            credentials_path: credentials_path.into(),
            username: username.into(),
            timing,
            shutdown,
        }
    }

    fn read_credentials(&self) -> PlatformResult<Option<SupervisionCredentials>> {
        let path = self.paths.resolve(&self.credentials_path);
        let contents = match self.fs.read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(fs_error("read supervision credentials")(err)),
        };
        let (username, password) = contents
            .trim()
            .split_once(':')
            .ok_or_else(|| PlatformError::Read {
                path: self.credentials_path.to_string(),
                message: String::from("expected user:password"),
            })?;
        Ok(Some(SupervisionCredentials {
            username: username.to_owned(),
            password: password.to_owned(),
        }))
    }

    /// Generates and persists credentials unless they already exist. The
    /// file is left readable by its owner only.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when the file cannot be
    /// written or its mode restricted, or [`PlatformError::Read`] when an
    /// existing file is corrupt.
    pub fn setup_monit_user(&self) -> PlatformResult<()> {
        if self.read_credentials()?.is_some() {
            debug!(path = %self.credentials_path, "supervision credentials already present");
            return Ok(());
        }
        let password = Uuid::new_v4().simple().to_string();
        let contents = format!("{}:{password}", self.username);
        self.fs
            .write(&self.paths.resolve(&self.credentials_path), contents.as_bytes())
            .map_err(fs_error("write supervision credentials"))?;
        self.restrict_credentials()?;
        info!(path = %self.credentials_path, user = %self.username, "supervision credentials created");
        Ok(())
    }

    fn restrict_credentials(&self) -> PlatformResult<()> {
        let target = self.credentials_path.as_str();
        let output = self
            .runner
            .run("chmod", &args(["0600", target]))
            .map_err(runner_error("protect supervision credentials", target))?;
        if output.is_success() {
            return Ok(());
        }
        Err(PlatformError::command_failed(
            "protect supervision credentials",
            target,
            "chmod",
            &output,
        ))
    }

    /// Returns the persisted credentials.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::CredentialsNotInitialized`] when
    /// [`Self::setup_monit_user`] has never run.
    pub fn monit_credentials(&self) -> PlatformResult<SupervisionCredentials> {
        self.read_credentials()?
            .ok_or_else(|| PlatformError::CredentialsNotInitialized {
                path: self.credentials_path.to_string(),
            })
    }

    fn is_responsive(&self) -> PlatformResult<bool> {
        let output = self
            .runner
            .run("monit", &args(["summary"]))
            .map_err(runner_error("probe supervision", "monit"))?;
        Ok(output.is_success())
    }

    /// Starts the supervisor and blocks until it answers.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::SupervisionStartTimeout`] when the endpoint
    /// stays unresponsive past the configured timeout, or
    /// [`PlatformError::Cancelled`] when the shutdown signal fires.
    pub fn start_monit(&self) -> PlatformResult<()> {
        if self.is_responsive()? {
            debug!("supervision already running");
            return Ok(());
        }
        info!("starting supervision");
        let output = self
            .runner
            .run("sv", &args(["start", "monit"]))
            .map_err(runner_error("start supervision", "monit"))?;
        if !output.is_success() {
            return Err(PlatformError::command_failed(
                "start supervision",
                "monit",
                "sv",
                &output,
            ));
        }

        let started = Instant::now();
        loop {
            self.shutdown.check("start supervision")?;
            if self.is_responsive()? {
                info!(waited_ms = started.elapsed().as_millis(), "supervision responsive");
                return Ok(());
            }
            if started.elapsed() >= self.timing.start_timeout {
                return Err(PlatformError::SupervisionStartTimeout {
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            self.shutdown
                .sleep(self.timing.poll_interval, "start supervision")?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::HostFileSystem;
    use crate::test_support::ScriptedRunner;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        root: Utf8PathBuf,
        runner: ScriptedRunner,
        shutdown: ShutdownSignal,
    }

    impl Harness {
        fn bootstrapper(&self) -> MonitBootstrapper<ScriptedRunner, HostFileSystem> {
            MonitBootstrapper::new(
                self.runner.clone(),
                HostFileSystem,
                HostPaths::new(self.root.clone()),
                "/var/vcap/bosh/monit/monit.user",
                "vcap",
                MonitTiming {
                    start_timeout: Duration::from_millis(60),
                    poll_interval: Duration::from_millis(10),
                },
                self.shutdown.clone(),
            )
        }
    }

    #[fixture]
    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
        Harness {
            _tmp: tmp,
            root,
            runner: ScriptedRunner::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    #[rstest]
    fn credentials_are_generated_once(harness: Harness) {
        harness.runner.push_success();
        let monit = harness.bootstrapper();
        assert!(matches!(
            monit.monit_credentials(),
            Err(PlatformError::CredentialsNotInitialized { .. })
        ));

        monit
            .setup_monit_user()
            .unwrap_or_else(|err| panic!("setup: {err}"));
        let first = monit
            .monit_credentials()
            .unwrap_or_else(|err| panic!("credentials: {err}"));
        monit
            .setup_monit_user()
            .unwrap_or_else(|err| panic!("second setup: {err}"));
        let second = monit
            .monit_credentials()
            .unwrap_or_else(|err| panic!("credentials: {err}"));

        assert_eq!(first, second);
        assert_eq!(first.username, "vcap");
        assert_eq!(first.password.len(), 32);
        assert_eq!(
            harness.runner.commands(),
            vec![String::from("chmod 0600 /var/vcap/bosh/monit/monit.user")]
        );
    }

    #[rstest]
    fn unprotectable_credentials_fail_setup(harness: Harness) {
        harness.runner.push_failure(1);
        let err = harness
            .bootstrapper()
            .setup_monit_user()
            .expect_err("chmod failure must surface");
        assert!(matches!(err, PlatformError::Collaborator { .. }), "{err:?}");
    }

    #[rstest]
    fn start_is_noop_when_already_running(harness: Harness) {
        harness.runner.push_success();
        harness
            .bootstrapper()
            .start_monit()
            .unwrap_or_else(|err| panic!("start: {err}"));
        assert_eq!(harness.runner.invocations().len(), 1);
    }

    #[rstest]
    fn start_polls_until_responsive(harness: Harness) {
        harness.runner.push_failure(1);
        harness.runner.push_success();
        harness.runner.push_failure(1);
        harness.runner.push_success();
        harness
            .bootstrapper()
            .start_monit()
            .unwrap_or_else(|err| panic!("start: {err}"));
        let programs: Vec<String> = harness
            .runner
            .invocations()
            .into_iter()
            .map(|call| call.program)
            .collect();
        assert_eq!(programs, vec!["monit", "sv", "monit", "monit"]);
    }

    #[rstest]
    fn start_times_out_when_never_responsive(harness: Harness) {
        harness.runner.push_failure(1);
        harness.runner.push_success();
        for _ in 0..200 {
            harness.runner.push_failure(1);
        }
        let err = harness
            .bootstrapper()
            .start_monit()
            .expect_err("supervision never answers");
        assert!(matches!(err, PlatformError::SupervisionStartTimeout { .. }));
        assert!(err.is_retryable());
    }

    #[rstest]
    fn start_honours_shutdown(harness: Harness) {
        harness.runner.push_failure(1);
        harness.runner.push_success();
        harness.shutdown.trip();
        let err = harness
            .bootstrapper()
            .start_monit()
            .expect_err("shutdown should cancel");
        assert!(matches!(err, PlatformError::Cancelled { .. }));
    }
}
