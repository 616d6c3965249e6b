//! Host identity key, generated on first use.

use camino::Utf8PathBuf;
use tracing::info;

use crate::error::{PlatformError, PlatformResult, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};

/// Persisted state of the host key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HostKeyState {
    /// No key has been generated yet.
    Uninitialized,
    /// The public key, trimmed.
    Ready(String),
}

/// Reads, and on first use generates, the host's RSA identity key.
#[derive(Clone, Debug)]
pub struct HostKeyStore<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    key_path: Utf8PathBuf,
}

impl<R: CommandRunner, F: FileSystem> HostKeyStore<R, F> {
    /// Creates a store for the private key at `key_path`; the public key
    /// lives beside it with a `.pub` suffix.
    #[must_use]
    pub fn new(runner: R, fs: F, paths: HostPaths, key_path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            runner,
            fs,
            paths,
            key_path: key_path.into(),
        }
    }

    fn public_key_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.pub", self.key_path))
    }

    /// Returns the current state without generating anything.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Read`] when the key exists but cannot be
    /// read.
    pub fn state(&self) -> PlatformResult<HostKeyState> {
        let public = self.public_key_path();
        match self.fs.read_to_string(&self.paths.resolve(&public)) {
            Ok(key) if !key.trim().is_empty() => Ok(HostKeyState::Ready(key.trim().to_owned())),
            Ok(_) => Ok(HostKeyState::Uninitialized),
            Err(err) if err.is_not_found() => Ok(HostKeyState::Uninitialized),
            Err(err) => Err(PlatformError::Read {
                path: public.into_string(),
                message: err.to_string(),
            }),
        }
    }

    /// Returns the public key, generating the key pair when absent.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when `ssh-keygen` fails and
    /// [`PlatformError::Read`] when the generated key cannot be read back.
    pub fn public_key(&self) -> PlatformResult<String> {
        if let HostKeyState::Ready(key) = self.state()? {
            return Ok(key);
        }
        let private = self.key_path.as_str();
        let output = self
            .runner
            .run(
                "ssh-keygen",
                &args(["-t", "rsa", "-N", "", "-f", private, "-q"]),
            )
            .map_err(runner_error("generate host key", private))?;
        if !output.is_success() {
            return Err(PlatformError::command_failed(
                "generate host key",
                private,
                "ssh-keygen",
                &output,
            ));
        }
        info!(path = %self.key_path, "generated host key");
        match self.state()? {
            HostKeyState::Ready(key) => Ok(key),
            HostKeyState::Uninitialized => Err(PlatformError::Read {
                path: self.public_key_path().into_string(),
                message: String::from("key generation produced no public key"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::HostFileSystem;
    use crate::test_support::ScriptedRunner;
    use tempfile::TempDir;

    const KEY: &str = "/etc/ssh/ssh_host_rsa_key";

    fn setup() -> (TempDir, HostPaths, ScriptedRunner) {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("non-utf8 tempdir {}", path.display()));
        (tmp, HostPaths::new(root), ScriptedRunner::new())
    }

    #[test]
    fn existing_key_is_returned_without_generation() {
        let (_tmp, paths, runner) = setup();
        HostFileSystem
            .write(&paths.resolve(format!("{KEY}.pub")), b"ssh-rsa AAAA host\n")
            .unwrap_or_else(|err| panic!("seed: {err}"));
        let store = HostKeyStore::new(runner.clone(), HostFileSystem, paths, KEY);

        let key = store.public_key().unwrap_or_else(|err| panic!("key: {err}"));

        assert_eq!(key, "ssh-rsa AAAA host");
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn keygen_that_writes_nothing_is_a_read_error() {
        let (_tmp, paths, runner) = setup();
        runner.push_success();
        let store = HostKeyStore::new(runner.clone(), HostFileSystem, paths, KEY);

        assert_eq!(
            store.state().unwrap_or_else(|err| panic!("state: {err}")),
            HostKeyState::Uninitialized
        );
        let err = store.public_key().expect_err("no key produced");

        assert!(matches!(err, PlatformError::Read { .. }), "{err:?}");
        assert_eq!(
            runner.commands(),
            vec![format!("ssh-keygen -t rsa -N  -f {KEY} -q")]
        );
    }

    #[test]
    fn keygen_failure_is_a_collaborator_error() {
        let (_tmp, paths, runner) = setup();
        runner.push_failure(1);
        let err = HostKeyStore::new(runner, HostFileSystem, paths, KEY)
            .public_key()
            .expect_err("keygen fails");
        assert!(matches!(err, PlatformError::Collaborator { .. }), "{err:?}");
    }
}
