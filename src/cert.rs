//! Trusted certificate management.

use camino::Utf8PathBuf;
use tracing::{debug, info};

use crate::error::{PlatformError, PlatformResult, fs_error, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};

/// Directory scanned by `update-ca-certificates`.
pub const CA_CERT_DIR: &str = "/usr/local/share/ca-certificates";

const CERT_PREFIX: &str = "hostkit-trusted-cert-";
const BEGIN_MARKER: &str = "-----BEGIN CERTIFICATE-----";
const END_MARKER: &str = "-----END CERTIFICATE-----";

/// Lifecycle operations for trusted TLS material.
pub trait CertManager {
    /// Replaces the agent-managed trusted certificates with those in
    /// `pem_bundle`. An empty bundle removes them all.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when the store cannot be
    /// rewritten.
    fn update_certificates(&self, pem_bundle: &str) -> PlatformResult<()>;
}

/// [`CertManager`] for hosts without certificate rotation.
#[derive(Clone, Copy, Debug, Default)]
pub struct DummyCertManager;

impl CertManager for DummyCertManager {
    fn update_certificates(&self, _pem_bundle: &str) -> PlatformResult<()> {
        Ok(())
    }
}

/// [`CertManager`] that writes individual certificates into the system CA
/// directory and refreshes the bundle.
#[derive(Clone, Debug)]
pub struct CaBundleCertManager<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    cert_dir: Utf8PathBuf,
}

impl<R, F> CaBundleCertManager<R, F> {
    /// Creates a manager writing into [`CA_CERT_DIR`].
    #[must_use]
    pub fn new(runner: R, fs: F, paths: HostPaths) -> Self {
        Self {
            runner,
            fs,
            paths,
            cert_dir: Utf8PathBuf::from(CA_CERT_DIR),
        }
    }
}

impl<R: CommandRunner, F: FileSystem> CaBundleCertManager<R, F> {
    fn remove_managed(&self) -> PlatformResult<usize> {
        let dir = self.paths.resolve(&self.cert_dir);
        let names = match self.fs.list_dir(&dir) {
            Ok(names) => names,
            Err(err) if err.is_not_found() => return Ok(0),
            Err(err) => return Err(fs_error("list certificates")(err)),
        };
        let mut removed = 0;
        for name in names.iter().filter(|name| name.starts_with(CERT_PREFIX)) {
            self.fs
                .remove_file(&dir.join(name))
                .map_err(fs_error("remove certificate"))?;
            removed += 1;
        }
        Ok(removed)
    }
}

impl<R: CommandRunner, F: FileSystem> CertManager for CaBundleCertManager<R, F> {
    fn update_certificates(&self, pem_bundle: &str) -> PlatformResult<()> {
        let removed = self.remove_managed()?;
        let certs = split_certificates(pem_bundle);
        let dir = self.paths.resolve(&self.cert_dir);
        for (index, cert) in certs.iter().enumerate() {
            let path = dir.join(format!("{CERT_PREFIX}{}.crt", index + 1));
            self.fs
                .write(&path, cert.as_bytes())
                .map_err(fs_error("write certificate"))?;
        }
        debug!(removed, written = certs.len(), "rewrote trusted certificates");

        let output = self
            .runner
            .run("update-ca-certificates", &args(["-f"]))
            .map_err(runner_error("update certificates", CA_CERT_DIR))?;
        if !output.is_success() {
            return Err(PlatformError::command_failed(
                "update certificates",
                CA_CERT_DIR,
                "update-ca-certificates",
                &output,
            ));
        }
        info!(count = certs.len(), "trusted certificates updated");
        Ok(())
    }
}

fn split_certificates(pem_bundle: &str) -> Vec<String> {
    let mut certs = Vec::new();
    let mut current: Option<String> = None;
    for line in pem_bundle.lines().map(str::trim) {
        if line == BEGIN_MARKER {
            current = Some(format!("{line}\n"));
        } else if let Some(mut cert) = current.take() {
            cert.push_str(line);
            cert.push('\n');
            if line == END_MARKER {
                certs.push(cert);
            } else {
                current = Some(cert);
            }
        }
    }
    certs
}
