//! Tarball compression of agent-managed directories.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::error::{PlatformError, PlatformResult, fs_error, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};

/// Archive operations exposed through [`crate::Platform::compressor`].
pub trait Compressor {
    /// Archives the contents of `dir` into a new tarball and returns its
    /// logical path.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when `tar` fails.
    fn compress_files_in_dir(&self, dir: &Utf8Path) -> PlatformResult<Utf8PathBuf>;

    /// Extracts `tarball` into `dir`, creating `dir` when missing.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when `tar` fails.
    fn decompress_file_to_dir(&self, tarball: &Utf8Path, dir: &Utf8Path) -> PlatformResult<()>;

    /// Removes a tarball produced by [`Self::compress_files_in_dir`].
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when removal fails.
    fn cleanup_file(&self, tarball: &Utf8Path) -> PlatformResult<()>;
}

/// [`Compressor`] shelling out to `tar`.
#[derive(Clone, Debug)]
pub struct TarballCompressor<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    tmp_dir: Utf8PathBuf,
}

impl<R, F> TarballCompressor<R, F> {
    /// Creates a compressor writing archives under `tmp_dir`.
    #[must_use]
    pub fn new(runner: R, fs: F, paths: HostPaths, tmp_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            runner,
            fs,
            paths,
            tmp_dir: tmp_dir.into(),
        }
    }
}

impl<R: CommandRunner, F: FileSystem> Compressor for TarballCompressor<R, F> {
    fn compress_files_in_dir(&self, dir: &Utf8Path) -> PlatformResult<Utf8PathBuf> {
        self.fs
            .create_dir_all(&self.paths.resolve(&self.tmp_dir))
            .map_err(fs_error("create archive directory"))?;
        let tarball = self
            .tmp_dir
            .join(format!("hostkit-archive-{}.tgz", Uuid::new_v4().simple()));
        let output = self
            .runner
            .run(
                "tar",
                &args(["czf", tarball.as_str(), "-C", dir.as_str(), "."]),
            )
            .map_err(runner_error("compress", dir.as_str()))?;
        if !output.is_success() {
            return Err(PlatformError::command_failed(
                "compress",
                dir.as_str(),
                "tar",
                &output,
            ));
        }
        debug!(dir = %dir, tarball = %tarball, "compressed directory");
        Ok(tarball)
    }

    fn decompress_file_to_dir(&self, tarball: &Utf8Path, dir: &Utf8Path) -> PlatformResult<()> {
        self.fs
            .create_dir_all(&self.paths.resolve(dir))
            .map_err(fs_error("create extraction directory"))?;
        let output = self
            .runner
            .run(
                "tar",
                &args([
                    "--no-same-owner",
                    "-xzf",
                    tarball.as_str(),
                    "-C",
                    dir.as_str(),
                ]),
            )
            .map_err(runner_error("decompress", tarball.as_str()))?;
        if output.is_success() {
            Ok(())
        } else {
            Err(PlatformError::command_failed(
                "decompress",
                tarball.as_str(),
                "tar",
                &output,
            ))
        }
    }

    fn cleanup_file(&self, tarball: &Utf8Path) -> PlatformResult<()> {
        self.fs
            .remove_file(&self.paths.resolve(tarball))
            .map_err(fs_error("remove archive"))
    }
}
