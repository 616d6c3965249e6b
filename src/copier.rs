//! Directory tree copying.

use camino::Utf8Path;
use tracing::debug;

use crate::error::{PlatformError, PlatformResult, fs_error, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};

/// Copy operations exposed through [`crate::Platform::copier`].
pub trait Copier {
    /// Copies everything below `src` into `dst`, preserving ownership and
    /// permissions.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when the copy fails.
    fn copy_dir_contents(&self, src: &Utf8Path, dst: &Utf8Path) -> PlatformResult<()>;

    /// Removes a scratch directory created for a copy.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when removal fails.
    fn remove_temp_dir(&self, dir: &Utf8Path) -> PlatformResult<()>;
}

/// [`Copier`] using `cp -a`.
#[derive(Clone, Debug)]
pub struct CpCopier<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
}

impl<R, F> CpCopier<R, F> {
    /// Creates a copier.
    #[must_use]
    pub const fn new(runner: R, fs: F, paths: HostPaths) -> Self {
        Self { runner, fs, paths }
    }
}

impl<R: CommandRunner, F: FileSystem> Copier for CpCopier<R, F> {
    fn copy_dir_contents(&self, src: &Utf8Path, dst: &Utf8Path) -> PlatformResult<()> {
        let source = format!("{}/.", src.as_str().trim_end_matches('/'));
        debug!(src = %src, dst = %dst, "copying directory contents");
        let output = self
            .runner
            .run("cp", &args(["-a", source.as_str(), dst.as_str()]))
            .map_err(runner_error("copy", src.as_str()))?;
        if output.is_success() {
            Ok(())
        } else {
            Err(PlatformError::command_failed("copy", src.as_str(), "cp", &output))
        }
    }

    fn remove_temp_dir(&self, dir: &Utf8Path) -> PlatformResult<()> {
        self.fs
            .remove_dir_all(&self.paths.resolve(dir))
            .map_err(fs_error("remove temp dir"))
    }
}
