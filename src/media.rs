//! Removable-media reader.
//!
//! The device is mounted read-only at a scratch mount point for the
//! duration of one read and always unmounted again.

use camino::Utf8PathBuf;
use tracing::{debug, warn};

use crate::error::{PlatformError, PlatformResult, fs_error, require_file_name, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};

/// Reads files from an attached config drive or CD-ROM.
#[derive(Clone, Debug)]
pub struct MediaReader<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    mount_dir: Utf8PathBuf,
    settings_file: String,
}

impl<R: CommandRunner, F: FileSystem> MediaReader<R, F> {
    /// Creates a reader mounting media at `mount_dir` and treating
    /// `settings_file` as the well-known payload.
    #[must_use]
    pub fn new(
        runner: R,
        fs: F,
        paths: HostPaths,
        mount_dir: impl Into<Utf8PathBuf>,
        settings_file: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            fs,
            paths,
            mount_dir: mount_dir.into(),
            settings_file: settings_file.into(),
        }
    }

    /// Reads the well-known settings payload from `disk_path`.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::MediaNotFound`] when the device is absent
    /// and [`PlatformError::Read`] when the payload cannot be read.
    pub fn settings_payload(&self, disk_path: &str) -> PlatformResult<Vec<u8>> {
        let names = [self.settings_file.clone()];
        self.read_files(disk_path, &names)?
            .into_iter()
            .next()
            .ok_or_else(|| PlatformError::Read {
                path: disk_path.to_owned(),
                message: String::from("no payload returned"),
            })
    }

    /// Reads `file_names` from `disk_path`, in order. Any missing file fails
    /// the whole call.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::MediaNotFound`] when the device is absent,
    /// [`PlatformError::InvalidInput`] when a name is not a plain file name,
    /// and [`PlatformError::Read`] when mounting or any read fails.
    pub fn read_files(&self, disk_path: &str, file_names: &[String]) -> PlatformResult<Vec<Vec<u8>>> {
        if disk_path.is_empty() {
            return Err(PlatformError::InvalidInput {
                field: String::from("disk path"),
                message: String::from("must not be empty"),
            });
        }
        for name in file_names {
            require_file_name("media file name", name)?;
        }
        let present = self
            .fs
            .exists(&self.paths.resolve(disk_path))
            .map_err(fs_error("inspect media"))?;
        if !present {
            return Err(PlatformError::MediaNotFound {
                path: disk_path.to_owned(),
            });
        }

        self.fs
            .create_dir_all(&self.paths.resolve(&self.mount_dir))
            .map_err(fs_error("create media mount point"))?;
        let output = self
            .runner
            .run("mount", &args(["-o", "ro", disk_path, self.mount_dir.as_str()]))
            .map_err(runner_error("mount media", disk_path))?;
        if !output.is_success() {
            return Err(PlatformError::Read {
                path: disk_path.to_owned(),
                message: output.failure_message("mount"),
            });
        }
        debug!(device = disk_path, mount_point = %self.mount_dir, "media mounted");

        let contents = self.read_mounted(file_names);
        let unmounted = self.unmount();
        match (contents, unmounted) {
            (Ok(files), Ok(())) => Ok(files),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(unmount_err)) => {
                warn!(error = %unmount_err, "failed to unmount media after read error");
                Err(err)
            }
            (Ok(_), Err(unmount_err)) => Err(unmount_err),
        }
    }

    fn read_mounted(&self, file_names: &[String]) -> PlatformResult<Vec<Vec<u8>>> {
        file_names
            .iter()
            .map(|name| {
                let logical = self.mount_dir.join(name);
                self.fs
                    .read(&self.paths.resolve(&logical))
                    .map_err(|err| PlatformError::Read {
                        path: logical.to_string(),
                        message: err.to_string(),
                    })
            })
            .collect()
    }

    fn unmount(&self) -> PlatformResult<()> {
        let output = self
            .runner
            .run("umount", &args([self.mount_dir.as_str()]))
            .map_err(runner_error("unmount media", self.mount_dir.as_str()))?;
        if output.is_success() {
            Ok(())
        } else {
            Err(PlatformError::command_failed(
                "unmount media",
                self.mount_dir.as_str(),
                "umount",
                &output,
            ))
        }
    }
}
