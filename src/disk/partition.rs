//! Partitioning and filesystem creation.

use tracing::{debug, info};

use crate::error::{PlatformError, PlatformResult, fs_error, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};

/// Exit status `blkid` uses when a device carries no recognised filesystem.
const BLKID_NOT_FOUND: i32 = 2;

/// What a partition will hold.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartitionKind {
    /// Swap space.
    Swap,
    /// Regular filesystem.
    Data,
}

impl PartitionKind {
    const fn parted_type(self) -> &'static str {
        match self {
            Self::Swap => "linux-swap",
            Self::Data => "ext4",
        }
    }
}

/// One partition of a layout. `size_mib == None` takes the remaining space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PartitionSpec {
    /// Partition contents.
    pub kind: PartitionKind,
    /// Size in MiB, or the rest of the disk.
    pub size_mib: Option<u64>,
}

/// Returns the device path of partition `number` on `device`.
///
/// Devices whose name ends in a digit (`nvme0n1`, `loop0`) use a `p`
/// separator.
#[must_use]
pub fn partition_path(device: &str, number: usize) -> String {
    if device.ends_with(|ch: char| ch.is_ascii_digit()) {
        format!("{device}p{number}")
    } else {
        format!("{device}{number}")
    }
}

/// Splits a partition device into its disk and partition number.
///
/// Returns `None` when `partition` has no trailing partition number.
#[must_use]
pub fn split_partition(partition: &str) -> Option<(String, String)> {
    let disk = partition.trim_end_matches(|ch: char| ch.is_ascii_digit());
    let number = partition.strip_prefix(disk)?;
    if number.is_empty() {
        return None;
    }
    let trimmed = disk.strip_suffix('p').filter(|rest| {
        rest.ends_with(|ch: char| ch.is_ascii_digit())
    });
    Some((trimmed.unwrap_or(disk).to_owned(), number.to_owned()))
}

/// Drives `parted`, `blkid`, `mkfs` and `mkswap` against a device.
#[derive(Clone, Debug)]
pub struct Partitioner<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
}

impl<R: CommandRunner, F: FileSystem> Partitioner<R, F> {
    /// Creates a partitioner.
    #[must_use]
    pub const fn new(runner: R, fs: F, paths: HostPaths) -> Self {
        Self { runner, fs, paths }
    }

    /// Reports whether `device` exists on the host.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when existence cannot be
    /// determined.
    pub fn device_exists(&self, device: &str) -> PlatformResult<bool> {
        self.fs
            .exists(&self.paths.resolve(device))
            .map_err(fs_error("inspect device"))
    }

    /// Partitions `device` with `layout` unless every partition already
    /// exists.
    ///
    /// Returns the partition paths in layout order.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::DiskLayout`] when `parted` fails or the
    /// partitions do not appear afterwards.
    pub fn ensure_partitions(
        &self,
        device: &str,
        layout: &[PartitionSpec],
    ) -> PlatformResult<Vec<String>> {
        let partitions: Vec<String> = (1..=layout.len())
            .map(|number| partition_path(device, number))
            .collect();
        if self.all_exist(&partitions)? {
            debug!(device, "partitions already present");
            return Ok(partitions);
        }

        info!(device, count = layout.len(), "partitioning disk");
        self.parted(device, &["mklabel", "gpt"])?;
        let mut start_mib: u64 = 1;
        for spec in layout {
            let start = format!("{start_mib}MiB");
            let end = match spec.size_mib {
                Some(size) => {
                    start_mib = start_mib.saturating_add(size);
                    format!("{start_mib}MiB")
                }
                None => String::from("100%"),
            };
            self.parted(
                device,
                &[
                    "mkpart",
                    "primary",
                    spec.kind.parted_type(),
                    start.as_str(),
                    end.as_str(),
                ],
            )?;
        }
        self.settle();

        if !self.all_exist(&partitions)? {
            return Err(PlatformError::DiskLayout {
                device: device.to_owned(),
                message: String::from("partitions did not appear after partitioning"),
            });
        }
        Ok(partitions)
    }

    fn all_exist(&self, partitions: &[String]) -> PlatformResult<bool> {
        for partition in partitions {
            if !self.device_exists(partition)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn parted(&self, device: &str, command: &[&str]) -> PlatformResult<()> {
        let mut argv = vec!["-s", device];
        argv.extend_from_slice(command);
        let output = self
            .runner
            .run("parted", &args(argv))
            .map_err(|err| PlatformError::DiskLayout {
                device: device.to_owned(),
                message: err.to_string(),
            })?;
        if output.is_success() {
            Ok(())
        } else {
            Err(PlatformError::DiskLayout {
                device: device.to_owned(),
                message: output.failure_message("parted"),
            })
        }
    }

    fn settle(&self) {
        match self.runner.run("udevadm", &args(["settle"])) {
            Ok(output) if output.is_success() => {}
            Ok(output) => debug!(reason = %output.failure_message("udevadm"), "udev settle skipped"),
            Err(err) => debug!(error = %err, "udev settle skipped"),
        }
    }

    /// Returns the filesystem type on `device`, or `None` when unformatted.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when `blkid` fails for any
    /// other reason.
    pub fn filesystem_type(&self, device: &str) -> PlatformResult<Option<String>> {
        let output = self
            .runner
            .run("blkid", &args(["-o", "value", "-s", "TYPE", device]))
            .map_err(runner_error("probe filesystem", device))?;
        match output.code {
            Some(0) => {
                let fs_type = output.stdout.trim();
                Ok((!fs_type.is_empty()).then(|| fs_type.to_owned()))
            }
            Some(BLKID_NOT_FOUND) => Ok(None),
            _ => Err(PlatformError::command_failed(
                "probe filesystem",
                device,
                "blkid",
                &output,
            )),
        }
    }

    /// Creates a filesystem of `fs_type` on `device` unless one exists.
    ///
    /// An existing filesystem of a different type is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Format`] when `mkfs` fails.
    pub fn ensure_filesystem(&self, device: &str, fs_type: &str) -> PlatformResult<()> {
        if let Some(existing) = self.filesystem_type(device)? {
            if existing != fs_type {
                info!(device, existing = %existing, requested = fs_type, "keeping existing filesystem");
            }
            return Ok(());
        }

        let (program, argv) = if fs_type == "swap" {
            (String::from("mkswap"), vec![device.to_owned()])
        } else if fs_type.starts_with("ext") {
            (format!("mkfs.{fs_type}"), vec![String::from("-F"), device.to_owned()])
        } else {
            (format!("mkfs.{fs_type}"), vec![device.to_owned()])
        };
        info!(device, fs_type, "creating filesystem");
        let output = self
            .runner
            .run(&program, &args(argv))
            .map_err(|err| PlatformError::Format {
                device: device.to_owned(),
                fs_type: fs_type.to_owned(),
                message: err.to_string(),
            })?;
        if output.is_success() {
            Ok(())
        } else {
            Err(PlatformError::Format {
                device: device.to_owned(),
                fs_type: fs_type.to_owned(),
                message: output.failure_message(&program),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/dev/sdb", 1, "/dev/sdb1")]
    #[case("/dev/xvdc", 2, "/dev/xvdc2")]
    #[case("/dev/nvme0n1", 1, "/dev/nvme0n1p1")]
    fn names_partitions(#[case] device: &str, #[case] number: usize, #[case] expected: &str) {
        assert_eq!(partition_path(device, number), expected);
    }

    #[rstest]
    #[case("/dev/sda1", Some(("/dev/sda", "1")))]
    #[case("/dev/nvme0n1p2", Some(("/dev/nvme0n1", "2")))]
    #[case("/dev/root", None)]
    fn splits_partitions(#[case] partition: &str, #[case] expected: Option<(&str, &str)>) {
        let split = split_partition(partition);
        assert_eq!(
            split.as_ref().map(|(disk, number)| (disk.as_str(), number.as_str())),
            expected
        );
    }
}
