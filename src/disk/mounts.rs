//! Mount table parsing.
//!
//! The table is re-read from `/proc/mounts` on every query; nothing here is
//! cached across calls.

use crate::error::{PlatformResult, fs_error};
use crate::fs::{FileSystem, HostPaths};

/// Logical location of the kernel mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// One row of the mount table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountEntry {
    /// Mounted device.
    pub device: String,
    /// Mount point.
    pub mount_point: String,
    /// Filesystem type.
    pub fs_type: String,
    /// Comma-separated mount options.
    pub options: String,
}

/// Snapshot of the mount table.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Reads the current table through `fs`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::PlatformError::Collaborator`] when the table cannot
    /// be read.
    pub fn read<F: FileSystem>(fs: &F, paths: &HostPaths) -> PlatformResult<Self> {
        let contents = fs
            .read_to_string(&paths.resolve(PROC_MOUNTS))
            .map_err(fs_error("read mount table"))?;
        Ok(Self::parse(&contents))
    }

    /// Parses `/proc/mounts` formatted text.
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                Some(MountEntry {
                    device: unescape(fields.next()?),
                    mount_point: unescape(fields.next()?),
                    fs_type: fields.next()?.to_owned(),
                    options: fields.next().unwrap_or_default().to_owned(),
                })
            })
            .collect();
        Self { entries }
    }

    /// Returns the most recent mount at `mount_point`.
    #[must_use]
    pub fn at_mount_point(&self, mount_point: &str) -> Option<&MountEntry> {
        let wanted = normalise(mount_point);
        self.entries
            .iter()
            .rev()
            .find(|entry| normalise(&entry.mount_point) == wanted)
    }

    /// Returns every mount of `device`.
    #[must_use]
    pub fn of_device<'a>(&'a self, device: &'a str) -> impl Iterator<Item = &'a MountEntry> + 'a {
        self.entries.iter().filter(move |entry| entry.device == device)
    }

    /// Returns all entries in table order.
    #[must_use]
    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }
}

fn normalise(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

/// Decodes the octal escapes the kernel uses for whitespace in paths.
fn unescape(field: &str) -> String {
    field
        .replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid 0 0
/dev/sdc1 /var/vcap/store ext4 rw 0 0
/dev/sdd1 /mnt/with\\040space ext4 ro 0 0
";

    #[test]
    fn finds_entries_by_mount_point_ignoring_trailing_slash() {
        let table = MountTable::parse(TABLE);
        let entry = table
            .at_mount_point("/var/vcap/store/")
            .unwrap_or_else(|| panic!("store should be mounted"));
        assert_eq!(entry.device, "/dev/sdc1");
    }

    #[test]
    fn decodes_escaped_spaces() {
        let table = MountTable::parse(TABLE);
        assert!(table.at_mount_point("/mnt/with space").is_some());
    }

    #[test]
    fn lists_mounts_of_device() {
        let table = MountTable::parse(TABLE);
        assert_eq!(table.of_device("/dev/sda1").count(), 1);
        assert_eq!(table.of_device("/dev/sdz").count(), 0);
    }
}
