//! Disk lifecycle management for ephemeral, raw ephemeral and persistent
//! disks.
//!
//! Every query re-reads the kernel mount table; the manager keeps no notion
//! of "mounted" between calls. Persistent disks move through
//! `resolved → formatted → mounted`, and only [`DiskManager::mount_persistent`],
//! [`DiskManager::unmount_persistent`] and [`DiskManager::migrate_persistent`]
//! move them.

mod mounts;
mod partition;

use camino::Utf8Path;
use tracing::{debug, info, warn};

pub use mounts::{MountEntry, MountTable, PROC_MOUNTS};
pub use partition::{PartitionKind, PartitionSpec, Partitioner, partition_path, split_partition};

use crate::copier::Copier;
use crate::devicepath::{DISK_BY_ID_DIR, DevicePathResolver};
use crate::dirs::DirProvider;
use crate::error::{PlatformError, PlatformResult, fs_error, runner_error};
use crate::fs::{FileSystem, HostPaths};
use crate::runner::{CommandRunner, args};
use crate::settings::DiskSettings;

/// Directory holding udev's stable links to block devices.
const DEV_DISK_DIR: &str = "/dev/disk/";

/// Logical location of the active swap table.
pub const PROC_SWAPS: &str = "/proc/swaps";

/// Filesystem choices for the disks the manager prepares.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiskOptions {
    /// Filesystem created on the ephemeral data partition.
    pub ephemeral_fs_type: String,
    /// Filesystem created on persistent disks without an explicit type.
    pub persistent_fs_type: String,
    /// Size of the swap partition carved from the ephemeral disk.
    pub swap_size_mib: Option<u64>,
}

impl Default for DiskOptions {
    fn default() -> Self {
        Self {
            ephemeral_fs_type: String::from("ext4"),
            persistent_fs_type: String::from("ext4"),
            swap_size_mib: None,
        }
    }
}

/// Result of preparing one raw ephemeral disk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawEphemeralDisk {
    /// Identifier of the disk from its settings.
    pub id: String,
    /// Whole-disk device path.
    pub device_path: String,
    /// Partition handed to workloads.
    pub partition_path: String,
}

/// Partitions, formats, mounts and migrates disks.
#[derive(Clone, Debug)]
pub struct DiskManager<R, F> {
    runner: R,
    fs: F,
    paths: HostPaths,
    dirs: DirProvider,
    options: DiskOptions,
    partitioner: Partitioner<R, F>,
}

impl<R, F> DiskManager<R, F>
where
    R: CommandRunner + Clone,
    F: FileSystem + Clone,
{
    /// Creates a manager.
    #[must_use]
    pub fn new(runner: R, fs: F, paths: HostPaths, dirs: DirProvider, options: DiskOptions) -> Self {
        let partitioner = Partitioner::new(runner.clone(), fs.clone(), paths.clone());
        Self {
            runner,
            fs,
            paths,
            dirs,
            options,
            partitioner,
        }
    }
}

impl<R: CommandRunner, F: FileSystem> DiskManager<R, F> {
    fn mounts(&self) -> PlatformResult<MountTable> {
        MountTable::read(&self.fs, &self.paths)
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

    fn mount(&self, device: &str, mount_point: &str, options: &[String]) -> PlatformResult<()> {
        self.fs
            .create_dir_all(&self.paths.resolve(mount_point))
            .map_err(fs_error("create mount point"))?;
        let joined = options.join(",");
        let mut argv = Vec::new();
        if !joined.is_empty() {
            argv.extend(["-o", joined.as_str()]);
        }
        argv.extend([device, mount_point]);
        info!(device, mount_point, "mounting");
        self.run_checked("mount", device, "mount", &argv)
    }

    fn umount(&self, target: &str) -> PlatformResult<()> {
        info!(target, "unmounting");
        self.run_checked("unmount", target, "umount", &[target])
    }

    fn remount(&self, mount_point: &str, mode: &str) -> PlatformResult<()> {
        let options = format!("remount,{mode}");
        self.run_checked(
            "remount",
            mount_point,
            "mount",
            &["-o", options.as_str(), mount_point],
        )
    }

    /// Grows the root partition and filesystem into unused disk space.
    ///
    /// Skipped when the root disk doubles as the ephemeral disk, when the
    /// root filesystem is not backed by a partitioned block device, or when
    /// the partition already fills the disk.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::DiskLayout`] when growing fails.
    pub fn setup_root_disk(&self, ephemeral_disk_path: &str) -> PlatformResult<()> {
        let table = self.mounts()?;
        let root = table.at_mount_point("/").ok_or_else(|| PlatformError::DiskLayout {
            device: String::from("/"),
            message: String::from("root filesystem not found in mount table"),
        })?;
        let Some((disk, number)) = root
            .device
            .starts_with("/dev/")
            .then(|| split_partition(&root.device))
            .flatten()
        else {
            info!(device = %root.device, "root filesystem is not on a partition; skipping growth");
            return Ok(());
        };
        if !ephemeral_disk_path.is_empty() && ephemeral_disk_path == disk {
            info!(disk = %disk, "root disk is the ephemeral disk; skipping growth");
            return Ok(());
        }

        let probe = self
            .runner
            .run("growpart", &args(["--dry-run", disk.as_str(), number.as_str()]))
            .map_err(|err| layout_error(&disk, &err))?;
        if !probe.is_success() {
            if probe.stdout.contains("NOCHANGE") {
                debug!(disk = %disk, "root partition already fills the disk");
                return Ok(());
            }
            return Err(PlatformError::DiskLayout {
                device: disk,
                message: probe.failure_message("growpart"),
            });
        }

        info!(disk = %disk, partition = %root.device, "growing root partition");
        for (program, argv) in [
            ("growpart", vec![disk.as_str(), number.as_str()]),
            ("resize2fs", vec![root.device.as_str()]),
        ] {
            let output = self
                .runner
                .run(program, &args(argv))
                .map_err(|err| layout_error(&disk, &err))?;
            if !output.is_success() {
                return Err(PlatformError::DiskLayout {
                    device: disk.clone(),
                    message: output.failure_message(program),
                });
            }
        }
        Ok(())
    }

    /// Partitions, formats and mounts the ephemeral disk at the data dir.
    ///
    /// An empty `device_path` means no ephemeral disk is attached; the data
    /// directory is then created on the root filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::DeviceNotFound`] when the device is missing,
    /// [`PlatformError::Format`] when formatting fails, or
    /// [`PlatformError::AlreadyMounted`] when another device occupies the
    /// data directory.
    pub fn setup_ephemeral_disk(&self, device_path: &str) -> PlatformResult<()> {
        let data_dir = self.dirs.data_dir();
        self.fs
            .create_dir_all(&self.paths.resolve(&data_dir))
            .map_err(fs_error("create data dir"))?;
        if device_path.is_empty() {
            info!(data_dir = %data_dir, "no ephemeral disk; using root filesystem");
            return Ok(());
        }
        let device = self.canonical_device(device_path)?;
        if !self.partitioner.device_exists(&device)? {
            return Err(PlatformError::DeviceNotFound {
                path: device_path.to_owned(),
            });
        }

        let mut layout = Vec::with_capacity(2);
        if let Some(size) = self.options.swap_size_mib.filter(|size| *size > 0) {
            layout.push(PartitionSpec {
                kind: PartitionKind::Swap,
                size_mib: Some(size),
            });
        }
        layout.push(PartitionSpec {
            kind: PartitionKind::Data,
            size_mib: None,
        });

        let table = self.mounts()?;
        let data_partition = partition_path(&device, layout.len());
        if let Some(entry) = table.at_mount_point(data_dir.as_str()) {
            if entry.device == data_partition {
                debug!(device = %data_partition, "ephemeral disk already mounted");
                return self.ensure_swap(&device, &layout);
            }
            return Err(PlatformError::AlreadyMounted {
                mount_point: data_dir.into_string(),
                mounted_device: entry.device.clone(),
                device: data_partition,
            });
        }

        let partitions = self.partitioner.ensure_partitions(&device, &layout)?;
        self.ensure_swap(&device, &layout)?;
        let data = partitions.last().cloned().unwrap_or(data_partition);
        self.partitioner
            .ensure_filesystem(&data, &self.options.ephemeral_fs_type)?;
        self.mount(&data, data_dir.as_str(), &[])
    }

    fn ensure_swap(&self, device_path: &str, layout: &[PartitionSpec]) -> PlatformResult<()> {
        if !layout
            .first()
            .is_some_and(|spec| spec.kind == PartitionKind::Swap)
        {
            return Ok(());
        }
        let swap = partition_path(device_path, 1);
        self.partitioner.ensure_filesystem(&swap, "swap")?;
        let active = match self.fs.read_to_string(&self.paths.resolve(PROC_SWAPS)) {
            Ok(contents) => contents,
            Err(err) if err.is_not_found() => String::new(),
            Err(err) => return Err(fs_error("read swap table")(err)),
        };
        if active
            .lines()
            .skip(1)
            .any(|line| line.split_whitespace().next() == Some(swap.as_str()))
        {
            return Ok(());
        }
        self.run_checked("enable swap", &swap, "swapon", &[swap.as_str()])
    }

    /// Partitions each raw ephemeral disk with a single unformatted
    /// partition, in input order.
    ///
    /// Disks known only by device id are located through `resolver` and
    /// partitioned on the kernel device the id links to.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::RawEphemeral`] naming the disks prepared
    /// before the failing one.
    pub fn setup_raw_ephemeral_disks(
        &self,
        resolver: &dyn DevicePathResolver,
        disks: &[DiskSettings],
    ) -> PlatformResult<Vec<RawEphemeralDisk>> {
        let mut prepared: Vec<RawEphemeralDisk> = Vec::with_capacity(disks.len());
        for disk in disks {
            let device = match self.raw_device(resolver, disk) {
                Ok(device) => device,
                Err(err) => return Err(raw_failure(&prepared, disk.label(), &err)),
            };
            match self.prepare_raw(&device) {
                Ok(partition) => {
                    debug!(device = %device, partition = %partition, "prepared raw ephemeral disk");
                    prepared.push(RawEphemeralDisk {
                        id: disk.id.clone(),
                        device_path: device,
                        partition_path: partition,
                    });
                }
                Err(err) => return Err(raw_failure(&prepared, &device, &err)),
            }
        }
        Ok(prepared)
    }

    fn raw_device(&self, resolver: &dyn DevicePathResolver, disk: &DiskSettings) -> PlatformResult<String> {
        if disk.path.is_empty() && disk.device_id.is_empty() {
            return Err(PlatformError::DeviceNotFound {
                path: disk.label().to_owned(),
            });
        }
        let resolved = resolver.resolve(disk)?;
        if resolved.timed_out {
            return Err(PlatformError::DevicePathTimedOut {
                disk_id: disk.label().to_owned(),
            });
        }
        self.canonical_device(&resolved.path)
    }

    /// Follows a `/dev/disk/...` link to the kernel device node, so
    /// partitions are named after the real device. Paths that cannot be
    /// followed are returned unchanged.
    fn canonical_device(&self, device: &str) -> PlatformResult<String> {
        if !device.starts_with(DEV_DISK_DIR) {
            return Ok(device.to_owned());
        }
        let output = self
            .runner
            .run("readlink", &args(["-f", device]))
            .map_err(runner_error("resolve device link", device))?;
        let target = output.stdout.trim();
        if output.is_success() && !target.is_empty() {
            debug!(link = device, device = target, "followed device link");
            Ok(target.to_owned())
        } else {
            Ok(device.to_owned())
        }
    }

    fn prepare_raw(&self, device: &str) -> PlatformResult<String> {
        if device.is_empty() || !self.partitioner.device_exists(device)? {
            return Err(PlatformError::DeviceNotFound {
                path: device.to_owned(),
            });
        }
        let partitions = self.partitioner.ensure_partitions(
            device,
            &[PartitionSpec {
                kind: PartitionKind::Data,
                size_mib: None,
            }],
        )?;
        Ok(partitions
            .into_iter()
            .next()
            .unwrap_or_else(|| partition_path(device, 1)))
    }

    /// Returns the device node that carries the persistent data for `disk`.
    fn persistent_partition(disk: &DiskSettings, device: &str) -> String {
        if disk.partitioned {
            partition_path(device, 1)
        } else {
            device.to_owned()
        }
    }

    /// Formats (when needed) and mounts a resolved persistent disk.
    ///
    /// Mounting the same device at the same point again succeeds without
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::DeviceNotFound`] when `device` is missing,
    /// [`PlatformError::AlreadyMounted`] when `mount_point` holds another
    /// device or the disk is mounted elsewhere, and
    /// [`PlatformError::Format`] when formatting fails.
    pub fn mount_persistent(
        &self,
        disk: &DiskSettings,
        device: &str,
        mount_point: &str,
    ) -> PlatformResult<()> {
        if mount_point.is_empty() {
            return Err(PlatformError::InvalidInput {
                field: String::from("mount point"),
                message: String::from("must not be empty"),
            });
        }
        if !self.partitioner.device_exists(device)? {
            return Err(PlatformError::DeviceNotFound {
                path: device.to_owned(),
            });
        }
        let partition = Self::persistent_partition(disk, device);
        let table = self.mounts()?;
        if let Some(entry) = table.at_mount_point(mount_point) {
            if entry.device == partition {
                debug!(device = %partition, mount_point, "persistent disk already mounted");
                return Ok(());
            }
            return Err(PlatformError::AlreadyMounted {
                mount_point: mount_point.to_owned(),
                mounted_device: entry.device.clone(),
                device: partition,
            });
        }
        let mounted_elsewhere = table
            .of_device(&partition)
            .next()
            .map(|entry| entry.mount_point.clone());
        if let Some(other) = mounted_elsewhere {
            return Err(PlatformError::AlreadyMounted {
                mount_point: other,
                mounted_device: partition.clone(),
                device: partition,
            });
        }

        if disk.partitioned {
            self.partitioner.ensure_partitions(
                device,
                &[PartitionSpec {
                    kind: PartitionKind::Data,
                    size_mib: None,
                }],
            )?;
        }
        let fs_type = disk
            .file_system_type
            .as_deref()
            .unwrap_or(&self.options.persistent_fs_type);
        self.partitioner.ensure_filesystem(&partition, fs_type)?;
        self.mount(&partition, mount_point, &disk.mount_options)
    }

    /// Unmounts a resolved persistent disk.
    ///
    /// Returns `Ok(false)` when the disk was not mounted.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when `umount` fails.
    pub fn unmount_persistent(&self, disk: &DiskSettings, device: &str) -> PlatformResult<bool> {
        let partition = Self::persistent_partition(disk, device);
        let table = self.mounts()?;
        let mount_points: Vec<String> = table
            .of_device(&partition)
            .map(|entry| entry.mount_point.clone())
            .collect();
        if mount_points.is_empty() {
            debug!(device = %partition, "persistent disk not mounted");
            return Ok(false);
        }
        for mount_point in mount_points.iter().rev() {
            self.umount(mount_point)?;
        }
        Ok(true)
    }

    /// Reports whether the resolved persistent disk is mounted anywhere.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when the mount table cannot
    /// be read.
    pub fn is_persistent_mounted(&self, disk: &DiskSettings, device: &str) -> PlatformResult<bool> {
        let partition = Self::persistent_partition(disk, device);
        Ok(self.mounts()?.of_device(&partition).next().is_some())
    }

    /// Reports whether `path` is a mount point.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Collaborator`] when the mount table cannot
    /// be read.
    pub fn is_mount_point(&self, path: &str) -> PlatformResult<bool> {
        Ok(self.mounts()?.at_mount_point(path).is_some())
    }

    /// Copies the persistent data at `from` onto the disk mounted at `to`,
    /// then mounts that disk at `from` in place of the original.
    ///
    /// Any failure leaves the original disk mounted read-write at `from`.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Migration`] naming the failed stage.
    pub fn migrate_persistent(&self, copier: &dyn Copier, from: &str, to: &str) -> PlatformResult<()> {
        let table = self.mounts()?;
        let source = table
            .at_mount_point(from)
            .cloned()
            .ok_or_else(|| migration_error(from, to, "inspect", "source is not a mount point"))?;
        let target = table
            .at_mount_point(to)
            .cloned()
            .ok_or_else(|| migration_error(from, to, "inspect", "target is not a mount point"))?;
        info!(from, to, source = %source.device, target = %target.device, "migrating persistent disk");

        self.remount(from, "ro")
            .map_err(|err| migration_error(from, to, "remount-readonly", &err.to_string()))?;

        if let Err(err) = copier.copy_dir_contents(Utf8Path::new(from), Utf8Path::new(to)) {
            self.restore_writable(from);
            return Err(migration_error(from, to, "copy", &err.to_string()));
        }
        if let Err(err) = self.umount(from) {
            self.restore_writable(from);
            return Err(migration_error(from, to, "unmount-source", &err.to_string()));
        }
        if let Err(err) = self.umount(to) {
            self.restore_source(&source);
            return Err(migration_error(from, to, "unmount-target", &err.to_string()));
        }
        if let Err(err) = self.mount(&target.device, from, &[]) {
            self.restore_source(&source);
            return Err(migration_error(from, to, "mount-target", &err.to_string()));
        }
        info!(from, device = %target.device, "persistent disk migrated");
        Ok(())
    }

    fn restore_writable(&self, mount_point: &str) {
        if let Err(err) = self.remount(mount_point, "rw") {
            warn!(mount_point, error = %err, "failed to restore read-write mount");
        }
    }

    fn restore_source(&self, source: &MountEntry) {
        if let Err(err) = self.mount(&source.device, &source.mount_point, &[]) {
            warn!(device = %source.device, mount_point = %source.mount_point, error = %err, "failed to restore original mount");
        }
    }
}

/// Maps settings to the device path the ephemeral disk is expected at.
///
/// Prefers the explicit path, then the by-id link for the device id, and
/// returns an empty string when neither is known.
#[must_use]
pub fn ephemeral_disk_path(disk: &DiskSettings) -> String {
    if !disk.path.is_empty() {
        return disk.path.clone();
    }
    if !disk.device_id.is_empty() {
        return format!("{DISK_BY_ID_DIR}/{}", disk.device_id);
    }
    String::new()
}

fn layout_error(device: &str, err: &impl std::fmt::Display) -> PlatformError {
    PlatformError::DiskLayout {
        device: device.to_owned(),
        message: err.to_string(),
    }
}

fn raw_failure(prepared: &[RawEphemeralDisk], failed: &str, err: &PlatformError) -> PlatformError {
    PlatformError::RawEphemeral {
        prepared: prepared.iter().map(|raw| raw.device_path.clone()).collect(),
        failed: failed.to_owned(),
        message: err.to_string(),
    }
}

fn migration_error(from: &str, to: &str, stage: &str, message: &str) -> PlatformError {
    PlatformError::Migration {
        from: from.to_owned(),
        to: to.to_owned(),
        stage: stage.to_owned(),
        message: message.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(DiskSettings::with_path("eph", "/dev/sdb"), "/dev/sdb")]
    #[case(
        DiskSettings { device_id: String::from("vol-9"), ..DiskSettings::default() },
        "/dev/disk/by-id/vol-9"
    )]
    #[case(DiskSettings::default(), "")]
    fn ephemeral_path_prefers_explicit_path(#[case] disk: DiskSettings, #[case] expected: &str) {
        assert_eq!(ephemeral_disk_path(&disk), expected);
    }
}
