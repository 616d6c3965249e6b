//! Error taxonomy shared by every platform backend.
//!
//! Each variant names a failure class callers can act on. Failures bubbled up
//! from the command runner or filesystem collaborators are wrapped into
//! [`PlatformError::Collaborator`] with the operation and target that failed,
//! so a log line is enough to diagnose them without re-running.

use thiserror::Error;

use crate::fs::FsError;
use crate::runner::{CommandOutput, RunnerError};

/// Errors returned by [`crate::Platform`] operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PlatformError {
    /// Raised when a device path does not resolve to a block device.
    #[error("device {path} not found")]
    DeviceNotFound {
        /// Device path that was looked up.
        path: String,
    },
    /// Raised when partitioning or growing a disk cannot proceed.
    #[error("cannot lay out disk {device}: {message}")]
    DiskLayout {
        /// Disk being partitioned.
        device: String,
        /// Human-readable reason.
        message: String,
    },
    /// Raised when filesystem creation fails.
    #[error("failed to format {device} as {fs_type}: {message}")]
    Format {
        /// Partition or device being formatted.
        device: String,
        /// Filesystem type requested.
        fs_type: String,
        /// Human-readable reason.
        message: String,
    },
    /// Raised when the target mount point holds a different disk, or the disk
    /// is already mounted elsewhere.
    #[error("{mount_point} is already mounted from {mounted_device}, refusing to mount {device}")]
    AlreadyMounted {
        /// Mount point that is occupied.
        mount_point: String,
        /// Device currently mounted there.
        mounted_device: String,
        /// Device the caller asked to mount.
        device: String,
    },
    /// Raised when a persistent disk migration fails. The original mount is
    /// left in place.
    #[error("migration from {from} to {to} failed during {stage}: {message}")]
    Migration {
        /// Source mount point.
        from: String,
        /// Target mount point.
        to: String,
        /// Migration stage that failed (for example `copy`).
        stage: String,
        /// Human-readable reason.
        message: String,
    },
    /// Raised when an account operation names a user that does not exist.
    #[error("unknown user {username}")]
    UnknownUser {
        /// Account name that was not found.
        username: String,
    },
    /// Raised when applying network settings to an interface fails.
    #[error("failed to configure network interface {interface}: {message}")]
    NetworkApply {
        /// Interface (or MAC address when unresolved) that failed.
        interface: String,
        /// Human-readable reason.
        message: String,
    },
    /// Raised when the supervision endpoint does not respond in time.
    #[error("supervision did not become responsive within {waited_secs}s")]
    SupervisionStartTimeout {
        /// Seconds spent waiting.
        waited_secs: u64,
    },
    /// Raised when supervision credentials are requested before they were
    /// provisioned.
    #[error("supervision credentials not initialised at {path}")]
    CredentialsNotInitialized {
        /// Location where credentials are expected.
        path: String,
    },
    /// Raised when the removable media device is absent.
    #[error("removable media {path} not found")]
    MediaNotFound {
        /// Device path that was looked up.
        path: String,
    },
    /// Raised when reading from a disk or media volume fails.
    #[error("failed to read {path}: {message}")]
    Read {
        /// File or device path being read.
        path: String,
        /// Human-readable reason.
        message: String,
    },
    /// Raised when the device-path resolver gave up waiting for a disk.
    #[error("timed out resolving device path for disk {disk_id}")]
    DevicePathTimedOut {
        /// Identifier of the disk being resolved.
        disk_id: String,
    },
    /// Raised when raw ephemeral disk setup fails part-way through.
    #[error("raw ephemeral setup failed on {failed} after preparing {prepared:?}: {message}")]
    RawEphemeral {
        /// Devices prepared successfully, in input order.
        prepared: Vec<String>,
        /// Device that failed.
        failed: String,
        /// Rendered cause.
        message: String,
    },
    /// Raised when the caller supplies an empty or malformed argument.
    #[error("invalid {field}: {message}")]
    InvalidInput {
        /// Argument that failed validation.
        field: String,
        /// Human-readable reason.
        message: String,
    },
    /// Raised when the caller's shutdown signal fired during a blocking wait.
    #[error("{operation} cancelled by shutdown")]
    Cancelled {
        /// Operation that was interrupted.
        operation: String,
    },
    /// Wrapper for failures bubbled up from the runner or filesystem.
    #[error("{operation} on {target} failed: {message}")]
    Collaborator {
        /// Operation that was attempted.
        operation: String,
        /// Resource the operation targeted.
        target: String,
        /// Rendered collaborator error.
        message: String,
    },
}

impl PlatformError {
    /// Returns `true` when retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DevicePathTimedOut { .. } | Self::SupervisionStartTimeout { .. }
        )
    }

    /// Wraps a collaborator failure with the operation and target it hit.
    #[must_use]
    pub fn collaborator(
        operation: impl Into<String>,
        target: impl Into<String>,
        source: &impl std::fmt::Display,
    ) -> Self {
        Self::Collaborator {
            operation: operation.into(),
            target: target.into(),
            message: source.to_string(),
        }
    }

    /// Builds a collaborator error from a command that exited unsuccessfully.
    #[must_use]
    pub fn command_failed(
        operation: impl Into<String>,
        target: impl Into<String>,
        program: &str,
        output: &CommandOutput,
    ) -> Self {
        Self::Collaborator {
            operation: operation.into(),
            target: target.into(),
            message: output.failure_message(program),
        }
    }
}

/// Maps a runner error into the collaborator variant.
pub(crate) fn runner_error(operation: &str, target: &str) -> impl FnOnce(RunnerError) -> PlatformError {
    let owned_operation = operation.to_owned();
    let owned_target = target.to_owned();
    move |err| PlatformError::collaborator(owned_operation, owned_target, &err)
}

/// Maps a filesystem error into the collaborator variant.
pub(crate) fn fs_error(operation: &str) -> impl FnOnce(FsError) -> PlatformError {
    let owned_operation = operation.to_owned();
    move |err| PlatformError::Collaborator {
        operation: owned_operation,
        target: err.path().to_owned(),
        message: err.to_string(),
    }
}

/// Rejects `value` unless it names a single entry inside a directory.
pub(crate) fn require_file_name(field: &str, value: &str) -> PlatformResult<()> {
    let reason = if value.trim().is_empty() {
        "must not be empty"
    } else if value.contains('/') {
        "must not contain '/'"
    } else if value == "." || value == ".." {
        "must not be a relative directory"
    } else {
        return Ok(());
    };
    Err(PlatformError::InvalidInput {
        field: field.to_owned(),
        message: String::from(reason),
    })
}

/// Result alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;
