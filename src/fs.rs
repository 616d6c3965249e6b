//! Filesystem collaborator and host-root path mapping.
//!
//! Components address host files by their logical location (`/etc/passwd`,
//! `/proc/mounts`, `/dev/sdb`). [`HostPaths`] maps those onto the configured
//! host root so tests can point a backend at a temporary directory, and
//! [`FileSystem`] performs the actual I/O.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Errors raised by [`FileSystem`] implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FsError {
    /// Raised when the path does not exist.
    #[error("{path} does not exist")]
    NotFound {
        /// Path that was accessed.
        path: String,
    },
    /// Raised for any other I/O failure.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that was accessed.
        path: String,
        /// Operating system error string.
        message: String,
    },
}

impl FsError {
    /// Returns the path the failed operation targeted.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::NotFound { path } | Self::Io { path, .. } => path,
        }
    }

    /// Returns `true` when the error means the path is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    fn from_io(path: &Utf8Path, err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound {
                path: path.to_string(),
            }
        } else {
            Self::Io {
                path: path.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// File access capabilities required by the platform components.
pub trait FileSystem {
    /// Reads a file as raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::NotFound`] when the file is missing.
    fn read(&self, path: &Utf8Path) -> Result<Vec<u8>, FsError>;

    /// Reads a UTF-8 file.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::NotFound`] when the file is missing.
    fn read_to_string(&self, path: &Utf8Path) -> Result<String, FsError>;

    /// Writes `contents`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] when the file cannot be written.
    fn write(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError>;

    /// Reports whether a file or directory exists.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] when existence cannot be determined.
    fn exists(&self, path: &Utf8Path) -> Result<bool, FsError>;

    /// Reports whether `path` is an existing directory.
    fn is_dir(&self, path: &Utf8Path) -> bool;

    /// Creates a directory and all of its parents.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] when creation fails.
    fn create_dir_all(&self, path: &Utf8Path) -> Result<(), FsError>;

    /// Removes a file; removing an absent file succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] when removal fails.
    fn remove_file(&self, path: &Utf8Path) -> Result<(), FsError>;

    /// Removes a directory tree; removing an absent tree succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Io`] when removal fails.
    fn remove_dir_all(&self, path: &Utf8Path) -> Result<(), FsError>;

    /// Lists entry names in a directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::NotFound`] when the directory is missing.
    fn list_dir(&self, path: &Utf8Path) -> Result<Vec<String>, FsError>;
}

/// [`FileSystem`] backed by `cap-std` ambient directory handles.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostFileSystem;

impl HostFileSystem {
    fn open_parent(path: &Utf8Path) -> Result<(Dir, String), FsError> {
        let parent = path.parent().unwrap_or_else(|| Utf8Path::new("/"));
        let file_name = path.file_name().ok_or_else(|| FsError::Io {
            path: path.to_string(),
            message: String::from("path is missing a file name"),
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority())
            .map_err(|err| FsError::from_io(path, &err))?;
        Ok((dir, file_name.to_owned()))
    }
}

impl FileSystem for HostFileSystem {
    fn read(&self, path: &Utf8Path) -> Result<Vec<u8>, FsError> {
        let (dir, name) = Self::open_parent(path)?;
        dir.read(&name).map_err(|err| FsError::from_io(path, &err))
    }

    fn read_to_string(&self, path: &Utf8Path) -> Result<String, FsError> {
        let (dir, name) = Self::open_parent(path)?;
        dir.read_to_string(&name)
            .map_err(|err| FsError::from_io(path, &err))
    }

    fn write(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        let (dir, name) = Self::open_parent(path)?;
        dir.write(&name, contents)
            .map_err(|err| FsError::from_io(path, &err))
    }

    fn exists(&self, path: &Utf8Path) -> Result<bool, FsError> {
        if path.file_name().is_none() {
            return Ok(true);
        }
        match Self::open_parent(path) {
            Ok((dir, name)) => dir
                .try_exists(&name)
                .map_err(|err| FsError::from_io(path, &err)),
            Err(FsError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn is_dir(&self, path: &Utf8Path) -> bool {
        Dir::open_ambient_dir(path, ambient_authority()).is_ok()
    }

    fn create_dir_all(&self, path: &Utf8Path) -> Result<(), FsError> {
        Dir::create_ambient_dir_all(path, ambient_authority())
            .map_err(|err| FsError::from_io(path, &err))
    }

    fn remove_file(&self, path: &Utf8Path) -> Result<(), FsError> {
        match Self::open_parent(path) {
            Ok((dir, name)) => match dir.remove_file(&name) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(FsError::from_io(path, &err)),
            },
            Err(FsError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn remove_dir_all(&self, path: &Utf8Path) -> Result<(), FsError> {
        match Self::open_parent(path) {
            Ok((dir, name)) => match dir.remove_dir_all(&name) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(FsError::from_io(path, &err)),
            },
            Err(FsError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn list_dir(&self, path: &Utf8Path) -> Result<Vec<String>, FsError> {
        let dir = Dir::open_ambient_dir(path, ambient_authority())
            .map_err(|err| FsError::from_io(path, &err))?;
        let entries = dir.entries().map_err(|err| FsError::from_io(path, &err))?;
        let mut names = Vec::new();
        for entry in entries {
            let dir_entry = entry.map_err(|err| FsError::from_io(path, &err))?;
            names.push(
                dir_entry
                    .file_name()
                    .map_err(|err| FsError::from_io(path, &err))?,
            );
        }
        names.sort();
        Ok(names)
    }
}

/// Maps logical host paths onto the configured host root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostPaths {
    root: Utf8PathBuf,
}

impl HostPaths {
    /// Creates a mapping rooted at `root` (`/` on a real host).
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the configured host root.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Resolves a logical absolute path to its location under the host root.
    #[must_use]
    pub fn resolve(&self, logical: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        let path = logical.as_ref();
        if self.root.as_str() == "/" {
            return path.to_path_buf();
        }
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.root.join(relative)
    }
}

impl Default for HostPaths {
    fn default() -> Self {
        Self::new("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn utf8_root(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()))
    }

    #[rstest]
    #[case("/", "/etc/passwd", "/etc/passwd")]
    #[case("/tmp/host", "/etc/passwd", "/tmp/host/etc/passwd")]
    #[case("/tmp/host", "dev/sdb", "/tmp/host/dev/sdb")]
    fn resolve_joins_logical_paths_under_root(
        #[case] root: &str,
        #[case] logical: &str,
        #[case] expected: &str,
    ) {
        let paths = HostPaths::new(root);
        assert_eq!(paths.resolve(logical), Utf8PathBuf::from(expected));
    }

    #[test]
    fn write_creates_parents_and_reads_back() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = utf8_root(&tmp).join("a/b/c.txt");
        let fs = HostFileSystem;

        fs.write(&path, b"hello")
            .unwrap_or_else(|err| panic!("write: {err}"));

        let contents = fs
            .read_to_string(&path)
            .unwrap_or_else(|err| panic!("read: {err}"));
        assert_eq!(contents, "hello");
        assert!(fs.exists(&path).unwrap_or_else(|err| panic!("exists: {err}")));
    }

    #[test]
    fn read_of_missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = utf8_root(&tmp).join("missing/file");
        let err = HostFileSystem
            .read(&path)
            .expect_err("missing file should fail");
        assert!(err.is_not_found(), "unexpected error: {err}");
    }

    #[test]
    fn remove_of_missing_paths_succeeds() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = utf8_root(&tmp);
        assert!(HostFileSystem.remove_file(&root.join("nope")).is_ok());
        assert!(HostFileSystem.remove_dir_all(&root.join("nope/deeper")).is_ok());
    }

    #[test]
    fn list_dir_returns_sorted_names() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = utf8_root(&tmp);
        for name in ["b", "a", "c"] {
            HostFileSystem
                .write(&root.join("dir").join(name), b"")
                .unwrap_or_else(|err| panic!("write {name}: {err}"));
        }
        let names = HostFileSystem
            .list_dir(&root.join("dir"))
            .unwrap_or_else(|err| panic!("list: {err}"));
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
