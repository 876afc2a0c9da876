//! Tree-operation option models and top-level error types.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

////////////////////////////////////////////////////////////////////////////////
// #region EnumsInit

/// Entry type reported by a link-aware stat at the instant of inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumEntryKind {
    /// Regular file, or any other node that is neither a directory nor a symlink.
    File,
    /// Symbolic link, never followed.
    SymbolicLink,
    /// Directory.
    Directory,
    /// Nothing exists at the path.
    Missing,
}

/// Flat failure tag of [`FsTreeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumFsErrorKind {
    NotFound,
    ObstructionExists,
    DestinationExists,
    DestinationIsSubtreeOfSource,
    RootDeletionForbidden,
    PermissionDenied,
    PlatformAccessDenied,
    StreamError,
    UnclassifiedOsError,
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region StructsAndErrors

/// Platform signal and process identity.
///
/// Only `ensure_dir` consults it: `if_windows` gates the drive-root check,
/// `check_root_reachable` performs it, and `uid`/`gid` pick which write bit
/// the force repair adds to a parent directory.
#[derive(Debug, Clone, Copy)]
pub struct SpecPlatform {
    /// Verify the drive root is reachable before creating directories.
    pub if_windows: bool,
    /// Reachability check run on the drive root when `if_windows` is set.
    pub check_root_reachable: fn(&Path) -> io::Result<()>,
    /// Effective user id of the calling process (Unix only).
    pub uid: Option<u32>,
    /// Effective group id of the calling process (Unix only).
    pub gid: Option<u32>,
}

impl SpecPlatform {
    /// Values of the running host.
    pub fn host() -> Self {
        #[cfg(unix)]
        {
            Self {
                if_windows: false,
                check_root_reachable: stat_root,
                uid: Some(rustix::process::geteuid().as_raw()),
                gid: Some(rustix::process::getegid().as_raw()),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                if_windows: cfg!(windows),
                check_root_reachable: stat_root,
                uid: None,
                gid: None,
            }
        }
    }
}

fn stat_root(path_root: &Path) -> io::Result<()> {
    std::fs::metadata(path_root).map(|_| ())
}

impl Default for SpecPlatform {
    fn default() -> Self {
        Self::host()
    }
}

/// Input options shared by `ensure_dir`, `rm` and `cp`.
#[derive(Debug, Clone)]
pub struct SpecTreeOptions {
    /// Repair obstructions and permission errors instead of surfacing them.
    pub if_force: bool,
    /// `cp` only: copy permission bits, timestamps and xattrs onto copied files.
    pub if_preserve_metadata: bool,
    /// Worker threads for sibling fan-out in the blocking `rm`/`cp`.
    /// `None` or `Some(1)` keeps siblings strictly sequential.
    pub num_workers_max: Option<usize>,
    /// Platform signal and process identity.
    pub spec_platform: SpecPlatform,
}

impl Default for SpecTreeOptions {
    fn default() -> Self {
        Self {
            if_force: false,
            if_preserve_metadata: false,
            num_workers_max: None,
            spec_platform: SpecPlatform::host(),
        }
    }
}

impl SpecTreeOptions {
    /// Default options with only the force flag set.
    pub fn with_force(if_force: bool) -> Self {
        Self {
            if_force,
            ..Self::default()
        }
    }
}

/// Failure of one tree operation, tagged with the path it occurred on.
#[derive(Debug, Error)]
pub enum FsTreeError {
    /// Entry does not exist.
    #[error("No such file or directory: {}", path.display())]
    NotFound {
        /// Missing path.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Entry exists where a directory was required.
    #[error("Entry exists and is not a directory: {}", path.display())]
    ObstructionExists {
        /// Obstructing entry.
        path: PathBuf,
    },
    /// Copy destination already exists and force mode is off.
    #[error("Destination already exists: {}", path.display())]
    DestinationExists {
        /// Existing destination entry.
        path: PathBuf,
    },
    /// Copy destination lies inside the source tree.
    #[error("{} is a sub-directory of {}", path_dst.display(), path_src.display())]
    DestinationIsSubtreeOfSource {
        /// Resolved source path.
        path_src: PathBuf,
        /// Resolved destination path.
        path_dst: PathBuf,
    },
    /// Removal target is the filesystem root of its drive.
    #[error("Destroying the filesystem root {} is forbidden", path.display())]
    RootDeletionForbidden {
        /// Root path.
        path: PathBuf,
    },
    /// Permission denied, after any repair attempt.
    #[error("Permission denied: {}", path.display())]
    PermissionDenied {
        /// Path the primitive failed on.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Drive root is unreachable.
    #[error("Drive root is not reachable: {}", path.display())]
    PlatformAccessDenied {
        /// Drive root.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Byte-stream copy failed to open, read or write.
    #[error("Stream copy failed at {}: {source}", path.display())]
    StreamError {
        /// Source or destination file.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Any other OS error, passed through.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path the primitive failed on.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
}

impl FsTreeError {
    /// Classify a primitive failure on `path`.
    pub fn from_io<P: Into<PathBuf>>(path: P, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => {
                Self::NotFound { path, source }
            }
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path, source },
            _ => Self::Io { path, source },
        }
    }

    pub(crate) fn not_found(path: &Path) -> Self {
        Self::NotFound {
            path: path.to_path_buf(),
            source: io::Error::from(io::ErrorKind::NotFound),
        }
    }

    /// Flat failure tag.
    pub fn kind(&self) -> EnumFsErrorKind {
        match self {
            Self::NotFound { .. } => EnumFsErrorKind::NotFound,
            Self::ObstructionExists { .. } => EnumFsErrorKind::ObstructionExists,
            Self::DestinationExists { .. } => EnumFsErrorKind::DestinationExists,
            Self::DestinationIsSubtreeOfSource { .. } => {
                EnumFsErrorKind::DestinationIsSubtreeOfSource
            }
            Self::RootDeletionForbidden { .. } => EnumFsErrorKind::RootDeletionForbidden,
            Self::PermissionDenied { .. } => EnumFsErrorKind::PermissionDenied,
            Self::PlatformAccessDenied { .. } => EnumFsErrorKind::PlatformAccessDenied,
            Self::StreamError { .. } => EnumFsErrorKind::StreamError,
            Self::Io { .. } => EnumFsErrorKind::UnclassifiedOsError,
        }
    }

    /// Path the failure occurred on (the destination for subtree rejection).
    pub fn path(&self) -> &Path {
        match self {
            Self::NotFound { path, .. }
            | Self::ObstructionExists { path }
            | Self::DestinationExists { path }
            | Self::RootDeletionForbidden { path }
            | Self::PermissionDenied { path, .. }
            | Self::PlatformAccessDenied { path, .. }
            | Self::StreamError { path, .. }
            | Self::Io { path, .. } => path,
            Self::DestinationIsSubtreeOfSource { path_dst, .. } => path_dst,
        }
    }
}

/// Result alias for tree operations.
pub type Result<T> = std::result::Result<T, FsTreeError>;

// #endregion
////////////////////////////////////////////////////////////////////////////////
