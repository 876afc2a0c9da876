//! `treekit_io_fs` v1:
//! Recursive filesystem tree operations with force-mode repair.
//!
//! Modules:
//! - `path`   : absolute path resolution and root detection
//! - `ensure` : create a directory and its missing ancestors
//! - `remove` : delete a file, symlink or directory tree
//! - `copy`   : mirror a file, symlink or directory tree
//! - `spec`   : enums/options/errors
//! - `util`   : shared primitive wrappers
//!
//! Every operation comes in a blocking form and an async (`tokio`) form that
//! share the same decision logic.

pub mod copy;
pub mod ensure;
pub mod path;
pub mod remove;
pub mod spec;
mod util;

pub use copy::{cp, cp_async, cp_async_with, cp_with};
pub use ensure::{ensure_dir, ensure_dir_async, ensure_dir_async_with, ensure_dir_with};
pub use path::resolve_path;
pub use remove::{rm, rm_async, rm_async_with, rm_with};
pub use spec::{
    EnumEntryKind, EnumFsErrorKind, FsTreeError, Result, SpecPlatform, SpecTreeOptions,
};
pub use util::inspect_entry_kind;
