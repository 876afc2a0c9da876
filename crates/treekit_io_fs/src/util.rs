use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::Path;

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tokio::io::AsyncWriteExt;

use crate::spec::{EnumEntryKind, FsTreeError, Result, SpecPlatform};

////////////////////////////////////////////////////////////////////////////////
// #region EntryInspection

fn kind_from_file_type(file_type: fs::FileType) -> EnumEntryKind {
    if file_type.is_symlink() {
        EnumEntryKind::SymbolicLink
    } else if file_type.is_dir() {
        EnumEntryKind::Directory
    } else {
        EnumEntryKind::File
    }
}

fn kind_from_lstat(path: &Path, res_meta: io::Result<fs::Metadata>) -> Result<EnumEntryKind> {
    match res_meta {
        Ok(meta) => Ok(kind_from_file_type(meta.file_type())),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
            ) =>
        {
            Ok(EnumEntryKind::Missing)
        }
        Err(e) => Err(FsTreeError::from_io(path, e)),
    }
}

/// Link-aware inspection of `path`.
///
/// A missing entry (or a path running through a non-directory) is reported as
/// [`EnumEntryKind::Missing`]; any other stat failure is an error.
pub fn inspect_entry_kind<P: AsRef<Path>>(path: P) -> Result<EnumEntryKind> {
    let path = path.as_ref();
    kind_from_lstat(path, fs::symlink_metadata(path))
}

pub(crate) async fn inspect_entry_kind_async(path: &Path) -> Result<EnumEntryKind> {
    kind_from_lstat(path, tokio::fs::symlink_metadata(path).await)
}

pub(crate) fn is_dir_following_links(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|meta| meta.is_dir())
}

pub(crate) async fn is_dir_following_links_async(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_dir())
}

/// `mkdir` lost a race against another creator and the entry is now a directory.
pub(crate) fn is_existing_dir_race(path: &Path, err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::AlreadyExists && is_dir_following_links(path)
}

pub(crate) async fn is_existing_dir_race_async(path: &Path, err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::AlreadyExists && is_dir_following_links_async(path).await
}

pub(crate) fn list_child_names(path_dir: &Path) -> Result<Vec<OsString>> {
    let iter_entries = fs::read_dir(path_dir).map_err(|e| FsTreeError::from_io(path_dir, e))?;
    let mut l_names = Vec::new();
    for entry in iter_entries {
        let entry = entry.map_err(|e| FsTreeError::from_io(path_dir, e))?;
        l_names.push(entry.file_name());
    }
    Ok(l_names)
}

pub(crate) async fn list_child_names_async(path_dir: &Path) -> Result<Vec<OsString>> {
    let mut iter_entries = tokio::fs::read_dir(path_dir)
        .await
        .map_err(|e| FsTreeError::from_io(path_dir, e))?;
    let mut l_names = Vec::new();
    while let Some(entry) = iter_entries
        .next_entry()
        .await
        .map_err(|e| FsTreeError::from_io(path_dir, e))?
    {
        l_names.push(entry.file_name());
    }
    Ok(l_names)
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region PermissionRepair

/// Parent mode for the `ensure_dir` retry: add the write bit of whichever
/// class (owner, group, other) the caller falls into.
#[cfg(unix)]
pub(crate) fn compute_mode_for_create(
    n_mode: u32,
    n_uid_owner: u32,
    n_gid_owner: u32,
    spec_platform: &SpecPlatform,
) -> u32 {
    let n_bit_write = if spec_platform.uid == Some(n_uid_owner) {
        0o200
    } else if spec_platform.gid == Some(n_gid_owner) {
        0o020
    } else {
        0o002
    };
    (n_mode & 0o7777) | n_bit_write
}

fn permissions_for_create(meta: &fs::Metadata, spec_platform: &SpecPlatform) -> fs::Permissions {
    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        fs::Permissions::from_mode(compute_mode_for_create(
            meta.mode(),
            meta.uid(),
            meta.gid(),
            spec_platform,
        ))
    }
    #[cfg(not(unix))]
    {
        let _ = spec_platform;
        let mut perm = meta.permissions();
        perm.set_readonly(false);
        perm
    }
}

fn permissions_fully_open(meta: &fs::Metadata) -> fs::Permissions {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = meta;
        fs::Permissions::from_mode(0o777)
    }
    #[cfg(not(unix))]
    {
        let mut perm = meta.permissions();
        perm.set_readonly(false);
        perm
    }
}

pub(crate) fn relax_for_create(path_dir: &Path, spec_platform: &SpecPlatform) -> io::Result<()> {
    let meta = fs::metadata(path_dir)?;
    fs::set_permissions(path_dir, permissions_for_create(&meta, spec_platform))
}

pub(crate) async fn relax_for_create_async(
    path_dir: &Path,
    spec_platform: &SpecPlatform,
) -> io::Result<()> {
    let meta = tokio::fs::metadata(path_dir).await?;
    tokio::fs::set_permissions(path_dir, permissions_for_create(&meta, spec_platform)).await
}

/// Open `path` to rwx for everyone; returns the permissions it had before.
pub(crate) fn relax_fully(path: &Path) -> io::Result<fs::Permissions> {
    let meta = fs::metadata(path)?;
    fs::set_permissions(path, permissions_fully_open(&meta))?;
    Ok(meta.permissions())
}

pub(crate) async fn relax_fully_async(path: &Path) -> io::Result<fs::Permissions> {
    let meta = tokio::fs::metadata(path).await?;
    tokio::fs::set_permissions(path, permissions_fully_open(&meta)).await?;
    Ok(meta.permissions())
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region EntryPrimitives

/// Delete a non-directory entry; symlinks are removed, never followed.
pub(crate) fn unlink_entry(path: &Path) -> io::Result<()> {
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileTypeExt;
        if fs::symlink_metadata(path)?.file_type().is_symlink_dir() {
            return fs::remove_dir(path);
        }
    }
    fs::remove_file(path)
}

pub(crate) async fn unlink_entry_async(path: &Path) -> io::Result<()> {
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileTypeExt;
        if tokio::fs::symlink_metadata(path)
            .await?
            .file_type()
            .is_symlink_dir()
        {
            return tokio::fs::remove_dir(path).await;
        }
    }
    tokio::fs::remove_file(path).await
}

/// Recreate the link stored at `path_src` as `path_dst`, keeping its target text.
pub(crate) fn create_symbolic_link(path_src: &Path, path_dst: &Path) -> Result<()> {
    let target = fs::read_link(path_src).map_err(|e| FsTreeError::from_io(path_src, e))?;

    #[cfg(unix)]
    let res_link = std::os::unix::fs::symlink(&target, path_dst);
    #[cfg(windows)]
    let res_link = if is_dir_following_links(path_src) {
        std::os::windows::fs::symlink_dir(&target, path_dst)
    } else {
        std::os::windows::fs::symlink_file(&target, path_dst)
    };
    #[cfg(not(any(unix, windows)))]
    let res_link: io::Result<()> = {
        let _ = target;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Symbolic links are unsupported on this platform",
        ))
    };

    res_link.map_err(|e| FsTreeError::from_io(path_dst, e))
}

pub(crate) async fn create_symbolic_link_async(path_src: &Path, path_dst: &Path) -> Result<()> {
    let target = tokio::fs::read_link(path_src)
        .await
        .map_err(|e| FsTreeError::from_io(path_src, e))?;

    #[cfg(unix)]
    let res_link = tokio::fs::symlink(&target, path_dst).await;
    #[cfg(windows)]
    let res_link = if is_dir_following_links_async(path_src).await {
        tokio::fs::symlink_dir(&target, path_dst).await
    } else {
        tokio::fs::symlink_file(&target, path_dst).await
    };
    #[cfg(not(any(unix, windows)))]
    let res_link: io::Result<()> = {
        let _ = target;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Symbolic links are unsupported on this platform",
        ))
    };

    res_link.map_err(|e| FsTreeError::from_io(path_dst, e))
}

fn stream_error(path: &Path, source: io::Error) -> FsTreeError {
    FsTreeError::StreamError {
        path: path.to_path_buf(),
        source,
    }
}

/// Byte-for-byte stream copy; open, read and write failures are stream errors.
pub(crate) fn copy_file_stream(path_file_src: &Path, path_file_dst: &Path) -> Result<()> {
    let mut file_src = fs::File::open(path_file_src).map_err(|e| stream_error(path_file_src, e))?;
    let mut file_dst =
        fs::File::create(path_file_dst).map_err(|e| stream_error(path_file_dst, e))?;
    io::copy(&mut file_src, &mut file_dst).map_err(|e| stream_error(path_file_dst, e))?;
    Ok(())
}

pub(crate) async fn copy_file_stream_async(
    path_file_src: &Path,
    path_file_dst: &Path,
) -> Result<()> {
    let mut file_src = tokio::fs::File::open(path_file_src)
        .await
        .map_err(|e| stream_error(path_file_src, e))?;
    let mut file_dst = tokio::fs::File::create(path_file_dst)
        .await
        .map_err(|e| stream_error(path_file_dst, e))?;
    tokio::io::copy(&mut file_src, &mut file_dst)
        .await
        .map_err(|e| stream_error(path_file_dst, e))?;
    // tokio writes in the background until flushed
    file_dst
        .flush()
        .await
        .map_err(|e| stream_error(path_file_dst, e))?;
    Ok(())
}

/// Copy permission bits and access/modify times, plus xattrs on Linux.
pub(crate) fn apply_file_metadata(path_file_src: &Path, path_file_dst: &Path) -> io::Result<()> {
    use filetime::{FileTime, set_file_times};

    let stat_src = fs::metadata(path_file_src)?;
    fs::set_permissions(path_file_dst, stat_src.permissions())?;

    let file_time_access = FileTime::from_last_access_time(&stat_src);
    let file_time_modify = FileTime::from_last_modification_time(&stat_src);
    set_file_times(path_file_dst, file_time_access, file_time_modify)?;

    #[cfg(target_os = "linux")]
    copy_xattrs_linux(path_file_src, path_file_dst);
    Ok(())
}

// Best effort: filesystems without user xattr support are skipped silently.
#[cfg(target_os = "linux")]
fn copy_xattrs_linux(path_file_src: &Path, path_file_dst: &Path) {
    let iter_xattr_names = match xattr::list(path_file_src) {
        Ok(v) => v,
        Err(_) => return,
    };

    for name in iter_xattr_names {
        let Some(raw_value) = xattr::get(path_file_src, &name).ok().flatten() else {
            continue;
        };
        if let Err(e) = xattr::set(path_file_dst, &name, &raw_value) {
            log::debug!(
                "Skipped xattr {:?} on {} ({e})",
                name,
                path_file_dst.display()
            );
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Workers

/// Worker threads for blocking fan-out; `None` means sequential.
pub(crate) fn calculate_worker_limit(num_workers_max: Option<usize>) -> usize {
    let n_cpu = std::thread::available_parallelism()
        .map(|v| v.get())
        .unwrap_or(1);

    match num_workers_max {
        Some(n) => n.clamp(1, n_cpu),
        None => 1,
    }
}

/// Run `op` on a dedicated rayon pool when `n_workers > 1`.
///
/// `op` receives whether sibling fan-out may run in parallel; a pool that
/// fails to build degrades to sequential processing.
pub(crate) fn run_with_workers<T, F>(n_workers: usize, op: F) -> T
where
    T: Send,
    F: FnOnce(bool) -> T + Send,
{
    if n_workers <= 1 {
        return op(false);
    }
    match ThreadPoolBuilder::new().num_threads(n_workers).build() {
        Ok(thread_pool) => thread_pool.install(|| op(true)),
        Err(e) => {
            log::warn!(
                "Failed to initialize thread pool (workers={n_workers}); fallback to serial ({e})."
            );
            op(false)
        }
    }
}

/// Apply `op` to every child name, stopping at the first failure.
pub(crate) fn for_each_child<F>(l_names: &[OsString], if_parallel: bool, op: F) -> Result<()>
where
    F: Fn(&OsStr) -> Result<()> + Sync + Send,
{
    if if_parallel {
        l_names.par_iter().try_for_each(|name| op(name.as_os_str()))
    } else {
        l_names.iter().try_for_each(|name| op(name.as_os_str()))
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{calculate_worker_limit, inspect_entry_kind, list_child_names};
    use crate::spec::EnumEntryKind;

    #[test]
    fn inspect_entry_kind_reports_each_kind() {
        let tmp = TempDir::new().expect("tmp");
        let path_file = tmp.path().join("f.txt");
        std::fs::write(&path_file, "x").expect("write");

        assert_eq!(
            inspect_entry_kind(tmp.path()).expect("dir"),
            EnumEntryKind::Directory
        );
        assert_eq!(
            inspect_entry_kind(&path_file).expect("file"),
            EnumEntryKind::File
        );
        assert_eq!(
            inspect_entry_kind(tmp.path().join("absent")).expect("missing"),
            EnumEntryKind::Missing
        );
        // path running through a regular file
        assert_eq!(
            inspect_entry_kind(path_file.join("child")).expect("through file"),
            EnumEntryKind::Missing
        );

        #[cfg(unix)]
        {
            let path_link = tmp.path().join("dangling");
            std::os::unix::fs::symlink(tmp.path().join("nowhere"), &path_link).expect("symlink");
            assert_eq!(
                inspect_entry_kind(&path_link).expect("link"),
                EnumEntryKind::SymbolicLink
            );
        }
    }

    #[test]
    fn list_child_names_returns_immediate_children_only() {
        let tmp = TempDir::new().expect("tmp");
        std::fs::create_dir_all(tmp.path().join("a/deep")).expect("mkdir");
        std::fs::write(tmp.path().join("b.txt"), "b").expect("write");

        let mut l_names = list_child_names(tmp.path()).expect("list");
        l_names.sort();
        assert_eq!(l_names, vec!["a", "b.txt"]);
    }

    #[test]
    fn worker_limit_defaults_to_sequential() {
        assert_eq!(calculate_worker_limit(None), 1);
        assert_eq!(calculate_worker_limit(Some(0)), 1);
        assert!(calculate_worker_limit(Some(4)) >= 1);
    }

    #[cfg(unix)]
    #[test]
    fn create_mode_picks_write_bit_by_identity() {
        use super::compute_mode_for_create;
        use crate::spec::SpecPlatform;

        let spec_platform = SpecPlatform {
            uid: Some(1000),
            gid: Some(100),
            ..SpecPlatform::host()
        };
        assert_eq!(compute_mode_for_create(0o40555, 1000, 0, &spec_platform), 0o755);
        assert_eq!(compute_mode_for_create(0o40555, 0, 100, &spec_platform), 0o575);
        assert_eq!(compute_mode_for_create(0o40555, 0, 0, &spec_platform), 0o557);
    }
}
