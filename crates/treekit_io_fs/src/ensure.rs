//! Directory creation with ancestor recursion and force-mode repair.

use std::fs;
use std::io;
use std::path::Path;

use futures::future::{BoxFuture, FutureExt};

use crate::path::{resolve_path, root_of};
use crate::spec::{EnumEntryKind, FsTreeError, Result, SpecPlatform, SpecTreeOptions};
use crate::util::{
    inspect_entry_kind, inspect_entry_kind_async, is_dir_following_links,
    is_dir_following_links_async, is_existing_dir_race, is_existing_dir_race_async,
    relax_for_create, relax_for_create_async, unlink_entry, unlink_entry_async,
};

/// Create `dir_path` and every missing ancestor.
///
/// An existing directory (or a symlink resolving to one) is left untouched, so
/// repeated calls are no-ops. A non-directory entry on the way fails with
/// [`FsTreeError::ObstructionExists`] unless `if_force` is set, in which case
/// it is unlinked and replaced.
///
/// With `if_force`, a failed `mkdir` relaxes the parent's write bit and is
/// retried once.
pub fn ensure_dir<P: AsRef<Path>>(dir_path: P, if_force: bool) -> Result<()> {
    ensure_dir_with(dir_path, &SpecTreeOptions::with_force(if_force))
}

/// [`ensure_dir`] with explicit options.
pub fn ensure_dir_with<P: AsRef<Path>>(dir_path: P, spec_options: &SpecTreeOptions) -> Result<()> {
    let path_dir = resolve_path(dir_path);
    log::debug!(
        "ensure_dir {} (force={})",
        path_dir.display(),
        spec_options.if_force
    );
    ensure_dir_node(
        &path_dir,
        spec_options.if_force,
        &spec_options.spec_platform,
    )
}

/// Async variant of [`ensure_dir`].
pub async fn ensure_dir_async<P: AsRef<Path>>(dir_path: P, if_force: bool) -> Result<()> {
    ensure_dir_async_with(dir_path, &SpecTreeOptions::with_force(if_force)).await
}

/// Async variant of [`ensure_dir_with`].
pub async fn ensure_dir_async_with<P: AsRef<Path>>(
    dir_path: P,
    spec_options: &SpecTreeOptions,
) -> Result<()> {
    let path_dir = resolve_path(dir_path);
    log::debug!(
        "ensure_dir_async {} (force={})",
        path_dir.display(),
        spec_options.if_force
    );
    ensure_dir_node_async(
        &path_dir,
        spec_options.if_force,
        &spec_options.spec_platform,
    )
    .await
}

fn obstruction(path_dir: &Path) -> FsTreeError {
    FsTreeError::ObstructionExists {
        path: path_dir.to_path_buf(),
    }
}

fn check_drive_root(path_dir: &Path, spec_platform: &SpecPlatform) -> Result<()> {
    if !spec_platform.if_windows {
        return Ok(());
    }
    let path_root = root_of(path_dir);
    (spec_platform.check_root_reachable)(&path_root)
        .map_err(|source| FsTreeError::PlatformAccessDenied {
            path: path_root,
            source,
        })
}

async fn check_drive_root_async(path_dir: &Path, spec_platform: &SpecPlatform) -> Result<()> {
    if !spec_platform.if_windows {
        return Ok(());
    }
    let path_root = root_of(path_dir);
    let check_root_reachable = spec_platform.check_root_reachable;
    let path_root_owned = path_root.clone();
    tokio::task::spawn_blocking(move || check_root_reachable(&path_root_owned))
        .await
        .map_err(io::Error::other)
        .and_then(|res| res)
        .map_err(|source| FsTreeError::PlatformAccessDenied {
            path: path_root,
            source,
        })
}

/// Recursive body on an already resolved path.
pub(crate) fn ensure_dir_node(
    path_dir: &Path,
    if_force: bool,
    spec_platform: &SpecPlatform,
) -> Result<()> {
    match inspect_entry_kind(path_dir)? {
        EnumEntryKind::Directory => return Ok(()),
        EnumEntryKind::SymbolicLink if is_dir_following_links(path_dir) => return Ok(()),
        EnumEntryKind::Missing => {}
        EnumEntryKind::File | EnumEntryKind::SymbolicLink => {
            if !if_force {
                return Err(obstruction(path_dir));
            }
            log::debug!("Removing obstruction {}", path_dir.display());
            unlink_entry(path_dir).map_err(|e| FsTreeError::from_io(path_dir, e))?;
        }
    }

    check_drive_root(path_dir, spec_platform)?;

    let path_parent = path_dir.parent();
    if let Some(path_parent) = path_parent {
        ensure_dir_node(path_parent, if_force, spec_platform)?;
    }

    let err_create = match fs::create_dir(path_dir) {
        Ok(()) => return Ok(()),
        Err(e) if is_existing_dir_race(path_dir, &e) => return Ok(()),
        Err(e) => e,
    };
    if !if_force {
        return Err(FsTreeError::from_io(path_dir, err_create));
    }
    let Some(path_parent) = path_parent else {
        return Err(FsTreeError::from_io(path_dir, err_create));
    };

    log::warn!(
        "Creating {} failed ({err_create}); relaxing {} and retrying once",
        path_dir.display(),
        path_parent.display()
    );
    if let Err(e) = relax_for_create(path_parent, spec_platform) {
        log::warn!("Failed to relax {} ({e})", path_parent.display());
    }
    retry_create_result(path_dir, fs::create_dir(path_dir), is_dir_following_links(path_dir))
}

fn retry_create_result(path_dir: &Path, res_retry: io::Result<()>, if_dir_now: bool) -> Result<()> {
    match res_retry {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && if_dir_now => Ok(()),
        Err(e) => Err(FsTreeError::from_io(path_dir, e)),
    }
}

/// Async twin of [`ensure_dir_node`]; boxed because it recurses.
pub(crate) fn ensure_dir_node_async<'a>(
    path_dir: &'a Path,
    if_force: bool,
    spec_platform: &'a SpecPlatform,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let enum_kind = inspect_entry_kind_async(path_dir).await?;
        let if_link_to_dir = enum_kind == EnumEntryKind::SymbolicLink
            && is_dir_following_links_async(path_dir).await;
        match enum_kind {
            EnumEntryKind::Directory => return Ok(()),
            EnumEntryKind::SymbolicLink if if_link_to_dir => return Ok(()),
            EnumEntryKind::Missing => {}
            EnumEntryKind::File | EnumEntryKind::SymbolicLink => {
                if !if_force {
                    return Err(obstruction(path_dir));
                }
                log::debug!("Removing obstruction {}", path_dir.display());
                unlink_entry_async(path_dir)
                    .await
                    .map_err(|e| FsTreeError::from_io(path_dir, e))?;
            }
        }

        check_drive_root_async(path_dir, spec_platform).await?;

        let path_parent = path_dir.parent();
        if let Some(path_parent) = path_parent {
            ensure_dir_node_async(path_parent, if_force, spec_platform).await?;
        }

        let err_create = match tokio::fs::create_dir(path_dir).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if is_existing_dir_race_async(path_dir, &err_create).await {
            return Ok(());
        }
        if !if_force {
            return Err(FsTreeError::from_io(path_dir, err_create));
        }
        let Some(path_parent) = path_parent else {
            return Err(FsTreeError::from_io(path_dir, err_create));
        };

        log::warn!(
            "Creating {} failed ({err_create}); relaxing {} and retrying once",
            path_dir.display(),
            path_parent.display()
        );
        if let Err(e) = relax_for_create_async(path_parent, spec_platform).await {
            log::warn!("Failed to relax {} ({e})", path_parent.display());
        }
        let res_retry = tokio::fs::create_dir(path_dir).await;
        let if_dir_now = is_dir_following_links_async(path_dir).await;
        retry_create_result(path_dir, res_retry, if_dir_now)
    }
    .boxed()
}
