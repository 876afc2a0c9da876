//! Recursive removal of files, symlinks and directory trees.
//!
//! Removal is post-order: children first, then the emptied directory. Under
//! force mode a missing entry counts as removed, and a permission failure on a
//! node is retried once with its parent opened up; the parent's mode is put
//! back afterwards. That chmod/act/chmod sequence is not atomic against other
//! processes touching the same parent.

use std::fs;
use std::path::Path;

use futures::future::{BoxFuture, FutureExt, try_join_all};

use crate::path::{is_filesystem_root, resolve_path};
use crate::spec::{EnumEntryKind, EnumFsErrorKind, FsTreeError, Result, SpecTreeOptions};
use crate::util::{
    calculate_worker_limit, for_each_child, inspect_entry_kind, inspect_entry_kind_async,
    list_child_names, list_child_names_async, relax_fully, relax_fully_async, run_with_workers,
    unlink_entry, unlink_entry_async,
};

/// Remove `path` and everything beneath it.
///
/// Fails with [`FsTreeError::RootDeletionForbidden`] on a filesystem root,
/// whatever `if_force` says. Without force a missing `path` is
/// [`FsTreeError::NotFound`]; with force it is a no-op.
pub fn rm<P: AsRef<Path>>(path: P, if_force: bool) -> Result<()> {
    rm_with(path, &SpecTreeOptions::with_force(if_force))
}

/// [`rm`] with explicit options; `num_workers_max` enables parallel siblings.
pub fn rm_with<P: AsRef<Path>>(path: P, spec_options: &SpecTreeOptions) -> Result<()> {
    let path_target = resolve_path(path);
    check_not_root(&path_target)?;
    log::debug!(
        "rm {} (force={})",
        path_target.display(),
        spec_options.if_force
    );

    let n_workers = calculate_worker_limit(spec_options.num_workers_max);
    run_with_workers(n_workers, |if_parallel| {
        remove_node(&path_target, spec_options.if_force, if_parallel)
    })
}

/// Async variant of [`rm`].
pub async fn rm_async<P: AsRef<Path>>(path: P, if_force: bool) -> Result<()> {
    rm_async_with(path, &SpecTreeOptions::with_force(if_force)).await
}

/// Async variant of [`rm_with`]; siblings are always removed concurrently.
pub async fn rm_async_with<P: AsRef<Path>>(path: P, spec_options: &SpecTreeOptions) -> Result<()> {
    let path_target = resolve_path(path);
    check_not_root(&path_target)?;
    log::debug!(
        "rm_async {} (force={})",
        path_target.display(),
        spec_options.if_force
    );
    remove_node_async(&path_target, spec_options.if_force).await
}

fn check_not_root(path_target: &Path) -> Result<()> {
    if is_filesystem_root(path_target) {
        return Err(FsTreeError::RootDeletionForbidden {
            path: path_target.to_path_buf(),
        });
    }
    Ok(())
}

/// Removal used by `cp` to clear an existing destination.
pub(crate) fn remove_tree(path_target: &Path, if_force: bool, if_parallel: bool) -> Result<()> {
    check_not_root(path_target)?;
    remove_node(path_target, if_force, if_parallel)
}

pub(crate) async fn remove_tree_async(path_target: &Path, if_force: bool) -> Result<()> {
    check_not_root(path_target)?;
    remove_node_async(path_target, if_force).await
}

/// What force mode does with a failure raised on `path` itself.
enum EnumRecovery {
    Absent,
    RetryWithParentRelaxed,
    Propagate,
}

fn classify_failure(path: &Path, err: &FsTreeError, if_force: bool) -> EnumRecovery {
    // failures of descendants were already handled one level down
    if !if_force || err.path() != path {
        return EnumRecovery::Propagate;
    }
    match err.kind() {
        EnumFsErrorKind::NotFound => EnumRecovery::Absent,
        EnumFsErrorKind::PermissionDenied => EnumRecovery::RetryWithParentRelaxed,
        _ => EnumRecovery::Propagate,
    }
}

fn remove_node(path: &Path, if_force: bool, if_parallel: bool) -> Result<()> {
    let err_first = match remove_node_once(path, if_force, if_parallel) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    match classify_failure(path, &err_first, if_force) {
        EnumRecovery::Absent => Ok(()),
        EnumRecovery::Propagate => Err(err_first),
        EnumRecovery::RetryWithParentRelaxed => {
            let Some(path_parent) = path.parent() else {
                return Err(err_first);
            };
            let perm_orig = match relax_fully(path_parent) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("Failed to relax {} ({e})", path_parent.display());
                    return Err(err_first);
                }
            };
            log::warn!(
                "Removing {} failed ({err_first}); retrying once with {} relaxed",
                path.display(),
                path_parent.display()
            );

            let res_retry = remove_node_once(path, if_force, if_parallel);
            if let Err(e) = fs::set_permissions(path_parent, perm_orig) {
                log::warn!(
                    "Failed to restore permissions on {} ({e})",
                    path_parent.display()
                );
            }
            res_retry
        }
    }
}

fn remove_node_once(path: &Path, if_force: bool, if_parallel: bool) -> Result<()> {
    match inspect_entry_kind(path)? {
        EnumEntryKind::Missing => Err(FsTreeError::not_found(path)),
        EnumEntryKind::File | EnumEntryKind::SymbolicLink => {
            unlink_entry(path).map_err(|e| FsTreeError::from_io(path, e))
        }
        EnumEntryKind::Directory => {
            if if_force && let Err(e) = relax_fully(path) {
                log::debug!("Could not open up {} ({e})", path.display());
            }
            let l_names = list_child_names(path)?;
            for_each_child(&l_names, if_parallel, |name| {
                remove_node(&path.join(name), if_force, if_parallel)
            })?;
            fs::remove_dir(path).map_err(|e| FsTreeError::from_io(path, e))
        }
    }
}

fn remove_node_async(path: &Path, if_force: bool) -> BoxFuture<'_, Result<()>> {
    async move {
        let err_first = match remove_node_once_async(path, if_force).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        match classify_failure(path, &err_first, if_force) {
            EnumRecovery::Absent => Ok(()),
            EnumRecovery::Propagate => Err(err_first),
            EnumRecovery::RetryWithParentRelaxed => {
                let Some(path_parent) = path.parent() else {
                    return Err(err_first);
                };
                let perm_orig = match relax_fully_async(path_parent).await {
                    Ok(v) => v,
                    Err(e) => {
                        log::warn!("Failed to relax {} ({e})", path_parent.display());
                        return Err(err_first);
                    }
                };
                log::warn!(
                    "Removing {} failed ({err_first}); retrying once with {} relaxed",
                    path.display(),
                    path_parent.display()
                );

                let res_retry = remove_node_once_async(path, if_force).await;
                if let Err(e) = tokio::fs::set_permissions(path_parent, perm_orig).await {
                    log::warn!(
                        "Failed to restore permissions on {} ({e})",
                        path_parent.display()
                    );
                }
                res_retry
            }
        }
    }
    .boxed()
}

fn remove_node_once_async(path: &Path, if_force: bool) -> BoxFuture<'_, Result<()>> {
    async move {
        match inspect_entry_kind_async(path).await? {
            EnumEntryKind::Missing => Err(FsTreeError::not_found(path)),
            EnumEntryKind::File | EnumEntryKind::SymbolicLink => unlink_entry_async(path)
                .await
                .map_err(|e| FsTreeError::from_io(path, e)),
            EnumEntryKind::Directory => {
                if if_force && let Err(e) = relax_fully_async(path).await {
                    log::debug!("Could not open up {} ({e})", path.display());
                }
                let l_paths_child = list_child_names_async(path)
                    .await?
                    .into_iter()
                    .map(|name| path.join(name))
                    .collect::<Vec<_>>();
                try_join_all(
                    l_paths_child
                        .iter()
                        .map(|path_child| remove_node_async(path_child, if_force)),
                )
                .await?;
                tokio::fs::remove_dir(path)
                    .await
                    .map_err(|e| FsTreeError::from_io(path, e))
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::{rm, rm_async, rm_with};
    use crate::spec::{EnumFsErrorKind, SpecTreeOptions};

    fn build_tree(path_root: &Path) {
        std::fs::create_dir_all(path_root.join("Level1/Level2/Level3")).expect("mkdir");
        std::fs::write(path_root.join("root.txt"), "root").expect("write");
        std::fs::write(path_root.join("Level1/a.txt"), "a").expect("write");
        std::fs::write(path_root.join("Level1/Level2/b.txt"), "b").expect("write");
    }

    #[test]
    fn rm_removes_nested_tree() {
        let tmp = TempDir::new().expect("tmp");
        let path_sandbox = tmp.path().join("sandbox");
        build_tree(&path_sandbox);

        rm(&path_sandbox, false).expect("rm");
        assert!(!path_sandbox.exists());
        assert!(tmp.path().exists());
    }

    #[test]
    fn rm_removes_single_file() {
        let tmp = TempDir::new().expect("tmp");
        let path_file = tmp.path().join("f.txt");
        std::fs::write(&path_file, "x").expect("write");

        rm(&path_file, false).expect("rm");
        assert!(!path_file.exists());
    }

    #[test]
    fn rm_missing_path_needs_force() {
        let tmp = TempDir::new().expect("tmp");
        let path_missing = tmp.path().join("I_DONT_EXIST");

        let err = rm(&path_missing, false).expect_err("must fail");
        assert_eq!(err.kind(), EnumFsErrorKind::NotFound);
        rm(&path_missing, true).expect("force is idempotent");
    }

    #[test]
    fn rm_refuses_filesystem_root() {
        let path_root = crate::path::root_of(&crate::path::resolve_path("."));
        for if_force in [false, true] {
            let err = rm(&path_root, if_force).expect_err("root must be refused");
            assert_eq!(err.kind(), EnumFsErrorKind::RootDeletionForbidden);
        }
    }

    #[cfg(unix)]
    #[test]
    fn rm_unlinks_symlink_without_touching_target() {
        let tmp = TempDir::new().expect("tmp");
        let path_target = tmp.path().join("target");
        build_tree(&path_target);
        let path_link = tmp.path().join("link");
        std::os::unix::fs::symlink(&path_target, &path_link).expect("symlink");

        rm(&path_link, false).expect("rm link");
        assert!(!path_link.is_symlink());
        assert!(path_target.join("Level1/a.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn rm_force_clears_read_only_directories() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("tmp");
        let path_sandbox = tmp.path().join("sandbox");
        build_tree(&path_sandbox);
        let path_locked = path_sandbox.join("Level1");
        std::fs::set_permissions(&path_locked, std::fs::Permissions::from_mode(0o500))
            .expect("chmod");

        if rustix::process::geteuid().as_raw() != 0 {
            let err = rm(&path_sandbox, false).expect_err("read-only dir must fail");
            assert_eq!(err.kind(), EnumFsErrorKind::PermissionDenied);
            assert!(path_locked.exists());
        }

        rm(&path_sandbox, true).expect("force");
        assert!(!path_sandbox.exists());
    }

    #[cfg(unix)]
    #[test]
    fn rm_force_retry_restores_parent_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("tmp");
        let path_parent = tmp.path().join("parent");
        std::fs::create_dir(&path_parent).expect("mkdir");
        let path_file = path_parent.join("f.txt");
        std::fs::write(&path_file, "x").expect("write");
        std::fs::set_permissions(&path_parent, std::fs::Permissions::from_mode(0o555))
            .expect("chmod");

        rm(&path_file, true).expect("force");
        assert!(!path_file.exists());
        let n_mode = std::fs::metadata(&path_parent)
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(n_mode & 0o777, 0o555);

        std::fs::set_permissions(&path_parent, std::fs::Permissions::from_mode(0o755))
            .expect("restore");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rm_async_force_retry_restores_parent_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("tmp");
        let path_parent = tmp.path().join("parent");
        std::fs::create_dir(&path_parent).expect("mkdir");
        let path_file = path_parent.join("f.txt");
        std::fs::write(&path_file, "x").expect("write");
        std::fs::set_permissions(&path_parent, std::fs::Permissions::from_mode(0o555))
            .expect("chmod");

        if rustix::process::geteuid().as_raw() != 0 {
            let err = rm_async(&path_file, false)
                .await
                .expect_err("read-only parent must fail");
            assert_eq!(err.kind(), EnumFsErrorKind::PermissionDenied);
            assert!(path_file.exists());
        }

        rm_async(&path_file, true).await.expect("force");
        assert!(!path_file.exists());
        let n_mode = std::fs::metadata(&path_parent)
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(n_mode & 0o777, 0o555);

        std::fs::set_permissions(&path_parent, std::fs::Permissions::from_mode(0o755))
            .expect("restore");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rm_async_force_clears_read_only_directories() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().expect("tmp");
        let path_sandbox = tmp.path().join("sandbox");
        build_tree(&path_sandbox);
        std::fs::set_permissions(
            path_sandbox.join("Level1"),
            std::fs::Permissions::from_mode(0o500),
        )
        .expect("chmod");

        rm_async(&path_sandbox, true).await.expect("force");
        assert!(!path_sandbox.exists());
    }

    #[test]
    fn rm_with_workers_removes_wide_tree() {
        let tmp = TempDir::new().expect("tmp");
        let path_sandbox = tmp.path().join("wide");
        for n_idx in 0..32 {
            let path_dir = path_sandbox.join(format!("d{n_idx:02}"));
            std::fs::create_dir_all(&path_dir).expect("mkdir");
            std::fs::write(path_dir.join("f.txt"), "x").expect("write");
        }

        let spec_options = SpecTreeOptions {
            num_workers_max: Some(4),
            ..SpecTreeOptions::default()
        };
        rm_with(&path_sandbox, &spec_options).expect("rm");
        assert!(!path_sandbox.exists());
    }

    #[tokio::test]
    async fn rm_async_removes_tree_and_honors_force() {
        let tmp = TempDir::new().expect("tmp");
        let path_sandbox = tmp.path().join("sandbox");
        build_tree(&path_sandbox);

        rm_async(&path_sandbox, false).await.expect("rm");
        assert!(!path_sandbox.exists());

        let err = rm_async(&path_sandbox, false)
            .await
            .expect_err("missing must fail");
        assert_eq!(err.kind(), EnumFsErrorKind::NotFound);
        rm_async(&path_sandbox, true).await.expect("force no-op");

        let err = rm_async("/", true).await.expect_err("root refused");
        assert_eq!(err.kind(), EnumFsErrorKind::RootDeletionForbidden);
    }
}
