//! Recursive copy of a file, symlink or directory tree.

use std::path::{Path, PathBuf};

use futures::future::{BoxFuture, FutureExt, try_join_all};

use crate::ensure::{ensure_dir_node, ensure_dir_node_async};
use crate::path::{is_within, resolve_path};
use crate::remove::{remove_tree, remove_tree_async};
use crate::spec::{EnumEntryKind, FsTreeError, Result, SpecTreeOptions};
use crate::util::{
    apply_file_metadata, calculate_worker_limit, copy_file_stream, copy_file_stream_async,
    create_symbolic_link, create_symbolic_link_async, for_each_child, inspect_entry_kind,
    inspect_entry_kind_async, list_child_names, list_child_names_async, run_with_workers,
};

/// Copy `path_source` to `path_destination`, recursing into directories.
///
/// Behavior:
/// - a destination inside the source tree is rejected before anything is touched;
///   containment is decided per path component, so `/a/src2` is not inside
///   `/a/src` even though its text starts with it,
/// - an existing destination directory with a different base name receives the
///   source under its own name (`cp a.txt dir` lands on `dir/a.txt`),
/// - symlinks are recreated with the same target, files are stream-copied,
/// - an existing destination entry fails with [`FsTreeError::DestinationExists`]
///   unless `if_force` is set, in which case it is removed first; a destination
///   that contains the source is never removed and always fails that way.
///
/// Returns the effective destination path. A failure midway leaves whatever was
/// already copied in place.
pub fn cp<P, Q>(path_source: P, path_destination: Q, if_force: bool) -> Result<PathBuf>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    cp_with(
        path_source,
        path_destination,
        &SpecTreeOptions::with_force(if_force),
    )
}

/// [`cp`] with explicit options.
///
/// `if_preserve_metadata` copies permissions, timestamps and xattrs onto each
/// file; `num_workers_max` copies siblings on a rayon pool.
pub fn cp_with<P, Q>(
    path_source: P,
    path_destination: Q,
    spec_options: &SpecTreeOptions,
) -> Result<PathBuf>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let path_src = resolve_path(path_source);
    let path_dst = resolve_path(path_destination);
    check_outside_source(&path_src, &path_dst)?;

    // an uninspectable destination simply means no retargeting
    let enum_kind_dst = inspect_entry_kind(&path_dst).ok();
    let path_dst = derive_destination_path(&path_src, path_dst, enum_kind_dst);
    check_outside_source(&path_src, &path_dst)?;
    log::debug!(
        "cp {} -> {} (force={})",
        path_src.display(),
        path_dst.display(),
        spec_options.if_force
    );

    let n_workers = calculate_worker_limit(spec_options.num_workers_max);
    run_with_workers(n_workers, |if_parallel| {
        copy_node(&path_src, &path_dst, spec_options, if_parallel)
    })?;
    Ok(path_dst)
}

/// Async variant of [`cp`].
pub async fn cp_async<P, Q>(path_source: P, path_destination: Q, if_force: bool) -> Result<PathBuf>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    cp_async_with(
        path_source,
        path_destination,
        &SpecTreeOptions::with_force(if_force),
    )
    .await
}

/// Async variant of [`cp_with`]; siblings are always copied concurrently.
pub async fn cp_async_with<P, Q>(
    path_source: P,
    path_destination: Q,
    spec_options: &SpecTreeOptions,
) -> Result<PathBuf>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let path_src = resolve_path(path_source);
    let path_dst = resolve_path(path_destination);
    check_outside_source(&path_src, &path_dst)?;

    let enum_kind_dst = inspect_entry_kind_async(&path_dst).await.ok();
    let path_dst = derive_destination_path(&path_src, path_dst, enum_kind_dst);
    check_outside_source(&path_src, &path_dst)?;
    log::debug!(
        "cp_async {} -> {} (force={})",
        path_src.display(),
        path_dst.display(),
        spec_options.if_force
    );

    copy_node_async(&path_src, &path_dst, spec_options).await?;
    Ok(path_dst)
}

fn check_outside_source(path_src: &Path, path_dst: &Path) -> Result<()> {
    if is_within(path_dst, path_src) {
        return Err(FsTreeError::DestinationIsSubtreeOfSource {
            path_src: path_src.to_path_buf(),
            path_dst: path_dst.to_path_buf(),
        });
    }
    Ok(())
}

/// An existing destination may only be removed under force, and never when it
/// holds the source.
fn check_replaceable(path_src: &Path, path_dst: &Path, if_force: bool) -> Result<()> {
    if !if_force || is_within(path_src, path_dst) {
        return Err(FsTreeError::DestinationExists {
            path: path_dst.to_path_buf(),
        });
    }
    Ok(())
}

/// Retarget into an existing directory whose base name differs from the source's.
fn derive_destination_path(
    path_src: &Path,
    path_dst: PathBuf,
    enum_kind_dst: Option<EnumEntryKind>,
) -> PathBuf {
    if enum_kind_dst != Some(EnumEntryKind::Directory) {
        return path_dst;
    }
    match path_src.file_name() {
        Some(name_src) if path_dst.file_name() != Some(name_src) => path_dst.join(name_src),
        _ => path_dst,
    }
}

fn copy_node(
    path_src: &Path,
    path_dst: &Path,
    spec_options: &SpecTreeOptions,
    if_parallel: bool,
) -> Result<()> {
    std::fs::symlink_metadata(path_src).map_err(|e| FsTreeError::from_io(path_src, e))?;
    if let Some(path_parent_dst) = path_dst.parent() {
        ensure_dir_node(path_parent_dst, false, &spec_options.spec_platform)?;
    }
    if inspect_entry_kind(path_dst)? != EnumEntryKind::Missing {
        check_replaceable(path_src, path_dst, spec_options.if_force)?;
        remove_tree(path_dst, true, if_parallel)?;
    }

    match inspect_entry_kind(path_src)? {
        EnumEntryKind::Missing => Err(FsTreeError::not_found(path_src)),
        EnumEntryKind::SymbolicLink => create_symbolic_link(path_src, path_dst),
        EnumEntryKind::File => {
            copy_file_stream(path_src, path_dst)?;
            if spec_options.if_preserve_metadata {
                apply_file_metadata(path_src, path_dst).map_err(|source| FsTreeError::Io {
                    path: path_dst.to_path_buf(),
                    source,
                })?;
            }
            Ok(())
        }
        EnumEntryKind::Directory => {
            ensure_dir_node(path_dst, false, &spec_options.spec_platform)?;
            let l_names = list_child_names(path_src)?;
            for_each_child(&l_names, if_parallel, |name| {
                copy_node(
                    &path_src.join(name),
                    &path_dst.join(name),
                    spec_options,
                    if_parallel,
                )
            })
        }
    }
}

fn copy_node_async<'a>(
    path_src: &'a Path,
    path_dst: &'a Path,
    spec_options: &'a SpecTreeOptions,
) -> BoxFuture<'a, Result<()>> {
    async move {
        tokio::fs::symlink_metadata(path_src)
            .await
            .map_err(|e| FsTreeError::from_io(path_src, e))?;
        if let Some(path_parent_dst) = path_dst.parent() {
            ensure_dir_node_async(path_parent_dst, false, &spec_options.spec_platform).await?;
        }
        if inspect_entry_kind_async(path_dst).await? != EnumEntryKind::Missing {
            check_replaceable(path_src, path_dst, spec_options.if_force)?;
            remove_tree_async(path_dst, true).await?;
        }

        match inspect_entry_kind_async(path_src).await? {
            EnumEntryKind::Missing => Err(FsTreeError::not_found(path_src)),
            EnumEntryKind::SymbolicLink => create_symbolic_link_async(path_src, path_dst).await,
            EnumEntryKind::File => {
                copy_file_stream_async(path_src, path_dst).await?;
                if spec_options.if_preserve_metadata {
                    apply_file_metadata_async(path_src, path_dst).await?;
                }
                Ok(())
            }
            EnumEntryKind::Directory => {
                ensure_dir_node_async(path_dst, false, &spec_options.spec_platform).await?;
                let l_pairs = list_child_names_async(path_src)
                    .await?
                    .into_iter()
                    .map(|name| (path_src.join(&name), path_dst.join(&name)))
                    .collect::<Vec<_>>();
                try_join_all(
                    l_pairs.iter().map(|(path_child_src, path_child_dst)| {
                        copy_node_async(path_child_src, path_child_dst, spec_options)
                    }),
                )
                .await?;
                Ok(())
            }
        }
    }
    .boxed()
}

async fn apply_file_metadata_async(path_src: &Path, path_dst: &Path) -> Result<()> {
    let path_src_owned = path_src.to_path_buf();
    let path_dst_owned = path_dst.to_path_buf();
    tokio::task::spawn_blocking(move || apply_file_metadata(&path_src_owned, &path_dst_owned))
        .await
        .map_err(std::io::Error::other)
        .and_then(|res| res)
        .map_err(|source| FsTreeError::Io {
            path: path_dst.to_path_buf(),
            source,
        })
}
