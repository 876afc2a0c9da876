//! Pure path algebra used by every tree operation.
//!
//! Nothing here touches the filesystem except reading the current working
//! directory for relative inputs. Recursive steps derive parents and children
//! from the resolved path instead of resolving again.

use std::path::{Component, Path, PathBuf};

/// Resolve `path` to an absolute, normalized form.
///
/// Absolute inputs are normalized (`.` dropped, `..` collapsed, separators
/// rewritten for the platform). Relative inputs are joined onto the current
/// working directory first. `..` at the root stays at the root.
///
/// # Examples
/// ```
/// use std::path::Path;
/// use treekit_io_fs::resolve_path;
///
/// # #[cfg(unix)]
/// # {
/// assert_eq!(resolve_path("/a/./b/../c"), Path::new("/a/c"));
/// assert_eq!(resolve_path("/../a"), Path::new("/a"));
/// # }
/// ```
pub fn resolve_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        return normalize_components(path);
    }
    let path_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    normalize_components(&path_cwd.join(path))
}

fn normalize_components(path: &Path) -> PathBuf {
    let mut path_out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => path_out.push(prefix.as_os_str()),
            Component::RootDir => path_out.push(Component::RootDir),
            Component::CurDir => {}
            Component::ParentDir => {
                path_out.pop();
            }
            Component::Normal(part) => path_out.push(part),
        }
    }
    path_out
}

/// Filesystem root of the drive `path` lives on (`/` on Unix, `C:\` on Windows).
pub fn root_of(path: &Path) -> PathBuf {
    path.ancestors()
        .last()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.to_path_buf())
}

/// Whether a resolved path is the root of its drive.
pub fn is_filesystem_root(path: &Path) -> bool {
    path.parent().is_none()
}

/// Whether `path` equals `base` or lies underneath it, compared per component.
pub fn is_within(path: &Path, base: &Path) -> bool {
    path.starts_with(base)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{is_filesystem_root, is_within, resolve_path, root_of};

    #[cfg(unix)]
    #[test]
    fn resolve_path_normalizes_absolute_input() {
        assert_eq!(resolve_path("/a/./b/../c"), Path::new("/a/c"));
        assert_eq!(resolve_path("/a//b/"), Path::new("/a/b"));
        assert_eq!(resolve_path("/.."), Path::new("/"));
        assert_eq!(resolve_path("/"), Path::new("/"));
    }

    #[test]
    fn resolve_path_joins_relative_input_onto_cwd() {
        let path_cwd = std::env::current_dir().expect("cwd");
        let resolved = resolve_path("some/./nested/../leaf");
        assert!(resolved.is_absolute());
        assert_eq!(resolved, resolve_path(path_cwd.join("some").join("leaf")));
    }

    #[cfg(unix)]
    #[test]
    fn root_detection() {
        assert!(is_filesystem_root(Path::new("/")));
        assert!(!is_filesystem_root(Path::new("/tmp")));
        assert_eq!(root_of(Path::new("/a/b/c")), Path::new("/"));
    }

    #[test]
    fn is_within_compares_components_not_text() {
        assert!(is_within(Path::new("/a/src/nested"), Path::new("/a/src")));
        assert!(is_within(Path::new("/a/src"), Path::new("/a/src")));
        assert!(!is_within(Path::new("/a/src2"), Path::new("/a/src")));
    }
}
