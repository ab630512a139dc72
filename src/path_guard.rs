//! Sandbox checks for caller-supplied vault roots and document paths.
//!
//! [`validate`] is the single gate every filesystem operation passes
//! through. It never corrects a bad path; it reports why it was rejected.
//!
//! Resolution prefers the canonical form (symlinks resolved) and falls back
//! to a lexical normalization for paths that do not exist yet, so a missing
//! document surfaces later as `not_found` rather than here.

use std::path::{Component, Path, PathBuf};

use crate::error::{Result, VaultError};

/// Validate `root` and, when given, `relative` beneath it.
///
/// Returns the resolved absolute path: the root itself when `relative` is
/// `None` or empty, otherwise the resolved document path.
///
/// # Errors
///
/// - [`VaultError::InvalidPath`] when `root` is not absolute.
/// - [`VaultError::PathTraversal`] when either path contains a NUL byte,
///   `relative` contains `..` or `~`, or the resolved path leaves the root.
pub fn validate(root: &Path, relative: Option<&str>) -> Result<PathBuf> {
    if !root.is_absolute() {
        return Err(VaultError::InvalidPath(root.display().to_string()));
    }
    if root.to_string_lossy().contains('\0') {
        return Err(VaultError::PathTraversal("NUL byte in root".to_string()));
    }

    let canonical_root = resolve(root);

    let relative = match relative {
        Some(r) if !r.is_empty() => r,
        _ => return Ok(canonical_root),
    };

    if relative.contains('\0') {
        return Err(VaultError::PathTraversal("NUL byte in path".to_string()));
    }
    if relative.contains("..") || relative.contains('~') {
        return Err(VaultError::PathTraversal(relative.to_string()));
    }

    let target = resolve(&canonical_root.join(relative));
    if !target.starts_with(&canonical_root) {
        return Err(VaultError::PathTraversal(relative.to_string()));
    }

    Ok(target)
}

/// Convenience check for a root alone.
pub fn validate_root(root: &Path) -> Result<PathBuf> {
    validate(root, None)
}

fn resolve(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| normalize_lexically(path))
}

/// Collapse `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vault() -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("notes")).unwrap();
        std::fs::write(tmp.path().join("notes/a.md"), "# A").unwrap();
        tmp
    }

    #[test]
    fn test_relative_root_rejected() {
        let err = validate(Path::new("notes/vault"), None).unwrap_err();
        assert_eq!(err.code(), "invalid_path");
    }

    #[test]
    fn test_root_alone_ok() {
        let tmp = vault();
        let resolved = validate(tmp.path(), None).unwrap();
        assert!(resolved.is_absolute());
    }

    #[test]
    fn test_nested_path_ok() {
        let tmp = vault();
        let resolved = validate(tmp.path(), Some("notes/a.md")).unwrap();
        assert!(resolved.ends_with("notes/a.md"));
        assert!(resolved.starts_with(validate_root(tmp.path()).unwrap()));
    }

    #[test]
    fn test_missing_file_still_validates() {
        let tmp = vault();
        assert!(validate(tmp.path(), Some("notes/missing.md")).is_ok());
    }

    #[test]
    fn test_dotdot_rejected() {
        let tmp = vault();
        for bad in ["../etc/passwd", "notes/../../x.md", "notes/..", "a..b.md"] {
            let err = validate(tmp.path(), Some(bad)).unwrap_err();
            assert_eq!(err.code(), "path_traversal", "expected rejection for {}", bad);
        }
    }

    #[test]
    fn test_tilde_rejected() {
        let tmp = vault();
        let err = validate(tmp.path(), Some("~/secrets.md")).unwrap_err();
        assert_eq!(err.code(), "path_traversal");
    }

    #[test]
    fn test_nul_byte_rejected() {
        let tmp = vault();
        let err = validate(tmp.path(), Some("notes/a.md\0.png")).unwrap_err();
        assert_eq!(err.code(), "path_traversal");

        let err = validate(Path::new("/tmp/vault\0"), None).unwrap_err();
        assert_eq!(err.code(), "path_traversal");
    }

    #[test]
    fn test_absolute_relative_escapes() {
        let tmp = vault();
        let err = validate(tmp.path(), Some("/etc/passwd")).unwrap_err();
        assert_eq!(err.code(), "path_traversal");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.md"), "secret").unwrap();
        let tmp = vault();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();
        let err = validate(tmp.path(), Some("link/secret.md")).unwrap_err();
        assert_eq!(err.code(), "path_traversal");
    }

    #[test]
    fn test_normalize_lexically() {
        let p = normalize_lexically(Path::new("/a/./b/../c"));
        assert_eq!(p, PathBuf::from("/a/c"));
    }

    #[test]
    fn test_deterministic() {
        let tmp = vault();
        let a = validate(tmp.path(), Some("notes/a.md")).unwrap();
        let b = validate(tmp.path(), Some("notes/a.md")).unwrap();
        assert_eq!(a, b);
    }
}
