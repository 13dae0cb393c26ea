//! Composing the local filesystem path a request targets.
//!
//! The target of every operation is `SRCPATH + url + uri`, string concatenation
//! rather than a path join, with no traversal check. [`resolve`] implements that
//! literally. [`resolve_checked`] instead canonicalizes the result and rejects
//! anything that escaped `SRCPATH`. The server binary defaults to `resolve_checked`;
//! `resolve` is kept and tested for parity with the documented baseline behavior.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

/// Concatenate `srcpath`, `url`, and `uri` with no normalization. The caller is
/// responsible for leading slashes in `uri`.
pub fn resolve(srcpath: &Path, url: &OsStr, uri: &OsStr) -> PathBuf {
    let mut s = srcpath.as_os_str().to_owned();
    s.push(url);
    s.push(uri);
    PathBuf::from(s)
}

/// Like [`resolve`], but canonicalizes the result and rejects any path that does not
/// remain under `srcpath`. Existence of the target is not required, only that every
/// existing ancestor component resolves under `srcpath`; this matches the common case
/// of creating a new file or directory under an existing export.
pub fn resolve_checked(srcpath: &Path, url: &OsStr, uri: &OsStr) -> io::Result<PathBuf> {
    let raw = resolve(srcpath, url, uri);
    let canonical_root = srcpath.canonicalize()?;

    // Canonicalize the nearest existing ancestor, then re-append whatever remaining
    // (possibly nonexistent) components followed it, so CREATE/MKDIR/RENAME-destination
    // targets that do not exist yet are still checked.
    let mut existing_ancestor: &Path = &raw;
    while !existing_ancestor.exists() {
        existing_ancestor = existing_ancestor
            .parent()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EACCES))?;
    }
    let canonical_ancestor = existing_ancestor.canonicalize()?;
    let remainder = raw
        .strip_prefix(existing_ancestor)
        .expect("existing_ancestor is an ancestor of raw by construction");
    let rebuilt = canonical_ancestor.join(remainder);

    if rebuilt.starts_with(&canonical_root) {
        Ok(rebuilt)
    } else {
        Err(io::Error::from_raw_os_error(libc::EACCES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_concatenates_without_normalizing() {
        let p = resolve(Path::new("/srv"), OsStr::new("/export"), OsStr::new("/a/b"));
        assert_eq!(p, Path::new("/srv/export/a/b"));
    }

    #[test]
    fn resolve_checked_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("export")).unwrap();
        let result = resolve_checked(
            tmp.path(),
            OsStr::new("/export"),
            OsStr::new("/../../etc/passwd"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn resolve_checked_allows_new_file_under_export() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("export")).unwrap();
        let result =
            resolve_checked(tmp.path(), OsStr::new("/export"), OsStr::new("/newfile")).unwrap();
        assert!(result.starts_with(tmp.path().canonicalize().unwrap()));
    }
}
