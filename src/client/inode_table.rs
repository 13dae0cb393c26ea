//! Bridges `fuser`'s inode-addressed kernel callbacks to the wire protocol's
//! path-addressed requests. The wire protocol (and the server behind it) only ever
//! knows paths; `fuser::Filesystem` only ever hands us inode numbers plus a
//! child name, so every callback needs a table mapping one to the other, the same
//! role the teacher's own example filesystem serves for its in-memory backing
//! store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Inode number of the mounted root, fixed by the FUSE protocol itself.
pub const ROOT_INO: u64 = 1;

/// Maps inode numbers to the path (relative to the exported root) they name, and
/// back. Entries accumulate for the lifetime of the mount; there is no eviction on
/// `FORGET`, matching the reference client's lack of any inode cache at all (it is
/// a purely path-based implementation underneath).
pub struct InodeTable {
    next_ino: u64,
    path_by_ino: HashMap<u64, PathBuf>,
    ino_by_path: HashMap<PathBuf, u64>,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = InodeTable {
            next_ino: ROOT_INO + 1,
            path_by_ino: HashMap::new(),
            ino_by_path: HashMap::new(),
        };
        table.path_by_ino.insert(ROOT_INO, PathBuf::from("/"));
        table.ino_by_path.insert(PathBuf::from("/"), ROOT_INO);
        table
    }

    pub fn path(&self, ino: u64) -> Option<&Path> {
        self.path_by_ino.get(&ino).map(PathBuf::as_path)
    }

    /// Look up the child `name` under the directory named by `parent_ino`,
    /// returning its uri-relative path.
    pub fn child_path(&self, parent_ino: u64, name: &std::ffi::OsStr) -> Option<PathBuf> {
        let parent = self.path(parent_ino)?;
        Some(join_uri(parent, name))
    }

    /// Inode number of `ino`'s parent directory, for synthesizing `".."` entries in
    /// `readdir`. The root is its own parent, matching every real filesystem's
    /// convention of not letting `..` escape the mount.
    pub fn parent_ino(&mut self, ino: u64) -> Option<u64> {
        if ino == ROOT_INO {
            return Some(ROOT_INO);
        }
        let path = self.path(ino)?.to_path_buf();
        let parent = path.parent().unwrap_or(Path::new("/")).to_path_buf();
        Some(self.intern(parent))
    }

    /// Assign (or reuse) an inode number for `path`.
    pub fn intern(&mut self, path: PathBuf) -> u64 {
        if let Some(&ino) = self.ino_by_path.get(&path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.ino_by_path.insert(path.clone(), ino);
        self.path_by_ino.insert(ino, path);
        ino
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Join a uri-relative directory path with a child name, keeping the `/`-separated,
/// non-native-`PathBuf` style the wire protocol's `uri` field uses.
fn join_uri(parent: &Path, name: &std::ffi::OsStr) -> PathBuf {
    if parent == Path::new("/") {
        Path::new("/").join(name)
    } else {
        parent.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO), Some(Path::new("/")));
    }

    #[test]
    fn intern_is_stable_for_the_same_path() {
        let mut table = InodeTable::new();
        let a = table.intern(PathBuf::from("/docs/a.txt"));
        let b = table.intern(PathBuf::from("/docs/a.txt"));
        assert_eq!(a, b);
        assert_ne!(a, ROOT_INO);
    }

    #[test]
    fn child_path_joins_under_root_without_double_slash() {
        let table = InodeTable::new();
        let child = table.child_path(ROOT_INO, std::ffi::OsStr::new("docs")).unwrap();
        assert_eq!(child, Path::new("/docs"));
    }
}
