//! Path resolution over the dentry tree.

use crate::tree::DentryTree;
use newfs_error::{FsError, Result};
use newfs_inode::Volume;
use newfs_types::DentryId;

/// Split an absolute path into its components. Repeated separators are
/// ignored, so `"//a///b/"` yields `["a", "b"]` and `"/"` yields nothing.
pub fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument(format!(
            "path {path:?} must be absolute (start with /)"
        )));
    }
    Ok(path.split('/').filter(|c| !c.is_empty()).collect())
}

impl DentryTree {
    /// Walk `components` from the root, resolving each visited inode.
    fn walk(&mut self, vol: &mut Volume, components: &[&str]) -> Result<DentryId> {
        let mut current = self.root();
        for component in components {
            // NotDirectory surfaces here for a file used as a directory.
            self.load_children(vol, current)?;
            let child = self
                .find_child(current, component)
                .ok_or_else(|| FsError::NotFound((*component).to_owned()))?;
            self.resolve_inode(vol, child)?;
            current = child;
        }
        Ok(current)
    }

    /// Resolve `path` to its dentry. `"/"` returns the root without
    /// touching the device.
    pub fn resolve_path(&mut self, vol: &mut Volume, path: &str) -> Result<DentryId> {
        let components = split_path(path)?;
        self.walk(vol, &components)
    }

    /// Resolve every component but the last, returning the parent directory
    /// and the leaf name. The leaf itself need not exist.
    ///
    /// The root has no parent, so `"/"` fails with `Exists`.
    pub fn resolve_parent_and_leaf(
        &mut self,
        vol: &mut Volume,
        path: &str,
    ) -> Result<(DentryId, String)> {
        let components = split_path(path)?;
        let Some((leaf, prefix)) = components.split_last() else {
            return Err(FsError::Exists);
        };
        let parent = self.walk(vol, prefix)?;
        self.load_children(vol, parent)?;
        Ok((parent, (*leaf).to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_inode, volume};
    use newfs_types::{InodeNumber, S_IFDIR, S_IFREG};

    /// `/` -> `dir` -> `file`, built on disk and returned in a fresh tree.
    fn sample(vol: &mut Volume) -> DentryTree {
        let mut tree = DentryTree::new(InodeNumber(0));
        let root = tree.root();
        let dir = make_inode(vol, S_IFDIR | 0o755);
        let dir_ino = dir.ino;
        let dir_id = tree
            .add_entry(vol, root, "dir", dir_ino, S_IFDIR | 0o755, Some(dir))
            .unwrap();
        let file = make_inode(vol, S_IFREG | 0o644);
        tree.add_entry(vol, dir_id, "file", file.ino, S_IFREG | 0o644, Some(file))
            .unwrap();
        DentryTree::new(InodeNumber(0))
    }

    #[test]
    fn split_path_rules() {
        assert_eq!(split_path("/").unwrap(), Vec::<&str>::new());
        assert_eq!(split_path("//a///b/").unwrap(), ["a", "b"]);
        assert!(matches!(
            split_path("a/b"),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(split_path("").is_err());
    }

    #[test]
    fn resolves_nested_file() {
        let (_dev, mut vol) = volume();
        let mut tree = sample(&mut vol);
        let id = tree.resolve_path(&mut vol, "/dir/file").unwrap();
        assert_eq!(tree.node(id).name, "file");
        assert_eq!(tree.path_of(id), "/dir/file");
        let inode = tree.inode(id).unwrap();
        assert_eq!(inode.record.mode, S_IFREG | 0o644);
    }

    #[test]
    fn missing_component_is_not_found() {
        let (_dev, mut vol) = volume();
        let mut tree = sample(&mut vol);
        assert!(matches!(
            tree.resolve_path(&mut vol, "/dir/missing"),
            Err(FsError::NotFound(name)) if name == "missing"
        ));
        assert!(matches!(
            tree.resolve_path(&mut vol, "/nope/file"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn root_resolves_without_loading() {
        let (dev, mut vol) = volume();
        let mut tree = sample(&mut vol);
        let reads = dev.stats().reads;
        let id = tree.resolve_path(&mut vol, "/").unwrap();
        assert_eq!(id, tree.root());
        assert_eq!(dev.stats().reads, reads);
        assert!(tree.inode(id).is_none());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn file_as_directory_is_not_directory() {
        let (_dev, mut vol) = volume();
        let mut tree = sample(&mut vol);
        assert!(matches!(
            tree.resolve_path(&mut vol, "/dir/file/deeper"),
            Err(FsError::NotDirectory)
        ));
        assert!(matches!(
            tree.resolve_parent_and_leaf(&mut vol, "/dir/file/new"),
            Err(FsError::NotDirectory)
        ));
    }

    #[test]
    fn parent_and_leaf() {
        let (_dev, mut vol) = volume();
        let mut tree = sample(&mut vol);
        let (parent, leaf) = tree.resolve_parent_and_leaf(&mut vol, "/dir/new").unwrap();
        assert_eq!(tree.node(parent).name, "dir");
        assert_eq!(leaf, "new");
        assert!(tree.inode(parent).unwrap().children_loaded());

        let (parent, leaf) = tree.resolve_parent_and_leaf(&mut vol, "/top").unwrap();
        assert_eq!(parent, tree.root());
        assert_eq!(leaf, "top");

        assert!(matches!(
            tree.resolve_parent_and_leaf(&mut vol, "/"),
            Err(FsError::Exists)
        ));
        assert!(matches!(
            tree.resolve_parent_and_leaf(&mut vol, "/missing/leaf"),
            Err(FsError::NotFound(_))
        ));
    }
}
