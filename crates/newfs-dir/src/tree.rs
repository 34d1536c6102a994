//! Dentry/inode tree cache.
//!
//! Nodes live in one arena and refer to each other by [`DentryId`]. A
//! directory's children form a singly linked list: the directory inode holds
//! the head (`first_child`) and each child links to the next via `sibling`.
//! Children are always prepended, so after a load the list runs in reverse
//! on-disk order.

use crate::entries::{append_entry, read_entries, validate_name};
use newfs_error::{FsError, Result};
use newfs_inode::{ChildrenState, InodeNode, Volume};
use newfs_ondisk::DentryRecord;
use newfs_types::{DEFAULT_DIR_PERM, DentryId, InodeNumber, S_IFDIR, mode_is_dir};

/// In-memory directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentryNode {
    pub name: String,
    pub ino: InodeNumber,
    pub mode: u32,
    pub parent: Option<DentryId>,
    pub sibling: Option<DentryId>,
    /// Resolved inode, cached for the rest of the session.
    pub inode: Option<InodeNode>,
}

impl DentryNode {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        mode_is_dir(self.mode)
    }
}

/// Arena holding every dentry materialized during a mount session.
#[derive(Debug, Clone)]
pub struct DentryTree {
    nodes: Vec<DentryNode>,
}

/// Iterator over a directory's child ids in sibling order.
#[derive(Debug)]
pub struct Children<'a> {
    tree: &'a DentryTree,
    next: Option<DentryId>,
}

impl Iterator for Children<'_> {
    type Item = DentryId;

    fn next(&mut self) -> Option<DentryId> {
        let id = self.next?;
        self.next = self.tree.node(id).sibling;
        Some(id)
    }
}

impl DentryTree {
    /// A tree holding only the synthesized root dentry `/`.
    #[must_use]
    pub fn new(root_ino: InodeNumber) -> Self {
        Self {
            nodes: vec![DentryNode {
                name: "/".to_owned(),
                ino: root_ino,
                mode: S_IFDIR | DEFAULT_DIR_PERM,
                parent: None,
                sibling: None,
                inode: None,
            }],
        }
    }

    #[must_use]
    pub fn root(&self) -> DentryId {
        DentryId::ROOT
    }

    /// Number of materialized dentries, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node by id. Ids are only ever issued by this tree.
    #[must_use]
    pub fn node(&self, id: DentryId) -> &DentryNode {
        &self.nodes[id.0]
    }

    /// Cached inode of `id`, if it has been resolved.
    #[must_use]
    pub fn inode(&self, id: DentryId) -> Option<&InodeNode> {
        self.nodes[id.0].inode.as_ref()
    }

    /// Children of `dir` in sibling order. Empty until the directory is loaded.
    #[must_use]
    pub fn children(&self, dir: DentryId) -> Children<'_> {
        Children {
            tree: self,
            next: self.inode(dir).and_then(|inode| inode.first_child),
        }
    }

    /// Full path of `id`, rebuilt from parent links.
    #[must_use]
    pub fn path_of(&self, id: DentryId) -> String {
        let mut parts = Vec::new();
        let mut cur = id;
        while let Some(parent) = self.node(cur).parent {
            parts.push(self.node(cur).name.as_str());
            cur = parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    fn push_child(&mut self, dir: DentryId, mut node: DentryNode) -> Result<DentryId> {
        self.nodes.try_reserve(1)?;
        let id = DentryId(self.nodes.len());
        let Some(dir_inode) = self.nodes[dir.0].inode.as_mut() else {
            return Err(FsError::InvalidArgument(format!(
                "dentry {dir} has no resolved inode"
            )));
        };
        node.parent = Some(dir);
        node.sibling = dir_inode.first_child;
        dir_inode.first_child = Some(id);
        if let Some(inode) = node.inode.as_mut() {
            inode.dentry = Some(id);
        }
        self.nodes.push(node);
        Ok(id)
    }

    /// Resolve and cache the inode behind `id`.
    ///
    /// Directories have their children loaded immediately. If that load
    /// fails the inode is not cached.
    pub fn resolve_inode(&mut self, vol: &mut Volume, id: DentryId) -> Result<&InodeNode> {
        if self.nodes[id.0].inode.is_none() {
            let mut inode = vol.read_inode(self.nodes[id.0].ino)?;
            inode.dentry = Some(id);
            let is_dir = inode.is_dir();
            self.nodes[id.0].inode = Some(inode);
            if is_dir {
                if let Err(err) = self.load_children(vol, id) {
                    self.nodes[id.0].inode = None;
                    return Err(err);
                }
            }
        }
        self.nodes[id.0]
            .inode
            .as_ref()
            .ok_or_else(|| FsError::InvalidArgument(format!("dentry {id} lost its inode")))
    }

    /// Materialize the entries of directory `dir`. Idempotent.
    pub fn load_children(&mut self, vol: &mut Volume, dir: DentryId) -> Result<()> {
        if self.nodes[dir.0].inode.is_none() {
            self.resolve_inode(vol, dir)?;
        }
        let Some(inode) = self.nodes[dir.0].inode.as_ref() else {
            return Err(FsError::InvalidArgument(format!(
                "dentry {dir} has no resolved inode"
            )));
        };
        if !inode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if inode.children_loaded() {
            return Ok(());
        }

        let records = read_entries(vol, &inode.record)?;
        let count = records.len();
        let mark = self.nodes.len();
        if let Err(err) = self.link_records(dir, records) {
            // Drop whatever was linked so a retry starts from an empty list.
            self.nodes.truncate(mark);
            if let Some(inode) = self.nodes[dir.0].inode.as_mut() {
                inode.first_child = None;
            }
            return Err(err);
        }
        if let Some(inode) = self.nodes[dir.0].inode.as_mut() {
            inode.children = ChildrenState::Loaded;
        }
        tracing::debug!(
            target: "newfs::dir",
            dir = self.nodes[dir.0].ino.0,
            children = count,
            "load_children"
        );
        Ok(())
    }

    fn link_records(&mut self, dir: DentryId, records: Vec<DentryRecord>) -> Result<()> {
        self.nodes.try_reserve(records.len())?;
        for record in records {
            self.push_child(
                dir,
                DentryNode {
                    name: record.name,
                    ino: record.ino,
                    mode: record.mode,
                    parent: None,
                    sibling: None,
                    inode: None,
                },
            )?;
        }
        Ok(())
    }

    /// Child of `dir` named `name`, if the loaded list has one.
    #[must_use]
    pub fn find_child(&self, dir: DentryId, name: &str) -> Option<DentryId> {
        self.children(dir).find(|id| self.node(*id).name == name)
    }

    /// Store a new entry in directory `dir` and link it into the tree.
    ///
    /// `child` is the already-written inode of the new entry, if the caller
    /// has it; it becomes the cached inode of the new dentry.
    pub fn add_entry(
        &mut self,
        vol: &mut Volume,
        dir: DentryId,
        name: &str,
        ino: InodeNumber,
        mode: u32,
        child: Option<InodeNode>,
    ) -> Result<DentryId> {
        validate_name(name)?;
        self.load_children(vol, dir)?;
        let record = DentryRecord {
            name: name.to_owned(),
            ino,
            mode,
        };
        // Reserve the arena slot first; once the record is on disk the link
        // below must not fail.
        self.nodes.try_reserve(1)?;
        let dir_inode = self.nodes[dir.0]
            .inode
            .as_mut()
            .ok_or(FsError::NotDirectory)?;
        append_entry(vol, dir_inode, &record)?;
        self.push_child(
            dir,
            DentryNode {
                name: record.name,
                ino,
                mode,
                parent: None,
                sibling: None,
                inode: child,
            },
        )
    }

    /// Tear the tree down at unmount, returning how many dentries it held.
    pub fn dispose(self) -> usize {
        let count = self.nodes.len();
        tracing::debug!(target: "newfs::dir", dentries = count, "dentry_tree_disposed");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entries::append_entry;
    use crate::testutil::{make_inode, volume};
    use newfs_types::{S_IFREG, mode_is_reg};

    fn names(tree: &DentryTree, dir: DentryId) -> Vec<String> {
        tree.children(dir)
            .map(|id| tree.node(id).name.clone())
            .collect()
    }

    #[test]
    fn new_tree_has_only_root() {
        let tree = DentryTree::new(InodeNumber(0));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.node(tree.root()).name, "/");
        assert!(tree.node(tree.root()).is_dir());
        assert!(tree.inode(tree.root()).is_none());
        assert_eq!(tree.path_of(tree.root()), "/");
    }

    #[test]
    fn resolving_a_directory_loads_children() {
        let (_dev, mut vol) = volume();
        let mut dir = vol.read_inode(InodeNumber(0)).unwrap();
        let rec = DentryRecord {
            name: "a".into(),
            ino: InodeNumber(5),
            mode: S_IFREG | 0o644,
        };
        append_entry(&mut vol, &mut dir, &rec).unwrap();

        let mut tree = DentryTree::new(InodeNumber(0));
        let root = tree.root();
        let inode = tree.resolve_inode(&mut vol, root).unwrap();
        assert!(inode.children_loaded());
        assert_eq!(inode.dentry, Some(root));
        let child = tree.find_child(root, "a").unwrap();
        assert_eq!(tree.node(child).ino, InodeNumber(5));
        assert_eq!(tree.node(child).parent, Some(root));
        assert!(tree.inode(child).is_none());
        assert!(tree.find_child(root, "missing").is_none());
    }

    #[test]
    fn loaded_siblings_run_in_reverse_insertion_order() {
        let (_dev, mut vol) = volume();
        let mut dir = vol.read_inode(InodeNumber(0)).unwrap();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let rec = DentryRecord {
                name: (*name).to_owned(),
                ino: InodeNumber(i as u32 + 1),
                mode: S_IFREG,
            };
            append_entry(&mut vol, &mut dir, &rec).unwrap();
        }

        let mut tree = DentryTree::new(InodeNumber(0));
        let root = tree.root();
        tree.load_children(&mut vol, root).unwrap();
        assert_eq!(names(&tree, root), ["c", "b", "a"]);

        // A second load is a no-op.
        tree.load_children(&mut vol, root).unwrap();
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn add_entry_round_trips_through_reload() {
        let (_dev, mut vol) = volume();
        let mut tree = DentryTree::new(InodeNumber(0));
        let root = tree.root();
        let mode = S_IFREG | 0o600;
        tree.add_entry(&mut vol, root, "a", InodeNumber(5), mode, None)
            .unwrap();

        let mut fresh = DentryTree::new(InodeNumber(0));
        fresh.load_children(&mut vol, root).unwrap();
        let id = fresh.find_child(root, "a").unwrap();
        assert_eq!(fresh.node(id).ino, InodeNumber(5));
        assert_eq!(fresh.node(id).mode, mode);
    }

    #[test]
    fn add_entry_prepends_and_links_child_inode() {
        let (_dev, mut vol) = volume();
        let mut tree = DentryTree::new(InodeNumber(0));
        let root = tree.root();
        let file = make_inode(&mut vol, S_IFREG | 0o644);
        let file_ino = file.ino;
        tree.add_entry(&mut vol, root, "x", InodeNumber(9), S_IFREG, None)
            .unwrap();
        let id = tree
            .add_entry(&mut vol, root, "f", file_ino, S_IFREG | 0o644, Some(file))
            .unwrap();

        assert_eq!(names(&tree, root), ["f", "x"]);
        let cached = tree.inode(id).unwrap();
        assert_eq!(cached.dentry, Some(id));
        assert!(mode_is_reg(cached.record.mode));
        assert_eq!(tree.path_of(id), "/f");
        assert_eq!(tree.inode(root).unwrap().record.size, 2 * 136);
    }

    #[test]
    fn file_children_are_not_a_directory() {
        let (_dev, mut vol) = volume();
        let mut tree = DentryTree::new(InodeNumber(0));
        let root = tree.root();
        let file = make_inode(&mut vol, S_IFREG | 0o644);
        let id = tree
            .add_entry(&mut vol, root, "f", file.ino, S_IFREG | 0o644, None)
            .unwrap();
        assert!(matches!(
            tree.load_children(&mut vol, id),
            Err(FsError::NotDirectory)
        ));
        assert!(matches!(
            tree.add_entry(&mut vol, id, "g", InodeNumber(3), S_IFREG, None),
            Err(FsError::NotDirectory)
        ));
        // The file inode was resolved and cached along the way.
        assert!(tree.inode(id).is_some());
    }

    #[test]
    fn unreadable_inode_stays_unresolved() {
        let (_dev, mut vol) = volume();
        let mut tree = DentryTree::new(InodeNumber(30));
        let root = tree.root();
        assert!(matches!(
            tree.resolve_inode(&mut vol, root),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(tree.inode(root).is_none());
    }

    #[test]
    fn failed_load_leaves_tree_unchanged_and_retries_cleanly() {
        let (_dev, mut vol) = volume();
        let mut dir = vol.read_inode(InodeNumber(0)).unwrap();
        let rec = DentryRecord {
            name: "a".into(),
            ino: InodeNumber(4),
            mode: S_IFREG | 0o644,
        };
        append_entry(&mut vol, &mut dir, &rec).unwrap();
        let good = dir.record.blocks[0];
        dir.record.blocks[0] = 5000;
        vol.write_inode(&dir).unwrap();

        let mut tree = DentryTree::new(InodeNumber(0));
        let root = tree.root();
        assert!(tree.resolve_inode(&mut vol, root).is_err());
        assert_eq!(tree.len(), 1);
        assert!(tree.inode(root).is_none());
        assert!(tree.add_entry(&mut vol, root, "b", InodeNumber(5), S_IFREG, None).is_err());
        assert_eq!(tree.len(), 1);

        dir.record.blocks[0] = good;
        vol.write_inode(&dir).unwrap();
        tree.load_children(&mut vol, root).unwrap();
        assert_eq!(names(&tree, root), ["a"]);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn dispose_counts_nodes() {
        let (_dev, mut vol) = volume();
        let mut tree = DentryTree::new(InodeNumber(0));
        let root = tree.root();
        tree.add_entry(&mut vol, root, "a", InodeNumber(1), S_IFREG, None)
            .unwrap();
        assert_eq!(tree.dispose(), 2);
    }
}
