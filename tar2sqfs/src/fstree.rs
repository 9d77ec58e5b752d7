//! The in-memory filesystem tree built from tar entries.
//!
//! Nodes live in an arena (`Vec<TreeNode>`); parents and children refer to
//! each other through [`NodeId`] indices, so the tree needs no owning
//! back-pointers. Node 0 is the root directory.
use std::fmt;

use bstr::{BStr, BString, ByteSlice};

use sqfs::data::FileId;
use sqfs::format::{S_IFDIR, S_IFMT};
use sqfs::xattr::XattrTable;

#[derive(Debug)]
pub enum TreeError {
    DuplicateEntry,
    NotADirectory,
    BadDefaults(&'static str),
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateEntry => f.pad("duplicate entry"),
            Self::NotADirectory => f.pad("intermediate path component is not a directory"),
            Self::BadDefaults(msg) => write!(f, "invalid --defaults: {msg}"),
        }
    }
}

impl std::error::Error for TreeError {}

/// Attributes applied to implicitly created directories, and (without
/// `--keep-time`) the timestamp stamped on everything.
#[derive(Debug, Clone, Copy)]
pub struct Defaults {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub mtime: u32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            mode: 0o755,
            mtime: 0,
        }
    }
}

impl Defaults {
    /// Parse the `--defaults` CSV: `uid=`, `gid=`, `mode=`, `mtime=`.
    /// Numbers accept the usual C bases (`0o755`-style leading zero,
    /// `0x`).
    pub fn parse(spec: &str) -> Result<Self, TreeError> {
        let mut out = Self::default();
        for opt in spec.split(',').filter(|o| !o.is_empty()) {
            let (key, value) = opt
                .split_once('=')
                .ok_or(TreeError::BadDefaults("expected key=value"))?;
            let value = parse_c_number(value).ok_or(TreeError::BadDefaults("invalid number"))?;
            match key {
                "uid" => out.uid = value,
                "gid" => out.gid = value,
                "mode" => out.mode = value & 0o7777,
                "mtime" => out.mtime = value,
                _ => return Err(TreeError::BadDefaults("unknown option")),
            }
        }
        Ok(out)
    }
}

fn parse_c_number(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if text.len() > 1 && text.starts_with('0') {
        u32::from_str_radix(&text[1..], 8).ok()
    } else {
        text.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

/// Type-specific part of a node.
#[derive(Debug)]
pub enum Payload {
    Dir { children: Vec<NodeId> },
    File { size: u64, data: Option<FileId> },
    Symlink(BString),
    /// Packed device number, see [`sqfs::format::encode_devno`].
    Device(u32),
    Ipc,
}

#[derive(Debug)]
pub struct TreeNode {
    pub name: BString,
    pub parent: Option<NodeId>,
    /// Full `S_IFMT | permission` bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
    pub link_count: u32,
    /// Assigned by [`FsTree::gen_inode_table`].
    pub inode_num: u32,
    /// Filled by the serializer once the inode is written.
    pub inode_ref: u64,
    /// Index into the xattr table, [`sqfs::format::NO_XATTR`] for none.
    pub xattr_idx: u32,
    implicit: bool,
    xattr_pairs: Vec<(u32, u32)>,
    pub payload: Payload,
}

impl TreeNode {
    fn new(name: BString, parent: Option<NodeId>, payload: Payload) -> Self {
        Self {
            name,
            parent,
            mode: 0,
            uid: 0,
            gid: 0,
            mtime: 0,
            link_count: 1,
            inode_num: 0,
            inode_ref: 0,
            xattr_idx: sqfs::format::NO_XATTR,
            implicit: false,
            xattr_pairs: Vec::new(),
            payload,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// Plain stat-like attributes of a tar entry.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u32,
}

#[derive(Debug)]
pub struct FsTree {
    nodes: Vec<TreeNode>,
    pub defaults: Defaults,
    pub xattrs: XattrTable,
    /// Inode-number order (post-order, root last); entry `i` has inode
    /// number `i + 1`.
    inode_order: Vec<NodeId>,
}

impl FsTree {
    #[must_use]
    pub fn new(defaults: Defaults) -> Self {
        let mut root = TreeNode::new(
            BString::default(),
            None,
            Payload::Dir {
                children: Vec::new(),
            },
        );
        root.mode = S_IFDIR | defaults.mode;
        root.uid = defaults.uid;
        root.gid = defaults.gid;
        root.mtime = defaults.mtime;
        root.implicit = true;
        Self {
            nodes: vec![root],
            defaults,
            xattrs: XattrTable::new(),
            inode_order: Vec::new(),
        }
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    #[must_use]
    pub fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id.0]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Insert `path`, materializing missing parents as implicit
    /// directories with the tree defaults.
    ///
    /// An empty path addresses the root: directory attributes merge into
    /// it, anything else is a duplicate. A directory inserted over an
    /// existing directory merges; the existing attributes win unless the
    /// existing node was implicit.
    pub fn insert(
        &mut self,
        path: &BStr,
        attrs: NodeAttrs,
        payload: Payload,
    ) -> Result<NodeId, TreeError> {
        let mut parent = NodeId::ROOT;
        let mut components = path.split_str("/").filter(|c| !c.is_empty()).peekable();

        if components.peek().is_none() {
            return self.merge_dir(NodeId::ROOT, attrs, payload);
        }

        while let Some(comp) = components.next() {
            let is_last = components.peek().is_none();
            let existing = self.lookup_child(parent, comp.as_bstr());

            if !is_last {
                parent = match existing {
                    Some(id) if self.nodes[id.0].is_dir() => id,
                    Some(_) => return Err(TreeError::NotADirectory),
                    None => self.add_implicit_dir(parent, comp.into()),
                };
                continue;
            }

            return match existing {
                Some(id) => self.merge_dir(id, attrs, payload),
                None => {
                    let id = self.add_child(parent, comp.into(), payload);
                    self.apply_attrs(id, attrs);
                    Ok(id)
                }
            };
        }
        unreachable!("loop returns on the last component");
    }

    fn merge_dir(
        &mut self,
        id: NodeId,
        attrs: NodeAttrs,
        payload: Payload,
    ) -> Result<NodeId, TreeError> {
        let node = &mut self.nodes[id.0];
        let both_dirs = node.is_dir() && matches!(payload, Payload::Dir { .. });
        if !both_dirs {
            return Err(TreeError::DuplicateEntry);
        }
        if node.implicit {
            self.apply_attrs(id, attrs);
            self.nodes[id.0].implicit = false;
        }
        Ok(id)
    }

    fn apply_attrs(&mut self, id: NodeId, attrs: NodeAttrs) {
        let node = &mut self.nodes[id.0];
        node.mode = attrs.mode;
        node.uid = attrs.uid;
        node.gid = attrs.gid;
        node.mtime = attrs.mtime;
    }

    fn lookup_child(&self, parent: NodeId, name: &BStr) -> Option<NodeId> {
        let Payload::Dir { children } = &self.nodes[parent.0].payload else {
            return None;
        };
        children
            .iter()
            .copied()
            .find(|&c| self.nodes[c.0].name.as_bstr() == name)
    }

    fn add_implicit_dir(&mut self, parent: NodeId, name: BString) -> NodeId {
        let defaults = self.defaults;
        let id = self.add_child(
            parent,
            name,
            Payload::Dir {
                children: Vec::new(),
            },
        );
        self.apply_attrs(
            id,
            NodeAttrs {
                mode: S_IFDIR | defaults.mode,
                uid: defaults.uid,
                gid: defaults.gid,
                mtime: defaults.mtime,
            },
        );
        self.nodes[id.0].implicit = true;
        id
    }

    fn add_child(&mut self, parent: NodeId, name: BString, payload: Payload) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(TreeNode::new(name, Some(parent), payload));
        let Payload::Dir { children } = &mut self.nodes[parent.0].payload else {
            unreachable!("parents are directories");
        };
        children.push(id);
        id
    }

    /// Record one extended attribute on a node; per-node duplicates
    /// collapse.
    pub fn add_xattr(&mut self, id: NodeId, key: &BStr, value: &[u8]) -> sqfs::Result<()> {
        let pair = self.xattrs.intern_pair(key, value)?;
        let node = &mut self.nodes[id.0];
        if !node.xattr_pairs.contains(&pair) {
            node.xattr_pairs.push(pair);
        }
        Ok(())
    }

    /// Collapse every node's attribute list to a deduplicated xattr
    /// index.
    pub fn dedup_xattr(&mut self) -> sqfs::Result<()> {
        for node in &mut self.nodes {
            let pairs = std::mem::take(&mut node.xattr_pairs);
            node.xattr_idx = self.xattrs.intern_set(pairs)?;
        }
        Ok(())
    }

    /// Sort every directory's children byte-wise by name.
    pub fn sort_recursive(&mut self) {
        for i in 0..self.nodes.len() {
            let Payload::Dir { children } = &self.nodes[i].payload else {
                continue;
            };
            let mut children = children.clone();
            children.sort_by(|&a, &b| self.nodes[a.0].name.cmp(&self.nodes[b.0].name));
            let Payload::Dir { children: slot } = &mut self.nodes[i].payload else {
                unreachable!();
            };
            *slot = children;
        }
    }

    /// Assign inode numbers in serialization order: each directory's
    /// subdirectories recurse first, then its children are numbered, and
    /// the root comes last. Numbers are contiguous from 1. Also settles
    /// link counts.
    pub fn gen_inode_table(&mut self) {
        let mut order = Vec::with_capacity(self.nodes.len());
        self.collect_children(NodeId::ROOT, &mut order);
        order.push(NodeId::ROOT);

        for (i, &id) in order.iter().enumerate() {
            self.nodes[id.0].inode_num = i as u32 + 1;
        }
        for node in &mut self.nodes {
            node.link_count = match &node.payload {
                Payload::Dir { children } => children.len() as u32 + 2,
                _ => 1,
            };
        }
        self.inode_order = order;
    }

    fn collect_children(&self, dir: NodeId, out: &mut Vec<NodeId>) {
        let Payload::Dir { children } = &self.nodes[dir.0].payload else {
            return;
        };
        for &child in children {
            if self.nodes[child.0].is_dir() {
                self.collect_children(child, out);
            }
        }
        out.extend(children.iter().copied());
    }

    /// Nodes in inode-number order (root last). Valid after
    /// [`FsTree::gen_inode_table`].
    #[must_use]
    pub fn inode_order(&self) -> &[NodeId] {
        &self.inode_order
    }

    /// The superblock's `inode_count`: the flat inode table keeps slot 0
    /// unused, and the stored count drops the two reserved root slots.
    #[must_use]
    pub fn inode_count_field(&self) -> u32 {
        (self.inode_order.len() + 1).saturating_sub(2) as u32
    }

    /// Whether a regular-file node still waits for its packed data.
    #[must_use]
    pub fn file_data(&self, id: NodeId) -> Option<FileId> {
        match self.nodes[id.0].payload {
            Payload::File { data, .. } => data,
            _ => None,
        }
    }

    /// Debug helper: the canonical path of a node.
    #[must_use]
    pub fn path_of(&self, id: NodeId) -> BString {
        let mut parts: Vec<&[u8]> = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let node = &self.nodes[c.0];
            if node.parent.is_some() {
                parts.push(node.name.as_bytes());
            }
            cur = node.parent;
        }
        parts.reverse();
        parts.join(&b"/"[..]).into()
    }
}

pub fn file_payload(size: u64) -> Payload {
    Payload::File { size, data: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqfs::format::S_IFREG;

    fn attrs(mode: u32) -> NodeAttrs {
        NodeAttrs {
            mode,
            uid: 1000,
            gid: 100,
            mtime: 1_600_000_000,
        }
    }

    #[test]
    fn deep_insert_creates_implicit_dirs() {
        let mut fs = FsTree::new(Defaults::default());
        let file = fs
            .insert(
                b"a/b/c.txt".as_bstr(),
                attrs(S_IFREG | 0o644),
                file_payload(10),
            )
            .unwrap();
        assert_eq!(fs.len(), 4);
        assert_eq!(fs.path_of(file), "a/b/c.txt");

        let b = fs.node(file).parent.unwrap();
        assert!(fs.node(b).is_dir());
        assert_eq!(fs.node(b).mode, S_IFDIR | 0o755);
        assert_eq!(fs.node(b).uid, 0);
    }

    #[test]
    fn explicit_dir_overwrites_implicit() {
        let mut fs = FsTree::new(Defaults::default());
        fs.insert(
            b"d/file".as_bstr(),
            attrs(S_IFREG | 0o644),
            file_payload(0),
        )
        .unwrap();
        let d = fs
            .insert(
                b"d".as_bstr(),
                attrs(S_IFDIR | 0o700),
                Payload::Dir {
                    children: Vec::new(),
                },
            )
            .unwrap();
        assert_eq!(fs.node(d).mode, S_IFDIR | 0o700);
        assert_eq!(fs.node(d).uid, 1000);

        // A second explicit record does not clobber the first.
        let again = fs
            .insert(
                b"d".as_bstr(),
                NodeAttrs {
                    uid: 9,
                    ..attrs(S_IFDIR | 0o555)
                },
                Payload::Dir {
                    children: Vec::new(),
                },
            )
            .unwrap();
        assert_eq!(again, d);
        assert_eq!(fs.node(d).mode, S_IFDIR | 0o700);
    }

    #[test]
    fn duplicates_and_bad_parents_fail() {
        let mut fs = FsTree::new(Defaults::default());
        fs.insert(b"x".as_bstr(), attrs(S_IFREG | 0o644), file_payload(0))
            .unwrap();
        assert!(matches!(
            fs.insert(b"x".as_bstr(), attrs(S_IFREG | 0o644), file_payload(0)),
            Err(TreeError::DuplicateEntry)
        ));
        assert!(matches!(
            fs.insert(b"x/y".as_bstr(), attrs(S_IFREG | 0o644), file_payload(0)),
            Err(TreeError::NotADirectory)
        ));
    }

    #[test]
    fn empty_path_merges_into_root() {
        let mut fs = FsTree::new(Defaults::default());
        let root = fs
            .insert(
                b"".as_bstr(),
                attrs(S_IFDIR | 0o711),
                Payload::Dir {
                    children: Vec::new(),
                },
            )
            .unwrap();
        assert_eq!(root, NodeId::ROOT);
        assert_eq!(fs.node(root).mode, S_IFDIR | 0o711);
        assert!(matches!(
            fs.insert(b"/".as_bstr(), attrs(S_IFREG | 0o644), file_payload(0)),
            Err(TreeError::DuplicateEntry)
        ));
    }

    #[test]
    fn sort_and_inode_numbering() {
        let mut fs = FsTree::new(Defaults::default());
        for path in ["zz", "sub/b", "sub/a", "aa"] {
            fs.insert(
                path.as_bytes().as_bstr(),
                attrs(S_IFREG | 0o644),
                file_payload(0),
            )
            .unwrap();
        }
        fs.sort_recursive();
        fs.gen_inode_table();

        let names: Vec<_> = fs
            .inode_order()
            .iter()
            .map(|&id| fs.path_of(id).to_string())
            .collect();
        // Subdirectory contents first, then the root's children in
        // sorted order, root itself last.
        assert_eq!(names, ["sub/a", "sub/b", "aa", "sub", "zz", ""]);

        let nums: Vec<_> = fs
            .inode_order()
            .iter()
            .map(|&id| fs.node(id).inode_num)
            .collect();
        assert_eq!(nums, [1, 2, 3, 4, 5, 6]);

        // Root: 1 subdir + 2 regular children + 2.
        assert_eq!(fs.node(NodeId::ROOT).link_count, 5);
        // Files link once.
        assert_eq!(fs.node(fs.inode_order()[0]).link_count, 1);
        // 6 nodes, table slot 0 unused, minus the reserved pair.
        assert_eq!(fs.inode_count_field(), 5);
    }

    #[test]
    fn xattr_sets_are_hash_consed() {
        let mut fs = FsTree::new(Defaults::default());
        let a = fs
            .insert(b"a".as_bstr(), attrs(S_IFREG | 0o644), file_payload(0))
            .unwrap();
        let b = fs
            .insert(b"b".as_bstr(), attrs(S_IFREG | 0o644), file_payload(0))
            .unwrap();
        let c = fs
            .insert(b"c".as_bstr(), attrs(S_IFREG | 0o644), file_payload(0))
            .unwrap();

        for id in [a, b] {
            fs.add_xattr(id, b"user.foo".as_bstr(), b"1").unwrap();
            fs.add_xattr(id, b"security.bar".as_bstr(), b"2").unwrap();
            // Duplicate pair on the same node collapses.
            fs.add_xattr(id, b"user.foo".as_bstr(), b"1").unwrap();
        }
        fs.add_xattr(c, b"user.foo".as_bstr(), b"other").unwrap();
        fs.dedup_xattr().unwrap();

        assert_eq!(fs.node(a).xattr_idx, fs.node(b).xattr_idx);
        assert_ne!(fs.node(a).xattr_idx, fs.node(c).xattr_idx);
        assert_eq!(fs.node(NodeId::ROOT).xattr_idx, sqfs::format::NO_XATTR);
    }

    #[test]
    fn defaults_parsing() {
        let d = Defaults::parse("uid=1000,gid=100,mode=0700,mtime=1234567890").unwrap();
        assert_eq!((d.uid, d.gid, d.mode, d.mtime), (1000, 100, 0o700, 1_234_567_890));
        assert_eq!(Defaults::parse("").unwrap().mode, 0o755);
        assert!(Defaults::parse("mode=rwx").is_err());
        assert!(Defaults::parse("color=red").is_err());
    }
}
