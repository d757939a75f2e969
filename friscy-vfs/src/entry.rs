use generational_arena::Index;
use std::collections::BTreeMap;

/// Identifies a [`VfsEntry`] inside [`crate::Vfs`]'s arena. Entries form a
/// tree (with aliasing for hard links and pipes) addressed by index rather
/// than by `Rc`/`Weak` pointers, per spec.md §9 ("Cyclic VFS via index
/// arenas") — pipe aliasing would otherwise make parent/child pointers form
/// genuine cycles.
pub type EntryId = Index;

/// Linux file-type tag, also used to compute `getdents64`'s `d_type` (spec.md §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileType {
    /// Linux `dirent64::d_type` value for this file type.
    pub fn d_type(self) -> u8 {
        match self {
            FileType::Fifo => 1,
            FileType::CharDevice => 2,
            FileType::Directory => 4,
            FileType::BlockDevice => 6,
            FileType::Regular => 8,
            FileType::Symlink => 10,
            FileType::Socket => 12,
        }
    }

    /// The `S_IF*` bits ORed into `st_mode`/tar-derived mode.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::Fifo => 0o010000,
            FileType::CharDevice => 0o020000,
            FileType::Directory => 0o040000,
            FileType::BlockDevice => 0o060000,
            FileType::Regular => 0o100000,
            FileType::Symlink => 0o120000,
            FileType::Socket => 0o140000,
        }
    }
}

/// The VFS inode (spec.md §3, "VFS Entry"). Hard links and pipes alias a
/// single `VfsEntry` by sharing its [`EntryId`] across multiple directory
/// entries / file handles.
#[derive(Debug, Clone)]
pub struct VfsEntry {
    pub name: String,
    pub kind: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub symlink_target: Option<String>,
    pub content: Vec<u8>,
    /// `Some` iff `kind == Directory`; maps child name to its entry.
    pub children: Option<BTreeMap<String, EntryId>>,
    pub parent: Option<EntryId>,
}

impl VfsEntry {
    pub fn new_dir(name: impl Into<String>, mode: u32, parent: Option<EntryId>) -> Self {
        Self {
            name: name.into(),
            kind: FileType::Directory,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            symlink_target: None,
            content: Vec::new(),
            children: Some(BTreeMap::new()),
            parent,
        }
    }

    pub fn new_file(name: impl Into<String>, mode: u32, parent: Option<EntryId>) -> Self {
        Self {
            name: name.into(),
            kind: FileType::Regular,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            symlink_target: None,
            content: Vec::new(),
            children: None,
            parent,
        }
    }

    pub fn new_symlink(name: impl Into<String>, target: impl Into<String>, parent: Option<EntryId>) -> Self {
        Self {
            name: name.into(),
            kind: FileType::Symlink,
            mode: 0o777,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            symlink_target: Some(target.into()),
            content: Vec::new(),
            children: None,
            parent,
        }
    }

    pub fn new_fifo(name: impl Into<String>, parent: Option<EntryId>) -> Self {
        Self {
            name: name.into(),
            kind: FileType::Fifo,
            mode: 0o600,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            symlink_target: None,
            content: Vec::new(),
            children: None,
            parent,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, FileType::Directory)
    }
}
