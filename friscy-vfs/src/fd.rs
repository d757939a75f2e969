use crate::entry::EntryId;
use std::collections::BTreeMap;

bitflags::bitflags! {
    /// `open(2)`/`openat(2)` flags this VFS understands (spec.md §4.1).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY    = 0o0;
        const WRONLY    = 0o1;
        const RDWR      = 0o2;
        const CREAT     = 0o100;
        const EXCL      = 0o200;
        const TRUNC     = 0o1000;
        const APPEND    = 0o2000;
        const NONBLOCK  = 0o4000;
        const DIRECTORY = 0o200000;
        const CLOEXEC   = 0o2000000;
    }
}

impl OpenFlags {
    pub fn writable(self) -> bool {
        self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
    }
    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

/// An open regular/pipe fd (spec.md §3, "File Handle").
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub entry: EntryId,
    pub offset: u64,
    pub flags: OpenFlags,
    pub path: String,
    pub pipe_end: Option<PipeEnd>,
}

/// An open directory fd (spec.md §3, "Directory Handle").
#[derive(Debug, Clone)]
pub struct DirHandle {
    pub entry: EntryId,
    pub names: Vec<String>,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub enum FdEntry {
    File(FileHandle),
    Dir(DirHandle),
}

impl FdEntry {
    pub fn entry_id(&self) -> EntryId {
        match self {
            FdEntry::File(f) => f.entry,
            FdEntry::Dir(d) => d.entry,
        }
    }
}

/// Sparse fd -> handle map, starting allocation at fd 3 (spec.md §3, "Fd Table").
#[derive(Debug, Default)]
pub struct FdTable {
    pub(crate) table: BTreeMap<i32, FdEntry>,
    next_fd: i32,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            table: BTreeMap::new(),
            next_fd: 3,
        }
    }

    pub fn get(&self, fd: i32) -> Option<&FdEntry> {
        self.table.get(&fd)
    }

    pub fn get_mut(&mut self, fd: i32) -> Option<&mut FdEntry> {
        self.table.get_mut(&fd)
    }

    pub fn insert_new(&mut self, entry: FdEntry) -> i32 {
        while self.table.contains_key(&self.next_fd) {
            self.next_fd += 1;
        }
        let fd = self.next_fd;
        self.table.insert(fd, entry);
        self.next_fd += 1;
        fd
    }

    pub fn insert_at(&mut self, fd: i32, entry: FdEntry) {
        self.table.insert(fd, entry);
    }

    pub fn remove(&mut self, fd: i32) -> Option<FdEntry> {
        self.table.remove(&fd)
    }

    pub fn contains(&self, fd: i32) -> bool {
        self.table.contains_key(&fd)
    }

    /// Snapshot of every allocated fd, for fork-state save/restore (spec.md §4.8).
    pub fn snapshot_fds(&self) -> Vec<i32> {
        self.table.keys().copied().collect()
    }
}
