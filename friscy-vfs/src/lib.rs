//! The in-memory virtual filesystem (spec.md §4.1, component C1).
//!
//! Entries are arena-indexed (see [`entry::EntryId`]) rather than
//! reference-counted, so hard links and pipe aliasing never need to form a
//! true pointer cycle (spec.md §9). All operations return negative-errno
//! compatible [`VfsError`]s; nothing in this crate touches guest memory —
//! `friscy-syscall` marshals bytes in and out via the `Machine` trait.

pub mod dirent;
pub mod entry;
pub mod fd;
pub mod tar;

use entry::{EntryId, FileType, VfsEntry};
use fd::{DirHandle, FdEntry, FdTable, FileHandle, OpenFlags, PipeEnd};
use generational_arena::Arena;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("file exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("bad file descriptor")]
    BadFd,
    #[error("invalid argument")]
    Invalid,
    #[error("permission denied")]
    Access,
    #[error("too many levels of symbolic links")]
    Loop,
    #[error("illegal seek")]
    Seek,
}

impl VfsError {
    /// Maps directly onto the negative-errno convention of spec.md §7.
    pub fn errno(self) -> i64 {
        use friscy_core::errno::*;
        match self {
            VfsError::NotFound => ENOENT,
            VfsError::NotDir => ENOTDIR,
            VfsError::IsDir => EISDIR,
            VfsError::Exists => EEXIST,
            VfsError::NotEmpty => ENOTEMPTY,
            VfsError::BadFd => EBADF,
            VfsError::Invalid => EINVAL,
            VfsError::Access => EACCES,
            VfsError::Loop => ELOOP,
            VfsError::Seek => ESPIPE,
        }
    }

    pub fn neg_errno(self) -> i64 {
        -self.errno()
    }
}

pub type VfsResult<T> = Result<T, VfsError>;

/// The virtual filesystem: an entry arena, the current working directory, and
/// the per-session fd table (spec.md §3).
pub struct Vfs {
    arena: Arena<VfsEntry>,
    root: EntryId,
    cwd: EntryId,
    pub fds: FdTable,
}

impl Vfs {
    pub fn empty() -> Self {
        let mut arena = Arena::new();
        let root = arena.insert(VfsEntry::new_dir("/", 0o755, None));
        Self {
            arena,
            root,
            cwd: root,
            fds: FdTable::new(),
        }
    }

    pub fn root(&self) -> EntryId {
        self.root
    }

    /// Directory entry backing an open directory fd, for `*at` syscalls that
    /// resolve relative to a `dirfd` rather than the cwd (spec.md §4.9).
    pub fn fd_dir_entry(&self, fd: i32) -> VfsResult<EntryId> {
        match self.fds.get(fd) {
            Some(FdEntry::Dir(d)) => Ok(d.entry),
            Some(FdEntry::File(_)) => Err(VfsError::NotDir),
            None => Err(VfsError::BadFd),
        }
    }

    /// Absolute path of an arena entry, for rebuilding a `dirfd`-relative
    /// path into one the ordinary cwd-relative operations accept.
    pub fn path_of_entry(&self, id: EntryId) -> String {
        self.path_of(id)
    }

    pub fn entry(&self, id: EntryId) -> Option<&VfsEntry> {
        self.arena.get(id)
    }

    pub fn entry_mut(&mut self, id: EntryId) -> Option<&mut VfsEntry> {
        self.arena.get_mut(id)
    }

    // === Path resolution (spec.md §4.1 "Symlink resolution") === //

    /// Resolve `path` (relative to cwd, or absolute) to an entry. Intermediate
    /// symlinks are always followed; the final component is followed only if
    /// `follow_symlinks`. Iterative with a depth limit of 16 (spec.md §8
    /// property 2: terminates within 16 link-follows or returns `Err(Loop)`).
    pub fn resolve(&self, path: &str, follow_symlinks: bool) -> VfsResult<EntryId> {
        let mut depth = 0u32;
        self.resolve_from(self.cwd, path, follow_symlinks, &mut depth)
    }

    fn resolve_from(
        &self,
        start: EntryId,
        path: &str,
        follow_symlinks: bool,
        depth: &mut u32,
    ) -> VfsResult<EntryId> {
        let mut cur = if path.starts_with('/') { self.root } else { start };
        let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if comps.is_empty() {
            return Ok(cur);
        }

        for (i, comp) in comps.iter().enumerate() {
            let is_last = i == comps.len() - 1;
            match *comp {
                "." => continue,
                ".." => {
                    cur = self
                        .arena
                        .get(cur)
                        .and_then(|e| e.parent)
                        .unwrap_or(self.root);
                    continue;
                }
                name => {
                    let dir_entry = self.arena.get(cur).ok_or(VfsError::NotFound)?;
                    let children = dir_entry.children.as_ref().ok_or(VfsError::NotDir)?;
                    let child = children.get(name).copied().ok_or(VfsError::NotFound)?;
                    let child_entry = self.arena.get(child).ok_or(VfsError::NotFound)?;

                    if child_entry.kind == FileType::Symlink && (follow_symlinks || !is_last) {
                        *depth += 1;
                        if *depth > 16 {
                            return Err(VfsError::Loop);
                        }
                        let target = child_entry.symlink_target.clone().unwrap_or_default();
                        let base = if target.starts_with('/') { self.root } else { cur };
                        cur = self.resolve_from(base, &target, true, depth)?;
                    } else {
                        cur = child;
                    }
                }
            }
        }
        Ok(cur)
    }

    /// `lstat` semantics: like `resolve(path, true)` but never dereferences
    /// the final path component.
    pub fn resolve_lstat(&self, path: &str) -> VfsResult<EntryId> {
        self.resolve(path, false)
    }

    fn split_parent(&self, path: &str) -> VfsResult<(EntryId, String)> {
        let trimmed = path.trim_end_matches('/');
        let (dir_path, leaf) = match trimmed.rsplit_once('/') {
            Some((d, l)) => (d, l),
            None => ("", trimmed),
        };
        if leaf.is_empty() {
            return Err(VfsError::Invalid);
        }
        let dir_path = if dir_path.is_empty() {
            if path.starts_with('/') {
                "/"
            } else {
                "."
            }
        } else {
            dir_path
        };
        let dir_id = self.resolve(dir_path, true)?;
        Ok((dir_id, leaf.to_string()))
    }

    fn link_child(&mut self, dir: EntryId, name: &str, child: EntryId) -> VfsResult<()> {
        let dir_entry = self.arena.get_mut(dir).ok_or(VfsError::NotFound)?;
        let children = dir_entry.children.as_mut().ok_or(VfsError::NotDir)?;
        children.insert(name.to_string(), child);
        Ok(())
    }

    fn unlink_child(&mut self, dir: EntryId, name: &str) -> VfsResult<EntryId> {
        let dir_entry = self.arena.get_mut(dir).ok_or(VfsError::NotFound)?;
        let children = dir_entry.children.as_mut().ok_or(VfsError::NotDir)?;
        children.remove(name).ok_or(VfsError::NotFound)
    }

    // === open / close / fd ops (spec.md §4.1) === //

    pub fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> VfsResult<i32> {
        let follow = true;
        match self.resolve(path, follow) {
            Ok(id) => {
                let entry = self.arena.get(id).ok_or(VfsError::NotFound)?;
                if entry.is_dir() && flags.writable() {
                    return Err(VfsError::IsDir);
                }
                if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
                    return Err(VfsError::Exists);
                }
                if flags.contains(OpenFlags::TRUNC) && flags.writable() {
                    if let Some(e) = self.arena.get_mut(id) {
                        e.content.clear();
                        e.size = 0;
                    }
                }
                let offset = if flags.contains(OpenFlags::APPEND) {
                    self.arena.get(id).map(|e| e.content.len() as u64).unwrap_or(0)
                } else {
                    0
                };
                Ok(self.fds.insert_new(FdEntry::File(FileHandle {
                    entry: id,
                    offset,
                    flags,
                    path: path.to_string(),
                    pipe_end: None,
                })))
            }
            Err(VfsError::NotFound) if flags.contains(OpenFlags::CREAT) => {
                let (dir, leaf) = self.split_parent(path)?;
                let id = self.arena.insert(VfsEntry::new_file(&leaf, mode, Some(dir)));
                self.link_child(dir, &leaf, id)?;
                Ok(self.fds.insert_new(FdEntry::File(FileHandle {
                    entry: id,
                    offset: 0,
                    flags,
                    path: path.to_string(),
                    pipe_end: None,
                })))
            }
            Err(e) => Err(e),
        }
    }

    pub fn opendir(&mut self, path: &str) -> VfsResult<i32> {
        let id = self.resolve(path, true)?;
        let entry = self.arena.get(id).ok_or(VfsError::NotFound)?;
        if !entry.is_dir() {
            return Err(VfsError::NotDir);
        }
        let mut names: Vec<String> = entry.children.as_ref().unwrap().keys().cloned().collect();
        names.sort();
        Ok(self.fds.insert_new(FdEntry::Dir(DirHandle {
            entry: id,
            names,
            index: 0,
        })))
    }

    pub fn close(&mut self, fd: i32) -> VfsResult<()> {
        self.fds.remove(fd).ok_or(VfsError::BadFd).map(|_| ())
    }

    pub fn read(&mut self, fd: i32, buf: &mut [u8]) -> VfsResult<usize> {
        let handle = match self.fds.get_mut(fd) {
            Some(FdEntry::File(h)) => h,
            _ => return Err(VfsError::BadFd),
        };
        let entry = self.arena.get(handle.entry).ok_or(VfsError::BadFd)?;
        let off = handle.offset as usize;
        if off >= entry.content.len() {
            return Ok(0);
        }
        let n = buf.len().min(entry.content.len() - off);
        buf[..n].copy_from_slice(&entry.content[off..off + n]);
        handle.offset += n as u64;
        if handle.pipe_end.is_some() {
            // pipes are consumed: drop bytes already delivered to the reader
            let entry = self.arena.get_mut(handle.entry).unwrap();
            entry.content.drain(0..n);
            let handle = match self.fds.get_mut(fd) {
                Some(FdEntry::File(h)) => h,
                _ => unreachable!(),
            };
            handle.offset = 0;
        }
        Ok(n)
    }

    pub fn write(&mut self, fd: i32, buf: &[u8]) -> VfsResult<usize> {
        let (entry_id, append, is_pipe) = match self.fds.get(fd) {
            Some(FdEntry::File(h)) => (h.entry, h.flags.contains(OpenFlags::APPEND), h.pipe_end.is_some()),
            _ => return Err(VfsError::BadFd),
        };
        let entry = self.arena.get_mut(entry_id).ok_or(VfsError::BadFd)?;
        if is_pipe || append {
            entry.content.extend_from_slice(buf);
            entry.size = entry.content.len() as u64;
        } else {
            let handle = match self.fds.get(fd) {
                Some(FdEntry::File(h)) => h,
                _ => unreachable!(),
            };
            let off = handle.offset as usize;
            if entry.content.len() < off + buf.len() {
                entry.content.resize(off + buf.len(), 0);
            }
            entry.content[off..off + buf.len()].copy_from_slice(buf);
            entry.size = entry.content.len() as u64;
        }
        if !is_pipe {
            if let Some(FdEntry::File(h)) = self.fds.get_mut(fd) {
                h.offset += buf.len() as u64;
            }
        }
        Ok(buf.len())
    }

    pub fn pread(&mut self, fd: i32, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let entry_id = match self.fds.get(fd) {
            Some(FdEntry::File(h)) => h.entry,
            _ => return Err(VfsError::BadFd),
        };
        let entry = self.arena.get(entry_id).ok_or(VfsError::BadFd)?;
        let off = offset as usize;
        if off >= entry.content.len() {
            return Ok(0);
        }
        let n = buf.len().min(entry.content.len() - off);
        buf[..n].copy_from_slice(&entry.content[off..off + n]);
        Ok(n)
    }

    pub fn pwrite(&mut self, fd: i32, buf: &[u8], offset: u64) -> VfsResult<usize> {
        let entry_id = match self.fds.get(fd) {
            Some(FdEntry::File(h)) => h.entry,
            _ => return Err(VfsError::BadFd),
        };
        let entry = self.arena.get_mut(entry_id).ok_or(VfsError::BadFd)?;
        let off = offset as usize;
        if entry.content.len() < off + buf.len() {
            entry.content.resize(off + buf.len(), 0);
        }
        entry.content[off..off + buf.len()].copy_from_slice(buf);
        entry.size = entry.content.len() as u64;
        Ok(buf.len())
    }

    pub fn lseek(&mut self, fd: i32, offset: i64, whence: i32) -> VfsResult<u64> {
        let handle = match self.fds.get_mut(fd) {
            Some(FdEntry::File(h)) => h,
            _ => return Err(VfsError::BadFd),
        };
        if handle.pipe_end.is_some() {
            return Err(VfsError::Seek);
        }
        let entry = self.arena.get(handle.entry).ok_or(VfsError::BadFd)?;
        let base: i64 = match whence {
            0 => 0,                          // SEEK_SET
            1 => handle.offset as i64,        // SEEK_CUR
            2 => entry.content.len() as i64,  // SEEK_END
            _ => return Err(VfsError::Invalid),
        };
        let new_off = base + offset;
        if new_off < 0 {
            return Err(VfsError::Invalid);
        }
        let handle = match self.fds.get_mut(fd) {
            Some(FdEntry::File(h)) => h,
            _ => unreachable!(),
        };
        handle.offset = new_off as u64;
        Ok(handle.offset)
    }

    /// Emit the next chunk of `getdents64`-encoded entries for directory fd
    /// `fd`, advancing the directory's iteration index (spec.md §4.1).
    pub fn getdents64(&mut self, fd: i32, max_len: usize) -> VfsResult<Vec<u8>> {
        let dir = match self.fds.get_mut(fd) {
            Some(FdEntry::Dir(d)) => d,
            Some(FdEntry::File(_)) => return Err(VfsError::NotDir),
            None => return Err(VfsError::BadFd),
        };
        let mut out = Vec::new();
        while dir.index < dir.names.len() {
            let name = &dir.names[dir.index];
            let child_id = match self
                .arena
                .get(dir.entry)
                .and_then(|e| e.children.as_ref())
                .and_then(|c| c.get(name))
            {
                Some(id) => *id,
                None => {
                    dir.index += 1;
                    continue;
                }
            };
            let d_type = self.arena.get(child_id).map(|e| e.kind.d_type()).unwrap_or(0);
            let record = dirent::encode_dirent64(dir.index as u64 + 1, name, d_type);
            if out.len() + record.len() > max_len && !out.is_empty() {
                break;
            }
            out.extend_from_slice(&record);
            dir.index += 1;
        }
        Ok(out)
    }

    pub fn readlink(&self, path: &str) -> VfsResult<String> {
        let id = self.resolve_lstat(path)?;
        let entry = self.arena.get(id).ok_or(VfsError::NotFound)?;
        entry.symlink_target.clone().ok_or(VfsError::Invalid)
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> VfsResult<()> {
        if self.resolve(path, true).is_ok() {
            return Err(VfsError::Exists);
        }
        let (dir, leaf) = self.split_parent(path)?;
        let id = self.arena.insert(VfsEntry::new_dir(&leaf, mode, Some(dir)));
        self.link_child(dir, &leaf, id)
    }

    pub fn unlink(&mut self, path: &str) -> VfsResult<()> {
        let id = self.resolve_lstat(path)?;
        let entry = self.arena.get(id).ok_or(VfsError::NotFound)?;
        if entry.is_dir() {
            return Err(VfsError::IsDir);
        }
        let (dir, leaf) = self.split_parent(path)?;
        self.unlink_child(dir, &leaf)?;
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> VfsResult<()> {
        let id = self.resolve(path, true)?;
        let entry = self.arena.get(id).ok_or(VfsError::NotFound)?;
        if !entry.is_dir() {
            return Err(VfsError::NotDir);
        }
        if !entry.children.as_ref().unwrap().is_empty() {
            return Err(VfsError::NotEmpty);
        }
        let (dir, leaf) = self.split_parent(path)?;
        self.unlink_child(dir, &leaf)?;
        Ok(())
    }

    pub fn symlink(&mut self, target: &str, link_path: &str) -> VfsResult<()> {
        if self.resolve_lstat(link_path).is_ok() {
            return Err(VfsError::Exists);
        }
        let (dir, leaf) = self.split_parent(link_path)?;
        let id = self.arena.insert(VfsEntry::new_symlink(&leaf, target, Some(dir)));
        self.link_child(dir, &leaf, id)
    }

    pub fn link(&mut self, existing: &str, new_path: &str) -> VfsResult<()> {
        let id = self.resolve(existing, false)?;
        if self.arena.get(id).unwrap().is_dir() {
            return Err(VfsError::IsDir);
        }
        if self.resolve_lstat(new_path).is_ok() {
            return Err(VfsError::Exists);
        }
        let (dir, leaf) = self.split_parent(new_path)?;
        self.link_child(dir, &leaf, id)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> VfsResult<()> {
        let id = self.resolve_lstat(from)?;
        let (from_dir, from_leaf) = self.split_parent(from)?;
        let (to_dir, to_leaf) = self.split_parent(to)?;
        self.unlink_child(from_dir, &from_leaf)?;
        self.link_child(to_dir, &to_leaf, id)?;
        if let Some(e) = self.arena.get_mut(id) {
            e.name = to_leaf;
            e.parent = Some(to_dir);
        }
        Ok(())
    }

    pub fn truncate(&mut self, path: &str, len: u64) -> VfsResult<()> {
        let id = self.resolve(path, true)?;
        self.truncate_entry(id, len)
    }

    pub fn ftruncate(&mut self, fd: i32, len: u64) -> VfsResult<()> {
        let id = match self.fds.get(fd) {
            Some(FdEntry::File(h)) => h.entry,
            _ => return Err(VfsError::BadFd),
        };
        self.truncate_entry(id, len)
    }

    fn truncate_entry(&mut self, id: EntryId, len: u64) -> VfsResult<()> {
        let entry = self.arena.get_mut(id).ok_or(VfsError::NotFound)?;
        if entry.is_dir() {
            return Err(VfsError::IsDir);
        }
        entry.content.resize(len as usize, 0);
        entry.size = len;
        Ok(())
    }

    pub fn dup(&mut self, fd: i32) -> VfsResult<i32> {
        let entry = self.fds.get(fd).cloned_entry().ok_or(VfsError::BadFd)?;
        Ok(self.fds.insert_new(entry))
    }

    pub fn dup2(&mut self, old_fd: i32, new_fd: i32) -> VfsResult<i32> {
        if old_fd == new_fd {
            return if self.fds.contains(old_fd) {
                Ok(new_fd)
            } else {
                Err(VfsError::BadFd)
            };
        }
        let entry = self.fds.get(old_fd).cloned_entry().ok_or(VfsError::BadFd)?;
        self.fds.insert_at(new_fd, entry);
        Ok(new_fd)
    }

    /// Create an anonymous pipe entry and open both ends; used by `pipe2` and
    /// directly by shell-style redirection setup (spec.md §4.1, §8 S4).
    pub fn pipe_open(&mut self) -> (i32, i32) {
        let id = self.arena.insert(VfsEntry::new_fifo("pipe", None));
        let read_fd = self.fds.insert_new(FdEntry::File(FileHandle {
            entry: id,
            offset: 0,
            flags: OpenFlags::RDONLY,
            path: "pipe:[r]".to_string(),
            pipe_end: Some(PipeEnd::Read),
        }));
        let write_fd = self.fds.insert_new(FdEntry::File(FileHandle {
            entry: id,
            offset: 0,
            flags: OpenFlags::WRONLY,
            path: "pipe:[w]".to_string(),
            pipe_end: Some(PipeEnd::Write),
        }));
        (read_fd, write_fd)
    }

    pub fn getcwd(&self) -> String {
        self.path_of(self.cwd)
    }

    pub fn chdir(&mut self, path: &str) -> VfsResult<()> {
        let id = self.resolve(path, true)?;
        let entry = self.arena.get(id).ok_or(VfsError::NotFound)?;
        if !entry.is_dir() {
            return Err(VfsError::NotDir);
        }
        self.cwd = id;
        Ok(())
    }

    fn path_of(&self, mut id: EntryId) -> String {
        let mut parts = Vec::new();
        while let Some(entry) = self.arena.get(id) {
            match entry.parent {
                Some(parent) => {
                    parts.push(entry.name.clone());
                    id = parent;
                }
                None => break,
            }
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }
}

trait OptFdEntryExt {
    fn cloned_entry(self) -> Option<FdEntry>;
}

impl OptFdEntryExt for Option<&FdEntry> {
    fn cloned_entry(self) -> Option<FdEntry> {
        self.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fd::OpenFlags;

    #[test]
    fn open_create_write_read_roundtrip() {
        let mut vfs = Vfs::empty();
        let fd = vfs
            .open("/hello.txt", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        assert_eq!(vfs.write(fd, b"hi there").unwrap(), 8);
        vfs.lseek(fd, 0, 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(vfs.read(fd, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"hi there");
    }

    #[test]
    fn mkdir_and_getdents_sorted() {
        let mut vfs = Vfs::empty();
        vfs.mkdir("/a", 0o755).unwrap();
        vfs.open("/b.txt", OpenFlags::CREAT, 0o644).unwrap();
        let dfd = vfs.opendir("/").unwrap();
        let raw = vfs.getdents64(dfd, 4096).unwrap();
        assert!(!raw.is_empty());
    }

    #[test]
    fn symlink_loop_terminates() {
        let mut vfs = Vfs::empty();
        vfs.symlink("/b", "/a").unwrap();
        vfs.symlink("/a", "/b").unwrap();
        let err = vfs.resolve("/a", true).unwrap_err();
        assert_eq!(err, VfsError::Loop);
    }

    #[test]
    fn symlink_relative_target_resolves_against_link_dir() {
        let mut vfs = Vfs::empty();
        vfs.mkdir("/etc", 0o755).unwrap();
        vfs.open("/etc/real", OpenFlags::CREAT, 0o644).unwrap();
        vfs.symlink("real", "/etc/link").unwrap();
        let a = vfs.resolve("/etc/real", true).unwrap();
        let b = vfs.resolve("/etc/link", true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn dup2_aliases_same_entry() {
        let mut vfs = Vfs::empty();
        let fd = vfs
            .open("/x", OpenFlags::CREAT | OpenFlags::RDWR, 0o644)
            .unwrap();
        vfs.write(fd, b"abc").unwrap();
        vfs.dup2(fd, 50).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(vfs.pread(50, &mut buf, 0).unwrap(), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn pipe_write_then_read_drains_buffer() {
        let mut vfs = Vfs::empty();
        let (r, w) = vfs.pipe_open();
        vfs.write(w, b"abc").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(vfs.read(r, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn rename_moves_entry_and_updates_name() {
        let mut vfs = Vfs::empty();
        vfs.open("/x", OpenFlags::CREAT, 0o644).unwrap();
        vfs.mkdir("/d", 0o755).unwrap();
        vfs.rename("/x", "/d/y").unwrap();
        assert!(vfs.resolve("/x", true).is_err());
        assert!(vfs.resolve("/d/y", true).is_ok());
    }
}
