//! POSIX/UStar/GNU tar parsing and serialization (spec.md §4.1, §6).
//!
//! Walks 512-byte blocks, recognizes the GNU `././@LongLink` long-name
//! extension (typeflag `L`), honours the UStar `prefix` field on read, and
//! stops on two consecutive all-zero blocks. `save_tar` always re-emits long
//! names via the GNU extension rather than `prefix`, since spec.md §8's
//! round-trip property is defined over entries (name/mode/size/content/type),
//! not archive bytes.

use crate::entry::{EntryId, FileType, VfsEntry};
use crate::Vfs;
use generational_arena::Arena;

const BLOCK: usize = 512;

struct RawHeader<'a>(&'a [u8; BLOCK]);

fn octal(field: &[u8]) -> u64 {
    let s = field
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect::<String>();
    let s = s.trim();
    u64::from_str_radix(s, 8).unwrap_or(0)
}

fn cstr(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

impl<'a> RawHeader<'a> {
    fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
    fn name(&self) -> String {
        cstr(&self.0[0..100])
    }
    fn mode(&self) -> u32 {
        octal(&self.0[100..108]) as u32
    }
    fn uid(&self) -> u32 {
        octal(&self.0[108..116]) as u32
    }
    fn gid(&self) -> u32 {
        octal(&self.0[116..124]) as u32
    }
    fn size(&self) -> u64 {
        octal(&self.0[124..136])
    }
    fn mtime(&self) -> i64 {
        octal(&self.0[136..148]) as i64
    }
    fn typeflag(&self) -> u8 {
        self.0[156]
    }
    fn linkname(&self) -> String {
        cstr(&self.0[157..257])
    }
    fn prefix(&self) -> String {
        cstr(&self.0[345..500])
    }
    fn full_name(&self) -> String {
        let prefix = self.prefix();
        if prefix.is_empty() {
            self.name()
        } else {
            format!("{}/{}", prefix, self.name())
        }
    }
}

fn type_to_kind(flag: u8) -> Option<FileType> {
    match flag {
        b'0' | b'\0' | b'1' => Some(FileType::Regular),
        b'2' => Some(FileType::Symlink),
        b'3' => Some(FileType::CharDevice),
        b'4' => Some(FileType::BlockDevice),
        b'5' => Some(FileType::Directory),
        b'6' => Some(FileType::Fifo),
        _ => None,
    }
}

fn kind_to_type(kind: FileType) -> u8 {
    match kind {
        FileType::Regular => b'0',
        FileType::Symlink => b'2',
        FileType::CharDevice => b'3',
        FileType::BlockDevice => b'4',
        FileType::Directory => b'5',
        FileType::Fifo => b'6',
        FileType::Socket => b'0', // sockets are not tar-representable; degrade to regular
    }
}

fn round_up_blocks(len: usize) -> usize {
    (len + BLOCK - 1) / BLOCK * BLOCK
}

impl Vfs {
    /// Build a fresh VFS tree from a POSIX tar byte stream (spec.md §4.1/§6).
    pub fn load_tar(bytes: &[u8]) -> Vfs {
        let mut arena = Arena::new();
        let root = arena.insert(VfsEntry::new_dir("/", 0o755, None));
        let mut vfs = Vfs {
            arena,
            root,
            cwd: root,
            fds: crate::fd::FdTable::new(),
        };

        let mut off = 0usize;
        let mut pending_long_name: Option<String> = None;
        let mut consecutive_zero_blocks = 0u32;

        while off + BLOCK <= bytes.len() {
            let block: &[u8; BLOCK] = bytes[off..off + BLOCK].try_into().unwrap();
            let hdr = RawHeader(block);

            if hdr.is_zero() {
                consecutive_zero_blocks += 1;
                off += BLOCK;
                if consecutive_zero_blocks >= 2 {
                    break;
                }
                continue;
            }
            consecutive_zero_blocks = 0;

            let data_start = off + BLOCK;
            let size = hdr.size() as usize;
            let data_end = (data_start + size).min(bytes.len());
            let data = &bytes[data_start..data_end];

            if hdr.typeflag() == b'L' {
                // GNU long-name preamble: payload is the long path of the *next* entry.
                pending_long_name = Some(cstr(data));
                off = data_start + round_up_blocks(size);
                continue;
            }

            let name = pending_long_name.take().unwrap_or_else(|| hdr.full_name());
            let name = name.trim_end_matches('/').to_string();

            if let Some(kind) = type_to_kind(hdr.typeflag()) {
                vfs.insert_from_tar(&name, kind, hdr.mode(), hdr.uid(), hdr.gid(), hdr.mtime(), hdr.linkname(), data);
            }

            off = data_start + round_up_blocks(size);
        }

        vfs
    }

    fn insert_from_tar(
        &mut self,
        path: &str,
        kind: FileType,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
        linkname: String,
        data: &[u8],
    ) {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return;
        }
        let (dirs, leaf) = match path.rsplit_once('/') {
            Some((d, l)) => (d, l),
            None => ("", path),
        };
        let dir_id = self.mkdir_p_from_root(dirs);

        if kind == FileType::Directory {
            let id = self.arena.insert(VfsEntry::new_dir(leaf, mode | kind.mode_bits(), Some(dir_id)));
            self.link_child(dir_id, leaf, id);
            return;
        }

        let mut entry = match kind {
            FileType::Symlink => VfsEntry::new_symlink(leaf, linkname, Some(dir_id)),
            FileType::Fifo => VfsEntry::new_fifo(leaf, Some(dir_id)),
            _ => VfsEntry::new_file(leaf, mode | kind.mode_bits(), Some(dir_id)),
        };
        entry.kind = kind;
        entry.mode = mode | kind.mode_bits();
        entry.uid = uid;
        entry.gid = gid;
        entry.mtime = mtime;
        if kind == FileType::Regular {
            entry.content = data.to_vec();
            entry.size = data.len() as u64;
        }
        let id = self.arena.insert(entry);
        self.link_child(dir_id, leaf, id);
    }

    fn link_child(&mut self, dir_id: EntryId, name: &str, child: EntryId) {
        if let Some(dir) = self.arena.get_mut(dir_id) {
            dir.children
                .get_or_insert_with(Default::default)
                .insert(name.to_string(), child);
        }
    }

    fn mkdir_p_from_root(&mut self, dirs: &str) -> EntryId {
        let mut cur = self.root;
        if dirs.is_empty() {
            return cur;
        }
        for comp in dirs.split('/').filter(|c| !c.is_empty()) {
            let existing = self
                .arena
                .get(cur)
                .and_then(|e| e.children.as_ref())
                .and_then(|c| c.get(comp))
                .copied();
            cur = match existing {
                Some(id) => id,
                None => {
                    let id = self.arena.insert(VfsEntry::new_dir(comp, 0o755, Some(cur)));
                    self.link_child(cur, comp, id);
                    id
                }
            };
        }
        cur
    }

    /// Serialize the whole tree as a POSIX tar byte stream (spec.md §4.1's `save_tar`).
    pub fn save_tar(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_entry_recursive(self.root, "", &mut out);
        out.extend_from_slice(&[0u8; BLOCK]);
        out.extend_from_slice(&[0u8; BLOCK]);
        out
    }

    fn write_entry_recursive(&self, id: EntryId, path: &str, out: &mut Vec<u8>) {
        let entry = match self.arena.get(id) {
            Some(e) => e,
            None => return,
        };
        if id != self.root {
            self.write_one(entry, path, out);
        }
        if let Some(children) = &entry.children {
            // canonical: name-sorted order within a directory (spec.md §8 property 1)
            for (name, child_id) in children.iter() {
                let child_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{path}/{name}")
                };
                self.write_entry_recursive(*child_id, &child_path, out);
            }
        }
    }

    fn write_one(&self, entry: &VfsEntry, path: &str, out: &mut Vec<u8>) {
        let mut name = path.to_string();
        if entry.kind == FileType::Directory {
            name.push('/');
        }

        if name.len() > 100 {
            self.write_longlink(&name, out);
        }

        let mut header = [0u8; BLOCK];
        let name_bytes = name.as_bytes();
        let n = name_bytes.len().min(100);
        header[0..n].copy_from_slice(&name_bytes[..n]);
        write_octal(&mut header[100..108], entry.mode as u64 & 0o7777);
        write_octal(&mut header[108..116], entry.uid as u64);
        write_octal(&mut header[116..124], entry.gid as u64);
        let size = if entry.kind == FileType::Regular { entry.content.len() as u64 } else { 0 };
        write_octal(&mut header[124..136], size);
        write_octal(&mut header[136..148], entry.mtime as u64);
        header[156] = kind_to_type(entry.kind);
        if let Some(target) = &entry.symlink_target {
            let t = target.as_bytes();
            let n = t.len().min(100);
            header[157..157 + n].copy_from_slice(&t[..n]);
        }
        header[257..263].copy_from_slice(b"ustar\0");
        header[263..265].copy_from_slice(b"00");

        write_octal(&mut header[148..156], 0); // placeholder, filled below
        let chksum: u64 = header.iter().map(|&b| b as u64).sum::<u64>() + 8 * b' ' as u64;
        let chk_str = format!("{:06o}\0 ", chksum);
        header[148..148 + chk_str.len().min(8)]
            .copy_from_slice(&chk_str.as_bytes()[..chk_str.len().min(8)]);

        out.extend_from_slice(&header);

        if entry.kind == FileType::Regular && !entry.content.is_empty() {
            out.extend_from_slice(&entry.content);
            let pad = round_up_blocks(entry.content.len()) - entry.content.len();
            out.extend(std::iter::repeat(0u8).take(pad));
        }
    }

    fn write_longlink(&self, name: &str, out: &mut Vec<u8>) {
        let mut header = [0u8; BLOCK];
        let marker = b"././@LongLink";
        header[0..marker.len()].copy_from_slice(marker);
        write_octal(&mut header[100..108], 0);
        write_octal(&mut header[124..136], (name.len() + 1) as u64);
        header[156] = b'L';
        header[257..263].copy_from_slice(b"ustar\0");
        header[263..265].copy_from_slice(b"00");
        out.extend_from_slice(&header);

        let mut data = name.as_bytes().to_vec();
        data.push(0);
        out.extend_from_slice(&data);
        let pad = round_up_blocks(data.len()) - data.len();
        out.extend(std::iter::repeat(0u8).take(pad));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::OpenFlags;

    fn entry_set(vfs: &Vfs) -> Vec<(String, FileType, u64, Vec<u8>)> {
        fn walk(vfs: &Vfs, id: EntryId, path: &str, out: &mut Vec<(String, FileType, u64, Vec<u8>)>) {
            let entry = vfs.entry(id).unwrap();
            if !path.is_empty() {
                out.push((path.to_string(), entry.kind, entry.mode as u64 & 0o7777, entry.content.clone()));
            }
            if let Some(children) = &entry.children {
                for (name, child) in children {
                    let p = if path.is_empty() { name.clone() } else { format!("{path}/{name}") };
                    walk(vfs, *child, &p, out);
                }
            }
        }
        let mut out = Vec::new();
        walk(vfs, vfs.root(), "", &mut out);
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    #[test]
    fn save_then_load_preserves_entries() {
        let mut vfs = Vfs::empty();
        vfs.mkdir("/bin", 0o755).unwrap();
        let fd = vfs.open("/bin/busybox", OpenFlags::CREAT | OpenFlags::WRONLY, 0o755).unwrap();
        vfs.write(fd, b"#!/bin/sh\necho hi\n").unwrap();
        vfs.symlink("busybox", "/bin/sh").unwrap();

        let bytes = vfs.save_tar();
        let reloaded = Vfs::load_tar(&bytes);

        assert_eq!(entry_set(&vfs), entry_set(&reloaded));
    }

    #[test]
    fn long_name_round_trips_via_gnu_longlink() {
        let mut vfs = Vfs::empty();
        let long_name = "a".repeat(150);
        let path = format!("/{long_name}");
        vfs.open(&path, OpenFlags::CREAT, 0o644).unwrap();

        let bytes = vfs.save_tar();
        let reloaded = Vfs::load_tar(&bytes);
        assert!(reloaded.resolve(&path, true).is_ok());
    }

    #[test]
    fn two_zero_blocks_terminate_parsing() {
        let mut data = vec![0u8; BLOCK * 4];
        // garbage after the terminator must be ignored
        data[BLOCK * 3] = 0xff;
        let vfs = Vfs::load_tar(&data);
        assert!(vfs.entry(vfs.root()).unwrap().children.as_ref().unwrap().is_empty());
    }
}

fn write_octal(field: &mut [u8], value: u64) {
    let width = field.len() - 1;
    let s = format!("{:0width$o}", value, width = width);
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    field[..n].copy_from_slice(&bytes[bytes.len() - n..]);
}
