//! File I/O: open/close/read/write/seek, directory entries, stat, and the
//! path-mutating syscalls (spec.md §4.9's file-I/O group, on top of C1).

use friscy_core::errno::{neg, EBADF, EFAULT, EINVAL};
use friscy_core::machine::Machine;
use friscy_vfs::fd::OpenFlags;

use crate::guest::{read_checked, read_cstr, read_iovecs, write_checked};
use crate::path_at::resolve_dirfd_path;
use crate::stat::{encode_stat, encode_statx};
use crate::{Outcome, Syscalls};

fn vfs_err(e: friscy_vfs::VfsError) -> Outcome {
    Outcome::Return(e.neg_errno())
}

pub fn openat(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let path = match read_cstr(m, a[1]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let path = match resolve_dirfd_path(sys.vfs, a[0] as i32, &path) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let flags = OpenFlags::from_bits_truncate(a[2] as u32);
    match sys.vfs.open(&path, flags, a[3] as u32) {
        Ok(fd) => Outcome::Return(fd as i64),
        Err(e) => vfs_err(e),
    }
}

pub fn close(sys: &mut Syscalls, a: [u64; 6]) -> Outcome {
    let fd = a[0] as i32;
    match sys.vfs.close(fd) {
        Ok(()) => Outcome::Return(0),
        Err(e) => vfs_err(e),
    }
}

pub fn read(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let fd = a[0] as i32;
    let len = a[2] as usize;
    if fd == 0 {
        return stdin_read(sys, m, a[1], len);
    }
    if friscy_net::NetBridge::is_socket_fd(fd) {
        let mut buf = vec![0u8; len];
        let mut addr_buf: [u8; 0] = [];
        return match sys.net.recvfrom(fd, &mut buf, 0, &mut addr_buf) {
            Ok((rc, _)) => {
                if rc < 0 {
                    return Outcome::Return(rc);
                }
                match write_checked(m, a[1], &buf[..rc as usize]) {
                    Ok(()) => Outcome::Return(rc),
                    Err(e) => Outcome::Return(e),
                }
            }
            Err(e) => Outcome::Return(e),
        };
    }
    let mut buf = vec![0u8; len];
    match sys.vfs.read(fd, &mut buf) {
        Ok(n) => match write_checked(m, a[1], &buf[..n]) {
            Ok(()) => Outcome::Return(n as i64),
            Err(e) => Outcome::Return(e),
        },
        Err(e) => vfs_err(e),
    }
}

/// Blocking stdin read (spec.md §4.5): non-blocking drain via the I/O
/// bridge; if nothing is ready and not at EOF, rewind PC and suspend so the
/// host driver loop can feed more bytes before resuming.
fn stdin_read(sys: &mut Syscalls, m: &mut dyn Machine, buf_addr: u64, len: usize) -> Outcome {
    match sys.io.try_read(len) {
        Some(bytes) => match write_checked(m, buf_addr, &bytes) {
            Ok(()) => Outcome::Return(bytes.len() as i64),
            Err(e) => Outcome::Return(e),
        },
        None => {
            sys.io.set_waiting_for_stdin(true);
            m.set_pc(m.pc().wrapping_sub(friscy_core::machine::ECALL_WIDTH));
            m.stop();
            Outcome::Suspend
        }
    }
}

pub fn write(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let fd = a[0] as i32;
    let len = a[2] as usize;
    let mut buf = vec![0u8; len];
    if let Err(e) = read_checked(m, a[1], &mut buf) {
        return Outcome::Return(e);
    }
    if fd == 1 || fd == 2 {
        m.print(&buf);
        return Outcome::Return(len as i64);
    }
    if friscy_net::NetBridge::is_socket_fd(fd) {
        return Outcome::Return(sys.net.sendto(fd, &buf, 0, None));
    }
    match sys.vfs.write(fd, &buf) {
        Ok(n) => Outcome::Return(n as i64),
        Err(e) => vfs_err(e),
    }
}

pub fn readv(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let fd = a[0] as i32;
    let iovecs = match read_iovecs(m, a[1], a[2] as usize) {
        Ok(v) => v,
        Err(e) => return Outcome::Return(e),
    };
    let is_socket = friscy_net::NetBridge::is_socket_fd(fd);
    let mut total = 0i64;
    for iov in iovecs {
        if iov.len == 0 {
            continue;
        }
        let mut buf = vec![0u8; iov.len as usize];
        let n = if fd == 0 {
            match sys.io.try_read(buf.len()) {
                Some(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    bytes.len()
                }
                None => {
                    if total > 0 {
                        break;
                    }
                    sys.io.set_waiting_for_stdin(true);
                    m.set_pc(m.pc().wrapping_sub(friscy_core::machine::ECALL_WIDTH));
                    m.stop();
                    return Outcome::Suspend;
                }
            }
        } else if is_socket {
            let mut addr_buf: [u8; 0] = [];
            match sys.net.recvfrom(fd, &mut buf, 0, &mut addr_buf) {
                Ok((n, _)) if n < 0 => return Outcome::Return(n),
                Ok((n, _)) => n as usize,
                Err(e) => return Outcome::Return(e),
            }
        } else {
            match sys.vfs.read(fd, &mut buf) {
                Ok(n) => n,
                Err(e) => return vfs_err(e),
            }
        };
        if n == 0 {
            break;
        }
        if write_checked(m, iov.base, &buf[..n]).is_err() {
            return Outcome::Return(neg(EFAULT));
        }
        total += n as i64;
        if n < iov.len as usize {
            break;
        }
    }
    Outcome::Return(total)
}

pub fn writev(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let fd = a[0] as i32;
    let iovecs = match read_iovecs(m, a[1], a[2] as usize) {
        Ok(v) => v,
        Err(e) => return Outcome::Return(e),
    };
    let is_socket = friscy_net::NetBridge::is_socket_fd(fd);
    let mut total = 0i64;
    for iov in iovecs {
        if iov.len == 0 {
            continue;
        }
        let mut buf = vec![0u8; iov.len as usize];
        if read_checked(m, iov.base, &mut buf).is_err() {
            return Outcome::Return(neg(EFAULT));
        }
        if fd == 1 || fd == 2 {
            m.print(&buf);
            total += buf.len() as i64;
            continue;
        }
        if is_socket {
            let n = sys.net.sendto(fd, &buf, 0, None);
            if n < 0 {
                return Outcome::Return(n);
            }
            total += n;
            continue;
        }
        match sys.vfs.write(fd, &buf) {
            Ok(n) => total += n as i64,
            Err(e) => return vfs_err(e),
        }
    }
    Outcome::Return(total)
}

pub fn pread64(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let mut buf = vec![0u8; a[2] as usize];
    match sys.vfs.pread(a[0] as i32, &mut buf, a[3]) {
        Ok(n) => match write_checked(m, a[1], &buf[..n]) {
            Ok(()) => Outcome::Return(n as i64),
            Err(e) => Outcome::Return(e),
        },
        Err(e) => vfs_err(e),
    }
}

pub fn pwrite64(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let mut buf = vec![0u8; a[2] as usize];
    if let Err(e) = read_checked(m, a[1], &mut buf) {
        return Outcome::Return(e);
    }
    match sys.vfs.pwrite(a[0] as i32, &buf, a[3]) {
        Ok(n) => Outcome::Return(n as i64),
        Err(e) => vfs_err(e),
    }
}

pub fn pwritev(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let iovecs = match read_iovecs(m, a[1], a[2] as usize) {
        Ok(v) => v,
        Err(e) => return Outcome::Return(e),
    };
    let mut offset = a[3];
    let mut total = 0i64;
    for iov in iovecs {
        if iov.len == 0 {
            continue;
        }
        let mut buf = vec![0u8; iov.len as usize];
        if read_checked(m, iov.base, &mut buf).is_err() {
            return Outcome::Return(neg(EFAULT));
        }
        match sys.vfs.pwrite(a[0] as i32, &buf, offset) {
            Ok(n) => {
                total += n as i64;
                offset += n as u64;
            }
            Err(e) => return vfs_err(e),
        }
    }
    Outcome::Return(total)
}

pub fn lseek(sys: &mut Syscalls, a: [u64; 6]) -> Outcome {
    match sys.vfs.lseek(a[0] as i32, a[1] as i64, a[2] as i32) {
        Ok(off) => Outcome::Return(off as i64),
        Err(e) => vfs_err(e),
    }
}

pub fn getdents64(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    match sys.vfs.getdents64(a[0] as i32, a[2] as usize) {
        Ok(bytes) => match write_checked(m, a[1], &bytes) {
            Ok(()) => Outcome::Return(bytes.len() as i64),
            Err(e) => Outcome::Return(e),
        },
        Err(e) => vfs_err(e),
    }
}

fn stat_entry_at(sys: &Syscalls, dirfd: i32, path_ptr: u64, m: &dyn Machine, flags: i32) -> Result<friscy_vfs::entry::EntryId, i64> {
    let path = read_cstr(m, path_ptr)?;
    let resolved = resolve_dirfd_path(sys.vfs, dirfd, &path)?;
    let follow = flags & crate::flags::AT_SYMLINK_NOFOLLOW == 0;
    sys.vfs.resolve(&resolved, follow).map_err(|e| e.neg_errno())
}

pub fn newfstatat(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let id = match stat_entry_at(sys, a[0] as i32, a[1], m, a[3] as i32) {
        Ok(id) => id,
        Err(e) => return Outcome::Return(e),
    };
    let entry = match sys.vfs.entry(id) {
        Some(e) => e,
        None => return Outcome::Return(neg(friscy_core::errno::ENOENT)),
    };
    let buf = encode_stat(entry);
    match write_checked(m, a[2], &buf) {
        Ok(()) => Outcome::Return(0),
        Err(e) => Outcome::Return(e),
    }
}

pub fn fstat(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let fd = a[0] as i32;
    let id = match sys.vfs.fds.get(fd) {
        Some(e) => e.entry_id(),
        None => return Outcome::Return(neg(EBADF)),
    };
    let entry = match sys.vfs.entry(id) {
        Some(e) => e,
        None => return Outcome::Return(neg(friscy_core::errno::ENOENT)),
    };
    let buf = encode_stat(entry);
    match write_checked(m, a[1], &buf) {
        Ok(()) => Outcome::Return(0),
        Err(e) => Outcome::Return(e),
    }
}

pub fn statx(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let id = match stat_entry_at(sys, a[0] as i32, a[1], m, a[2] as i32) {
        Ok(id) => id,
        Err(e) => return Outcome::Return(e),
    };
    let entry = match sys.vfs.entry(id) {
        Some(e) => e,
        None => return Outcome::Return(neg(friscy_core::errno::ENOENT)),
    };
    let buf = encode_statx(entry);
    match write_checked(m, a[4], &buf) {
        Ok(()) => Outcome::Return(0),
        Err(e) => Outcome::Return(e),
    }
}

pub fn readlinkat(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let path = match read_cstr(m, a[1]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let path = match resolve_dirfd_path(sys.vfs, a[0] as i32, &path) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    match sys.vfs.readlink(&path) {
        Ok(target) => {
            let bytes = target.as_bytes();
            let n = bytes.len().min(a[3] as usize);
            match write_checked(m, a[2], &bytes[..n]) {
                Ok(()) => Outcome::Return(n as i64),
                Err(e) => Outcome::Return(e),
            }
        }
        Err(e) => vfs_err(e),
    }
}

pub fn faccessat(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let path = match read_cstr(m, a[1]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let path = match resolve_dirfd_path(sys.vfs, a[0] as i32, &path) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    match sys.vfs.resolve(&path, true) {
        Ok(_) => Outcome::Return(0),
        Err(e) => vfs_err(e),
    }
}

pub fn getcwd(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let cwd = sys.vfs.getcwd();
    let mut bytes = cwd.into_bytes();
    bytes.push(0);
    if bytes.len() > a[1] as usize {
        return Outcome::Return(neg(EINVAL));
    }
    match write_checked(m, a[0], &bytes) {
        Ok(()) => Outcome::Return(bytes.len() as i64),
        Err(e) => Outcome::Return(e),
    }
}

pub fn chdir(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let path = match read_cstr(m, a[0]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    match sys.vfs.chdir(&path) {
        Ok(()) => Outcome::Return(0),
        Err(e) => vfs_err(e),
    }
}

pub fn mkdirat(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let path = match read_cstr(m, a[1]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let path = match resolve_dirfd_path(sys.vfs, a[0] as i32, &path) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    match sys.vfs.mkdir(&path, a[2] as u32) {
        Ok(()) => Outcome::Return(0),
        Err(e) => vfs_err(e),
    }
}

pub fn unlinkat(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let path = match read_cstr(m, a[1]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let path = match resolve_dirfd_path(sys.vfs, a[0] as i32, &path) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    const AT_REMOVEDIR: u64 = 0x200;
    let result = if a[2] & AT_REMOVEDIR != 0 {
        sys.vfs.rmdir(&path)
    } else {
        sys.vfs.unlink(&path)
    };
    match result {
        Ok(()) => Outcome::Return(0),
        Err(e) => vfs_err(e),
    }
}

pub fn symlinkat(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let target = match read_cstr(m, a[0]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let link_path = match read_cstr(m, a[2]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let link_path = match resolve_dirfd_path(sys.vfs, a[1] as i32, &link_path) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    match sys.vfs.symlink(&target, &link_path) {
        Ok(()) => Outcome::Return(0),
        Err(e) => vfs_err(e),
    }
}

pub fn linkat(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let old = match read_cstr(m, a[1]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let old = match resolve_dirfd_path(sys.vfs, a[0] as i32, &old) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let new = match read_cstr(m, a[3]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let new = match resolve_dirfd_path(sys.vfs, a[2] as i32, &new) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    match sys.vfs.link(&old, &new) {
        Ok(()) => Outcome::Return(0),
        Err(e) => vfs_err(e),
    }
}

pub fn renameat(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let from = match read_cstr(m, a[1]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let from = match resolve_dirfd_path(sys.vfs, a[0] as i32, &from) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let to = match read_cstr(m, a[3]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let to = match resolve_dirfd_path(sys.vfs, a[2] as i32, &to) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    match sys.vfs.rename(&from, &to) {
        Ok(()) => Outcome::Return(0),
        Err(e) => vfs_err(e),
    }
}

pub fn ftruncate(sys: &mut Syscalls, a: [u64; 6]) -> Outcome {
    match sys.vfs.ftruncate(a[0] as i32, a[1]) {
        Ok(()) => Outcome::Return(0),
        Err(e) => vfs_err(e),
    }
}

pub fn close_range(sys: &mut Syscalls, a: [u64; 6]) -> Outcome {
    let first = a[0] as i32;
    let last = a[1] as i32;
    for fd in first..=last {
        let _ = sys.vfs.close(fd);
    }
    Outcome::Return(0)
}

pub fn sendfile(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let out_fd = a[0] as i32;
    let in_fd = a[1] as i32;
    let count = a[3] as usize;
    let mut buf = vec![0u8; count];
    let n = match sys.vfs.read(in_fd, &mut buf) {
        Ok(n) => n,
        Err(e) => return vfs_err(e),
    };
    if out_fd == 1 || out_fd == 2 {
        m.print(&buf[..n]);
        return Outcome::Return(n as i64);
    }
    match sys.vfs.write(out_fd, &buf[..n]) {
        Ok(n) => Outcome::Return(n as i64),
        Err(e) => vfs_err(e),
    }
}
