//! Socket syscalls, thin marshaling shims over `friscy_net::NetBridge`
//! (spec.md §4.9/§4.6).

use friscy_core::errno::neg;
use friscy_core::machine::Machine;

use crate::guest::write_checked;
use crate::{Outcome, Syscalls};

fn read_sockaddr(m: &dyn Machine, addr: u64, len: u64) -> Result<Vec<u8>, i64> {
    let mut buf = vec![0u8; len as usize];
    m.read_mem(addr, &mut buf).map_err(|_| neg(friscy_core::errno::EFAULT))?;
    Ok(buf)
}

pub fn bind(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let addr = match read_sockaddr(m, a[1], a[2]) {
        Ok(b) => b,
        Err(e) => return Outcome::Return(e),
    };
    Outcome::Return(sys.net.bind(a[0] as i32, &addr))
}

pub fn accept(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6], extra_flags: i32) -> Outcome {
    let buf_len = if a[2] != 0 {
        let mut len_bytes = [0u8; 4];
        if m.read_mem(a[2], &mut len_bytes).is_err() {
            return Outcome::Return(neg(friscy_core::errno::EFAULT));
        }
        u32::from_le_bytes(len_bytes) as usize
    } else {
        0
    };
    let mut addr_buf = vec![0u8; buf_len];
    let rc = sys.net.accept(a[0] as i32, &mut addr_buf, extra_flags);
    if rc < 0 {
        return Outcome::Return(rc);
    }
    if a[1] != 0 && buf_len > 0 {
        let _ = write_checked(m, a[1], &addr_buf);
    }
    Outcome::Return(rc)
}

pub fn connect(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let addr = match read_sockaddr(m, a[1], a[2]) {
        Ok(b) => b,
        Err(e) => return Outcome::Return(e),
    };
    Outcome::Return(sys.net.connect(a[0] as i32, &addr))
}

pub fn sendto(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let mut buf = vec![0u8; a[2] as usize];
    if m.read_mem(a[1], &mut buf).is_err() {
        return Outcome::Return(neg(friscy_core::errno::EFAULT));
    }
    let addr = if a[4] != 0 {
        match read_sockaddr(m, a[4], a[5]) {
            Ok(b) => Some(b),
            Err(e) => return Outcome::Return(e),
        }
    } else {
        None
    };
    Outcome::Return(sys.net.sendto(a[0] as i32, &buf, a[3] as i32, addr.as_deref()))
}

pub fn recvfrom(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let mut buf = vec![0u8; a[2] as usize];
    let addr_len = if a[5] != 0 {
        let mut len_bytes = [0u8; 4];
        if m.read_mem(a[5], &mut len_bytes).is_err() {
            return Outcome::Return(neg(friscy_core::errno::EFAULT));
        }
        u32::from_le_bytes(len_bytes) as usize
    } else {
        0
    };
    let mut addr_buf = vec![0u8; addr_len];
    match sys.net.recvfrom(a[0] as i32, &mut buf, a[3] as i32, &mut addr_buf) {
        Ok((rc, n)) => {
            if rc < 0 {
                return Outcome::Return(rc);
            }
            if write_checked(m, a[1], &buf[..rc as usize]).is_err() {
                return Outcome::Return(neg(friscy_core::errno::EFAULT));
            }
            if a[4] != 0 && n > 0 {
                let _ = write_checked(m, a[4], &addr_buf[..n]);
            }
            Outcome::Return(rc)
        }
        Err(e) => Outcome::Return(e),
    }
}

/// `struct msghdr { void *msg_name; socklen_t msg_namelen; struct iovec
/// *msg_iov; size_t msg_iovlen; ... }`; only the fields this bridges needs.
fn read_msghdr_name_and_iov(m: &dyn Machine, addr: u64) -> Result<(u64, u64, u64, u64), i64> {
    let mut buf = [0u8; 32];
    m.read_mem(addr, &mut buf).map_err(|_| neg(friscy_core::errno::EFAULT))?;
    let name_ptr = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let name_len = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let iov_ptr = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    let iov_len = u64::from_le_bytes(buf[24..32].try_into().unwrap());
    Ok((name_ptr, name_len, iov_ptr, iov_len))
}

pub fn sendmsg(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let (name_ptr, name_len, iov_ptr, iov_len) = match read_msghdr_name_and_iov(m, a[1]) {
        Ok(v) => v,
        Err(e) => return Outcome::Return(e),
    };
    let iovecs = match crate::guest::read_iovecs(m, iov_ptr, iov_len as usize) {
        Ok(v) => v,
        Err(e) => return Outcome::Return(e),
    };
    let mut payload = Vec::new();
    for iov in iovecs {
        let mut chunk = vec![0u8; iov.len as usize];
        if m.read_mem(iov.base, &mut chunk).is_err() {
            return Outcome::Return(neg(friscy_core::errno::EFAULT));
        }
        payload.extend_from_slice(&chunk);
    }
    let addr = if name_ptr != 0 && name_len > 0 {
        match read_sockaddr(m, name_ptr, name_len) {
            Ok(b) => Some(b),
            Err(e) => return Outcome::Return(e),
        }
    } else {
        None
    };
    Outcome::Return(sys.net.sendto(a[0] as i32, &payload, a[2] as i32, addr.as_deref()))
}

pub fn recvmsg(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let (name_ptr, name_len, iov_ptr, iov_len) = match read_msghdr_name_and_iov(m, a[1]) {
        Ok(v) => v,
        Err(e) => return Outcome::Return(e),
    };
    let iovecs = match crate::guest::read_iovecs(m, iov_ptr, iov_len as usize) {
        Ok(v) => v,
        Err(e) => return Outcome::Return(e),
    };
    let total_cap: usize = iovecs.iter().map(|v| v.len as usize).sum();
    let mut buf = vec![0u8; total_cap];
    let mut addr_buf = vec![0u8; name_len as usize];
    let (rc, addr_written) = match sys.net.recvfrom(a[0] as i32, &mut buf, a[2] as i32, &mut addr_buf) {
        Ok(v) => v,
        Err(e) => return Outcome::Return(e),
    };
    if rc < 0 {
        return Outcome::Return(rc);
    }
    let mut remaining = &buf[..rc as usize];
    for iov in &iovecs {
        let n = remaining.len().min(iov.len as usize);
        if write_checked(m, iov.base, &remaining[..n]).is_err() {
            return Outcome::Return(neg(friscy_core::errno::EFAULT));
        }
        remaining = &remaining[n..];
    }
    if name_ptr != 0 && addr_written > 0 {
        let _ = write_checked(m, name_ptr, &addr_buf[..addr_written]);
    }
    Outcome::Return(rc)
}

pub fn getsockopt(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let mut len_bytes = [0u8; 4];
    if a[4] != 0 && m.read_mem(a[4], &mut len_bytes).is_err() {
        return Outcome::Return(neg(friscy_core::errno::EFAULT));
    }
    let mut optval = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
    match sys.net.getsockopt(a[0] as i32, a[1] as i32, a[2] as i32, &mut optval) {
        Ok(n) => {
            let _ = write_checked(m, a[3], &optval[..n]);
            let _ = write_checked(m, a[4], &(n as u32).to_le_bytes());
            Outcome::Return(0)
        }
        Err(e) => Outcome::Return(e),
    }
}

pub fn setsockopt(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let mut optval = vec![0u8; a[4] as usize];
    if m.read_mem(a[3], &mut optval).is_err() {
        return Outcome::Return(neg(friscy_core::errno::EFAULT));
    }
    Outcome::Return(sys.net.setsockopt(a[0] as i32, a[1] as i32, a[2] as i32, &optval))
}

pub fn getsockname(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let mut len_bytes = [0u8; 4];
    if m.read_mem(a[2], &mut len_bytes).is_err() {
        return Outcome::Return(neg(friscy_core::errno::EFAULT));
    }
    let mut buf = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
    match sys.net.getsockname(a[0] as i32, &mut buf) {
        Ok(n) => {
            let _ = write_checked(m, a[1], &buf[..n]);
            Outcome::Return(0)
        }
        Err(e) => Outcome::Return(e),
    }
}

pub fn getpeername(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let mut len_bytes = [0u8; 4];
    if m.read_mem(a[2], &mut len_bytes).is_err() {
        return Outcome::Return(neg(friscy_core::errno::EFAULT));
    }
    let mut buf = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
    match sys.net.getpeername(a[0] as i32, &mut buf) {
        Ok(n) => {
            let _ = write_checked(m, a[1], &buf[..n]);
            Outcome::Return(0)
        }
        Err(e) => Outcome::Return(e),
    }
}

pub fn socketpair(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    match sys.net.socketpair(a[0] as i32, a[1] as i32, a[2] as i32) {
        Ok((fa, fb)) => {
            let mut buf = [0u8; 8];
            buf[0..4].copy_from_slice(&fa.to_le_bytes());
            buf[4..8].copy_from_slice(&fb.to_le_bytes());
            match write_checked(m, a[3], &buf) {
                Ok(()) => Outcome::Return(0),
                Err(e) => Outcome::Return(e),
            }
        }
        Err(e) => Outcome::Return(e),
    }
}
