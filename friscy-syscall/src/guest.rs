//! Guest-memory marshaling helpers shared by every handler (spec.md §4.9):
//! reading NUL-terminated strings, argv/envp-style pointer arrays, and
//! `iovec` arrays out of the `Machine`.

use friscy_core::errno::{neg, EFAULT};
use friscy_core::machine::Machine;

const MAX_CSTR: usize = 4096;
const MAX_ARGV: usize = 4096;

/// Reads a NUL-terminated string starting at `addr`, one page-sized chunk at
/// a time so a short read-fault doesn't force reading the whole 4 KiB.
pub fn read_cstr(m: &dyn Machine, addr: u64) -> Result<String, i64> {
    if addr == 0 {
        return Err(neg(EFAULT));
    }
    let mut out = Vec::new();
    let mut cur = addr;
    loop {
        let mut byte = [0u8; 1];
        m.read_mem(cur, &mut byte).map_err(|_| neg(EFAULT))?;
        if byte[0] == 0 {
            break;
        }
        out.push(byte[0]);
        cur += 1;
        if out.len() > MAX_CSTR {
            return Err(neg(EFAULT));
        }
    }
    String::from_utf8(out).map_err(|_| neg(EFAULT))
}

/// Reads a NULL-terminated array of `u64` pointers (argv/envp), each
/// dereferenced as a C string.
pub fn read_cstr_array(m: &dyn Machine, addr: u64) -> Result<Vec<String>, i64> {
    if addr == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut cur = addr;
    loop {
        let mut ptr_bytes = [0u8; 8];
        m.read_mem(cur, &mut ptr_bytes).map_err(|_| neg(EFAULT))?;
        let ptr = u64::from_le_bytes(ptr_bytes);
        if ptr == 0 {
            break;
        }
        out.push(read_cstr(m, ptr)?);
        cur += 8;
        if out.len() > MAX_ARGV {
            return Err(neg(EFAULT));
        }
    }
    Ok(out)
}

/// One `struct iovec { void *iov_base; size_t iov_len; }` entry.
#[derive(Clone, Copy, Debug)]
pub struct IoVec {
    pub base: u64,
    pub len: u64,
}

pub fn read_iovecs(m: &dyn Machine, addr: u64, count: usize) -> Result<Vec<IoVec>, i64> {
    let mut out = Vec::with_capacity(count);
    let mut cur = addr;
    for _ in 0..count {
        let mut buf = [0u8; 16];
        m.read_mem(cur, &mut buf).map_err(|_| neg(EFAULT))?;
        out.push(IoVec {
            base: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            len: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        });
        cur += 16;
    }
    Ok(out)
}

pub fn write_checked(m: &mut dyn Machine, addr: u64, bytes: &[u8]) -> Result<(), i64> {
    if addr == 0 {
        return Err(neg(EFAULT));
    }
    m.write_mem(addr, bytes).map_err(|_| neg(EFAULT))
}

pub fn read_checked(m: &dyn Machine, addr: u64, buf: &mut [u8]) -> Result<(), i64> {
    if addr == 0 {
        return Err(neg(EFAULT));
    }
    m.read_mem(addr, buf).map_err(|_| neg(EFAULT))
}
