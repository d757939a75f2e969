//! `mmap` (spec.md §4.9/§4.4): resolves a file-backed fd's content window
//! through the VFS before handing off to `MemoryManager::mmap`.

use friscy_core::machine::Machine;

use crate::flags::{MmapFlags, MmapProt};
use crate::{Outcome, Syscalls};

pub fn mmap(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let hint = a[0];
    let length = a[1] as usize;
    let prot = MmapProt::from_bits_truncate(a[2]).to_page_attrs();
    let flags = MmapFlags::from_bits_truncate(a[3]);
    let fd = a[4] as i32;
    let offset = a[5];

    let content = if flags.contains(MmapFlags::ANONYMOUS) {
        None
    } else {
        let mut buf = vec![0u8; length];
        match sys.vfs.pread(fd, &mut buf, offset) {
            Ok(n) => Some(buf[..n].to_vec()),
            Err(e) => return Outcome::Return(e.neg_errno()),
        }
    };

    let fixed = flags.contains(MmapFlags::FIXED);
    match sys.mem.mmap(m, hint, length, prot, fixed, content.as_deref()) {
        Ok(addr) => Outcome::Return(addr as i64),
        Err(e) => Outcome::Return(e),
    }
}
