//! Fake `Machine` implementation and small fixture builders shared across the
//! workspace's unit tests (spec.md §1's `Machine` is an external collaborator
//! in production; here it's a sparse page-backed stand-in).

use std::any::Any;
use std::collections::HashMap;

use friscy_core::machine::{Machine, MemResult, PageAttrs, PageFault};
use friscy_core::PAGE_SIZE;

struct Page {
    attrs: PageAttrs,
    bytes: Box<[u8; PAGE_SIZE as usize]>,
}

impl Page {
    fn new() -> Self {
        Self {
            attrs: PageAttrs::empty(),
            bytes: Box::new([0u8; PAGE_SIZE as usize]),
        }
    }
}

/// A `Machine` backed by a sparse map of fixed-size pages rather than one
/// giant contiguous buffer, so tests can use realistic high guest addresses
/// (stack near the top of the address space, etc.) without allocating
/// terabytes. Pages start unmapped (`PageAttrs::empty()`); reads and writes
/// against an unmapped or under-permissioned page return a `PageFault`, same
/// as a real Machine would.
pub struct FlatMachine {
    pages: HashMap<u64, Page>,
    regs: [u64; 32],
    pc: u64,
    running: bool,
    pub output: Vec<u8>,
    userdata: Box<dyn Any>,
}

impl FlatMachine {
    /// `capacity` is advisory only (kept for API symmetry with a real arena);
    /// this implementation never preallocates based on it.
    pub fn new(_capacity: usize) -> Self {
        Self {
            pages: HashMap::new(),
            regs: [0u64; 32],
            pc: 0,
            running: false,
            output: Vec::new(),
            userdata: Box::new(()),
        }
    }

    fn check_range(&self, addr: u64, len: usize, required: PageAttrs) -> MemResult<()> {
        if len == 0 {
            return Ok(());
        }
        let end = addr + len as u64;
        let mut page = friscy_core::page_align_down(addr);
        while page < end {
            let attrs = self
                .pages
                .get(&page)
                .map(|p| p.attrs)
                .unwrap_or(PageAttrs::empty());
            if !attrs.contains(required) {
                return Err(PageFault {
                    addr: addr.max(page),
                });
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Directly grant permissions without the fault semantics, for tests that
    /// want to seed memory before exercising the code under test.
    pub fn force_map(&mut self, addr: u64, len: usize, attrs: PageAttrs) {
        let end = friscy_core::page_align_up(addr + len as u64);
        let mut page = friscy_core::page_align_down(addr);
        while page < end {
            self.pages.entry(page).or_insert_with(Page::new).attrs = attrs;
            page += PAGE_SIZE;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Machine for FlatMachine {
    fn reg(&self, idx: u8) -> u64 {
        self.regs[idx as usize]
    }

    fn set_reg(&mut self, idx: u8, val: u64) {
        if idx != 0 {
            self.regs[idx as usize] = val;
        }
    }

    fn pc(&self) -> u64 {
        self.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> MemResult<()> {
        self.check_range(addr, buf.len(), PageAttrs::READ)?;
        for (i, b) in buf.iter_mut().enumerate() {
            let a = addr + i as u64;
            let page = friscy_core::page_align_down(a);
            let off = (a - page) as usize;
            *b = self.pages.get(&page).map(|p| p.bytes[off]).unwrap_or(0);
        }
        Ok(())
    }

    fn write_mem(&mut self, addr: u64, buf: &[u8]) -> MemResult<()> {
        self.check_range(addr, buf.len(), PageAttrs::WRITE)?;
        for (i, &b) in buf.iter().enumerate() {
            let a = addr + i as u64;
            let page = friscy_core::page_align_down(a);
            let off = (a - page) as usize;
            self.pages.entry(page).or_insert_with(Page::new).bytes[off] = b;
        }
        Ok(())
    }

    fn zero_mem(&mut self, addr: u64, len: usize) -> MemResult<()> {
        self.check_range(addr, len, PageAttrs::WRITE)?;
        for i in 0..len {
            let a = addr + i as u64;
            let page = friscy_core::page_align_down(a);
            let off = (a - page) as usize;
            self.pages.entry(page).or_insert_with(Page::new).bytes[off] = 0;
        }
        Ok(())
    }

    fn set_page_attrs(&mut self, addr: u64, len: usize, attrs: PageAttrs) -> MemResult<()> {
        let end = friscy_core::page_align_up(addr + len as u64);
        let mut page = friscy_core::page_align_down(addr);
        while page < end {
            self.pages.entry(page).or_insert_with(Page::new).attrs = attrs;
            page += PAGE_SIZE;
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    fn resume(&mut self) {
        self.running = true;
    }

    fn print(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    fn userdata(&self) -> &dyn Any {
        &*self.userdata
    }

    fn userdata_mut(&mut self) -> &mut dyn Any {
        &mut *self.userdata
    }
}

/// A minimal rootfs tar with a couple of directories and files, built through
/// the real `Vfs` so its bytes round-trip through `load_tar` faithfully.
pub fn tiny_rootfs_tar() -> Vec<u8> {
    use friscy_vfs::fd::OpenFlags;

    let mut vfs = friscy_vfs::Vfs::empty();
    vfs.mkdir("/bin", 0o755).unwrap();
    vfs.mkdir("/etc", 0o755).unwrap();
    let fd = vfs
        .open("/bin/init", OpenFlags::CREAT | OpenFlags::WRONLY, 0o755)
        .unwrap();
    vfs.write(fd, b"\x7fELFplaceholder").unwrap();
    vfs.close(fd).unwrap();
    let fd = vfs
        .open("/etc/hostname", OpenFlags::CREAT | OpenFlags::WRONLY, 0o644)
        .unwrap();
    vfs.write(fd, b"friscy\n").unwrap();
    vfs.close(fd).unwrap();
    vfs.save_tar()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_page_faults_on_read() {
        let m = FlatMachine::new(4096);
        let mut buf = [0u8; 4];
        assert!(m.read_mem(0x1000, &mut buf).is_err());
    }

    #[test]
    fn mapped_page_round_trips() {
        let mut m = FlatMachine::new(4096);
        m.force_map(0x1000, 4096, PageAttrs::RW);
        m.write_mem(0x1000, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        m.read_mem(0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn tiny_rootfs_round_trips_through_load_tar() {
        let bytes = tiny_rootfs_tar();
        let vfs = friscy_vfs::Vfs::load_tar(&bytes);
        assert!(vfs.resolve("/bin/init", true).is_ok());
        assert!(vfs.resolve("/etc/hostname", true).is_ok());
    }
}
