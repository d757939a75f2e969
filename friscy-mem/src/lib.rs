//! Memory management: `brk`, `mmap`, `mprotect` (spec.md §4.4, component C4).
//!
//! The `Machine` trait has no notion of a built-in allocator, so unlike the
//! prose in spec.md §4.4 ("delegate to the underlying emulator's built-in
//! brk/mmap"), this implementation always applies the direct page-attribute
//! logic — `brk_overridden` is tracked only so the Exec Engine can observe
//! and flip it across an `execve`, per spec.md §4.10.

use friscy_core::machine::{Machine, PageAttrs};

/// Maximum size of the brk arena (spec.md §3 invariant: `brk_current <= brk_base + BRK_MAX`).
pub const BRK_MAX: u64 = 16 * 1024 * 1024;

/// The Execution Context's memory-layout half (spec.md §3's `ExecCtx`): brk
/// bookkeeping and the mmap bump allocator.
pub struct MemoryManager {
    pub brk_base: u64,
    pub brk_current: u64,
    pub brk_overridden: bool,
    pub heap_start: u64,
    pub heap_size: u64,
    pub mmap_start: u64,
    pub mmap_frontier: u64,
    /// Set by the Fork Engine while a forked child is running (spec.md §4.8):
    /// `mprotect` becomes a no-op so RELRO can't poison the parent's snapshot.
    pub suppress_mprotect: bool,
}

impl MemoryManager {
    /// `heap_start`/`heap_size` describe the native heap range left by the
    /// initial ELF load (spec.md §3); `brk_base` starts immediately above it.
    pub fn new(heap_start: u64, heap_size: u64) -> Self {
        let brk_base = friscy_core::page_align_up(heap_start + heap_size);
        let mmap_start = brk_base + BRK_MAX;
        Self {
            brk_base,
            brk_current: brk_base,
            brk_overridden: false,
            heap_start,
            heap_size,
            mmap_start,
            mmap_frontier: mmap_start,
            suppress_mprotect: false,
        }
    }

    /// Reset memory layout around an `execve` binary swap (spec.md §4.10 step
    /// 4): `brk_base = brk_current = page_align_up(max_loaded_end)`, mark the
    /// region RW, push the mmap frontier past `brk_base + BRK_MAX`.
    pub fn reset_for_exec(&mut self, m: &mut dyn Machine, max_loaded_end: u64) -> Result<(), friscy_core::machine::PageFault> {
        let brk_base = friscy_core::page_align_up(max_loaded_end);
        m.set_page_attrs(brk_base, BRK_MAX as usize, PageAttrs::RW)?;
        self.brk_base = brk_base;
        self.brk_current = brk_base;
        self.brk_overridden = true;
        self.mmap_start = brk_base + BRK_MAX;
        self.mmap_frontier = self.mmap_start;
        Ok(())
    }

    /// `brk(new_end)`: clamp to `[brk_base, brk_base + BRK_MAX]`, mark newly
    /// exposed pages RW, return the resulting break. Shrinking leaves page
    /// attributes untouched (spec.md §4.4).
    pub fn brk(&mut self, m: &mut dyn Machine, requested: u64) -> u64 {
        if requested == 0 {
            return self.brk_current;
        }
        let clamped = requested.clamp(self.brk_base, self.brk_base + BRK_MAX);
        if clamped > self.brk_current {
            let start = friscy_core::page_align_up(self.brk_current);
            let end = friscy_core::page_align_up(clamped);
            if end > start {
                if m.set_page_attrs(start, (end - start) as usize, PageAttrs::RW).is_err() {
                    tracing::debug!(start, end, "brk: failed to extend, returning unchanged");
                    return self.brk_current;
                }
            }
        }
        self.brk_current = clamped;
        self.brk_current
    }

    /// Anonymous or file-backed `mmap`. `file_content` is the already-sliced
    /// `[offset, offset+length)` window of the backing VFS entry's bytes, if
    /// any — this crate has no VFS dependency, so the caller resolves the fd.
    pub fn mmap(
        &mut self,
        m: &mut dyn Machine,
        hint: u64,
        length: usize,
        prot: PageAttrs,
        fixed: bool,
        file_content: Option<&[u8]>,
    ) -> Result<u64, i64> {
        let len = friscy_core::page_align_up(length as u64);
        let addr = if fixed {
            hint
        } else if hint >= self.mmap_frontier {
            hint
        } else {
            self.mmap_frontier
        };

        if m.zero_mem(addr, len as usize).is_err() {
            return Err(friscy_core::errno::neg(friscy_core::errno::ENOMEM));
        }

        if let Some(content) = file_content {
            let copy_len = content.len().min(len as usize);
            if m.write_mem(addr, &content[..copy_len]).is_err() {
                return Err(friscy_core::errno::neg(friscy_core::errno::ENOMEM));
            }
        }

        if m.set_page_attrs(addr, len as usize, prot).is_err() {
            return Err(friscy_core::errno::neg(friscy_core::errno::ENOMEM));
        }

        if addr + len > self.mmap_frontier {
            self.mmap_frontier = addr + len;
        }

        Ok(addr)
    }

    /// `munmap` is delegated entirely to `Machine::set_page_attrs` clearing
    /// permissions (spec.md §4.9 lists it as "delegated"); the frontier is
    /// never pulled back, matching a real bump allocator.
    pub fn munmap(&mut self, m: &mut dyn Machine, addr: u64, length: usize) -> i64 {
        let len = friscy_core::page_align_up(length as u64);
        match m.set_page_attrs(addr, len as usize, PageAttrs::empty()) {
            Ok(()) => 0,
            Err(_) => friscy_core::errno::neg(friscy_core::errno::EINVAL),
        }
    }

    /// `mprotect`: no-op success while a forked child is running (spec.md §4.8).
    pub fn mprotect(&mut self, m: &mut dyn Machine, addr: u64, length: usize, prot: PageAttrs) -> i64 {
        if self.suppress_mprotect {
            return 0;
        }
        let len = friscy_core::page_align_up(length as u64);
        match m.set_page_attrs(addr, len as usize, prot) {
            Ok(()) => 0,
            Err(_) => friscy_core::errno::neg(friscy_core::errno::ENOMEM),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use friscy_testkit::FlatMachine;

    #[test]
    fn brk_grows_within_max_and_marks_pages_rw() {
        let mut m = FlatMachine::new(1 << 20);
        let mut mem = MemoryManager::new(0x1000, 0x1000);
        let end = mem.brk(&mut m, mem.brk_base + 0x5000);
        assert_eq!(end, mem.brk_base + 0x5000);

        let mut buf = [0u8; 4];
        m.write_mem(mem.brk_base + 0x10, &buf).unwrap();
        m.read_mem(mem.brk_base + 0x10, &mut buf).unwrap();
    }

    #[test]
    fn brk_clamps_to_brk_max() {
        let mut m = FlatMachine::new(1 << 20);
        let mut mem = MemoryManager::new(0, 0x1000);
        let end = mem.brk(&mut m, mem.brk_base + BRK_MAX + 0x10000);
        assert_eq!(end, mem.brk_base + BRK_MAX);
    }

    #[test]
    fn brk_zero_query_does_not_move_break() {
        let mut m = FlatMachine::new(1 << 20);
        let mut mem = MemoryManager::new(0, 0x1000);
        let before = mem.brk_current;
        assert_eq!(mem.brk(&mut m, 0), before);
    }

    #[test]
    fn anonymous_mmap_bumps_frontier_and_applies_prot() {
        let mut m = FlatMachine::new(1 << 20);
        let mut mem = MemoryManager::new(0, 0x1000);
        let frontier_before = mem.mmap_frontier;
        let addr = mem.mmap(&mut m, 0, 8192, PageAttrs::RW, false, None).unwrap();
        assert_eq!(addr, frontier_before);
        assert_eq!(mem.mmap_frontier, frontier_before + 8192);

        m.write_mem(addr, b"ok").unwrap();
    }

    #[test]
    fn file_backed_mmap_copies_content() {
        let mut m = FlatMachine::new(1 << 20);
        let mut mem = MemoryManager::new(0, 0x1000);
        let addr = mem
            .mmap(&mut m, 0, 4096, PageAttrs::READ, false, Some(b"hello"))
            .unwrap();
        let mut buf = [0u8; 5];
        m.read_mem(addr, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn mprotect_is_noop_while_suppressed() {
        let mut m = FlatMachine::new(1 << 20);
        let mut mem = MemoryManager::new(0, 0x1000);
        mem.suppress_mprotect = true;
        // An address with no mapping would normally fail set_page_attrs'
        // underlying write, but since mprotect short-circuits it still
        // reports success.
        assert_eq!(mem.mprotect(&mut m, 0xdead_0000, 4096, PageAttrs::RWX), 0);
    }

    #[test]
    fn mmap_fixed_overlay_does_not_move_frontier_backward() {
        let mut m = FlatMachine::new(1 << 20);
        let mut mem = MemoryManager::new(0, 0x1000);
        let _ = mem.mmap(&mut m, 0, 8192, PageAttrs::RW, false, None).unwrap();
        let frontier = mem.mmap_frontier;
        let low_addr = mem.mmap_start;
        mem.mmap(&mut m, low_addr, 4096, PageAttrs::RW, true, None).unwrap();
        assert_eq!(mem.mmap_frontier, frontier);
    }
}
