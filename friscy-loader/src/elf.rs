//! ELF64 parsing and the two-pass segment loader (spec.md §4.2, component C2).

use friscy_core::machine::{Machine, PageAttrs, PageFault};
use thiserror::Error;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const EM_RISCV: u16 = 0xF3;

pub const PT_LOAD: u32 = 1;
pub const PT_INTERP: u32 = 3;
pub const PT_PHDR: u32 = 6;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    #[error("not an ELF file (bad magic)")]
    BadMagic,
    #[error("not a 64-bit little-endian ELF")]
    BadClass,
    #[error("unsupported machine (expected RISC-V)")]
    BadMachine,
    #[error("unsupported ELF type (expected ET_EXEC/ET_DYN)")]
    BadType,
    #[error("ELF has no PT_LOAD segments")]
    NoLoadSegments,
    #[error("ELF file truncated")]
    Truncated,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
}

impl ProgramHeader {
    fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < 56 {
            return None;
        }
        Some(Self {
            p_type: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(b[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(b[16..24].try_into().unwrap()),
            // p_paddr at [24..32], skipped
            p_filesz: u64::from_le_bytes(b[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(b[40..48].try_into().unwrap()),
            // p_align at [48..56], skipped
        })
    }

    pub fn writable(&self) -> bool {
        self.p_flags & PF_W != 0
    }

    pub fn attrs(&self) -> PageAttrs {
        let mut a = PageAttrs::empty();
        if self.p_flags & PF_R != 0 {
            a |= PageAttrs::READ;
        }
        if self.p_flags & PF_W != 0 {
            a |= PageAttrs::WRITE;
        }
        if self.p_flags & PF_X != 0 {
            a |= PageAttrs::EXEC;
        }
        a
    }
}

/// A parsed ELF64 image, independent of any load base (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct ElfImage {
    pub e_type: u16,
    pub entry: u64,
    pub phdr_vaddr: u64,
    pub phentsize: u16,
    pub phnum: u16,
    pub interp: Option<String>,
    pub loads: Vec<ProgramHeader>,
    data: Vec<u8>,
}

impl ElfImage {
    pub fn parse(bytes: &[u8]) -> Result<Self, ElfError> {
        if bytes.len() < 64 {
            return Err(ElfError::Truncated);
        }
        if &bytes[0..4] != b"\x7fELF" {
            return Err(ElfError::BadMagic);
        }
        if bytes[4] != 2 || bytes[5] != 1 {
            // EI_CLASS=ELFCLASS64, EI_DATA=ELFDATA2LSB
            return Err(ElfError::BadClass);
        }

        let e_type = u16::from_le_bytes(bytes[16..18].try_into().unwrap());
        let e_machine = u16::from_le_bytes(bytes[18..20].try_into().unwrap());
        if e_machine != EM_RISCV {
            return Err(ElfError::BadMachine);
        }
        if e_type != ET_EXEC && e_type != ET_DYN {
            return Err(ElfError::BadType);
        }

        let entry = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        let e_phoff = u64::from_le_bytes(bytes[32..40].try_into().unwrap());
        let e_phentsize = u16::from_le_bytes(bytes[54..56].try_into().unwrap());
        let e_phnum = u16::from_le_bytes(bytes[56..58].try_into().unwrap());

        let mut loads = Vec::new();
        let mut interp = None;
        let mut phdr_vaddr = None;

        for i in 0..e_phnum as u64 {
            let off = (e_phoff + i * e_phentsize as u64) as usize;
            let raw = bytes
                .get(off..off + e_phentsize as usize)
                .ok_or(ElfError::Truncated)?;
            let ph = ProgramHeader::parse(raw).ok_or(ElfError::Truncated)?;

            match ph.p_type {
                PT_LOAD => {
                    if phdr_vaddr.is_none() && ph.p_offset == 0 {
                        phdr_vaddr = Some(ph.p_vaddr);
                    }
                    loads.push(ph);
                }
                PT_INTERP => {
                    let start = ph.p_offset as usize;
                    let end = (start + ph.p_filesz as usize).min(bytes.len());
                    let raw = bytes.get(start..end).ok_or(ElfError::Truncated)?;
                    let s = raw
                        .iter()
                        .take_while(|&&b| b != 0)
                        .map(|&b| b as char)
                        .collect::<String>();
                    interp = Some(s);
                }
                PT_PHDR => phdr_vaddr = Some(ph.p_vaddr),
                _ => {}
            }
        }

        if loads.is_empty() {
            return Err(ElfError::NoLoadSegments);
        }

        Ok(Self {
            e_type,
            entry,
            phdr_vaddr: phdr_vaddr.unwrap_or(0),
            phentsize: e_phentsize,
            phnum: e_phnum,
            interp,
            loads,
            data: bytes.to_vec(),
        })
    }

    pub fn is_pie(&self) -> bool {
        self.e_type == ET_DYN
    }

    /// Union of `[p_vaddr, p_vaddr+p_memsz)` over writable PT_LOAD segments
    /// (spec.md §4.2, "Writable range"), before PIE base adjustment.
    pub fn writable_range(&self) -> (u64, u64) {
        let mut lo = u64::MAX;
        let mut hi = 0u64;
        for ph in self.loads.iter().filter(|p| p.writable()) {
            lo = lo.min(ph.p_vaddr);
            hi = hi.max(ph.p_vaddr + ph.p_memsz);
        }
        if lo > hi {
            (0, 0)
        } else {
            (lo, hi)
        }
    }

    /// Page-aligned union of every PT_LOAD segment, post PIE-base adjustment.
    pub fn load_span(&self, base: u64) -> (u64, u64) {
        let mut lo = u64::MAX;
        let mut hi = 0u64;
        for ph in &self.loads {
            lo = lo.min(base + ph.p_vaddr);
            hi = hi.max(base + ph.p_vaddr + ph.p_memsz);
        }
        (
            friscy_core::page_align_down(lo),
            friscy_core::page_align_up(hi),
        )
    }

    /// Load every PT_LOAD segment at `base` (0 for ET_EXEC, the chosen PIE base
    /// for ET_DYN), then merge per-page permissions (spec.md §4.2's two passes).
    pub fn load(&self, m: &mut dyn Machine, base: u64) -> Result<(), PageFault> {
        // Pass 1: copy + zero, with fault-retry.
        for ph in &self.loads {
            let vaddr = base + ph.p_vaddr;
            let file_start = ph.p_offset as usize;
            let file_end = (file_start + ph.p_filesz as usize).min(self.data.len());
            let bytes = &self.data[file_start..file_end];
            copy_with_fault_retry(m, vaddr, bytes)?;
            if ph.p_memsz > ph.p_filesz {
                let zero_start = vaddr + ph.p_filesz;
                let zero_len = (ph.p_memsz - ph.p_filesz) as usize;
                zero_with_fault_retry(m, zero_start, zero_len)?;
            }
        }

        // Pass 2: merge per-page permissions across overlapping segments.
        let (lo, hi) = self.load_span(base);
        let mut page = lo;
        while page < hi {
            let mut attrs = PageAttrs::empty();
            for ph in &self.loads {
                let seg_lo = base + ph.p_vaddr;
                let seg_hi = seg_lo + ph.p_memsz;
                if page < seg_hi && page + friscy_core::PAGE_SIZE > seg_lo {
                    attrs |= ph.attrs();
                }
            }
            if !attrs.is_empty() {
                m.set_page_attrs(page, friscy_core::PAGE_SIZE as usize, attrs)?;
            }
            page += friscy_core::PAGE_SIZE;
        }

        Ok(())
    }
}

/// Copy `bytes` to guest memory at `addr`, retrying through page faults by
/// marking the faulting page RWX first (spec.md §4.2). Logs the first 10
/// retries at `debug!`, then continues silently.
fn copy_with_fault_retry(m: &mut dyn Machine, addr: u64, bytes: &[u8]) -> Result<(), PageFault> {
    let mut offset = 0usize;
    let mut retries = 0u32;
    while offset < bytes.len() {
        match m.write_mem(addr + offset as u64, &bytes[offset..]) {
            Ok(()) => return Ok(()),
            Err(fault) => {
                if retries < 10 {
                    tracing::debug!(addr = fault.addr, retries, "elf load: retrying after page fault");
                }
                retries += 1;
                let page = friscy_core::page_align_down(fault.addr);
                m.set_page_attrs(page, friscy_core::PAGE_SIZE as usize, PageAttrs::RWX)?;
                offset = (fault.addr - addr) as usize;
            }
        }
    }
    Ok(())
}

fn zero_with_fault_retry(m: &mut dyn Machine, addr: u64, len: usize) -> Result<(), PageFault> {
    let mut offset = 0usize;
    let mut retries = 0u32;
    while offset < len {
        match m.zero_mem(addr + offset as u64, len - offset) {
            Ok(()) => return Ok(()),
            Err(fault) => {
                if retries < 10 {
                    tracing::debug!(addr = fault.addr, retries, "elf zero: retrying after page fault");
                }
                retries += 1;
                let page = friscy_core::page_align_down(fault.addr);
                m.set_page_attrs(page, friscy_core::PAGE_SIZE as usize, PageAttrs::RWX)?;
                offset = (fault.addr - addr) as usize;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_elf(e_type: u16, loads: &[(u32, u64, u64, u64, &[u8])]) -> Vec<u8> {
        // loads: (flags, vaddr, filesz, memsz, data)
        let ehsize = 64;
        let phentsize = 56u16;
        let phnum = loads.len() as u16;
        let phoff = ehsize as u64;
        let mut data_off = phoff + phnum as u64 * phentsize as u64;

        let mut buf = vec![0u8; data_off as usize];
        buf[0..4].copy_from_slice(b"\x7fELF");
        buf[4] = 2;
        buf[5] = 1;
        buf[16..18].copy_from_slice(&e_type.to_le_bytes());
        buf[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        buf[24..32].copy_from_slice(&0x1000u64.to_le_bytes()); // entry
        buf[32..40].copy_from_slice(&phoff.to_le_bytes());
        buf[54..56].copy_from_slice(&phentsize.to_le_bytes());
        buf[56..58].copy_from_slice(&phnum.to_le_bytes());

        for (i, (flags, vaddr, filesz, memsz, data)) in loads.iter().enumerate() {
            let ph_off = (phoff as usize) + i * phentsize as usize;
            let this_data_off = data_off;
            data_off += data.len() as u64;

            buf[ph_off..ph_off + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
            buf[ph_off + 4..ph_off + 8].copy_from_slice(&flags.to_le_bytes());
            buf[ph_off + 8..ph_off + 16].copy_from_slice(&this_data_off.to_le_bytes());
            buf[ph_off + 16..ph_off + 24].copy_from_slice(&vaddr.to_le_bytes());
            buf[ph_off + 32..ph_off + 40].copy_from_slice(&filesz.to_le_bytes());
            buf[ph_off + 40..ph_off + 48].copy_from_slice(&memsz.to_le_bytes());

            buf.extend_from_slice(data);
        }
        buf
    }

    #[test]
    fn rejects_bad_magic() {
        assert_eq!(ElfImage::parse(&[0u8; 64]), Err(ElfError::BadMagic));
    }

    #[test]
    fn parses_single_load_segment() {
        let bytes = minimal_elf(ET_EXEC, &[(PF_R | PF_X, 0x1000, 4, 4, b"\x00\x00\x00\x00")]);
        let img = ElfImage::parse(&bytes).unwrap();
        assert_eq!(img.loads.len(), 1);
        assert_eq!(img.entry, 0x1000);
    }

    #[test]
    fn writable_range_covers_only_writable_segments() {
        let bytes = minimal_elf(
            ET_EXEC,
            &[
                (PF_R | PF_X, 0x1000, 4, 4, b"\x00\x00\x00\x00"),
                (PF_R | PF_W, 0x2000, 4, 8, b"\x00\x00\x00\x00"),
            ],
        );
        let img = ElfImage::parse(&bytes).unwrap();
        assert_eq!(img.writable_range(), (0x2000, 0x2008));
    }
}
