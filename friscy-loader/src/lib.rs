//! ELF loading and initial-stack construction (spec.md §4.2/§4.3, components
//! C2 + C3). This crate knows nothing about the VFS or the syscall dispatch
//! table; callers resolve `PT_INTERP` paths and hand both binaries in as raw
//! bytes.

pub mod elf;
pub mod stack;

pub use elf::{ElfError, ElfImage};
pub use stack::{build_stack, AuxvInfo};

use friscy_core::machine::Machine;

/// Address the main binary is loaded at when it is `ET_EXEC` (fixed) — for
/// `ET_DYN` binaries this is instead the chosen PIE load bias. Kept well
/// inside the Sv39 39-bit user half (`< 0x40_0000_0000`).
pub const DEFAULT_PIE_BASE: u64 = 0x0000_0001_0000_0000;
/// Address the dynamic linker is loaded at, above the PIE range and below the
/// stack so the three never collide.
pub const DEFAULT_INTERP_BASE: u64 = 0x0000_0002_0000_0000;
/// Top of the initial stack (argv/envp/auxv grow down from here), near the
/// top of the Sv39 user address range.
pub const DEFAULT_STACK_TOP: u64 = 0x0000_003f_ffff_f000;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("main executable: {0}")]
    Main(ElfError),
    #[error("interpreter: {0}")]
    Interp(ElfError),
    #[error("page fault while loading: {0}")]
    Fault(#[from] friscy_core::machine::PageFault),
}

/// Outcome of loading a program, sufficient to build the initial stack and to
/// seed an `ExecCtx` in the syscall layer (spec.md §3's Execution Context).
pub struct LoadedProgram {
    pub main: ElfImage,
    pub main_base: u64,
    pub interp: Option<ElfImage>,
    pub interp_base: u64,
    /// Where the Machine's PC should start: the interpreter's entry if one
    /// was loaded, otherwise the main binary's entry (spec.md §4.3's AT_ENTRY
    /// is always the *main* binary's entry regardless of this).
    pub start_pc: u64,
}

impl LoadedProgram {
    pub fn writable_range(&self) -> (u64, u64) {
        let (lo, hi) = self.main.writable_range();
        (self.main_base + lo, self.main_base + hi)
    }

    pub fn interp_writable_range(&self) -> Option<(u64, u64)> {
        self.interp.as_ref().map(|i| {
            let (lo, hi) = i.writable_range();
            (self.interp_base + lo, self.interp_base + hi)
        })
    }

    pub fn auxv_info(&self, execfn: String) -> AuxvInfo {
        AuxvInfo {
            phdr_vaddr: self.main_base + self.main.phdr_vaddr,
            phent: self.main.phentsize as u64,
            phnum: self.main.phnum as u64,
            entry: self.main_base + self.main.entry,
            interp_base: if self.interp.is_some() {
                self.interp_base
            } else {
                0
            },
            execfn,
        }
    }
}

/// Parse and load `main_bytes` (and `interp_bytes`, if the main binary has a
/// `PT_INTERP` and the caller resolved it) into the Machine, choosing PIE
/// bases deterministically (spec.md §4.2).
pub fn load_program(
    m: &mut dyn Machine,
    main_bytes: &[u8],
    interp_bytes: Option<&[u8]>,
) -> Result<LoadedProgram, LoadError> {
    let main = ElfImage::parse(main_bytes).map_err(LoadError::Main)?;
    let main_base = if main.is_pie() { DEFAULT_PIE_BASE } else { 0 };
    main.load(m, main_base)?;

    let (interp, interp_base, start_pc) = match (main.interp.as_ref(), interp_bytes) {
        (Some(_), Some(bytes)) => {
            let interp = ElfImage::parse(bytes).map_err(LoadError::Interp)?;
            let base = if interp.is_pie() {
                DEFAULT_INTERP_BASE
            } else {
                0
            };
            interp.load(m, base)?;
            let entry = base + interp.entry;
            (Some(interp), base, entry)
        }
        _ => (None, 0, main_base + main.entry),
    };

    Ok(LoadedProgram {
        main,
        main_base,
        interp,
        interp_base,
        start_pc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use friscy_testkit::FlatMachine;

    fn static_elf_with_nop_at_entry() -> Vec<u8> {
        // One PT_LOAD, RX, containing a single 4-byte instruction at vaddr 0x1000.
        let ehsize = 64usize;
        let phentsize = 56u16;
        let phoff = ehsize as u64;
        let data_off = phoff + phentsize as u64;
        let mut buf = vec![0u8; data_off as usize];
        buf[0..4].copy_from_slice(b"\x7fELF");
        buf[4] = 2;
        buf[5] = 1;
        buf[16..18].copy_from_slice(&elf::ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&elf::EM_RISCV.to_le_bytes());
        buf[24..32].copy_from_slice(&0x1000u64.to_le_bytes());
        buf[32..40].copy_from_slice(&phoff.to_le_bytes());
        buf[54..56].copy_from_slice(&phentsize.to_le_bytes());
        buf[56..58].copy_from_slice(&1u16.to_le_bytes());

        let ph_off = phoff as usize;
        buf[ph_off..ph_off + 4].copy_from_slice(&elf::PT_LOAD.to_le_bytes());
        buf[ph_off + 4..ph_off + 8]
            .copy_from_slice(&(elf::PF_R | elf::PF_X).to_le_bytes());
        buf[ph_off + 8..ph_off + 16].copy_from_slice(&data_off.to_le_bytes());
        buf[ph_off + 16..ph_off + 24].copy_from_slice(&0x1000u64.to_le_bytes());
        buf[ph_off + 32..ph_off + 40].copy_from_slice(&4u64.to_le_bytes());
        buf[ph_off + 40..ph_off + 48].copy_from_slice(&4u64.to_le_bytes());

        buf.extend_from_slice(&[0x13, 0x00, 0x00, 0x00]); // addi x0, x0, 0 (nop)
        buf
    }

    #[test]
    fn loads_static_binary_at_fixed_base() {
        let bytes = static_elf_with_nop_at_entry();
        let mut machine = FlatMachine::new(16 * 1024 * 1024);
        let prog = load_program(&mut machine, &bytes, None).unwrap();
        assert_eq!(prog.main_base, 0);
        assert_eq!(prog.start_pc, 0x1000);

        let mut word = [0u8; 4];
        machine.read_mem(0x1000, &mut word).unwrap();
        assert_eq!(word, [0x13, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn builds_stack_with_argv_and_auxv() {
        let bytes = static_elf_with_nop_at_entry();
        let mut machine = FlatMachine::new(16 * 1024 * 1024);
        let prog = load_program(&mut machine, &bytes, None).unwrap();
        let aux = prog.auxv_info("/bin/init".to_string());

        let argv = vec!["/bin/init".to_string(), "-x".to_string()];
        let envp = vec!["HOME=/root".to_string()];
        let sp = build_stack(
            &mut machine,
            DEFAULT_STACK_TOP,
            &argv,
            &envp,
            &aux,
            [0xAB; 16],
        )
        .unwrap();

        assert!(sp < DEFAULT_STACK_TOP);
        assert_eq!(sp % 16, 0);

        let mut argc_bytes = [0u8; 8];
        machine.read_mem(sp, &mut argc_bytes).unwrap();
        assert_eq!(u64::from_le_bytes(argc_bytes), 2);
    }
}
