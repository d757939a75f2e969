//! Initial stack image construction per the Linux RISC-V ELF ABI (spec.md §4.3,
//! component C3).

use friscy_core::machine::Machine;

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_BASE: u64 = 7;
pub const AT_ENTRY: u64 = 9;
pub const AT_UID: u64 = 11;
pub const AT_EUID: u64 = 12;
pub const AT_GID: u64 = 13;
pub const AT_EGID: u64 = 14;
pub const AT_PLATFORM: u64 = 15;
pub const AT_HWCAP: u64 = 16;
pub const AT_CLKTCK: u64 = 17;
pub const AT_SECURE: u64 = 23;
pub const AT_RANDOM: u64 = 25;
pub const AT_EXECFN: u64 = 31;

/// IMAFDC: Integer, Multiply, Atomic, Float, Double, Compressed.
pub const HWCAP_RISCV_IMAFDC: u64 = 0x112D;
pub const CLOCK_TICKS_PER_SEC: u64 = 100;

/// Everything the stack builder needs to know about the loaded image
/// (spec.md §4.3's required auxv entries).
pub struct AuxvInfo {
    pub phdr_vaddr: u64,
    pub phent: u64,
    pub phnum: u64,
    pub entry: u64,
    pub interp_base: u64,
    pub execfn: String,
}

/// 16 bytes handed back via AT_RANDOM. Deterministic input is accepted so
/// tests are reproducible; callers that want real entropy pass host-sourced
/// bytes in.
pub fn build_stack(
    m: &mut dyn Machine,
    stack_top: u64,
    argv: &[String],
    envp: &[String],
    aux: &AuxvInfo,
    random16: [u8; 16],
) -> Result<u64, friscy_core::machine::PageFault> {
    let mut sp = stack_top;

    // 1. platform string, 8-byte align.
    let platform_ptr = write_cstr(m, &mut sp, "riscv64")?;
    align_down(&mut sp, 8);

    // 2. 16 random bytes.
    sp -= 16;
    m.write_mem(sp, &random16)?;
    let random_ptr = sp;

    // 3. executable filename, 8-byte align.
    let execfn_ptr = write_cstr(m, &mut sp, &aux.execfn)?;
    align_down(&mut sp, 8);

    // 4. environment strings (reverse order so recorded pointers read
    //    front-to-back once the stack has grown downward).
    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for s in envp.iter().rev() {
        envp_ptrs.push(write_cstr(m, &mut sp, s)?);
    }
    envp_ptrs.reverse();

    // 5. argument strings.
    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for s in argv.iter().rev() {
        argv_ptrs.push(write_cstr(m, &mut sp, s)?);
    }
    argv_ptrs.reverse();

    // 6. 16-byte align SP.
    align_down(&mut sp, 16);

    let auxv_pairs: Vec<(u64, u64)> = vec![
        (AT_PHDR, aux.phdr_vaddr),
        (AT_PHENT, aux.phent),
        (AT_PHNUM, aux.phnum),
        (AT_ENTRY, aux.entry),
        (AT_BASE, aux.interp_base),
        (AT_PAGESZ, friscy_core::PAGE_SIZE),
        (AT_UID, 0),
        (AT_EUID, 0),
        (AT_GID, 0),
        (AT_EGID, 0),
        (AT_HWCAP, HWCAP_RISCV_IMAFDC),
        (AT_CLKTCK, CLOCK_TICKS_PER_SEC),
        (AT_SECURE, 0),
        (AT_RANDOM, random_ptr),
        (AT_EXECFN, execfn_ptr),
        (AT_PLATFORM, platform_ptr),
        (AT_NULL, 0),
    ];

    // 7. argc + argv[] + NULL + envp[] + NULL + auxv[].
    let total_words = 1 // argc
        + argv_ptrs.len() + 1
        + envp_ptrs.len() + 1
        + auxv_pairs.len() * 2;
    sp -= (total_words as u64) * 8;
    // Ensure the 16-byte alignment from step 6 survives the reservation.
    align_down(&mut sp, 16);

    let base = sp;
    let mut word = base;
    write_u64(m, &mut word, argv.len() as u64)?;
    for p in &argv_ptrs {
        write_u64(m, &mut word, *p)?;
    }
    write_u64(m, &mut word, 0)?;
    for p in &envp_ptrs {
        write_u64(m, &mut word, *p)?;
    }
    write_u64(m, &mut word, 0)?;
    for (key, val) in &auxv_pairs {
        write_u64(m, &mut word, *key)?;
        write_u64(m, &mut word, *val)?;
    }

    Ok(base)
}

fn align_down(sp: &mut u64, align: u64) {
    *sp &= !(align - 1);
}

fn write_cstr(
    m: &mut dyn Machine,
    sp: &mut u64,
    s: &str,
) -> Result<u64, friscy_core::machine::PageFault> {
    let bytes = s.as_bytes();
    *sp -= bytes.len() as u64 + 1;
    m.write_mem(*sp, bytes)?;
    m.write_mem(*sp + bytes.len() as u64, &[0u8])?;
    Ok(*sp)
}

fn write_u64(
    m: &mut dyn Machine,
    cursor: &mut u64,
    value: u64,
) -> Result<(), friscy_core::machine::PageFault> {
    m.write_mem(*cursor, &value.to_le_bytes())?;
    *cursor += 8;
    Ok(())
}
