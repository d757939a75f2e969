//! `execve` (spec.md §4.10, component C10): shebang resolution, the
//! in-place binary swap, memory-layout reset, and the fresh stack build.
//!
//! Everything here runs on the single `Machine` the calling thread already
//! owns — there is no new address space, only old bytes getting replaced by
//! new ones before any register is touched (spec.md §3's "Execution Context
//! is mutated in place" invariant).

use friscy_core::errno::{neg, EFAULT, ENOENT, ENOEXEC, ENOMEM};
use friscy_core::machine::{Machine, PageAttrs};
use friscy_loader::elf::ElfImage;
use friscy_loader::stack::{build_stack, AuxvInfo};

use crate::execctx::{ExecCtx, LoadedImage};
use crate::guest::{read_cstr, read_cstr_array};
use crate::{Outcome, Syscalls};

/// Deterministic AT_RANDOM fill (spec.md §4.3: "deterministic permitted for
/// reproducibility in tests").
const RANDOM_SEED: [u8; 16] = *b"friscy-execve-rn";

/// Longest line `execve` will scan looking for a `#!` terminator before
/// giving up and treating the file as a plain (non-shebang) binary.
const MAX_SHEBANG_LINE: usize = 255;

/// How many shebang hops `execve` will follow before giving up. The real
/// kernel allows exactly one; we allow a couple more so `#!/usr/bin/env`
/// chains through a second interpreter script still resolve.
const MAX_SHEBANG_DEPTH: u32 = 4;

/// Window reserved below a relocated stack top (spec.md §4.10 step 4: "mark
/// a 64 KiB RW window").
const STACK_WINDOW: u64 = 64 * 1024;

pub fn execve(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let path = match read_cstr(m, a[0]) {
        Ok(p) => p,
        Err(e) => return Outcome::Return(e),
    };
    let argv = match read_cstr_array(m, a[1]) {
        Ok(v) => v,
        Err(e) => return Outcome::Return(e),
    };
    let envp = match read_cstr_array(m, a[2]) {
        Ok(v) => v,
        Err(e) => return Outcome::Return(e),
    };

    match run_execve(sys, m, &path, argv, envp) {
        Ok(()) => {
            crate::metrics::EXEC_COUNT.count();
            Outcome::NoReturn
        }
        Err(errno) => Outcome::Return(errno),
    }
}

/// Resolved target of shebang-following: the bytes to load, the argv vector
/// to build the new stack from, and the original pathname for `AT_EXECFN`.
struct Resolved {
    bytes: Vec<u8>,
    argv: Vec<String>,
}

fn run_execve(
    sys: &mut Syscalls,
    m: &mut dyn Machine,
    path: &str,
    argv: Vec<String>,
    envp: Vec<String>,
) -> Result<(), i64> {
    let resolved = resolve_shebangs(sys, path, argv, &envp, 0)?;

    if resolved.bytes.len() < 4 || &resolved.bytes[0..4] != b"\x7fELF" {
        return Err(neg(ENOEXEC));
    }
    let new_elf = ElfImage::parse(&resolved.bytes).map_err(|_| neg(ENOEXEC))?;

    let same_binary = resolved.bytes == sys.exec.main.bytes;
    if same_binary {
        rebuild_stack_only(sys, m, &resolved.argv, envp, path.to_string())
    } else {
        swap_binary(sys, m, new_elf, resolved.bytes, &resolved.argv, envp, path.to_string())
    }
}

/// Follows `#!interp [arg]` chains (spec.md §4.10 step 2), rewriting argv as
/// `[interp, arg?, script, argv[1..]]` at each hop and special-casing
/// `/usr/bin/env CMD` by substituting CMD's `PATH`-resolved absolute path.
fn resolve_shebangs(
    sys: &Syscalls,
    path: &str,
    argv: Vec<String>,
    envp: &[String],
    depth: u32,
) -> Result<Resolved, i64> {
    let entry = sys.vfs.resolve(path, true).map_err(|_| neg(ENOENT))?;
    let bytes = sys
        .vfs
        .entry(entry)
        .map(|e| e.content.clone())
        .ok_or(neg(ENOENT))?;

    if !bytes.starts_with(b"#!") {
        return Ok(Resolved { bytes, argv });
    }
    if depth >= MAX_SHEBANG_DEPTH {
        return Err(neg(ENOEXEC));
    }

    let line_end = bytes
        .iter()
        .take(MAX_SHEBANG_LINE)
        .position(|&b| b == b'\n')
        .unwrap_or_else(|| bytes.len().min(MAX_SHEBANG_LINE));
    let line = std::str::from_utf8(&bytes[2..line_end]).map_err(|_| neg(EFAULT))?;
    let mut parts = line.trim().splitn(2, char::is_whitespace);
    let interp_raw = parts.next().unwrap_or("").to_string();
    let arg = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    let (interp_path, interp_arg) = if interp_raw == "/usr/bin/env" {
        let cmd = arg.ok_or(neg(ENOEXEC))?;
        (resolve_in_path(sys, &cmd, envp)?, None)
    } else {
        (interp_raw, arg)
    };

    let mut new_argv = vec![interp_path.clone()];
    if let Some(a) = interp_arg {
        new_argv.push(a);
    }
    new_argv.push(path.to_string());
    new_argv.extend(argv.into_iter().skip(1));

    resolve_shebangs(sys, &interp_path, new_argv, envp, depth + 1)
}

/// Searches `PATH` (from `envp`, "the current env" per spec.md §4.10 step 2)
/// for a regular file named `cmd`, returning its absolute path.
fn resolve_in_path(sys: &Syscalls, cmd: &str, envp: &[String]) -> Result<String, i64> {
    if cmd.starts_with('/') {
        return Ok(cmd.to_string());
    }
    let path_var = envp
        .iter()
        .find_map(|kv| kv.strip_prefix("PATH="))
        .unwrap_or("/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin");

    for dir in path_var.split(':') {
        if dir.is_empty() {
            continue;
        }
        let candidate = format!("{}/{}", dir.trim_end_matches('/'), cmd);
        if sys.vfs.resolve(&candidate, true).is_ok() {
            return Ok(candidate);
        }
    }
    Err(neg(ENOENT))
}

/// Same-binary re-exec (e.g. a busybox applet): only the stack is rebuilt,
/// per spec.md §4.10 step 3's "else" branch.
fn rebuild_stack_only(
    sys: &mut Syscalls,
    m: &mut dyn Machine,
    argv: &[String],
    envp: Vec<String>,
    execfn: String,
) -> Result<(), i64> {
    sys.exec.envp = envp.clone();
    sys.exec.execfn = execfn;
    let aux = current_auxv(sys);
    let sp = build_stack(m, sys.exec.original_stack_top, argv, &envp, &aux, RANDOM_SEED)
        .map_err(|_| neg(EFAULT))?;
    jump_to_entry(m, sp, sys.exec.start_pc());
    Ok(())
}

fn current_auxv(sys: &Syscalls) -> AuxvInfo {
    AuxvInfo {
        phdr_vaddr: sys.exec.phdr_vaddr,
        phent: sys.exec.phentsize,
        phnum: sys.exec.phnum,
        entry: sys.exec.main.entry,
        interp_base: sys.exec.interp.as_ref().map(|i| i.base).unwrap_or(0),
        execfn: sys.exec.execfn.clone(),
    }
}

/// The full binary-swap path (spec.md §4.10 step 4): parse, validate arena
/// fit, reload main (+ interpreter if it changed), reset brk/mmap, relocate
/// the stack if needed, and build the fresh stack image.
fn swap_binary(
    sys: &mut Syscalls,
    m: &mut dyn Machine,
    new_elf: ElfImage,
    new_bytes: Vec<u8>,
    argv: &[String],
    envp: Vec<String>,
    execfn: String,
) -> Result<(), i64> {
    let new_base = if new_elf.is_pie() {
        sys.exec.main.base
    } else {
        0
    };
    let (new_lo, new_hi) = new_elf.load_span(new_base);

    let interp_base = sys.exec.interp.as_ref().map(|i| i.base).unwrap_or(friscy_loader::DEFAULT_INTERP_BASE);
    if new_hi > interp_base {
        return Err(neg(ENOMEM));
    }

    // Mark the old main range RW before it gets overwritten, and the new
    // range RW before the loader's fault-retry copy touches it.
    if let Ok(old_elf) = ElfImage::parse(&sys.exec.main.bytes) {
        let (old_lo, old_hi) = old_elf.load_span(sys.exec.main.base);
        let _ = m.set_page_attrs(old_lo, (old_hi - old_lo) as usize, PageAttrs::RW);
    }
    m.set_page_attrs(new_lo, (new_hi - new_lo) as usize, PageAttrs::RW)
        .map_err(|_| neg(ENOMEM))?;
    new_elf.load(m, new_base).map_err(|_| neg(ENOMEM))?;

    let (new_wr_lo, new_wr_hi) = new_elf.writable_range();
    let new_main = LoadedImage {
        bytes: new_bytes,
        base: new_base,
        writable_range: (new_base + new_wr_lo, new_base + new_wr_hi),
        entry: new_base + new_elf.entry,
    };

    let new_interp = match &new_elf.interp {
        Some(interp_path) => {
            let entry = sys.vfs.resolve(interp_path, true).map_err(|_| neg(ENOENT))?;
            let interp_bytes = sys
                .vfs
                .entry(entry)
                .map(|e| e.content.clone())
                .ok_or(neg(ENOENT))?;

            let unchanged = sys
                .exec
                .interp
                .as_ref()
                .map(|cur| cur.bytes == interp_bytes)
                .unwrap_or(false);

            if unchanged {
                sys.exec.interp.clone()
            } else {
                if let Some(cur) = &sys.exec.interp {
                    if let Ok(old_interp_elf) = ElfImage::parse(&cur.bytes) {
                        let (lo, hi) = old_interp_elf.load_span(cur.base);
                        let _ = m.set_page_attrs(lo, (hi - lo) as usize, PageAttrs::RW);
                    }
                }
                let interp_elf = ElfImage::parse(&interp_bytes).map_err(|_| neg(ENOEXEC))?;
                let base = interp_base;
                let (lo, hi) = interp_elf.load_span(base);
                m.set_page_attrs(lo, (hi - lo) as usize, PageAttrs::RW)
                    .map_err(|_| neg(ENOMEM))?;
                interp_elf.load(m, base).map_err(|_| neg(ENOMEM))?;
                let (wr_lo, wr_hi) = interp_elf.writable_range();
                Some(LoadedImage {
                    bytes: interp_bytes,
                    base,
                    writable_range: (base + wr_lo, base + wr_hi),
                    entry: base + interp_elf.entry,
                })
            }
        }
        None => None,
    };

    let new_interp_hi = new_interp
        .as_ref()
        .and_then(|img| ElfImage::parse(&img.bytes).ok().map(|e| e.load_span(img.base).1))
        .unwrap_or(0);
    let max_loaded_end = new_hi.max(new_interp_hi);
    sys.mem
        .reset_for_exec(m, max_loaded_end)
        .map_err(|_| neg(ENOMEM))?;

    // Relocate the stack if the new image overlaps the original stack top
    // (spec.md §4.10 step 4's final bullet).
    let stack_floor = sys.exec.original_stack_top.saturating_sub(STACK_WINDOW);
    if new_hi > stack_floor || new_interp_hi > stack_floor {
        let new_top = interp_base.saturating_sub(friscy_core::PAGE_SIZE);
        m.set_page_attrs(new_top - STACK_WINDOW, STACK_WINDOW as usize, PageAttrs::RW)
            .map_err(|_| neg(ENOMEM))?;
        sys.exec.original_stack_top = new_top;
    }

    sys.exec.main = new_main;
    sys.exec.interp = new_interp;
    sys.exec.phdr_vaddr = new_base + new_elf.phdr_vaddr;
    sys.exec.phentsize = new_elf.phentsize as u64;
    sys.exec.phnum = new_elf.phnum as u64;
    sys.exec.dynamic = sys.exec.interp.is_some();
    sys.exec.envp = envp.clone();
    sys.exec.execfn = execfn;

    let aux = current_auxv(sys);
    let sp = build_stack(m, sys.exec.original_stack_top, argv, &envp, &aux, RANDOM_SEED)
        .map_err(|_| neg(EFAULT))?;
    jump_to_entry(m, sp, sys.exec.start_pc());
    Ok(())
}

/// Zeroes `x1..=x31`, sets `sp`, and jumps to `entry` (spec.md §4.10 step 6).
/// `execve` never sets a return value on success.
fn jump_to_entry(m: &mut dyn Machine, sp: u64, entry: u64) {
    for i in 1..friscy_core::machine::NUM_REGS as u8 {
        m.set_reg(i, 0);
    }
    m.set_reg(2, sp);
    m.set_pc(entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use friscy_testkit::FlatMachine;
    use friscy_vfs::fd::OpenFlags;
    use friscy_vfs::Vfs;

    fn minimal_static_elf(entry: u64) -> Vec<u8> {
        let ehsize = 64usize;
        let phentsize = 56u16;
        let phoff = ehsize as u64;
        let data_off = phoff + phentsize as u64;
        let mut buf = vec![0u8; data_off as usize];
        buf[0..4].copy_from_slice(b"\x7fELF");
        buf[4] = 2;
        buf[5] = 1;
        buf[16..18].copy_from_slice(&friscy_loader::elf::ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&friscy_loader::elf::EM_RISCV.to_le_bytes());
        buf[24..32].copy_from_slice(&entry.to_le_bytes());
        buf[32..40].copy_from_slice(&phoff.to_le_bytes());
        buf[54..56].copy_from_slice(&phentsize.to_le_bytes());
        buf[56..58].copy_from_slice(&1u16.to_le_bytes());

        let ph_off = phoff as usize;
        buf[ph_off..ph_off + 4].copy_from_slice(&friscy_loader::elf::PT_LOAD.to_le_bytes());
        buf[ph_off + 4..ph_off + 8]
            .copy_from_slice(&(friscy_loader::elf::PF_R | friscy_loader::elf::PF_X).to_le_bytes());
        buf[ph_off + 8..ph_off + 16].copy_from_slice(&data_off.to_le_bytes());
        buf[ph_off + 16..ph_off + 24].copy_from_slice(&entry.to_le_bytes());
        buf[ph_off + 32..ph_off + 40].copy_from_slice(&4u64.to_le_bytes());
        buf[ph_off + 40..ph_off + 48].copy_from_slice(&4u64.to_le_bytes());
        buf.extend_from_slice(&[0x13, 0x00, 0x00, 0x00]);
        buf
    }

    fn fresh_exec_ctx(bytes: &[u8], entry: u64) -> (ExecCtx, friscy_mem::MemoryManager) {
        let ctx = ExecCtx {
            main: LoadedImage {
                bytes: bytes.to_vec(),
                base: 0,
                writable_range: (0, 0),
                entry,
            },
            interp: None,
            phdr_vaddr: 0x40,
            phentsize: 56,
            phnum: 1,
            dynamic: false,
            original_stack_top: friscy_loader::DEFAULT_STACK_TOP,
            envp: vec!["HOME=/root".to_string()],
            execfn: "/bin/init".to_string(),
        };
        let mem = friscy_mem::MemoryManager::new(0x2000, 0x1000);
        (ctx, mem)
    }

    fn new_syscalls<'a>(
        vfs: &'a mut Vfs,
        mem: &'a mut friscy_mem::MemoryManager,
        io: &'a friscy_io::IoBridge,
        net: &'a mut friscy_net::NetBridge,
        sched: &'a mut friscy_sched::Scheduler,
        fork: &'a mut friscy_sched::ForkState,
        exec: &'a mut ExecCtx,
        epoll: &'a mut crate::epoll::EpollTable,
        process_exit: &'a mut Option<i32>,
    ) -> Syscalls<'a> {
        Syscalls {
            vfs,
            mem,
            io,
            net,
            sched,
            fork,
            exec,
            epoll,
            process_exit,
        }
    }

    #[test]
    fn same_binary_reexec_only_rebuilds_stack() {
        let bytes = minimal_static_elf(0x1000);
        let mut vfs = Vfs::empty();
        vfs.mkdir("/bin", 0o755).unwrap();
        let fd = vfs
            .open("/bin/busybox", OpenFlags::CREAT | OpenFlags::WRONLY, 0o755)
            .unwrap();
        vfs.write(fd, &bytes).unwrap();
        vfs.close(fd).unwrap();

        let (mut ectx, mut mem) = fresh_exec_ctx(&bytes, 0x1000);
        let mut m = FlatMachine::new(1 << 20);
        m.force_map(0x1000, 0x1000, PageAttrs::RWX);
        m.force_map(ectx.original_stack_top - 0x10000, 0x10000, PageAttrs::RW);

        let io = friscy_io::IoBridge::new();
        let mut net = friscy_net::NetBridge::new();
        let mut sched = friscy_sched::Scheduler::new(1);
        let mut fork = friscy_sched::ForkState::new();
        let mut epoll = crate::epoll::EpollTable::default();
        let mut process_exit = None;

        let mut sys = new_syscalls(
            &mut vfs, &mut mem, &io, &mut net, &mut sched, &mut fork, &mut ectx, &mut epoll,
            &mut process_exit,
        );

        let before_brk = sys.mem.brk_current;
        let result = run_execve(
            &mut sys,
            &mut m,
            "/bin/busybox",
            vec!["sh".to_string()],
            vec!["HOME=/root".to_string()],
        );
        assert!(result.is_ok());
        assert_eq!(sys.mem.brk_current, before_brk);
        assert_eq!(m.pc(), 0x1000);
        assert!(m.reg(2) < sys.exec.original_stack_top);
    }

    #[test]
    fn binary_swap_resets_brk_and_sets_overridden() {
        let old_bytes = minimal_static_elf(0x1000);
        let new_bytes = minimal_static_elf(0x2000);
        let mut vfs = Vfs::empty();
        vfs.mkdir("/bin", 0o755).unwrap();
        let fd = vfs
            .open("/bin/node", OpenFlags::CREAT | OpenFlags::WRONLY, 0o755)
            .unwrap();
        vfs.write(fd, &new_bytes).unwrap();
        vfs.close(fd).unwrap();

        let (mut ectx, mut mem) = fresh_exec_ctx(&old_bytes, 0x1000);
        let mut m = FlatMachine::new(1 << 20);
        m.force_map(0x1000, 0x1000, PageAttrs::RWX);
        m.force_map(0x2000, 0x1000, PageAttrs::RWX);
        m.force_map(ectx.original_stack_top - 0x10000, 0x10000, PageAttrs::RW);

        let io = friscy_io::IoBridge::new();
        let mut net = friscy_net::NetBridge::new();
        let mut sched = friscy_sched::Scheduler::new(1);
        let mut fork = friscy_sched::ForkState::new();
        let mut epoll = crate::epoll::EpollTable::default();
        let mut process_exit = None;

        let mut sys = new_syscalls(
            &mut vfs, &mut mem, &io, &mut net, &mut sched, &mut fork, &mut ectx, &mut epoll,
            &mut process_exit,
        );

        let result = run_execve(
            &mut sys,
            &mut m,
            "/bin/node",
            vec!["node".to_string(), "-e".to_string(), "1".to_string()],
            vec!["PATH=/bin".to_string()],
        );
        assert!(result.is_ok());
        assert!(sys.mem.brk_overridden);
        assert_eq!(m.pc(), 0x2000);
    }

    #[test]
    fn shebang_env_rewrites_interp_through_path() {
        let node_bytes = minimal_static_elf(0x3000);
        let mut vfs = Vfs::empty();
        vfs.mkdir("/bin", 0o755).unwrap();
        vfs.mkdir("/usr", 0o755).unwrap();
        vfs.mkdir("/usr/bin", 0o755).unwrap();
        let fd = vfs
            .open("/usr/bin/node", OpenFlags::CREAT | OpenFlags::WRONLY, 0o755)
            .unwrap();
        vfs.write(fd, &node_bytes).unwrap();
        vfs.close(fd).unwrap();
        let fd = vfs
            .open("/bin/script.js", OpenFlags::CREAT | OpenFlags::WRONLY, 0o755)
            .unwrap();
        vfs.write(fd, b"#!/usr/bin/env node\nconsole.log(1)\n").unwrap();
        vfs.close(fd).unwrap();

        let (mut ectx, mut mem) = fresh_exec_ctx(&node_bytes, 0x3000);
        let io = friscy_io::IoBridge::new();
        let mut net = friscy_net::NetBridge::new();
        let mut sched = friscy_sched::Scheduler::new(1);
        let mut fork = friscy_sched::ForkState::new();
        let mut epoll = crate::epoll::EpollTable::default();
        let mut process_exit = None;
        let sys = new_syscalls(
            &mut vfs, &mut mem, &io, &mut net, &mut sched, &mut fork, &mut ectx, &mut epoll,
            &mut process_exit,
        );

        let resolved = resolve_shebangs(
            &sys,
            "/bin/script.js",
            vec!["script.js".to_string()],
            &["PATH=/usr/bin".to_string()],
            0,
        )
        .unwrap();

        assert_eq!(resolved.bytes, node_bytes);
        assert_eq!(resolved.argv[0], "/usr/bin/node");
        assert_eq!(resolved.argv[1], "/bin/script.js");
    }
}
