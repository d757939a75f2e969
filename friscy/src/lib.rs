//! Top-level assembly: bundles every `friscy-*` component behind one
//! `GuestState`, analogous to how `libkrun`'s `Machine` bundles `devices`,
//! `vmm`, and the virtio backends behind one handle (see
//! `examples/orbstack-swift-nio/src/libkrun/src/lib.rs`). This is the one
//! crate the host embedder talks to.

use std::sync::Once;
use std::time::Duration;

use friscy_core::machine::Machine;
use friscy_io::IoBridge;
use friscy_mem::MemoryManager;
use friscy_net::NetBridge;
use friscy_sched::{ForkState, Scheduler};
use friscy_syscall::epoll::EpollTable;
use friscy_syscall::execctx::{ExecCtx, LoadedImage};
use friscy_syscall::{Outcome, Syscalls};
use friscy_vfs::entry::FileType;
use friscy_vfs::Vfs;

mod config;
pub use config::GuestConfig;

/// A fixed seed for `AT_RANDOM`, distinct from the exec engine's own, so a
/// stack trace can tell an initial boot apart from a same-process `execve`.
const BOOT_RANDOM: [u8; 16] = *b"friscy-initial16";

#[derive(Debug, thiserror::Error)]
pub enum GuestInitError {
    #[error("argv[0] is empty")]
    EmptyArgv,
    #[error("resolving {0:?} in the rootfs: {1}")]
    Lookup(String, friscy_vfs::VfsError),
    #[error("{0:?} is not a regular file")]
    NotAFile(String),
    #[error("loading program image: {0}")]
    Load(#[from] friscy_loader::LoadError),
    #[error("building initial stack: {0}")]
    Stack(#[from] friscy_core::machine::PageFault),
}

/// Every `friscy-*` component a running guest needs, bundled into one value
/// instead of the statics spec.md's design note explicitly rejects (§3,
/// "Globals -> explicit context").
pub struct GuestState {
    pub vfs: Vfs,
    pub mem: MemoryManager,
    pub io: IoBridge,
    pub net: NetBridge,
    pub sched: Scheduler,
    pub fork: ForkState,
    pub exec: ExecCtx,
    pub epoll: EpollTable,
    process_exit: Option<i32>,
}

impl GuestState {
    /// Hydrate a VFS from `rootfs_tar`, load `config.argv[0]` (following a
    /// `PT_INTERP` if present) and build the initial stack on `m` (spec.md
    /// §4.1-§4.3's data flow, minus the syscall-thread handoff, which the
    /// embedder owns).
    pub fn new(config: GuestConfig, rootfs_tar: &[u8], m: &mut dyn Machine) -> Result<Self, GuestInitError> {
        let vfs = Vfs::load_tar(rootfs_tar);

        let argv0 = config.argv.first().cloned().ok_or(GuestInitError::EmptyArgv)?;
        let main_bytes = read_regular_file(&vfs, &argv0)?;

        let interp_bytes = friscy_loader::elf::ElfImage::parse(&main_bytes)
            .ok()
            .and_then(|img| img.interp.clone());
        let interp_content = match &interp_bytes {
            Some(path) => Some(read_regular_file(&vfs, path)?),
            None => None,
        };

        let prog = friscy_loader::load_program(m, &main_bytes, interp_content.as_deref())?;

        let aux = prog.auxv_info(argv0.clone());
        let sp = friscy_loader::build_stack(
            m,
            friscy_loader::DEFAULT_STACK_TOP,
            &config.argv,
            &config.envp,
            &aux,
            BOOT_RANDOM,
        )?;

        for r in 1..friscy_core::machine::NUM_REGS as u8 {
            m.set_reg(r, 0);
        }
        m.set_reg(2, sp);
        m.set_pc(prog.start_pc);

        let (_, main_hi) = prog.main.load_span(prog.main_base);
        let heap_start = main_hi.max(
            prog.interp
                .as_ref()
                .map(|i| i.load_span(prog.interp_base).1)
                .unwrap_or(0),
        );
        let heap_start = friscy_core::page_align_up(heap_start);

        let main = LoadedImage {
            bytes: main_bytes,
            base: prog.main_base,
            writable_range: prog.writable_range(),
            entry: prog.main_base + prog.main.entry,
        };
        let interp = prog.interp.as_ref().map(|i| LoadedImage {
            bytes: interp_content.unwrap_or_default(),
            base: prog.interp_base,
            writable_range: prog
                .interp_writable_range()
                .unwrap_or((prog.interp_base, prog.interp_base)),
            entry: prog.interp_base + i.entry,
        });

        let exec = ExecCtx {
            main,
            interp,
            phdr_vaddr: aux.phdr_vaddr,
            phentsize: aux.phent,
            phnum: aux.phnum,
            dynamic: prog.interp.is_some(),
            original_stack_top: friscy_loader::DEFAULT_STACK_TOP,
            envp: config.envp,
            execfn: argv0,
        };

        let mut sched = Scheduler::new(1);
        sched.strict_futex_deadlock = config.strict_futex_deadlock;

        let mut io = IoBridge::new();
        io.set_term_size(config.term_rows, config.term_cols);

        Ok(GuestState {
            vfs,
            mem: MemoryManager::new(heap_start, 0),
            io,
            net: NetBridge::new(),
            sched,
            fork: ForkState::new(),
            exec,
            epoll: EpollTable::default(),
            process_exit: None,
        })
    }

    /// Dispatch one syscall trapped on `m`, borrowing every component
    /// together for the duration of the call (spec.md §4.9, component C9).
    pub fn dispatch(&mut self, m: &mut dyn Machine) -> Outcome {
        let mut sys = Syscalls {
            vfs: &mut self.vfs,
            mem: &mut self.mem,
            io: &self.io,
            net: &mut self.net,
            sched: &mut self.sched,
            fork: &mut self.fork,
            exec: &mut self.exec,
            epoll: &mut self.epoll,
            process_exit: &mut self.process_exit,
        };
        friscy_syscall::dispatch(&mut sys, m)
    }

    /// `Some(status)` once `exit`/`exit_group` ran on the main thread outside
    /// a fork child; checked by the embedder after a `Suspend` outcome turns
    /// out not to be a blocking read (spec.md §4.9's note on `process_exit`).
    pub fn exit_status(&self) -> Option<i32> {
        self.process_exit
    }

    pub fn push_stdin(&self, bytes: &[u8]) {
        self.io.push(bytes);
    }

    pub fn stdin_eof(&self) {
        self.io.set_eof();
    }

    pub fn resize_terminal(&self, rows: u32, cols: u32) {
        self.io.set_term_size(rows, cols);
    }
}

fn read_regular_file(vfs: &Vfs, path: &str) -> Result<Vec<u8>, GuestInitError> {
    let id = vfs
        .resolve(path, true)
        .map_err(|e| GuestInitError::Lookup(path.to_string(), e))?;
    let entry = vfs
        .entry(id)
        .ok_or_else(|| GuestInitError::NotAFile(path.to_string()))?;
    if entry.kind != FileType::Regular {
        return Err(GuestInitError::NotAFile(path.to_string()));
    }
    Ok(entry.content.clone())
}

/// `tracing_subscriber` + periodic `counter` dump, initialized once no
/// matter how many `GuestState`s a process creates (grounded on
/// `examples/orbstack-swift-nio/src/libkrun/src/lib.rs`'s `init_logger_once`).
pub fn init_logger_once() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt::init();
        if let Some(filter) = counter::default_env_filter() {
            std::mem::forget(counter::display_every(filter, Duration::from_millis(1000)));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use friscy_testkit::FlatMachine;
    use friscy_vfs::fd::OpenFlags;

    // One PT_LOAD, RX, containing a single nop at vaddr 0x1000 (mirrors
    // friscy-loader's own fixture).
    fn static_elf_with_nop_at_entry() -> Vec<u8> {
        use friscy_loader::elf;

        let phentsize = 56u16;
        let phoff = 64u64;
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

        let ph = phoff as usize;
        buf[ph..ph + 4].copy_from_slice(&elf::PT_LOAD.to_le_bytes());
        buf[ph + 4..ph + 8].copy_from_slice(&(elf::PF_R | elf::PF_X).to_le_bytes());
        buf[ph + 8..ph + 16].copy_from_slice(&data_off.to_le_bytes());
        buf[ph + 16..ph + 24].copy_from_slice(&0x1000u64.to_le_bytes());
        buf[ph + 32..ph + 40].copy_from_slice(&4u64.to_le_bytes());
        buf[ph + 40..ph + 48].copy_from_slice(&4u64.to_le_bytes());

        buf.extend_from_slice(&[0x13, 0x00, 0x00, 0x00]);
        buf
    }

    fn tar_with_binary(path: &str, bytes: &[u8]) -> Vec<u8> {
        let mut vfs = friscy_vfs::Vfs::empty();
        let fd = vfs
            .open(path, OpenFlags::CREAT | OpenFlags::WRONLY, 0o755)
            .unwrap();
        vfs.write(fd, bytes).unwrap();
        vfs.close(fd).unwrap();
        vfs.save_tar()
    }

    #[test]
    fn boots_static_binary_and_points_pc_at_entry() {
        let tar = tar_with_binary("/bin/init", &static_elf_with_nop_at_entry());
        let mut m = FlatMachine::new(64 * 1024 * 1024);
        let config = GuestConfig {
            argv: vec!["/bin/init".to_string()],
            envp: vec!["HOME=/root".to_string()],
            term_rows: 24,
            term_cols: 80,
            strict_futex_deadlock: false,
        };

        let guest = GuestState::new(config, &tar, &mut m).unwrap();
        assert_eq!(m.pc(), 0x1000);
        assert!(m.reg(2) < friscy_loader::DEFAULT_STACK_TOP);
        assert!(!guest.exec.dynamic);
        assert_eq!(guest.exec.execfn, "/bin/init");
    }

    #[test]
    fn missing_binary_is_a_lookup_error() {
        let tar = tar_with_binary("/bin/init", &static_elf_with_nop_at_entry());
        let mut m = FlatMachine::new(64 * 1024 * 1024);
        let config = GuestConfig {
            argv: vec!["/bin/missing".to_string()],
            envp: vec![],
            term_rows: 24,
            term_cols: 80,
            strict_futex_deadlock: false,
        };

        let err = GuestState::new(config, &tar, &mut m).unwrap_err();
        assert!(matches!(err, GuestInitError::Lookup(..)));
    }

    #[test]
    fn dispatch_routes_getpid_through_process_handler() {
        let tar = tar_with_binary("/bin/init", &static_elf_with_nop_at_entry());
        let mut m = FlatMachine::new(64 * 1024 * 1024);
        let config = GuestConfig {
            argv: vec!["/bin/init".to_string()],
            envp: vec![],
            term_rows: 24,
            term_cols: 80,
            strict_futex_deadlock: false,
        };
        let mut guest = GuestState::new(config, &tar, &mut m).unwrap();

        m.set_reg(17, friscy_syscall::numbers::GETPID);
        match guest.dispatch(&mut m) {
            Outcome::Return(pid) => assert_eq!(pid, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
