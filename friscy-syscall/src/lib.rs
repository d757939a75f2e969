//! Syscall dispatch and the exec engine (spec.md §4.9/§4.10, components C9 +
//! C10). This is the one crate that depends on every other `friscy-*`
//! component: each handler mutates the VFS, memory manager, I/O bridge,
//! network bridge, scheduler, or fork state and writes a result back through
//! the `Machine` trait. No handler ever lets a `Result` escape across the
//! dispatch boundary — every failure becomes a negative errno (spec.md §7).

pub mod epoll;
pub mod execctx;
pub mod exec;
pub mod flags;
pub mod guest;
pub mod handlers;
pub mod metrics;
pub mod numbers;
pub mod path_at;
pub mod stat;

use friscy_core::errno::neg;
use friscy_core::machine::{syscall_args, Machine};
use friscy_io::IoBridge;
use friscy_mem::MemoryManager;
use friscy_net::NetBridge;
use friscy_sched::{ForkState, Scheduler};
use friscy_vfs::Vfs;

use epoll::EpollTable;
use execctx::ExecCtx;

/// What the dispatcher did with a syscall, so the embedding driver loop
/// knows whether to touch the Machine's result register itself.
#[derive(Debug)]
pub enum Outcome {
    /// Ordinary return; `dispatch` has already called `Machine::set_result`.
    Return(i64),
    /// `execve` succeeded, or a fork child just exited and restored the
    /// parent: registers and PC were already rewritten by the handler.
    NoReturn,
    /// The handler rewound PC and called `Machine::stop()` — a blocking
    /// stdin read or a ready-nothing `ppoll`/`epoll_pwait` (spec.md §5).
    Suspend,
}

/// Every piece of per-session state a syscall handler might touch, borrowed
/// together for the duration of one `dispatch` call (spec.md §3's "Globals
/// -> explicit context" design note, realized as a context struct rather
/// than a bundle of statics).
pub struct Syscalls<'a> {
    pub vfs: &'a mut Vfs,
    pub mem: &'a mut MemoryManager,
    pub io: &'a IoBridge,
    pub net: &'a mut NetBridge,
    pub sched: &'a mut Scheduler,
    pub fork: &'a mut ForkState,
    pub exec: &'a mut ExecCtx,
    pub epoll: &'a mut EpollTable,
    /// Set by `exit`/`exit_group` on the main thread outside a fork child;
    /// the embedder (`friscy::GuestState`) reads this after `dispatch`
    /// returns `Outcome::Suspend` to learn the process actually ended
    /// rather than merely blocked on I/O.
    pub process_exit: &'a mut Option<i32>,
}

/// Reads `a7` and dispatches to the matching handler (spec.md §4.9). Numbers
/// with no handler here log at `warn!` and return `-ENOSYS`, matching
/// spec.md's guidance that unknown syscalls never panic the dispatcher.
pub fn dispatch(sys: &mut Syscalls, m: &mut dyn Machine) -> Outcome {
    let nr = m.reg(17);
    let a = syscall_args(m);
    metrics::SYSCALLS_DISPATCHED.count();

    use handlers::*;
    use numbers::*;

    let outcome = match nr {
        EXIT => process::exit(sys, m, a),
        EXIT_GROUP => process::exit_group(sys, m, a),
        CLONE => process::clone(sys, m, a),
        EXECVE => exec::execve(sys, m, a),
        WAIT4 => process::wait4(sys, m, a),
        GETPID => process::getpid(sys),
        GETPPID => Outcome::Return(1),
        GETTID => process::gettid(sys),
        GETUID | GETEUID | GETGID | GETEGID => Outcome::Return(0),
        SET_TID_ADDRESS => process::set_tid_address(sys, a),
        SET_ROBUST_LIST => Outcome::Return(0),
        PRCTL => Outcome::Return(0),
        PRLIMIT64 => process::prlimit64(m, a),
        GETRLIMIT => process::getrlimit(m, a),
        KILL | TKILL | TGKILL => Outcome::Return(0),
        SCHED_YIELD => {
            sys.sched.yield_now(m);
            Outcome::Return(0)
        }
        SCHED_GETAFFINITY => process::sched_getaffinity(m, a),
        SCHED_GETSCHEDULER => Outcome::Return(0),
        SCHED_GETPARAM => process::sched_getparam(m, a),
        SCHED_SETSCHEDULER => Outcome::Return(0),
        RT_SIGRETURN => Outcome::Return(neg(friscy_core::errno::ENOSYS)),
        SETUID => Outcome::Return(0),
        GETRESUID => process::getresuid(m, a),
        GETRESGID => process::getresuid(m, a),
        TIMES => Outcome::Return(0),
        GETPGID => Outcome::Return(1),
        GETGROUPS => Outcome::Return(0),
        CAPGET => Outcome::Return(neg(friscy_core::errno::EPERM)),
        MEMBARRIER => Outcome::Return(0),
        RSEQ | IO_URING_SETUP | RISCV_HWPROBE => Outcome::Return(neg(friscy_core::errno::ENOSYS)),

        OPENAT => fileio::openat(sys, m, a),
        CLOSE => fileio::close(sys, a),
        READ => fileio::read(sys, m, a),
        WRITE => fileio::write(sys, m, a),
        READV => fileio::readv(sys, m, a),
        WRITEV => fileio::writev(sys, m, a),
        PREAD64 => fileio::pread64(sys, m, a),
        PWRITE64 => fileio::pwrite64(sys, m, a),
        PWRITEV => fileio::pwritev(sys, m, a),
        LSEEK => fileio::lseek(sys, a),
        GETDENTS64 => fileio::getdents64(sys, m, a),
        NEWFSTATAT => fileio::newfstatat(sys, m, a),
        FSTAT => fileio::fstat(sys, m, a),
        STATX => fileio::statx(sys, m, a),
        READLINKAT => fileio::readlinkat(sys, m, a),
        FACCESSAT | FACCESSAT2 => fileio::faccessat(sys, m, a),
        GETCWD => fileio::getcwd(sys, m, a),
        CHDIR => fileio::chdir(sys, m, a),
        MKDIRAT => fileio::mkdirat(sys, m, a),
        UNLINKAT => fileio::unlinkat(sys, m, a),
        SYMLINKAT => fileio::symlinkat(sys, m, a),
        LINKAT => fileio::linkat(sys, m, a),
        RENAMEAT => fileio::renameat(sys, m, a),
        FTRUNCATE => fileio::ftruncate(sys, a),
        FSYNC => Outcome::Return(0),
        FCHMOD | FCHMODAT | FCHOWNAT => Outcome::Return(0),
        FLOCK => Outcome::Return(0),
        CLOSE_RANGE => fileio::close_range(sys, a),
        SENDFILE => fileio::sendfile(sys, m, a),

        BRK => {
            let v = sys.mem.brk(m, a[0]);
            Outcome::Return(v as i64)
        }
        MMAP => {
            sys.sched.on_preemption_point(m);
            memory::mmap(sys, m, a)
        }
        MUNMAP => Outcome::Return(sys.mem.munmap(m, a[0], a[1] as usize)),
        MPROTECT => {
            let prot = flags::MmapProt::from_bits_truncate(a[2]).to_page_attrs();
            Outcome::Return(sys.mem.mprotect(m, a[0], a[1] as usize, prot))
        }
        MADVISE => Outcome::Return(0),
        MREMAP => Outcome::Return(neg(friscy_core::errno::ENOSYS)),

        RT_SIGACTION | RT_SIGPROCMASK | SIGALTSTACK => Outcome::Return(0),

        CLOCK_GETTIME => {
            sys.sched.on_preemption_point(m);
            misc::clock_gettime(m, a)
        }
        CLOCK_GETRES => misc::clock_getres(m, a),
        NANOSLEEP => {
            sys.sched.yield_now(m);
            Outcome::Return(0)
        }

        PIPE2 => iomisc::pipe2(sys, m, a),
        DUP => iomisc::dup(sys, a),
        DUP3 => iomisc::dup3(sys, a),
        FCNTL => iomisc::fcntl(sys, a),
        PPOLL => iomisc::ppoll(sys, m, a),
        PSELECT6 => iomisc::pselect6(sys, m, a),
        EVENTFD2 => iomisc::eventfd2(sys, a),

        EPOLL_CREATE1 => iomisc::epoll_create1(sys, a),
        EPOLL_CTL => iomisc::epoll_ctl(sys, m, a),
        EPOLL_PWAIT => iomisc::epoll_pwait(sys, m, a),

        SOCKET => Outcome::Return(sys.net.socket(a[0] as i32, a[1] as i32, a[2] as i32)),
        BIND => sockets::bind(sys, m, a),
        LISTEN => Outcome::Return(sys.net.listen(a[0] as i32, a[1] as i32)),
        ACCEPT => sockets::accept(sys, m, a, 0),
        ACCEPT4 => sockets::accept(sys, m, a, a[3] as i32),
        CONNECT => sockets::connect(sys, m, a),
        SENDTO => sockets::sendto(sys, m, a),
        RECVFROM => sockets::recvfrom(sys, m, a),
        SENDMSG => sockets::sendmsg(sys, m, a),
        RECVMSG => sockets::recvmsg(sys, m, a),
        GETSOCKOPT => sockets::getsockopt(sys, m, a),
        SETSOCKOPT => sockets::setsockopt(sys, m, a),
        SHUTDOWN => Outcome::Return(sys.net.shutdown(a[0] as i32, a[1] as i32)),
        GETSOCKNAME => sockets::getsockname(sys, m, a),
        GETPEERNAME => sockets::getpeername(sys, m, a),
        SOCKETPAIR => sockets::socketpair(sys, m, a),

        IOCTL => misc::ioctl(sys, m, a),
        UNAME => misc::uname(m, a),
        SYSINFO => misc::sysinfo(m, a),
        GETRANDOM => misc::getrandom(m, a),
        UMASK => Outcome::Return(0o022),
        FUTEX => misc::futex(sys, m, a),

        _ => {
            metrics::SYSCALLS_UNKNOWN.count();
            tracing::warn!(nr, "unimplemented syscall");
            Outcome::Return(neg(friscy_core::errno::ENOSYS))
        }
    };

    if let Outcome::Return(v) = outcome {
        m.set_result(v);
    }
    outcome
}
