//! Process/thread group: `exit`, `clone`, `wait4`, and the small identity
//! syscalls (spec.md §4.9, §4.7, §4.8).

use friscy_core::errno::neg;
use friscy_core::machine::Machine;

use crate::flags::CloneFlags;
use crate::metrics;
use crate::{Outcome, Syscalls};

pub fn exit(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    if sys.fork.in_child() {
        let current_fds = sys.vfs.fds.snapshot_fds();
        let closed = sys.fork.exit_child(m, a[0] as i32, &current_fds);
        for fd in closed {
            let _ = sys.vfs.close(fd);
        }
        return Outcome::NoReturn;
    }
    if sys.sched.thread_exit(m) {
        return Outcome::Return(0);
    }
    *sys.process_exit = Some(a[0] as i32);
    m.stop();
    Outcome::Suspend
}

pub fn exit_group(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    if sys.fork.in_child() {
        let current_fds = sys.vfs.fds.snapshot_fds();
        let closed = sys.fork.exit_child(m, a[0] as i32, &current_fds);
        for fd in closed {
            let _ = sys.vfs.close(fd);
        }
        return Outcome::NoReturn;
    }
    *sys.process_exit = Some(a[0] as i32);
    m.stop();
    Outcome::Suspend
}

/// The four memory windows `ForkState::try_fork` snapshots (spec.md §4.8 step
/// 3, fixed order main-rw, interp-rw, stack, mmap). Zero-size entries are
/// skipped by the fork state itself.
fn fork_regions(sys: &Syscalls, m: &dyn Machine) -> [(u64, u64); 4] {
    let main_lo = sys.exec.main.writable_range.0;
    let main_hi = sys.mem.brk_current.max(sys.exec.main.writable_range.1);
    let main = (main_lo, main_hi.saturating_sub(main_lo));

    let interp = match &sys.exec.interp {
        Some(img) => (img.writable_range.0, img.writable_range.1.saturating_sub(img.writable_range.0)),
        None => (0, 0),
    };

    let sp = m.reg(2);
    let stack = if sys.exec.original_stack_top > sp {
        (sp, sys.exec.original_stack_top - sp)
    } else {
        (0, 0)
    };

    let mmap_lo = sys.mem.heap_start + sys.mem.heap_size;
    let mmap = if sys.mem.mmap_frontier > mmap_lo {
        (mmap_lo, sys.mem.mmap_frontier - mmap_lo)
    } else {
        (0, 0)
    };

    [main, interp, stack, mmap]
}

/// `clone`: the scheduler-thread path for `CLONE_THREAD`, or the `CLONE_VM |
/// CLONE_VFORK` vfork path otherwise (spec.md §4.8's discriminator).
pub fn clone(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let flags = CloneFlags::from_bits_truncate(a[0] & !0xff);
    let child_stack = a[1];

    if flags.contains(CloneFlags::THREAD) {
        let mut regs = [0u64; 32];
        for (i, r) in regs.iter_mut().enumerate() {
            *r = m.reg(i as u8);
        }
        regs[10] = 0;
        let pc = m.pc() + friscy_core::machine::ECALL_WIDTH;
        if child_stack != 0 {
            regs[2] = child_stack;
        }
        let clear_child_tid = if flags.contains(CloneFlags::CHILD_CLEARTID) {
            a[3]
        } else {
            0
        };
        return match sys.sched.spawn(regs, pc, clear_child_tid) {
            Some(tid) => Outcome::Return(tid as i64),
            None => Outcome::Return(neg(friscy_core::errno::EAGAIN)),
        };
    }

    if flags.contains(CloneFlags::VM) && !flags.contains(CloneFlags::VFORK) {
        // CLONE_VM without CLONE_VFORK and without CLONE_THREAD isn't a shape
        // this emulator supports (spec.md §4.8 Non-goals); reject cleanly.
        return Outcome::Return(neg(friscy_core::errno::ENOSYS));
    }

    let regions = fork_regions(sys, m);
    let open_fds = sys.vfs.fds.snapshot_fds();
    metrics::FORK_COUNT.count();
    match sys.fork.try_fork(m, regions, open_fds) {
        Ok(_pid) => Outcome::Return(0),
        Err(e) => Outcome::Return(e),
    }
}

pub fn wait4(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    match sys.fork.wait4() {
        Ok((pid, status)) => {
            if a[1] != 0 {
                let _ = crate::guest::write_checked(m, a[1], &(status as i32).to_le_bytes());
            }
            Outcome::Return(pid as i64)
        }
        Err(e) => Outcome::Return(e),
    }
}

/// The emulator only ever runs one process tree rooted at pid 1; a live fork
/// child reports its own pid instead (spec.md §4.8).
pub fn getpid(sys: &Syscalls) -> Outcome {
    if sys.fork.in_child() {
        Outcome::Return(sys.fork.child_pid().unwrap_or(1) as i64)
    } else {
        Outcome::Return(1)
    }
}

pub fn gettid(sys: &Syscalls) -> Outcome {
    Outcome::Return(sys.sched.current_tid() as i64)
}

pub fn set_tid_address(sys: &mut Syscalls, a: [u64; 6]) -> Outcome {
    sys.sched.set_clear_child_tid(a[0]);
    Outcome::Return(sys.sched.current_tid() as i64)
}

pub fn prlimit64(m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let new_limit = a[2];
    let old_limit = a[3];
    if old_limit != 0 {
        let unlimited = u64::MAX.to_le_bytes();
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&unlimited);
        buf[8..16].copy_from_slice(&unlimited);
        let _ = crate::guest::write_checked(m, old_limit, &buf);
    }
    let _ = new_limit;
    Outcome::Return(0)
}

pub fn getrlimit(m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    if a[1] != 0 {
        let unlimited = u64::MAX.to_le_bytes();
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&unlimited);
        buf[8..16].copy_from_slice(&unlimited);
        let _ = crate::guest::write_checked(m, a[1], &buf);
    }
    Outcome::Return(0)
}

pub fn sched_getaffinity(m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let len = a[1] as usize;
    if a[2] != 0 && len > 0 {
        let mut mask = vec![0u8; len];
        mask[0] = 1;
        let _ = crate::guest::write_checked(m, a[2], &mask);
    }
    Outcome::Return(8)
}

pub fn sched_getparam(m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    if a[1] != 0 {
        let _ = crate::guest::write_checked(m, a[1], &0i32.to_le_bytes());
    }
    Outcome::Return(0)
}

pub fn getresuid(m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    for ptr in [a[0], a[1], a[2]] {
        if ptr != 0 {
            let _ = crate::guest::write_checked(m, ptr, &0u32.to_le_bytes());
        }
    }
    Outcome::Return(0)
}
