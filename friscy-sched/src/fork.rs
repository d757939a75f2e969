//! Single-slot vfork emulation (spec.md §4.8, component C8).
//!
//! `CLONE_VM | CLONE_VFORK` without `CLONE_THREAD` runs the child in place on
//! the current `Machine`, sharing memory with the parent; exiting the child
//! replays four snapshotted memory regions back over the parent's state.
//! Only one generation is ever in flight — a second `clone` while
//! `in_child` is set is rejected with `EAGAIN`, matching spec.md §3's
//! invariant on `ForkState`.

use friscy_core::errno::{neg, EAGAIN, ECHILD};
use friscy_core::machine::{Machine, PageAttrs};
use friscy_core::Pid;

/// One of the four memory windows snapshotted around `clone` (spec.md §3,
/// "Fork State"): main data/BSS+brk, interpreter data, the live stack, and
/// the guest's mmap allocations.
#[derive(Clone, Debug, Default)]
pub struct MemRegion {
    pub addr: u64,
    pub size: u64,
    pub bytes: Vec<u8>,
}

/// The single-slot, single-generation fork state (spec.md §3, "Fork State").
pub struct ForkState {
    parent_regs: Option<[u64; 32]>,
    parent_pc: u64,
    regions: Option<[MemRegion; 4]>,
    parent_fds: Vec<i32>,
    child_pid: Option<Pid>,
    exit_status: i32,
    in_child: bool,
    child_reaped: bool,
    next_pid: Pid,
}

impl Default for ForkState {
    fn default() -> Self {
        Self::new()
    }
}

impl ForkState {
    pub fn new() -> Self {
        Self {
            parent_regs: None,
            parent_pc: 0,
            regions: None,
            parent_fds: Vec::new(),
            child_pid: None,
            exit_status: 0,
            in_child: false,
            child_reaped: false,
            next_pid: friscy_core::FIRST_CHILD_PID,
        }
    }

    pub fn in_child(&self) -> bool {
        self.in_child
    }

    /// The pid of the in-flight (or most recently reaped) child, if any.
    pub fn child_pid(&self) -> Option<Pid> {
        self.child_pid
    }

    /// `clone(CLONE_VM|CLONE_VFORK, ...)`. `regions` gives the `(addr, size)`
    /// of each of the four windows in the fixed order main-rw, interp-rw,
    /// stack, mmap (spec.md §4.8 step 3); a zero-size region is skipped.
    /// `open_fds` is the VFS fd-table snapshot at the moment of the call.
    /// On success the Machine is left untouched — the caller sets the
    /// syscall return value to 0 so the child proceeds — and `in_child`
    /// only flips true once every region has been copied, so a mid-snapshot
    /// page-attribute failure leaves the state retryable (spec.md §4.8 step
    /// 5, §7 kind 2).
    pub fn try_fork(
        &mut self,
        m: &mut dyn Machine,
        regions: [(u64, u64); 4],
        open_fds: Vec<i32>,
    ) -> Result<Pid, i64> {
        if self.in_child {
            return Err(neg(EAGAIN));
        }

        let mut parent_regs = [0u64; 32];
        for (i, r) in parent_regs.iter_mut().enumerate() {
            *r = m.reg(i as u8);
        }
        let parent_pc = m.pc();

        let mut snapshots: Vec<MemRegion> = Vec::with_capacity(4);
        for (addr, size) in regions {
            if size == 0 {
                snapshots.push(MemRegion { addr, size: 0, bytes: Vec::new() });
                continue;
            }
            if m.set_page_attrs(addr, size as usize, PageAttrs::RWX).is_err() {
                return Err(neg(EAGAIN));
            }
            let mut bytes = vec![0u8; size as usize];
            if m.read_mem(addr, &mut bytes).is_err() {
                return Err(neg(EAGAIN));
            }
            snapshots.push(MemRegion { addr, size, bytes });
        }

        let pid = self.next_pid;
        self.next_pid += 1;

        self.parent_regs = Some(parent_regs);
        self.parent_pc = parent_pc;
        self.regions = Some(snapshots.try_into().unwrap_or_else(|_| unreachable!()));
        self.parent_fds = open_fds;
        self.child_pid = Some(pid);
        self.exit_status = 0;
        self.in_child = true;
        self.child_reaped = false;
        Ok(pid)
    }

    /// Child-side `exit`/`exit_group` while `in_child`: restores the four
    /// regions (RWX-marked before the write so RELRO pages don't fault,
    /// spec.md §4.8 step 2), restores parent registers/PC, and sets the
    /// return value to the child's PID. Returns the set of fds present in
    /// `current_fds` that the child opened or dup2'd and that must now be
    /// closed (present now but absent from the pre-clone snapshot).
    pub fn exit_child(&mut self, m: &mut dyn Machine, status: i32, current_fds: &[i32]) -> Vec<i32> {
        self.exit_status = status;
        self.in_child = false;

        if let Some(regions) = self.regions.take() {
            for region in &regions {
                if region.size == 0 {
                    continue;
                }
                let _ = m.set_page_attrs(region.addr, region.size as usize, PageAttrs::RWX);
            }
            for region in &regions {
                if region.size == 0 {
                    continue;
                }
                let _ = m.write_mem(region.addr, &region.bytes);
            }
        }

        let fds_to_close: Vec<i32> = current_fds
            .iter()
            .copied()
            .filter(|fd| !self.parent_fds.contains(fd))
            .collect();

        if let Some(regs) = self.parent_regs.take() {
            for (i, r) in regs.iter().enumerate().skip(1) {
                m.set_reg(i as u8, *r);
            }
            m.set_pc(self.parent_pc);
        }
        m.set_result(self.child_pid.unwrap_or(0) as i64);

        fds_to_close
    }

    /// `wait4`: returns `(child_pid, (status & 0xff) << 8)` exactly once,
    /// then `-ECHILD` forever after (spec.md §4.8, §8 property 4).
    pub fn wait4(&mut self) -> Result<(Pid, i32), i64> {
        if self.in_child || self.child_reaped {
            return Err(neg(ECHILD));
        }
        match self.child_pid {
            Some(pid) => {
                self.child_reaped = true;
                Ok((pid, (self.exit_status & 0xff) << 8))
            }
            None => Err(neg(ECHILD)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use friscy_testkit::FlatMachine;

    fn seeded_machine() -> FlatMachine {
        let mut m = FlatMachine::new(1 << 20);
        m.force_map(0x1000, 0x1000, PageAttrs::RW);
        m.write_mem(0x1000, b"parent-data-before-fork!").unwrap();
        m
    }

    #[test]
    fn fork_then_restore_round_trips_memory() {
        let mut m = seeded_machine();
        let mut fork = ForkState::new();

        let pid = fork
            .try_fork(&mut m, [(0x1000, 0x20), (0, 0), (0, 0), (0, 0)], vec![3, 4])
            .unwrap();
        assert!(fork.in_child());

        m.write_mem(0x1000, b"child mutated this region!!!!!").unwrap();
        let closed = fork.exit_child(&mut m, 7, &[3, 4, 9]);
        assert_eq!(closed, vec![9]);
        assert!(!fork.in_child());

        let mut buf = [0u8; 24];
        m.read_mem(0x1000, &mut buf).unwrap();
        assert_eq!(&buf, b"parent-data-before-fork!");

        let (got_pid, status) = fork.wait4().unwrap();
        assert_eq!(got_pid, pid);
        assert_eq!(status, 7 << 8);

        assert_eq!(fork.wait4().unwrap_err(), neg(ECHILD));
    }

    #[test]
    fn nested_fork_while_in_child_is_rejected() {
        let mut m = seeded_machine();
        let mut fork = ForkState::new();
        fork.try_fork(&mut m, [(0x1000, 0x20), (0, 0), (0, 0), (0, 0)], vec![])
            .unwrap();
        let err = fork
            .try_fork(&mut m, [(0x1000, 0x20), (0, 0), (0, 0), (0, 0)], vec![])
            .unwrap_err();
        assert_eq!(err, neg(EAGAIN));
    }

    #[test]
    fn wait4_before_any_fork_returns_echild() {
        let mut fork = ForkState::new();
        assert_eq!(fork.wait4().unwrap_err(), neg(ECHILD));
    }

    #[test]
    fn child_pids_are_monotonic_starting_at_100() {
        let mut m = seeded_machine();
        let mut fork = ForkState::new();
        let pid1 = fork
            .try_fork(&mut m, [(0x1000, 0x20), (0, 0), (0, 0), (0, 0)], vec![])
            .unwrap();
        assert_eq!(pid1, friscy_core::FIRST_CHILD_PID);
        fork.exit_child(&mut m, 0, &[]);
        fork.wait4().unwrap();

        let pid2 = fork
            .try_fork(&mut m, [(0x1000, 0x20), (0, 0), (0, 0), (0, 0)], vec![])
            .unwrap();
        assert_eq!(pid2, friscy_core::FIRST_CHILD_PID + 1);
    }
}
