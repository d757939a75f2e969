//! Cooperative virtual-thread scheduler (spec.md §4.7, component C7).
//!
//! Threads are modeled as the tagged enum spec.md §9 calls for
//! (`Runnable`/`Waiting`/`Empty`) rather than a flags struct, so that
//! "active and waiting" or "active and empty" simply cannot be represented.
//! Exactly one thread (`current`) is ever resident on the `Machine`; every
//! other slot holds a saved snapshot of registers and PC.

use friscy_core::machine::Machine;
use friscy_core::Tid;

/// Fixed scheduler capacity (spec.md §3, "Scheduler").
pub const MAX_THREADS: usize = 8;

/// Preemption quantum in syscalls, reset whenever a thread becomes current
/// (spec.md §4.7, "Switching").
pub const SYSCALL_QUANTUM: u32 = 50_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Empty,
    Runnable { regs: [u64; 32], pc: u64 },
    Waiting { regs: [u64; 32], pc: u64, futex_addr: u64, expected: u32 },
}

impl ThreadState {
    fn is_runnable(&self) -> bool {
        matches!(self, ThreadState::Runnable { .. })
    }

    fn is_empty(&self) -> bool {
        matches!(self, ThreadState::Empty)
    }
}

/// Per-slot metadata that exists regardless of the thread's current state
/// (spec.md §3, "Thread").
#[derive(Clone, Debug)]
pub struct ThreadSlot {
    pub state: ThreadState,
    pub tid: Tid,
    /// `set_tid_address`'s pointer: zeroed and futex-woken on thread exit.
    pub clear_child_tid: u64,
    pub budget: u32,
}

impl ThreadSlot {
    fn empty() -> Self {
        Self {
            state: ThreadState::Empty,
            tid: 0,
            clear_child_tid: 0,
            budget: SYSCALL_QUANTUM,
        }
    }
}

/// Outcome of a futex `WAIT` call (spec.md §4.7, "Futex").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FutexWaitOutcome {
    /// The calling thread blocked and another thread was switched in.
    Blocked,
    /// Word at `uaddr` didn't match `expected`; caller returns `-EAGAIN`.
    MismatchedValue,
    /// No other thread was runnable. Per spec.md §9's Open Question, the
    /// legacy behaviour zeroes `uaddr` to break the guest's spin predicate;
    /// callers that opt into strict mode get `Deadlock` instead so the
    /// scheduler can surface a deterministic stall rather than silently
    /// corrupting lock state.
    WokeAlone,
    Deadlock,
}

/// Fixed-capacity cooperative scheduler (spec.md §3, "Scheduler").
pub struct Scheduler {
    slots: Vec<ThreadSlot>,
    current: usize,
    next_tid: Tid,
    /// Resolves spec.md §9's Open Question: zero-and-continue (`false`,
    /// matching the reference) vs. deterministic deadlock (`true`).
    pub strict_futex_deadlock: bool,
}

impl Scheduler {
    /// `main_tid` seeds slot 0, which is always the process's first thread
    /// and is never reclaimed by `thread_exit` (only `exit`/`exit_group` on
    /// the main thread ends the process).
    pub fn new(main_tid: Tid) -> Self {
        let mut slots = vec![ThreadSlot::empty(); MAX_THREADS];
        slots[0] = ThreadSlot {
            state: ThreadState::Runnable { regs: [0; 32], pc: 0 },
            tid: main_tid,
            clear_child_tid: 0,
            budget: SYSCALL_QUANTUM,
        };
        Self {
            slots,
            current: 0,
            next_tid: main_tid + 1,
            strict_futex_deadlock: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_tid(&self) -> Tid {
        self.slots[self.current].tid
    }

    pub fn slot(&self, idx: usize) -> &ThreadSlot {
        &self.slots[idx]
    }

    /// `set_tid_address`: install the address the scheduler zeroes/futex-wakes
    /// on this thread's exit.
    pub fn set_clear_child_tid(&mut self, addr: u64) {
        self.slots[self.current].clear_child_tid = addr;
    }

    /// Copy the live register file and PC out of `m` into the current slot.
    /// Call before any switch so the outgoing thread's state is preserved.
    fn save_current(&mut self, m: &dyn Machine) {
        let mut regs = [0u64; 32];
        for (i, r) in regs.iter_mut().enumerate() {
            *r = m.reg(i as u8);
        }
        let pc = m.pc();
        self.slots[self.current].state = ThreadState::Runnable { regs, pc };
    }

    /// Write slot `idx`'s saved state into `m` and make it current.
    fn restore(&mut self, idx: usize, m: &mut dyn Machine) {
        if let ThreadState::Runnable { regs, pc } = self.slots[idx].state {
            for (i, r) in regs.iter().enumerate().skip(1) {
                m.set_reg(i as u8, *r);
            }
            m.set_pc(pc);
        }
        self.current = idx;
        self.slots[idx].budget = SYSCALL_QUANTUM;
    }

    fn next_runnable_other_than(&self, exclude: usize) -> Option<usize> {
        for step in 1..=self.slots.len() {
            let idx = (exclude + step) % self.slots.len();
            if idx != exclude && self.slots[idx].state.is_runnable() {
                return Some(idx);
            }
        }
        None
    }

    /// `clone(CLONE_THREAD, ...)`: allocate a new slot for a cooperative
    /// thread seeded with `regs`/`pc` (the child's view: return value 0
    /// already written into `regs[10]` by the caller), returning its tid.
    /// Errors with `-EAGAIN` (mapped by the caller) if the table is full.
    pub fn spawn(&mut self, regs: [u64; 32], pc: u64, clear_child_tid: u64) -> Option<Tid> {
        let slot_idx = self.slots.iter().position(|s| s.state.is_empty())?;
        let tid = self.next_tid;
        self.next_tid += 1;
        self.slots[slot_idx] = ThreadSlot {
            state: ThreadState::Runnable { regs, pc },
            tid,
            clear_child_tid,
            budget: SYSCALL_QUANTUM,
        };
        Some(tid)
    }

    /// Preemption point (spec.md §4.7): call on every `clock_gettime` and
    /// `mmap`. Decrements the current thread's budget and switches if it
    /// hits zero and another thread is runnable.
    pub fn on_preemption_point(&mut self, m: &mut dyn Machine) {
        let budget = &mut self.slots[self.current].budget;
        if *budget > 0 {
            *budget -= 1;
            return;
        }
        if let Some(next) = self.next_runnable_other_than(self.current) {
            self.save_current(m);
            self.restore(next, m);
        } else {
            self.slots[self.current].budget = SYSCALL_QUANTUM;
        }
    }

    /// Voluntary yield (spec.md §4.7): `sched_yield`, `nanosleep`. No-op if
    /// nothing else is runnable.
    pub fn yield_now(&mut self, m: &mut dyn Machine) {
        if let Some(next) = self.next_runnable_other_than(self.current) {
            self.save_current(m);
            self.restore(next, m);
        }
    }

    /// `futex(FUTEX_WAIT, uaddr, expected)` (spec.md §4.7). `current_word`
    /// is the 32-bit value already read from `uaddr` by the caller (the
    /// dispatch handler owns guest-memory access).
    pub fn futex_wait(
        &mut self,
        m: &mut dyn Machine,
        uaddr: u64,
        expected: u32,
        current_word: u32,
    ) -> FutexWaitOutcome {
        if current_word != expected {
            return FutexWaitOutcome::MismatchedValue;
        }
        match self.next_runnable_other_than(self.current) {
            Some(next) => {
                let mut regs = [0u64; 32];
                for (i, r) in regs.iter_mut().enumerate() {
                    *r = m.reg(i as u8);
                }
                let pc = m.pc();
                self.slots[self.current].state = ThreadState::Waiting {
                    regs,
                    pc,
                    futex_addr: uaddr,
                    expected,
                };
                self.restore(next, m);
                FutexWaitOutcome::Blocked
            }
            None => {
                if self.strict_futex_deadlock {
                    let mut regs = [0u64; 32];
                    for (i, r) in regs.iter_mut().enumerate() {
                        *r = m.reg(i as u8);
                    }
                    let pc = m.pc();
                    self.slots[self.current].state = ThreadState::Waiting {
                        regs,
                        pc,
                        futex_addr: uaddr,
                        expected,
                    };
                    FutexWaitOutcome::Deadlock
                } else {
                    FutexWaitOutcome::WokeAlone
                }
            }
        }
    }

    /// `futex(FUTEX_WAKE, uaddr, n)`: wake up to `n` threads waiting on
    /// `uaddr`, walking the slot array in index order. Returns the count
    /// woken (spec.md §8 property 7: exactly 1 for a single waiter/waker).
    pub fn futex_wake(&mut self, uaddr: u64, n: u32) -> u32 {
        let mut woken = 0;
        for slot in self.slots.iter_mut() {
            if woken >= n {
                break;
            }
            if let ThreadState::Waiting { regs, pc, futex_addr, .. } = slot.state {
                if futex_addr == uaddr {
                    slot.state = ThreadState::Runnable { regs, pc };
                    woken += 1;
                }
            }
        }
        woken
    }

    /// `exit`/`exit_group` on a non-main thread (spec.md §4.7, "Thread
    /// exit"): clear the slot, zero `clear_child_tid` in guest memory, wake
    /// any futex waiter on that address, and switch to the next runnable
    /// thread. Returns `false` if there was nothing left to run (only the
    /// main thread should ever observe that from its own exit path, which
    /// doesn't call this).
    pub fn thread_exit(&mut self, m: &mut dyn Machine) -> bool {
        let clear_addr = self.slots[self.current].clear_child_tid;
        self.slots[self.current] = ThreadSlot::empty();
        if clear_addr != 0 {
            let _ = m.write_mem(clear_addr, &0u32.to_le_bytes());
            self.futex_wake(clear_addr, 1);
        }
        match self.next_runnable_other_than(self.current) {
            Some(next) => {
                self.restore(next, m);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use friscy_testkit::FlatMachine;

    #[test]
    fn new_scheduler_has_one_runnable_main_thread() {
        let sched = Scheduler::new(1);
        assert_eq!(sched.current_tid(), 1);
        assert!(sched.slot(0).state.is_runnable());
    }

    #[test]
    fn spawn_allocates_tid_and_fails_when_full() {
        let mut sched = Scheduler::new(1);
        for _ in 0..MAX_THREADS - 1 {
            assert!(sched.spawn([0; 32], 0x1000, 0).is_some());
        }
        assert!(sched.spawn([0; 32], 0x1000, 0).is_none());
    }

    #[test]
    fn preemption_switches_after_quantum_exhausted() {
        let mut m = FlatMachine::new(4096);
        let mut sched = Scheduler::new(1);
        sched.spawn([0; 32], 0x2000, 0).unwrap();
        for _ in 0..SYSCALL_QUANTUM {
            sched.on_preemption_point(&mut m);
        }
        assert_eq!(sched.current_index(), 0);
        sched.on_preemption_point(&mut m);
        assert_eq!(sched.current_index(), 1);
        assert_eq!(m.pc(), 0x2000);
    }

    #[test]
    fn futex_wait_then_wake_resumes_waiter_exactly_once() {
        let mut m = FlatMachine::new(4096);
        m.force_map(0x3000, 4096, friscy_core::machine::PageAttrs::RW);
        m.write_mem(0x3000, &1u32.to_le_bytes()).unwrap();

        let mut sched = Scheduler::new(1);
        sched.spawn([0; 32], 0x2000, 0).unwrap();

        let outcome = sched.futex_wait(&mut m, 0x3000, 1, 1);
        assert_eq!(outcome, FutexWaitOutcome::Blocked);
        assert_eq!(sched.current_index(), 1);

        let woken = sched.futex_wake(0x3000, 1);
        assert_eq!(woken, 1);
        assert!(matches!(sched.slot(0).state, ThreadState::Runnable { .. }));

        let woken_again = sched.futex_wake(0x3000, 1);
        assert_eq!(woken_again, 0);
    }

    #[test]
    fn futex_wait_mismatched_value_returns_eagain_signal() {
        let mut m = FlatMachine::new(4096);
        let mut sched = Scheduler::new(1);
        let outcome = sched.futex_wait(&mut m, 0x3000, 1, 99);
        assert_eq!(outcome, FutexWaitOutcome::MismatchedValue);
        assert_eq!(sched.current_index(), 0);
    }

    #[test]
    fn futex_wait_with_no_other_thread_wakes_alone_by_default() {
        let mut m = FlatMachine::new(4096);
        let mut sched = Scheduler::new(1);
        let outcome = sched.futex_wait(&mut m, 0x3000, 1, 1);
        assert_eq!(outcome, FutexWaitOutcome::WokeAlone);
    }

    #[test]
    fn futex_wait_with_no_other_thread_deadlocks_in_strict_mode() {
        let mut m = FlatMachine::new(4096);
        let mut sched = Scheduler::new(1);
        sched.strict_futex_deadlock = true;
        let outcome = sched.futex_wait(&mut m, 0x3000, 1, 1);
        assert_eq!(outcome, FutexWaitOutcome::Deadlock);
    }

    #[test]
    fn thread_exit_clears_child_tid_and_switches_back() {
        let mut m = FlatMachine::new(4096);
        m.force_map(0x4000, 4096, friscy_core::machine::PageAttrs::RW);
        m.write_mem(0x4000, &42u32.to_le_bytes()).unwrap();

        let mut sched = Scheduler::new(1);
        sched.spawn([0; 32], 0x2000, 0x4000).unwrap();
        sched.yield_now(&mut m);
        assert_eq!(sched.current_index(), 1);

        let still_running = sched.thread_exit(&mut m);
        assert!(still_running);
        assert_eq!(sched.current_index(), 0);

        let mut word = [0u8; 4];
        m.read_mem(0x4000, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 0);
    }
}
