//! Cooperative thread scheduling and vfork-style process forking (spec.md
//! §4.7/§4.8, components C7 + C8). Both live in one crate because they share
//! the single-Machine cooperative model: at most one virtual thread owns the
//! register file at a time, and a forked child is just that same model with
//! a rollback plan attached.

pub mod fork;
pub mod scheduler;

pub use fork::{ForkState, MemRegion};
pub use scheduler::{FutexWaitOutcome, Scheduler, ThreadSlot, ThreadState, MAX_THREADS, SYSCALL_QUANTUM};
