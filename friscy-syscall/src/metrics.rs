//! Dispatch-table metrics, carried from the teacher's `counter` crate the
//! same way `libkrun::init_logger_once` wires `counter::default_env_filter()`
//! into its own tracing init.

use counter::TotalCounter;

counter::counter! {
    pub SYSCALLS_DISPATCHED: TotalCounter = TotalCounter::new("syscalls.dispatched");
    pub SYSCALLS_UNKNOWN: TotalCounter = TotalCounter::new("syscalls.unknown");
    pub FORK_COUNT: TotalCounter = TotalCounter::new("fork.count");
    pub FUTEX_WAKES: TotalCounter = TotalCounter::new("futex.wakes");
    pub EXEC_COUNT: TotalCounter = TotalCounter::new("exec.count");
}
