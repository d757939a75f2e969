//! Shared types for the friscy RISC-V 64 Linux user-space emulation core.
//!
//! This crate has no dependency on the other `friscy-*` crates; it only
//! defines the `Machine` seam (§1/§9 of spec.md) and the small value types
//! (errno constants, page permission flags) every other component needs.

pub mod errno;
pub mod machine;

pub use machine::{MemResult, PageAttrs, PageFault, Machine, ECALL_WIDTH, NUM_REGS};

/// 4 KiB, the page size assumed throughout (spec.md §3/§4; `AT_PAGESZ`).
pub const PAGE_SIZE: u64 = 4096;

pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

pub const fn page_align_up(addr: u64) -> u64 {
    page_align_down(addr + PAGE_SIZE - 1)
}

/// Guest PID/TID, drawn from a monotonic counter starting at 100 (spec.md §3, Fork State).
pub type Pid = u32;
pub type Tid = u32;

pub const FIRST_CHILD_PID: Pid = 100;

/// First guest fd number handed out by the network bridge (spec.md §3/§6);
/// kept disjoint from the VFS fd table's allocation range so the two never collide.
pub const SOCKET_FD_BASE: i32 = 1000;

