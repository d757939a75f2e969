//! The seam between this crate and the external RISC-V instruction emulator.
//!
//! Per spec.md §1/§9, the instruction-level `Machine` (register file,
//! attribute-enforced page table, syscall dispatch slot, printer callback,
//! `stop`/`resume`) is an external collaborator. `friscy-syscall` drives one
//! through this trait; `friscy-testkit` supplies a flat-`Vec<u8>`-backed fake
//! so the rest of the workspace can be tested without a real core.

use std::any::Any;
use std::fmt;

bitflags::bitflags! {
    /// Page permission bits, matching ELF `PF_R`/`PF_W`/`PF_X` / mmap `PROT_*` bit order.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PageAttrs: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

impl PageAttrs {
    pub const RW: PageAttrs = PageAttrs::READ.union(PageAttrs::WRITE);
    pub const RWX: PageAttrs = PageAttrs::READ.union(PageAttrs::WRITE).union(PageAttrs::EXEC);
    pub const RX: PageAttrs = PageAttrs::READ.union(PageAttrs::EXEC);
}

/// A recoverable page-table violation raised by the `Machine` while a handler
/// was reading or writing guest memory (spec.md §7, kind 2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub addr: u64,
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page fault at 0x{:x}", self.addr)
    }
}

impl std::error::Error for PageFault {}

pub type MemResult<T> = Result<T, PageFault>;

/// Number of general-purpose registers in the RISC-V integer register file (x0..=x31).
pub const NUM_REGS: usize = 32;

/// The external instruction-execution engine. Implementations own the register
/// file and the guest address space; this crate never assumes a particular
/// memory layout beyond what the trait exposes.
pub trait Machine {
    /// Read general register `idx` (0 = hardwired zero, conventionally).
    fn reg(&self, idx: u8) -> u64;
    /// Write general register `idx`. Implementations may silently ignore writes to x0.
    fn set_reg(&mut self, idx: u8, val: u64);

    fn pc(&self) -> u64;
    fn set_pc(&mut self, pc: u64);

    /// Copy `buf.len()` bytes from guest memory at `addr`. Returns the faulting
    /// address (not necessarily `addr` itself) on a page-attribute violation.
    fn read_mem(&self, addr: u64, buf: &mut [u8]) -> MemResult<()>;
    /// Copy `buf` into guest memory at `addr`.
    fn write_mem(&mut self, addr: u64, buf: &[u8]) -> MemResult<()>;
    /// Zero-fill `len` bytes of guest memory at `addr`.
    fn zero_mem(&mut self, addr: u64, len: usize) -> MemResult<()>;

    /// Set the permission bits of every page in `[addr, addr+len)`. `len` need
    /// not be page-aligned; implementations round outward.
    fn set_page_attrs(&mut self, addr: u64, len: usize, attrs: PageAttrs) -> MemResult<()>;

    /// Halt instruction dispatch. Called from a syscall handler right before
    /// returning, after rewinding the PC, so the host driver loop can perform
    /// blocking I/O and later call `resume`.
    fn stop(&mut self);
    /// Resume instruction dispatch from the current PC.
    fn resume(&mut self);

    /// Convenience for writing a syscall's return value into the ABI return
    /// register (`a0` / x10 on RISC-V).
    fn set_result(&mut self, value: i64) {
        self.set_reg(10, value as u64);
    }

    /// Deliver guest-written bytes (fd 1/2 writes not redirected elsewhere) to
    /// whatever the host uses as a terminal.
    fn print(&mut self, bytes: &[u8]);

    /// Opaque slot for embedder state, mirroring the `Machine`'s `userdata` in spec.md §1.
    fn userdata(&self) -> &dyn Any;
    fn userdata_mut(&mut self) -> &mut dyn Any;
}

/// Read the `a0..a5` syscall argument registers (x10..x15) in one call.
pub fn syscall_args(m: &dyn Machine) -> [u64; 6] {
    [
        m.reg(10),
        m.reg(11),
        m.reg(12),
        m.reg(13),
        m.reg(14),
        m.reg(15),
    ]
}

/// Width in bytes of a RISC-V `ecall` instruction (used to rewind the PC before
/// `Machine::stop()` so a resumed core re-executes the same syscall).
pub const ECALL_WIDTH: u64 = 4;
