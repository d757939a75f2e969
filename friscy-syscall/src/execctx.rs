//! The Execution Context (spec.md §3, `ExecCtx`): everything about the
//! currently loaded program that `execve` (§4.10) must be able to replace in
//! place. `brk`/heap bookkeeping is deliberately *not* duplicated here — it
//! already lives in `friscy_mem::MemoryManager`, which `reset_for_exec`
//! mutates directly; holding two copies of the same break pointer would just
//! invite them to drift.

/// A loaded image's placement: original bytes, load base, and writable range
/// (spec.md §3's "writable-segment range").
#[derive(Clone, Debug)]
pub struct LoadedImage {
    pub bytes: Vec<u8>,
    pub base: u64,
    pub writable_range: (u64, u64),
    pub entry: u64,
}

/// The currently loaded program (spec.md §3, `ExecCtx`).
pub struct ExecCtx {
    pub main: LoadedImage,
    pub interp: Option<LoadedImage>,
    pub phdr_vaddr: u64,
    pub phentsize: u64,
    pub phnum: u64,
    pub dynamic: bool,
    pub original_stack_top: u64,
    pub envp: Vec<String>,
    pub execfn: String,
}

impl ExecCtx {
    /// Current entry point the Machine should resume at: the interpreter's
    /// if one is loaded, else the main binary's (spec.md §4.2/§4.10).
    pub fn start_pc(&self) -> u64 {
        match &self.interp {
            Some(interp) => interp.entry,
            None => self.main.entry,
        }
    }

    pub fn base_of_entry(&self) -> u64 {
        self.main.base
    }
}
