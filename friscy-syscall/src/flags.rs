//! Guest-ABI flag sets that don't already live in `friscy-vfs::fd::OpenFlags`
//! (spec.md §4.9). Plain `bitflags` types, matching the `OpenFlags` precedent.

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CloneFlags: u64 {
        const VM             = 0x0000_0100;
        const FS             = 0x0000_0200;
        const FILES          = 0x0000_0400;
        const SIGHAND        = 0x0000_0800;
        const VFORK          = 0x0000_4000;
        const THREAD         = 0x0001_0000;
        const SETTLS         = 0x0008_0000;
        const PARENT_SETTID  = 0x0010_0000;
        const CHILD_CLEARTID = 0x0020_0000;
        const CHILD_SETTID   = 0x0100_0000;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MmapProt: u64 {
        const NONE  = 0x0;
        const READ  = 0x1;
        const WRITE = 0x2;
        const EXEC  = 0x4;
    }
}

impl MmapProt {
    pub fn to_page_attrs(self) -> friscy_core::machine::PageAttrs {
        let mut attrs = friscy_core::machine::PageAttrs::empty();
        if self.contains(MmapProt::READ) {
            attrs |= friscy_core::machine::PageAttrs::READ;
        }
        if self.contains(MmapProt::WRITE) {
            attrs |= friscy_core::machine::PageAttrs::WRITE;
        }
        if self.contains(MmapProt::EXEC) {
            attrs |= friscy_core::machine::PageAttrs::EXEC;
        }
        attrs
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MmapFlags: u64 {
        const SHARED    = 0x01;
        const PRIVATE   = 0x02;
        const FIXED     = 0x10;
        const ANONYMOUS = 0x20;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EpollEvents: u32 {
        const IN      = 0x001;
        const OUT     = 0x004;
        const ERR     = 0x008;
        const HUP     = 0x010;
        const ET      = 0x8000_0000;
    }
}

/// `futex(2)` operation word, masked off the `FUTEX_PRIVATE_FLAG`/`FUTEX_CLOCK_REALTIME` bits.
pub const FUTEX_WAIT: u32 = 0;
pub const FUTEX_WAKE: u32 = 1;
pub const FUTEX_CMD_MASK: u32 = 0x7f;

/// `epoll_ctl(2)` ops.
pub const EPOLL_CTL_ADD: i32 = 1;
pub const EPOLL_CTL_DEL: i32 = 2;
pub const EPOLL_CTL_MOD: i32 = 3;

/// `fcntl(2)` ops actually honored by the dispatch table.
pub const F_DUPFD: i32 = 0;
pub const F_GETFD: i32 = 1;
pub const F_SETFD: i32 = 2;
pub const F_GETFL: i32 = 3;
pub const F_SETFL: i32 = 4;
pub const F_DUPFD_CLOEXEC: i32 = 1030;

/// `newfstatat`/`faccessat` `AT_*` flags.
pub const AT_FDCWD: i32 = -100;
pub const AT_SYMLINK_NOFOLLOW: i32 = 0x100;
pub const AT_EMPTY_PATH: i32 = 0x1000;

/// `wait4` options.
pub const WNOHANG: i32 = 1;
