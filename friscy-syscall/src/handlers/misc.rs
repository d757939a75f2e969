//! Clocks, `uname`/`sysinfo`/`getrandom`, `ioctl`, and `futex` (spec.md §4.9).

use friscy_core::errno::neg;
use friscy_core::machine::Machine;

use crate::flags::{FUTEX_CMD_MASK, FUTEX_WAIT, FUTEX_WAKE};
use crate::guest::write_checked;
use crate::metrics;
use crate::{Outcome, Syscalls};

/// Monotonic counter standing in for wall-clock/monotonic time (spec.md §4.9
/// Non-goals: no real time source, just a value that advances on every call
/// so guest code observing elapsed time sees forward progress).
fn synthetic_now_ns(m: &dyn Machine) -> u64 {
    m.pc().wrapping_mul(1_000_003).wrapping_add(1_600_000_000_000_000_000)
}

pub fn clock_gettime(m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let now = synthetic_now_ns(m);
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&(now / 1_000_000_000).to_le_bytes());
    buf[8..16].copy_from_slice(&(now % 1_000_000_000).to_le_bytes());
    match write_checked(m, a[1], &buf) {
        Ok(()) => Outcome::Return(0),
        Err(e) => Outcome::Return(e),
    }
}

pub fn clock_getres(m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    if a[1] != 0 {
        let buf = [0u8; 16];
        let mut buf = buf;
        buf[8..12].copy_from_slice(&1_000_000u32.to_le_bytes());
        let _ = write_checked(m, a[1], &buf);
    }
    Outcome::Return(0)
}

pub fn uname(m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    const FIELD: usize = 65;
    let mut buf = vec![0u8; FIELD * 6];
    let fill = |buf: &mut [u8], idx: usize, s: &str| {
        let start = idx * FIELD;
        let bytes = s.as_bytes();
        buf[start..start + bytes.len()].copy_from_slice(bytes);
    };
    fill(&mut buf, 0, "Linux");
    fill(&mut buf, 1, "friscy");
    fill(&mut buf, 2, "6.1.0-friscy");
    fill(&mut buf, 3, "#1 SMP PREEMPT");
    fill(&mut buf, 4, "riscv64");
    fill(&mut buf, 5, "(none)");
    match write_checked(m, a[0], &buf) {
        Ok(()) => Outcome::Return(0),
        Err(e) => Outcome::Return(e),
    }
}

pub fn sysinfo(m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let mut buf = [0u8; 112];
    let total_ram: u64 = 512 * 1024 * 1024;
    buf[8..16].copy_from_slice(&total_ram.to_le_bytes());
    buf[16..24].copy_from_slice(&(total_ram / 2).to_le_bytes());
    match write_checked(m, a[0], &buf) {
        Ok(()) => Outcome::Return(0),
        Err(e) => Outcome::Return(e),
    }
}

pub fn getrandom(m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let len = a[1] as usize;
    let mut buf = vec![0u8; len];
    for (i, b) in buf.iter_mut().enumerate() {
        *b = ((m.pc().wrapping_add(i as u64)).wrapping_mul(2654435761)) as u8;
    }
    match write_checked(m, a[0], &buf) {
        Ok(()) => Outcome::Return(len as i64),
        Err(e) => Outcome::Return(e),
    }
}

/// `ioctl`: `TIOCGWINSZ`/`TIOCSWINSZ` against the I/O bridge's terminal size,
/// `TCGETS` advertising a canonical-mode termios, `TCSETS*`/`FIONBIO` as
/// silent successes (spec.md §6) are meaningful in this emulator; everything
/// else reports success with zeroed output, matching guest libc's tolerance
/// for an ioctl that's a no-op on a non-tty-like fd.
pub fn ioctl(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    const TCGETS: u64 = 0x5401;
    const TCSETS: u64 = 0x5402;
    const TCSETSW: u64 = 0x5403;
    const TCSETSF: u64 = 0x5404;
    const TIOCGWINSZ: u64 = 0x5413;
    const TIOCSWINSZ: u64 = 0x5414;
    const FIONBIO: u64 = 0x5421;

    // termios layout on rv64 Linux: c_iflag/oflag/cflag/lflag (u32 each),
    // c_line (u8), c_cc[19], then padding to 44 bytes.
    const ICANON: u32 = 0o0000002;
    const ECHO: u32 = 0o0000010;
    const ONLCR: u32 = 0o0000004;
    const CS8: u32 = 0o0000060;
    const CREAD: u32 = 0o0000200;
    const CLOCAL: u32 = 0o0004000;

    match a[1] {
        TCGETS => {
            let mut buf = [0u8; 44];
            buf[0..4].copy_from_slice(&0u32.to_le_bytes());
            buf[4..8].copy_from_slice(&ONLCR.to_le_bytes());
            buf[8..12].copy_from_slice(&(CS8 | CREAD | CLOCAL).to_le_bytes());
            buf[12..16].copy_from_slice(&(ICANON | ECHO).to_le_bytes());
            match write_checked(m, a[2], &buf) {
                Ok(()) => Outcome::Return(0),
                Err(e) => Outcome::Return(e),
            }
        }
        TCSETS | TCSETSW | TCSETSF | FIONBIO => Outcome::Return(0),
        TIOCGWINSZ => {
            let (rows, cols) = sys.io.term_size();
            let mut buf = [0u8; 8];
            buf[0..2].copy_from_slice(&(rows as u16).to_le_bytes());
            buf[2..4].copy_from_slice(&(cols as u16).to_le_bytes());
            match write_checked(m, a[2], &buf) {
                Ok(()) => Outcome::Return(0),
                Err(e) => Outcome::Return(e),
            }
        }
        TIOCSWINSZ => {
            let mut buf = [0u8; 4];
            if m.read_mem(a[2], &mut buf).is_err() {
                return Outcome::Return(neg(friscy_core::errno::EFAULT));
            }
            let rows = u16::from_le_bytes(buf[0..2].try_into().unwrap());
            let cols = u16::from_le_bytes(buf[2..4].try_into().unwrap());
            sys.io.set_term_size(rows as u32, cols as u32);
            Outcome::Return(0)
        }
        _ => Outcome::Return(0),
    }
}

pub fn futex(sys: &mut Syscalls, m: &mut dyn Machine, a: [u64; 6]) -> Outcome {
    let uaddr = a[0];
    let op = (a[1] as u32) & FUTEX_CMD_MASK;
    match op {
        FUTEX_WAIT => {
            let mut word_bytes = [0u8; 4];
            if m.read_mem(uaddr, &mut word_bytes).is_err() {
                return Outcome::Return(neg(friscy_core::errno::EFAULT));
            }
            let current = u32::from_le_bytes(word_bytes);
            let expected = a[2] as u32;
            use friscy_sched::FutexWaitOutcome;
            match sys.sched.futex_wait(m, uaddr, expected, current) {
                FutexWaitOutcome::Blocked => Outcome::Return(0),
                FutexWaitOutcome::MismatchedValue => Outcome::Return(neg(friscy_core::errno::EAGAIN)),
                FutexWaitOutcome::WokeAlone => {
                    let _ = m.write_mem(uaddr, &0u32.to_le_bytes());
                    Outcome::Return(0)
                }
                FutexWaitOutcome::Deadlock => Outcome::Return(neg(friscy_core::errno::EAGAIN)),
            }
        }
        FUTEX_WAKE => {
            let n = sys.sched.futex_wake(uaddr, a[2] as u32);
            if n > 0 {
                metrics::FUTEX_WAKES.count();
            }
            Outcome::Return(n as i64)
        }
        _ => Outcome::Return(0),
    }
}
