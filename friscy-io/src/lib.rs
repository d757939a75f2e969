//! The I/O Bridge: the one piece of state shared between the host UI thread
//! and the guest syscall thread (spec.md §4.5, component C5).
//!
//! Grounded in the same mutex + condvar shape the teacher uses for its own
//! cross-thread startup handshake: a `Mutex`-guarded inner state plus a
//! `Condvar` the waiting side blocks on, rather than a busy poll.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

struct StdinState {
    buf: VecDeque<u8>,
    eof: bool,
}

/// Shared state between the host thread (feeds stdin, resizes the terminal)
/// and the guest syscall thread (drains stdin, checks readiness). Cloning is
/// cheap; every operation goes through one `Mutex` plus a `Condvar` used only
/// to wake a thread that's genuinely blocked, never for busy-polling.
pub struct IoBridge {
    stdin: Mutex<StdinState>,
    condvar: Condvar,
    rows: AtomicU32,
    cols: AtomicU32,
    waiting_for_stdin: AtomicBool,
    running: AtomicBool,
}

impl Default for IoBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBridge {
    pub fn new() -> Self {
        Self {
            stdin: Mutex::new(StdinState {
                buf: VecDeque::new(),
                eof: false,
            }),
            condvar: Condvar::new(),
            rows: AtomicU32::new(24),
            cols: AtomicU32::new(80),
            waiting_for_stdin: AtomicBool::new(false),
            running: AtomicBool::new(true),
        }
    }

    // --- host thread operations ---

    /// Append host-fed bytes and wake anyone blocked in `wait_for_data`.
    pub fn push(&self, bytes: &[u8]) {
        let mut state = self.stdin.lock().unwrap();
        state.buf.extend(bytes.iter().copied());
        drop(state);
        self.condvar.notify_all();
    }

    pub fn set_term_size(&self, rows: u32, cols: u32) {
        self.rows.store(rows, Ordering::Relaxed);
        self.cols.store(cols, Ordering::Relaxed);
    }

    pub fn set_eof(&self) {
        let mut state = self.stdin.lock().unwrap();
        state.eof = true;
        drop(state);
        self.condvar.notify_all();
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.condvar.notify_all();
    }

    // --- guest syscall thread operations ---

    pub fn term_size(&self) -> (u32, u32) {
        (self.rows.load(Ordering::Relaxed), self.cols.load(Ordering::Relaxed))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Non-blocking read of up to `count` bytes. `Some(n)` with `n >= 0`
    /// bytes read (`0` meaning EOF); `None` if empty and not at EOF — the
    /// caller (a syscall handler) is expected to set `waiting_for_stdin`,
    /// rewind PC, and call `Machine::stop()` in that case (spec.md §4.5).
    pub fn try_read(&self, count: usize) -> Option<Vec<u8>> {
        let mut state = self.stdin.lock().unwrap();
        if state.buf.is_empty() {
            return if state.eof { Some(Vec::new()) } else { None };
        }
        let n = count.min(state.buf.len());
        let out: Vec<u8> = state.buf.drain(..n).collect();
        self.waiting_for_stdin.store(false, Ordering::Relaxed);
        Some(out)
    }

    pub fn has_data(&self) -> bool {
        let state = self.stdin.lock().unwrap();
        !state.buf.is_empty() || state.eof
    }

    pub fn set_waiting_for_stdin(&self, waiting: bool) {
        self.waiting_for_stdin.store(waiting, Ordering::Relaxed);
    }

    pub fn is_waiting_for_stdin(&self) -> bool {
        self.waiting_for_stdin.load(Ordering::Relaxed)
    }

    /// Block the calling thread until stdin has data, EOF is set, or
    /// `shutdown()` is called. Intended for the host driver loop, not the
    /// guest syscall thread (which must never actually block — see
    /// `try_read`'s `None` + `Machine::stop()` path).
    pub fn wait_for_data(&self) {
        let state = self.stdin.lock().unwrap();
        let _unused = self
            .condvar
            .wait_while(state, |s| s.buf.is_empty() && !s.eof && self.running.load(Ordering::Relaxed))
            .unwrap();
    }

    /// Reset stdin and the waiting flag for a fresh session (e.g. a new
    /// `execve`'d shell), leaving terminal size and `running` untouched.
    pub fn reset(&self) {
        let mut state = self.stdin.lock().unwrap();
        state.buf.clear();
        state.eof = false;
        self.waiting_for_stdin.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn try_read_returns_none_on_empty_non_eof() {
        let io = IoBridge::new();
        assert_eq!(io.try_read(16), None);
    }

    #[test]
    fn try_read_returns_zero_on_eof() {
        let io = IoBridge::new();
        io.set_eof();
        assert_eq!(io.try_read(16), Some(Vec::new()));
    }

    #[test]
    fn push_then_try_read_drains_in_order() {
        let io = IoBridge::new();
        io.push(b"echo hello\n");
        let got = io.try_read(5).unwrap();
        assert_eq!(got, b"echo ");
        let rest = io.try_read(64).unwrap();
        assert_eq!(rest, b"hello\n");
    }

    #[test]
    fn wait_for_data_wakes_on_push_from_another_thread() {
        let io = Arc::new(IoBridge::new());
        let io2 = io.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            io2.push(b"x");
        });
        io.wait_for_data();
        assert!(io.has_data());
        handle.join().unwrap();
    }

    #[test]
    fn reset_clears_buffer_and_eof() {
        let io = IoBridge::new();
        io.push(b"abc");
        io.set_eof();
        io.reset();
        assert_eq!(io.try_read(8), None);
    }
}
