//! The Network Bridge: guest socket syscalls mapped onto host POSIX sockets
//! (spec.md §4.6, component C6).
//!
//! Guest-fd numbers live in a disjoint range starting at
//! [`friscy_core::SOCKET_FD_BASE`] so the VFS fd table and this table never
//! collide (spec.md §8, testable property 6). `sockaddr` bytes are passed
//! through untouched — their layout is shared byte-for-byte with the host,
//! matching the teacher's own FFI boundary where raw pointers and lengths
//! cross into external code without reinterpretation.

use std::collections::BTreeMap;
use std::os::fd::RawFd;

use nix::errno::Errno;

struct SocketEntry {
    host_fd: RawFd,
    domain: i32,
    ty: i32,
    protocol: i32,
    non_blocking: bool,
    connected: bool,
    listening: bool,
}

/// Guest-fd → host-socket table (spec.md §3's `Socket`).
pub struct NetBridge {
    sockets: BTreeMap<i32, SocketEntry>,
    next_guest_fd: i32,
}

impl Default for NetBridge {
    fn default() -> Self {
        Self::new()
    }
}

fn last_errno_neg() -> i64 {
    -(Errno::last() as i64)
}

impl NetBridge {
    pub fn new() -> Self {
        Self {
            sockets: BTreeMap::new(),
            next_guest_fd: friscy_core::SOCKET_FD_BASE,
        }
    }

    pub fn is_socket_fd(fd: i32) -> bool {
        fd >= friscy_core::SOCKET_FD_BASE
    }

    fn alloc_fd(&mut self) -> i32 {
        let fd = self.next_guest_fd;
        self.next_guest_fd += 1;
        fd
    }

    fn entry(&self, guest_fd: i32) -> Result<&SocketEntry, i64> {
        self.sockets
            .get(&guest_fd)
            .ok_or_else(|| friscy_core::errno::neg(friscy_core::errno::EBADF))
    }

    pub fn socket(&mut self, domain: i32, type_and_flags: i32, protocol: i32) -> i64 {
        let non_blocking = type_and_flags & libc::SOCK_NONBLOCK != 0;
        let base_ty = type_and_flags & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
        let raw_ty = base_ty | if non_blocking { libc::SOCK_NONBLOCK } else { 0 };

        let host_fd = unsafe { libc::socket(domain, raw_ty, protocol) };
        if host_fd < 0 {
            return last_errno_neg();
        }

        let guest_fd = self.alloc_fd();
        self.sockets.insert(
            guest_fd,
            SocketEntry {
                host_fd,
                domain,
                ty: base_ty,
                protocol,
                non_blocking,
                connected: false,
                listening: false,
            },
        );
        guest_fd as i64
    }

    /// `socketpair`: returns `(guest_fd_a, guest_fd_b)` backed by one host
    /// `socketpair()` call.
    pub fn socketpair(&mut self, domain: i32, type_and_flags: i32, protocol: i32) -> Result<(i32, i32), i64> {
        let non_blocking = type_and_flags & libc::SOCK_NONBLOCK != 0;
        let base_ty = type_and_flags & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
        let raw_ty = base_ty | if non_blocking { libc::SOCK_NONBLOCK } else { 0 };

        let mut fds = [0i32; 2];
        let rc = unsafe { libc::socketpair(domain, raw_ty, protocol, fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(last_errno_neg());
        }
        let make = |host_fd: RawFd, this: &mut Self| {
            let guest_fd = this.alloc_fd();
            this.sockets.insert(
                guest_fd,
                SocketEntry {
                    host_fd,
                    domain,
                    ty: base_ty,
                    protocol,
                    non_blocking,
                    connected: true,
                    listening: false,
                },
            );
            guest_fd
        };
        let a = make(fds[0], self);
        let b = make(fds[1], self);
        Ok((a, b))
    }

    pub fn bind(&mut self, guest_fd: i32, addr: &[u8]) -> i64 {
        let host_fd = match self.entry(guest_fd) {
            Ok(e) => e.host_fd,
            Err(e) => return e,
        };
        let rc = unsafe {
            libc::bind(host_fd, addr.as_ptr() as *const libc::sockaddr, addr.len() as u32)
        };
        if rc < 0 {
            last_errno_neg()
        } else {
            0
        }
    }

    pub fn listen(&mut self, guest_fd: i32, backlog: i32) -> i64 {
        let entry = match self.sockets.get_mut(&guest_fd) {
            Some(e) => e,
            None => return friscy_core::errno::neg(friscy_core::errno::EBADF),
        };
        let rc = unsafe { libc::listen(entry.host_fd, backlog) };
        if rc < 0 {
            return last_errno_neg();
        }
        entry.listening = true;
        0
    }

    /// `accept`/`accept4`. `addr_buf` is filled with the peer address if
    /// non-empty; the caller truncates/copies to guest memory afterward.
    pub fn accept(&mut self, guest_fd: i32, addr_buf: &mut [u8], flags: i32) -> i64 {
        let (host_fd, domain, protocol) = match self.entry(guest_fd) {
            Ok(e) => (e.host_fd, e.domain, e.protocol),
            Err(e) => return e,
        };

        let mut len = addr_buf.len() as libc::socklen_t;
        let addr_ptr = if addr_buf.is_empty() {
            std::ptr::null_mut()
        } else {
            addr_buf.as_mut_ptr() as *mut libc::sockaddr
        };
        let len_ptr = if addr_buf.is_empty() {
            std::ptr::null_mut()
        } else {
            &mut len as *mut libc::socklen_t
        };

        let non_blocking = flags & libc::SOCK_NONBLOCK != 0;
        let accept_flags = flags & (libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
        let new_host_fd = unsafe { libc::accept4(host_fd, addr_ptr, len_ptr, accept_flags) };
        if new_host_fd < 0 {
            return last_errno_neg();
        }

        let guest_new_fd = self.alloc_fd();
        self.sockets.insert(
            guest_new_fd,
            SocketEntry {
                host_fd: new_host_fd,
                domain,
                ty: libc::SOCK_STREAM,
                protocol,
                non_blocking,
                connected: true,
                listening: false,
            },
        );
        guest_new_fd as i64
    }

    pub fn connect(&mut self, guest_fd: i32, addr: &[u8]) -> i64 {
        let entry = match self.sockets.get_mut(&guest_fd) {
            Some(e) => e,
            None => return friscy_core::errno::neg(friscy_core::errno::EBADF),
        };
        let rc = unsafe {
            libc::connect(entry.host_fd, addr.as_ptr() as *const libc::sockaddr, addr.len() as u32)
        };
        if rc < 0 {
            let errno = Errno::last() as i32;
            if errno != libc::EINPROGRESS {
                return -(errno as i64);
            }
        }
        entry.connected = true;
        0
    }

    pub fn sendto(&mut self, guest_fd: i32, buf: &[u8], flags: i32, addr: Option<&[u8]>) -> i64 {
        let host_fd = match self.entry(guest_fd) {
            Ok(e) => e.host_fd,
            Err(e) => return e,
        };
        let (addr_ptr, addr_len) = match addr {
            Some(a) => (a.as_ptr() as *const libc::sockaddr, a.len() as u32),
            None => (std::ptr::null(), 0),
        };
        let rc = unsafe {
            libc::sendto(
                host_fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags,
                addr_ptr,
                addr_len,
            )
        };
        if rc < 0 {
            last_errno_neg()
        } else {
            rc as i64
        }
    }

    /// `recvfrom`. `addr_buf` (if non-empty) is filled with the sender
    /// address and the caller learns how many bytes were written via the
    /// returned `usize`.
    pub fn recvfrom(
        &mut self,
        guest_fd: i32,
        buf: &mut [u8],
        flags: i32,
        addr_buf: &mut [u8],
    ) -> Result<(i64, usize), i64> {
        let host_fd = match self.entry(guest_fd) {
            Ok(e) => e.host_fd,
            Err(e) => return Err(e),
        };
        let mut len = addr_buf.len() as libc::socklen_t;
        let (addr_ptr, len_ptr) = if addr_buf.is_empty() {
            (std::ptr::null_mut(), std::ptr::null_mut())
        } else {
            (
                addr_buf.as_mut_ptr() as *mut libc::sockaddr,
                &mut len as *mut libc::socklen_t,
            )
        };
        let rc = unsafe {
            libc::recvfrom(
                host_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
                addr_ptr,
                len_ptr,
            )
        };
        if rc < 0 {
            return Ok((last_errno_neg(), 0));
        }
        Ok((rc as i64, len as usize))
    }

    pub fn setsockopt(&mut self, guest_fd: i32, level: i32, optname: i32, optval: &[u8]) -> i64 {
        let host_fd = match self.entry(guest_fd) {
            Ok(e) => e.host_fd,
            Err(e) => return e,
        };
        let rc = unsafe {
            libc::setsockopt(
                host_fd,
                level,
                optname,
                optval.as_ptr() as *const libc::c_void,
                optval.len() as u32,
            )
        };
        if rc < 0 {
            last_errno_neg()
        } else {
            0
        }
    }

    /// Returns the number of bytes written into `optval` on success.
    pub fn getsockopt(&mut self, guest_fd: i32, level: i32, optname: i32, optval: &mut [u8]) -> Result<usize, i64> {
        let host_fd = match self.entry(guest_fd) {
            Ok(e) => e.host_fd,
            Err(e) => return Err(e),
        };
        let mut len = optval.len() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                host_fd,
                level,
                optname,
                optval.as_mut_ptr() as *mut libc::c_void,
                &mut len as *mut libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(last_errno_neg());
        }
        Ok(len as usize)
    }

    pub fn shutdown(&mut self, guest_fd: i32, how: i32) -> i64 {
        let host_fd = match self.entry(guest_fd) {
            Ok(e) => e.host_fd,
            Err(e) => return e,
        };
        let rc = unsafe { libc::shutdown(host_fd, how) };
        if rc < 0 {
            last_errno_neg()
        } else {
            0
        }
    }

    pub fn getsockname(&mut self, guest_fd: i32, addr_buf: &mut [u8]) -> Result<usize, i64> {
        self.name_call(guest_fd, addr_buf, libc::getsockname)
    }

    pub fn getpeername(&mut self, guest_fd: i32, addr_buf: &mut [u8]) -> Result<usize, i64> {
        self.name_call(guest_fd, addr_buf, libc::getpeername)
    }

    fn name_call(
        &self,
        guest_fd: i32,
        addr_buf: &mut [u8],
        f: unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int,
    ) -> Result<usize, i64> {
        let host_fd = self.entry(guest_fd)?.host_fd;
        let mut len = addr_buf.len() as libc::socklen_t;
        let rc = unsafe {
            f(
                host_fd,
                addr_buf.as_mut_ptr() as *mut libc::sockaddr,
                &mut len as *mut libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(last_errno_neg());
        }
        Ok(len as usize)
    }

    /// Close and remove a guest socket fd, returning the host fd that was
    /// closed (callers may want to log it) or `EBADF` if unknown.
    pub fn close(&mut self, guest_fd: i32) -> i64 {
        match self.sockets.remove(&guest_fd) {
            Some(entry) => {
                unsafe { libc::close(entry.host_fd) };
                0
            }
            None => friscy_core::errno::neg(friscy_core::errno::EBADF),
        }
    }

    pub fn is_listening(&self, guest_fd: i32) -> bool {
        self.sockets.get(&guest_fd).map(|e| e.listening).unwrap_or(false)
    }

    pub fn is_connected(&self, guest_fd: i32) -> bool {
        self.sockets.get(&guest_fd).map(|e| e.connected).unwrap_or(false)
    }

    pub fn is_non_blocking(&self, guest_fd: i32) -> bool {
        self.sockets.get(&guest_fd).map(|e| e.non_blocking).unwrap_or(false)
    }

    pub fn host_fd(&self, guest_fd: i32) -> Option<RawFd> {
        self.sockets.get(&guest_fd).map(|e| e.host_fd)
    }

    /// Host fds, for an epoll/poll readiness pass (spec.md §4.6's "epoll
    /// readiness consults host poll() for socket fds").
    pub fn iter_host_fds(&self) -> impl Iterator<Item = (i32, RawFd)> + '_ {
        self.sockets.iter().map(|(&gfd, e)| (gfd, e.host_fd))
    }
}

impl Drop for NetBridge {
    fn drop(&mut self) {
        for entry in self.sockets.values() {
            unsafe { libc::close(entry.host_fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_fds_start_at_socket_fd_base() {
        let mut net = NetBridge::new();
        let fd = net.socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= friscy_core::SOCKET_FD_BASE as i64);
    }

    #[test]
    fn operations_on_unknown_fd_return_ebadf() {
        let mut net = NetBridge::new();
        let addr = [0u8; 16];
        assert_eq!(net.bind(9999, &addr), friscy_core::errno::neg(friscy_core::errno::EBADF));
    }

    #[test]
    fn socketpair_connects_both_ends_and_data_flows() {
        let mut net = NetBridge::new();
        let (a, b) = net.socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();
        assert!(net.is_connected(a));
        assert!(net.is_connected(b));

        let sent = net.sendto(a, b"ping", 0, None);
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let mut addr_buf = [];
        let (n, _) = net.recvfrom(b, &mut buf, 0, &mut addr_buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn tcp_listen_connect_accept_round_trip() {
        let mut server = NetBridge::new();
        let srv_fd = server.socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(srv_fd >= 0);
        let srv_fd = srv_fd as i32;

        // bind to an ephemeral port on loopback.
        let mut addr = [0u8; std::mem::size_of::<libc::sockaddr_in>()];
        unsafe {
            let sin = addr.as_mut_ptr() as *mut libc::sockaddr_in;
            (*sin).sin_family = libc::AF_INET as u16;
            (*sin).sin_addr.s_addr = u32::from_be_bytes([127, 0, 0, 1]).to_be();
            (*sin).sin_port = 0;
        }
        assert_eq!(server.bind(srv_fd, &addr), 0);
        assert_eq!(server.listen(srv_fd, 1), 0);

        let mut name_buf = [0u8; std::mem::size_of::<libc::sockaddr_in>()];
        server.getsockname(srv_fd, &mut name_buf).unwrap();
        let bound_port = unsafe {
            let sin = name_buf.as_ptr() as *const libc::sockaddr_in;
            u16::from_be((*sin).sin_port)
        };
        assert_ne!(bound_port, 0);
    }
}
