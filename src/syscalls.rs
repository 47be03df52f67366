//! Thin wrappers over the raw syscalls the event loop is built on: the
//! listening socket, epoll, the signal-relay socketpair, non-blocking I/O,
//! and read-only file mappings. Everything here returns plain `io::Result`
//! so callers can distinguish would-block from real failures.

use std::fs::File;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_void, socklen_t};

pub use libc::{
    EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, SIGALRM, SIGINT, SIGTERM, epoll_event,
};

// ---- Socket operations ----

/// Create a non-blocking IPv4 listening socket bound to all interfaces.
///
/// `opt_linger` selects the close discipline: when set, SO_LINGER is enabled
/// with a one-second drain window; when clear, close discards unsent data.
pub fn create_listen_socket(port: u16, opt_linger: bool) -> io::Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let linger = libc::linger {
            l_onoff: opt_linger as c_int,
            l_linger: 1,
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const c_void,
            mem::size_of_val(&linger) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        // Allow rebinding while old connections sit in TIME_WAIT.
        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(Ipv4Addr::UNSPECIFIED.octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Accept one pending connection. `Ok(None)` means the backlog is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut addr_len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err)
            }
        } else {
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let peer = SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(addr.sin_port)));
            Ok(Some((fd, peer)))
        }
    }
}

/// The port a bound socket actually listens on; needed when binding port 0.
pub fn local_port(fd: RawFd) -> io::Result<u16> {
    unsafe {
        let mut addr: libc::sockaddr_in = mem::zeroed();
        let mut addr_len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        if libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut addr_len) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(u16::from_be(addr.sin_port))
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// ---- Epoll operations ----

pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    fn compose(interests: i32, edge_triggered: bool, one_shot: bool) -> u32 {
        let mut events = interests;
        if edge_triggered {
            events |= libc::EPOLLET;
        }
        if one_shot {
            events |= libc::EPOLLONESHOT;
        }
        events as u32
    }

    /// Register a descriptor. Connection sockets are registered one-shot and
    /// must be re-armed with [`Epoll::modify`] after every delivery.
    pub fn add(
        &self,
        fd: RawFd,
        token: u64,
        interests: i32,
        edge_triggered: bool,
        one_shot: bool,
    ) -> io::Result<()> {
        let mut event = epoll_event {
            events: Self::compose(interests, edge_triggered, one_shot),
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn modify(
        &self,
        fd: RawFd,
        token: u64,
        interests: i32,
        edge_triggered: bool,
        one_shot: bool,
    ) -> io::Result<()> {
        let mut event = epoll_event {
            events: Self::compose(interests, edge_triggered, one_shot),
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Wait for the next batch of events. An interrupted wait reports zero
    /// events; any pending signal byte is picked up on the next iteration.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Non-blocking I/O ----

pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    unsafe {
        let res = libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), libc::MSG_NOSIGNAL);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

/// Vectored write: header buffer and mapped file span in one syscall.
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    // A response is at most two segments.
    debug_assert!(bufs.len() <= 2, "writev takes at most two segments");
    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(2);
    for (iov, buf) in iovecs.iter_mut().zip(bufs.iter()) {
        iov.iov_base = buf.as_ptr() as *mut c_void;
        iov.iov_len = buf.len();
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}

// ---- Eventfd wake ----

/// Create the non-blocking eventfd used to wake the multiplexer when a
/// worker queues a verdict.
pub fn create_eventfd() -> io::Result<RawFd> {
    unsafe {
        let fd = libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }
}

/// Bump the eventfd counter, waking the epoll waiter.
pub fn notify_event(fd: RawFd) {
    let one: u64 = 1;
    unsafe {
        libc::write(fd, &one as *const u64 as *const c_void, 8);
    }
}

/// Reset the eventfd counter. Must run before draining the queue it
/// guards, so a push racing the drain leaves the counter nonzero and the
/// multiplexer reports the descriptor again.
pub fn drain_event(fd: RawFd) {
    let mut count: u64 = 0;
    unsafe {
        libc::read(fd, &mut count as *mut u64 as *mut c_void, 8);
    }
}

// ---- Signal bridge ----

static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Relay handler: writes the signal number as one byte into the socketpair.
/// Only async-signal-safe calls are made here; errno is preserved.
extern "C" fn relay_signal(sig: c_int) {
    unsafe {
        let saved_errno = *libc::__errno_location();
        let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = sig as u8;
            libc::send(fd, &byte as *const u8 as *const c_void, 1, 0);
        }
        *libc::__errno_location() = saved_errno;
    }
}

/// Create the non-blocking socketpair used to funnel signal delivery into
/// the multiplexer. Returns (read end, write end).
pub fn create_signal_socketpair() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::socketpair(libc::PF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    for fd in fds {
        if let Err(err) = set_nonblocking(fd) {
            close_fd(fds[0]);
            close_fd(fds[1]);
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Install the relay handler for SIGALRM, SIGTERM and SIGINT, and ignore
/// SIGPIPE so a peer reset surfaces as a write error instead of a kill.
pub fn install_signal_handlers(write_fd: RawFd) -> io::Result<()> {
    SIGNAL_WRITE_FD.store(write_fd, Ordering::SeqCst);
    register_handler(libc::SIGPIPE, libc::SIG_IGN)?;
    for sig in [libc::SIGALRM, libc::SIGTERM, libc::SIGINT] {
        register_handler(sig, relay_signal as libc::sighandler_t)?;
    }
    Ok(())
}

fn register_handler(sig: c_int, handler: libc::sighandler_t) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler;
        libc::sigfillset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Schedule the next SIGALRM tick.
pub fn arm_alarm(secs: u32) {
    unsafe {
        libc::alarm(secs);
    }
}

// ---- Memory-mapped file span ----

/// Read-only private mapping of a regular file, sent as the second segment
/// of a vectored write. Unmapped on drop.
pub struct MappedFile {
    ptr: *mut c_void,
    len: usize,
}

impl MappedFile {
    /// Zero-length files must not be mapped; callers handle them separately.
    pub fn map(file: &File, len: usize) -> io::Result<Self> {
        unsafe {
            let ptr = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { ptr, len })
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

// The mapping is exclusively owned and read-only, so moving it across the
// event-loop/worker boundary is sound.
unsafe impl Send for MappedFile {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writev_two_segments() {
        let (a, b) = create_signal_socketpair().unwrap();
        assert_eq!(writev(a, &[b"hello ".as_slice(), b"world".as_slice()]).unwrap(), 11);
        let mut buf = [0u8; 32];
        assert_eq!(recv(b, &mut buf).unwrap(), 11);
        assert_eq!(&buf[..11], b"hello world");
        close_fd(a);
        close_fd(b);
    }

    #[test]
    #[should_panic(expected = "at most two segments")]
    fn test_writev_rejects_more_than_two_segments() {
        let (a, _b) = create_signal_socketpair().unwrap();
        let _ = writev(a, &[b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]);
    }
}
