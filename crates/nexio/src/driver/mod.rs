//! I/O driver abstraction (native operation submission & completion).
//!
//! A `Driver` turns socket operations into completions: the caller
//! submits fire-and-forget ops tagged with a `user_data` word and later
//! drains `Completion`s carrying the same word. Results use the
//! negative-errno convention; `-ECANCELED` is the cancellation status the
//! reactor swallows everywhere.
//!
//! # Implementors
//!
//! - `UringDriver` (default where available): io_uring submission rings.
//!   The kernel owns the in-flight operation; completions arrive in CQE
//!   order.
//!
//! - `EpollDriver` (fallback): readiness-based. Operations park per-fd
//!   until `epoll_wait` reports readiness, the driver performs the
//!   syscall, and the result is delivered as a completion — the caller
//!   sees the same completion model on any Linux kernel.
//!
//! **Contract:**
//! - `submit()` never blocks and never delivers a completion inline;
//!   outcomes known at submit time are queued for the next `poll()`.
//! - At most one read-side (accept/recv) and one write-side
//!   (connect/send) operation may be outstanding per fd. A second one is
//!   bookkeeping corruption and panics.
//! - `poll(Wait)` blocks only while something is actually in flight; on
//!   an idle driver it returns immediately.
//! - Close is asynchronous on both backends: the fd is dead to the caller
//!   at submit time, but the slot owning it must stay alive until the
//!   Close completion has drained.

mod epoll;
mod uring;

pub use epoll::EpollDriver;
pub use uring::UringDriver;

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use nexio_core::{net_info, Result};

/// How far one `poll` call may go to find completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Drain whatever is ready; never block.
    NonBlocking,
    /// Block until at least one completion arrives (no-op when idle).
    Wait,
}

/// One finished native operation.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub user_data: u64,
    /// Syscall-style result: count/fd on success, negative errno on failure.
    pub result: i64,
}

/// A native socket operation. Pointers must stay valid (and must not
/// move) until the matching completion has been drained.
#[derive(Debug, Clone, Copy)]
pub enum IoOp {
    Accept {
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
    },
    Connect {
        fd: RawFd,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
    },
    Recv {
        fd: RawFd,
        buf: *mut u8,
        len: usize,
    },
    Send {
        fd: RawFd,
        buf: *const u8,
        len: usize,
    },
    ShutdownWr {
        fd: RawFd,
    },
    Close {
        fd: RawFd,
    },
}

impl IoOp {
    pub fn fd(&self) -> RawFd {
        match *self {
            IoOp::Accept { fd, .. }
            | IoOp::Connect { fd, .. }
            | IoOp::Recv { fd, .. }
            | IoOp::Send { fd, .. }
            | IoOp::ShutdownWr { fd }
            | IoOp::Close { fd } => fd,
        }
    }
}

pub trait Driver {
    /// Queue one operation. Never blocks, never calls back inline.
    fn submit(&mut self, op: IoOp, user_data: u64) -> Result<()>;

    /// Best-effort cancel of the in-flight operation submitted with
    /// `target` on `fd`. The cancelled operation's own completion arrives
    /// with `-ECANCELED`.
    fn cancel(&mut self, fd: RawFd, target: u64) -> Result<()>;

    /// Kick queued submissions to the kernel. No-op for readiness
    /// backends.
    fn flush(&mut self) -> Result<usize>;

    /// Drain completions into `out` (appended). Returns how many.
    fn poll(&mut self, out: &mut Vec<Completion>, mode: PollMode) -> Result<usize>;

    /// Operations submitted but not yet delivered.
    fn inflight(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// Backend selection for `Reactor::new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Probe io_uring at startup, fall back to epoll.
    #[default]
    Auto,
    Epoll,
    Uring,
}

/// Probe-and-create. `Auto` starts with io_uring and falls back.
pub fn open_driver(backend: Backend, sq_entries: u32) -> Result<Box<dyn Driver>> {
    match backend {
        Backend::Uring => Ok(Box::new(UringDriver::new(sq_entries)?)),
        Backend::Epoll => Ok(Box::new(EpollDriver::new()?)),
        Backend::Auto => match UringDriver::new(sq_entries) {
            Ok(d) => Ok(Box::new(d)),
            Err(_) => {
                net_info!("driver: io_uring unavailable, falling back to epoll");
                Ok(Box::new(EpollDriver::new()?))
            }
        },
    }
}

/// Write a `SocketAddr` into caller-provided storage, returning the
/// address length. The storage must hold a `sockaddr_storage`.
pub fn fill_sockaddr(storage: *mut u8, addr: &SocketAddr) -> libc::socklen_t {
    unsafe {
        std::ptr::write_bytes(storage, 0, std::mem::size_of::<libc::sockaddr_storage>());
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Recover a `SocketAddr` from a kernel-filled `sockaddr_storage`.
pub(crate) fn sockaddr_to_addr(storage: *const u8) -> Option<SocketAddr> {
    unsafe {
        let family = (*(storage as *const libc::sockaddr_storage)).ss_family as libc::c_int;
        match family {
            libc::AF_INET => {
                let sa = &*(storage as *const libc::sockaddr_in);
                Some(SocketAddr::V4(std::net::SocketAddrV4::new(
                    std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
                    u16::from_be(sa.sin_port),
                )))
            }
            libc::AF_INET6 => {
                let sa = &*(storage as *const libc::sockaddr_in6);
                Some(SocketAddr::V6(std::net::SocketAddrV6::new(
                    std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr),
                    u16::from_be(sa.sin6_port),
                    sa.sin6_flowinfo,
                    sa.sin6_scope_id,
                )))
            }
            _ => None,
        }
    }
}

/// The locally bound address of a socket.
pub(crate) fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc != 0 {
        return None;
    }
    sockaddr_to_addr(&storage as *const _ as *const u8)
}

/// Read the errno of the calling thread.
#[inline]
pub(crate) fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub(crate) const ECANCELED_RESULT: i64 = -(libc::ECANCELED as i64);
