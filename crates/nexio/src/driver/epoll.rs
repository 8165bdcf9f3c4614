//! `EpollDriver` — readiness-based fallback backend.
//!
//! epoll only reports readiness, so this driver parks each submitted
//! operation against its fd, performs the actual syscall when
//! `epoll_wait` says the direction is ready, and hands the result back as
//! a completion. Immediate outcomes (a connect refused at issue time, a
//! synthesized cancellation, a close) go through an internal ready queue
//! so the caller always observes them on a later `poll`, exactly like the
//! io_uring backend.
//!
//! Per fd there is one read-side slot (accept or recv) and one write-side
//! slot (connect or send); the epoll interest mask mirrors which slots
//! are occupied. Level-triggered mode is fine because a slot is cleared
//! (and the mask shrunk) the moment its operation executes.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use nexio_core::{NetError, Result};

use super::{last_errno, Completion, Driver, IoOp, PollMode, ECANCELED_RESULT};

struct Pending {
    user_data: u64,
    op: IoOp,
}

#[derive(Default)]
struct FdState {
    read: Option<Pending>,
    write: Option<Pending>,
    /// Interest mask currently installed in the epoll set (0 = not added).
    armed: u32,
}

pub struct EpollDriver {
    epfd: RawFd,
    /// Per-fd pending operations, indexed by fd.
    fds: Vec<FdState>,
    /// Completions decided before any wait (immediate errors, cancels,
    /// closes). Drained by `poll`.
    ready: VecDeque<Completion>,
    events: Vec<libc::epoll_event>,
    /// Operations parked against an fd (not counting the ready queue).
    parked: usize,
}

impl EpollDriver {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(NetError::Setup(last_errno()));
        }
        Ok(Self {
            epfd,
            fds: Vec::new(),
            ready: VecDeque::new(),
            events: Vec::with_capacity(64),
            parked: 0,
        })
    }

    fn state(&mut self, fd: RawFd) -> &mut FdState {
        let idx = fd as usize;
        if idx >= self.fds.len() {
            self.fds.resize_with(idx + 1, FdState::default);
        }
        &mut self.fds[idx]
    }

    /// Make the epoll interest mask match the occupied slots.
    fn sync_mask(&mut self, fd: RawFd) {
        let epfd = self.epfd;
        let state = self.state(fd);
        let mut want: u32 = 0;
        if state.read.is_some() {
            want |= libc::EPOLLIN as u32;
        }
        if state.write.is_some() {
            want |= libc::EPOLLOUT as u32;
        }
        if want == state.armed {
            return;
        }
        let mut event = libc::epoll_event {
            events: want,
            u64: fd as u64,
        };
        let op = if state.armed == 0 {
            libc::EPOLL_CTL_ADD
        } else if want == 0 {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let rc = unsafe { libc::epoll_ctl(epfd, op, fd, &mut event) };
        debug_assert_eq!(rc, 0, "epoll_ctl failed: errno {}", last_errno());
        state.armed = want;
    }

    fn park_read(&mut self, fd: RawFd, pending: Pending) {
        let state = self.state(fd);
        assert!(
            state.read.is_none(),
            "EpollDriver: read-side op already in flight on fd {}",
            fd
        );
        state.read = Some(pending);
        self.parked += 1;
        self.sync_mask(fd);
    }

    fn park_write(&mut self, fd: RawFd, pending: Pending) {
        let state = self.state(fd);
        assert!(
            state.write.is_none(),
            "EpollDriver: write-side op already in flight on fd {}",
            fd
        );
        state.write = Some(pending);
        self.parked += 1;
        self.sync_mask(fd);
    }

    /// Execute a parked read-side op now that the fd is readable.
    /// Returns the completion, or the op itself if it would still block.
    fn run_read(pending: &Pending) -> Option<i64> {
        let result = match pending.op {
            IoOp::Accept { fd, addr, addrlen } => unsafe {
                libc::accept4(fd, addr, addrlen, libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) as i64
            },
            IoOp::Recv { fd, buf, len } => (unsafe {
                libc::recv(fd, buf as *mut libc::c_void, len, 0)
            }) as i64,
            _ => unreachable!("non-read op in read slot"),
        };
        if result < 0 {
            let errno = last_errno();
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR {
                return None; // still not ready — keep parked
            }
            return Some(-(errno as i64));
        }
        Some(result)
    }

    fn run_write(pending: &Pending) -> Option<i64> {
        match pending.op {
            IoOp::Connect { fd, .. } => {
                // Writable after EINPROGRESS: the verdict is in SO_ERROR.
                let mut err: libc::c_int = 0;
                let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                let rc = unsafe {
                    libc::getsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut err as *mut _ as *mut libc::c_void,
                        &mut len,
                    )
                };
                if rc < 0 {
                    return Some(-(last_errno() as i64));
                }
                if err == 0 {
                    Some(0)
                } else {
                    Some(-(err as i64))
                }
            }
            IoOp::Send { fd, buf, len } => {
                let result = unsafe {
                    libc::send(fd, buf as *const libc::c_void, len, libc::MSG_NOSIGNAL)
                } as i64;
                if result < 0 {
                    let errno = last_errno();
                    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::EINTR
                    {
                        return None;
                    }
                    return Some(-(errno as i64));
                }
                Some(result)
            }
            _ => unreachable!("non-write op in write slot"),
        }
    }

    /// Drop every parked op on `fd`, delivering `-ECANCELED` for each.
    fn cancel_parked(&mut self, fd: RawFd) {
        let state = self.state(fd);
        let read = state.read.take();
        let write = state.write.take();
        for pending in read.into_iter().chain(write) {
            self.parked -= 1;
            self.ready.push_back(Completion {
                user_data: pending.user_data,
                result: ECANCELED_RESULT,
            });
        }
    }
}

impl Driver for EpollDriver {
    fn submit(&mut self, op: IoOp, user_data: u64) -> Result<()> {
        match op {
            IoOp::Accept { fd, .. } | IoOp::Recv { fd, .. } => {
                self.park_read(fd, Pending { user_data, op });
            }
            IoOp::Send { fd, .. } => {
                self.park_write(fd, Pending { user_data, op });
            }
            IoOp::Connect { fd, addr, addrlen } => {
                let rc = unsafe { libc::connect(fd, addr, addrlen) };
                if rc == 0 {
                    self.ready.push_back(Completion { user_data, result: 0 });
                } else {
                    let errno = last_errno();
                    if errno == libc::EINPROGRESS {
                        self.park_write(fd, Pending { user_data, op });
                    } else {
                        self.ready.push_back(Completion {
                            user_data,
                            result: -(errno as i64),
                        });
                    }
                }
            }
            IoOp::ShutdownWr { fd } => {
                let rc = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
                let result = if rc == 0 { 0 } else { -(last_errno() as i64) };
                self.ready.push_back(Completion { user_data, result });
            }
            IoOp::Close { fd } => {
                // Anything still parked on this fd completes cancelled first.
                self.cancel_parked(fd);
                if self.state(fd).armed != 0 {
                    unsafe {
                        libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                    }
                    self.state(fd).armed = 0;
                }
                let rc = unsafe { libc::close(fd) };
                let result = if rc == 0 { 0 } else { -(last_errno() as i64) };
                self.ready.push_back(Completion { user_data, result });
            }
        }
        Ok(())
    }

    fn cancel(&mut self, fd: RawFd, target: u64) -> Result<()> {
        let state = self.state(fd);
        let taken = if state.read.as_ref().is_some_and(|p| p.user_data == target) {
            state.read.take()
        } else if state.write.as_ref().is_some_and(|p| p.user_data == target) {
            state.write.take()
        } else {
            None
        };
        if let Some(pending) = taken {
            self.parked -= 1;
            self.ready.push_back(Completion {
                user_data: pending.user_data,
                result: ECANCELED_RESULT,
            });
            self.sync_mask(fd);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<usize> {
        Ok(0) // readiness backend: nothing queued kernel-side
    }

    fn poll(&mut self, out: &mut Vec<Completion>, mode: PollMode) -> Result<usize> {
        let timeout_ms = match mode {
            PollMode::NonBlocking => 0,
            // Never block when something is already deliverable, and never
            // block an idle driver.
            PollMode::Wait if self.ready.is_empty() && self.parked > 0 => -1,
            PollMode::Wait => 0,
        };

        if self.parked > 0 {
            self.events.clear();
            let cap = self.events.capacity() as i32;
            let n = unsafe {
                libc::epoll_wait(self.epfd, self.events.as_mut_ptr(), cap, timeout_ms)
            };
            if n < 0 {
                let errno = last_errno();
                if errno != libc::EINTR {
                    return Err(NetError::Os(errno));
                }
            } else {
                unsafe {
                    self.events.set_len(n as usize);
                }
                for i in 0..n as usize {
                    let ev = self.events[i];
                    let fd = ev.u64 as RawFd;
                    let err = ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
                    let readable = err || ev.events & libc::EPOLLIN as u32 != 0;
                    let writable = err || ev.events & libc::EPOLLOUT as u32 != 0;

                    if readable {
                        if let Some(pending) = self.state(fd).read.take() {
                            match Self::run_read(&pending) {
                                Some(result) => {
                                    self.parked -= 1;
                                    self.ready.push_back(Completion {
                                        user_data: pending.user_data,
                                        result,
                                    });
                                }
                                None => self.state(fd).read = Some(pending),
                            }
                        }
                    }
                    if writable {
                        if let Some(pending) = self.state(fd).write.take() {
                            match Self::run_write(&pending) {
                                Some(result) => {
                                    self.parked -= 1;
                                    self.ready.push_back(Completion {
                                        user_data: pending.user_data,
                                        result,
                                    });
                                }
                                None => self.state(fd).write = Some(pending),
                            }
                        }
                    }
                    self.sync_mask(fd);
                }
            }
        }

        let count = self.ready.len();
        out.extend(self.ready.drain(..));
        Ok(count)
    }

    fn inflight(&self) -> usize {
        self.parked + self.ready.len()
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

impl Drop for EpollDriver {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Non-blocking socketpair for driving the read/write paths.
    fn pair() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn poll_all(driver: &mut EpollDriver, mode: PollMode) -> Vec<Completion> {
        let mut out = Vec::new();
        driver.poll(&mut out, mode).unwrap();
        out
    }

    #[test]
    fn test_recv_completes_after_peer_write() {
        let mut driver = EpollDriver::new().unwrap();
        let (a, b) = pair();
        let mut buf = [0u8; 16];
        driver
            .submit(
                IoOp::Recv {
                    fd: a,
                    buf: buf.as_mut_ptr(),
                    len: buf.len(),
                },
                7,
            )
            .unwrap();

        // Nothing ready yet.
        assert!(poll_all(&mut driver, PollMode::NonBlocking).is_empty());

        unsafe {
            libc::write(b, b"ping".as_ptr() as *const _, 4);
        }
        let comps = poll_all(&mut driver, PollMode::Wait);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].user_data, 7);
        assert_eq!(comps[0].result, 4);
        assert_eq!(&buf[..4], b"ping");

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_send_then_recv_round_trip() {
        let mut driver = EpollDriver::new().unwrap();
        let (a, b) = pair();
        let msg = b"hello";
        driver
            .submit(
                IoOp::Send {
                    fd: a,
                    buf: msg.as_ptr(),
                    len: msg.len(),
                },
                1,
            )
            .unwrap();
        let comps = poll_all(&mut driver, PollMode::Wait);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].result, 5);

        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(b, buf.as_mut_ptr() as *mut _, 8) };
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], msg);

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_recv_reports_eof_as_zero() {
        let mut driver = EpollDriver::new().unwrap();
        let (a, b) = pair();
        let mut buf = [0u8; 8];
        driver
            .submit(
                IoOp::Recv {
                    fd: a,
                    buf: buf.as_mut_ptr(),
                    len: buf.len(),
                },
                3,
            )
            .unwrap();
        unsafe {
            libc::close(b);
        }
        let comps = poll_all(&mut driver, PollMode::Wait);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].result, 0);
        unsafe {
            libc::close(a);
        }
    }

    #[test]
    fn test_cancel_synthesizes_ecanceled() {
        let mut driver = EpollDriver::new().unwrap();
        let (a, b) = pair();
        let mut buf = [0u8; 8];
        driver
            .submit(
                IoOp::Recv {
                    fd: a,
                    buf: buf.as_mut_ptr(),
                    len: buf.len(),
                },
                9,
            )
            .unwrap();
        driver.cancel(a, 9).unwrap();
        let comps = poll_all(&mut driver, PollMode::Wait);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].user_data, 9);
        assert_eq!(comps[0].result, ECANCELED_RESULT);
        assert_eq!(driver.inflight(), 0);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_close_cancels_parked_ops_then_completes() {
        let mut driver = EpollDriver::new().unwrap();
        let (a, b) = pair();
        let mut buf = [0u8; 8];
        driver
            .submit(
                IoOp::Recv {
                    fd: a,
                    buf: buf.as_mut_ptr(),
                    len: buf.len(),
                },
                11,
            )
            .unwrap();
        driver.submit(IoOp::Close { fd: a }, 12).unwrap();

        let comps = poll_all(&mut driver, PollMode::Wait);
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0].user_data, 11);
        assert_eq!(comps[0].result, ECANCELED_RESULT);
        assert_eq!(comps[1].user_data, 12);
        assert_eq!(comps[1].result, 0);
        unsafe {
            libc::close(b);
        }
    }

    #[test]
    fn test_wait_on_idle_driver_returns_immediately() {
        let mut driver = EpollDriver::new().unwrap();
        let comps = poll_all(&mut driver, PollMode::Wait);
        assert!(comps.is_empty());
    }
}
