//! `Conn` — the per-connection read/write state machine.
//!
//! A connection owns its fd and both ring buffers. The in direction is a
//! `StraightBuffer` (the host sees the whole unread region as one slice),
//! the out direction a `BipBuffer` (committed bytes never move while a
//! native send points into them). At most one recv and one send are in
//! flight at any time; sends drain the out buffer front-to-back, which is
//! what preserves submission order.
//!
//! Teardown has three triggers — local shutdown, remote EOF, I/O error —
//! and any of them may race the others through the completion queue. The
//! `disconnect_fired` guard makes the terminal notification fire exactly
//! once; the per-op in-flight flags keep the registry slot (and with it
//! the buffers every in-flight pointer targets) alive until the last
//! completion for this fd has drained.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use nexio_core::{
    net_warn, ConnectionEvents, NetError, Reason, Result, RingBuffer,
};

use crate::buf::{BipBuffer, StraightBuffer};
use crate::driver::{Driver, IoOp, ECANCELED_RESULT};
use crate::op::{self, OpTag};
use crate::reactor::Notice;
use crate::registry::Token;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Terminal. Entered exactly once; never left.
    Disconnected,
    /// The stream is up and registered for read events.
    Connected,
    /// Shutdown requested (locally or by remote EOF) with output still
    /// pending. Reads have stopped; the out buffer is draining.
    Disconnecting,
}

/// Per-connection tunables. Buffer capacities are fixed at activation and
/// never grow.
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    pub max_in_buffer: usize,
    pub max_out_buffer: usize,
    pub nodelay: bool,
    pub keepalive: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            max_in_buffer: 64 * 1024,
            max_out_buffer: 64 * 1024,
            nodelay: true,
            keepalive: true,
        }
    }
}

pub(crate) struct Conn {
    fd: RawFd,
    state: ConnState,
    inbuf: StraightBuffer,
    outbuf: BipBuffer,
    /// Host notification sink. Absent only while a hook is running.
    events: Option<Box<dyn ConnectionEvents>>,
    /// Acceptor or connector that created this connection, for routing
    /// `destroy_connection` when the slot retires.
    origin: Token,
    recv_inflight: bool,
    send_inflight: bool,
    shutwr_inflight: bool,
    close_submitted: bool,
    close_done: bool,
    /// Local shutdown already requested (second graceful call no-ops).
    shutdown_requested: bool,
    /// Terminal notification already queued.
    disconnect_fired: bool,
    /// Teardown was initiated by the peer's EOF.
    remote_eof: bool,
}

impl Conn {
    pub(crate) fn new(
        fd: RawFd,
        config: &ConnConfig,
        events: Box<dyn ConnectionEvents>,
        origin: Token,
    ) -> Self {
        Self {
            fd,
            state: ConnState::Connected,
            inbuf: StraightBuffer::with_capacity(config.max_in_buffer),
            outbuf: BipBuffer::with_capacity(config.max_out_buffer),
            events: Some(events),
            origin,
            recv_inflight: false,
            send_inflight: false,
            shutwr_inflight: false,
            close_submitted: false,
            close_done: false,
            shutdown_requested: false,
            disconnect_fired: false,
            remote_eof: false,
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> ConnState {
        self.state
    }

    #[inline]
    pub(crate) fn origin(&self) -> Token {
        self.origin
    }

    #[inline]
    pub(crate) fn recv_data(&self) -> &[u8] {
        self.inbuf.readable()
    }

    #[inline]
    pub(crate) fn out_committed(&self) -> usize {
        self.outbuf.committed()
    }

    #[inline]
    pub(crate) fn out_free(&self) -> usize {
        self.outbuf.free()
    }

    pub(crate) fn take_events(&mut self) -> Option<Box<dyn ConnectionEvents>> {
        self.events.take()
    }

    pub(crate) fn put_events(&mut self, events: Box<dyn ConnectionEvents>) {
        self.events = Some(events);
    }

    pub(crate) fn into_events(self) -> Option<Box<dyn ConnectionEvents>> {
        self.events
    }

    /// The slot may retire: the close has run and no completion for this
    /// fd is still on its way.
    pub(crate) fn releasable(&self) -> bool {
        self.close_done && !self.recv_inflight && !self.send_inflight && !self.shutwr_inflight
    }

    // ── Submission side ──

    /// Arm the single outstanding recv against the in buffer's tail.
    /// A full buffer stalls the read; `consume_recv` re-arms it.
    pub(crate) fn arm_recv(&mut self, driver: &mut dyn Driver, token: Token) {
        debug_assert!(!self.recv_inflight, "Conn: recv already in flight");
        let free = self.inbuf.free();
        let dst = self.inbuf.writable(free);
        if dst.is_empty() {
            return;
        }
        let (buf, len) = (dst.as_mut_ptr(), dst.len());
        let ud = op::encode(OpTag::Recv, token);
        match driver.submit(IoOp::Recv { fd: self.fd, buf, len }, ud) {
            Ok(()) => self.recv_inflight = true,
            Err(e) => net_warn!("conn: recv arm failed on fd {}: {}", self.fd, e),
        }
    }

    fn arm_send(&mut self, driver: &mut dyn Driver, token: Token) {
        debug_assert!(!self.send_inflight, "Conn: send already in flight");
        let run = self.outbuf.readable();
        if run.is_empty() {
            return;
        }
        let (buf, len) = (run.as_ptr(), run.len());
        let ud = op::encode(OpTag::Send, token);
        match driver.submit(IoOp::Send { fd: self.fd, buf, len }, ud) {
            Ok(()) => self.send_inflight = true,
            Err(e) => net_warn!("conn: send arm failed on fd {}: {}", self.fd, e),
        }
    }

    /// Append `data` to the out buffer and ensure a native send is in
    /// flight. All-or-nothing: a request larger than the contiguous free
    /// run commits nothing and reports backpressure. The bytes are copied
    /// into the ring, so the native send never references the caller's
    /// memory.
    pub(crate) fn send(
        &mut self,
        driver: &mut dyn Driver,
        token: Token,
        data: &[u8],
    ) -> Result<usize> {
        if self.state != ConnState::Connected {
            return Err(NetError::NotConnected);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let dst = self.outbuf.writable(data.len());
        if dst.len() < data.len() {
            // The discarded reservation leaves the buffer untouched.
            return Err(NetError::Backpressure);
        }
        dst[..data.len()].copy_from_slice(data);
        self.outbuf.commit(data.len());
        if !self.send_inflight {
            self.arm_send(driver, token);
        }
        Ok(data.len())
    }

    /// Retire `n` fully-consumed bytes from the in buffer; restart a read
    /// that stalled on a full buffer.
    pub(crate) fn consume_recv(&mut self, driver: &mut dyn Driver, token: Token, n: usize) {
        self.inbuf.consume(n);
        if self.state == ConnState::Connected && !self.recv_inflight {
            self.arm_recv(driver, token);
        }
    }

    /// Begin teardown. `now` discards pending output; otherwise pending
    /// output is flushed first. Idempotent in both flavors.
    pub(crate) fn shutdown(
        &mut self,
        driver: &mut dyn Driver,
        pending: &mut VecDeque<Notice>,
        token: Token,
        now: bool,
    ) {
        match self.state {
            ConnState::Disconnected => return,
            ConnState::Disconnecting if !now => return,
            _ => {}
        }
        if self.shutdown_requested && !now {
            return;
        }
        self.shutdown_requested = true;
        if now {
            self.force_teardown(driver, pending, token);
        } else if self.outbuf.committed() == 0 && !self.send_inflight {
            self.finish_teardown(driver, pending, token, true);
        } else {
            self.state = ConnState::Disconnecting;
            if self.recv_inflight {
                let _ = driver.cancel(self.fd, op::encode(OpTag::Recv, token));
            }
        }
    }

    // ── Completion side ──

    pub(crate) fn handle_recv(
        &mut self,
        driver: &mut dyn Driver,
        pending: &mut VecDeque<Notice>,
        token: Token,
        result: i64,
    ) {
        self.recv_inflight = false;
        if result == ECANCELED_RESULT || self.state == ConnState::Disconnected {
            return;
        }
        if result < 0 {
            pending.push_back(Notice::Error(token, Reason::from_result(result)));
            self.force_teardown(driver, pending, token);
            return;
        }
        if result == 0 {
            // Remote EOF.
            self.remote_eof = true;
            if self.outbuf.committed() == 0 && !self.send_inflight {
                self.finish_teardown(driver, pending, token, false);
            } else {
                self.state = ConnState::Disconnecting;
            }
            return;
        }
        self.inbuf.commit(result as usize);
        pending.push_back(Notice::NewData(token));
        if self.state == ConnState::Connected {
            self.arm_recv(driver, token);
        }
    }

    pub(crate) fn handle_send(
        &mut self,
        driver: &mut dyn Driver,
        pending: &mut VecDeque<Notice>,
        token: Token,
        result: i64,
    ) {
        self.send_inflight = false;
        if result == ECANCELED_RESULT || self.state == ConnState::Disconnected {
            return;
        }
        if result <= 0 {
            let reason = if result == 0 {
                Reason(libc::EPIPE)
            } else {
                Reason::from_result(result)
            };
            pending.push_back(Notice::Error(token, reason));
            self.force_teardown(driver, pending, token);
            return;
        }
        let sent = result as usize;
        self.outbuf.consume(sent);
        pending.push_back(Notice::SomeDataSent(token, sent));
        if self.outbuf.committed() > 0 {
            // Front-to-back drain: a short send re-arms for the rest, so
            // bytes leave in submission order.
            self.arm_send(driver, token);
        } else if self.state == ConnState::Disconnecting {
            // Flush complete. Only the locally-initiated graceful path
            // half-closes before the close.
            let polite = !self.remote_eof;
            self.finish_teardown(driver, pending, token, polite);
        }
    }

    pub(crate) fn handle_shutwr(&mut self, driver: &mut dyn Driver, token: Token) {
        self.shutwr_inflight = false;
        if !self.close_submitted {
            self.submit_close(driver, token);
        }
    }

    pub(crate) fn handle_close(&mut self) {
        self.close_done = true;
    }

    // ── Teardown paths ──

    fn fire_disconnected(&mut self, pending: &mut VecDeque<Notice>, token: Token) {
        if self.disconnect_fired {
            return;
        }
        self.disconnect_fired = true;
        pending.push_back(Notice::Disconnected {
            token,
            remote: self.remote_eof,
        });
    }

    /// Immediate teardown: local `shutdown(now)` or a genuine I/O error.
    /// Pending output is discarded.
    pub(crate) fn force_teardown(
        &mut self,
        driver: &mut dyn Driver,
        pending: &mut VecDeque<Notice>,
        token: Token,
    ) {
        if self.close_submitted {
            self.state = ConnState::Disconnected;
            return;
        }
        self.state = ConnState::Disconnected;
        self.fire_disconnected(pending, token);
        if self.recv_inflight {
            let _ = driver.cancel(self.fd, op::encode(OpTag::Recv, token));
        }
        if self.send_inflight {
            let _ = driver.cancel(self.fd, op::encode(OpTag::Send, token));
        }
        self.submit_close(driver, token);
    }

    /// Orderly teardown once the out buffer is empty. `polite` half-closes
    /// the write side before closing.
    fn finish_teardown(
        &mut self,
        driver: &mut dyn Driver,
        pending: &mut VecDeque<Notice>,
        token: Token,
        polite: bool,
    ) {
        if self.close_submitted {
            self.state = ConnState::Disconnected;
            return;
        }
        self.state = ConnState::Disconnected;
        self.fire_disconnected(pending, token);
        if self.recv_inflight {
            let _ = driver.cancel(self.fd, op::encode(OpTag::Recv, token));
        }
        if polite {
            let ud = op::encode(OpTag::ShutWr, token);
            if driver.submit(IoOp::ShutdownWr { fd: self.fd }, ud).is_ok() {
                self.shutwr_inflight = true;
                return;
            }
        }
        self.submit_close(driver, token);
    }

    fn submit_close(&mut self, driver: &mut dyn Driver, token: Token) {
        self.close_submitted = true;
        let ud = op::encode(OpTag::Close, token);
        if driver.submit(IoOp::Close { fd: self.fd }, ud).is_err() {
            // Submission queue exhausted: close synchronously so the slot
            // can still retire.
            unsafe { libc::close(self.fd) };
            self.close_done = true;
        }
    }
}

/// Socket options applied at activation time.
pub(crate) fn tune_stream(fd: RawFd, config: &ConnConfig) {
    let on: libc::c_int = 1;
    unsafe {
        if config.nodelay {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        if config.keepalive {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{EpollDriver, PollMode};

    struct NullEvents;
    impl ConnectionEvents for NullEvents {
        fn on_disconnected(&mut self, _remote: bool) {}
        fn on_new_data(&mut self, _conn: &mut dyn nexio_core::ConnectionOps) {}
    }

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

    fn fixture(out_cap: usize) -> (Conn, EpollDriver, Token, RawFd) {
        let (a, b) = pair();
        let config = ConnConfig {
            max_in_buffer: 4096,
            max_out_buffer: out_cap,
            ..Default::default()
        };
        let conn = Conn::new(a, &config, Box::new(NullEvents), Token::new(0, 0));
        (conn, EpollDriver::new().unwrap(), Token::new(1, 0), b)
    }

    #[test]
    fn test_backpressure_commits_nothing() {
        let (mut conn, mut driver, token, peer) = fixture(8);

        assert_eq!(conn.send(&mut driver, token, b"abcd").unwrap(), 4);
        assert_eq!(conn.out_committed(), 4);

        // 5 > the 4 free bytes: rejected whole, nothing committed.
        let err = conn.send(&mut driver, token, b"vwxyz").unwrap_err();
        assert!(matches!(err, NetError::Backpressure));
        assert_eq!(conn.out_committed(), 4);
        assert_eq!(conn.out_free(), 4);

        unsafe { libc::close(peer) };
    }

    #[test]
    fn test_send_not_connected_rejected() {
        let (mut conn, mut driver, token, peer) = fixture(64);
        let mut pending = VecDeque::new();
        conn.shutdown(&mut driver, &mut pending, token, true);
        assert!(matches!(
            conn.send(&mut driver, token, b"x"),
            Err(NetError::NotConnected)
        ));
        unsafe { libc::close(peer) };
    }

    #[test]
    fn test_caller_buffer_freed_after_send_is_safe() {
        let (mut conn, mut driver, token, peer) = fixture(64);
        {
            let transient = b"copied".to_vec();
            conn.send(&mut driver, token, &transient).unwrap();
            // `transient` dropped here; the in-flight send targets the ring.
        }
        let mut out = Vec::new();
        driver.poll(&mut out, PollMode::Wait).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].result, 6);

        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(peer, buf.as_mut_ptr() as *mut _, 16) };
        assert_eq!(n, 6);
        assert_eq!(&buf[..6], b"copied");
        unsafe { libc::close(peer) };
    }

    #[test]
    fn test_forced_shutdown_fires_disconnected_once() {
        let (mut conn, mut driver, token, peer) = fixture(64);
        let mut pending = VecDeque::new();

        conn.shutdown(&mut driver, &mut pending, token, true);
        conn.shutdown(&mut driver, &mut pending, token, true);
        conn.shutdown(&mut driver, &mut pending, token, false);

        let disconnects = pending
            .iter()
            .filter(|n| matches!(n, Notice::Disconnected { .. }))
            .count();
        assert_eq!(disconnects, 1);
        assert_eq!(conn.state(), ConnState::Disconnected);
        unsafe { libc::close(peer) };
    }

    #[test]
    fn test_graceful_shutdown_flushes_before_terminal() {
        let (mut conn, mut driver, token, peer) = fixture(64);
        let mut pending = VecDeque::new();

        conn.send(&mut driver, token, b"tail bytes").unwrap();
        conn.shutdown(&mut driver, &mut pending, token, false);
        assert_eq!(conn.state(), ConnState::Disconnecting);
        assert!(pending.is_empty());

        // Drive the send completion; the flush finishes the teardown.
        let mut out = Vec::new();
        while conn.state() != ConnState::Disconnected {
            out.clear();
            driver.poll(&mut out, PollMode::Wait).unwrap();
            for comp in &out {
                let (tag, _) = op::decode(comp.user_data).unwrap();
                match tag {
                    OpTag::Send => conn.handle_send(&mut driver, &mut pending, token, comp.result),
                    OpTag::ShutWr => conn.handle_shutwr(&mut driver, token),
                    OpTag::Close => conn.handle_close(),
                    _ => unreachable!(),
                }
            }
        }

        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(peer, buf.as_mut_ptr() as *mut _, 16) };
        assert_eq!(n, 10);
        assert!(pending
            .iter()
            .any(|n| matches!(n, Notice::Disconnected { remote: false, .. })));
        unsafe { libc::close(peer) };
    }

    #[test]
    fn test_remote_eof_with_empty_out_is_terminal() {
        let (mut conn, mut driver, token, peer) = fixture(64);
        let mut pending = VecDeque::new();

        conn.arm_recv(&mut driver, token);
        unsafe { libc::close(peer) };

        let mut out = Vec::new();
        driver.poll(&mut out, PollMode::Wait).unwrap();
        assert_eq!(out.len(), 1);
        conn.handle_recv(&mut driver, &mut pending, token, out[0].result);

        assert_eq!(conn.state(), ConnState::Disconnected);
        assert!(pending
            .iter()
            .any(|n| matches!(n, Notice::Disconnected { remote: true, .. })));
    }
}
