//! `Acceptor` — the passive-open state machine.
//!
//! Owns the listening fd and keeps exactly one accept armed against it
//! while open. The peer-address storage for the in-flight accept is a
//! pool block: it must stay valid (and in place) from arm to completion,
//! and the acceptor itself lives in a registry slot whose backing vector
//! may reallocate.
//!
//! A failed accept is logged and re-armed — one bad handshake never takes
//! the listener down. The accept/activate half that needs the registry
//! (inserting the new connection) lives in the reactor's dispatch.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use nexio_core::{net_info, BlockPool, ConnectionFactory, NetError, PoolBlock, Result};

use crate::conn::ConnConfig;
use crate::driver::{fill_sockaddr, last_errno, Driver, IoOp};
use crate::op::{self, OpTag};
use crate::pool::ClassPool;
use crate::registry::Token;

/// Peer-address storage leased while an accept is armed: the address
/// record the kernel fills, then its length word (padded to keep the
/// pool's 8-byte block granularity).
pub(crate) const ADDR_STORAGE: usize = std::mem::size_of::<libc::sockaddr_storage>();
pub(crate) const ADDR_BLOCK: usize = ADDR_STORAGE + 8;

#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    pub backlog: i32,
    /// Restrict an IPv6 listener to IPv6 traffic only.
    pub ipv6_only: bool,
    pub reuse_addr: bool,
    pub reuse_port: bool,
    /// Single-connection harness support: an accept that finds the
    /// previously activated connection still live tears it down before
    /// activating the new one.
    pub replace_existing: bool,
    /// Applied to every connection this acceptor activates.
    pub conn: ConnConfig,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            backlog: 4096,
            ipv6_only: false,
            reuse_addr: true,
            reuse_port: false,
            replace_existing: false,
            conn: ConnConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptorState {
    Closed,
    Open,
    /// Close submitted; waiting for the armed accept and the close to drain.
    Closing,
}

pub(crate) struct Acceptor {
    pub(crate) state: AcceptorState,
    pub(crate) fd: RawFd,
    pub(crate) factory: Box<dyn ConnectionFactory>,
    pub(crate) config: AcceptorConfig,
    pub(crate) addr_block: Option<PoolBlock>,
    pub(crate) accept_inflight: bool,
    pub(crate) close_done: bool,
    /// Release the slot once fully drained (host called `remove`).
    pub(crate) defunct: bool,
    /// Most recently activated connection (`replace_existing` bookkeeping).
    pub(crate) last_conn: Option<Token>,
}

impl Acceptor {
    pub(crate) fn new(factory: Box<dyn ConnectionFactory>, config: AcceptorConfig) -> Self {
        Self {
            state: AcceptorState::Closed,
            fd: -1,
            factory,
            config,
            addr_block: None,
            accept_inflight: false,
            close_done: false,
            defunct: false,
            last_conn: None,
        }
    }

    /// Bind, listen and arm the first accept. Fails fast (no side
    /// effects) on an acceptor that is already open or still closing.
    pub(crate) fn open(
        &mut self,
        driver: &mut dyn Driver,
        pool: &mut ClassPool,
        token: Token,
        addr: &SocketAddr,
    ) -> Result<()> {
        if self.state != AcceptorState::Closed {
            return Err(NetError::AlreadyOpen);
        }
        let fd = open_listener(addr, &self.config)?;
        let Some(block) = pool.allocate(ADDR_BLOCK) else {
            unsafe { libc::close(fd) };
            return Err(NetError::AtCapacity);
        };
        self.fd = fd;
        self.addr_block = Some(block);
        self.arm_accept(driver, token);
        if !self.accept_inflight {
            self.addr_block = None;
            pool.deallocate(block, ADDR_BLOCK);
            unsafe { libc::close(fd) };
            self.fd = -1;
            return Err(NetError::RingFull);
        }
        self.state = AcceptorState::Open;
        self.close_done = false;
        net_info!("acceptor: listening on {} (backlog {})", addr, self.config.backlog);
        Ok(())
    }

    /// Re-arm (or first-arm) the accept against the leased address block.
    pub(crate) fn arm_accept(&mut self, driver: &mut dyn Driver, token: Token) {
        let block = self.addr_block.expect("acceptor: armed without an address block");
        let addrlen = unsafe {
            let p = block.ptr.add(ADDR_STORAGE) as *mut libc::socklen_t;
            *p = ADDR_STORAGE as libc::socklen_t;
            p
        };
        let io_op = IoOp::Accept {
            fd: self.fd,
            addr: block.ptr as *mut libc::sockaddr,
            addrlen,
        };
        if driver.submit(io_op, op::encode(OpTag::Accept, token)).is_ok() {
            self.accept_inflight = true;
        }
    }

    /// Begin asynchronous teardown of the listener. Idempotent.
    pub(crate) fn close(&mut self, driver: &mut dyn Driver, pool: &mut ClassPool, token: Token) {
        if self.state != AcceptorState::Open {
            return;
        }
        self.state = AcceptorState::Closing;
        if self.accept_inflight {
            // The address block stays leased until the cancelled accept
            // drains: a success racing the cancel still writes into it.
            let _ = driver.cancel(self.fd, op::encode(OpTag::Accept, token));
        } else if let Some(block) = self.addr_block.take() {
            pool.deallocate(block, ADDR_BLOCK);
        }
        let ud = op::encode(OpTag::Close, token);
        if driver.submit(IoOp::Close { fd: self.fd }, ud).is_err() {
            unsafe { libc::close(self.fd) };
            self.close_done = true;
        }
        self.fd = -1;
    }

    /// The in-flight accept has drained while closing; drop its lease and
    /// finish the Closing → Closed transition when the close is also done.
    pub(crate) fn drain_accept(&mut self, pool: &mut ClassPool) {
        self.accept_inflight = false;
        if let Some(block) = self.addr_block.take() {
            pool.deallocate(block, ADDR_BLOCK);
        }
        self.try_finish_close();
    }

    pub(crate) fn handle_close(&mut self, pool: &mut ClassPool) {
        self.close_done = true;
        if !self.accept_inflight {
            if let Some(block) = self.addr_block.take() {
                pool.deallocate(block, ADDR_BLOCK);
            }
        }
        self.try_finish_close();
    }

    fn try_finish_close(&mut self) {
        if self.state == AcceptorState::Closing && self.close_done && !self.accept_inflight {
            self.state = AcceptorState::Closed;
        }
    }

    /// The slot may retire: host asked for removal and nothing is in flight.
    pub(crate) fn releasable(&self) -> bool {
        self.defunct && self.state == AcceptorState::Closed && !self.accept_inflight
    }
}

/// Listener setup: socket, options, bind, listen. Any failure closes the
/// half-open socket and reports the errno.
fn open_listener(addr: &SocketAddr, config: &AcceptorConfig) -> Result<RawFd> {
    let family = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(NetError::Setup(last_errno()));
    }

    let on: libc::c_int = 1;
    let optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        if config.reuse_addr {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &on as *const _ as *const libc::c_void,
                optlen,
            );
        }
        if config.reuse_port {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &on as *const _ as *const libc::c_void,
                optlen,
            );
        }
        if family == libc::AF_INET6 {
            let v6only: libc::c_int = config.ipv6_only as libc::c_int;
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &v6only as *const _ as *const libc::c_void,
                optlen,
            );
        }
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = fill_sockaddr(&mut storage as *mut _ as *mut u8, addr);
    let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc != 0 {
        let errno = last_errno();
        unsafe { libc::close(fd) };
        return Err(NetError::Os(errno));
    }
    let rc = unsafe { libc::listen(fd, config.backlog) };
    if rc != 0 {
        let errno = last_errno();
        unsafe { libc::close(fd) };
        return Err(NetError::Os(errno));
    }
    Ok(fd)
}
