//! `Connector` — the active-open state machine.
//!
//! Idle → Connecting → Idle. The sockaddr handed to the native connect is
//! a pool block leased for exactly the life of the in-flight operation;
//! the connector itself sits in a registry slot, so nothing the kernel
//! holds a pointer to can move or vanish before the completion drains.
//!
//! A deliberate cancel swallows the outcome entirely — including a
//! success that raced the cancel, whose fresh stream is closed without a
//! word to the factory.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use nexio_core::{BlockPool, ConnectionFactory, NetError, PoolBlock, Result};

use crate::acceptor::ADDR_STORAGE;
use crate::conn::ConnConfig;
use crate::driver::{fill_sockaddr, last_errno, Driver, IoOp};
use crate::op::{self, OpTag};
use crate::pool::ClassPool;
use crate::registry::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectorState {
    Idle,
    Connecting,
}

pub(crate) struct Connector {
    pub(crate) state: ConnectorState,
    pub(crate) fd: RawFd,
    pub(crate) factory: Box<dyn ConnectionFactory>,
    /// Applied to the connection this connector activates.
    pub(crate) config: ConnConfig,
    pub(crate) addr_block: Option<PoolBlock>,
    /// Deliberate cancel: swallow whatever the completion reports.
    pub(crate) cancelled: bool,
    pub(crate) close_inflight: bool,
    /// Release the slot once idle (host called `remove`).
    pub(crate) defunct: bool,
}

impl Connector {
    pub(crate) fn new(factory: Box<dyn ConnectionFactory>, config: ConnConfig) -> Self {
        Self {
            state: ConnectorState::Idle,
            fd: -1,
            factory,
            config,
            addr_block: None,
            cancelled: false,
            close_inflight: false,
            defunct: false,
        }
    }

    /// Open a native socket and issue the asynchronous connect. Fails
    /// fast while a connect is already in flight. Registration outlives
    /// only a successful issue step; completion is reported later.
    pub(crate) fn connect(
        &mut self,
        driver: &mut dyn Driver,
        pool: &mut ClassPool,
        token: Token,
        addr: &SocketAddr,
    ) -> Result<()> {
        if self.state == ConnectorState::Connecting {
            return Err(NetError::AlreadyConnecting);
        }
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
        let Some(block) = pool.allocate(ADDR_STORAGE) else {
            unsafe { libc::close(fd) };
            return Err(NetError::AtCapacity);
        };
        let addrlen = fill_sockaddr(block.ptr, addr);
        let io_op = IoOp::Connect {
            fd,
            addr: block.ptr as *const libc::sockaddr,
            addrlen,
        };
        if let Err(e) = driver.submit(io_op, op::encode(OpTag::Connect, token)) {
            pool.deallocate(block, ADDR_STORAGE);
            unsafe { libc::close(fd) };
            return Err(e);
        }
        self.fd = fd;
        self.addr_block = Some(block);
        self.state = ConnectorState::Connecting;
        self.cancelled = false;
        Ok(())
    }

    /// Deliberately abandon the in-flight connect. The completion (either
    /// `-ECANCELED` or a success that raced this call) is swallowed.
    pub(crate) fn cancel(&mut self, driver: &mut dyn Driver, token: Token) {
        if self.state != ConnectorState::Connecting || self.cancelled {
            return;
        }
        self.cancelled = true;
        let _ = driver.cancel(self.fd, op::encode(OpTag::Connect, token));
    }

    /// Return the sockaddr lease; the kernel is done with it once the
    /// connect completion has been delivered.
    pub(crate) fn release_addr(&mut self, pool: &mut ClassPool) {
        if let Some(block) = self.addr_block.take() {
            pool.deallocate(block, ADDR_STORAGE);
        }
    }

    /// Close the native socket this connector still owns (failure,
    /// cancellation, or declined factory).
    pub(crate) fn discard_socket(&mut self, driver: &mut dyn Driver, token: Token) {
        let ud = op::encode(OpTag::Close, token);
        if driver.submit(IoOp::Close { fd: self.fd }, ud).is_ok() {
            self.close_inflight = true;
        } else {
            unsafe { libc::close(self.fd) };
        }
        self.fd = -1;
        self.state = ConnectorState::Idle;
    }

    /// The slot may retire: host asked for removal and nothing is in flight.
    pub(crate) fn releasable(&self) -> bool {
        self.defunct && self.state == ConnectorState::Idle && !self.close_inflight
    }
}
