//! `Reactor` — the single-threaded event loop and handler registry.
//!
//! One `poll` call is one turn: flush queued submissions, drain driver
//! completions, dispatch each to the handler its `user_data` token names,
//! deliver the notifications those dispatches queued, and retire slots
//! whose last completion has drained.
//!
//! Two disciplines hold everything together:
//!
//! - **Token-first routing.** A completion carries a token, never a
//!   pointer. The registry lookup revalidates index + generation, so a
//!   completion that outlives its handler quietly resolves to nothing.
//!
//! - **Deferred notification.** Outward hooks are queued and delivered
//!   only from the top of `poll` (or after a host-facing entry point), so
//!   no hook ever runs inside another. A teardown triggered inside
//!   `on_new_data` delivers its "disconnected" right after `on_new_data`
//!   returns.
//!
//! A slot is released only when its close completion has run, every
//! in-flight operation for it has drained, and no queued notification
//! still targets it — the buffers and address blocks a submitted
//! operation points into live exactly as long as the kernel might touch
//! them.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use nexio_core::{
    net_info, net_warn, ConnectionEvents, ConnectionFactory, ConnectionOps, NetError, Reason,
    Result,
};

use crate::acceptor::{Acceptor, AcceptorConfig, AcceptorState, ADDR_BLOCK};
use crate::conn::{tune_stream, Conn, ConnConfig, ConnState};
use crate::connector::{Connector, ConnectorState};
use crate::driver::{
    local_addr, open_driver, Backend, Completion, Driver, PollMode, ECANCELED_RESULT,
};
use crate::op::{self, OpTag};
use crate::pool::ClassPool;
use crate::registry::{Registry, Token};

#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
    pub backend: Backend,
    /// io_uring submission ring size (ignored by the epoll backend).
    pub sq_entries: u32,
    /// Upper bound on simultaneously registered handlers.
    pub max_handlers: usize,
    /// Initial completion batch capacity.
    pub completion_batch: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            sq_entries: 256,
            max_handlers: 4096,
            completion_batch: 256,
        }
    }
}

/// A queued outward notification. Delivery is strictly after the dispatch
/// (or host call) that queued it.
pub(crate) enum Notice {
    Connected(Token),
    NewData(Token),
    SomeDataSent(Token, usize),
    Error(Token, Reason),
    Disconnected { token: Token, remote: bool },
    ConnectFailed { connector: Token, reason: Reason },
}

impl Notice {
    fn targets(&self, token: Token) -> bool {
        match *self {
            Notice::Connected(t)
            | Notice::NewData(t)
            | Notice::SomeDataSent(t, _)
            | Notice::Error(t, _) => t == token,
            Notice::Disconnected { token: t, .. } => t == token,
            Notice::ConnectFailed { connector, .. } => connector == token,
        }
    }
}

enum Handler {
    Acceptor(Acceptor),
    Connector(Connector),
    Conn(Conn),
}

/// Bound on the teardown drain in `Drop`.
const SHUTDOWN_DRAIN_ROUNDS: usize = 1024;

pub struct Reactor {
    driver: Box<dyn Driver>,
    handlers: Registry<Handler>,
    /// Transient request blocks: accept peer-address storage and connect
    /// sockaddrs, leased per in-flight operation.
    pool: ClassPool,
    pending: VecDeque<Notice>,
    comps: Vec<Completion>,
    /// Slots whose teardown has started; swept once fully drained.
    retiring: Vec<Token>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<Self> {
        let driver = open_driver(config.backend, config.sq_entries)?;
        net_info!(
            "reactor: started ({} backend, {} handler slots)",
            driver.name(),
            config.max_handlers
        );
        let blocks = config.max_handlers.clamp(8, 1024);
        Ok(Self {
            driver,
            handlers: Registry::new(config.max_handlers),
            pool: ClassPool::new(&[(ADDR_BLOCK, blocks)]),
            pending: VecDeque::new(),
            comps: Vec::with_capacity(config.completion_batch),
            retiring: Vec::new(),
        })
    }

    /// Name of the backend actually selected.
    pub fn backend(&self) -> &'static str {
        self.driver.name()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Advance the loop once: submit, reap, dispatch, notify, retire.
    /// Returns the number of completions processed.
    pub fn poll(&mut self, mode: PollMode) -> Result<usize> {
        let mut comps = std::mem::take(&mut self.comps);
        comps.clear();
        self.driver.flush()?;
        self.driver.poll(&mut comps, mode)?;
        let count = comps.len();
        for comp in comps.drain(..) {
            self.dispatch(comp);
        }
        self.comps = comps;
        self.deliver_pending();
        self.sweep_retiring();
        Ok(count)
    }

    // ── Acceptor API ──

    pub fn add_acceptor(
        &mut self,
        factory: Box<dyn ConnectionFactory>,
        config: AcceptorConfig,
    ) -> Result<Token> {
        self.handlers
            .insert(Handler::Acceptor(Acceptor::new(factory, config)))
    }

    /// Bind, listen and start accepting. Fails fast if already open.
    pub fn open_acceptor(&mut self, token: Token, addr: SocketAddr) -> Result<()> {
        let Self {
            driver,
            handlers,
            pool,
            ..
        } = self;
        match handlers.get_mut(token) {
            Some(Handler::Acceptor(acceptor)) => acceptor.open(driver.as_mut(), pool, token, &addr),
            Some(_) => Err(NetError::Stale),
            None => Err(NetError::Stale),
        }
    }

    /// The listening address (useful after binding port 0). `None` when
    /// the acceptor is not open.
    pub fn acceptor_addr(&self, token: Token) -> Option<SocketAddr> {
        match self.handlers.get(token)? {
            Handler::Acceptor(acceptor) if acceptor.state == AcceptorState::Open => {
                local_addr(acceptor.fd)
            }
            _ => None,
        }
    }

    /// Stop accepting and begin asynchronous teardown of the listener.
    /// Idempotent; established connections are not touched.
    pub fn close_acceptor(&mut self, token: Token) {
        let Self {
            driver,
            handlers,
            pool,
            ..
        } = self;
        if let Some(Handler::Acceptor(acceptor)) = handlers.get_mut(token) {
            acceptor.close(driver.as_mut(), pool, token);
        }
    }

    // ── Connector API ──

    pub fn add_connector(
        &mut self,
        factory: Box<dyn ConnectionFactory>,
        config: ConnConfig,
    ) -> Result<Token> {
        self.handlers
            .insert(Handler::Connector(Connector::new(factory, config)))
    }

    /// Issue an asynchronous connect. Fails fast if one is in flight.
    pub fn connect(&mut self, token: Token, addr: SocketAddr) -> Result<()> {
        let Self {
            driver,
            handlers,
            pool,
            ..
        } = self;
        match handlers.get_mut(token) {
            Some(Handler::Connector(connector)) => {
                connector.connect(driver.as_mut(), pool, token, &addr)
            }
            _ => Err(NetError::Stale),
        }
    }

    /// Abandon an in-flight connect. The completion is swallowed whatever
    /// it reports; `connect_failed` will not fire.
    pub fn cancel_connect(&mut self, token: Token) {
        let Self {
            driver, handlers, ..
        } = self;
        if let Some(Handler::Connector(connector)) = handlers.get_mut(token) {
            connector.cancel(driver.as_mut(), token);
        }
    }

    // ── Connection API (token-addressed; hooks get the same operations
    //    through their context) ──

    pub fn send(&mut self, token: Token, data: &[u8]) -> Result<usize> {
        let Self {
            driver, handlers, ..
        } = self;
        match handlers.get_mut(token) {
            Some(Handler::Conn(conn)) => conn.send(driver.as_mut(), token, data),
            _ => Err(NetError::Stale),
        }
    }

    /// The contiguous readable prefix of a connection's in buffer. Empty
    /// for a stale token.
    pub fn recv_data(&self, token: Token) -> &[u8] {
        match self.handlers.get(token) {
            Some(Handler::Conn(conn)) => conn.recv_data(),
            _ => &[],
        }
    }

    /// Retire fully-consumed bytes from the front of the in buffer.
    pub fn consume_recv(&mut self, token: Token, n: usize) {
        let Self {
            driver, handlers, ..
        } = self;
        if let Some(Handler::Conn(conn)) = handlers.get_mut(token) {
            conn.consume_recv(driver.as_mut(), token, n);
        }
    }

    /// Begin connection teardown. `now` discards pending output.
    pub fn shutdown(&mut self, token: Token, now: bool) {
        {
            let Self {
                driver,
                handlers,
                pending,
                ..
            } = self;
            if let Some(Handler::Conn(conn)) = handlers.get_mut(token) {
                conn.shutdown(driver.as_mut(), pending, token, now);
            }
        }
        self.deliver_pending();
    }

    pub fn conn_state(&self, token: Token) -> Option<ConnState> {
        match self.handlers.get(token) {
            Some(Handler::Conn(conn)) => Some(conn.state()),
            _ => None,
        }
    }

    /// Unregister a handler: connections are force-shut, acceptors
    /// closed, in-flight connects cancelled. The slot retires once its
    /// native teardown has drained.
    pub fn remove(&mut self, token: Token) {
        {
            let Self {
                driver,
                handlers,
                pool,
                pending,
                retiring,
                ..
            } = self;
            match handlers.get_mut(token) {
                Some(Handler::Conn(conn)) => {
                    conn.shutdown(driver.as_mut(), pending, token, true);
                    if conn.releasable() {
                        retiring.push(token);
                    }
                }
                Some(Handler::Acceptor(acceptor)) => {
                    acceptor.defunct = true;
                    acceptor.close(driver.as_mut(), pool, token);
                    if acceptor.releasable() {
                        retiring.push(token);
                    }
                }
                Some(Handler::Connector(connector)) => {
                    connector.defunct = true;
                    if connector.state == ConnectorState::Connecting {
                        connector.cancel(driver.as_mut(), token);
                    }
                    if connector.releasable() {
                        retiring.push(token);
                    }
                }
                None => {}
            }
        }
        self.deliver_pending();
        self.sweep_retiring();
    }

    // ── Completion dispatch ──

    fn dispatch(&mut self, comp: Completion) {
        // Sentinel user_data (cancel SQEs and the like) decodes to nothing.
        let Some((tag, token)) = op::decode(comp.user_data) else {
            return;
        };
        match tag {
            OpTag::Accept => self.on_accept(token, comp.result),
            OpTag::Connect => self.on_connect(token, comp.result),
            OpTag::Recv | OpTag::Send | OpTag::ShutWr => self.on_stream(tag, token, comp.result),
            OpTag::Close => self.on_close(token),
        }
    }

    fn on_stream(&mut self, tag: OpTag, token: Token, result: i64) {
        let Self {
            driver,
            handlers,
            pending,
            retiring,
            ..
        } = self;
        // Stale token: the owner is gone; the completion is a no-op.
        let Some(handler) = handlers.get_mut(token) else {
            return;
        };
        let Handler::Conn(conn) = handler else {
            panic!("reactor: stream completion routed to a non-connection slot");
        };
        match tag {
            OpTag::Recv => conn.handle_recv(driver.as_mut(), pending, token, result),
            OpTag::Send => conn.handle_send(driver.as_mut(), pending, token, result),
            OpTag::ShutWr => conn.handle_shutwr(driver.as_mut(), token),
            _ => unreachable!(),
        }
        if conn.releasable() {
            retiring.push(token);
        }
    }

    fn on_close(&mut self, token: Token) {
        let Self {
            handlers,
            pool,
            retiring,
            ..
        } = self;
        let Some(handler) = handlers.get_mut(token) else {
            return;
        };
        match handler {
            Handler::Conn(conn) => {
                conn.handle_close();
                retiring.push(token);
            }
            Handler::Acceptor(acceptor) => {
                acceptor.handle_close(pool);
                if acceptor.releasable() {
                    retiring.push(token);
                }
            }
            Handler::Connector(connector) => {
                connector.close_inflight = false;
                if connector.releasable() {
                    retiring.push(token);
                }
            }
        }
    }

    fn on_accept(&mut self, token: Token, result: i64) {
        // First pass: acceptor bookkeeping and the factory call.
        let (conn_config, replace, prev, events, new_fd);
        {
            let Self {
                driver,
                handlers,
                pool,
                retiring,
                ..
            } = self;
            let Some(handler) = handlers.get_mut(token) else {
                // Listener already unregistered; drop a raced success.
                if result >= 0 {
                    unsafe { libc::close(result as RawFd) };
                }
                return;
            };
            let Handler::Acceptor(acceptor) = handler else {
                panic!("reactor: accept completion routed to a non-acceptor slot");
            };
            acceptor.accept_inflight = false;

            if acceptor.state != AcceptorState::Open {
                // Closing: release the address lease; a success that
                // raced the cancel still hands us a live stream to drop.
                acceptor.drain_accept(pool);
                if result >= 0 {
                    unsafe { libc::close(result as RawFd) };
                }
                if acceptor.releasable() {
                    retiring.push(token);
                }
                return;
            }

            if result < 0 {
                // One failed handshake never takes the listener down.
                if result != ECANCELED_RESULT {
                    net_warn!("acceptor: accept failed: {}", Reason::from_result(result));
                }
                acceptor.arm_accept(driver.as_mut(), token);
                return;
            }

            new_fd = result as RawFd;
            conn_config = acceptor.config.conn;
            replace = acceptor.config.replace_existing;
            prev = acceptor.last_conn;
            events = acceptor.factory.create_connection();
        }

        let activated = match events {
            Some(events) => {
                if replace {
                    // Single-connection harness: the factory's previous
                    // connection must die before the new one goes live.
                    if let Some(prev) = prev {
                        if self.handlers.contains(prev) {
                            self.shutdown_internal(prev, true);
                        }
                    }
                }
                self.activate(new_fd, &conn_config, events, token)
            }
            None => {
                net_warn!("acceptor: factory declined connection, dropping fd {}", new_fd);
                unsafe { libc::close(new_fd) };
                None
            }
        };

        // Second pass: remember the activation and re-arm the accept.
        let Self {
            driver, handlers, ..
        } = self;
        if let Some(Handler::Acceptor(acceptor)) = handlers.get_mut(token) {
            if activated.is_some() {
                acceptor.last_conn = activated;
            }
            if acceptor.state == AcceptorState::Open {
                acceptor.arm_accept(driver.as_mut(), token);
            }
        }
    }

    fn on_connect(&mut self, token: Token, result: i64) {
        enum Outcome {
            Swallowed,
            Failed(Reason),
            Activate {
                fd: RawFd,
                events: Box<dyn ConnectionEvents>,
                config: ConnConfig,
            },
        }

        let outcome;
        {
            let Self {
                driver,
                handlers,
                pool,
                ..
            } = self;
            let Some(handler) = handlers.get_mut(token) else {
                return;
            };
            let Handler::Connector(connector) = handler else {
                panic!("reactor: connect completion routed to a non-connector slot");
            };
            // The kernel is done with the sockaddr once the completion is
            // delivered.
            connector.release_addr(pool);
            if connector.state != ConnectorState::Connecting {
                return;
            }

            outcome = if connector.cancelled || result == ECANCELED_RESULT {
                // Deliberate teardown: swallow even a success that raced
                // the cancel.
                connector.discard_socket(driver.as_mut(), token);
                Outcome::Swallowed
            } else if result < 0 {
                connector.discard_socket(driver.as_mut(), token);
                Outcome::Failed(Reason::from_result(result))
            } else {
                match connector.factory.create_connection() {
                    Some(events) => {
                        let fd = connector.fd;
                        connector.fd = -1;
                        connector.state = ConnectorState::Idle;
                        Outcome::Activate {
                            fd,
                            events,
                            config: connector.config,
                        }
                    }
                    None => {
                        net_warn!("connector: factory declined connection");
                        connector.discard_socket(driver.as_mut(), token);
                        Outcome::Swallowed
                    }
                }
            };
        }

        match outcome {
            Outcome::Swallowed => {}
            Outcome::Failed(reason) => self.pending.push_back(Notice::ConnectFailed {
                connector: token,
                reason,
            }),
            Outcome::Activate { fd, events, config } => {
                self.activate(fd, &config, events, token);
            }
        }

        if let Some(Handler::Connector(connector)) = self.handlers.get(token) {
            if connector.releasable() {
                self.retiring.push(token);
            }
        }
    }

    /// Common accept/connect tail: tune the stream, register the
    /// connection, arm its first read, queue "connected".
    fn activate(
        &mut self,
        fd: RawFd,
        config: &ConnConfig,
        events: Box<dyn ConnectionEvents>,
        origin: Token,
    ) -> Option<Token> {
        if self.handlers.len() >= self.handlers.capacity() {
            net_warn!("reactor: handler registry full, dropping fd {}", fd);
            unsafe { libc::close(fd) };
            return None;
        }
        tune_stream(fd, config);
        let conn = Conn::new(fd, config, events, origin);
        let token = self
            .handlers
            .insert(Handler::Conn(conn))
            .expect("reactor: registry insert after capacity check");
        let Self {
            driver,
            handlers,
            pending,
            ..
        } = self;
        if let Some(Handler::Conn(conn)) = handlers.get_mut(token) {
            conn.arm_recv(driver.as_mut(), token);
        }
        pending.push_back(Notice::Connected(token));
        Some(token)
    }

    /// Force-shutdown without the trailing notification flush (used from
    /// inside dispatch, where `poll` delivers afterwards).
    fn shutdown_internal(&mut self, token: Token, now: bool) {
        let Self {
            driver,
            handlers,
            pending,
            ..
        } = self;
        if let Some(Handler::Conn(conn)) = handlers.get_mut(token) {
            conn.shutdown(driver.as_mut(), pending, token, now);
        }
    }

    // ── Notification delivery ──

    fn deliver_pending(&mut self) {
        while let Some(notice) = self.pending.pop_front() {
            match notice {
                Notice::Connected(token) => self.deliver_hook(token, Hook::Connected),
                Notice::NewData(token) => self.deliver_hook(token, Hook::NewData),
                Notice::SomeDataSent(token, n) => self.deliver_hook(token, Hook::Sent(n)),
                Notice::Error(token, reason) => {
                    if let Some(Handler::Conn(conn)) = self.handlers.get_mut(token) {
                        if let Some(mut events) = conn.take_events() {
                            events.on_error(reason);
                            conn.put_events(events);
                        }
                    }
                }
                Notice::Disconnected { token, remote } => {
                    if let Some(Handler::Conn(conn)) = self.handlers.get_mut(token) {
                        if let Some(mut events) = conn.take_events() {
                            events.on_disconnected(remote);
                            conn.put_events(events);
                        }
                    }
                }
                Notice::ConnectFailed { connector, reason } => {
                    if let Some(Handler::Connector(c)) = self.handlers.get_mut(connector) {
                        c.factory.connect_failed(reason);
                    }
                }
            }
        }
    }

    fn deliver_hook(&mut self, token: Token, hook: Hook) {
        let Self {
            driver,
            handlers,
            pending,
            ..
        } = self;
        let Some(Handler::Conn(conn)) = handlers.get_mut(token) else {
            return;
        };
        let Some(mut events) = conn.take_events() else {
            return;
        };
        {
            let mut ctx = ConnCtx {
                conn: &mut *conn,
                driver: driver.as_mut(),
                pending,
                token,
            };
            match hook {
                Hook::Connected => events.on_connected(&mut ctx),
                Hook::NewData => events.on_new_data(&mut ctx),
                Hook::Sent(n) => events.on_some_data_sent(&mut ctx, n),
            }
        }
        conn.put_events(events);
    }

    // ── Slot retirement ──

    fn sweep_retiring(&mut self) {
        if self.retiring.is_empty() {
            return;
        }
        let mut keep = Vec::new();
        while let Some(token) = self.retiring.pop() {
            let releasable = match self.handlers.get(token) {
                Some(Handler::Conn(conn)) => conn.releasable(),
                Some(Handler::Acceptor(acceptor)) => acceptor.releasable(),
                Some(Handler::Connector(connector)) => connector.releasable(),
                None => continue, // duplicate entry, already released
            };
            if !releasable || self.pending.iter().any(|n| n.targets(token)) {
                keep.push(token);
                continue;
            }
            if let Some(Handler::Conn(conn)) = self.handlers.remove(token) {
                let origin = conn.origin();
                if let Some(events) = conn.into_events() {
                    self.route_destroy(origin, events);
                }
            }
        }
        self.retiring = keep;
    }

    /// The release half of the factory contract: hand the events sink
    /// back to the acceptor/connector that created it, if still alive.
    fn route_destroy(&mut self, origin: Token, events: Box<dyn ConnectionEvents>) {
        match self.handlers.get_mut(origin) {
            Some(Handler::Acceptor(a)) => a.factory.destroy_connection(events),
            Some(Handler::Connector(c)) => c.factory.destroy_connection(events),
            _ => drop(events),
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let tokens = self.handlers.tokens();
        if !tokens.is_empty() {
            net_info!("reactor: tearing down {} live handlers", tokens.len());
        }
        for token in tokens {
            self.remove(token);
        }
        // Drain until quiescent, bounded so a wedged kernel cannot hang
        // the destructor.
        for _ in 0..SHUTDOWN_DRAIN_ROUNDS {
            if self.driver.inflight() == 0 && self.handlers.is_empty() {
                break;
            }
            if self.poll(PollMode::Wait).is_err() {
                break;
            }
        }
        if !self.handlers.is_empty() {
            net_warn!(
                "reactor: {} handlers still registered at teardown",
                self.handlers.len()
            );
        }
    }
}

enum Hook {
    Connected,
    NewData,
    Sent(usize),
}

/// Callback context: the connection operations, without reborrowing the
/// reactor from inside a hook.
struct ConnCtx<'a> {
    conn: &'a mut Conn,
    driver: &'a mut dyn Driver,
    pending: &'a mut VecDeque<Notice>,
    token: Token,
}

impl ConnectionOps for ConnCtx<'_> {
    fn conn_id(&self) -> u64 {
        self.token.id()
    }

    fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.conn.send(self.driver, self.token, data)
    }

    fn recv_data(&self) -> &[u8] {
        self.conn.recv_data()
    }

    fn consume_recv(&mut self, n: usize) {
        self.conn.consume_recv(self.driver, self.token, n);
    }

    fn shutdown(&mut self, now: bool) {
        self.conn.shutdown(self.driver, self.pending, self.token, now);
    }

    fn out_committed(&self) -> usize {
        self.conn.out_committed()
    }

    fn out_free(&self) -> usize {
        self.conn.out_free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    struct Log {
        connected: usize,
        disconnected: Vec<bool>,
        connect_failed: Vec<i32>,
        errors: Vec<i32>,
        received: Vec<u8>,
        sent: usize,
        ids: Vec<u64>,
    }

    struct RecordingEvents {
        log: Rc<RefCell<Log>>,
        echo: bool,
    }

    impl ConnectionEvents for RecordingEvents {
        fn on_connected(&mut self, conn: &mut dyn ConnectionOps) {
            let mut log = self.log.borrow_mut();
            log.connected += 1;
            log.ids.push(conn.conn_id());
        }

        fn on_disconnected(&mut self, remote: bool) {
            self.log.borrow_mut().disconnected.push(remote);
        }

        fn on_new_data(&mut self, conn: &mut dyn ConnectionOps) {
            let data = conn.recv_data().to_vec();
            if self.echo {
                let _ = conn.send(&data);
            }
            conn.consume_recv(data.len());
            self.log.borrow_mut().received.extend_from_slice(&data);
        }

        fn on_some_data_sent(&mut self, _conn: &mut dyn ConnectionOps, bytes: usize) {
            self.log.borrow_mut().sent += bytes;
        }

        fn on_error(&mut self, reason: Reason) {
            self.log.borrow_mut().errors.push(reason.errno());
        }
    }

    struct RecordingFactory {
        log: Rc<RefCell<Log>>,
        echo: bool,
    }

    impl ConnectionFactory for RecordingFactory {
        fn create_connection(&mut self) -> Option<Box<dyn ConnectionEvents>> {
            Some(Box::new(RecordingEvents {
                log: self.log.clone(),
                echo: self.echo,
            }))
        }

        fn connect_failed(&mut self, reason: Reason) {
            self.log.borrow_mut().connect_failed.push(reason.errno());
        }
    }

    fn reactor() -> Reactor {
        Reactor::new(ReactorConfig {
            backend: Backend::Epoll,
            ..Default::default()
        })
        .unwrap()
    }

    fn factory(log: &Rc<RefCell<Log>>, echo: bool) -> Box<RecordingFactory> {
        Box::new(RecordingFactory {
            log: log.clone(),
            echo,
        })
    }

    /// Poll until `cond` holds, bounded.
    fn drive(r: &mut Reactor, mut cond: impl FnMut(&mut Reactor) -> bool) {
        for _ in 0..200 {
            if cond(r) {
                return;
            }
            r.poll(PollMode::Wait).unwrap();
        }
        assert!(cond(r), "condition not reached within the poll bound");
    }

    fn open_echo_server(r: &mut Reactor, log: &Rc<RefCell<Log>>, config: AcceptorConfig) -> (Token, SocketAddr) {
        let acc = r.add_acceptor(factory(log, true), config).unwrap();
        r.open_acceptor(acc, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = r.acceptor_addr(acc).unwrap();
        (acc, addr)
    }

    #[test]
    fn test_accept_echo_round_trip() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let (_acc, addr) = open_echo_server(&mut r, &log, AcceptorConfig::default());

        let mut peer = TcpStream::connect(addr).unwrap();
        drive(&mut r, |_| log.borrow().connected == 1);

        peer.write_all(b"ping").unwrap();
        drive(&mut r, |_| log.borrow().received == b"ping");
        // The echoed bytes leave the ring on a later turn.
        drive(&mut r, |_| log.borrow().sent == 4);

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_double_open_rejected() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let (acc, addr) = open_echo_server(&mut r, &log, AcceptorConfig::default());

        assert!(matches!(
            r.open_acceptor(acc, "127.0.0.1:0".parse().unwrap()),
            Err(NetError::AlreadyOpen)
        ));
        // The original listener is untouched.
        assert_eq!(r.acceptor_addr(acc), Some(addr));
        assert!(TcpStream::connect(addr).is_ok());
    }

    #[test]
    fn test_disconnected_once_on_local_shutdown() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let (_acc, addr) = open_echo_server(&mut r, &log, AcceptorConfig::default());

        let _peer = TcpStream::connect(addr).unwrap();
        drive(&mut r, |_| log.borrow().connected == 1);
        let token = Token::from_id(log.borrow().ids[0]);

        r.shutdown(token, true);
        r.shutdown(token, true); // second call must be a no-op
        drive(&mut r, |r| r.conn_state(token).is_none());

        assert_eq!(log.borrow().disconnected.as_slice(), &[false]);
        assert!(log.borrow().errors.is_empty());
    }

    #[test]
    fn test_disconnected_once_on_remote_eof() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let (_acc, addr) = open_echo_server(&mut r, &log, AcceptorConfig::default());

        let peer = TcpStream::connect(addr).unwrap();
        drive(&mut r, |_| log.borrow().connected == 1);

        drop(peer); // clean FIN, out buffer empty
        drive(&mut r, |_| !log.borrow().disconnected.is_empty());
        for _ in 0..5 {
            r.poll(PollMode::NonBlocking).unwrap();
        }

        assert_eq!(log.borrow().disconnected.as_slice(), &[true]);
        assert!(log.borrow().errors.is_empty());
    }

    #[test]
    fn test_disconnected_once_on_io_error() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let (_acc, addr) = open_echo_server(&mut r, &log, AcceptorConfig::default());

        let peer = TcpStream::connect(addr).unwrap();
        drive(&mut r, |_| log.borrow().connected == 1);

        // SO_LINGER 0 turns the drop into an RST.
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        unsafe {
            libc::setsockopt(
                peer.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            );
        }
        drop(peer);

        drive(&mut r, |_| !log.borrow().disconnected.is_empty());
        for _ in 0..5 {
            r.poll(PollMode::NonBlocking).unwrap();
        }

        let log = log.borrow();
        assert_eq!(log.disconnected.len(), 1);
        assert_eq!(log.errors.as_slice(), &[libc::ECONNRESET]);
    }

    #[test]
    fn test_graceful_shutdown_flushes_pending_output() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let (_acc, addr) = open_echo_server(&mut r, &log, AcceptorConfig::default());

        let mut peer = TcpStream::connect(addr).unwrap();
        drive(&mut r, |_| log.borrow().connected == 1);
        let token = Token::from_id(log.borrow().ids[0]);

        r.send(token, b"flushed before close").unwrap();
        r.shutdown(token, false);
        drive(&mut r, |_| !log.borrow().disconnected.is_empty());

        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"flushed before close");
        assert_eq!(log.borrow().disconnected.as_slice(), &[false]);
    }

    #[test]
    fn test_send_backpressure_leaves_buffer_unchanged() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let config = AcceptorConfig {
            conn: ConnConfig {
                max_out_buffer: 16,
                ..Default::default()
            },
            ..Default::default()
        };
        let acc = r.add_acceptor(factory(&log, false), config).unwrap();
        r.open_acceptor(acc, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = r.acceptor_addr(acc).unwrap();

        let _peer = TcpStream::connect(addr).unwrap();
        drive(&mut r, |_| log.borrow().connected == 1);
        let token = Token::from_id(log.borrow().ids[0]);

        // 17 > capacity 16: rejected whole, nothing committed, and the
        // connection is still usable.
        assert!(matches!(
            r.send(token, &[0u8; 17]),
            Err(NetError::Backpressure)
        ));
        assert_eq!(r.send(token, &[1u8; 16]).unwrap(), 16);
    }

    #[test]
    fn test_connect_and_connect_refused() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();

        // Live listener for the success; a bound-then-dropped port for
        // the refusal.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let good = listener.local_addr().unwrap();
        let bad = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };

        let ok = r.add_connector(factory(&log, false), ConnConfig::default()).unwrap();
        r.connect(ok, good).unwrap();
        drive(&mut r, |_| log.borrow().connected == 1);
        assert!(log.borrow().connect_failed.is_empty());

        let refused = r.add_connector(factory(&log, false), ConnConfig::default()).unwrap();
        r.connect(refused, bad).unwrap();
        drive(&mut r, |_| !log.borrow().connect_failed.is_empty());
        assert_eq!(log.borrow().connect_failed.as_slice(), &[libc::ECONNREFUSED]);
        assert_eq!(log.borrow().connected, 1);
    }

    #[test]
    fn test_cancelled_connect_is_swallowed() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();

        // Whatever the completion reports — success raced by the cancel,
        // -ECANCELED, or an unreachable-network error — nothing surfaces.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let token = r.add_connector(factory(&log, false), ConnConfig::default()).unwrap();
        r.connect(token, addr).unwrap();
        r.cancel_connect(token);

        for _ in 0..10 {
            r.poll(PollMode::NonBlocking).unwrap();
        }
        let log = log.borrow();
        assert_eq!(log.connected, 0);
        assert!(log.connect_failed.is_empty());
        assert!(log.disconnected.is_empty());
    }

    #[test]
    fn test_second_connect_while_in_flight_fails_fast() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let token = r.add_connector(factory(&log, false), ConnConfig::default()).unwrap();
        r.connect(token, addr).unwrap();
        assert!(matches!(
            r.connect(token, addr),
            Err(NetError::AlreadyConnecting)
        ));
        // The first connect still lands.
        drive(&mut r, |_| log.borrow().connected == 1);
    }

    #[test]
    fn test_replace_existing_tears_down_previous_connection() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let config = AcceptorConfig {
            replace_existing: true,
            ..Default::default()
        };
        let (_acc, addr) = open_echo_server(&mut r, &log, config);

        let _first = TcpStream::connect(addr).unwrap();
        drive(&mut r, |_| log.borrow().connected == 1);
        let first_token = Token::from_id(log.borrow().ids[0]);

        let _second = TcpStream::connect(addr).unwrap();
        drive(&mut r, |_| log.borrow().connected == 2);

        // The harness connection was replaced: old one saw its terminal
        // notification, new one is live.
        drive(&mut r, |r| r.conn_state(first_token).is_none());
        assert_eq!(log.borrow().disconnected.as_slice(), &[false]);
    }

    #[test]
    fn test_close_acceptor_stops_accepting() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let (acc, addr) = open_echo_server(&mut r, &log, AcceptorConfig::default());

        r.close_acceptor(acc);
        drive(&mut r, |r| r.acceptor_addr(acc).is_none());

        // Kernel refuses once the listener fd is really closed.
        let refused = TcpStream::connect_timeout(&addr, Duration::from_millis(500));
        assert!(refused.is_err());
        assert_eq!(log.borrow().connected, 0);
    }

    #[test]
    fn test_reactor_drop_tears_down_live_connections() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let (_acc, addr) = open_echo_server(&mut r, &log, AcceptorConfig::default());

        let _peer = TcpStream::connect(addr).unwrap();
        drive(&mut r, |_| log.borrow().connected == 1);

        drop(r);
        assert_eq!(log.borrow().disconnected.as_slice(), &[false]);
    }

    #[test]
    fn test_shutdown_from_inside_hook_defers_terminal() {
        struct OneShot {
            log: Rc<RefCell<Log>>,
        }
        impl ConnectionEvents for OneShot {
            fn on_disconnected(&mut self, remote: bool) {
                self.log.borrow_mut().disconnected.push(remote);
            }
            fn on_new_data(&mut self, conn: &mut dyn ConnectionOps) {
                let n = conn.recv_data().len();
                self.log.borrow_mut().received.extend_from_slice(conn.recv_data());
                conn.consume_recv(n);
                // Teardown requested inside the hook must not re-enter.
                conn.shutdown(true);
                assert!(self.log.borrow().disconnected.is_empty());
            }
        }
        struct OneShotFactory {
            log: Rc<RefCell<Log>>,
        }
        impl ConnectionFactory for OneShotFactory {
            fn create_connection(&mut self) -> Option<Box<dyn ConnectionEvents>> {
                Some(Box::new(OneShot {
                    log: self.log.clone(),
                }))
            }
        }

        let log = Rc::new(RefCell::new(Log::default()));
        let mut r = reactor();
        let acc = r
            .add_acceptor(
                Box::new(OneShotFactory { log: log.clone() }),
                AcceptorConfig::default(),
            )
            .unwrap();
        r.open_acceptor(acc, "127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = r.acceptor_addr(acc).unwrap();

        let mut peer = TcpStream::connect(addr).unwrap();
        peer.write_all(b"bye").unwrap();
        drive(&mut r, |_| !log.borrow().disconnected.is_empty());

        assert_eq!(log.borrow().received, b"bye");
        assert_eq!(log.borrow().disconnected.as_slice(), &[false]);
    }
}
