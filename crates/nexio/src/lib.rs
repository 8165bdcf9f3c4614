//! # nexio — embeddable reactor-driven TCP engine
//!
//! A single-threaded connection layer for building servers and clients
//! inside a host application. The host implements two small traits
//! (`ConnectionEvents`, `ConnectionFactory` from `nexio-core`), registers
//! acceptors and connectors with a [`Reactor`], and repeatedly calls
//! [`Reactor::poll`]; everything else — establishment, buffering,
//! backpressure, graceful and forced teardown — happens inside the poll
//! turns.
//!
//! ```ignore
//! let mut reactor = Reactor::new(ReactorConfig::default())?;
//! let acceptor = reactor.add_acceptor(Box::new(MyFactory), AcceptorConfig::default())?;
//! reactor.open_acceptor(acceptor, "0.0.0.0:9999".parse()?)?;
//! loop {
//!     reactor.poll(PollMode::Wait)?;
//! }
//! ```
//!
//! ## Layout
//!
//! - [`buf`] — the ring buffer family (`StraightBuffer`, `BipBuffer`).
//! - [`driver`] — native I/O submission/completion backends (io_uring,
//!   epoll fallback), selected by probe at startup.
//! - `registry` — slab of handler slots with generation-checked tokens;
//!   the liveness substrate completions are routed through.
//! - `reactor` / `acceptor` / `connector` / `conn` — the event loop and
//!   the three state machines.
//!
//! Bytes crossing a connection are opaque: no framing, no protocol, no
//! TLS. Backpressure is a return code, remote EOF and errors are hook
//! notifications, and `-ECANCELED` completions from deliberate teardown
//! are swallowed before the host ever sees them.

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("nexio requires Linux (io_uring or epoll backend)");
    }
}

pub mod buf;
pub mod driver;

mod acceptor;
mod conn;
mod connector;
mod op;
mod pool;
mod reactor;
mod registry;

pub use acceptor::AcceptorConfig;
pub use buf::{BipBuffer, StraightBuffer};
pub use conn::{ConnConfig, ConnState};
pub use driver::{Backend, PollMode};
pub use pool::ClassPool;
pub use reactor::{Reactor, ReactorConfig};
pub use registry::Token;

// The contract crate's surface, re-exported so a host needs one import.
pub use nexio_core::{
    BlockPool, ConnectionEvents, ConnectionFactory, ConnectionOps, NetError, PoolBlock, Reason,
    Result, RingBuffer,
};
