//! Outward capability traits.
//!
//! The engine calls the host through two small traits instead of a
//! subclass hierarchy: `ConnectionEvents` is the per-connection
//! notification sink, `ConnectionFactory` hands those sinks out (and takes
//! them back) on behalf of an acceptor or connector.
//!
//! Notification guarantees (the engine enforces these, the host relies on
//! them):
//! - `on_connected` fires at most once per connection, after the native
//!   stream is registered for read events.
//! - `on_disconnected` fires exactly once per connection lifetime, no
//!   matter which teardown path ran first (local shutdown, remote EOF,
//!   I/O error). `remote` is true only for the remote-EOF path.
//! - `on_error` fires before the forced teardown it triggers.
//! - No hook is ever re-entered: a teardown requested inside a hook is
//!   delivered after that hook returns.
//!
//! No framing is imposed: `on_new_data` only signals that the readable
//! prefix grew. The host pops exactly the bytes it has fully consumed.

use crate::error::{Reason, Result};

/// Operations a notification hook may perform on its own connection.
///
/// Implemented by the engine's callback context; hooks receive it as
/// `&mut dyn ConnectionOps` so this crate stays free of engine types.
pub trait ConnectionOps {
    /// Opaque engine handle for this connection, stable for its lifetime.
    /// A host that wants to address the connection outside a hook (through
    /// the engine's token-based entry points) stashes this.
    fn conn_id(&self) -> u64;

    /// Append `data` to the out buffer and ensure a native send is in
    /// flight. All-or-nothing: if `data` does not fit in one contiguous
    /// free run, nothing is committed and `Backpressure` is returned.
    /// Returns the number of bytes accepted (always `data.len()` on
    /// success). The bytes are copied; the caller's slice may be reused
    /// immediately.
    fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// The contiguous readable prefix of the in buffer.
    fn recv_data(&self) -> &[u8];

    /// Retire `n` fully-consumed bytes from the front of the in buffer.
    fn consume_recv(&mut self, n: usize);

    /// Begin teardown. `now` discards pending output; otherwise pending
    /// output is flushed first (graceful shutdown).
    fn shutdown(&mut self, now: bool);

    /// Bytes currently committed in the out buffer.
    fn out_committed(&self) -> usize;

    /// Free bytes in the out buffer (backpressure headroom).
    fn out_free(&self) -> usize;
}

/// Per-connection notification hooks, implemented by the host.
pub trait ConnectionEvents {
    /// The connection is established and registered for read events.
    fn on_connected(&mut self, _conn: &mut dyn ConnectionOps) {}

    /// Terminal notification; fires exactly once. `remote` is true when
    /// the peer's EOF initiated the teardown.
    fn on_disconnected(&mut self, remote: bool);

    /// The readable prefix of the in buffer grew.
    fn on_new_data(&mut self, conn: &mut dyn ConnectionOps);

    /// A native send retired `bytes` from the out buffer.
    fn on_some_data_sent(&mut self, _conn: &mut dyn ConnectionOps, _bytes: usize) {}

    /// A genuine I/O error on the established stream. Forced teardown
    /// (and the terminal notification) follows.
    fn on_error(&mut self, _reason: Reason) {}
}

/// Hands out (and takes back) `ConnectionEvents` sinks for an acceptor or
/// connector.
pub trait ConnectionFactory {
    /// Produce the events sink for a connection about to be activated.
    /// Returning `None` declines the connection; the engine drops the
    /// native stream.
    fn create_connection(&mut self) -> Option<Box<dyn ConnectionEvents>>;

    /// An active open failed (connector only). Deliberate cancellation is
    /// swallowed by the engine and never reported here.
    fn connect_failed(&mut self, _reason: Reason) {}

    /// Release a sink previously produced by `create_connection`. The
    /// default just drops it.
    fn destroy_connection(&mut self, events: Box<dyn ConnectionEvents>) {
        drop(events);
    }
}
