//! Ring buffer contract.
//!
//! Both directions of a connection's I/O go through a fixed-capacity ring
//! buffer. The contract is reserve/commit on the write side and
//! read/consume on the read side; contiguity is mandatory in both
//! directions, so a caller always works with one plain byte slice.
//!
//! # Implementors
//!
//! - `StraightBuffer` (engine crate): single contiguous region. When a
//!   requested write does not fit in the trailing free space it compacts
//!   (shifts the unread bytes to offset 0) and retries. Consumers see the
//!   entire unread region as one slice.
//!
//! - `BipBuffer` (engine crate): two-region wrap-around buffer. Never
//!   moves committed bytes, at the cost of the readable run stopping at
//!   the wrap boundary. Required where an in-flight native operation
//!   points into the committed region.
//!
//! **Contract:**
//! - `writable(want)` reserves and returns the largest contiguous writable
//!   run of at most `want` bytes — possibly empty when the buffer is full.
//!   A reservation that was never committed is discarded by the next
//!   `writable` call. The reservation never overlaps unread committed
//!   bytes.
//! - `commit(n)` publishes the first `n` bytes of the last reservation;
//!   `n` larger than the reservation is clamped to it.
//! - `readable()` returns only the oldest contiguous committed run; it
//!   never jumps a wrap boundary.
//! - `consume(n)` retires `n` bytes from the oldest end; `n` at or above
//!   the committed total collapses the buffer to empty.
//! - At every point `committed() == Σcommits − Σconsumes`, never negative,
//!   never above `capacity()`, and `free() == capacity() − committed()`.

pub trait RingBuffer {
    /// Reserve a contiguous writable run of at most `want` bytes.
    fn writable(&mut self, want: usize) -> &mut [u8];

    /// Publish the first `n` bytes of the last reservation (clamped).
    fn commit(&mut self, n: usize);

    /// The oldest contiguous committed run.
    fn readable(&self) -> &[u8];

    /// Retire `n` bytes from the oldest end (clamped to the committed total).
    fn consume(&mut self, n: usize);

    /// Total committed bytes across all regions.
    fn committed(&self) -> usize;

    /// Total free bytes across all regions.
    fn free(&self) -> usize;

    /// Fixed capacity in bytes. Never changes after construction.
    fn capacity(&self) -> usize;
}
