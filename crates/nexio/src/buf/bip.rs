//! `BipBuffer` — two-region wrap-around ring buffer.
//!
//! Region A holds the oldest committed bytes; region B holds bytes
//! committed after wrapping past the end of the capacity. Committed bytes
//! never move, so a pointer into the readable run stays valid across
//! commits — the property the out-buffer needs while a native send is in
//! flight against it.
//!
//! Reservation rules:
//! 1. While B exists, new data only ever grows B; the usable space is the
//!    gap between B's end and A's start.
//! 2. Otherwise the space after A is preferred; if it is too small and the
//!    space before A is larger, the reservation moves there and starts B.
//! 3. Contiguity is mandatory: when neither side fits the full request the
//!    larger side is returned as-is, never a merge of both.
//!
//! Consuming drains A front-to-back; the moment A is exactly (or over-)
//! consumed, B is promoted to become the new A. The promotion is the
//! load-bearing step — every invariant test below crosses it.

use nexio_core::RingBuffer;

pub struct BipBuffer {
    data: Box<[u8]>,
    /// Offset of region A (oldest committed bytes).
    a_start: usize,
    a_len: usize,
    /// Region B always starts at offset 0; empty when `b_len == 0`.
    /// Invariant: `b_len > 0` implies `a_len > 0` and `b_len <= a_start`.
    b_len: usize,
    /// Outstanding reservation, discarded by the next `writable`.
    reserve_off: usize,
    reserve_len: usize,
}

impl BipBuffer {
    /// Allocate a buffer with a fixed `capacity`. The capacity never
    /// changes afterwards.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "BipBuffer: zero capacity");
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            a_start: 0,
            a_len: 0,
            b_len: 0,
            reserve_off: 0,
            reserve_len: 0,
        }
    }
}

impl RingBuffer for BipBuffer {
    fn writable(&mut self, want: usize) -> &mut [u8] {
        self.reserve_len = 0;

        let cap = self.data.len();
        let (off, run) = if self.b_len > 0 {
            // Rule 1: only B grows while both regions exist.
            (self.b_len, want.min(self.a_start - self.b_len))
        } else {
            let tail_off = self.a_start + self.a_len;
            let tail = cap - tail_off;
            let head = self.a_start;
            if tail >= want {
                (tail_off, want)
            } else if head > tail {
                // Rule 2: the space before A is larger — start region B.
                (0, want.min(head))
            } else {
                // Rule 3: largest side, never a merge.
                (tail_off, tail)
            }
        };

        self.reserve_off = off;
        self.reserve_len = run;
        &mut self.data[off..off + run]
    }

    fn commit(&mut self, n: usize) {
        let n = n.min(self.reserve_len);
        if n > 0 {
            if self.b_len == 0 && self.reserve_off == self.a_start + self.a_len {
                self.a_len += n;
            } else {
                debug_assert_eq!(self.reserve_off, self.b_len);
                self.b_len += n;
            }
        }
        self.reserve_len = 0;
    }

    fn readable(&self) -> &[u8] {
        &self.data[self.a_start..self.a_start + self.a_len]
    }

    fn consume(&mut self, n: usize) {
        self.reserve_len = 0;

        let mut n = n.min(self.a_len + self.b_len);
        while n > 0 {
            let m = n.min(self.a_len);
            self.a_start += m;
            self.a_len -= m;
            n -= m;
            if self.a_len == 0 {
                // Promotion: B becomes the new A.
                self.a_start = 0;
                self.a_len = self.b_len;
                self.b_len = 0;
                if self.a_len == 0 {
                    break;
                }
            }
        }
        if self.a_len == 0 {
            self.a_start = 0;
        }
    }

    #[inline]
    fn committed(&self) -> usize {
        self.a_len + self.b_len
    }

    #[inline]
    fn free(&self) -> usize {
        self.data.len() - self.committed()
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.data.len()
    }
}
