//! NEXIO error types.

use std::fmt;

/// A platform reason code carried by failure notifications.
///
/// Holds the raw errno (positive). Completion results use the negative-errno
/// convention everywhere inside the engine; a `Reason` is the surfaced,
/// positive form handed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Reason(pub i32);

impl Reason {
    /// Build from a negative completion result.
    #[inline]
    pub fn from_result(result: i64) -> Self {
        Reason((-result) as i32)
    }

    /// The raw errno value.
    #[inline]
    pub fn errno(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            104 => "ECONNRESET",
            110 => "ETIMEDOUT",
            111 => "ECONNREFUSED",
            113 => "EHOSTUNREACH",
            101 => "ENETUNREACH",
            32 => "EPIPE",
            103 => "ECONNABORTED",
            _ => return write!(f, "errno {}", self.0),
        };
        write!(f, "{} (errno {})", name, self.0)
    }
}

#[derive(Debug)]
pub enum NetError {
    /// Requested write exceeds the out buffer's free space. Expected under
    /// load; nothing was committed.
    Backpressure,
    /// Operation attempted on a connection that is not in the Connected state.
    NotConnected,
    /// `open()` called on an acceptor that is already open (or still closing).
    AlreadyOpen,
    /// `connect()` called on a connector with a connect already in flight.
    AlreadyConnecting,
    /// The handler registry is full.
    AtCapacity,
    /// The token no longer names a live handler.
    Stale,
    /// The driver's submission queue is full.
    RingFull,
    /// Driver/backend setup failed.
    Setup(i32),
    /// OS error with errno.
    Os(i32),
    /// The requested backend is not available on this kernel.
    Unsupported,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backpressure => write!(f, "out buffer full"),
            Self::NotConnected => write!(f, "not connected"),
            Self::AlreadyOpen => write!(f, "acceptor already open"),
            Self::AlreadyConnecting => write!(f, "connect already in flight"),
            Self::AtCapacity => write!(f, "handler registry full"),
            Self::Stale => write!(f, "handler no longer registered"),
            Self::RingFull => write!(f, "submission queue full"),
            Self::Setup(e) => write!(f, "backend setup: errno {}", e),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
            Self::Unsupported => write!(f, "backend unsupported on this kernel"),
        }
    }
}

impl std::error::Error for NetError {}

pub type Result<T> = std::result::Result<T, NetError>;
