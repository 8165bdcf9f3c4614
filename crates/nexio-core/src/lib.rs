//! # nexio-core — Contract definitions for NEXIO
//!
//! This crate defines the outward-facing boundaries of the NEXIO TCP
//! engine. It holds no I/O code of its own: the engine crate depends on
//! these contracts, and so does the host application that embeds it.
//!
//! ## Design principle
//!
//! > "Program to the interface. The engine owns the sockets; the host
//! >  owns the protocol."
//!
//! The host never subclasses anything. It implements two small capability
//! traits (`ConnectionEvents`, `ConnectionFactory`) and hands them to the
//! engine by value. Everything else — buffers, pools, errors, logging —
//! is a plain data contract.

pub mod buffer;
pub mod error;
pub mod events;
pub mod log;
pub mod pool;

pub use buffer::RingBuffer;
pub use error::{NetError, Reason, Result};
pub use events::{ConnectionEvents, ConnectionFactory, ConnectionOps};
pub use pool::{BlockPool, PoolBlock};
