//! Multi-consumer zero-copy camera frame streaming.
//!
//! Captured frames are distributed through an event-driven stream fabric:
//! a producer maps frames onto packets from a shared pool and presents them;
//! a multicast fan-out delivers each packet to GPU and encoder consumers,
//! locally or across a process boundary; explicit fences order every access
//! to the shared buffers. The library provides:
//! - the stream fabric itself ([`fabric`]): setup protocol, packet ownership,
//!   mailbox/FIFO delivery, IPC bridges,
//! - buffer and sync attribute reconciliation ([`buffer`], [`sync`]),
//! - the endpoints ([`producer`], [`consumer`], [`pool`]),
//! - channel topologies and the per-block event loop ([`channel`]),
//! - the process [`master`] plus contracts for the external camera driver,
//!   compute runtime, encoder and IPC transport.

pub mod buffer;
pub mod channel;
pub mod client;
pub mod compute;
pub mod config;
pub mod consumer;
pub mod encode;
pub mod error;
pub mod fabric;
pub mod master;
pub mod pool;
pub mod producer;
pub mod source;
pub mod sync;
pub mod transport;

pub use channel::{Channel, ConsumerType};
pub use config::{AppType, PlatformCfg};
pub use error::{Result, StreamError};
pub use master::{Master, Profiler};
