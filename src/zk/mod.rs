//! ZKTeco binary protocol client (port 4370).
//!
//! Speaks the proprietary time-clock protocol over TCP (length-prefixed
//! frames) or UDP (one frame per datagram): authenticated handshake,
//! request/response exchanges, buffered multi-chunk table downloads, and
//! the live-capture push stream of punches.
//!
//! # Example
//!
//! ```ignore
//! use zk_collector::zk::{ZkClient, ZkOptions};
//!
//! let mut client = ZkClient::new(ZkOptions {
//!     ip: "192.168.1.201".into(),
//!     ..Default::default()
//! });
//! client.connect().await?;
//! let records = client.get_attendance().await?;
//! client.disconnect().await;
//! ```

mod client;
mod codec;
pub mod consts;
mod error;
mod records;
mod transport;

#[cfg(test)]
mod tests;

pub use client::{CaptureGuard, LiveEvent, ZkClient, ZkOptions};
pub use consts::DEFAULT_PORT;
pub use error::{Result, ZkError};
pub use records::{Attendance, DeviceSizes, User};
