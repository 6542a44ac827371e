//! Transport trait for Wi-SUN module communication.
//!
//! The [`Transport`] trait abstracts over the physical link to the SK
//! module. Implementations exist for serial ports (the normal case) and
//! mock transports for testing.
//!
//! The SK protocol driver in `routeb-sk` operates on a `Transport` rather
//! than directly on a serial port, enabling both real hardware control and
//! deterministic unit testing with `MockTransport` from the
//! `routeb-test-harness` crate.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to the SK module.
///
/// Implementations handle buffering and error recovery at the physical
/// layer. Protocol-level concerns (line framing, command/response
/// matching, binary payload runs) are handled by the SK driver that
/// consumes this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the module.
    ///
    /// Implementations should block until all bytes have been written to
    /// the underlying transport (serial TX buffer).
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the module into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if no data is received within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
