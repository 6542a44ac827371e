//! MeterBuilder -- fluent builder for opening a [`Meter`] connection.
//!
//! Separates configuration (serial device, credentials, timeouts) from
//! the open sequence itself, which can take a couple of minutes when the
//! scan has to escalate.
//!
//! # Example
//!
//! ```no_run
//! use routeb::MeterBuilder;
//!
//! # async fn example() -> routeb::Result<()> {
//! let meter = MeterBuilder::new("00112233445566778899AABBCCDDEEFF", "MYPASSWORD12")
//!     .device("/dev/ttyUSB0")
//!     .build()
//!     .await?;
//!
//! println!("power: {} W", meter.get_instantaneous_power().await?);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use routeb_core::error::{Error, Result};
use routeb_core::transport::Transport;
use routeb_core::types::Credentials;
use routeb_sk::session::{SessionConfig, SessionManager};
use routeb_transport::SerialTransport;

use crate::meter::Meter;

/// Fluent builder for [`Meter`].
pub struct MeterBuilder {
    credentials: Credentials,
    device: Option<String>,
    baud_rate: u32,
    reset_dev: bool,
    scan_attempts: u32,
    join_timeout: Duration,
    command_timeout: Duration,
    response_timeout: Duration,
}

impl MeterBuilder {
    /// Create a builder with the Route-B ID and password issued by the
    /// utility.
    pub fn new(rbid: impl Into<String>, password: impl Into<String>) -> Self {
        MeterBuilder {
            credentials: Credentials::new(rbid, password),
            device: None,
            baud_rate: 115_200,
            reset_dev: true,
            scan_attempts: 3,
            join_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(20),
        }
    }

    /// Set the serial device path (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn device(mut self, path: &str) -> Self {
        self.device = Some(path.to_string());
        self
    }

    /// Override the default 115200 baud rate.
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    /// Control whether `SKRESET` is issued during open (default: true).
    pub fn reset_dev(mut self, reset: bool) -> Self {
        self.reset_dev = reset;
        self
    }

    /// Set the number of scan passes before giving up (default: 3).
    pub fn scan_attempts(mut self, attempts: u32) -> Self {
        self.scan_attempts = attempts;
        self
    }

    /// Set the PANA authentication timeout (default: 60 s).
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the timeout for simple SK commands (default: 10 s).
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the per-operation deadline for meter exchanges (default: 20 s).
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Open a session over a caller-provided transport.
    ///
    /// This is the entry point for testing (pass a `MockTransport` from
    /// `routeb-test-harness`) and for exotic links the serial transport
    /// does not cover.
    pub async fn build_with_transport(self, transport: Box<dyn Transport>) -> Result<Meter> {
        let mut config = SessionConfig::new(self.credentials);
        config.reset_dev = self.reset_dev;
        config.scan_attempts = self.scan_attempts;
        config.join_timeout = self.join_timeout;
        config.command_timeout = self.command_timeout;

        let session = SessionManager::open(transport, config).await?;
        Ok(Meter::new(session, self.response_timeout))
    }

    /// Open a session over the configured serial device.
    pub async fn build(self) -> Result<Meter> {
        let device = self.device.clone().ok_or_else(|| {
            Error::InvalidParameter("device path is required for build()".into())
        })?;
        let transport = SerialTransport::open(&device, self.baud_rate).await?;
        self.build_with_transport(Box::new(transport)).await
    }
}
