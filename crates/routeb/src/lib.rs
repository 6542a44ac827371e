//! # routeb -- Route-B Smart Meter Access for Rust
//!
//! `routeb` is an asynchronous Rust library for reading Japanese
//! low-voltage smart electric energy meters over the Route-B service. It
//! drives a serial-attached Wi-SUN module (an SK module speaking the
//! AT-style SKSTACK command set), authenticates a PANA session against the
//! meter, and exchanges ECHONET Lite frames over UDP to expose a
//! meter-oriented API: instantaneous power and current, cumulative energy,
//! and the historical half-hour/one-minute series.
//!
//! ## Quick Start
//!
//! Add `routeb` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! routeb = "0.1"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Open a session and read the instantaneous power:
//!
//! ```no_run
//! use routeb::MeterBuilder;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let meter = MeterBuilder::new("<ROUTE-B ID>", "<PASSWORD>")
//!         .device("/dev/ttyUSB0")
//!         .build()
//!         .await?;
//!
//!     println!("power: {} W", meter.get_instantaneous_power().await?);
//!
//!     meter.close().await;
//!     Ok(())
//! }
//! ```
//!
//! Opening can take minutes: the module scans for the meter's PAN with an
//! escalating dwell time and then performs PANA authentication.
//!
//! ## Architecture
//!
//! The library is organised as a workspace of focused crates:
//!
//! | Crate                 | Purpose                                         |
//! |-----------------------|-------------------------------------------------|
//! | `routeb-core`         | [`Transport`] trait, shared types, [`Error`]    |
//! | `routeb-transport`    | Serial transport (tokio-serial)                 |
//! | `routeb-sk`           | SKSTACK framing, dispatcher, session manager    |
//! | `routeb-echonet`      | ECHONET Lite codec, property codecs, TID client |
//! | `routeb-test-harness` | Scripted mock transport for tests               |
//! | **`routeb`**          | This facade crate -- [`Meter`] + re-exports     |
//!
//! ## Sessions and the transmission gate
//!
//! The meter periodically re-authenticates the PANA session and may
//! signal transmission restrictions. Both gate outbound traffic: calls
//! block until the session is usable again, bounded by the configured
//! response timeout, and fail with [`Error::NeedToReopen`] once the
//! session is beyond recovery. Subscribe to [`SessionEvent`]s via
//! [`Meter::subscribe`] to observe these cycles.
//!
//! ## Logging
//!
//! All crates log through [`tracing`]. Three targets carry the story:
//! `routeb_sk` (wire traffic at TRACE), `routeb_sk::session` (lifecycle),
//! and `routeb_echonet` (frames and requests). No personal data beyond
//! the Route-B ID is ever logged.
//!
//! ## Errors
//!
//! | Error | Meaning | Recovery |
//! |---|---|---|
//! | [`Error::ScanFailure`] | no PAN found after escalation | retry, move the dongle |
//! | [`Error::JoinFailure`] | PANA rejected or timed out | check credentials, retry |
//! | [`Error::NeedToReopen`] | session lost / serial stall / deadline | close and reopen |
//! | [`Error::ResponseNotPossible`] | meter rejected EPCs in an aggregate | reissue without them |

pub use routeb_core::*;

/// SKSTACK protocol driver: framing, dispatcher, typed commands, session
/// management.
pub mod sk {
    pub use routeb_sk::*;
}

/// ECHONET Lite layer: frame codec, per-EPC property codecs, TID client.
pub mod echonet {
    pub use routeb_echonet::*;
}

/// Transport implementations (serial).
pub mod transport {
    pub use routeb_transport::*;
}

mod builder;
mod meter;

pub use builder::MeterBuilder;
pub use meter::{EnergyDirection, FixedTimeEnergy, IntervalEnergy, Meter, TimestampedEnergy};
pub use routeb_echonet::frame::Property;
pub use routeb_echonet::properties::{HistoryTimeSetting, InstantaneousCurrent};
