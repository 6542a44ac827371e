//! routeb-echonet: ECHONET Lite over Route B.
//!
//! Everything between the session manager and the meter facade:
//!
//! - [`frame`] -- the ECHONET Lite frame codec (EHD/TID/EOJ/ESV/properties)
//! - [`properties`] -- per-EPC encoders and decoders for the low-voltage
//!   smart meter class
//! - [`client`] -- request/response correlation over the session's UDP
//!   transport, keyed by transaction id

pub mod client;
pub mod frame;
pub mod properties;

pub use client::EchonetClient;
pub use frame::{EchonetFrame, Eoj, Esv, Property};
