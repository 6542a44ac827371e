//! routeb-core: Core traits, types, and error definitions for routeb.
//!
//! This crate defines the layer-agnostic abstractions shared by the routeb
//! stack. Applications depend on these types without pulling in the serial
//! transport or the SK protocol driver.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel to the Wi-SUN module
//! - [`SessionEvent`] -- asynchronous PANA session state notifications
//! - [`PanDescriptor`] / [`SessionState`] / [`Credentials`] -- shared types
//! - [`Error`] / [`Result`] -- error handling

pub mod error;
pub mod events;
pub mod transport;
pub mod types;

// Re-export key types at crate root for ergonomic `use routeb_core::*`.
pub use error::{Error, Result, SkErrorCode};
pub use events::SessionEvent;
pub use transport::Transport;
pub use types::*;
