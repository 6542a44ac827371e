//! routeb-transport: Transport implementations for routeb.
//!
//! Currently a single implementation: [`SerialTransport`] for the USB
//! virtual COM port the SK module enumerates as. The session stack is
//! written against the [`Transport`](routeb_core::Transport) trait, so
//! tests substitute the mock from `routeb-test-harness` instead.

pub mod serial;

pub use serial::{SerialConfig, SerialTransport};
