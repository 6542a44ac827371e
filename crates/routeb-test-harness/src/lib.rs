//! routeb-test-harness: Deterministic testing support for routeb.
//!
//! Provides [`MockTransport`], a scripted [`Transport`](routeb_core::Transport)
//! implementation that lets the SK driver, session manager, and meter facade
//! be exercised without a Wi-SUN dongle or a smart meter on the desk.

pub mod mock_serial;

pub use mock_serial::{MockController, MockTransport};
