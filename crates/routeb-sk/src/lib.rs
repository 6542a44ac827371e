//! routeb-sk: SKSTACK protocol driver and Route-B session management.
//!
//! This crate drives a serial-attached Wi-SUN module speaking the AT-style
//! SKSTACK command set ("SK module"). It is organised in four layers:
//!
//! - [`protocol`] -- line/binary framing of the serial stream and
//!   classification of received lines
//! - [`commands`] -- SK command encoders and response parsers
//! - [`dispatcher`] -- the background reader task that serialises
//!   command/response exchanges and fans out unsolicited events
//! - [`module`] -- a typed one-method-per-command surface
//! - [`session`] -- PAN discovery, PANA join/rejoin, and the transmission
//!   gate
//!
//! Applications normally use the `routeb` facade crate instead of this one.

pub mod commands;
pub mod dispatcher;
pub mod module;
pub mod protocol;
pub mod session;

pub use dispatcher::{ResponseRule, SkDispatcher, SkIndication};
pub use module::{SkInfo, SkModule};
pub use protocol::{LineFramer, PayloadMode, RxUdp, SkFrame, SkLine};
pub use session::{SessionConfig, SessionManager};
