//! Asynchronous session event types.
//!
//! Events are emitted by the session manager through a
//! [`tokio::sync::broadcast`] channel when the PANA session or the
//! transmission gate changes state. Long-running collectors subscribe to
//! these to observe re-authentication cycles and restriction windows
//! without polling.

/// An event emitted when the Route-B session state changes.
///
/// Delivered on a best-effort basis through a bounded broadcast channel;
/// slow consumers may miss events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// PANA authentication completed and the session is usable.
    Joined,

    /// The meter started re-authenticating the session; transmission is
    /// gated until it completes.
    ReauthStarted,

    /// Re-authentication finished; transmission is admitted again.
    ReauthCompleted,

    /// The PANA session lifetime expired; an active rejoin is underway.
    SessionExpired,

    /// The module signalled a transmission restriction (`EVENT 32`).
    TransmissionRestricted,

    /// The transmission restriction was lifted (`EVENT 33`).
    TransmissionReleased,

    /// The session was terminated (locally via close, or by the meter).
    Terminated,

    /// The session failed unrecoverably; a reopen is required.
    Failed,
}
