//! Error types for routeb.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, SK-command, session,
//! and ECHONET Lite errors are all captured here.

use std::fmt;

/// Error classes reported by the SK module in `FAIL ERxx` response lines.
///
/// The two-digit decimal code follows the `FAIL ER` token. Codes outside
/// the documented set are preserved in [`SkErrorCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkErrorCode {
    /// ER04: the command is not supported by this firmware build.
    Unsupported,
    /// ER05: an argument count or value was out of range.
    InvalidArgument,
    /// ER06: the command line could not be parsed.
    InvalidSyntax,
    /// ER09: UART input error (framing/overrun on the module side).
    SerialInput,
    /// ER10: the command was accepted but failed to execute.
    FailedToExecute,
    /// ER01-03, ER07-08, and anything undocumented.
    Unknown(u8),
}

impl SkErrorCode {
    /// Map a raw `ERxx` code to its class.
    pub fn from_code(code: u8) -> Self {
        match code {
            4 => SkErrorCode::Unsupported,
            5 => SkErrorCode::InvalidArgument,
            6 => SkErrorCode::InvalidSyntax,
            9 => SkErrorCode::SerialInput,
            10 => SkErrorCode::FailedToExecute,
            n => SkErrorCode::Unknown(n),
        }
    }

    /// The raw numeric code as reported by the module.
    pub fn code(&self) -> u8 {
        match self {
            SkErrorCode::Unsupported => 4,
            SkErrorCode::InvalidArgument => 5,
            SkErrorCode::InvalidSyntax => 6,
            SkErrorCode::SerialInput => 9,
            SkErrorCode::FailedToExecute => 10,
            SkErrorCode::Unknown(n) => *n,
        }
    }
}

impl fmt::Display for SkErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkErrorCode::Unsupported => write!(f, "ER04 (unsupported command)"),
            SkErrorCode::InvalidArgument => write!(f, "ER05 (invalid argument)"),
            SkErrorCode::InvalidSyntax => write!(f, "ER06 (invalid syntax)"),
            SkErrorCode::SerialInput => write!(f, "ER09 (serial input error)"),
            SkErrorCode::FailedToExecute => write!(f, "ER10 (failed to execute)"),
            SkErrorCode::Unknown(n) => write!(f, "ER{n:02} (unknown error)"),
        }
    }
}

/// The error type for all routeb operations.
///
/// Variants cover the full range of failure modes encountered when talking
/// to a smart meter over Route B: physical transport failures, SK command
/// rejections, session lifecycle failures, and meter-side ECHONET Lite
/// rejections.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port open/read/write).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed SK line, unparsable ECHONET frame).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Timed out waiting for a response from the SK module or the meter.
    #[error("timeout waiting for response")]
    Timeout,

    /// An invalid parameter was passed to an operation. Raised before any
    /// I/O takes place.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No session is open, or the transport has been released.
    #[error("not connected")]
    NotConnected,

    /// The SK module answered a command with `FAIL ERxx`.
    #[error("SK command failed: {0}")]
    CommandFailed(SkErrorCode),

    /// No PAN was discovered after the full scan escalation ladder.
    ///
    /// Usually means the device is out of radio range of the meter or the
    /// Route-B ID is not provisioned for it. Retrying at a different
    /// location is reasonable.
    #[error("no PAN found: {0}")]
    ScanFailure(String),

    /// PANA authentication was rejected or timed out.
    ///
    /// Usually a credential problem; retrying with corrected Route-B ID and
    /// password is reasonable.
    #[error("could not establish a PANA session: {0}")]
    JoinFailure(String),

    /// The session is unrecoverable: the PANA session was lost, the serial
    /// link stalled, or a deadline elapsed while transmission was gated.
    /// Close the client and open a fresh one.
    #[error("session lost, reopen required: {0}")]
    NeedToReopen(String),

    /// The meter answered a Get/Set aggregate with a "not possible"
    /// service code. `epcs` names the properties the meter rejected.
    #[error("the meter could not serve the request (EPCs {epcs:02X?})")]
    ResponseNotPossible {
        /// Property codes the meter returned with empty property data.
        epcs: Vec<u8>,
    },

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("port busy".into());
        assert_eq!(e.to_string(), "transport error: port busy");
    }

    #[test]
    fn error_display_timeout() {
        let e = Error::Timeout;
        assert_eq!(e.to_string(), "timeout waiting for response");
    }

    #[test]
    fn error_display_command_failed() {
        let e = Error::CommandFailed(SkErrorCode::Unsupported);
        assert_eq!(e.to_string(), "SK command failed: ER04 (unsupported command)");
    }

    #[test]
    fn error_display_response_not_possible() {
        let e = Error::ResponseNotPossible { epcs: vec![0x7F] };
        assert!(e.to_string().contains("7F"));
    }

    #[test]
    fn sk_error_code_round_trip() {
        for code in [1u8, 4, 5, 6, 9, 10, 42] {
            assert_eq!(SkErrorCode::from_code(code).code(), code);
        }
    }

    #[test]
    fn sk_error_code_classes() {
        assert_eq!(SkErrorCode::from_code(4), SkErrorCode::Unsupported);
        assert_eq!(SkErrorCode::from_code(5), SkErrorCode::InvalidArgument);
        assert_eq!(SkErrorCode::from_code(6), SkErrorCode::InvalidSyntax);
        assert_eq!(SkErrorCode::from_code(9), SkErrorCode::SerialInput);
        assert_eq!(SkErrorCode::from_code(10), SkErrorCode::FailedToExecute);
        assert_eq!(SkErrorCode::from_code(7), SkErrorCode::Unknown(7));
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn error_implements_std_error() {
        fn assert_std_error<T: std::error::Error>() {}
        assert_std_error::<Error>();
    }
}
