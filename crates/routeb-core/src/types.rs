//! Core types used throughout routeb.
//!
//! These types are shared between the SK protocol driver, the session
//! manager, and the meter facade.

use std::fmt;

/// Route-B credentials issued by the utility: a 32-character Route-B ID
/// and the matching password.
///
/// The `Debug` implementation redacts the password; the Route-B ID is the
/// only credential routeb ever logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Route-B authentication ID (32 ASCII characters).
    pub rbid: String,
    /// Route-B password (up to 32 ASCII characters).
    pub password: String,
}

impl Credentials {
    /// Create credentials from a Route-B ID and password.
    pub fn new(rbid: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            rbid: rbid.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("rbid", &self.rbid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A PAN discovered by an active scan, assembled from an `EPANDESC` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanDescriptor {
    /// Logical channel number (0x21..=0x3C for Wi-SUN 920 MHz).
    pub channel: u8,
    /// PAN identifier.
    pub pan_id: u16,
    /// 64-bit MAC address of the meter-side coordinator.
    pub mac_addr: u64,
    /// Link quality indicator of the received beacon.
    pub lqi: u8,
    /// Pairing ID advertised in the beacon (last 8 digits of the Route-B ID).
    pub pair_id: String,
}

impl PanDescriptor {
    /// Estimated received signal strength in dBm, derived from the LQI.
    pub fn rssi_dbm(&self) -> f64 {
        0.275 * f64::from(self.lqi) - 104.27
    }

    /// MAC address as 16 uppercase hex digits, the format `SKLL64` expects.
    pub fn mac_hex(&self) -> String {
        format!("{:016X}", self.mac_addr)
    }
}

/// Lifecycle state of a Route-B session.
///
/// ```text
/// Closed -> Scanning -> Joining -> Joined <-> Rejoining
///                          |          |
///                          +---fail---+--> Failed (reopen required)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; the serial device may not even be open.
    Closed,
    /// Active scan in progress, hunting for the meter's PAN.
    Scanning,
    /// PANA authentication in progress.
    Joining,
    /// Session established; transmission admitted subject to the gate.
    Joined,
    /// Re-authentication in progress; transmission gated until complete.
    Rejoining,
    /// Unrecoverable. Only a fresh open on a new instance leaves this state.
    Failed,
}

impl SessionState {
    /// Whether ECHONET traffic may be attempted in this state (subject to
    /// the transmission gate).
    pub fn is_established(&self) -> bool {
        matches!(self, SessionState::Joined | SessionState::Rejoining)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Closed => "closed",
            SessionState::Scanning => "scanning",
            SessionState::Joining => "joining",
            SessionState::Joined => "joined",
            SessionState::Rejoining => "rejoining",
            SessionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_redacts_password() {
        let c = Credentials::new("00112233445566778899AABBCCDDEEFF", "SECRETPW1234");
        let dbg = format!("{c:?}");
        assert!(dbg.contains("00112233445566778899AABBCCDDEEFF"));
        assert!(!dbg.contains("SECRETPW1234"));
    }

    #[test]
    fn pan_descriptor_mac_hex() {
        let pan = PanDescriptor {
            channel: 0x21,
            pan_id: 0x8888,
            mac_addr: 0x001D_1291_0000_0001,
            lqi: 0xE1,
            pair_id: "01234567".into(),
        };
        assert_eq!(pan.mac_hex(), "001D129100000001");
    }

    #[test]
    fn pan_descriptor_rssi() {
        let pan = PanDescriptor {
            channel: 0x21,
            pan_id: 0x8888,
            mac_addr: 1,
            lqi: 0,
            pair_id: String::new(),
        };
        assert!((pan.rssi_dbm() - (-104.27)).abs() < 1e-9);
    }

    #[test]
    fn session_state_display() {
        assert_eq!(SessionState::Joined.to_string(), "joined");
        assert_eq!(SessionState::Rejoining.to_string(), "rejoining");
    }

    #[test]
    fn session_state_established() {
        assert!(SessionState::Joined.is_established());
        assert!(SessionState::Rejoining.is_established());
        assert!(!SessionState::Closed.is_established());
        assert!(!SessionState::Failed.is_established());
    }
}
