//! SKSTACK line framing and classification.
//!
//! The SK module mixes CRLF-terminated ASCII lines with, in BINARY payload
//! mode, raw byte runs carrying received UDP data. The framer below keeps a
//! pending-binary counter: after an `ERXUDP` header line is parsed in
//! binary mode, exactly the announced number of bytes is consumed as one
//! opaque payload frame and is never CRLF-scanned. In ASCII payload mode
//! (`WOPT 01`, the mode this library selects) the payload rides inline in
//! the header line as uppercase hex and no binary run follows.
//!
//! # Line grammar
//!
//! Responses are `OK [args]`, `FAIL ERxx`, or event lines beginning with
//! `EVENT`, `EPANDESC`, `ERXUDP`, `EVER`, `EINFO`. `EPANDESC` announces a
//! block of indented `Key:Value` lines. The `ERXUDP` layout (with the RSSI
//! register `SA2` set to 1, which the session manager always does):
//!
//! ```text
//! ERXUDP <SENDER> <DEST> <RPORT> <LPORT> <SENDERLLA> <LQI> <SECURED> <SIDE> <DATALEN> [<DATA>]
//! ```
//!
//! `<DATA>` is present in ASCII mode only; in binary mode `<DATALEN>` raw
//! bytes follow the terminated header line.

use routeb_core::error::SkErrorCode;

/// Payload representation the module uses for `ERXUDP`.
///
/// Reported by `ROPT`, selected with `WOPT`. The library actively selects
/// [`PayloadMode::Ascii`]; binary framing is still supported because `ROPT`
/// itself is unsupported on some firmware builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// UDP payloads are delivered inline as uppercase hex (`WOPT 01`).
    Ascii,
    /// UDP payloads follow the `ERXUDP` header line as raw bytes (`WOPT 00`).
    Binary,
}

/// One decoded unit from the serial stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkFrame {
    /// A complete line, CRLF stripped.
    Line(String),
    /// A binary payload run announced by the preceding `ERXUDP` line.
    Payload(Vec<u8>),
}

/// Incremental framer over the raw serial byte stream.
///
/// Feed bytes with [`extend`](LineFramer::extend) as they arrive, then
/// drain complete frames with [`next_frame`](LineFramer::next_frame).
/// While the pending-binary counter is non-zero the framer never attempts
/// CRLF splitting.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    pending_binary: usize,
    mode: PayloadMode,
}

impl LineFramer {
    /// Create a framer for the given payload mode.
    pub fn new(mode: PayloadMode) -> Self {
        LineFramer {
            buf: Vec::new(),
            pending_binary: 0,
            mode,
        }
    }

    /// Switch payload modes. Takes effect for subsequently parsed lines.
    pub fn set_mode(&mut self, mode: PayloadMode) {
        self.mode = mode;
    }

    /// The currently configured payload mode.
    pub fn mode(&self) -> PayloadMode {
        self.mode
    }

    /// Append received bytes to the framing buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<SkFrame> {
        if self.pending_binary > 0 {
            if self.buf.len() < self.pending_binary {
                return None;
            }
            let payload: Vec<u8> = self.buf.drain(..self.pending_binary).collect();
            self.pending_binary = 0;
            return Some(SkFrame::Payload(payload));
        }

        let pos = self
            .buf
            .windows(2)
            .position(|w| w == b"\r\n")?;
        let line = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
        self.buf.drain(..pos + 2);

        if self.mode == PayloadMode::Binary {
            if let Some(len) = erxudp_binary_len(&line) {
                self.pending_binary = len;
            }
        }

        Some(SkFrame::Line(line))
    }
}

/// For an `ERXUDP` header line in binary mode, the announced payload
/// length (last whitespace-separated field, hex).
fn erxudp_binary_len(line: &str) -> Option<usize> {
    if !line.starts_with("ERXUDP ") {
        return None;
    }
    let last = line.split_ascii_whitespace().last()?;
    usize::from_str_radix(last, 16).ok()
}

/// A received UDP datagram, parsed from an `ERXUDP` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxUdp {
    /// Source IPv6 address, as printed by the module.
    pub sender: String,
    /// Destination IPv6 address.
    pub dest: String,
    /// Source UDP port.
    pub rport: u16,
    /// Destination UDP port.
    pub lport: u16,
    /// Source link-layer (MAC) address, 16 hex digits.
    pub sender_lla: String,
    /// Link quality indicator of the reception.
    pub lqi: u8,
    /// Whether the datagram was secured at the MAC layer.
    pub secured: u8,
    /// Wi-SUN side (0 = Route B).
    pub side: u8,
    /// Announced payload length in bytes.
    pub data_len: u16,
    /// Payload bytes. Decoded from inline hex in ASCII mode; attached from
    /// the following binary run in binary mode (empty until then).
    pub data: Vec<u8>,
}

/// A classified line from the SK module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkLine {
    /// `OK`, with anything after the token (e.g. `01` from `ROPT`).
    Ok(String),
    /// `FAIL ERxx`.
    Fail(SkErrorCode),
    /// `EVENT <code> <sender> [<param>]`.
    Event {
        /// Event number (hex in the line; e.g. 0x25 for PANA success).
        code: u8,
        /// Source IPv6 address.
        sender: String,
        /// Optional parameter (e.g. the UDP transmission result).
        param: Option<u8>,
    },
    /// The `EPANDESC` block header; `Key:Value` lines follow.
    EPanDescHeader,
    /// An indented `Key:Value` line inside an `EPANDESC` block.
    PanField {
        key: String,
        value: String,
    },
    /// A received UDP datagram header.
    RxUdp(RxUdp),
    /// Anything else: command echoback, `EVER`/`EINFO` data lines, the
    /// IPv6 line answering `SKLL64`, etc.
    Text(String),
}

/// Classify one complete line.
///
/// Never fails: anything that does not parse as a known response or event
/// is returned as [`SkLine::Text`] so callers can still log or match it.
pub fn classify(line: &str) -> SkLine {
    // EPANDESC block fields arrive indented.
    if line.starts_with("  ") {
        if let Some((key, value)) = line.trim_start().split_once(':') {
            return SkLine::PanField {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            };
        }
    }

    let mut tokens = line.split_ascii_whitespace();
    match tokens.next() {
        Some("OK") => SkLine::Ok(tokens.collect::<Vec<_>>().join(" ")),
        Some("FAIL") => {
            let code = tokens
                .next()
                .and_then(|t| t.strip_prefix("ER"))
                .and_then(|n| n.parse::<u8>().ok())
                .unwrap_or(0);
            SkLine::Fail(SkErrorCode::from_code(code))
        }
        Some("EVENT") => {
            let code = tokens.next().and_then(from_hex_u8);
            let sender = tokens.next().unwrap_or_default().to_string();
            let param = tokens.next().and_then(from_hex_u8);
            match code {
                Some(code) => SkLine::Event {
                    code,
                    sender,
                    param,
                },
                None => SkLine::Text(line.to_string()),
            }
        }
        Some("EPANDESC") => SkLine::EPanDescHeader,
        Some("ERXUDP") => match parse_erxudp(line) {
            Some(rx) => SkLine::RxUdp(rx),
            None => SkLine::Text(line.to_string()),
        },
        _ => SkLine::Text(line.to_string()),
    }
}

fn parse_erxudp(line: &str) -> Option<RxUdp> {
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    if tokens.len() < 10 {
        return None;
    }
    let data_len = from_hex_u16(tokens[9])?;
    let data = if let Some(hex) = tokens.get(10) {
        decode_hex(hex)?
    } else {
        Vec::new()
    };
    Some(RxUdp {
        sender: tokens[1].to_string(),
        dest: tokens[2].to_string(),
        rport: from_hex_u16(tokens[3])?,
        lport: from_hex_u16(tokens[4])?,
        sender_lla: tokens[5].to_string(),
        lqi: from_hex_u8(tokens[6])?,
        secured: from_hex_u8(tokens[7])?,
        side: from_hex_u8(tokens[8])?,
        data_len,
        data,
    })
}

/// Parse a hex token into a `u8`.
pub fn from_hex_u8(token: &str) -> Option<u8> {
    u8::from_str_radix(token, 16).ok()
}

/// Parse a hex token into a `u16`.
pub fn from_hex_u16(token: &str) -> Option<u16> {
    u16::from_str_radix(token, 16).ok()
}

/// Parse a hex token into a `u64`, ignoring `:` separators.
pub fn from_hex_u64(token: &str) -> Option<u64> {
    let cleaned: String = token.chars().filter(|c| *c != ':').collect();
    u64::from_str_radix(&cleaned, 16).ok()
}

/// Decode an uppercase/lowercase hex string into bytes.
pub fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

/// Encode bytes as uppercase hex, the representation `SKSENDTO` and
/// ASCII-mode `ERXUDP` use.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out
}
