//! SKSTACK command encoders and response parsers.
//!
//! Commands are uppercase ASCII tokens joined by single spaces and
//! terminated with CRLF. `SKSENDTO` carries its UDP payload as uppercase
//! hex in the final field (ASCII payload mode), with the length field
//! giving the raw byte count.
//!
//! Response parsers operate on the accumulated line list a dispatcher
//! exchange returns, picking out the data-bearing line (`EVER`, `EINFO`,
//! the `SKLL64` IPv6 line, `EPANDESC` blocks).

use bytes::{BufMut, BytesMut};

use routeb_core::error::{Error, Result};
use routeb_core::types::PanDescriptor;

use crate::protocol::{self, classify, PayloadMode, SkLine};

/// UDP port ECHONET Lite uses (3610).
pub const ECHONET_PORT: u16 = 0x0E1A;

/// Encode a command line: tokens joined by spaces, CRLF-terminated.
pub fn encode_line(tokens: &[&str]) -> Vec<u8> {
    let len: usize = tokens.iter().map(|t| t.len() + 1).sum();
    let mut buf = BytesMut::with_capacity(len + 1);
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b' ');
        }
        buf.put_slice(token.as_bytes());
    }
    buf.put_slice(b"\r\n");
    buf.to_vec()
}

/// `SKVER` -- query the SKSTACK firmware version.
pub fn skver() -> Vec<u8> {
    encode_line(&["SKVER"])
}

/// `SKAPPVER` -- query the application firmware version.
pub fn skappver() -> Vec<u8> {
    encode_line(&["SKAPPVER"])
}

/// `SKINFO` -- query current address, channel, and PAN id.
pub fn skinfo() -> Vec<u8> {
    encode_line(&["SKINFO"])
}

/// `SKRESET` -- software-reset the module.
pub fn skreset() -> Vec<u8> {
    encode_line(&["SKRESET"])
}

/// `ROPT` -- read the ERXUDP payload representation.
pub fn ropt() -> Vec<u8> {
    encode_line(&["ROPT"])
}

/// `WOPT` -- write the ERXUDP payload representation. Persisted in module
/// flash, which has a limited write count; only issue when `ROPT` reports
/// a different mode.
pub fn wopt(mode: PayloadMode) -> Vec<u8> {
    let arg = match mode {
        PayloadMode::Binary => "00",
        PayloadMode::Ascii => "01",
    };
    encode_line(&["WOPT", arg])
}

/// `SKSREG` -- write a virtual register (e.g. `S2` channel, `S3` PAN id).
pub fn sksreg(register: &str, value: &str) -> Vec<u8> {
    encode_line(&["SKSREG", register, value])
}

/// `SKSETRBID` -- register the Route-B authentication ID.
pub fn sksetrbid(rbid: &str) -> Vec<u8> {
    encode_line(&["SKSETRBID", rbid])
}

/// `SKSETPWD` -- register the Route-B password, length-prefixed in hex.
pub fn sksetpwd(password: &str) -> Vec<u8> {
    let len = format!("{:X}", password.len());
    encode_line(&["SKSETPWD", &len, password])
}

/// `SKSCAN` -- active scan of all channels with the given duration
/// exponent. Per-channel dwell time is `0.0096 * (2^duration + 1)` seconds.
pub fn skscan(duration: u8) -> Vec<u8> {
    let duration = format!("{duration:X}");
    encode_line(&["SKSCAN", "2", "FFFFFFFF", &duration])
}

/// `SKLL64` -- derive the link-local IPv6 address for a MAC address.
pub fn skll64(mac_hex: &str) -> Vec<u8> {
    encode_line(&["SKLL64", mac_hex])
}

/// `SKJOIN` -- start PANA authentication against the coordinator.
pub fn skjoin(ipv6: &str) -> Vec<u8> {
    encode_line(&["SKJOIN", ipv6])
}

/// `SKTERM` -- terminate the PANA session.
pub fn skterm() -> Vec<u8> {
    encode_line(&["SKTERM"])
}

/// `SKSENDTO` -- send a UDP datagram to the meter's ECHONET port.
///
/// Handle 1, security required (1), side 0. The length field is the raw
/// byte count; the payload itself is uppercase hex.
pub fn sksendto(ipv6: &str, payload: &[u8]) -> Vec<u8> {
    let port = format!("{ECHONET_PORT:04X}");
    let len = format!("{:04X}", payload.len());
    let data = protocol::encode_hex(payload);
    encode_line(&["SKSENDTO", "1", ipv6, &port, "1", "0", &len, &data])
}

// ---------------------------------------------------------------------------
// Response parsers
// ---------------------------------------------------------------------------

/// Find the data token after `tag` on the matching response line.
fn extract_tagged(lines: &[String], tag: &str) -> Result<String> {
    for line in lines.iter().rev() {
        if let Some(rest) = line.strip_prefix(tag) {
            return Ok(rest.trim().to_string());
        }
    }
    Err(Error::Protocol(format!("no '{tag}' line in response")))
}

/// Parse the `EVER` line of an `SKVER` response into the stack version.
pub fn parse_ever(lines: &[String]) -> Result<String> {
    extract_tagged(lines, "EVER ")
}

/// Parse the `EAPPVER` line of an `SKAPPVER` response.
pub fn parse_eappver(lines: &[String]) -> Result<String> {
    extract_tagged(lines, "EAPPVER ")
}

/// Module information reported by `SKINFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Current IPv6 link-local address.
    pub ip6_addr: String,
    /// 64-bit MAC address.
    pub mac_addr: u64,
    /// Current logical channel.
    pub channel: u8,
    /// Current PAN id.
    pub pan_id: u16,
}

/// Parse the `EINFO` line of an `SKINFO` response.
pub fn parse_einfo(lines: &[String]) -> Result<ModuleInfo> {
    let data = extract_tagged(lines, "EINFO ")?;
    let tokens: Vec<&str> = data.split_ascii_whitespace().collect();
    if tokens.len() < 4 {
        return Err(Error::Protocol(format!("short EINFO line: {data}")));
    }
    Ok(ModuleInfo {
        ip6_addr: tokens[0].to_string(),
        mac_addr: protocol::from_hex_u64(tokens[1])
            .ok_or_else(|| Error::Protocol(format!("bad EINFO mac: {}", tokens[1])))?,
        channel: protocol::from_hex_u8(tokens[2])
            .ok_or_else(|| Error::Protocol(format!("bad EINFO channel: {}", tokens[2])))?,
        pan_id: protocol::from_hex_u16(tokens[3])
            .ok_or_else(|| Error::Protocol(format!("bad EINFO pan id: {}", tokens[3])))?,
    })
}

/// Parse the IPv6 line answering `SKLL64`.
pub fn parse_ll64(lines: &[String]) -> Result<String> {
    lines
        .iter()
        .find(|l| l.starts_with("FE80:"))
        .cloned()
        .ok_or_else(|| Error::Protocol("no link-local address in SKLL64 response".into()))
}

/// Parse the payload mode out of a `ROPT` response (`OK 00` / `OK 01`).
pub fn parse_ropt_mode(lines: &[String]) -> Result<PayloadMode> {
    for line in lines.iter().rev() {
        if let SkLine::Ok(rest) = classify(line) {
            return match rest.trim() {
                "00" => Ok(PayloadMode::Binary),
                "01" => Ok(PayloadMode::Ascii),
                other => Err(Error::Protocol(format!("unexpected ROPT mode: {other}"))),
            };
        }
    }
    Err(Error::Protocol("no OK line in ROPT response".into()))
}

/// The `EVENT 21` transmission result from an `SKSENDTO` exchange, if one
/// was reported. `00` = delivered, `01` = retransmission needed, `02` =
/// neighbour solicitation in progress.
pub fn parse_udp_tx_result(lines: &[String]) -> Option<u8> {
    for line in lines.iter().rev() {
        if let SkLine::Event {
            code: 0x21, param, ..
        } = classify(line)
        {
            return param;
        }
    }
    None
}

#[derive(Default)]
struct PanDescriptorBuilder {
    channel: Option<u8>,
    pan_id: Option<u16>,
    mac_addr: Option<u64>,
    lqi: Option<u8>,
    pair_id: Option<String>,
}

impl PanDescriptorBuilder {
    fn set(&mut self, key: &str, value: &str) {
        match key {
            "Channel" => self.channel = protocol::from_hex_u8(value),
            "Pan ID" => self.pan_id = protocol::from_hex_u16(value),
            "Addr" => self.mac_addr = protocol::from_hex_u64(value),
            "LQI" => self.lqi = protocol::from_hex_u8(value),
            "PairID" => self.pair_id = Some(value.to_string()),
            // "Channel Page" and anything newer firmware adds.
            _ => {}
        }
    }

    fn finish(&mut self) -> Option<PanDescriptor> {
        let desc = PanDescriptor {
            channel: self.channel?,
            pan_id: self.pan_id?,
            mac_addr: self.mac_addr?,
            lqi: self.lqi.unwrap_or(0),
            pair_id: self.pair_id.clone().unwrap_or_default(),
        };
        *self = PanDescriptorBuilder::default();
        Some(desc)
    }
}

/// Collect the PAN descriptors from the `EPANDESC` blocks of a scan
/// response. A descriptor is reported once its channel, PAN id, and MAC
/// address fields have all been seen.
pub fn parse_pan_descriptors(lines: &[String]) -> Vec<PanDescriptor> {
    let mut found = Vec::new();
    let mut builder = PanDescriptorBuilder::default();
    let mut in_block = false;

    for line in lines {
        match classify(line) {
            SkLine::EPanDescHeader => {
                if in_block {
                    if let Some(desc) = builder.finish() {
                        found.push(desc);
                    }
                }
                builder = PanDescriptorBuilder::default();
                in_block = true;
            }
            SkLine::PanField { key, value } if in_block => {
                builder.set(&key, &value);
            }
            _ => {
                if in_block {
                    if let Some(desc) = builder.finish() {
                        found.push(desc);
                    }
                    in_block = false;
                }
            }
        }
    }
    if in_block {
        if let Some(desc) = builder.finish() {
            found.push(desc);
        }
    }
    found
}
