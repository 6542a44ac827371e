//! ECHONET Lite frame codec.
//!
//! Frame layout (EDATA format 1, the only format Route B meters speak):
//!
//! ```text
//! EHD1=0x10 EHD2=0x81 TID(2) SEOJ(3) DEOJ(3) ESV(1) OPC(1) {EPC(1) PDC(1) EDT(PDC)}*
//! ```
//!
//! The client always sends from the management controller object
//! (`05FF01`) to the low-voltage smart electric energy meter (`028801`).

use bytes::{BufMut, BytesMut};

use routeb_core::error::{Error, Result};

/// ECHONET Lite header, first byte (EDATA format 1).
pub const EHD1: u8 = 0x10;
/// ECHONET Lite header, second byte (EDATA format 1).
pub const EHD2: u8 = 0x81;

/// An ECHONET object code: class group, class, instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eoj(pub u8, pub u8, pub u8);

impl Eoj {
    /// Management controller, instance 1 -- the client side.
    pub const CONTROLLER: Eoj = Eoj(0x05, 0xFF, 0x01);

    /// Low-voltage smart electric energy meter, instance 1.
    pub const SMART_METER: Eoj = Eoj(0x02, 0x88, 0x01);
}

/// ECHONET Lite service codes used on Route B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Esv {
    /// Property write with acknowledgement (SetC).
    SetC,
    /// Property read (Get).
    Get,
    /// SetC response.
    SetRes,
    /// Get response.
    GetRes,
    /// SetC not possible: at least one property was rejected.
    SetSna,
    /// Get not possible: at least one property was rejected.
    GetSna,
}

impl Esv {
    /// The wire byte for this service code.
    pub fn byte(self) -> u8 {
        match self {
            Esv::SetC => 0x61,
            Esv::Get => 0x62,
            Esv::SetRes => 0x71,
            Esv::GetRes => 0x72,
            Esv::SetSna => 0x51,
            Esv::GetSna => 0x52,
        }
    }

    /// Parse a wire byte. Unknown service codes return `None`.
    pub fn from_byte(b: u8) -> Option<Esv> {
        match b {
            0x61 => Some(Esv::SetC),
            0x62 => Some(Esv::Get),
            0x71 => Some(Esv::SetRes),
            0x72 => Some(Esv::GetRes),
            0x51 => Some(Esv::SetSna),
            0x52 => Some(Esv::GetSna),
            _ => None,
        }
    }

    /// Whether this is a "not possible" response.
    pub fn is_not_possible(self) -> bool {
        matches!(self, Esv::SetSna | Esv::GetSna)
    }
}

/// One property in a frame: an EPC with its (possibly empty) data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// ECHONET property code.
    pub epc: u8,
    /// Property data; empty in Get requests and in rejected slots of a
    /// Get-SNA response.
    pub edt: Vec<u8>,
}

impl Property {
    /// A data-less property, as carried in a Get request.
    pub fn request(epc: u8) -> Self {
        Property {
            epc,
            edt: Vec::new(),
        }
    }

    /// A property with data, as carried in a SetC request.
    pub fn with_data(epc: u8, edt: Vec<u8>) -> Self {
        Property { epc, edt }
    }
}

/// A complete ECHONET Lite frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchonetFrame {
    /// Transaction id correlating a response to its request.
    pub tid: u16,
    /// Source object.
    pub seoj: Eoj,
    /// Destination object.
    pub deoj: Eoj,
    /// Service code.
    pub esv: Esv,
    /// Properties, one per OPC entry.
    pub props: Vec<Property>,
}

impl EchonetFrame {
    /// Build a Get request from the controller to the meter.
    pub fn get_request(tid: u16, epcs: &[u8]) -> Self {
        EchonetFrame {
            tid,
            seoj: Eoj::CONTROLLER,
            deoj: Eoj::SMART_METER,
            esv: Esv::Get,
            props: epcs.iter().copied().map(Property::request).collect(),
        }
    }

    /// Build a SetC request from the controller to the meter.
    pub fn set_request(tid: u16, props: Vec<Property>) -> Self {
        EchonetFrame {
            tid,
            seoj: Eoj::CONTROLLER,
            deoj: Eoj::SMART_METER,
            esv: Esv::SetC,
            props,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let edt_len: usize = self.props.iter().map(|p| 2 + p.edt.len()).sum();
        let mut buf = BytesMut::with_capacity(12 + edt_len);
        buf.put_u8(EHD1);
        buf.put_u8(EHD2);
        buf.put_u16(self.tid);
        buf.put_slice(&[self.seoj.0, self.seoj.1, self.seoj.2]);
        buf.put_slice(&[self.deoj.0, self.deoj.1, self.deoj.2]);
        buf.put_u8(self.esv.byte());
        buf.put_u8(self.props.len() as u8);
        for prop in &self.props {
            buf.put_u8(prop.epc);
            buf.put_u8(prop.edt.len() as u8);
            buf.put_slice(&prop.edt);
        }
        buf.to_vec()
    }

    /// Decode from wire bytes.
    ///
    /// Rejects frames whose header is not EDATA format 1 and frames whose
    /// property list is truncated.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::Protocol(format!(
                "ECHONET frame too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != EHD1 || data[1] != EHD2 {
            return Err(Error::Protocol(format!(
                "not an ECHONET Lite EDATA format 1 frame (EHD {:02X}{:02X})",
                data[0], data[1]
            )));
        }
        let tid = u16::from_be_bytes([data[2], data[3]]);
        let seoj = Eoj(data[4], data[5], data[6]);
        let deoj = Eoj(data[7], data[8], data[9]);
        let esv = Esv::from_byte(data[10])
            .ok_or_else(|| Error::Protocol(format!("unknown ESV {:02X}", data[10])))?;
        let opc = data[11] as usize;

        let mut props = Vec::with_capacity(opc);
        let mut offset = 12;
        for _ in 0..opc {
            if data.len() < offset + 2 {
                return Err(Error::Protocol("truncated property header".into()));
            }
            let epc = data[offset];
            let pdc = data[offset + 1] as usize;
            offset += 2;
            if data.len() < offset + pdc {
                return Err(Error::Protocol(format!(
                    "truncated property data for EPC {epc:02X}"
                )));
            }
            props.push(Property {
                epc,
                edt: data[offset..offset + pdc].to_vec(),
            });
            offset += pdc;
        }

        Ok(EchonetFrame {
            tid,
            seoj,
            deoj,
            esv,
            props,
        })
    }
}
