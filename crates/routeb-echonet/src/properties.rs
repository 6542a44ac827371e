//! Per-EPC codecs for the low-voltage smart electric energy meter class.
//!
//! Raw integer energy values decoded here are NOT yet scaled: the facade
//! applies `coefficient (0xD3) x unit multiplier (0xE1)` before anything
//! reaches the caller. The sentinel `0xFFFFFFFE` in any cumulative-energy
//! slot decodes to `None` ("no data").

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use routeb_core::error::{Error, Result};

/// EPC constants for the smart meter class (`0x0288`).
pub mod epc {
    /// Operation status (on/off).
    pub const OPERATION_STATUS: u8 = 0x80;
    /// Installation location code.
    pub const INSTALLATION_LOCATION: u8 = 0x81;
    /// Standard (appendix) version information.
    pub const STANDARD_VERSION: u8 = 0x82;
    /// Fault status.
    pub const FAULT_STATUS: u8 = 0x88;
    /// Manufacturer code (3 bytes).
    pub const MANUFACTURER_CODE: u8 = 0x8A;
    /// Production serial number (ASCII).
    pub const SERIAL_NUMBER: u8 = 0x8D;
    /// Current time (hh:mm).
    pub const CURRENT_TIME: u8 = 0x97;
    /// Current date (yyyy-mm-dd).
    pub const CURRENT_DATE: u8 = 0x98;
    /// Coefficient applied to cumulative energy readings.
    pub const COEFFICIENT: u8 = 0xD3;
    /// Number of effective digits of cumulative energy.
    pub const EFFECTIVE_DIGITS: u8 = 0xD7;
    /// Cumulative energy, normal direction.
    pub const CUMULATIVE_ENERGY_NORMAL: u8 = 0xE0;
    /// Unit of cumulative energy.
    pub const ENERGY_UNIT: u8 = 0xE1;
    /// Historical cumulative energy 1, normal direction (48 half-hours).
    pub const HISTORICAL_1_NORMAL: u8 = 0xE2;
    /// Cumulative energy, reverse direction.
    pub const CUMULATIVE_ENERGY_REVERSE: u8 = 0xE3;
    /// Historical cumulative energy 1, reverse direction.
    pub const HISTORICAL_1_REVERSE: u8 = 0xE4;
    /// Day selector for historical data 1.
    pub const HISTORICAL_1_DAY: u8 = 0xE5;
    /// Instantaneous power (W).
    pub const INSTANTANEOUS_POWER: u8 = 0xE7;
    /// Instantaneous current (R/T phase deci-amps).
    pub const INSTANTANEOUS_CURRENT: u8 = 0xE8;
    /// Cumulative energy at fixed time, normal direction.
    pub const FIXED_TIME_NORMAL: u8 = 0xEA;
    /// Cumulative energy at fixed time, reverse direction.
    pub const FIXED_TIME_REVERSE: u8 = 0xEB;
    /// Historical cumulative energy 2 (30-minute slots, both directions).
    pub const HISTORICAL_2: u8 = 0xEC;
    /// Time selector for historical data 2.
    pub const HISTORICAL_2_TIME: u8 = 0xED;
    /// Historical cumulative energy 3 (1-minute slots, both directions).
    pub const HISTORICAL_3: u8 = 0xEE;
    /// Time selector for historical data 3.
    pub const HISTORICAL_3_TIME: u8 = 0xEF;
}

/// "No data" sentinel for cumulative-energy slots.
pub const NO_DATA_U32: u32 = 0xFFFF_FFFE;

/// Multiplier for a unit code from EPC 0xE1.
pub fn energy_unit_multiplier(code: u8) -> Option<f64> {
    match code {
        0x00 => Some(1.0),
        0x01 => Some(0.1),
        0x02 => Some(0.01),
        0x03 => Some(0.001),
        0x04 => Some(0.0001),
        0x0A => Some(10.0),
        0x0B => Some(100.0),
        0x0C => Some(1000.0),
        0x0D => Some(10000.0),
        _ => None,
    }
}

fn expect_len(edt: &[u8], len: usize, what: &str) -> Result<()> {
    if edt.len() != len {
        return Err(Error::Protocol(format!(
            "{what}: expected {len} bytes, got {}",
            edt.len()
        )));
    }
    Ok(())
}

/// Big-endian u8 out of a 1-byte EDT.
pub fn decode_u8(edt: &[u8], what: &str) -> Result<u8> {
    expect_len(edt, 1, what)?;
    Ok(edt[0])
}

/// Big-endian u32 out of a 4-byte EDT.
pub fn decode_u32(edt: &[u8], what: &str) -> Result<u32> {
    expect_len(edt, 4, what)?;
    Ok(u32::from_be_bytes([edt[0], edt[1], edt[2], edt[3]]))
}

/// Operation status (0x80): `0x30` on, `0x31` off, anything else unknown.
pub fn decode_operation_status(edt: &[u8]) -> Result<Option<bool>> {
    match decode_u8(edt, "operation status")? {
        0x30 => Ok(Some(true)),
        0x31 => Ok(Some(false)),
        _ => Ok(None),
    }
}

/// Fault status (0x88): `0x41` fault, `0x42` no fault.
pub fn decode_fault_status(edt: &[u8]) -> Result<Option<bool>> {
    match decode_u8(edt, "fault status")? {
        0x41 => Ok(Some(true)),
        0x42 => Ok(Some(false)),
        _ => Ok(None),
    }
}

/// Installation location (0x81): place code in bits 7..3, room number in
/// bits 2..0.
pub fn decode_installation_location(edt: &[u8]) -> Result<String> {
    let code = decode_u8(edt, "installation location")?;
    if code == 0x00 {
        return Ok("unspecified".to_string());
    }
    let place = match code >> 3 {
        0b00001 => "living room",
        0b00010 => "dining room",
        0b00011 => "kitchen",
        0b00100 => "bathroom",
        0b00101 => "washroom",
        0b00110 => "toilet",
        0b00111 => "corridor",
        0b01000 => "room",
        0b01001 => "stairway",
        0b01010 => "entrance",
        0b01011 => "storeroom",
        0b01100 => "garden",
        0b01101 => "garage",
        0b01110 => "balcony",
        0b01111 => "other",
        _ => return Ok(format!("location {code:#04X}")),
    };
    let number = code & 0x07;
    if number == 0 {
        Ok(place.to_string())
    } else {
        Ok(format!("{place} {number}"))
    }
}

/// Standard version information (0x82): the third byte is the appendix
/// release as an ASCII letter.
pub fn decode_standard_version(edt: &[u8]) -> Result<String> {
    expect_len(edt, 4, "standard version")?;
    let release = edt[2] as char;
    if release.is_ascii_alphanumeric() {
        Ok(format!("Appendix {release}"))
    } else {
        Err(Error::Protocol(format!(
            "unprintable standard version byte {:02X}",
            edt[2]
        )))
    }
}

/// Manufacturer code (0x8A): 3 opaque bytes assigned by the consortium.
pub fn decode_manufacturer_code(edt: &[u8]) -> Result<[u8; 3]> {
    expect_len(edt, 3, "manufacturer code")?;
    Ok([edt[0], edt[1], edt[2]])
}

/// Serial number (0x8D): ASCII, right-padded with NUL or spaces.
pub fn decode_serial_number(edt: &[u8]) -> Result<String> {
    let s: String = edt
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect();
    Ok(s.trim().to_string())
}

/// Current time (0x97): hour and minute.
pub fn decode_current_time(edt: &[u8]) -> Result<NaiveTime> {
    expect_len(edt, 2, "current time")?;
    NaiveTime::from_hms_opt(edt[0] as u32, edt[1] as u32, 0)
        .ok_or_else(|| Error::Protocol(format!("invalid meter time {}:{}", edt[0], edt[1])))
}

/// Current date (0x98): year (u16), month, day.
pub fn decode_current_date(edt: &[u8]) -> Result<NaiveDate> {
    expect_len(edt, 4, "current date")?;
    let year = u16::from_be_bytes([edt[0], edt[1]]) as i32;
    NaiveDate::from_ymd_opt(year, edt[2] as u32, edt[3] as u32)
        .ok_or_else(|| Error::Protocol(format!("invalid meter date {year}-{}-{}", edt[2], edt[3])))
}

/// A cumulative-energy register value, `None` on the no-data sentinel.
pub fn decode_cumulative_raw(edt: &[u8]) -> Result<Option<u32>> {
    let raw = decode_u32(edt, "cumulative energy")?;
    Ok(slot(raw))
}

fn slot(raw: u32) -> Option<u32> {
    if raw == NO_DATA_U32 {
        None
    } else {
        Some(raw)
    }
}

/// Instantaneous power (0xE7): signed watts.
pub fn decode_instantaneous_power(edt: &[u8]) -> Result<i32> {
    expect_len(edt, 4, "instantaneous power")?;
    Ok(i32::from_be_bytes([edt[0], edt[1], edt[2], edt[3]]))
}

/// Instantaneous current per phase, in amps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstantaneousCurrent {
    /// R-phase current in amps.
    pub r_amps: f64,
    /// T-phase current in amps. Single-phase 2-wire meters report the
    /// no-data pattern here; it decodes as 0x7FFE * 0.1 and should be
    /// ignored for such installations.
    pub t_amps: f64,
}

/// Instantaneous current (0xE8): two signed 16-bit deci-amp values.
pub fn decode_instantaneous_current(edt: &[u8]) -> Result<InstantaneousCurrent> {
    expect_len(edt, 4, "instantaneous current")?;
    let r = i16::from_be_bytes([edt[0], edt[1]]);
    let t = i16::from_be_bytes([edt[2], edt[3]]);
    Ok(InstantaneousCurrent {
        r_amps: f64::from(r) * 0.1,
        t_amps: f64::from(t) * 0.1,
    })
}

/// A 7-byte meter timestamp: year (u16), month, day, hour, minute, second.
pub fn decode_timestamp(edt: &[u8]) -> Result<NaiveDateTime> {
    if edt.len() < 7 {
        return Err(Error::Protocol(format!(
            "timestamp: expected 7 bytes, got {}",
            edt.len()
        )));
    }
    let year = u16::from_be_bytes([edt[0], edt[1]]) as i32;
    let date = NaiveDate::from_ymd_opt(year, edt[2] as u32, edt[3] as u32)
        .ok_or_else(|| Error::Protocol(format!("invalid date {year}-{}-{}", edt[2], edt[3])))?;
    let time = NaiveTime::from_hms_opt(edt[4] as u32, edt[5] as u32, edt[6] as u32)
        .ok_or_else(|| {
            Error::Protocol(format!("invalid time {}:{}:{}", edt[4], edt[5], edt[6]))
        })?;
    Ok(date.and_time(time))
}

/// Cumulative energy captured at a fixed time (0xEA/0xEB).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedTimeRaw {
    /// When the register was captured (meter clock).
    pub timestamp: NaiveDateTime,
    /// Raw register value, `None` on the no-data sentinel.
    pub raw: Option<u32>,
}

/// Decode a fixed-time cumulative energy EDT: 7-byte timestamp + u32.
pub fn decode_fixed_time(edt: &[u8]) -> Result<FixedTimeRaw> {
    expect_len(edt, 11, "fixed-time cumulative energy")?;
    Ok(FixedTimeRaw {
        timestamp: decode_timestamp(&edt[0..7])?,
        raw: slot(u32::from_be_bytes([edt[7], edt[8], edt[9], edt[10]])),
    })
}

/// Historical data 1 (0xE2/0xE4): the selected day and its 48 half-hour
/// slots, raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyHistoryRaw {
    /// Day offset the meter captured the series for (0 = today).
    pub day: u16,
    /// 48 raw slot values, `None` where the meter has no data.
    pub slots: Vec<Option<u32>>,
}

/// Decode a 206-byte historical-1 EDT: day (u16) + 48 x u32.
pub fn decode_historical_1(edt: &[u8]) -> Result<DailyHistoryRaw> {
    expect_len(edt, 206, "historical cumulative energy 1")?;
    let day = u16::from_be_bytes([edt[0], edt[1]]);
    let slots = edt[2..]
        .chunks_exact(4)
        .map(|c| slot(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
        .collect();
    Ok(DailyHistoryRaw { day, slots })
}

/// Historical data 2/3 (0xEC/0xEE): a starting timestamp and interleaved
/// normal/reverse raw values, most recent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalHistoryRaw {
    /// Timestamp of the first (most recent) entry.
    pub timestamp: NaiveDateTime,
    /// `(normal, reverse)` raw pairs, `None` where the meter has no data.
    pub entries: Vec<(Option<u32>, Option<u32>)>,
}

/// Decode a historical-2/3 EDT: 7-byte timestamp, count, then
/// `2 * count` u32 values interleaved normal/reverse.
pub fn decode_interval_history(edt: &[u8]) -> Result<IntervalHistoryRaw> {
    if edt.len() < 8 {
        return Err(Error::Protocol(format!(
            "interval history: expected at least 8 bytes, got {}",
            edt.len()
        )));
    }
    let timestamp = decode_timestamp(&edt[0..7])?;
    let count = edt[7] as usize;
    let expected = 8 + count * 8;
    if edt.len() != expected {
        return Err(Error::Protocol(format!(
            "interval history: expected {expected} bytes for {count} entries, got {}",
            edt.len()
        )));
    }
    let entries = edt[8..]
        .chunks_exact(8)
        .map(|c| {
            (
                slot(u32::from_be_bytes([c[0], c[1], c[2], c[3]])),
                slot(u32::from_be_bytes([c[4], c[5], c[6], c[7]])),
            )
        })
        .collect();
    Ok(IntervalHistoryRaw { timestamp, entries })
}

/// The time selector for historical data 2/3 (0xED/0xEF) as read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTimeSetting {
    /// Selected timestamp; `None` when the meter reports `0xFFFF` (unset).
    pub timestamp: Option<NaiveDateTime>,
    /// Selected number of data points.
    pub count: u8,
}

/// Decode an 0xED/0xEF EDT: 7-byte timestamp + count.
pub fn decode_history_time_setting(edt: &[u8]) -> Result<HistoryTimeSetting> {
    expect_len(edt, 8, "history time selector")?;
    let timestamp = if edt[0] == 0xFF && edt[1] == 0xFF {
        None
    } else {
        Some(decode_timestamp(&edt[0..7])?)
    };
    Ok(HistoryTimeSetting {
        timestamp,
        count: edt[7],
    })
}

/// Encode an 0xED/0xEF EDT: the collection timestamp (minute clamped to
/// the half-hour grid, seconds zeroed) and the number of data points.
pub fn encode_history_time_setting(ts: NaiveDateTime, count: u8) -> Vec<u8> {
    use chrono::Datelike;
    let year = ts.year().clamp(0, u16::MAX as i32) as u16;
    let minute: u8 = if ts.minute() < 30 { 0 } else { 30 };
    vec![
        (year >> 8) as u8,
        (year & 0xFF) as u8,
        ts.month() as u8,
        ts.day() as u8,
        ts.hour() as u8,
        minute,
        0,
        count,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_multiplier_table() {
        assert_eq!(energy_unit_multiplier(0x00), Some(1.0));
        assert_eq!(energy_unit_multiplier(0x01), Some(0.1));
        assert_eq!(energy_unit_multiplier(0x02), Some(0.01));
        assert_eq!(energy_unit_multiplier(0x03), Some(0.001));
        assert_eq!(energy_unit_multiplier(0x04), Some(0.0001));
        assert_eq!(energy_unit_multiplier(0x0A), Some(10.0));
        assert_eq!(energy_unit_multiplier(0x0D), Some(10000.0));
        assert_eq!(energy_unit_multiplier(0x05), None);
    }

    #[test]
    fn operation_status_codes() {
        assert_eq!(decode_operation_status(&[0x30]).unwrap(), Some(true));
        assert_eq!(decode_operation_status(&[0x31]).unwrap(), Some(false));
        assert_eq!(decode_operation_status(&[0x42]).unwrap(), None);
        assert!(decode_operation_status(&[]).is_err());
    }

    #[test]
    fn fault_status_codes() {
        assert_eq!(decode_fault_status(&[0x41]).unwrap(), Some(true));
        assert_eq!(decode_fault_status(&[0x42]).unwrap(), Some(false));
    }

    #[test]
    fn installation_location_names() {
        assert_eq!(decode_installation_location(&[0x00]).unwrap(), "unspecified");
        assert_eq!(decode_installation_location(&[0x08]).unwrap(), "living room");
        assert_eq!(
            decode_installation_location(&[0x0A]).unwrap(),
            "living room 2"
        );
        assert_eq!(decode_installation_location(&[0x51]).unwrap(), "entrance 1");
    }

    #[test]
    fn standard_version_release_letter() {
        assert_eq!(
            decode_standard_version(&[0x00, 0x00, b'M', 0x00]).unwrap(),
            "Appendix M"
        );
    }

    #[test]
    fn serial_number_trims_padding() {
        assert_eq!(
            decode_serial_number(b"S123456789\0\0").unwrap(),
            "S123456789"
        );
    }

    #[test]
    fn current_time_and_date() {
        assert_eq!(
            decode_current_time(&[13, 45]).unwrap(),
            NaiveTime::from_hms_opt(13, 45, 0).unwrap()
        );
        assert_eq!(
            decode_current_date(&[0x07, 0xE8, 5, 1]).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );
        assert!(decode_current_time(&[25, 0]).is_err());
    }

    #[test]
    fn cumulative_sentinel_is_none() {
        assert_eq!(
            decode_cumulative_raw(&[0xFF, 0xFF, 0xFF, 0xFE]).unwrap(),
            None
        );
        assert_eq!(
            decode_cumulative_raw(&[0x00, 0x01, 0x00, 0x00]).unwrap(),
            Some(0x10000)
        );
    }

    #[test]
    fn instantaneous_power_signed() {
        assert_eq!(
            decode_instantaneous_power(&[0x00, 0x00, 0x01, 0xF4]).unwrap(),
            500
        );
        assert_eq!(
            decode_instantaneous_power(&[0xFF, 0xFF, 0xFF, 0x38]).unwrap(),
            -200
        );
    }

    #[test]
    fn instantaneous_current_deci_amps() {
        let current = decode_instantaneous_current(&[0x00, 0x7B, 0xFF, 0x85]).unwrap();
        assert!((current.r_amps - 12.3).abs() < 1e-9);
        assert!((current.t_amps - (-12.3)).abs() < 1e-9);
    }

    #[test]
    fn timestamp_round_trip_through_selector() {
        let ts = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let encoded = encode_history_time_setting(ts, 6);
        assert_eq!(encoded, vec![0x07, 0xE8, 0x05, 0x01, 0x0C, 0x00, 0x00, 0x06]);

        let setting = decode_history_time_setting(&encoded).unwrap();
        assert_eq!(setting.timestamp, Some(ts));
        assert_eq!(setting.count, 6);
    }

    #[test]
    fn selector_minute_clamps_to_half_hour_grid() {
        let ts = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 44, 31)
            .unwrap();
        let encoded = encode_history_time_setting(ts, 12);
        assert_eq!(encoded[5], 30);
        assert_eq!(encoded[6], 0);
    }

    #[test]
    fn selector_unset_timestamp() {
        let setting =
            decode_history_time_setting(&[0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0C])
                .unwrap();
        assert_eq!(setting.timestamp, None);
        assert_eq!(setting.count, 12);
    }

    #[test]
    fn fixed_time_reading() {
        let edt = [
            0x07, 0xE8, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x86, 0xA0,
        ];
        let reading = decode_fixed_time(&edt).unwrap();
        assert_eq!(
            reading.timestamp,
            NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        );
        assert_eq!(reading.raw, Some(100_000));
    }

    #[test]
    fn historical_1_layout() {
        let mut edt = vec![0x00, 0x03]; // three days ago
        for i in 0..48u32 {
            edt.extend_from_slice(&(i * 10).to_be_bytes());
        }
        let history = decode_historical_1(&edt).unwrap();
        assert_eq!(history.day, 3);
        assert_eq!(history.slots.len(), 48);
        assert_eq!(history.slots[0], Some(0));
        assert_eq!(history.slots[47], Some(470));
    }

    #[test]
    fn historical_1_all_sentinel_decodes_to_all_none() {
        let mut edt = vec![0x00, 0x00];
        for _ in 0..48 {
            edt.extend_from_slice(&NO_DATA_U32.to_be_bytes());
        }
        let history = decode_historical_1(&edt).unwrap();
        assert!(history.slots.iter().all(|s| s.is_none()));
    }

    #[test]
    fn historical_1_rejects_wrong_length() {
        assert!(decode_historical_1(&[0u8; 205]).is_err());
        assert!(decode_historical_1(&[0u8; 207]).is_err());
    }

    #[test]
    fn interval_history_layout() {
        let mut edt = vec![0x07, 0xE8, 0x05, 0x01, 0x0C, 0x00, 0x00, 0x02];
        edt.extend_from_slice(&100u32.to_be_bytes());
        edt.extend_from_slice(&NO_DATA_U32.to_be_bytes());
        edt.extend_from_slice(&200u32.to_be_bytes());
        edt.extend_from_slice(&5u32.to_be_bytes());

        let history = decode_interval_history(&edt).unwrap();
        assert_eq!(history.entries.len(), 2);
        assert_eq!(history.entries[0], (Some(100), None));
        assert_eq!(history.entries[1], (Some(200), Some(5)));
    }

    #[test]
    fn interval_history_rejects_count_mismatch() {
        let mut edt = vec![0x07, 0xE8, 0x05, 0x01, 0x0C, 0x00, 0x00, 0x03];
        edt.extend_from_slice(&[0u8; 16]); // only 2 entries for count 3
        assert!(decode_interval_history(&edt).is_err());
    }
}
