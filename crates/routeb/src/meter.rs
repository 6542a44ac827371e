//! The meter facade: named operations over the ECHONET client.
//!
//! [`Meter`] composes Get/SetC primitives into the operations a collector
//! actually wants ("instantaneous power", "yesterday's half-hour series")
//! and applies the coefficient and unit so that raw register integers
//! never cross this boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::debug;

use routeb_core::error::{Error, Result};
use routeb_core::events::SessionEvent;
use routeb_core::types::SessionState;
use routeb_echonet::client::EchonetClient;
use routeb_echonet::frame::Property;
use routeb_echonet::properties::{self, epc, HistoryTimeSetting, InstantaneousCurrent};
use routeb_sk::session::SessionManager;

/// Which direction of energy flow a cumulative register covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyDirection {
    /// Grid to consumer (the normal case).
    Normal,
    /// Consumer to grid (solar feed-in and the like).
    Reverse,
}

/// One half-hour slot of a daily historical series.
#[derive(Debug, Clone, PartialEq)]
pub struct TimestampedEnergy {
    /// End of the half-hour slot, synthesised on the client clock.
    pub timestamp: NaiveDateTime,
    /// Scaled energy in kWh; `None` where the meter has no data.
    pub kwh: Option<f64>,
}

/// A cumulative register captured at a fixed time (usually 00:00).
#[derive(Debug, Clone, PartialEq)]
pub struct FixedTimeEnergy {
    /// Capture time per the meter clock.
    pub timestamp: NaiveDateTime,
    /// Scaled register value in kWh; `None` where the meter has no data.
    pub kwh: Option<f64>,
}

/// One slot of a bidirectional interval series (historical data 2/3).
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalEnergy {
    /// Slot timestamp per the meter clock, most recent entry first.
    pub timestamp: NaiveDateTime,
    /// Normal-direction energy in kWh.
    pub normal_kwh: Option<f64>,
    /// Reverse-direction energy in kWh.
    pub reverse_kwh: Option<f64>,
}

/// An open connection to a smart meter.
///
/// Built by [`MeterBuilder`](crate::MeterBuilder). Every operation can
/// block for multiple seconds: it may wait on the command mutex, the
/// transmission gate, the serial device, and the meter's response, each
/// bounded by the configured response timeout.
pub struct Meter {
    client: EchonetClient,
    response_timeout: Duration,
    /// coefficient x unit multiplier, fetched on first cumulative read and
    /// cached for the session lifetime.
    energy_scale: Mutex<Option<f64>>,
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meter")
            .field("response_timeout", &self.response_timeout)
            .finish_non_exhaustive()
    }
}

impl Meter {
    pub(crate) fn new(session: Arc<SessionManager>, response_timeout: Duration) -> Self {
        Meter {
            client: EchonetClient::new(session),
            response_timeout,
            energy_scale: Mutex::new(None),
        }
    }

    /// Current session state.
    pub fn session_state(&self) -> SessionState {
        self.client.session().state()
    }

    /// Subscribe to session lifecycle events (re-auth cycles, restriction
    /// windows, failure).
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.client.session().subscribe()
    }

    /// Close the session and release the serial device. Idempotent; all
    /// subsequent operations return [`Error::NeedToReopen`].
    pub async fn close(&self) {
        self.client.session().close().await;
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.response_timeout
    }

    /// Read one property and return its data.
    async fn get_one(&self, epc: u8) -> Result<Vec<u8>> {
        let mut props = self.client.get(&[epc], self.deadline()).await?;
        match props.pop() {
            Some(prop) if prop.epc == epc && props.is_empty() => Ok(prop.edt),
            _ => Err(Error::Protocol(format!(
                "malformed single-property response for EPC {epc:02X}"
            ))),
        }
    }

    /// Write one property with acknowledgement.
    async fn set_one(&self, epc: u8, edt: Vec<u8>) -> Result<()> {
        self.client
            .set(vec![Property::with_data(epc, edt)], self.deadline())
            .await
            .map(|_| ())
    }

    /// Read an arbitrary aggregate of properties in one request.
    ///
    /// If the meter rejects any EPC the whole aggregate fails with
    /// [`Error::ResponseNotPossible`]; reissue without the offending EPCs.
    pub async fn read_properties(&self, epcs: &[u8]) -> Result<Vec<Property>> {
        self.client.get(epcs, self.deadline()).await
    }

    // -------------------------------------------------------------------
    // Device identity and status
    // -------------------------------------------------------------------

    /// Operation status (0x80): `Some(true)` on, `Some(false)` off,
    /// `None` when the meter reports an unknown code.
    pub async fn get_operation_status(&self) -> Result<Option<bool>> {
        properties::decode_operation_status(&self.get_one(epc::OPERATION_STATUS).await?)
    }

    /// Installation location (0x81) as a human-readable place name.
    pub async fn get_installation_location(&self) -> Result<String> {
        properties::decode_installation_location(&self.get_one(epc::INSTALLATION_LOCATION).await?)
    }

    /// ECHONET standard version (0x82), e.g. "Appendix M".
    pub async fn get_standard_version(&self) -> Result<String> {
        properties::decode_standard_version(&self.get_one(epc::STANDARD_VERSION).await?)
    }

    /// Fault status (0x88): `Some(true)` when a fault has occurred.
    pub async fn get_fault_status(&self) -> Result<Option<bool>> {
        properties::decode_fault_status(&self.get_one(epc::FAULT_STATUS).await?)
    }

    /// Manufacturer code (0x8A), 3 consortium-assigned bytes.
    pub async fn get_manufacturer_code(&self) -> Result<[u8; 3]> {
        properties::decode_manufacturer_code(&self.get_one(epc::MANUFACTURER_CODE).await?)
    }

    /// Production serial number (0x8D).
    pub async fn get_serial_number(&self) -> Result<String> {
        properties::decode_serial_number(&self.get_one(epc::SERIAL_NUMBER).await?)
    }

    /// The meter's clock time (0x97).
    pub async fn get_current_time(&self) -> Result<NaiveTime> {
        properties::decode_current_time(&self.get_one(epc::CURRENT_TIME).await?)
    }

    /// The meter's clock date (0x98).
    pub async fn get_current_date(&self) -> Result<chrono::NaiveDate> {
        properties::decode_current_date(&self.get_one(epc::CURRENT_DATE).await?)
    }

    // -------------------------------------------------------------------
    // Scaling properties
    // -------------------------------------------------------------------

    /// Coefficient for cumulative energy (0xD3).
    pub async fn get_coefficient(&self) -> Result<u32> {
        properties::decode_u32(&self.get_one(epc::COEFFICIENT).await?, "coefficient")
    }

    /// Number of effective digits of the cumulative registers (0xD7).
    pub async fn get_effective_digits(&self) -> Result<u8> {
        properties::decode_u8(&self.get_one(epc::EFFECTIVE_DIGITS).await?, "effective digits")
    }

    /// Unit of cumulative energy (0xE1) as a kWh multiplier.
    pub async fn get_energy_unit(&self) -> Result<f64> {
        let code = properties::decode_u8(&self.get_one(epc::ENERGY_UNIT).await?, "energy unit")?;
        properties::energy_unit_multiplier(code)
            .ok_or_else(|| Error::Protocol(format!("unknown energy unit code {code:02X}")))
    }

    /// coefficient x unit, fetched once per session and cached.
    ///
    /// Meters that do not implement 0xD3 answer "not possible"; the
    /// coefficient then defaults to 1.
    async fn energy_scale(&self) -> Result<f64> {
        let mut cached = self.energy_scale.lock().await;
        if let Some(scale) = *cached {
            return Ok(scale);
        }
        let coefficient = match self.get_coefficient().await {
            Ok(c) => f64::from(c),
            Err(Error::ResponseNotPossible { .. }) => 1.0,
            Err(e) => return Err(e),
        };
        let unit = self.get_energy_unit().await?;
        let scale = coefficient * unit;
        debug!(coefficient, unit, "cumulative energy scale cached");
        *cached = Some(scale);
        Ok(scale)
    }

    // -------------------------------------------------------------------
    // Energy readings
    // -------------------------------------------------------------------

    /// Cumulative energy register (0xE0/0xE3) in kWh.
    pub async fn get_cumulative_energy(&self, direction: EnergyDirection) -> Result<Option<f64>> {
        let scale = self.energy_scale().await?;
        let epc = match direction {
            EnergyDirection::Normal => epc::CUMULATIVE_ENERGY_NORMAL,
            EnergyDirection::Reverse => epc::CUMULATIVE_ENERGY_REVERSE,
        };
        let raw = properties::decode_cumulative_raw(&self.get_one(epc).await?)?;
        Ok(raw.map(|r| f64::from(r) * scale))
    }

    /// Instantaneous power (0xE7) in watts.
    pub async fn get_instantaneous_power(&self) -> Result<f64> {
        let power = properties::decode_instantaneous_power(
            &self.get_one(epc::INSTANTANEOUS_POWER).await?,
        )?;
        Ok(f64::from(power))
    }

    /// Instantaneous current (0xE8) per phase, in amps.
    pub async fn get_instantaneous_current(&self) -> Result<InstantaneousCurrent> {
        properties::decode_instantaneous_current(
            &self.get_one(epc::INSTANTANEOUS_CURRENT).await?,
        )
    }

    /// Cumulative energy captured at the most recent fixed time
    /// (0xEA/0xEB), in kWh.
    pub async fn get_cumulative_energy_at_fixed_time(
        &self,
        direction: EnergyDirection,
    ) -> Result<FixedTimeEnergy> {
        let scale = self.energy_scale().await?;
        let epc = match direction {
            EnergyDirection::Normal => epc::FIXED_TIME_NORMAL,
            EnergyDirection::Reverse => epc::FIXED_TIME_REVERSE,
        };
        let raw = properties::decode_fixed_time(&self.get_one(epc).await?)?;
        Ok(FixedTimeEnergy {
            timestamp: raw.timestamp,
            kwh: raw.raw.map(|r| f64::from(r) * scale),
        })
    }

    // -------------------------------------------------------------------
    // Historical data 1 (daily half-hour series)
    // -------------------------------------------------------------------

    /// Select which day (0 = today, up to 99 days back) historical data 1
    /// covers.
    pub async fn set_day_for_historical_data_1(&self, day: u8) -> Result<()> {
        if day > 99 {
            return Err(Error::InvalidParameter(format!(
                "day must be within 0..=99, got {day}"
            )));
        }
        self.set_one(epc::HISTORICAL_1_DAY, vec![day]).await
    }

    /// Read back the day selector for historical data 1.
    pub async fn get_day_for_historical_data_1(&self) -> Result<u8> {
        properties::decode_u8(&self.get_one(epc::HISTORICAL_1_DAY).await?, "history day")
    }

    /// The 48 half-hour slots of cumulative energy for `day` days ago
    /// (0xE2/0xE4), in kWh.
    ///
    /// Timestamps are synthesised on the client clock: half-hour marks of
    /// `(today - day)`, the first slot ending at 00:30. If midnight passes
    /// between issuing the request and building the series, the dates are
    /// off by one day; this is inherent to the client-side clock and is
    /// not compensated.
    pub async fn get_historical_cumulative_energy_1(
        &self,
        day: u8,
        direction: EnergyDirection,
    ) -> Result<Vec<TimestampedEnergy>> {
        if day > 99 {
            return Err(Error::InvalidParameter(format!(
                "day must be within 0..=99, got {day}"
            )));
        }
        let scale = self.energy_scale().await?;
        self.set_day_for_historical_data_1(day).await?;

        let epc = match direction {
            EnergyDirection::Normal => epc::HISTORICAL_1_NORMAL,
            EnergyDirection::Reverse => epc::HISTORICAL_1_REVERSE,
        };
        let history = properties::decode_historical_1(&self.get_one(epc).await?)?;

        let midnight = (Local::now().date_naive()
            - chrono::Duration::days(i64::from(history.day)))
        .and_time(NaiveTime::MIN);

        Ok(history
            .slots
            .iter()
            .enumerate()
            .map(|(i, raw)| TimestampedEnergy {
                timestamp: midnight + chrono::Duration::minutes(30 * (i as i64 + 1)),
                kwh: raw.map(|r| f64::from(r) * scale),
            })
            .collect())
    }

    // -------------------------------------------------------------------
    // Historical data 2 (30-minute bidirectional series)
    // -------------------------------------------------------------------

    /// Select the collection time and count for historical data 2 (0xED).
    pub async fn set_time_for_historical_data_2(
        &self,
        timestamp: NaiveDateTime,
        num_of_data_points: u8,
    ) -> Result<()> {
        if !(1..=12).contains(&num_of_data_points) {
            return Err(Error::InvalidParameter(format!(
                "num_of_data_points must be within 1..=12, got {num_of_data_points}"
            )));
        }
        self.set_one(
            epc::HISTORICAL_2_TIME,
            properties::encode_history_time_setting(timestamp, num_of_data_points),
        )
        .await
    }

    /// Read back the time selector for historical data 2.
    pub async fn get_time_for_historical_data_2(&self) -> Result<HistoryTimeSetting> {
        properties::decode_history_time_setting(&self.get_one(epc::HISTORICAL_2_TIME).await?)
    }

    /// Up to 12 half-hour slots of bidirectional cumulative energy ending
    /// at `timestamp` (0xEC), in kWh. `timestamp` defaults to now.
    pub async fn get_historical_cumulative_energy_2(
        &self,
        timestamp: Option<NaiveDateTime>,
        num_of_data_points: u8,
    ) -> Result<Vec<IntervalEnergy>> {
        if !(1..=12).contains(&num_of_data_points) {
            return Err(Error::InvalidParameter(format!(
                "num_of_data_points must be within 1..=12, got {num_of_data_points}"
            )));
        }
        let scale = self.energy_scale().await?;
        let timestamp = timestamp.unwrap_or_else(|| Local::now().naive_local());
        self.set_time_for_historical_data_2(timestamp, num_of_data_points)
            .await?;

        let history =
            properties::decode_interval_history(&self.get_one(epc::HISTORICAL_2).await?)?;
        Ok(scale_interval_history(history, scale, 30))
    }

    // -------------------------------------------------------------------
    // Historical data 3 (1-minute bidirectional series)
    // -------------------------------------------------------------------

    /// Select the collection time and count for historical data 3 (0xEF).
    pub async fn set_time_for_historical_data_3(
        &self,
        timestamp: NaiveDateTime,
        num_of_data_points: u8,
    ) -> Result<()> {
        if !(1..=10).contains(&num_of_data_points) {
            return Err(Error::InvalidParameter(format!(
                "num_of_data_points must be within 1..=10, got {num_of_data_points}"
            )));
        }
        self.set_one(
            epc::HISTORICAL_3_TIME,
            properties::encode_history_time_setting(timestamp, num_of_data_points),
        )
        .await
    }

    /// Read back the time selector for historical data 3.
    pub async fn get_time_for_historical_data_3(&self) -> Result<HistoryTimeSetting> {
        properties::decode_history_time_setting(&self.get_one(epc::HISTORICAL_3_TIME).await?)
    }

    /// Up to 10 one-minute slots of bidirectional cumulative energy ending
    /// at `timestamp` (0xEE), in kWh. `timestamp` defaults to now.
    pub async fn get_historical_cumulative_energy_3(
        &self,
        timestamp: Option<NaiveDateTime>,
        num_of_data_points: u8,
    ) -> Result<Vec<IntervalEnergy>> {
        if !(1..=10).contains(&num_of_data_points) {
            return Err(Error::InvalidParameter(format!(
                "num_of_data_points must be within 1..=10, got {num_of_data_points}"
            )));
        }
        let scale = self.energy_scale().await?;
        let timestamp = timestamp.unwrap_or_else(|| Local::now().naive_local());
        self.set_time_for_historical_data_3(timestamp, num_of_data_points)
            .await?;

        let history =
            properties::decode_interval_history(&self.get_one(epc::HISTORICAL_3).await?)?;
        Ok(scale_interval_history(history, scale, 1))
    }
}

/// Apply the energy scale and synthesise slot timestamps, most recent
/// first, stepping back `minutes_per_slot` per entry.
fn scale_interval_history(
    history: properties::IntervalHistoryRaw,
    scale: f64,
    minutes_per_slot: i64,
) -> Vec<IntervalEnergy> {
    history
        .entries
        .iter()
        .enumerate()
        .map(|(i, (normal, reverse))| IntervalEnergy {
            timestamp: history.timestamp
                - chrono::Duration::minutes(minutes_per_slot * i as i64),
            normal_kwh: normal.map(|r| f64::from(r) * scale),
            reverse_kwh: reverse.map(|r| f64::from(r) * scale),
        })
        .collect()
}
