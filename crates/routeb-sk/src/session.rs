//! Route-B session lifecycle: PAN discovery, PANA join/rejoin, and the
//! transmission gate.
//!
//! [`SessionManager::open`] drives the module through payload-mode
//! negotiation, credential registration, scan escalation, address
//! resolution, and PANA authentication, then spawns a monitor task that
//! tracks the session events the module pushes:
//!
//! - `EVENT 25` while joined marks the start of a re-authentication;
//!   a second `EVENT 25` marks its completion. The code is the same for
//!   both, so they are told apart by the current session state.
//! - `EVENT 29` (lifetime expired) and `EVENT 24` (authentication failure)
//!   trigger an active `SKJOIN` rejoin.
//! - `EVENT 32`/`EVENT 33` open and close the transmission-restriction
//!   window.
//!
//! All of these feed the transmission gate: a restriction counter that
//! admits outbound ECHONET traffic only at zero. Senders wait on the gate
//! with a caller-supplied deadline; exceeding it surfaces
//! [`Error::NeedToReopen`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use routeb_core::error::{Error, Result};
use routeb_core::events::SessionEvent;
use routeb_core::transport::Transport;
use routeb_core::types::{Credentials, PanDescriptor, SessionState};
use routeb_core::SkErrorCode;

use crate::dispatcher::SkIndication;
use crate::module::SkModule;
use crate::protocol::PayloadMode;

/// Capacity of the session event broadcast channel.
const SESSION_EVENT_CAPACITY: usize = 64;

/// Attempts an active rejoin makes before declaring the session dead.
const REJOIN_ATTEMPTS: u32 = 3;

/// Configuration for opening a Route-B session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Route-B ID and password.
    pub credentials: Credentials,
    /// Issue `SKRESET` at the start of open.
    pub reset_dev: bool,
    /// Scan passes before giving up; the duration exponent grows by one
    /// per empty pass. Three passes starting at 6 stay inside the
    /// ~2 minute envelope users expect.
    pub scan_attempts: u32,
    /// Initial `SKSCAN` duration exponent.
    pub scan_initial_duration: u8,
    /// How long one `SKJOIN` attempt may take (PANA retries included).
    pub join_timeout: Duration,
    /// Timeout for simple commands.
    pub command_timeout: Duration,
    /// `SKSENDTO` attempts per outbound datagram.
    pub send_retries: u32,
}

impl SessionConfig {
    /// Defaults for the given credentials.
    pub fn new(credentials: Credentials) -> Self {
        SessionConfig {
            credentials,
            reset_dev: true,
            scan_attempts: 3,
            scan_initial_duration: 6,
            join_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(10),
            send_retries: 3,
        }
    }
}

/// Estimated worst-case wall time for one scan pass.
///
/// Per-channel dwell is `9.6ms * (2^duration + 1)` across 28 channels.
fn scan_timeout(duration: u8) -> Duration {
    let dwell_ms = 9.6 * (((1u64 << duration.min(14)) + 1) as f64);
    Duration::from_millis((dwell_ms * 28.0) as u64) + Duration::from_secs(10)
}

// ---------------------------------------------------------------------------
// Transmission gate
// ---------------------------------------------------------------------------

/// Admission control mirroring the module's transmission-restriction
/// signalling.
///
/// The counter tracks overlapping restriction sources (re-authentication,
/// rate limiting, a stalled serial write); transmission is admitted only
/// at zero.
#[derive(Clone)]
pub(crate) struct TransmissionGate {
    restrictions: Arc<watch::Sender<u32>>,
}

impl TransmissionGate {
    fn new() -> Self {
        TransmissionGate {
            restrictions: Arc::new(watch::Sender::new(0)),
        }
    }

    fn close(&self) {
        self.restrictions.send_modify(|c| *c += 1);
        debug!(restrictions = *self.restrictions.borrow(), "transmission gate closed");
    }

    fn open(&self) {
        self.restrictions.send_modify(|c| *c = c.saturating_sub(1));
        debug!(restrictions = *self.restrictions.borrow(), "transmission gate opened");
    }

    fn force_open(&self) {
        self.restrictions.send_modify(|c| *c = 0);
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        *self.restrictions.borrow() == 0
    }

    async fn acquire_until(&self, deadline: Instant) -> Result<()> {
        let mut rx = self.restrictions.subscribe();
        let result = tokio::time::timeout_at(deadline, rx.wait_for(|c| *c == 0)).await;
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::NeedToReopen("session gate dropped".into())),
            Err(_) => Err(Error::NeedToReopen(
                "deadline exceeded waiting for the transmission gate".into(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

/// An open Route-B session: scan + join performed, monitor running.
///
/// Created by [`SessionManager::open`]; unusable after [`close`] or after
/// the session enters the failed state (both surface
/// [`Error::NeedToReopen`] from every operation).
///
/// [`close`]: SessionManager::close
pub struct SessionManager {
    sk: Arc<SkModule>,
    state: Arc<watch::Sender<SessionState>>,
    gate: TransmissionGate,
    events: broadcast::Sender<SessionEvent>,
    pan: PanDescriptor,
    meter_addr: String,
    monitor: JoinHandle<()>,
    command_timeout: Duration,
    send_retries: u32,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("pan", &self.pan)
            .field("meter_addr", &self.meter_addr)
            .field("command_timeout", &self.command_timeout)
            .field("send_retries", &self.send_retries)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Open a session over the given transport.
    ///
    /// Runs the full open sequence from `SKRESET` through `SKJOIN`. On any
    /// failure the transport is released before the error is returned;
    /// [`Error::ScanFailure`] and [`Error::JoinFailure`] are retryable on a
    /// fresh instance.
    pub async fn open(
        transport: Box<dyn Transport>,
        config: SessionConfig,
    ) -> Result<Arc<SessionManager>> {
        info!("opening a Route-B session");
        let sk = Arc::new(
            SkModule::new(transport, PayloadMode::Ascii)
                .with_command_timeout(config.command_timeout),
        );

        let (pan, meter_addr) = match Self::negotiate(&sk, &config).await {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "could not open the Route-B session");
                sk.shutdown().await;
                return Err(e);
            }
        };

        // Subscribe right after the join completes: the join's own
        // EVENT 25 has already been published, so the monitor starts with
        // a clean queue.
        let bus_rx = sk.subscribe();

        let state = Arc::new(watch::Sender::new(SessionState::Joined));
        let gate = TransmissionGate::new();
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        let ctx = MonitorContext {
            sk: Arc::clone(&sk),
            state: Arc::clone(&state),
            gate: gate.clone(),
            events: events.clone(),
            meter_addr: meter_addr.clone(),
            join_timeout: config.join_timeout,
            rejoin_active: Arc::new(AtomicBool::new(false)),
        };
        let monitor = tokio::spawn(monitor_loop(ctx, bus_rx));

        let _ = events.send(SessionEvent::Joined);
        info!("the Route-B session is open");

        Ok(Arc::new(SessionManager {
            sk,
            state,
            gate,
            events,
            pan,
            meter_addr,
            monitor,
            command_timeout: config.command_timeout,
            send_retries: config.send_retries.max(1),
            closed: AtomicBool::new(false),
        }))
    }

    /// The open sequence up to and including `SKJOIN`.
    async fn negotiate(
        sk: &Arc<SkModule>,
        config: &SessionConfig,
    ) -> Result<(PanDescriptor, String)> {
        if config.reset_dev {
            sk.skreset().await?;
        }

        // Received UDP payloads must arrive as hex ASCII. The WOPT write
        // is flash-persisted with a limited write count, so read first and
        // only write on mismatch. FAIL ER04 means ASCII-only firmware.
        match sk.ropt().await {
            Ok(PayloadMode::Ascii) => {}
            Ok(PayloadMode::Binary) => {
                warn!(
                    "module returns binary UDP payloads; writing WOPT 01 \
                     (persisted in module flash, this should happen once)"
                );
                sk.wopt(PayloadMode::Ascii).await?;
            }
            Err(Error::CommandFailed(SkErrorCode::Unsupported)) => {
                debug!("ROPT unsupported; assuming ASCII payload mode");
            }
            Err(e) => return Err(e),
        }

        // Annotate received packets with their RSSI.
        sk.sksreg("SA2", "1").await?;

        sk.sksetrbid(&config.credentials.rbid).await?;
        sk.sksetpwd(&config.credentials.password).await?;
        info!("Route-B ID and password registered");

        // Scan escalation: widen the per-channel dwell until a PAN answers.
        let mut duration = config.scan_initial_duration;
        let mut pans = Vec::new();
        for attempt in 1..=config.scan_attempts.max(1) {
            info!(attempt, duration, "scanning for the meter's PAN");
            pans = sk.skscan(duration, scan_timeout(duration)).await?;
            if !pans.is_empty() {
                break;
            }
            duration = duration.saturating_add(1);
        }
        let pan = pans.into_iter().max_by_key(|p| p.lqi).ok_or_else(|| {
            error!("gave up scanning; check the device location and the Route-B ID");
            Error::ScanFailure("no PAN discovered after scan escalation".into())
        })?;
        info!(
            channel = format!("{:02X}", pan.channel),
            pan_id = format!("{:04X}", pan.pan_id),
            rssi_dbm = pan.rssi_dbm(),
            "PAN found"
        );

        let meter_addr = sk.skll64(&pan.mac_hex()).await?;

        sk.sksreg("S2", &format!("{:X}", pan.channel)).await?;
        sk.sksreg("S3", &format!("{:X}", pan.pan_id)).await?;

        info!("starting PANA authentication");
        match sk.skjoin(&meter_addr, config.join_timeout).await {
            Ok(true) => {}
            Ok(false) => {
                error!("PANA authentication rejected; check the Route-B ID and password");
                return Err(Error::JoinFailure("PANA authentication rejected".into()));
            }
            Err(Error::Timeout) => {
                return Err(Error::JoinFailure("PANA authentication timed out".into()));
            }
            Err(e) => return Err(e),
        }
        info!("PANA session established");

        Ok((pan, meter_addr))
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// The PAN the session is joined to.
    pub fn pan(&self) -> &PanDescriptor {
        &self.pan
    }

    /// Link-local IPv6 address of the meter.
    pub fn meter_addr(&self) -> &str {
        &self.meter_addr
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Subscribe to raw SK indications (the ECHONET layer consumes
    /// `ERXUDP` receptions from here).
    pub fn subscribe_sk(&self) -> broadcast::Receiver<SkIndication> {
        self.sk.subscribe()
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NeedToReopen("the session has been closed".into()));
        }
        let current = *self.state.borrow();
        match current {
            SessionState::Failed => Err(Error::NeedToReopen(
                "the session has failed; close it and open a new one".into(),
            )),
            SessionState::Closed => Err(Error::NeedToReopen("the session has been closed".into())),
            _ => Ok(()),
        }
    }

    /// Send one UDP datagram to the meter, honouring the transmission gate.
    ///
    /// Waits for the gate to open (bounded by `deadline`), then issues
    /// `SKSENDTO`, retrying when the module asks for retransmission
    /// (`EVENT 21` param `01`) or rejects the command. A serial write that
    /// stalls beyond the command timeout closes the gate defensively; a
    /// later successful write reopens it.
    pub async fn transmit(&self, payload: &[u8], deadline: Instant) -> Result<()> {
        self.ensure_usable()?;

        let mut stalled = false;
        for attempt in 1..=self.send_retries {
            // After a stall the gate was closed by this very sender; only
            // other senders are held out while it retries.
            if !stalled {
                self.gate.acquire_until(deadline).await?;
            }
            self.ensure_usable()?;

            let send = self.sk.sksendto(&self.meter_addr, payload, self.command_timeout);
            // The dispatcher bounds the read side; this outer timeout
            // catches a write that never completes.
            match tokio::time::timeout(self.command_timeout * 2, send).await {
                Ok(Ok(tx_result)) => {
                    if stalled {
                        self.gate.open();
                        stalled = false;
                    }
                    match tx_result {
                        Some(0x01) => {
                            warn!(attempt, "module requests retransmission");
                            continue;
                        }
                        _ => return Ok(()),
                    }
                }
                Ok(Err(Error::CommandFailed(code))) => {
                    warn!(attempt, %code, "SKSENDTO rejected");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                Ok(Err(Error::Timeout)) => {
                    warn!(attempt, "SKSENDTO timed out");
                    continue;
                }
                Ok(Err(e)) => {
                    return Err(Error::NeedToReopen(format!("transmission failed: {e}")));
                }
                Err(_) => {
                    if !stalled {
                        self.gate.close();
                        stalled = true;
                    }
                    warn!(attempt, "serial write stalled; transmission gated");
                    continue;
                }
            }
        }

        error!("could not transmit a datagram; close the session and open it again");
        Err(Error::NeedToReopen("could not transmit the request".into()))
    }

    /// Close the session: best-effort `SKTERM`, stop the monitor, release
    /// the transport. Idempotent; all subsequent operations return
    /// [`Error::NeedToReopen`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing the Route-B session");

        let established = self.state.borrow().is_established();
        if established {
            if let Err(e) = self.sk.skterm().await {
                warn!(error = %e, "failed to terminate the PANA session");
            }
        }

        self.monitor.abort();
        self.state.send_replace(SessionState::Closed);
        // Release gate waiters; they observe the closed state and fail
        // with NeedToReopen.
        self.gate.force_open();
        let _ = self.events.send(SessionEvent::Terminated);

        self.sk.shutdown().await;
        info!("the Route-B session is closed");
    }
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

struct MonitorContext {
    sk: Arc<SkModule>,
    state: Arc<watch::Sender<SessionState>>,
    gate: TransmissionGate,
    events: broadcast::Sender<SessionEvent>,
    meter_addr: String,
    join_timeout: Duration,
    /// Guards against stacking rejoin tasks when the module repeats
    /// EVENT 24 during an ongoing rejoin.
    rejoin_active: Arc<AtomicBool>,
}

async fn monitor_loop(ctx: MonitorContext, mut rx: broadcast::Receiver<SkIndication>) {
    debug!("session monitor started");
    loop {
        let indication = match rx.recv().await {
            Ok(indication) => indication,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "session monitor lagged behind the event bus");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match indication {
            SkIndication::Event { code, .. } => handle_event(&ctx, code),
            SkIndication::ReaderFailed(msg) => {
                error!(error = %msg, "serial reader failed; the session is dead");
                ctx.state.send_replace(SessionState::Failed);
                ctx.gate.force_open();
                let _ = ctx.events.send(SessionEvent::Failed);
                break;
            }
            // The ECHONET layer has its own subscription for receptions.
            SkIndication::RxUdp(_) => {}
        }
    }
    debug!("session monitor stopped");
}

fn handle_event(ctx: &MonitorContext, code: u8) {
    // Copy the state out before acting: holding the watch read guard
    // across a send_replace would deadlock.
    let current = *ctx.state.borrow();
    match code {
        0x25 => match current {
            SessionState::Joined => {
                info!("PANA re-authentication started; gating transmission");
                ctx.state.send_replace(SessionState::Rejoining);
                ctx.gate.close();
                let _ = ctx.events.send(SessionEvent::ReauthStarted);
            }
            SessionState::Rejoining => {
                info!("PANA re-authentication completed");
                ctx.state.send_replace(SessionState::Joined);
                ctx.gate.open();
                let _ = ctx.events.send(SessionEvent::ReauthCompleted);
            }
            _ => {}
        },
        0x24 => {
            warn!("PANA authentication failure reported");
            begin_active_rejoin(ctx);
        }
        0x29 => {
            info!("PANA session lifetime expired; rejoining");
            let _ = ctx.events.send(SessionEvent::SessionExpired);
            begin_active_rejoin(ctx);
        }
        0x26 => {
            // Termination request from the meter. Left to the lifetime
            // machinery: the follow-up EVENT 29 drives the rejoin.
            warn!("the meter requested session termination");
        }
        0x27 | 0x28 => {
            debug!("PANA session termination acknowledged");
        }
        0x32 => {
            warn!("transmission restriction entered");
            ctx.gate.close();
            let _ = ctx.events.send(SessionEvent::TransmissionRestricted);
        }
        0x33 => {
            info!("transmission restriction lifted");
            ctx.gate.open();
            let _ = ctx.events.send(SessionEvent::TransmissionReleased);
        }
        // Scan results and UDP transmission results are consumed by the
        // command exchanges that solicit them.
        0x20 | 0x21 | 0x22 | 0x02 => {}
        _ => debug!(code = format!("{code:02X}"), "unhandled SK event"),
    }
}

/// Close the gate and drive `SKJOIN` from a helper task.
///
/// Completion is observed through the `EVENT 25` the monitor receives,
/// keeping all gate accounting in the monitor; the helper only latches the
/// failed state when every attempt is rejected.
fn begin_active_rejoin(ctx: &MonitorContext) {
    let current = *ctx.state.borrow();
    match current {
        SessionState::Failed | SessionState::Closed => return,
        SessionState::Joined => {
            ctx.state.send_replace(SessionState::Rejoining);
            ctx.gate.close();
        }
        _ => {}
    }

    if ctx.rejoin_active.swap(true, Ordering::SeqCst) {
        return; // a rejoin task is already driving SKJOIN
    }

    let sk = Arc::clone(&ctx.sk);
    let state = Arc::clone(&ctx.state);
    let gate = ctx.gate.clone();
    let events = ctx.events.clone();
    let meter_addr = ctx.meter_addr.clone();
    let join_timeout = ctx.join_timeout;
    let rejoin_active = Arc::clone(&ctx.rejoin_active);

    tokio::spawn(async move {
        let mut rejoined = false;
        for attempt in 1..=REJOIN_ATTEMPTS {
            debug!(attempt, "rejoin attempt");
            match sk.skjoin(&meter_addr, join_timeout).await {
                Ok(true) => {
                    rejoined = true;
                    break;
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!(attempt, error = %e, "rejoin attempt failed");
                    continue;
                }
            }
        }
        rejoin_active.store(false, Ordering::SeqCst);
        if !rejoined {
            error!("could not rejoin the PAN; close the session and open it again");
            state.send_replace(SessionState::Failed);
            gate.force_open();
            let _ = events.send(SessionEvent::Failed);
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use routeb_test_harness::{MockController, MockTransport};

    const RBID: &str = "00112233445566778899AABBCCDDEEFF";
    const PWD: &str = "0123456789AB";
    const METER_ADDR: &str = "FE80:0000:0000:0000:021D:1291:0000:0001";

    fn test_config() -> SessionConfig {
        let mut config = SessionConfig::new(Credentials::new(RBID, PWD));
        config.command_timeout = Duration::from_millis(500);
        config.join_timeout = Duration::from_millis(500);
        config
    }

    const PAN_BLOCK: &[u8] = b"OK\r\nEVENT 20 FE80::1\r\nEPANDESC\r\n  Channel:21\r\n  Channel Page:09\r\n  Pan ID:8888\r\n  Addr:001D129100000001\r\n  LQI:E1\r\n  PairID:01234567\r\nEVENT 22 FE80::1\r\n";

    /// Script everything after the scan: SKLL64, registers, SKJOIN.
    fn script_post_scan(ctrl: &MockController) {
        ctrl.expect(
            b"SKLL64 001D129100000001\r\n",
            format!("{METER_ADDR}\r\n").as_bytes(),
        );
        ctrl.expect(b"SKSREG S2 21\r\n", b"OK\r\n");
        ctrl.expect(b"SKSREG S3 8888\r\n", b"OK\r\n");
        ctrl.expect(
            format!("SKJOIN {METER_ADDR}\r\n").as_bytes(),
            format!("OK\r\nEVENT 25 {METER_ADDR}\r\n").as_bytes(),
        );
    }

    /// Script a complete happy-path open with a first-scan hit.
    fn script_open(ctrl: &MockController) {
        ctrl.expect(b"SKRESET\r\n", b"OK\r\n");
        ctrl.expect(b"ROPT\r\n", b"OK 01\r\n");
        ctrl.expect(b"SKSREG SA2 1\r\n", b"OK\r\n");
        ctrl.expect(format!("SKSETRBID {RBID}\r\n").as_bytes(), b"OK\r\n");
        ctrl.expect(format!("SKSETPWD C {PWD}\r\n").as_bytes(), b"OK\r\n");
        ctrl.expect(b"SKSCAN 2 FFFFFFFF 6\r\n", PAN_BLOCK);
        script_post_scan(ctrl);
    }

    async fn open_session() -> (Arc<SessionManager>, MockController) {
        let mock = MockTransport::new();
        let ctrl = mock.controller();
        script_open(&ctrl);
        let session = SessionManager::open(Box::new(mock), test_config())
            .await
            .unwrap();
        (session, ctrl)
    }

    #[tokio::test]
    async fn open_happy_path() {
        let (session, _ctrl) = open_session().await;
        assert_eq!(session.state(), SessionState::Joined);
        assert_eq!(session.meter_addr(), METER_ADDR);
        assert_eq!(session.pan().channel, 0x21);
        assert_eq!(session.pan().pan_id, 0x8888);
        session.close().await;
    }

    #[tokio::test]
    async fn scan_escalation_widens_duration_and_writes_registers() {
        let mock = MockTransport::new();
        let ctrl = mock.controller();

        ctrl.expect(b"SKRESET\r\n", b"OK\r\n");
        ctrl.expect(b"ROPT\r\n", b"OK 01\r\n");
        ctrl.expect(b"SKSREG SA2 1\r\n", b"OK\r\n");
        ctrl.expect(format!("SKSETRBID {RBID}\r\n").as_bytes(), b"OK\r\n");
        ctrl.expect(format!("SKSETPWD C {PWD}\r\n").as_bytes(), b"OK\r\n");
        // Two empty passes, then the PAN answers on duration 8.
        ctrl.expect(b"SKSCAN 2 FFFFFFFF 6\r\n", b"OK\r\nEVENT 22 FE80::1\r\n");
        ctrl.expect(b"SKSCAN 2 FFFFFFFF 7\r\n", b"OK\r\nEVENT 22 FE80::1\r\n");
        ctrl.expect(b"SKSCAN 2 FFFFFFFF 8\r\n", PAN_BLOCK);
        script_post_scan(&ctrl);

        let session = SessionManager::open(Box::new(mock), test_config())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Joined);

        // The channel and PAN id registers were written from the descriptor.
        let sent = ctrl.sent_data();
        assert!(sent.iter().any(|c| c == b"SKSREG S2 21\r\n"));
        assert!(sent.iter().any(|c| c == b"SKSREG S3 8888\r\n"));
        session.close().await;
    }

    #[tokio::test]
    async fn scan_failure_after_all_attempts() {
        let mock = MockTransport::new();
        let ctrl = mock.controller();

        ctrl.expect(b"SKRESET\r\n", b"OK\r\n");
        ctrl.expect(b"ROPT\r\n", b"OK 01\r\n");
        ctrl.expect(b"SKSREG SA2 1\r\n", b"OK\r\n");
        ctrl.expect(format!("SKSETRBID {RBID}\r\n").as_bytes(), b"OK\r\n");
        ctrl.expect(format!("SKSETPWD C {PWD}\r\n").as_bytes(), b"OK\r\n");
        ctrl.expect(b"SKSCAN 2 FFFFFFFF 6\r\n", b"OK\r\nEVENT 22 FE80::1\r\n");
        ctrl.expect(b"SKSCAN 2 FFFFFFFF 7\r\n", b"OK\r\nEVENT 22 FE80::1\r\n");
        ctrl.expect(b"SKSCAN 2 FFFFFFFF 8\r\n", b"OK\r\nEVENT 22 FE80::1\r\n");

        let err = SessionManager::open(Box::new(mock), test_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScanFailure(_)));
    }

    #[tokio::test]
    async fn ropt_unsupported_skips_wopt() {
        let mock = MockTransport::new();
        let ctrl = mock.controller();

        ctrl.expect(b"SKRESET\r\n", b"OK\r\n");
        ctrl.expect(b"ROPT\r\n", b"FAIL ER04\r\n");
        ctrl.expect(b"SKSREG SA2 1\r\n", b"OK\r\n");
        ctrl.expect(format!("SKSETRBID {RBID}\r\n").as_bytes(), b"OK\r\n");
        ctrl.expect(format!("SKSETPWD C {PWD}\r\n").as_bytes(), b"OK\r\n");
        ctrl.expect(b"SKSCAN 2 FFFFFFFF 6\r\n", PAN_BLOCK);
        script_post_scan(&ctrl);

        let session = SessionManager::open(Box::new(mock), test_config())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Joined);

        // WOPT must not have been written.
        assert!(!ctrl
            .sent_data()
            .iter()
            .any(|c| c.starts_with(b"WOPT")));
        session.close().await;
    }

    #[tokio::test]
    async fn ropt_binary_mode_writes_wopt_once() {
        let mock = MockTransport::new();
        let ctrl = mock.controller();

        ctrl.expect(b"SKRESET\r\n", b"OK\r\n");
        ctrl.expect(b"ROPT\r\n", b"OK 00\r\n");
        ctrl.expect(b"WOPT 01\r\n", b"OK\r\n");
        ctrl.expect(b"SKSREG SA2 1\r\n", b"OK\r\n");
        ctrl.expect(format!("SKSETRBID {RBID}\r\n").as_bytes(), b"OK\r\n");
        ctrl.expect(format!("SKSETPWD C {PWD}\r\n").as_bytes(), b"OK\r\n");
        ctrl.expect(b"SKSCAN 2 FFFFFFFF 6\r\n", PAN_BLOCK);
        script_post_scan(&ctrl);

        let session = SessionManager::open(Box::new(mock), test_config())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Joined);
        session.close().await;
    }

    #[tokio::test]
    async fn join_rejection_is_join_failure() {
        let mock = MockTransport::new();
        let ctrl = mock.controller();

        ctrl.expect(b"SKRESET\r\n", b"OK\r\n");
        ctrl.expect(b"ROPT\r\n", b"OK 01\r\n");
        ctrl.expect(b"SKSREG SA2 1\r\n", b"OK\r\n");
        ctrl.expect(format!("SKSETRBID {RBID}\r\n").as_bytes(), b"OK\r\n");
        ctrl.expect(format!("SKSETPWD C {PWD}\r\n").as_bytes(), b"OK\r\n");
        ctrl.expect(b"SKSCAN 2 FFFFFFFF 6\r\n", PAN_BLOCK);
        ctrl.expect(
            b"SKLL64 001D129100000001\r\n",
            format!("{METER_ADDR}\r\n").as_bytes(),
        );
        ctrl.expect(b"SKSREG S2 21\r\n", b"OK\r\n");
        ctrl.expect(b"SKSREG S3 8888\r\n", b"OK\r\n");
        ctrl.expect(
            format!("SKJOIN {METER_ADDR}\r\n").as_bytes(),
            format!("OK\r\nEVENT 24 {METER_ADDR}\r\n").as_bytes(),
        );

        let err = SessionManager::open(Box::new(mock), test_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JoinFailure(_)));
    }

    #[tokio::test]
    async fn transmit_sends_through_gate() {
        let (session, ctrl) = open_session().await;

        ctrl.expect(
            b"SKSENDTO 1 FE80:0000:0000:0000:021D:1291:0000:0001 0E1A 1 0 0002 1081\r\n",
            format!("EVENT 21 {METER_ADDR} 00\r\nOK\r\n").as_bytes(),
        );

        let deadline = Instant::now() + Duration::from_secs(1);
        session.transmit(&[0x10, 0x81], deadline).await.unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn restriction_gates_transmission_until_lifted() {
        let (session, ctrl) = open_session().await;
        let mut events = session.subscribe();

        ctrl.inject_line(&format!("EVENT 32 {METER_ADDR}"));
        // Wait for the monitor to close the gate.
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::TransmissionRestricted => break,
                _ => continue,
            }
        }

        // A transmit with a short deadline must give up without the
        // datagram ever reaching the wire.
        let deadline = Instant::now() + Duration::from_millis(100);
        let err = session.transmit(&[0x10, 0x81], deadline).await.unwrap_err();
        assert!(matches!(err, Error::NeedToReopen(_)));
        assert!(!ctrl
            .sent_data()
            .iter()
            .any(|c| c.starts_with(b"SKSENDTO")));

        // Lift the restriction; a queued sender goes through.
        ctrl.expect(
            b"SKSENDTO 1 FE80:0000:0000:0000:021D:1291:0000:0001 0E1A 1 0 0002 1081\r\n",
            format!("EVENT 21 {METER_ADDR} 00\r\nOK\r\n").as_bytes(),
        );
        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(2);
                session.transmit(&[0x10, 0x81], deadline).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctrl.inject_line(&format!("EVENT 33 {METER_ADDR}"));

        pending.await.unwrap().unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn reauth_blocks_transmission_until_second_event_25() {
        let (session, ctrl) = open_session().await;
        let mut events = session.subscribe();

        // First EVENT 25 while joined: re-authentication started.
        ctrl.inject_line(&format!("EVENT 25 {METER_ADDR}"));
        loop {
            match events.recv().await.unwrap() {
                SessionEvent::ReauthStarted => break,
                _ => continue,
            }
        }
        assert_eq!(session.state(), SessionState::Rejoining);

        // Queue a sender; it must block until the second EVENT 25.
        ctrl.expect(
            b"SKSENDTO 1 FE80:0000:0000:0000:021D:1291:0000:0001 0E1A 1 0 0002 1081\r\n",
            format!("EVENT 21 {METER_ADDR} 00\r\nOK\r\n").as_bytes(),
        );
        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(2);
                session.transmit(&[0x10, 0x81], deadline).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ctrl
            .sent_data()
            .iter()
            .any(|c| c.starts_with(b"SKSENDTO")));

        // Second EVENT 25: re-authentication completed.
        ctrl.inject_line(&format!("EVENT 25 {METER_ADDR}"));
        pending.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Joined);
        session.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_terminates() {
        let (session, ctrl) = open_session().await;
        ctrl.expect(
            b"SKTERM\r\n",
            format!("OK\r\nEVENT 27 {METER_ADDR}\r\n").as_bytes(),
        );

        session.close().await;
        session.close().await;

        assert!(ctrl.sent_data().iter().any(|c| c == b"SKTERM\r\n"));

        let deadline = Instant::now() + Duration::from_millis(100);
        let err = session.transmit(&[0x10, 0x81], deadline).await.unwrap_err();
        assert!(matches!(err, Error::NeedToReopen(_)));
    }

    #[tokio::test]
    async fn gate_counter_balances_overlapping_restrictions() {
        let gate = TransmissionGate::new();
        assert!(gate.is_open());
        gate.close();
        gate.close();
        gate.open();
        assert!(!gate.is_open());
        gate.open();
        assert!(gate.is_open());
        // Unbalanced opens clamp at zero.
        gate.open();
        assert!(gate.is_open());
    }
}
