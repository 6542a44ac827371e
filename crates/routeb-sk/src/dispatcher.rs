//! Background reader task multiplexing SK command exchanges and events.
//!
//! The SK module is a half-duplex, line-oriented device: at most one
//! command may be outstanding, but unsolicited event lines (PANA
//! notifications, `ERXUDP` receptions, transmission-restriction notices)
//! can arrive at any time, including between a command and its response.
//!
//! This module provides a background task that owns the transport
//! exclusively. Commands are sent via an `mpsc` channel and responses
//! returned via `oneshot`, which serialises command exchanges by
//! construction. Every `EVENT`/`ERXUDP` line is fanned out to subscribers
//! through a broadcast channel, whether or not a command is in flight.
//! An unsolicited event never completes a command whose response rule does
//! not name it, and `ERXUDP` lines are never accumulated into a command
//! response.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use routeb_core::error::{Error, Result};
use routeb_core::transport::Transport;

use crate::protocol::{classify, LineFramer, PayloadMode, RxUdp, SkFrame, SkLine};

/// Broadcast channel capacity for event subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Timeout for a single idle read between commands.
const IDLE_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// An unsolicited indication fanned out to subscribers.
#[derive(Debug, Clone)]
pub enum SkIndication {
    /// An `EVENT <code>` line.
    Event {
        /// Event number (e.g. 0x25 for PANA establishment).
        code: u8,
        /// Source IPv6 address from the event line.
        sender: String,
        /// Optional event parameter.
        param: Option<u8>,
    },
    /// A received UDP datagram, payload attached.
    RxUdp(RxUdp),
    /// The reader task hit an unrecoverable transport error and exited.
    ReaderFailed(String),
}

/// Completion rule for a command exchange.
///
/// A response is complete when a received line starts with one of the
/// terminator prefixes. `FAIL` always aborts the exchange with
/// [`Error::CommandFailed`]; `ERXUDP` lines never match.
#[derive(Debug, Clone)]
pub struct ResponseRule {
    terminators: Vec<&'static str>,
}

impl ResponseRule {
    /// Complete on the `OK` status line. The common case.
    pub fn ok() -> Self {
        ResponseRule {
            terminators: vec!["OK"],
        }
    }

    /// Complete on a line starting with the given prefix.
    pub fn until(prefix: &'static str) -> Self {
        ResponseRule {
            terminators: vec![prefix],
        }
    }

    /// Complete on a line starting with any of the given prefixes.
    pub fn until_any(prefixes: &[&'static str]) -> Self {
        ResponseRule {
            terminators: prefixes.to_vec(),
        }
    }

    fn matches(&self, line: &str) -> bool {
        self.terminators.iter().any(|t| line.starts_with(t))
    }
}

/// A request sent to the reader task.
pub(crate) enum CommandRequest {
    /// An SK command to execute against the transport.
    Exec {
        cmd: Vec<u8>,
        rule: ResponseRule,
        timeout: Duration,
        response_tx: oneshot::Sender<Result<Vec<String>>>,
    },
    /// Reconfigure the framer's ERXUDP payload mode.
    SetPayloadMode {
        mode: PayloadMode,
        response_tx: oneshot::Sender<()>,
    },
    /// Close the transport and exit the reader task.
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

/// Handle to the background reader task.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct SkDispatcher {
    cmd_tx: mpsc::Sender<CommandRequest>,
    event_tx: broadcast::Sender<SkIndication>,
    /// Kept so the task is tied to the dispatcher's lifetime.
    #[allow(dead_code)]
    task_handle: JoinHandle<()>,
}

impl SkDispatcher {
    /// Spawn the reader task over the given transport.
    ///
    /// The task owns the transport exclusively until [`shutdown`] is
    /// called or the dispatcher is dropped.
    ///
    /// [`shutdown`]: SkDispatcher::shutdown
    pub fn spawn(transport: Box<dyn Transport>, mode: PayloadMode) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<CommandRequest>(16);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let task_handle = tokio::spawn(reader_loop(transport, cmd_rx, event_tx.clone(), mode));

        SkDispatcher {
            cmd_tx,
            event_tx,
            task_handle,
        }
    }

    /// Subscribe to unsolicited indications.
    ///
    /// Multiple subscribers can be created; each gets an independent copy
    /// of every indication.
    pub fn subscribe(&self) -> broadcast::Receiver<SkIndication> {
        self.event_tx.subscribe()
    }

    /// Execute a command and await its response lines.
    ///
    /// `timeout` bounds the whole exchange. On expiry the command is
    /// abandoned and [`Error::Timeout`] returned; the module is not assumed
    /// corrupted and subsequent commands remain permitted.
    pub async fn exec(
        &self,
        cmd: Vec<u8>,
        rule: ResponseRule,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let (response_tx, response_rx) = oneshot::channel();

        self.cmd_tx
            .send(CommandRequest::Exec {
                cmd,
                rule,
                timeout,
                response_tx,
            })
            .await
            .map_err(|_| Error::NotConnected)?;

        // The reader task always answers (a result or a timeout), or drops
        // the channel when it exits; queueing behind an in-flight scan can
        // legitimately take longer than this command's own timeout.
        match response_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::NotConnected), // reader task exited
        }
    }

    /// Reconfigure the framer's ERXUDP payload representation.
    pub async fn set_payload_mode(&self, mode: PayloadMode) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.cmd_tx
            .send(CommandRequest::SetPayloadMode { mode, response_tx })
            .await
            .map_err(|_| Error::NotConnected)?;
        response_rx.await.map_err(|_| Error::NotConnected)
    }

    /// Close the transport and stop the reader task.
    ///
    /// Idempotent; safe to call with the task already gone.
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(CommandRequest::Shutdown { response_tx })
            .await
            .is_ok()
        {
            // Bounded wait; the task may already have exited on error.
            let _ = tokio::time::timeout(Duration::from_secs(5), response_rx).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Reader loop
// ---------------------------------------------------------------------------

/// Whether an error means the transport is beyond recovery.
fn is_fatal(e: &Error) -> bool {
    matches!(
        e,
        Error::Io(_) | Error::Transport(_) | Error::NotConnected
    )
}

/// The main loop of the background reader task.
///
/// Uses `tokio::select! { biased; }` to prioritise command handling over
/// idle event reading.
async fn reader_loop(
    mut transport: Box<dyn Transport>,
    mut cmd_rx: mpsc::Receiver<CommandRequest>,
    event_tx: broadcast::Sender<SkIndication>,
    mode: PayloadMode,
) {
    let mut framer = LineFramer::new(mode);
    // ERXUDP header waiting for its binary payload run.
    let mut pending_rx: Option<RxUdp> = None;

    loop {
        // Publish anything still framed from the previous exchange: a
        // command completes at its terminator line, which may leave
        // trailing event lines (e.g. an ERXUDP delivered in the same
        // read) buffered.
        while let Some(frame) = framer.next_frame() {
            if let Some((_, line)) = publish_frame(frame, &mut pending_rx, &event_tx) {
                trace!(line = %line, "dropping line outside command context");
            }
        }

        tokio::select! {
            biased;

            // Priority: execute queued commands.
            req = cmd_rx.recv() => {
                match req {
                    Some(CommandRequest::Exec { cmd, rule, timeout, response_tx }) => {
                        let result = execute_command(
                            &mut *transport,
                            &mut framer,
                            &mut pending_rx,
                            &event_tx,
                            &cmd,
                            &rule,
                            timeout,
                        )
                        .await;
                        let fatal = matches!(&result, Err(e) if is_fatal(e));
                        let fatal_msg = match &result {
                            Err(e) if fatal => e.to_string(),
                            _ => String::new(),
                        };
                        let _ = response_tx.send(result);
                        if fatal {
                            warn!(error = %fatal_msg, "transport failed during command, reader exiting");
                            let _ = event_tx.send(SkIndication::ReaderFailed(fatal_msg));
                            break;
                        }
                    }
                    Some(CommandRequest::SetPayloadMode { mode, response_tx }) => {
                        debug!(?mode, "switching ERXUDP payload mode");
                        framer.set_mode(mode);
                        let _ = response_tx.send(());
                    }
                    Some(CommandRequest::Shutdown { response_tx }) => {
                        let _ = transport.close().await;
                        debug!("SK reader task shut down");
                        let _ = response_tx.send(());
                        break;
                    }
                    None => {
                        // All senders dropped -- the dispatcher was dropped.
                        let _ = transport.close().await;
                        debug!("SK command channel closed, reader exiting");
                        break;
                    }
                }
            }

            // Idle: read unsolicited lines from the module.
            read = async {
                let mut buf = [0u8; 1024];
                match transport.receive(&mut buf, IDLE_READ_TIMEOUT).await {
                    Ok(n) if n > 0 => Ok(Some(buf[..n].to_vec())),
                    Ok(_) => {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(None)
                    }
                    Err(Error::Timeout) => Ok(None),
                    Err(e) => Err(e),
                }
            } => {
                match read {
                    Ok(Some(bytes)) => {
                        framer.extend(&bytes);
                        while let Some(frame) = framer.next_frame() {
                            if let Some((_, line)) = publish_frame(frame, &mut pending_rx, &event_tx) {
                                trace!(line = %line, "dropping line outside command context");
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "transport failed in idle read, reader exiting");
                        let _ = event_tx.send(SkIndication::ReaderFailed(e.to_string()));
                        break;
                    }
                }
            }
        }
    }
}

/// Publish any indication carried by `frame` to the event bus.
///
/// Returns the classified line for frames that are candidates for command
/// response accumulation. `ERXUDP` headers and binary payload runs are
/// consumed here and never returned.
fn publish_frame(
    frame: SkFrame,
    pending_rx: &mut Option<RxUdp>,
    event_tx: &broadcast::Sender<SkIndication>,
) -> Option<(SkLine, String)> {
    match frame {
        SkFrame::Line(line) => {
            if line.is_empty() {
                return None;
            }
            trace!(line = %line, "<- SK");
            match classify(&line) {
                SkLine::RxUdp(rx) => {
                    if rx.data.is_empty() && rx.data_len > 0 {
                        // Binary mode: the payload run follows.
                        *pending_rx = Some(rx);
                    } else {
                        let _ = event_tx.send(SkIndication::RxUdp(rx));
                    }
                    None
                }
                SkLine::Event {
                    code,
                    sender,
                    param,
                } => {
                    let _ = event_tx.send(SkIndication::Event {
                        code,
                        sender: sender.clone(),
                        param,
                    });
                    Some((
                        SkLine::Event {
                            code,
                            sender,
                            param,
                        },
                        line,
                    ))
                }
                other => Some((other, line)),
            }
        }
        SkFrame::Payload(data) => {
            match pending_rx.take() {
                Some(mut rx) => {
                    rx.data = data;
                    let _ = event_tx.send(SkIndication::RxUdp(rx));
                }
                None => warn!("binary payload run with no pending ERXUDP header"),
            }
            None
        }
    }
}

/// Execute one command exchange on the transport.
async fn execute_command(
    transport: &mut dyn Transport,
    framer: &mut LineFramer,
    pending_rx: &mut Option<RxUdp>,
    event_tx: &broadcast::Sender<SkIndication>,
    cmd: &[u8],
    rule: &ResponseRule,
    timeout: Duration,
) -> Result<Vec<String>> {
    let printable = String::from_utf8_lossy(cmd);
    trace!(cmd = %printable.trim_end(), "-> SK");
    let deadline = Instant::now() + timeout;

    // The write itself counts against the deadline: a wedged serial
    // device must not hang the exchange forever.
    match tokio::time::timeout_at(deadline, transport.send(cmd)).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::Timeout),
    }
    let mut lines = Vec::new();
    let mut buf = [0u8; 1024];

    loop {
        // Drain whatever is already framed before reading more.
        while let Some(frame) = framer.next_frame() {
            if let Some((classified, line)) = publish_frame(frame, pending_rx, event_tx) {
                if let SkLine::Fail(code) = classified {
                    return Err(Error::CommandFailed(code));
                }
                let done = rule.matches(&line);
                lines.push(line);
                if done {
                    return Ok(lines);
                }
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout);
        }
        match transport.receive(&mut buf, deadline - now).await {
            Ok(n) if n > 0 => framer.extend(&buf[..n]),
            Ok(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            Err(Error::Timeout) => return Err(Error::Timeout),
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use routeb_test_harness::MockTransport;
    use std::sync::Arc;

    fn spawn_mock() -> (SkDispatcher, routeb_test_harness::MockController) {
        let mock = MockTransport::new();
        let ctrl = mock.controller();
        let dispatcher = SkDispatcher::spawn(Box::new(mock), PayloadMode::Ascii);
        (dispatcher, ctrl)
    }

    #[tokio::test]
    async fn exec_returns_lines_up_to_ok() {
        let (dispatcher, ctrl) = spawn_mock();
        ctrl.expect(b"SKVER\r\n", b"EVER 1.2.8\r\nOK\r\n");

        let lines = dispatcher
            .exec(b"SKVER\r\n".to_vec(), ResponseRule::ok(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(lines, vec!["EVER 1.2.8".to_string(), "OK".to_string()]);
    }

    #[tokio::test]
    async fn exec_fail_maps_to_command_failed() {
        let (dispatcher, ctrl) = spawn_mock();
        ctrl.expect(b"ROPT\r\n", b"FAIL ER04\r\n");

        let err = dispatcher
            .exec(b"ROPT\r\n".to_vec(), ResponseRule::ok(), Duration::from_secs(1))
            .await
            .unwrap_err();

        match err {
            Error::CommandFailed(code) => {
                assert_eq!(code, routeb_core::SkErrorCode::Unsupported)
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsolicited_event_does_not_complete_command() {
        let (dispatcher, ctrl) = spawn_mock();
        let mut events = dispatcher.subscribe();
        // A restriction notice lands between the command and its OK.
        ctrl.expect(
            b"SKVER\r\n",
            b"EVENT 32 FE80::1\r\nEVER 1.2.8\r\nOK\r\n",
        );

        let lines = dispatcher
            .exec(b"SKVER\r\n".to_vec(), ResponseRule::ok(), Duration::from_secs(1))
            .await
            .unwrap();

        // The event did not terminate the exchange early.
        assert_eq!(lines.last().unwrap(), "OK");
        assert_eq!(lines.len(), 3);

        // And it still reached the bus.
        match events.recv().await.unwrap() {
            SkIndication::Event { code, .. } => assert_eq!(code, 0x32),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn erxudp_routed_to_bus_not_response() {
        let (dispatcher, ctrl) = spawn_mock();
        let mut events = dispatcher.subscribe();
        ctrl.expect(
            b"SKVER\r\n",
            b"ERXUDP FE80::1 FE80::2 0E1A 0E1A 001D129100000001 4B 1 0 0004 10810001\r\nOK\r\n",
        );

        let lines = dispatcher
            .exec(b"SKVER\r\n".to_vec(), ResponseRule::ok(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(lines, vec!["OK".to_string()]);

        match events.recv().await.unwrap() {
            SkIndication::RxUdp(rx) => assert_eq!(rx.data, vec![0x10, 0x81, 0x00, 0x01]),
            other => panic!("expected RxUdp, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scan_rule_accumulates_until_event_22() {
        let (dispatcher, ctrl) = spawn_mock();
        ctrl.expect(
            b"SKSCAN 2 FFFFFFFF 6\r\n",
            b"OK\r\nEPANDESC\r\n  Channel:21\r\n  Pan ID:8888\r\n  Addr:001D129100000001\r\n  LQI:E1\r\nEVENT 22 FE80::1\r\n",
        );

        let lines = dispatcher
            .exec(
                b"SKSCAN 2 FFFFFFFF 6\r\n".to_vec(),
                ResponseRule::until("EVENT 22"),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert!(lines.first().unwrap().starts_with("OK"));
        assert!(lines.last().unwrap().starts_with("EVENT 22"));
        assert!(lines.iter().any(|l| l.contains("Channel:21")));
    }

    #[tokio::test]
    async fn timeout_is_not_fatal() {
        let (dispatcher, ctrl) = spawn_mock();
        // First command never gets a response.
        ctrl.expect(b"SKINFO\r\n", b"");
        ctrl.expect(b"SKVER\r\n", b"EVER 1.2.8\r\nOK\r\n");

        let err = dispatcher
            .exec(
                b"SKINFO\r\n".to_vec(),
                ResponseRule::ok(),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        // The module is not assumed corrupted; the next command works.
        let lines = dispatcher
            .exec(b"SKVER\r\n".to_vec(), ResponseRule::ok(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(lines.last().unwrap(), "OK");
    }

    #[tokio::test]
    async fn commands_are_serialised() {
        let (dispatcher, ctrl) = spawn_mock();
        ctrl.expect(b"SKVER\r\n", b"EVER 1.2.8\r\nOK\r\n");
        ctrl.expect(b"SKINFO\r\n", b"EINFO FE80::1 001D129100000001 21 8888 0\r\nOK\r\n");

        let dispatcher = Arc::new(dispatcher);
        let d1 = Arc::clone(&dispatcher);
        let d2 = Arc::clone(&dispatcher);

        // Expectations are strictly ordered, so interleaved writes would
        // fail the mock. Both completing proves one-at-a-time execution.
        let (r1, r2) = tokio::join!(
            d1.exec(b"SKVER\r\n".to_vec(), ResponseRule::ok(), Duration::from_secs(1)),
            d2.exec(b"SKINFO\r\n".to_vec(), ResponseRule::ok(), Duration::from_secs(1)),
        );
        r1.unwrap();
        r2.unwrap();

        let sent = ctrl.sent_data();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], b"SKVER\r\n");
        assert_eq!(sent[1], b"SKINFO\r\n");
    }

    #[tokio::test]
    async fn binary_payload_mode_pairs_header_and_run() {
        let mock = MockTransport::new();
        let ctrl = mock.controller();
        let dispatcher = SkDispatcher::spawn(Box::new(mock), PayloadMode::Binary);
        let mut events = dispatcher.subscribe();

        let mut bytes =
            b"ERXUDP FE80::1 FE80::2 0E1A 0E1A 001D129100000001 4B 1 0 0004\r\n".to_vec();
        bytes.extend_from_slice(&[0x10, 0x81, 0x0D, 0x0A]); // payload contains CRLF
        ctrl.inject(&bytes);

        match events.recv().await.unwrap() {
            SkIndication::RxUdp(rx) => {
                assert_eq!(rx.data, vec![0x10, 0x81, 0x0D, 0x0A]);
                assert_eq!(rx.data_len, 4);
            }
            other => panic!("expected RxUdp, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn injected_event_reaches_subscriber_between_commands() {
        let (dispatcher, ctrl) = spawn_mock();
        let mut events = dispatcher.subscribe();

        ctrl.inject_line("EVENT 33 FE80::1");

        match events.recv().await.unwrap() {
            SkIndication::Event { code, .. } => assert_eq!(code, 0x33),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_stops_reader() {
        let (dispatcher, _ctrl) = spawn_mock();
        dispatcher.shutdown().await;

        let err = dispatcher
            .exec(b"SKVER\r\n".to_vec(), ResponseRule::ok(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected | Error::Timeout));
    }
}
