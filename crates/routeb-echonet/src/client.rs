//! ECHONET Lite request/response client over a Route-B session.
//!
//! [`EchonetClient`] correlates requests to responses by transaction id: a
//! pending map holds one `oneshot` sender per in-flight TID, and a
//! background reception task resolves them from the `ERXUDP` datagrams the
//! session fans out. Responses from unexpected sources, with a foreign
//! destination port, or with an unknown TID are dropped (logged at debug).
//!
//! A request whose deadline expires reclaims its TID and surfaces
//! [`Error::NeedToReopen`]: a dropped response is observationally
//! indistinguishable from a dead radio.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use routeb_core::error::{Error, Result};
use routeb_sk::dispatcher::SkIndication;
use routeb_sk::session::SessionManager;

use crate::frame::{EchonetFrame, Eoj, Esv, Property};

/// Destination UDP port for ECHONET Lite (3610).
pub const ECHONET_PORT: u16 = 0x0E1A;

type PendingMap = Arc<Mutex<HashMap<u16, oneshot::Sender<EchonetFrame>>>>;

/// Request/response ECHONET Lite exchange with the joined meter.
pub struct EchonetClient {
    session: Arc<SessionManager>,
    /// In-flight requests: TID -> oneshot resolved by the reception task.
    pending: PendingMap,
    /// Last allocated TID; allocation skips TIDs still in flight.
    next_tid: Arc<Mutex<u16>>,
    rx_task: JoinHandle<()>,
}

impl EchonetClient {
    /// Create a client over an open session and start the reception task.
    pub fn new(session: Arc<SessionManager>) -> Self {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let rx_task = tokio::spawn(rx_loop(
            session.subscribe_sk(),
            session.meter_addr().to_string(),
            Arc::clone(&pending),
        ));

        EchonetClient {
            session,
            pending,
            next_tid: Arc::new(Mutex::new(0)),
            rx_task,
        }
    }

    /// The session this client rides on.
    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Read one or more properties from the meter.
    ///
    /// All requested EPCs must be served; if the meter answers "not
    /// possible" the whole aggregate fails with
    /// [`Error::ResponseNotPossible`] naming the rejected EPCs.
    pub async fn get(&self, epcs: &[u8], deadline: Instant) -> Result<Vec<Property>> {
        if epcs.is_empty() {
            return Err(Error::InvalidParameter("no EPCs requested".into()));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let tid = self.allocate_tid(reply_tx).await;
        let frame = EchonetFrame::get_request(tid, epcs);
        self.send_and_await(frame, reply_rx, deadline).await
    }

    /// Write one or more properties with acknowledgement (SetC).
    pub async fn set(&self, props: Vec<Property>, deadline: Instant) -> Result<Vec<Property>> {
        if props.is_empty() {
            return Err(Error::InvalidParameter("no properties to set".into()));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let tid = self.allocate_tid(reply_tx).await;
        let frame = EchonetFrame::set_request(tid, props);
        self.send_and_await(frame, reply_rx, deadline).await
    }

    /// Allocate a TID not currently in flight and register the reply slot.
    async fn allocate_tid(&self, reply_tx: oneshot::Sender<EchonetFrame>) -> u16 {
        let mut pending = self.pending.lock().await;
        let mut next = self.next_tid.lock().await;
        loop {
            *next = next.wrapping_add(1);
            if !pending.contains_key(&*next) {
                pending.insert(*next, reply_tx);
                return *next;
            }
        }
    }

    async fn send_and_await(
        &self,
        frame: EchonetFrame,
        reply_rx: oneshot::Receiver<EchonetFrame>,
        deadline: Instant,
    ) -> Result<Vec<Property>> {
        let tid = frame.tid;
        debug!(
            tid = format!("{tid:04X}"),
            esv = ?frame.esv,
            epcs = format!("{:02X?}", frame.props.iter().map(|p| p.epc).collect::<Vec<_>>()),
            "sending ECHONET request"
        );

        if let Err(e) = self.session.transmit(&frame.encode(), deadline).await {
            self.pending.lock().await.remove(&tid);
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(response)) => match response.esv {
                Esv::GetRes | Esv::SetRes => Ok(response.props),
                Esv::GetSna => Err(Error::ResponseNotPossible {
                    // Rejected Get slots come back with empty data.
                    epcs: response
                        .props
                        .iter()
                        .filter(|p| p.edt.is_empty())
                        .map(|p| p.epc)
                        .collect(),
                }),
                Esv::SetSna => Err(Error::ResponseNotPossible {
                    // Rejected SetC slots echo the data back; accepted
                    // ones are emptied.
                    epcs: response
                        .props
                        .iter()
                        .filter(|p| !p.edt.is_empty())
                        .map(|p| p.epc)
                        .collect(),
                }),
                other => Err(Error::Protocol(format!(
                    "unexpected ESV {other:?} in response to TID {tid:04X}"
                ))),
            },
            Ok(Err(_)) => Err(Error::NeedToReopen(
                "the ECHONET reception task stopped".into(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&tid);
                // Indistinguishable from a dead radio.
                Err(Error::NeedToReopen(format!(
                    "no response from the meter for TID {tid:04X}"
                )))
            }
        }
    }
}

impl Drop for EchonetClient {
    fn drop(&mut self) {
        self.rx_task.abort();
    }
}

/// Reception task: resolve pending requests from `ERXUDP` datagrams.
async fn rx_loop(
    mut rx: broadcast::Receiver<SkIndication>,
    meter_addr: String,
    pending: PendingMap,
) {
    debug!("ECHONET reception task started");
    loop {
        let udp = match rx.recv().await {
            Ok(SkIndication::RxUdp(udp)) => udp,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "ECHONET reception task lagged behind the event bus");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if udp.lport != ECHONET_PORT || udp.side != 0 {
            continue;
        }
        if udp.sender != meter_addr {
            debug!(sender = %udp.sender, "dropping datagram from unexpected source");
            continue;
        }

        let frame = match EchonetFrame::decode(&udp.data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "dropping undecodable datagram");
                continue;
            }
        };
        if frame.seoj != Eoj::SMART_METER || frame.deoj != Eoj::CONTROLLER {
            debug!(seoj = ?frame.seoj, "dropping frame from a non-meter object");
            continue;
        }

        let mut pending = pending.lock().await;
        match pending.remove(&frame.tid) {
            Some(reply_tx) => {
                let _ = reply_tx.send(frame);
            }
            None => {
                debug!(
                    tid = format!("{:04X}", frame.tid),
                    "dropping response with no matching request"
                );
            }
        }
    }
    debug!("ECHONET reception task stopped");
}
