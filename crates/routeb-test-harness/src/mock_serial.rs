//! Mock transport for deterministic testing of the SK protocol stack.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs, so command framing and response matching can be
//! tested without real hardware. On top of the scripted exchanges, a
//! [`MockController`] handle can inject unsolicited lines (PANA events,
//! `ERXUDP` receptions) at any point, which is how the event-driven session
//! behaviour is exercised.
//!
//! # Example
//!
//! ```
//! use routeb_test_harness::MockTransport;
//!
//! let mock = MockTransport::new();
//! let ctrl = mock.controller();
//! // Pre-load: when the driver sends this command, return this response.
//! ctrl.expect(b"SKVER\r\n", b"EVER 1.2.8\r\nOK\r\n");
//! // Later, from the test body:
//! ctrl.inject_line("EVENT 32 FE80:0000:0000:0000:021D:1290:1234:5678");
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use routeb_core::error::{Error, Result};
use routeb_core::transport::Transport;

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// The bytes to return when the matching request is received.
    response: Vec<u8>,
}

#[derive(Default)]
struct Shared {
    /// Ordered queue of expected request/response pairs.
    expectations: Mutex<VecDeque<Expectation>>,
    /// Bytes queued for delivery: scripted responses and injected lines,
    /// in arrival order.
    rx_queue: Mutex<VecDeque<Vec<u8>>>,
    /// Log of all bytes sent through this transport.
    sent_log: Mutex<Vec<Vec<u8>>>,
    /// Whether the transport is "connected".
    connected: AtomicBool,
    /// Wakes pending `receive()` calls when new rx data arrives.
    rx_notify: Notify,
}

/// Handle for scripting a [`MockTransport`] from test code.
///
/// Cloneable and usable after the transport itself has been moved into the
/// background reader task.
#[derive(Clone)]
pub struct MockController {
    shared: Arc<Shared>,
}

impl MockController {
    /// Add an expected request/response pair.
    ///
    /// When `send()` is called with data matching `request`, `response` is
    /// queued for delivery by subsequent `receive()` calls.
    pub fn expect(&self, request: &[u8], response: &[u8]) {
        self.shared
            .expectations
            .lock()
            .unwrap()
            .push_back(Expectation {
                request: request.to_vec(),
                response: response.to_vec(),
            });
    }

    /// Queue raw bytes for delivery as if the module had sent them
    /// unsolicited.
    pub fn inject(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.shared.rx_queue.lock().unwrap().push_back(data.to_vec());
        self.shared.rx_notify.notify_waiters();
    }

    /// Queue a single CRLF-terminated line for unsolicited delivery.
    pub fn inject_line(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        self.inject(&bytes);
    }

    /// Return a copy of all data that has been sent through this transport.
    ///
    /// Each element is the byte slice from one `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.shared.sent_log.lock().unwrap().clone()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.shared.expectations.lock().unwrap().len()
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls will
    /// return [`Error::NotConnected`].
    pub fn set_connected(&self, connected: bool) {
        self.shared.connected.store(connected, Ordering::SeqCst);
        self.shared.rx_notify.notify_waiters();
    }
}

/// A mock [`Transport`] for testing the protocol stack without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation; the paired
/// response is queued for delivery. Injected lines share the same delivery
/// queue, preserving arrival order.
pub struct MockTransport {
    shared: Arc<Shared>,
    /// Cursor into the buffer currently being drained by `receive()`.
    current: Option<(Vec<u8>, usize)>,
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            ..Shared::default()
        });
        MockTransport {
            shared,
            current: None,
        }
    }

    /// Obtain a [`MockController`] for scripting this transport.
    pub fn controller(&self) -> MockController {
        MockController {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        self.shared.sent_log.lock().unwrap().push(data.to_vec());

        // Match against the next expectation.
        let expectation = self.shared.expectations.lock().unwrap().pop_front();
        if let Some(expectation) = expectation {
            if data != expectation.request.as_slice() {
                return Err(Error::Protocol(format!(
                    "unexpected send data: expected {:02X?}, got {:02X?}",
                    expectation.request, data
                )));
            }
            if !expectation.response.is_empty() {
                self.shared
                    .rx_queue
                    .lock()
                    .unwrap()
                    .push_back(expectation.response);
                self.shared.rx_notify.notify_waiters();
            }
            Ok(())
        } else {
            Err(Error::Protocol(
                "no more expectations in mock transport".into(),
            ))
        }
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if !self.shared.connected.load(Ordering::SeqCst) {
                return Err(Error::NotConnected);
            }

            // Register for wakeups before checking the queue, so an
            // injection racing this check is not missed.
            let notified = self.shared.rx_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Drain the buffer in flight first, then pull the next queued one.
            if self.current.is_none() {
                self.current = self
                    .shared
                    .rx_queue
                    .lock()
                    .unwrap()
                    .pop_front()
                    .map(|data| (data, 0));
            }

            if let Some((data, cursor)) = self.current.as_mut() {
                let remaining = &data[*cursor..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                *cursor += n;
                if *cursor >= data.len() {
                    self.current = None;
                }
                return Ok(n);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Err(Error::Timeout),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.current = None;
        self.shared.rx_queue.lock().unwrap().clear();
        self.shared.rx_notify.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}
