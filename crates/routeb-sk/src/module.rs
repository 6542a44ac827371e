//! Typed command surface over the SK dispatcher.
//!
//! [`SkModule`] exposes one async method per SK command, pairing each
//! command with its completion rule and decoding the data-bearing response
//! lines. The session manager composes these into the open/join/rejoin
//! sequences; nothing here knows about session state.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use routeb_core::error::{Error, Result};
use routeb_core::transport::Transport;
use routeb_core::types::PanDescriptor;

use crate::commands;
use crate::dispatcher::{ResponseRule, SkDispatcher, SkIndication};
use crate::protocol::PayloadMode;

pub use crate::commands::ModuleInfo as SkInfo;

/// Default timeout for simple register/status commands.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// A serial-attached SK module with a typed command API.
pub struct SkModule {
    dispatcher: SkDispatcher,
    command_timeout: Duration,
}

impl SkModule {
    /// Take ownership of a transport and start the background reader.
    pub fn new(transport: Box<dyn Transport>, mode: PayloadMode) -> Self {
        SkModule {
            dispatcher: SkDispatcher::spawn(transport, mode),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Override the timeout used for simple commands.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Subscribe to unsolicited indications (events, UDP receptions).
    pub fn subscribe(&self) -> broadcast::Receiver<SkIndication> {
        self.dispatcher.subscribe()
    }

    /// Close the transport and stop the reader task.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    async fn exec_ok(&self, cmd: Vec<u8>) -> Result<Vec<String>> {
        self.dispatcher
            .exec(cmd, ResponseRule::ok(), self.command_timeout)
            .await
    }

    /// `SKVER` -- SKSTACK firmware version.
    pub async fn skver(&self) -> Result<String> {
        let lines = self.exec_ok(commands::skver()).await?;
        commands::parse_ever(&lines)
    }

    /// `SKAPPVER` -- application firmware version.
    pub async fn skappver(&self) -> Result<String> {
        let lines = self.exec_ok(commands::skappver()).await?;
        commands::parse_eappver(&lines)
    }

    /// `SKINFO` -- current address, channel, and PAN id.
    pub async fn skinfo(&self) -> Result<SkInfo> {
        let lines = self.exec_ok(commands::skinfo()).await?;
        commands::parse_einfo(&lines)
    }

    /// `SKRESET` -- software-reset the module.
    pub async fn skreset(&self) -> Result<()> {
        self.exec_ok(commands::skreset()).await.map(|_| ())
    }

    /// `ROPT` -- read the ERXUDP payload representation.
    ///
    /// Propagates `FAIL ER04` as
    /// [`Error::CommandFailed`]`(`[`SkErrorCode::Unsupported`](routeb_core::SkErrorCode::Unsupported)`)`
    /// so the caller can treat ASCII-only firmware specially.
    pub async fn ropt(&self) -> Result<PayloadMode> {
        let lines = self.exec_ok(commands::ropt()).await?;
        commands::parse_ropt_mode(&lines)
    }

    /// `WOPT` -- write the ERXUDP payload representation.
    ///
    /// Persisted in module flash with a limited write count; callers should
    /// read the current mode first and only write on mismatch.
    pub async fn wopt(&self, mode: PayloadMode) -> Result<()> {
        debug!(?mode, "writing ERXUDP payload mode to module flash");
        self.exec_ok(commands::wopt(mode)).await.map(|_| ())
    }

    /// Reconfigure the local framer (not the module) for a payload mode.
    pub async fn set_payload_mode(&self, mode: PayloadMode) -> Result<()> {
        self.dispatcher.set_payload_mode(mode).await
    }

    /// `SKSREG` -- write a virtual register.
    pub async fn sksreg(&self, register: &str, value: &str) -> Result<()> {
        self.exec_ok(commands::sksreg(register, value))
            .await
            .map(|_| ())
    }

    /// `SKSETRBID` -- register the Route-B authentication ID.
    pub async fn sksetrbid(&self, rbid: &str) -> Result<()> {
        self.exec_ok(commands::sksetrbid(rbid)).await.map(|_| ())
    }

    /// `SKSETPWD` -- register the Route-B password.
    pub async fn sksetpwd(&self, password: &str) -> Result<()> {
        self.exec_ok(commands::sksetpwd(password)).await.map(|_| ())
    }

    /// `SKSCAN` -- one active scan pass with the given duration exponent.
    ///
    /// Completes on `EVENT 22`; returns the PAN descriptors collected from
    /// the `EPANDESC` blocks, which may be empty.
    pub async fn skscan(&self, duration: u8, timeout: Duration) -> Result<Vec<PanDescriptor>> {
        let lines = self
            .dispatcher
            .exec(
                commands::skscan(duration),
                ResponseRule::until("EVENT 22"),
                timeout,
            )
            .await?;
        Ok(commands::parse_pan_descriptors(&lines))
    }

    /// `SKLL64` -- derive the link-local IPv6 address for a MAC address.
    pub async fn skll64(&self, mac_hex: &str) -> Result<String> {
        let lines = self
            .dispatcher
            .exec(
                commands::skll64(mac_hex),
                ResponseRule::until("FE80:"),
                self.command_timeout,
            )
            .await?;
        commands::parse_ll64(&lines)
    }

    /// `SKJOIN` -- one PANA authentication attempt.
    ///
    /// Completes on `EVENT 25` (success, returns `true`) or `EVENT 24`
    /// (rejection, returns `false`).
    pub async fn skjoin(&self, ipv6: &str, timeout: Duration) -> Result<bool> {
        let lines = self
            .dispatcher
            .exec(
                commands::skjoin(ipv6),
                ResponseRule::until_any(&["EVENT 24", "EVENT 25"]),
                timeout,
            )
            .await?;
        Ok(lines
            .last()
            .map(|l| l.starts_with("EVENT 25"))
            .unwrap_or(false))
    }

    /// `SKTERM` -- terminate the PANA session.
    ///
    /// Completes on `EVENT 27` (terminated) or `EVENT 28` (no session to
    /// terminate; logged, not an error).
    pub async fn skterm(&self) -> Result<()> {
        let lines = self
            .dispatcher
            .exec(
                commands::skterm(),
                ResponseRule::until_any(&["EVENT 27", "EVENT 28"]),
                self.command_timeout,
            )
            .await?;
        if lines.last().map(|l| l.starts_with("EVENT 28")).unwrap_or(false) {
            tracing::warn!("there was no PANA session to terminate");
        }
        Ok(())
    }

    /// `SKSENDTO` -- send a UDP datagram to the meter's ECHONET port.
    ///
    /// Returns the `EVENT 21` transmission result if the module reported
    /// one before `OK` (`0x00` delivered, `0x01` retransmission needed,
    /// `0x02` neighbour solicitation).
    pub async fn sksendto(
        &self,
        ipv6: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Option<u8>> {
        if payload.is_empty() {
            return Err(Error::InvalidParameter("empty UDP payload".into()));
        }
        let lines = self
            .dispatcher
            .exec(
                commands::sksendto(ipv6, payload),
                ResponseRule::ok(),
                timeout,
            )
            .await?;
        Ok(commands::parse_udp_tx_result(&lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routeb_core::SkErrorCode;
    use routeb_test_harness::MockTransport;

    fn mock_module() -> (SkModule, routeb_test_harness::MockController) {
        let mock = MockTransport::new();
        let ctrl = mock.controller();
        let module = SkModule::new(Box::new(mock), PayloadMode::Ascii)
            .with_command_timeout(Duration::from_secs(1));
        (module, ctrl)
    }

    #[tokio::test]
    async fn skver_parses_stack_version() {
        let (module, ctrl) = mock_module();
        ctrl.expect(b"SKVER\r\n", b"EVER 1.2.8\r\nOK\r\n");
        assert_eq!(module.skver().await.unwrap(), "1.2.8");
    }

    #[tokio::test]
    async fn skinfo_parses_module_info() {
        let (module, ctrl) = mock_module();
        ctrl.expect(
            b"SKINFO\r\n",
            b"EINFO FE80:0000:0000:0000:021D:1291:0000:0001 001D129100000001 21 8888 0\r\nOK\r\n",
        );
        let info = module.skinfo().await.unwrap();
        assert_eq!(info.channel, 0x21);
        assert_eq!(info.pan_id, 0x8888);
    }

    #[tokio::test]
    async fn ropt_unsupported_propagates_er04() {
        let (module, ctrl) = mock_module();
        ctrl.expect(b"ROPT\r\n", b"FAIL ER04\r\n");
        match module.ropt().await.unwrap_err() {
            Error::CommandFailed(SkErrorCode::Unsupported) => {}
            other => panic!("expected ER04, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ropt_reports_ascii_mode() {
        let (module, ctrl) = mock_module();
        ctrl.expect(b"ROPT\r\n", b"OK 01\r\n");
        assert_eq!(module.ropt().await.unwrap(), PayloadMode::Ascii);
    }

    #[tokio::test]
    async fn skscan_collects_descriptors() {
        let (module, ctrl) = mock_module();
        ctrl.expect(
            b"SKSCAN 2 FFFFFFFF 6\r\n",
            b"OK\r\nEVENT 20 FE80::1\r\nEPANDESC\r\n  Channel:21\r\n  Channel Page:09\r\n  Pan ID:8888\r\n  Addr:001D129100000001\r\n  LQI:E1\r\n  PairID:01234567\r\nEVENT 22 FE80::1\r\n",
        );

        let pans = module.skscan(6, Duration::from_secs(1)).await.unwrap();
        assert_eq!(pans.len(), 1);
        assert_eq!(pans[0].channel, 0x21);
        assert_eq!(pans[0].pan_id, 0x8888);
    }

    #[tokio::test]
    async fn skscan_empty_result() {
        let (module, ctrl) = mock_module();
        ctrl.expect(b"SKSCAN 2 FFFFFFFF 6\r\n", b"OK\r\nEVENT 22 FE80::1\r\n");
        let pans = module.skscan(6, Duration::from_secs(1)).await.unwrap();
        assert!(pans.is_empty());
    }

    #[tokio::test]
    async fn skjoin_success_on_event_25() {
        let (module, ctrl) = mock_module();
        ctrl.expect(b"SKJOIN FE80::1\r\n", b"OK\r\nEVENT 25 FE80::1\r\n");
        assert!(module.skjoin("FE80::1", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn skjoin_rejected_on_event_24() {
        let (module, ctrl) = mock_module();
        ctrl.expect(b"SKJOIN FE80::1\r\n", b"OK\r\nEVENT 24 FE80::1\r\n");
        assert!(!module.skjoin("FE80::1", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn sksendto_reports_tx_result() {
        let (module, ctrl) = mock_module();
        ctrl.expect(
            b"SKSENDTO 1 FE80::1 0E1A 1 0 0002 1081\r\n",
            b"EVENT 21 FE80::1 00\r\nOK\r\n",
        );
        let result = module
            .sksendto("FE80::1", &[0x10, 0x81], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result, Some(0x00));
    }

    #[tokio::test]
    async fn sksendto_rejects_empty_payload() {
        let (module, _ctrl) = mock_module();
        let err = module
            .sksendto("FE80::1", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn skterm_accepts_no_session() {
        let (module, ctrl) = mock_module();
        ctrl.expect(b"SKTERM\r\n", b"OK\r\nEVENT 28 FE80::1\r\n");
        module.skterm().await.unwrap();
    }
}
