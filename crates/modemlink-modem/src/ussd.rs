//! USSD session transport.
//!
//! Carries payloads as the operand of `AT+CUSD` commands against a service
//! shortcode and parses `+CUSD:` notifications back into payload bytes. A
//! session stays open across the packets of one exchange; the session end
//! marker is either merged into the final payload command or issued as a
//! separate `AT+CUSD=2`, depending on what the modem accepts.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use modemlink_transport::{
    BearerHandle, CregInfo, ModemError, SendFlags, Transport, TransportCallback, TransportError,
    TransportResult, TRANSPORT_VERSION, USSD_BUFFER_LEN,
};

use crate::engine::{AtEngine, ModemFlags, SERIOUS_ERROR_RESET_THRESHOLD};
use crate::script::{
    CLEAR_FPLMN_SCRIPT, FORCE_RESET_SCRIPT, INFO_SCRIPT, INIT_SCRIPT, USSD_END_COMMAND,
};

/// Service shortcode dialled by default.
pub const DEFAULT_SHORTCODE: u16 = 469;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

const RUN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndMode {
    /// `AT+CUSD=2,"<operand>"` carries the final payload.
    Merged,
    /// A bare `AT+CUSD=2` follows the final payload command.
    Split,
}

struct UssdShared {
    /// Accumulating quoted operand that has not seen its closing quote yet.
    partial: Option<(u8, Vec<u8>)>,
    inbound: VecDeque<Vec<u8>>,
    session_ended: bool,
    aborted: bool,
    parse_errors: u32,
}

fn complete(shared: &mut UssdShared, m: u8, payload: Vec<u8>) {
    if !payload.is_empty() {
        shared.inbound.push_back(payload);
    }
    if m == 2 {
        shared.session_ended = true;
    }
}

/// Classify one response line from the modem. The quoted operand of a
/// `+CUSD:` notification may span lines; accumulation continues until the
/// closing quote.
fn handle_ussd_line(shared: &mut UssdShared, ignore_cusd2: bool, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if let Some((m, mut acc)) = shared.partial.take() {
        match text.find('"') {
            Some(end) => {
                acc.extend_from_slice(text[..end].as_bytes());
                complete(shared, m, acc);
            }
            None => {
                acc.extend_from_slice(text.as_bytes());
                shared.partial = Some((m, acc));
            }
        }
        return;
    }
    let Some(rest) = text.strip_prefix("+CUSD:") else {
        log::trace!("ussd: discarding line {text:?}");
        return;
    };
    let rest = rest.trim_start();
    let m = match rest.chars().next().and_then(|c| c.to_digit(10)) {
        Some(digit) => digit as u8,
        None => {
            shared.parse_errors += 1;
            return;
        }
    };
    match rest.find('"') {
        None => {
            if m == 2 {
                if ignore_cusd2 {
                    log::debug!("ussd: network closed the session");
                    shared.session_ended = true;
                } else {
                    shared.aborted = true;
                }
            }
        }
        Some(start) => {
            let body = &rest[start + 1..];
            match body.find('"') {
                Some(end) => complete(shared, m, body[..end].as_bytes().to_vec()),
                None => shared.partial = Some((m, body.as_bytes().to_vec())),
            }
        }
    }
}

/// Transport speaking the USSD AT dialect over a line-delivering inner
/// transport.
pub struct ModemTransport<T: Transport> {
    engine: AtEngine<T>,
    flags: ModemFlags,
    shortcode: u16,
    end_mode: Option<EndMode>,
    shared: Arc<Mutex<UssdShared>>,
    callback: Option<TransportCallback>,
    session_open: bool,
    deferred_end: bool,
    command_timeout: Duration,
    init_script: &'static str,
    info_script: &'static str,
    reset_script: &'static str,
}

impl<T: Transport> ModemTransport<T> {
    /// Create a USSD modem transport over `inner` with the default
    /// shortcode.
    pub fn new(inner: T, flags: ModemFlags) -> Self {
        ModemTransport {
            engine: AtEngine::new(inner),
            flags,
            shortcode: DEFAULT_SHORTCODE,
            end_mode: None,
            shared: Arc::new(Mutex::new(UssdShared {
                partial: None,
                inbound: VecDeque::new(),
                session_ended: false,
                aborted: false,
                parse_errors: 0,
            })),
            callback: None,
            session_open: false,
            deferred_end: false,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            init_script: INIT_SCRIPT,
            info_script: INFO_SCRIPT,
            reset_script: FORCE_RESET_SCRIPT,
        }
    }

    /// Dial `shortcode` instead of [`DEFAULT_SHORTCODE`].
    pub fn with_shortcode(mut self, shortcode: u16) -> Self {
        self.shortcode = shortcode;
        self
    }

    /// Override the default command scripts. `None` keeps the default.
    pub fn set_scripts(
        &mut self,
        init: Option<&'static str>,
        info: Option<&'static str>,
        reset: Option<&'static str>,
    ) {
        if let Some(script) = init {
            self.init_script = script;
        }
        if let Some(script) = info {
            self.info_script = script;
        }
        if let Some(script) = reset {
            self.reset_script = script;
        }
    }

    /// Per-command response budget used by scripts and session-end markers.
    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    /// Shared handle to the carrier bearer info captured during init.
    pub fn bearer_handle(&self) -> BearerHandle {
        self.engine.bearer_handle()
    }

    /// Latest network registration state.
    pub fn creg(&self) -> CregInfo {
        self.engine.creg()
    }

    /// USSD error count, optionally cleared.
    pub fn cusd_errors(&mut self, and_clear: bool) -> u32 {
        self.engine.cusd_errors(and_clear)
    }

    /// Serious error count, optionally cleared.
    pub fn serious_errors(&mut self, and_clear: bool) -> u32 {
        self.engine.serious_errors(and_clear)
    }

    /// Direct access to the inner transport.
    pub fn inner_mut(&mut self) -> &mut T {
        self.engine.inner_mut()
    }

    /// Negotiate how the modem wants the session end marker: try the merged
    /// form first, fall back to split when the command is rejected. The
    /// learned mode persists for the session.
    fn negotiate_end_mode(&mut self) -> TransportResult<EndMode> {
        if self.flags.contains(ModemFlags::MERGE_USSD_SESSION_END) {
            return Ok(EndMode::Merged);
        }
        if self.flags.contains(ModemFlags::SPLIT_USSD_SESSION_END) {
            return Ok(EndMode::Split);
        }
        match self
            .engine
            .send_line("AT+CUSD=2,\"\",15", self.command_timeout)
        {
            Ok(()) => Ok(EndMode::Merged),
            Err(TransportError::Modem(ModemError::CommandRejected)) => Ok(EndMode::Split),
            Err(err) => Err(err),
        }
    }

    fn operand(&self, payload: &str) -> String {
        if self.flags.contains(ModemFlags::STAGE_SHORTCODE) {
            payload.to_string()
        } else {
            format!("#{}*{}#", self.shortcode, payload)
        }
    }

    /// Issue the deferred split-mode session end, if one is pending.
    fn flush_deferred_end(&mut self) -> TransportResult<()> {
        if !self.deferred_end {
            return Ok(());
        }
        self.deferred_end = false;
        match self.engine.send_line(USSD_END_COMMAND, self.command_timeout) {
            Ok(()) => {
                self.session_open = false;
                Ok(())
            }
            Err(TransportError::AckTimeout) => Err(TransportError::DeferredEndTimeout),
            Err(err) => Err(err),
        }
    }

    /// Run the forced reset sequence when the serious error threshold has
    /// been reached.
    fn maybe_forced_reset(&mut self) -> TransportResult<()> {
        if self.engine.serious_errors(false) < SERIOUS_ERROR_RESET_THRESHOLD {
            return Ok(());
        }
        log::warn!("ussd: serious error threshold reached, forcing modem reset");
        self.session_open = false;
        self.deferred_end = false;
        let result = self
            .engine
            .run_script(self.reset_script, self.command_timeout)
            .and_then(|_| self.engine.run_script(self.init_script, self.command_timeout));
        self.engine.serious_errors(true);
        result.map_err(|_| ModemError::ResetFailed)?;
        Ok(())
    }

    /// Pop parsed inbound payloads to the layer above and surface session
    /// faults. Returns whether anything was delivered.
    fn deliver(&mut self) -> TransportResult<bool> {
        let (payloads, ended, aborted, parse_errors) = {
            let mut shared = self.shared.lock();
            let payloads: Vec<Vec<u8>> = shared.inbound.drain(..).collect();
            let ended = std::mem::take(&mut shared.session_ended);
            let aborted = std::mem::take(&mut shared.aborted);
            let parse_errors = std::mem::take(&mut shared.parse_errors);
            (payloads, ended, aborted, parse_errors)
        };
        let delivered = !payloads.is_empty();
        for payload in payloads {
            if let Some(cb) = self.callback.as_mut() {
                cb(&payload);
            }
        }
        if ended {
            self.session_open = false;
            self.deferred_end = false;
        }
        for _ in 0..parse_errors {
            self.engine.note_cusd_error();
        }
        if aborted {
            self.session_open = false;
            self.deferred_end = false;
            self.engine.note_cusd_error();
            return Err(ModemError::UssdSessionAborted.into());
        }
        Ok(delivered)
    }
}

impl<T: Transport> Transport for ModemTransport<T> {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        if version != TRANSPORT_VERSION {
            return Err(TransportError::VersionMismatch);
        }
        self.engine.init(version)?;
        let shared = Arc::clone(&self.shared);
        let ignore_cusd2 = self.flags.contains(ModemFlags::IGNORE_PLUS_CUSD2);
        self.engine.set_modem_callback(Box::new(move |line| {
            handle_ussd_line(&mut shared.lock(), ignore_cusd2, line);
        }));
        if !self.flags.contains(ModemFlags::SKIP_INIT) {
            self.engine
                .run_script(self.init_script, self.command_timeout)?;
            if self.engine.creg().stat == 3 {
                // Registration refused; clear the forbidden-operator list
                // and restart the radio before giving up.
                let _ = self
                    .engine
                    .run_script(CLEAR_FPLMN_SCRIPT, self.command_timeout);
                let _ = self
                    .engine
                    .run_script(self.reset_script, self.command_timeout);
                return Err(ModemError::RegistrationDenied.into());
            }
            self.engine
                .run_script(self.info_script, self.command_timeout)?;
        }
        let mode = self.negotiate_end_mode()?;
        self.end_mode = Some(mode);
        log::debug!("ussd: session end mode {mode:?}");
        Ok(())
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        self.engine.clear_modem_callback();
        self.engine.shutdown()?;
        self.callback = None;
        self.session_open = false;
        self.deferred_end = false;
        self.end_mode = None;
        let mut shared = self.shared.lock();
        shared.partial = None;
        shared.inbound.clear();
        shared.session_ended = false;
        shared.aborted = false;
        shared.parse_errors = 0;
        Ok(())
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        Ok(USSD_BUFFER_LEN)
    }

    fn client_id(&self) -> String {
        self.engine
            .imsi()
            .map(str::to_string)
            .unwrap_or_else(|| "modemlink-modem".to_string())
    }

    fn send(&mut self, flags: SendFlags, data: &[u8], timeout: Duration) -> TransportResult<()> {
        self.maybe_forced_reset()?;
        if flags.contains(SendFlags::JUST_FLUSH) && data.is_empty() {
            return self.flush_deferred_end();
        }
        let payload =
            std::str::from_utf8(data).map_err(|_| TransportError::IllegalArgument)?;
        if self.flags.contains(ModemFlags::STAGE_SHORTCODE) && !self.session_open {
            let dial = format!("AT+CUSD=1,\"#{}#\",15", self.shortcode);
            self.engine.send_line(&dial, timeout)?;
            self.session_open = true;
        }
        let operand = self.operand(payload);
        let want_end = flags.contains(SendFlags::USSD_SESSION_END);
        let stall = if self.session_open {
            TransportError::InterpacketAckTimeout
        } else {
            TransportError::AckTimeout
        };
        if want_end && self.end_mode == Some(EndMode::Merged) {
            let command = format!("AT+CUSD=2,\"{operand}\",15");
            self.engine.send_line(&command, timeout).map_err(|err| {
                if err == TransportError::AckTimeout {
                    TransportError::EndTimeout
                } else {
                    err
                }
            })?;
            self.session_open = false;
        } else {
            let command = format!("AT+CUSD=1,\"{operand}\",15");
            self.engine.send_line(&command, timeout).map_err(|err| {
                if err == TransportError::AckTimeout {
                    stall
                } else {
                    err
                }
            })?;
            self.session_open = true;
            if want_end {
                // The split end marker is deferred until the exchange's
                // response has been delivered, or the next flush.
                self.deferred_end = true;
            }
        }
        Ok(())
    }

    fn register_callback(&mut self, callback: TransportCallback) -> TransportResult<()> {
        self.callback = Some(callback);
        Ok(())
    }

    fn deregister_callback(&mut self) -> TransportResult<()> {
        self.callback = None;
        Ok(())
    }

    fn run(&mut self, timeout: Duration) -> TransportResult<()> {
        self.maybe_forced_reset()?;
        let deadline = Instant::now() + timeout;
        loop {
            self.engine.pump(Duration::ZERO)?;
            if self.deliver()? {
                self.flush_deferred_end()?;
                return Ok(());
            }
            if timeout.is_zero() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.engine.pump((deadline - now).min(RUN_POLL))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedModemLink;

    fn quick(mut modem: ModemTransport<ScriptedModemLink>) -> ModemTransport<ScriptedModemLink> {
        modem.set_command_timeout(Duration::from_millis(50));
        modem
    }

    fn collect(modem: &mut ModemTransport<ScriptedModemLink>) -> Arc<Mutex<Vec<Vec<u8>>>> {
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        modem
            .register_callback(Box::new(move |bytes| sink.lock().push(bytes.to_vec())))
            .unwrap();
        seen
    }

    #[test]
    fn init_probes_merged_end_mode_first() {
        let link = ScriptedModemLink::new().on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(link, ModemFlags::SKIP_INIT));
        modem.init(TRANSPORT_VERSION).unwrap();
        assert_eq!(modem.end_mode, Some(EndMode::Merged));
        assert_eq!(modem.inner_mut().sent(), &["AT+CUSD=2,\"\",15"]);
    }

    #[test]
    fn probe_rejection_selects_split_mode() {
        let link = ScriptedModemLink::new()
            .on("AT+CUSD=2", &["ERROR"])
            .on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(link, ModemFlags::SKIP_INIT));
        modem.init(TRANSPORT_VERSION).unwrap();
        assert_eq!(modem.end_mode, Some(EndMode::Split));
    }

    #[test]
    fn full_init_runs_script_and_captures_carrier_info() {
        let link = ScriptedModemLink::new()
            .on("AT+CREG?", &["+CREG: 2,1,\"00C3\",\"1A2B\"", "OK"])
            .on("AT+CSQ", &["+CSQ: 21,0", "OK"])
            .on("AT+COPS?", &["+COPS: 0,0,\"Carrier\",2", "OK"])
            .on("AT+CIMI", &["234150123456789", "OK"])
            .on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(link, ModemFlags::NONE));
        modem.set_scripts(None, None, Some("AT+CFUN=1,1"));
        modem.init(TRANSPORT_VERSION).unwrap();
        assert!(modem.creg().registered());
        assert_eq!(modem.bearer_handle().lock().strength, 21);
        assert_eq!(modem.client_id(), "234150123456789");
        assert!(modem
            .inner_mut()
            .sent()
            .iter()
            .any(|line| line == "ATZ"));
    }

    #[test]
    fn registration_denied_clears_fplmn_and_resets() {
        let link = ScriptedModemLink::new()
            .on("AT+CREG?", &["+CREG: 2,3", "OK"])
            .on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(link, ModemFlags::NONE));
        modem.set_scripts(None, None, Some("AT+CFUN=1,1"));
        assert_eq!(
            modem.init(TRANSPORT_VERSION),
            Err(ModemError::RegistrationDenied.into())
        );
        let sent = modem.inner_mut().sent();
        assert!(sent.iter().any(|line| line.starts_with("AT+CRSM=214")));
        assert!(sent.iter().any(|line| line == "AT+CFUN=1,1"));
    }

    #[test]
    fn send_wraps_payload_in_shortcode_dial() {
        let link = ScriptedModemLink::new().on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(link, ModemFlags::SKIP_INIT));
        modem.init(TRANSPORT_VERSION).unwrap();
        modem
            .send(SendFlags::NONE, b"aGVsbG8=", Duration::from_millis(50))
            .unwrap();
        assert!(modem
            .inner_mut()
            .sent()
            .contains(&"AT+CUSD=1,\"#469*aGVsbG8=#\",15".to_string()));
    }

    #[test]
    fn response_round_trip() {
        let link = ScriptedModemLink::new().on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(link, ModemFlags::SKIP_INIT));
        modem.init(TRANSPORT_VERSION).unwrap();
        let seen = collect(&mut modem);
        modem
            .send(SendFlags::NONE, b"cGluZw==", Duration::from_millis(50))
            .unwrap();
        modem.inner_mut().push_unsolicited("+CUSD: 0,\"cG9uZw==\",15");
        modem.run(Duration::ZERO).unwrap();
        assert_eq!(&*seen.lock(), &vec![b"cG9uZw==".to_vec()]);
    }

    #[test]
    fn quoted_operand_spanning_lines() {
        let link = ScriptedModemLink::new().on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(link, ModemFlags::SKIP_INIT));
        modem.init(TRANSPORT_VERSION).unwrap();
        let seen = collect(&mut modem);
        modem.inner_mut().push_unsolicited("+CUSD: 1,\"AAAA");
        modem.inner_mut().push_unsolicited("BBBB\",15");
        modem.run(Duration::ZERO).unwrap();
        assert_eq!(&*seen.lock(), &vec![b"AAAABBBB".to_vec()]);
    }

    #[test]
    fn merged_session_end_uses_cusd2_with_payload() {
        let link = ScriptedModemLink::new().on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(
            link,
            ModemFlags::SKIP_INIT | ModemFlags::MERGE_USSD_SESSION_END,
        ));
        modem.init(TRANSPORT_VERSION).unwrap();
        modem
            .send(
                SendFlags::USSD_SESSION_END,
                b"Ynll",
                Duration::from_millis(50),
            )
            .unwrap();
        assert!(modem
            .inner_mut()
            .sent()
            .contains(&"AT+CUSD=2,\"#469*Ynll#\",15".to_string()));
        assert!(!modem.session_open);
    }

    #[test]
    fn split_session_end_is_deferred_until_response() {
        let link = ScriptedModemLink::new().on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(
            link,
            ModemFlags::SKIP_INIT | ModemFlags::SPLIT_USSD_SESSION_END,
        ));
        modem.init(TRANSPORT_VERSION).unwrap();
        let seen = collect(&mut modem);
        modem
            .send(
                SendFlags::USSD_SESSION_END,
                b"Ynll",
                Duration::from_millis(50),
            )
            .unwrap();
        assert!(!modem.inner_mut().sent().contains(&"AT+CUSD=2".to_string()));
        modem.inner_mut().push_unsolicited("+CUSD: 0,\"YWNr\",15");
        modem.run(Duration::ZERO).unwrap();
        assert_eq!(&*seen.lock(), &vec![b"YWNr".to_vec()]);
        assert!(modem.inner_mut().sent().contains(&"AT+CUSD=2".to_string()));
        assert!(!modem.session_open);
    }

    #[test]
    fn just_flush_issues_pending_session_end() {
        let link = ScriptedModemLink::new().on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(
            link,
            ModemFlags::SKIP_INIT | ModemFlags::SPLIT_USSD_SESSION_END,
        ));
        modem.init(TRANSPORT_VERSION).unwrap();
        modem
            .send(
                SendFlags::USSD_SESSION_END,
                b"Ynll",
                Duration::from_millis(50),
            )
            .unwrap();
        modem
            .send(SendFlags::JUST_FLUSH, b"", Duration::from_millis(50))
            .unwrap();
        assert!(modem.inner_mut().sent().contains(&"AT+CUSD=2".to_string()));
    }

    #[test]
    fn unsolicited_session_close_is_an_error_by_default() {
        let link = ScriptedModemLink::new().on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(link, ModemFlags::SKIP_INIT));
        modem.init(TRANSPORT_VERSION).unwrap();
        modem.inner_mut().push_unsolicited("+CUSD: 2");
        assert_eq!(
            modem.run(Duration::ZERO),
            Err(ModemError::UssdSessionAborted.into())
        );
        assert_eq!(modem.cusd_errors(false), 1);
    }

    #[test]
    fn unsolicited_session_close_is_informational_when_ignored() {
        let link = ScriptedModemLink::new().on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(
            link,
            ModemFlags::SKIP_INIT | ModemFlags::IGNORE_PLUS_CUSD2,
        ));
        modem.init(TRANSPORT_VERSION).unwrap();
        modem.inner_mut().push_unsolicited("+CUSD: 2");
        assert_eq!(modem.run(Duration::ZERO), Ok(()));
        assert_eq!(modem.cusd_errors(false), 0);
    }

    #[test]
    fn staged_shortcode_dials_before_payload() {
        let link = ScriptedModemLink::new().on("AT", &["OK"]);
        let mut modem = quick(ModemTransport::new(
            link,
            ModemFlags::SKIP_INIT | ModemFlags::STAGE_SHORTCODE,
        ));
        modem.init(TRANSPORT_VERSION).unwrap();
        modem
            .send(SendFlags::NONE, b"cGluZw==", Duration::from_millis(50))
            .unwrap();
        let sent = modem.inner_mut().sent();
        let dial = sent
            .iter()
            .position(|line| line == "AT+CUSD=1,\"#469#\",15")
            .expect("dial command");
        let payload = sent
            .iter()
            .position(|line| line == "AT+CUSD=1,\"cGluZw==\",15")
            .expect("payload command");
        assert!(dial < payload);
    }
}
