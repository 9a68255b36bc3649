//! AT command/response engine.
//!
//! Drives one command exchange at a time over a line-delivering inner
//! transport: send the command, pump the inner layer, classify response
//! lines until the final `OK` / `ERROR` / `+CME ERROR:` arrives or the
//! deadline expires. Lines the engine does not consume itself (carrier
//! registration, signal quality, operator name, the IMSI) are forwarded to
//! the unsolicited-response callback so the dialect layer above can react to
//! network notifications.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use modemlink_transport::{
    BearerHandle, CregInfo, GsmBearer, ModemError, SendFlags, Transport, TransportError,
    TransportResult,
};

use crate::script::{parse_script, ScriptStep};

/// Creation flags for the modem transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemFlags(u16);

impl ModemFlags {
    /// No special behaviour.
    pub const NONE: ModemFlags = ModemFlags(0);
    /// Skip the hardware initialisation script.
    pub const SKIP_INIT: ModemFlags = ModemFlags(0x01);
    /// Dial the bare shortcode first, then send payloads within the session.
    pub const STAGE_SHORTCODE: ModemFlags = ModemFlags(0x02);
    /// The session end marker is merged into the final payload command.
    pub const MERGE_USSD_SESSION_END: ModemFlags = ModemFlags(0x04);
    /// The session end marker is a separate `AT+CUSD=2` command.
    pub const SPLIT_USSD_SESSION_END: ModemFlags = ModemFlags(0x08);
    /// Treat an unsolicited `+CUSD: 2` as informational, not an error.
    pub const IGNORE_PLUS_CUSD2: ModemFlags = ModemFlags(0x10);
    /// Prefer USSD over packet data when both are available.
    pub const PREFER_USSD: ModemFlags = ModemFlags(0x100);

    /// Raw bit representation.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: ModemFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ModemFlags {
    type Output = ModemFlags;

    fn bitor(self, rhs: ModemFlags) -> ModemFlags {
        ModemFlags(self.0 | rhs.0)
    }
}

/// Consecutive serious errors that trigger a forced modem reset.
pub const SERIOUS_ERROR_RESET_THRESHOLD: u32 = 3;

/// Granularity of the response wait inside `send_line`.
const RESPONSE_POLL: Duration = Duration::from_millis(10);

/// Callback receiving response lines the engine did not consume itself.
pub type ModemCallback = Box<dyn FnMut(&[u8]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalResult {
    Acked,
    Rejected,
    Equipment,
}

struct EngineShared {
    lines: std::collections::VecDeque<Vec<u8>>,
}

/// The command/response engine over a line-delivering inner transport.
pub struct AtEngine<T: Transport> {
    inner: T,
    shared: Arc<Mutex<EngineShared>>,
    modem_callback: Option<ModemCallback>,
    final_result: Option<FinalResult>,
    /// Set while the response to `AT+CIMI` is expected; the next all-digit
    /// line is the IMSI.
    expect_imsi: bool,
    imsi: Option<String>,
    creg: CregInfo,
    bearer: BearerHandle,
    serious_errors: u32,
    cusd_errors: u32,
}

impl<T: Transport> AtEngine<T> {
    /// Create an engine over `inner`, which must deliver one response line
    /// per callback invocation.
    pub fn new(inner: T) -> Self {
        AtEngine {
            inner,
            shared: Arc::new(Mutex::new(EngineShared {
                lines: std::collections::VecDeque::new(),
            })),
            modem_callback: None,
            final_result: None,
            expect_imsi: false,
            imsi: None,
            creg: CregInfo::default(),
            bearer: Arc::new(Mutex::new(GsmBearer::default())),
            serious_errors: 0,
            cusd_errors: 0,
        }
    }

    /// Initialise the inner transport and arm the line queue.
    pub fn init(&mut self, version: u16) -> TransportResult<()> {
        self.inner.init(version)?;
        let shared = Arc::clone(&self.shared);
        self.inner
            .register_callback(Box::new(move |line| {
                shared.lock().lines.push_back(line.to_vec());
            }))
    }

    /// Shut the inner transport down and clear all captured state.
    pub fn shutdown(&mut self) -> TransportResult<()> {
        let _ = self.inner.deregister_callback();
        self.inner.shutdown()?;
        self.shared.lock().lines.clear();
        self.modem_callback = None;
        self.final_result = None;
        self.expect_imsi = false;
        self.serious_errors = 0;
        self.cusd_errors = 0;
        Ok(())
    }

    /// Register the callback for response lines the engine does not consume.
    pub fn set_modem_callback(&mut self, callback: ModemCallback) {
        self.modem_callback = Some(callback);
    }

    /// Drop the unsolicited-response callback.
    pub fn clear_modem_callback(&mut self) {
        self.modem_callback = None;
    }

    /// Direct access to the inner transport.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// The IMSI captured from `AT+CIMI`, if any.
    pub fn imsi(&self) -> Option<&str> {
        self.imsi.as_deref()
    }

    /// Latest network registration state.
    pub fn creg(&self) -> CregInfo {
        self.creg
    }

    /// Shared handle to the captured bearer info (signal strength, operator).
    pub fn bearer_handle(&self) -> BearerHandle {
        Arc::clone(&self.bearer)
    }

    /// Serious error count, optionally cleared.
    pub fn serious_errors(&mut self, and_clear: bool) -> u32 {
        let count = self.serious_errors;
        if and_clear {
            self.serious_errors = 0;
        }
        count
    }

    /// USSD error count, optionally cleared.
    pub fn cusd_errors(&mut self, and_clear: bool) -> u32 {
        let count = self.cusd_errors;
        if and_clear {
            self.cusd_errors = 0;
        }
        count
    }

    /// Record a serious fault observed by the dialect layer.
    pub fn note_serious_error(&mut self) {
        self.serious_errors += 1;
    }

    /// Record a USSD-level fault observed by the dialect layer.
    pub fn note_cusd_error(&mut self) {
        self.cusd_errors += 1;
        self.serious_errors += 1;
    }

    /// Pump the inner transport for `timeout` and classify everything that
    /// arrived.
    pub fn pump(&mut self, timeout: Duration) -> TransportResult<()> {
        self.inner.run(timeout)?;
        self.classify_pending();
        Ok(())
    }

    fn classify_pending(&mut self) {
        loop {
            let line = self.shared.lock().lines.pop_front();
            match line {
                Some(line) => self.classify(&line),
                None => break,
            }
        }
    }

    fn classify(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text == "OK" {
            self.final_result = Some(FinalResult::Acked);
            self.serious_errors = 0;
        } else if text == "ERROR" {
            self.final_result = Some(FinalResult::Rejected);
            self.serious_errors += 1;
        } else if text.starts_with("+CME ERROR:") {
            log::warn!("modem: {text}");
            self.final_result = Some(FinalResult::Equipment);
            self.serious_errors += 1;
        } else if let Some(rest) = text.strip_prefix("+CREG:") {
            self.creg = parse_creg(rest);
        } else if let Some(rest) = text.strip_prefix("+CSQ:") {
            if let Some(strength) = parse_csq(rest) {
                self.bearer.lock().strength = strength;
            }
        } else if let Some(rest) = text.strip_prefix("+COPS:") {
            if let Some(name) = parse_quoted(rest) {
                self.bearer.lock().name = name;
            }
        } else if self.expect_imsi && text.len() >= 5 && text.bytes().all(|b| b.is_ascii_digit()) {
            self.imsi = Some(text.to_string());
            self.expect_imsi = false;
        } else if let Some(cb) = self.modem_callback.as_mut() {
            cb(line);
        } else {
            log::trace!("modem: discarding line {text:?}");
        }
    }

    /// Send one command line and wait for its final response.
    ///
    /// `AckTimeout` when no final response arrives in time; a rejection maps
    /// to the corresponding modem error. Intermediate lines are classified
    /// as they arrive.
    pub fn send_line(&mut self, line: &str, timeout: Duration) -> TransportResult<()> {
        log::debug!("modem: > {line}");
        self.final_result = None;
        self.expect_imsi = line == "AT+CIMI";
        let mut command = String::with_capacity(line.len() + 2);
        command.push_str(line);
        command.push_str("\r\n");
        let deadline = Instant::now() + timeout;
        self.inner
            .send(SendFlags::NONE, command.as_bytes(), timeout)?;
        loop {
            self.classify_pending();
            if let Some(result) = self.final_result.take() {
                self.expect_imsi = false;
                return match result {
                    FinalResult::Acked => Ok(()),
                    FinalResult::Rejected => Err(ModemError::CommandRejected.into()),
                    FinalResult::Equipment => Err(ModemError::CmeError.into()),
                };
            }
            let now = Instant::now();
            if now >= deadline {
                self.expect_imsi = false;
                self.serious_errors += 1;
                return Err(TransportError::AckTimeout);
            }
            self.inner.run((deadline - now).min(RESPONSE_POLL))?;
        }
    }

    /// Run a command script, honouring ignore-failure markers and settle
    /// delays.
    pub fn run_script(&mut self, script: &str, per_command: Duration) -> TransportResult<()> {
        for step in parse_script(script) {
            match step {
                ScriptStep::Delay(delay) => {
                    let deadline = Instant::now() + delay;
                    loop {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        self.pump((deadline - now).min(RESPONSE_POLL))?;
                    }
                }
                ScriptStep::Command {
                    line,
                    ignore_failure,
                } => match self.send_line(line, per_command) {
                    Ok(()) => {}
                    Err(err) if ignore_failure => {
                        log::debug!("modem: ignoring failed {line}: {err}");
                    }
                    Err(err) => return Err(err),
                },
            }
        }
        Ok(())
    }
}

/// Parse the fields after `+CREG:`. The solicited form carries a leading
/// mode field, the unsolicited form does not; location fields are quoted
/// hex.
pub(crate) fn parse_creg(rest: &str) -> CregInfo {
    let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
    let (stat_idx, loc_idx) = if fields.len() >= 2 && !fields[1].starts_with('"') {
        (1, 2)
    } else {
        (0, 1)
    };
    let stat = fields
        .get(stat_idx)
        .and_then(|f| f.parse().ok())
        .unwrap_or(0);
    let lac = fields
        .get(loc_idx)
        .and_then(|f| u32::from_str_radix(f.trim_matches('"'), 16).ok())
        .unwrap_or(0);
    let cid = fields
        .get(loc_idx + 1)
        .and_then(|f| u32::from_str_radix(f.trim_matches('"'), 16).ok())
        .unwrap_or(0);
    CregInfo { stat, lac, cid }
}

fn parse_csq(rest: &str) -> Option<u8> {
    rest.split(',').next()?.trim().parse().ok()
}

pub(crate) fn parse_quoted(rest: &str) -> Option<String> {
    let start = rest.find('"')? + 1;
    let end = start + rest[start..].find('"')?;
    Some(rest[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedModemLink;
    use modemlink_transport::TRANSPORT_VERSION;

    fn engine_over(link: ScriptedModemLink) -> AtEngine<ScriptedModemLink> {
        let mut engine = AtEngine::new(link);
        engine.init(TRANSPORT_VERSION).unwrap();
        engine
    }

    #[test]
    fn send_line_acknowledged() {
        let link = ScriptedModemLink::new().on("ATE0", &["OK"]);
        let mut engine = engine_over(link);
        engine
            .send_line("ATE0", Duration::from_millis(100))
            .unwrap();
        assert_eq!(engine.inner_mut().sent(), &["ATE0"]);
    }

    #[test]
    fn rejection_maps_to_command_rejected() {
        let link = ScriptedModemLink::new().on("AT+CUSD=2", &["ERROR"]);
        let mut engine = engine_over(link);
        assert_eq!(
            engine.send_line("AT+CUSD=2", Duration::from_millis(100)),
            Err(ModemError::CommandRejected.into())
        );
        assert_eq!(engine.serious_errors(false), 1);
    }

    #[test]
    fn cme_error_maps_to_equipment_error() {
        let link = ScriptedModemLink::new().on("AT+COPS?", &["+CME ERROR: SIM not inserted"]);
        let mut engine = engine_over(link);
        assert_eq!(
            engine.send_line("AT+COPS?", Duration::from_millis(100)),
            Err(ModemError::CmeError.into())
        );
    }

    #[test]
    fn no_response_is_ack_timeout() {
        let link = ScriptedModemLink::new().on("ATZ", &[]);
        let mut engine = engine_over(link);
        assert_eq!(
            engine.send_line("ATZ", Duration::from_millis(20)),
            Err(TransportError::AckTimeout)
        );
    }

    #[test]
    fn success_clears_serious_errors() {
        let link = ScriptedModemLink::new()
            .on("ATZ", &[])
            .on("ATE0", &["OK"]);
        let mut engine = engine_over(link);
        let _ = engine.send_line("ATZ", Duration::from_millis(10));
        assert_eq!(engine.serious_errors(false), 1);
        engine.send_line("ATE0", Duration::from_millis(50)).unwrap();
        assert_eq!(engine.serious_errors(false), 0);
    }

    #[test]
    fn captures_creg_csq_cops_and_imsi() {
        let link = ScriptedModemLink::new()
            .on("AT+CREG?", &["+CREG: 2,1,\"00C3\",\"1A2B\"", "OK"])
            .on("AT+CSQ", &["+CSQ: 17,0", "OK"])
            .on("AT+COPS?", &["+COPS: 0,0,\"Operator X\",2", "OK"])
            .on("AT+CIMI", &["234150123456789", "OK"]);
        let mut engine = engine_over(link);
        engine
            .run_script(
                "AT+CREG?\nAT+CSQ\nAT+COPS?\nAT+CIMI",
                Duration::from_millis(100),
            )
            .unwrap();
        let creg = engine.creg();
        assert!(creg.registered());
        assert_eq!(creg.lac, 0x00C3);
        assert_eq!(creg.cid, 0x1A2B);
        let bearer = engine.bearer_handle();
        assert_eq!(bearer.lock().strength, 17);
        assert_eq!(bearer.lock().name, "Operator X");
        assert_eq!(engine.imsi(), Some("234150123456789"));
    }

    #[test]
    fn unsolicited_lines_reach_the_modem_callback() {
        let link = ScriptedModemLink::new().on("ATE0", &["+CUSD: 0,\"aGk=\",15", "OK"]);
        let mut engine = engine_over(link);
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.set_modem_callback(Box::new(move |line| sink.lock().push(line.to_vec())));
        engine
            .send_line("ATE0", Duration::from_millis(100))
            .unwrap();
        assert_eq!(&*seen.lock(), &vec![b"+CUSD: 0,\"aGk=\",15".to_vec()]);
    }

    #[test]
    fn script_ignore_marker_skips_failures() {
        let link = ScriptedModemLink::new()
            .on("AT&W", &["ERROR"])
            .on("ATE0", &["OK"]);
        let mut engine = engine_over(link);
        engine
            .run_script("?AT&W\nATE0", Duration::from_millis(100))
            .unwrap();
    }

    #[test]
    fn unsolicited_creg_form_without_mode_field() {
        assert_eq!(
            parse_creg(" 1,\"00C3\",\"1A2B\""),
            CregInfo {
                stat: 1,
                lac: 0x00C3,
                cid: 0x1A2B
            }
        );
        assert_eq!(parse_creg(" 2,3"), CregInfo { stat: 3, lac: 0, cid: 0 });
    }
}
