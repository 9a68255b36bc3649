//! UDP datagram transport.
//!
//! Speaks the packet-data AT dialect of a [`UdpModemConfig`] over a raw
//! chunk-delivering inner transport (normally a ring buffer over the serial
//! leaf; the datagram payload is binary, so the line buffer's text framing
//! cannot be used). The transport scans the accumulated byte stream itself,
//! splitting command responses on line terminators and consuming datagram
//! payloads as counted raw bytes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use modemlink_transport::{
    CregInfo, ModemError, SendFlags, Transport, TransportCallback, TransportError,
    TransportResult, TRANSPORT_VERSION,
};

use crate::config::{expand, UdpModemConfig};
use crate::engine::{parse_creg, parse_quoted, SERIOUS_ERROR_RESET_THRESHOLD};
use crate::script::{parse_script, ScriptStep, FORCE_RESET_SCRIPT, UDP_INIT_SCRIPT};

/// Largest datagram payload the transport will carry.
pub const UDP_BUFFER_LEN: usize = 1000;

/// Extra ring capacity reserved for response headers interleaved with
/// payload bytes.
pub const RESERVED_BUFFER: usize = 64;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

const RESPONSE_POLL: Duration = Duration::from_millis(10);

/// Where the datagrams go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEndpoint {
    /// Access point name for the packet-data attach.
    pub apn: String,
    /// Remote host, dotted quad or name.
    pub host: String,
    /// Remote port.
    pub port: u16,
}

struct UdpShared {
    buf: Vec<u8>,
    fault: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalResult {
    Acked,
    Rejected,
    Equipment,
}

/// Transport carrying datagrams through a packet-data capable modem.
pub struct UdpModemTransport<T: Transport> {
    inner: T,
    config: UdpModemConfig,
    endpoint: UdpEndpoint,
    shared: Arc<Mutex<UdpShared>>,
    callback: Option<TransportCallback>,
    inbound: VecDeque<Vec<u8>>,
    pending_reads: u32,
    mss: usize,
    initialised: bool,
    imsi: Option<String>,
    expect_imsi: bool,
    creg: CregInfo,
    capture_address: bool,
    local_address: Option<String>,
    serious_errors: u32,
    command_timeout: Duration,
    reset_script: &'static str,
    init_script: &'static str,
}

impl<T: Transport> UdpModemTransport<T> {
    /// Create a UDP modem transport for one modem family and endpoint.
    pub fn new(inner: T, config: UdpModemConfig, endpoint: UdpEndpoint) -> Self {
        UdpModemTransport {
            inner,
            config,
            endpoint,
            shared: Arc::new(Mutex::new(UdpShared {
                buf: Vec::new(),
                fault: false,
            })),
            callback: None,
            inbound: VecDeque::new(),
            pending_reads: 0,
            mss: UDP_BUFFER_LEN,
            initialised: false,
            imsi: None,
            expect_imsi: false,
            creg: CregInfo::default(),
            capture_address: false,
            local_address: None,
            serious_errors: 0,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            reset_script: FORCE_RESET_SCRIPT,
            init_script: UDP_INIT_SCRIPT,
        }
    }

    /// Cap outbound datagrams at `mss` bytes. Only allowed before `init`.
    pub fn set_bearer_mss(&mut self, mss: usize) -> TransportResult<()> {
        if self.initialised {
            return Err(ModemError::MssTooLate.into());
        }
        self.mss = mss.min(UDP_BUFFER_LEN);
        Ok(())
    }

    /// Override the default command scripts. `None` keeps the default.
    pub fn set_scripts(&mut self, init: Option<&'static str>, reset: Option<&'static str>) {
        if let Some(script) = init {
            self.init_script = script;
        }
        if let Some(script) = reset {
            self.reset_script = script;
        }
    }

    /// Per-command response budget.
    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    /// The local address acquired during attach, if any.
    pub fn local_address(&self) -> Option<&str> {
        self.local_address.as_deref()
    }

    /// Latest network registration state.
    pub fn creg(&self) -> CregInfo {
        self.creg
    }

    /// Serious error count, optionally cleared.
    pub fn serious_errors(&mut self, and_clear: bool) -> u32 {
        let count = self.serious_errors;
        if and_clear {
            self.serious_errors = 0;
        }
        count
    }

    /// Direct access to the inner transport.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Take the next complete line out of the scan buffer, terminators
    /// stripped, empty lines skipped.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let mut shared = self.shared.lock();
        loop {
            let end = shared.buf.iter().position(|&b| b == b'\r' || b == b'\n')?;
            let terminator = shared.buf[end];
            let line: Vec<u8> = shared.buf.drain(..=end).take(end).collect();
            // Swallow only the LF of a CRLF pair; anything beyond the
            // terminator may be counted binary payload.
            if terminator == b'\r' && shared.buf.first() == Some(&b'\n') {
                shared.buf.remove(0);
            }
            if !line.is_empty() {
                return Some(line);
            }
        }
    }

    /// Take `n` raw bytes out of the scan buffer once they have all arrived.
    fn take_raw(&mut self, n: usize) -> Option<Vec<u8>> {
        let mut shared = self.shared.lock();
        if shared.buf.len() < n {
            return None;
        }
        Some(shared.buf.drain(..n).collect())
    }

    /// Drop a bare send prompt if the modem emitted one.
    fn discard_prompt(&mut self) {
        let mut shared = self.shared.lock();
        if shared.buf.starts_with(b"> ") {
            shared.buf.drain(..2);
        } else if shared.buf.starts_with(b">") {
            shared.buf.remove(0);
        }
    }

    fn take_fault(&mut self) -> bool {
        std::mem::take(&mut self.shared.lock().fault)
    }

    /// Classify a response line that is not the final result of the pending
    /// command.
    fn handle_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.starts_with(self.config.receive_notification) {
            self.pending_reads += 1;
        } else if let Some(rest) = text.strip_prefix("+CREG:") {
            self.creg = parse_creg(rest);
        } else if self.capture_address {
            if self.config.local_address_prefix.is_empty() {
                self.local_address = Some(text.to_string());
            } else if let Some(rest) = text.strip_prefix(self.config.local_address_prefix) {
                self.local_address =
                    Some(parse_quoted(rest).unwrap_or_else(|| rest.trim().to_string()));
            }
        } else if self.expect_imsi && text.len() >= 5 && text.bytes().all(|b| b.is_ascii_digit())
        {
            self.imsi = Some(text.to_string());
            self.expect_imsi = false;
        } else {
            log::trace!("udp: discarding line {text:?}");
        }
    }

    fn classify_final(line: &[u8]) -> Option<FinalResult> {
        match line {
            b"OK" => Some(FinalResult::Acked),
            b"ERROR" => Some(FinalResult::Rejected),
            _ if line.starts_with(b"+CME ERROR:") => Some(FinalResult::Equipment),
            _ => None,
        }
    }

    /// Pump the inner transport until the final response of the pending
    /// command arrives.
    fn expect_final(&mut self, timeout: Duration) -> TransportResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.inner.run(Duration::ZERO)?;
            while let Some(line) = self.take_line() {
                match Self::classify_final(&line) {
                    Some(FinalResult::Acked) => {
                        self.serious_errors = 0;
                        return Ok(());
                    }
                    Some(FinalResult::Rejected) => {
                        self.serious_errors += 1;
                        return Err(ModemError::CommandRejected.into());
                    }
                    Some(FinalResult::Equipment) => {
                        self.serious_errors += 1;
                        return Err(ModemError::CmeError.into());
                    }
                    None => {
                        self.handle_line(&line);
                        // A bare local address line has no trailing OK on
                        // some families.
                        if self.capture_address
                            && self.config.local_address_prefix.is_empty()
                            && self.local_address.is_some()
                        {
                            return Ok(());
                        }
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                self.serious_errors += 1;
                return Err(TransportError::AckTimeout);
            }
            self.inner.run((deadline - now).min(RESPONSE_POLL))?;
        }
    }

    /// Send one command line and wait for its final response.
    fn command(&mut self, line: &str, timeout: Duration) -> TransportResult<()> {
        log::debug!("udp: > {line}");
        self.expect_imsi = line == "AT+CIMI";
        let mut out = String::with_capacity(line.len() + 2);
        out.push_str(line);
        out.push_str("\r\n");
        self.inner.send(SendFlags::NONE, out.as_bytes(), timeout)?;
        let result = self.expect_final(timeout);
        self.expect_imsi = false;
        result
    }

    fn run_script(&mut self, script: &str) -> TransportResult<()> {
        for step in parse_script(script) {
            match step {
                ScriptStep::Delay(delay) => {
                    let deadline = Instant::now() + delay;
                    loop {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        self.inner.run((deadline - now).min(RESPONSE_POLL))?;
                    }
                }
                ScriptStep::Command {
                    line,
                    ignore_failure,
                } => match self.command(line, self.command_timeout) {
                    Ok(()) => {}
                    Err(err) if ignore_failure => {
                        log::debug!("udp: ignoring failed {line}: {err}");
                    }
                    Err(err) => return Err(err),
                },
            }
        }
        Ok(())
    }

    fn vars(&self) -> [(&'static str, String); 3] {
        [
            ("apn", self.endpoint.apn.clone()),
            ("host", self.endpoint.host.clone()),
            ("port", self.endpoint.port.to_string()),
        ]
    }

    /// Run one attach stage, mapping any failure to the stage's error code.
    fn stage(&mut self, template: &str, failure: ModemError) -> TransportResult<()> {
        if template.is_empty() {
            return Ok(());
        }
        let vars = self.vars();
        let borrowed: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let command = expand(template, &borrowed);
        let name = self.config.name;
        self.command(&command, self.command_timeout).map_err(|err| {
            log::warn!("udp: {name} attach stage failed: {err}");
            failure.into()
        })
    }

    /// The staged network attach: APN, context, socket, local address,
    /// remote connect.
    fn attach(&mut self) -> TransportResult<()> {
        self.stage(self.config.apn_config, ModemError::ApnConfigFailed)?;
        self.stage(self.config.context_activate, ModemError::ApnConfigFailed)?;
        self.stage(self.config.socket_create, ModemError::SocketCreateFailed)?;
        self.capture_address = true;
        let address = self.stage(self.config.local_address, ModemError::LocalAddressFailed);
        self.capture_address = false;
        address?;
        if self.local_address.is_none() {
            return Err(ModemError::LocalAddressFailed.into());
        }
        self.stage(self.config.remote_connect, ModemError::RemoteConnectFailed)?;
        Ok(())
    }

    fn maybe_forced_reset(&mut self) -> TransportResult<()> {
        if self.serious_errors < SERIOUS_ERROR_RESET_THRESHOLD {
            return Ok(());
        }
        log::warn!("udp: serious error threshold reached, forcing modem reset");
        let result = self
            .run_script(self.reset_script)
            .and_then(|_| self.run_script(self.init_script))
            .and_then(|_| self.attach());
        self.serious_errors = 0;
        result.map_err(|_| ModemError::ResetFailed)?;
        Ok(())
    }

    /// Issue the read command for one pending datagram and collect its
    /// counted payload.
    fn read_datagram(&mut self) -> TransportResult<()> {
        self.pending_reads = self.pending_reads.saturating_sub(1);
        let read = self.config.read_command.to_string();
        let mut out = read.clone();
        out.push_str("\r\n");
        self.inner
            .send(SendFlags::NONE, out.as_bytes(), self.command_timeout)?;
        let deadline = Instant::now() + self.command_timeout;
        // Header first.
        let length = loop {
            self.inner.run(Duration::ZERO)?;
            if let Some(line) = self.take_line() {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if let Some(rest) = text.strip_prefix(self.config.read_header) {
                    match first_int(rest) {
                        Some(length) => break length,
                        None => return Err(TransportError::UnexpectedData),
                    }
                }
                self.handle_line(&line);
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::ReadTimeout);
            }
            self.inner.run((deadline - now).min(RESPONSE_POLL))?;
        };
        // Then the counted payload bytes.
        let payload = loop {
            self.inner.run(Duration::ZERO)?;
            if let Some(payload) = self.take_raw(length) {
                break payload;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::ReadTimeout);
            }
            self.inner.run((deadline - now).min(RESPONSE_POLL))?;
        };
        self.inbound.push_back(payload);
        self.expect_final(self.command_timeout)
    }

    /// Scan stray inbound lines (receive notifications) outside a command.
    fn scan_notifications(&mut self) -> TransportResult<()> {
        while let Some(line) = self.take_line() {
            if Self::classify_final(&line).is_none() {
                self.handle_line(&line);
            }
        }
        if self.take_fault() {
            return Err(TransportError::Error);
        }
        Ok(())
    }

    fn deliver(&mut self) -> bool {
        let mut delivered = false;
        while let Some(payload) = self.inbound.pop_front() {
            if let Some(cb) = self.callback.as_mut() {
                cb(&payload);
                delivered = true;
            }
        }
        delivered
    }
}

fn first_int(s: &str) -> Option<usize> {
    let digits: String = s
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

impl<T: Transport> Transport for UdpModemTransport<T> {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        if version != TRANSPORT_VERSION {
            return Err(TransportError::VersionMismatch);
        }
        self.inner.init(version)?;
        let shared = Arc::clone(&self.shared);
        self.inner.register_callback(Box::new(move |bytes| {
            let mut shared = shared.lock();
            if bytes.is_empty() {
                shared.fault = true;
            } else {
                shared.buf.extend_from_slice(bytes);
            }
        }))?;
        self.run_script(self.init_script)?;
        self.attach()?;
        self.initialised = true;
        Ok(())
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        let _ = self.inner.deregister_callback();
        self.inner.shutdown()?;
        self.callback = None;
        self.inbound.clear();
        self.pending_reads = 0;
        self.initialised = false;
        self.local_address = None;
        self.serious_errors = 0;
        let mut shared = self.shared.lock();
        shared.buf.clear();
        shared.fault = false;
        Ok(())
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        Ok(self.mss)
    }

    fn client_id(&self) -> String {
        self.imsi
            .clone()
            .unwrap_or_else(|| "modemlink-modem-udp".to_string())
    }

    fn send(&mut self, flags: SendFlags, data: &[u8], timeout: Duration) -> TransportResult<()> {
        self.maybe_forced_reset()?;
        if flags.contains(SendFlags::JUST_FLUSH) && data.is_empty() {
            return Ok(());
        }
        if data.len() > self.mss {
            return Err(TransportError::IllegalArgument);
        }
        let vars = self.vars();
        let len = data.len().to_string();
        let mut borrowed: Vec<(&str, &str)> =
            vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        borrowed.push(("len", &len));
        let command = expand(self.config.send_command, &borrowed);
        let mut out = command;
        out.push_str("\r\n");
        self.inner.send(SendFlags::NONE, out.as_bytes(), timeout)?;
        self.inner.run(Duration::ZERO)?;
        self.discard_prompt();
        self.inner.send(flags, data, timeout)?;
        // Wait for the send confirmation.
        let deadline = Instant::now() + timeout;
        loop {
            self.inner.run(Duration::ZERO)?;
            while let Some(line) = self.take_line() {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if text.starts_with(self.config.send_confirm) {
                    self.serious_errors = 0;
                    return Ok(());
                }
                if text == "ERROR" || text.starts_with("+CME ERROR:") {
                    self.serious_errors += 1;
                    return Err(ModemError::DatagramSendFailed.into());
                }
                if text != "OK" {
                    self.handle_line(&line);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                self.serious_errors += 1;
                return Err(TransportError::SendTimeout);
            }
            self.inner.run((deadline - now).min(RESPONSE_POLL))?;
        }
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
            self.inner.run(Duration::ZERO)?;
            self.scan_notifications()?;
            while self.pending_reads > 0 {
                self.read_datagram()?;
            }
            if self.deliver() || timeout.is_zero() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.inner.run((deadline - now).min(RESPONSE_POLL))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QUECTEL_BG96;

    /// Raw-chunk stand-in for the ring-buffered serial chain: sent command
    /// lines are matched against rules and the responses delivered as raw
    /// bytes, terminators included.
    struct RawLink {
        rules: Vec<(String, Vec<u8>)>,
        pending: VecDeque<Vec<u8>>,
        callback: Option<TransportCallback>,
        sent: Vec<Vec<u8>>,
    }

    impl RawLink {
        fn new() -> Self {
            RawLink {
                rules: Vec::new(),
                pending: VecDeque::new(),
                callback: None,
                sent: Vec::new(),
            }
        }

        fn on(mut self, prefix: &str, response: &str) -> Self {
            self.rules
                .push((prefix.to_string(), response.as_bytes().to_vec()));
            self
        }

        fn push_raw(&mut self, bytes: &[u8]) {
            self.pending.push_back(bytes.to_vec());
        }

        fn sent_lines(&self) -> Vec<String> {
            self.sent
                .iter()
                .map(|b| String::from_utf8_lossy(b).trim_end().to_string())
                .collect()
        }
    }

    impl Transport for RawLink {
        fn init(&mut self, _version: u16) -> TransportResult<()> {
            Ok(())
        }

        fn shutdown(&mut self) -> TransportResult<()> {
            self.callback = None;
            Ok(())
        }

        fn buffer_capacity(&self) -> TransportResult<usize> {
            Ok(UDP_BUFFER_LEN + RESERVED_BUFFER)
        }

        fn client_id(&self) -> String {
            "raw-link".into()
        }

        fn send(&mut self, _: SendFlags, data: &[u8], _: Duration) -> TransportResult<()> {
            let command = String::from_utf8_lossy(data).trim_end().to_string();
            for (prefix, response) in &self.rules {
                if command.starts_with(prefix.as_str()) {
                    self.pending.push_back(response.clone());
                    break;
                }
            }
            self.sent.push(data.to_vec());
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

        fn run(&mut self, _timeout: Duration) -> TransportResult<()> {
            while let Some(chunk) = self.pending.pop_front() {
                if let Some(cb) = self.callback.as_mut() {
                    cb(&chunk);
                }
            }
            Ok(())
        }
    }

    fn endpoint() -> UdpEndpoint {
        UdpEndpoint {
            apn: "internet".to_string(),
            host: "10.20.30.40".to_string(),
            port: 5555,
        }
    }

    fn bg96_link() -> RawLink {
        RawLink::new()
            .on("AT+QIURC", "OK\r\n")
            .on("AT+QICSGP", "OK\r\n")
            .on("AT+QIACT=1", "OK\r\n")
            .on("AT+QIACT?", "+QIACT: 1,1,1,\"10.1.2.3\"\r\nOK\r\n")
            .on("AT+QIOPEN", "OK\r\n")
            .on("AT", "OK\r\n")
    }

    fn attached() -> UdpModemTransport<RawLink> {
        let mut udp = UdpModemTransport::new(bg96_link(), QUECTEL_BG96, endpoint());
        udp.set_command_timeout(Duration::from_millis(50));
        udp.init(TRANSPORT_VERSION).unwrap();
        udp
    }

    #[test]
    fn attach_runs_all_stages() {
        let udp = attached();
        assert_eq!(udp.local_address(), Some("10.1.2.3"));
        let sent = udp.inner.sent_lines();
        assert!(sent.iter().any(|l| l == "AT+QICSGP=1,1,\"internet\",\"\",\"\",1"));
        assert!(sent.iter().any(|l| l == "AT+QIACT=1"));
        assert!(sent
            .iter()
            .any(|l| l == "AT+QIOPEN=1,0,\"UDP\",\"10.20.30.40\",5555,0,0"));
    }

    #[test]
    fn apn_rejection_is_apn_config_failed() {
        let link = RawLink::new()
            .on("AT+QICSGP", "ERROR\r\n")
            .on("AT", "OK\r\n");
        let mut udp = UdpModemTransport::new(link, QUECTEL_BG96, endpoint());
        udp.set_command_timeout(Duration::from_millis(50));
        assert_eq!(
            udp.init(TRANSPORT_VERSION),
            Err(ModemError::ApnConfigFailed.into())
        );
    }

    #[test]
    fn socket_rejection_is_socket_create_failed() {
        let link = RawLink::new()
            .on("AT+QIOPEN", "ERROR\r\n")
            .on("AT+QIACT?", "+QIACT: 1,1,1,\"10.1.2.3\"\r\nOK\r\n")
            .on("AT", "OK\r\n");
        let mut udp = UdpModemTransport::new(link, QUECTEL_BG96, endpoint());
        udp.set_command_timeout(Duration::from_millis(50));
        assert_eq!(
            udp.init(TRANSPORT_VERSION),
            Err(ModemError::SocketCreateFailed.into())
        );
    }

    #[test]
    fn mss_cannot_change_after_init() {
        let mut udp = attached();
        assert_eq!(
            udp.set_bearer_mss(500),
            Err(ModemError::MssTooLate.into())
        );
    }

    #[test]
    fn mss_caps_buffer_capacity() {
        let mut udp = UdpModemTransport::new(bg96_link(), QUECTEL_BG96, endpoint());
        udp.set_bearer_mss(512).unwrap();
        assert_eq!(udp.buffer_capacity(), Ok(512));
    }

    #[test]
    fn datagram_send_waits_for_confirmation() {
        let mut udp = attached();
        udp.inner.rules.insert(
            0,
            ("AT+QISEND".to_string(), b"> ".to_vec()),
        );
        // Confirmation arrives with the payload echo.
        udp.inner.push_raw(b"SEND OK\r\n");
        udp.send(SendFlags::NONE, &[1, 2, 3, 4], Duration::from_millis(50))
            .unwrap();
        let sent = udp.inner.sent_lines();
        assert!(sent.iter().any(|l| l == "AT+QISEND=0,4"));
        assert_eq!(udp.inner.sent.last().unwrap(), &vec![1, 2, 3, 4]);
    }

    #[test]
    fn datagram_rejection_is_send_failed() {
        let mut udp = attached();
        udp.inner
            .rules
            .insert(0, ("AT+QISEND".to_string(), b"ERROR\r\n".to_vec()));
        assert_eq!(
            udp.send(SendFlags::NONE, &[1, 2, 3], Duration::from_millis(50)),
            Err(ModemError::DatagramSendFailed.into())
        );
    }

    #[test]
    fn receive_notification_triggers_read_and_delivery() {
        let mut udp = attached();
        udp.inner.rules.insert(
            0,
            (
                "AT+QIRD".to_string(),
                b"+QIRD: 4\r\n\x01\x02\x03\x04\r\nOK\r\n".to_vec(),
            ),
        );
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        udp.register_callback(Box::new(move |bytes| sink.lock().push(bytes.to_vec())))
            .unwrap();
        udp.inner.push_raw(b"+QIURC: \"recv\",0,4\r\n");
        udp.run(Duration::ZERO).unwrap();
        assert_eq!(&*seen.lock(), &vec![vec![1, 2, 3, 4]]);
    }

    #[test]
    fn binary_payload_may_begin_with_a_line_terminator_byte() {
        for payload in [[0x0Au8, 0x02, 0x03, 0x04], [0x0D, 0x02, 0x03, 0x04]] {
            let mut udp = attached();
            let mut response = b"+QIRD: 4\r\n".to_vec();
            response.extend_from_slice(&payload);
            response.extend_from_slice(b"\r\nOK\r\n");
            udp.inner.rules.insert(0, ("AT+QIRD".to_string(), response));
            let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            udp.register_callback(Box::new(move |bytes| sink.lock().push(bytes.to_vec())))
                .unwrap();
            udp.inner.push_raw(b"+QIURC: \"recv\",0,4\r\n");
            udp.run(Duration::ZERO).unwrap();
            assert_eq!(&*seen.lock(), &vec![payload.to_vec()]);
        }
    }

    #[test]
    fn oversized_datagram_is_rejected_up_front() {
        let mut udp = attached();
        let oversized = vec![0u8; UDP_BUFFER_LEN + 1];
        assert_eq!(
            udp.send(SendFlags::NONE, &oversized, Duration::from_millis(50)),
            Err(TransportError::IllegalArgument)
        );
    }
}
