//! Scripted AT endpoint for exercising modem drivers without hardware.
//!
//! Stands in for the line-buffered serial chain underneath a modem
//! transport: every sent command line is matched against a rule table and
//! the rule's response lines are queued for delivery on the next `run`, one
//! line per callback invocation.

use std::collections::VecDeque;
use std::time::Duration;

use modemlink_transport::{
    SendFlags, Transport, TransportCallback, TransportError, TransportResult, TRANSPORT_VERSION,
    USSD_BUFFER_LEN,
};

struct Rule {
    prefix: String,
    responses: Vec<Vec<u8>>,
    once: bool,
    used: bool,
}

/// Rule-driven stand-in for a real modem behind a line buffer.
pub struct ScriptedModemLink {
    rules: Vec<Rule>,
    pending: VecDeque<Vec<u8>>,
    callback: Option<TransportCallback>,
    sent: Vec<String>,
}

impl ScriptedModemLink {
    /// Create a link with no rules; unmatched commands get no response.
    pub fn new() -> Self {
        ScriptedModemLink {
            rules: Vec::new(),
            pending: VecDeque::new(),
            callback: None,
            sent: Vec::new(),
        }
    }

    /// Respond to every command starting with `prefix` with `responses`,
    /// one line each.
    pub fn on(mut self, prefix: &str, responses: &[&str]) -> Self {
        self.rules.push(Rule {
            prefix: prefix.to_string(),
            responses: responses.iter().map(|r| r.as_bytes().to_vec()).collect(),
            once: false,
            used: false,
        });
        self
    }

    /// Like [`on`](Self::on) but the rule matches only the first time,
    /// letting later rules with the same prefix take over.
    pub fn on_once(mut self, prefix: &str, responses: &[&str]) -> Self {
        self.rules.push(Rule {
            prefix: prefix.to_string(),
            responses: responses.iter().map(|r| r.as_bytes().to_vec()).collect(),
            once: true,
            used: false,
        });
        self
    }

    /// Queue an unsolicited line for delivery on the next `run`.
    pub fn push_unsolicited(&mut self, line: &str) {
        self.pending.push_back(line.as_bytes().to_vec());
    }

    /// Every command line sent so far, terminators stripped.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }
}

impl Default for ScriptedModemLink {
    fn default() -> Self {
        ScriptedModemLink::new()
    }
}

impl Transport for ScriptedModemLink {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        if version != TRANSPORT_VERSION {
            return Err(TransportError::VersionMismatch);
        }
        Ok(())
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        self.pending.clear();
        self.callback = None;
        Ok(())
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        Ok(USSD_BUFFER_LEN * 2)
    }

    fn client_id(&self) -> String {
        "scripted".to_string()
    }

    fn send(&mut self, _flags: SendFlags, data: &[u8], _timeout: Duration) -> TransportResult<()> {
        let command = String::from_utf8_lossy(data).trim_end().to_string();
        for rule in self.rules.iter_mut() {
            if rule.used && rule.once {
                continue;
            }
            if command.starts_with(&rule.prefix) {
                rule.used = true;
                self.pending.extend(rule.responses.iter().cloned());
                self.sent.push(command);
                return Ok(());
            }
        }
        self.sent.push(command);
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
        while let Some(line) = self.pending.pop_front() {
            if let Some(cb) = self.callback.as_mut() {
                cb(&line);
            }
        }
        Ok(())
    }
}
