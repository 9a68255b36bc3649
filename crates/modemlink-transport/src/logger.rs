//! Transparent traffic logging decorator.
//!
//! Passes every send and every inbound callback through unmodified while
//! rendering the traffic via the `log` crate, gated by a verbosity bitmask.
//! Payload bytes and ordering are never altered; the only overhead is the
//! synchronous formatting latency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::api::{SendFlags, Transport, TransportCallback};
use crate::error::TransportResult;

/// Verbosity categories for [`LogTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogFlags(u8);

impl LogFlags {
    /// Log operation entry/exit and payload lengths.
    pub const TRACE: LogFlags = LogFlags(1 << 0);
    /// Log full payload bytes.
    pub const VERBOSE: LogFlags = LogFlags(1 << 1);
    /// Log the send-flag bits travelling with each payload.
    pub const PROTOCOL: LogFlags = LogFlags(1 << 2);
    /// Prefix log lines with milliseconds since the decorator was created.
    pub const TIME: LogFlags = LogFlags(1 << 3);

    /// All categories enabled.
    pub const ALL: LogFlags = LogFlags(0x0F);

    /// Raw bit representation.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: LogFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for LogFlags {
    type Output = LogFlags;

    fn bitor(self, rhs: LogFlags) -> LogFlags {
        LogFlags(self.0 | rhs.0)
    }
}

/// Renders payload bytes for the verbose log lines.
pub type LogFormatter = fn(&[u8]) -> String;

/// The default [`LogFormatter`]: printable text is quoted, anything else is
/// rendered as hex.
pub fn text_preview(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if text.chars().all(|c| !c.is_control() || c == '\r' || c == '\n') => {
            format!("{:?}", text)
        }
        _ => format!("{:02X?}", bytes),
    }
}

/// Decorator that observes bytes crossing a layer boundary.
pub struct LogTransport<T: Transport> {
    inner: T,
    label: &'static str,
    flags: LogFlags,
    formatter: Arc<Mutex<LogFormatter>>,
    callback: Arc<Mutex<Option<TransportCallback>>>,
    epoch: Instant,
}

impl<T: Transport> LogTransport<T> {
    /// Wrap `inner`, tagging log lines with `label`.
    pub fn new(inner: T, label: &'static str, flags: LogFlags) -> Self {
        LogTransport {
            inner,
            label,
            flags,
            formatter: Arc::new(Mutex::new(text_preview as LogFormatter)),
            callback: Arc::new(Mutex::new(None)),
            epoch: Instant::now(),
        }
    }

    /// Replace the payload renderer, in both directions, effective
    /// immediately.
    pub fn set_formatter(&mut self, formatter: LogFormatter) {
        *self.formatter.lock() = formatter;
    }

    fn stamp(&self) -> String {
        if self.flags.contains(LogFlags::TIME) {
            format!("[{}ms] ", self.epoch.elapsed().as_millis())
        } else {
            String::new()
        }
    }
}

impl<T: Transport> Transport for LogTransport<T> {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        if self.flags.contains(LogFlags::TRACE) {
            log::trace!("{}{}: init v{version:#06x}", self.stamp(), self.label);
        }
        self.inner.init(version)?;
        let flags = self.flags;
        let label = self.label;
        let epoch = self.epoch;
        let formatter = Arc::clone(&self.formatter);
        let upward = Arc::clone(&self.callback);
        self.inner.register_callback(Box::new(move |bytes| {
            let stamp = if flags.contains(LogFlags::TIME) {
                format!("[{}ms] ", epoch.elapsed().as_millis())
            } else {
                String::new()
            };
            if flags.contains(LogFlags::VERBOSE) {
                let render = *formatter.lock();
                let rendered = render(bytes);
                log::trace!("{stamp}{label} <- {} bytes: {}", bytes.len(), rendered);
            } else if flags.contains(LogFlags::TRACE) {
                log::trace!("{stamp}{label} <- {} bytes", bytes.len());
            }
            if let Some(cb) = upward.lock().as_mut() {
                cb(bytes);
            }
        }))
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        if self.flags.contains(LogFlags::TRACE) {
            log::trace!("{}{}: shutdown", self.stamp(), self.label);
        }
        let _ = self.inner.deregister_callback();
        self.inner.shutdown()?;
        *self.callback.lock() = None;
        Ok(())
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        self.inner.buffer_capacity()
    }

    fn client_id(&self) -> String {
        self.inner.client_id()
    }

    fn send(&mut self, flags: SendFlags, data: &[u8], timeout: Duration) -> TransportResult<()> {
        if self.flags.contains(LogFlags::PROTOCOL) {
            log::debug!(
                "{}{} -> {} bytes, flags {:#06x}",
                self.stamp(),
                self.label,
                data.len(),
                flags.bits()
            );
        }
        if self.flags.contains(LogFlags::VERBOSE) {
            let render = *self.formatter.lock();
            let rendered = render(data);
            log::trace!("{}{} -> {}", self.stamp(), self.label, rendered);
        }
        let result = self.inner.send(flags, data, timeout);
        if let Err(err) = &result {
            log::debug!("{}{}: send failed: {err} ({})", self.stamp(), self.label, err.code());
        }
        result
    }

    fn register_callback(&mut self, callback: TransportCallback) -> TransportResult<()> {
        *self.callback.lock() = Some(callback);
        Ok(())
    }

    fn deregister_callback(&mut self) -> TransportResult<()> {
        *self.callback.lock() = None;
        Ok(())
    }

    fn run(&mut self, timeout: Duration) -> TransportResult<()> {
        self.inner.run(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TRANSPORT_VERSION;
    use crate::loopback::LoopbackTransport;

    #[test]
    fn passes_payload_through_unaltered() {
        let mut logger = LogTransport::new(
            LoopbackTransport::new(64),
            "test",
            LogFlags::ALL,
        );
        logger.init(TRANSPORT_VERSION).unwrap();
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        logger
            .register_callback(Box::new(move |bytes| sink.lock().push(bytes.to_vec())))
            .unwrap();
        let payload = [1u8, 2, 3, 0xAB];
        logger
            .send(SendFlags::USSD_SESSION_END, &payload, Duration::from_millis(10))
            .unwrap();
        logger.run(Duration::ZERO).unwrap();
        assert_eq!(&*seen.lock(), &vec![payload.to_vec()]);
    }

    #[test]
    fn default_formatter_quotes_text_and_hexes_binary() {
        assert_eq!(text_preview(b"OK\r\n"), "\"OK\\r\\n\"");
        assert_eq!(text_preview(&[0x00, 0xAB]), "[00, AB]");
    }

    #[test]
    fn custom_formatter_does_not_alter_payload() {
        fn lengths_only(bytes: &[u8]) -> String {
            format!("<{} bytes>", bytes.len())
        }
        let mut logger = LogTransport::new(
            LoopbackTransport::new(64),
            "fmt",
            LogFlags::VERBOSE,
        );
        logger.set_formatter(lengths_only);
        logger.init(TRANSPORT_VERSION).unwrap();
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        logger
            .register_callback(Box::new(move |bytes| sink.lock().push(bytes.to_vec())))
            .unwrap();
        let payload = [0u8, 0xFF, b'\n'];
        logger
            .send(SendFlags::NONE, &payload, Duration::from_millis(10))
            .unwrap();
        logger.run(Duration::ZERO).unwrap();
        assert_eq!(&*seen.lock(), &vec![payload.to_vec()]);
    }

    #[test]
    fn flag_bits_match_legacy_mask() {
        assert_eq!(LogFlags::TRACE.bits(), 1);
        assert_eq!(LogFlags::VERBOSE.bits(), 2);
        assert_eq!(LogFlags::PROTOCOL.bits(), 4);
        assert_eq!(LogFlags::TIME.bits(), 8);
    }
}
