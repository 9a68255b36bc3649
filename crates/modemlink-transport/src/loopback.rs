//! In-process leaf transports for exercising a chain without hardware.

use std::collections::VecDeque;
use std::time::Duration;

use crate::api::{SendFlags, Transport, TransportCallback, TRANSPORT_VERSION};
use crate::error::{TransportError, TransportResult};

/// Leaf that queues every sent payload and redelivers it upward on `run`,
/// preserving order.
pub struct LoopbackTransport {
    queue: VecDeque<Vec<u8>>,
    callback: Option<TransportCallback>,
    send_observer: Option<Box<dyn FnMut(&[u8]) + Send>>,
    capacity: usize,
}

impl LoopbackTransport {
    /// Create a loopback with the given payload capacity.
    pub fn new(capacity: usize) -> Self {
        LoopbackTransport {
            queue: VecDeque::new(),
            callback: None,
            send_observer: None,
            capacity,
        }
    }

    /// Observe the raw bytes of every send, for assertions on the carrier
    /// representation.
    pub fn set_send_observer(&mut self, observer: Box<dyn FnMut(&[u8]) + Send>) {
        self.send_observer = Some(observer);
    }

    /// Number of queued, not yet redelivered payloads.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Transport for LoopbackTransport {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        if version != TRANSPORT_VERSION {
            return Err(TransportError::VersionMismatch);
        }
        Ok(())
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        self.queue.clear();
        self.callback = None;
        Ok(())
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        Ok(self.capacity)
    }

    fn client_id(&self) -> String {
        "loopback".to_string()
    }

    fn send(&mut self, flags: SendFlags, data: &[u8], _timeout: Duration) -> TransportResult<()> {
        if let Some(observer) = self.send_observer.as_mut() {
            observer(data);
        }
        if flags.contains(SendFlags::JUST_FLUSH) && data.is_empty() {
            return Ok(());
        }
        if data.len() > self.capacity {
            return Err(TransportError::ReadOverflow);
        }
        self.queue.push_back(data.to_vec());
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
        while let Some(message) = self.queue.pop_front() {
            if let Some(cb) = self.callback.as_mut() {
                cb(&message);
            }
        }
        Ok(())
    }
}

/// Leaf whose sends never complete: `send` consumes the whole budget and
/// reports the timeout, for exercising the timeout discipline of the layers
/// above.
pub struct BlackholeTransport {
    capacity: usize,
}

impl BlackholeTransport {
    /// Create a blackhole with the given advertised capacity.
    pub fn new(capacity: usize) -> Self {
        BlackholeTransport { capacity }
    }
}

impl Transport for BlackholeTransport {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        if version != TRANSPORT_VERSION {
            return Err(TransportError::VersionMismatch);
        }
        Ok(())
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        Ok(())
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        Ok(self.capacity)
    }

    fn client_id(&self) -> String {
        "blackhole".to_string()
    }

    fn send(&mut self, _flags: SendFlags, _data: &[u8], timeout: Duration) -> TransportResult<()> {
        std::thread::sleep(timeout);
        Err(TransportError::SendTimeout)
    }

    fn register_callback(&mut self, _callback: TransportCallback) -> TransportResult<()> {
        Ok(())
    }

    fn deregister_callback(&mut self) -> TransportResult<()> {
        Ok(())
    }

    fn run(&mut self, _timeout: Duration) -> TransportResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use parking_lot::Mutex;

    #[test]
    fn redelivers_in_order() {
        let mut loopback = LoopbackTransport::new(64);
        loopback.init(TRANSPORT_VERSION).unwrap();
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        loopback
            .register_callback(Box::new(move |bytes| sink.lock().push(bytes.to_vec())))
            .unwrap();
        for i in 0..5u8 {
            loopback
                .send(SendFlags::NONE, &[i], Duration::from_millis(10))
                .unwrap();
        }
        loopback.run(Duration::ZERO).unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        for (i, message) in seen.iter().enumerate() {
            assert_eq!(message, &vec![i as u8]);
        }
    }

    #[test]
    fn blackhole_times_out_within_budget() {
        let mut hole = BlackholeTransport::new(64);
        hole.init(TRANSPORT_VERSION).unwrap();
        let started = Instant::now();
        let result = hole.send(SendFlags::NONE, b"x", Duration::from_millis(30));
        assert_eq!(result, Err(TransportError::SendTimeout));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(300));
    }
}
