//! Ring buffering for binary modem chains.
//!
//! The line buffer assumes a text dialect; UDP-capable modem engines receive
//! binary payload chunks as well, so this variant accumulates raw bytes in a
//! bounded circular buffer and delivers whatever has arrived as one record
//! per `run`. Writes on the delivery path never block: when the buffer is
//! full the byte is dropped and the overflow is reported from the next `run`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::api::{SendFlags, Transport, TransportCallback, TRANSPORT_VERSION};
use crate::error::{TransportError, TransportResult};

struct RingState {
    buf: VecDeque<u8>,
    capacity: usize,
    overflowed: bool,
    fault: bool,
}

impl RingState {
    fn push_bytes(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            self.fault = true;
            return;
        }
        for &b in bytes {
            if self.buf.len() >= self.capacity {
                self.overflowed = true;
            } else {
                self.buf.push_back(b);
            }
        }
    }
}

/// Transport that accumulates raw bytes in a bounded circular buffer.
pub struct RingBufferTransport<T: Transport> {
    inner: T,
    shared: Arc<Mutex<RingState>>,
    callback: Option<TransportCallback>,
    capacity: usize,
}

impl<T: Transport> RingBufferTransport<T> {
    /// Wrap `inner` with a ring of `capacity` bytes. The capacity must hold
    /// at least one maximum protocol unit of the layer above.
    pub fn new(inner: T, capacity: usize) -> Self {
        RingBufferTransport {
            inner,
            shared: Arc::new(Mutex::new(RingState {
                buf: VecDeque::with_capacity(capacity),
                capacity,
                overflowed: false,
                fault: false,
            })),
            callback: None,
            capacity,
        }
    }

    /// Hand all buffered bytes upward as one record.
    pub fn deliver(&mut self) -> TransportResult<bool> {
        let mut delivered = false;
        if self.callback.is_some() {
            let chunk: Vec<u8> = {
                let mut shared = self.shared.lock();
                shared.buf.drain(..).collect()
            };
            if !chunk.is_empty() {
                if let Some(cb) = self.callback.as_mut() {
                    cb(&chunk);
                    delivered = true;
                }
            }
        }
        let (overflowed, fault) = {
            let mut shared = self.shared.lock();
            let flags = (shared.overflowed, shared.fault);
            shared.overflowed = false;
            shared.fault = false;
            flags
        };
        if fault {
            return Err(TransportError::Error);
        }
        if overflowed {
            return Err(TransportError::ReadOverflow);
        }
        Ok(delivered)
    }
}

impl<T: Transport> Transport for RingBufferTransport<T> {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        if version != TRANSPORT_VERSION {
            return Err(TransportError::VersionMismatch);
        }
        self.inner.init(version)?;
        let shared = Arc::clone(&self.shared);
        self.inner
            .register_callback(Box::new(move |bytes| shared.lock().push_bytes(bytes)))
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        let _ = self.inner.deregister_callback();
        self.inner.shutdown()?;
        self.callback = None;
        let mut shared = self.shared.lock();
        shared.buf.clear();
        shared.overflowed = false;
        shared.fault = false;
        Ok(())
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        Ok(self.capacity)
    }

    fn client_id(&self) -> String {
        self.inner.client_id()
    }

    fn send(&mut self, flags: SendFlags, data: &[u8], timeout: Duration) -> TransportResult<()> {
        self.inner.send(flags, data, timeout)
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
        let deadline = Instant::now() + timeout;
        loop {
            self.inner.run(Duration::ZERO)?;
            if self.deliver()? || timeout.is_zero() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.inner.run(deadline - now)?;
        }
    }
}
