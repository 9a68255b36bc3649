//! Line buffering between the serial leaf and a modem driver.
//!
//! Accumulates the interrupt-delivered byte trickle into discrete
//! newline-terminated records and delivers exactly one record per upward
//! callback invocation. The accumulation happens in the inner transport's
//! delivery context; records are handed upward only from [`deliver`]
//! (normally called by `run`), never from the interrupt side.
//!
//! [`deliver`]: LineBufferTransport::deliver

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::api::{SendFlags, SharedTransport, Transport, TransportCallback, TRANSPORT_VERSION};
use crate::error::{TransportError, TransportResult};

struct LineShared {
    acc: BytesMut,
    records: VecDeque<Vec<u8>>,
    capacity: usize,
    /// The last record was force-split at capacity; whether that was an
    /// overflow depends on the next byte.
    at_capacity: bool,
    overflowed: bool,
    fault: bool,
}

impl LineShared {
    fn push_bytes(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            // Zero-length is the leaf's hardware fault sentinel.
            self.fault = true;
            return;
        }
        for &b in bytes {
            match b {
                b'\r' | b'\n' => {
                    // A terminator right after a force-split means the line
                    // was exactly capacity long, not too long.
                    self.at_capacity = false;
                    if !self.acc.is_empty() {
                        let record = self.acc.split().to_vec();
                        self.records.push_back(record);
                    }
                }
                _ => {
                    if self.at_capacity {
                        self.overflowed = true;
                        self.at_capacity = false;
                    }
                    self.acc.extend_from_slice(&[b]);
                    if self.acc.len() >= self.capacity {
                        let record = self.acc.split().to_vec();
                        self.records.push_back(record);
                        self.at_capacity = true;
                    }
                }
            }
        }
    }
}

/// Transport that turns a raw byte stream into newline-delimited records.
pub struct LineBufferTransport<T: Transport> {
    inner: T,
    shared: Arc<Mutex<LineShared>>,
    callback: Option<TransportCallback>,
    capacity: usize,
}

impl<T: Transport> LineBufferTransport<T> {
    /// Wrap `inner`, accumulating lines of at most `capacity` bytes.
    pub fn new(inner: T, capacity: usize) -> Self {
        LineBufferTransport {
            inner,
            shared: Arc::new(Mutex::new(LineShared {
                acc: BytesMut::with_capacity(capacity),
                records: VecDeque::new(),
                capacity,
                at_capacity: false,
                overflowed: false,
                fault: false,
            })),
            callback: None,
            capacity,
        }
    }

    /// Push any complete buffered records to the layer above. Must not be
    /// called from an interrupt context. Returns whether anything was
    /// delivered.
    pub fn deliver(&mut self) -> TransportResult<bool> {
        let mut delivered = false;
        if self.callback.is_some() {
            loop {
                // The lock is dropped before the callback runs so that a
                // nested pump of the inner transport cannot corrupt the
                // accumulation state.
                let record = self.shared.lock().records.pop_front();
                match record {
                    Some(record) => {
                        if let Some(cb) = self.callback.as_mut() {
                            cb(&record);
                            delivered = true;
                        }
                    }
                    None => break,
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

impl<T: Transport> Transport for LineBufferTransport<T> {
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
        shared.acc.clear();
        shared.records.clear();
        shared.at_capacity = false;
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
            // Pump immediately-ready hardware events, then try to deliver.
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

// ============================================================================
// Wrapper pool
// ============================================================================

/// A shared line-buffer wrapper handle as returned by [`LineBufferPool`].
pub type SharedLineBuffer = Arc<Mutex<LineBufferTransport<SharedTransport>>>;

/// Fixed-capacity pool enforcing one line-buffer wrapper per inner transport.
///
/// Obtaining a wrapper for an inner instance that is already wrapped returns
/// the existing wrapper handle instead of creating a duplicate buffer over
/// the same byte stream.
pub struct LineBufferPool {
    limit: usize,
    entries: Vec<(usize, SharedLineBuffer)>,
}

impl LineBufferPool {
    /// Create a pool holding at most `limit` wrapper instances.
    pub fn new(limit: usize) -> Self {
        LineBufferPool {
            limit,
            entries: Vec::new(),
        }
    }

    /// Return the wrapper for `inner`, creating it on first use. Fails once
    /// the pool is exhausted.
    pub fn obtain(
        &mut self,
        inner: SharedTransport,
        capacity: usize,
    ) -> TransportResult<SharedLineBuffer> {
        let key = Arc::as_ptr(&inner) as *const u8 as usize;
        if let Some((_, wrapper)) = self.entries.iter().find(|(k, _)| *k == key) {
            return Ok(Arc::clone(wrapper));
        }
        if self.entries.len() >= self.limit {
            return Err(TransportError::Error);
        }
        let wrapper = Arc::new(Mutex::new(LineBufferTransport::new(inner, capacity)));
        self.entries.push((key, Arc::clone(&wrapper)));
        Ok(wrapper)
    }
}
