//! Reversible payload codecs.
//!
//! USSD is a text-only carrier, so binary protocol payloads are base64
//! encoded on the way down and decoded on the way back up. One encode
//! corresponds to exactly one decode producing a byte-identical payload; the
//! codec never changes the logical message boundary. For carriers that
//! already accept arbitrary bytes there is a no-op passthrough with the same
//! contract.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;

use crate::api::{SendFlags, Transport, TransportCallback, TRANSPORT_VERSION};
use crate::error::{TransportError, TransportResult};

struct CodecShared {
    decoded: VecDeque<Vec<u8>>,
    bad_input: bool,
}

/// Transport that base64-encodes outbound payloads and decodes inbound ones.
pub struct Base64CodecTransport<T: Transport> {
    inner: T,
    shared: Arc<Mutex<CodecShared>>,
    callback: Option<TransportCallback>,
}

impl<T: Transport> Base64CodecTransport<T> {
    /// Wrap `inner` with base64 encoding.
    pub fn new(inner: T) -> Self {
        Base64CodecTransport {
            inner,
            shared: Arc::new(Mutex::new(CodecShared {
                decoded: VecDeque::new(),
                bad_input: false,
            })),
            callback: None,
        }
    }

    /// Direct access to the inner transport.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    fn deliver(&mut self) -> TransportResult<bool> {
        let mut delivered = false;
        if self.callback.is_some() {
            loop {
                let message = self.shared.lock().decoded.pop_front();
                match message {
                    Some(message) => {
                        if let Some(cb) = self.callback.as_mut() {
                            cb(&message);
                            delivered = true;
                        }
                    }
                    None => break,
                }
            }
        }
        let bad_input = {
            let mut shared = self.shared.lock();
            std::mem::take(&mut shared.bad_input)
        };
        if bad_input {
            return Err(TransportError::UnexpectedData);
        }
        Ok(delivered)
    }
}

impl<T: Transport> Transport for Base64CodecTransport<T> {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        if version != TRANSPORT_VERSION {
            return Err(TransportError::VersionMismatch);
        }
        self.inner.init(version)?;
        let shared = Arc::clone(&self.shared);
        self.inner.register_callback(Box::new(move |bytes| {
            let mut shared = shared.lock();
            match STANDARD.decode(bytes) {
                // An empty decode is the leaf's fault sentinel travelling
                // through unchanged.
                Ok(decoded) => shared.decoded.push_back(decoded),
                Err(err) => {
                    log::warn!("base64: undecodable inbound payload: {err}");
                    shared.bad_input = true;
                }
            }
        }))
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        let _ = self.inner.deregister_callback();
        self.inner.shutdown()?;
        self.callback = None;
        let mut shared = self.shared.lock();
        shared.decoded.clear();
        shared.bad_input = false;
        Ok(())
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        // Base64 expands 3 payload bytes into 4 carrier bytes.
        let inner = self.inner.buffer_capacity()?;
        Ok(inner / 4 * 3)
    }

    fn client_id(&self) -> String {
        self.inner.client_id()
    }

    fn send(&mut self, flags: SendFlags, data: &[u8], timeout: Duration) -> TransportResult<()> {
        if flags.contains(SendFlags::JUST_FLUSH) && data.is_empty() {
            return self.inner.send(flags, data, timeout);
        }
        let encoded = STANDARD.encode(data);
        self.inner.send(flags, encoded.as_bytes(), timeout)
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

/// No-op codec for carriers that accept arbitrary bytes (pure UDP). Keeps
/// the chain shape identical so the layers above never care which carrier is
/// underneath.
pub struct PassthroughCodec<T: Transport> {
    inner: T,
}

impl<T: Transport> PassthroughCodec<T> {
    /// Wrap `inner` without transforming the payload.
    pub fn new(inner: T) -> Self {
        PassthroughCodec { inner }
    }
}

impl<T: Transport> Transport for PassthroughCodec<T> {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        self.inner.init(version)
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        self.inner.shutdown()
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        self.inner.buffer_capacity()
    }

    fn client_id(&self) -> String {
        self.inner.client_id()
    }

    fn send(&mut self, flags: SendFlags, data: &[u8], timeout: Duration) -> TransportResult<()> {
        self.inner.send(flags, data, timeout)
    }

    fn register_callback(&mut self, callback: TransportCallback) -> TransportResult<()> {
        self.inner.register_callback(callback)
    }

    fn deregister_callback(&mut self) -> TransportResult<()> {
        self.inner.deregister_callback()
    }

    fn run(&mut self, timeout: Duration) -> TransportResult<()> {
        self.inner.run(timeout)
    }
}
