//! Protocol framing transport.
//!
//! Splits logical protocol messages into frames that fit the inner
//! transport's capacity and reassembles inbound multi-part transfers before
//! the upward callback fires once with the complete message.
//!
//! Frame layout: `[seq, part, ...]` where bit 7 of the part byte marks the
//! last part and bits 0..6 are the part index. The first part additionally
//! carries a block count and that many `[type, len, value]` metadata blocks
//! between the header and the payload (user-agent, GSM bearer info).
//! Parts of one message depart and must arrive strictly in sequence.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BufMut;
use parking_lot::Mutex;

use modemlink_transport::{
    BearerHandle, SendFlags, Transport, TransportCallback, TransportError, TransportResult,
    TRANSPORT_VERSION,
};

/// Bit 7 of the part byte: this is the final part of the message.
const PART_LAST: u8 = 0x80;

/// Metadata block: UTF-8 user-agent string.
const BLOCK_USER_AGENT: u8 = 1;

/// Metadata block: one strength byte followed by the operator name.
const BLOCK_GSM_BEARER: u8 = 2;

/// Fixed header bytes on the first part: seq, part, block count.
const FIRST_HEADER_LEN: usize = 3;

/// Fixed header bytes on continuation parts: seq, part.
const CONT_HEADER_LEN: usize = 2;

struct Reassembly {
    seq: u8,
    next_part: u8,
    buf: Vec<u8>,
}

/// Transport that frames logical messages over a capacity-limited inner
/// transport.
pub struct FramingTransport<T: Transport> {
    inner: T,
    seq: u8,
    /// Reassembly buffer capacity; `None` disables multi-part transfers.
    dedicated: Option<usize>,
    reassembly: Option<Reassembly>,
    frames: Arc<Mutex<VecDeque<Vec<u8>>>>,
    callback: Option<TransportCallback>,
    user_agent: String,
    bearer: Option<BearerHandle>,
    session_delay: Option<Duration>,
    last_session: Option<Instant>,
}

impl<T: Transport> FramingTransport<T> {
    /// Frame messages over `inner`, single-frame messages only.
    pub fn new(inner: T) -> Self {
        FramingTransport {
            inner,
            seq: 0,
            dedicated: None,
            reassembly: None,
            frames: Arc::new(Mutex::new(VecDeque::new())),
            callback: None,
            user_agent: String::new(),
            bearer: None,
            session_delay: None,
            last_session: None,
        }
    }

    /// Enable multi-part transfers with a dedicated buffer of `capacity`
    /// bytes.
    pub fn with_dedicated_buffer(mut self, capacity: usize) -> Self {
        self.dedicated = Some(capacity);
        self
    }

    /// The user-agent string sent when a payload requests it.
    pub fn set_user_agent(&mut self, agent: &str) {
        self.user_agent = agent.to_string();
    }

    /// Source of bearer info for payloads that request it.
    pub fn set_bearer(&mut self, bearer: BearerHandle) {
        self.bearer = Some(bearer);
    }

    /// Minimum gap between sends, matching the carrier's session pacing.
    pub fn set_session_delay(&mut self, delay: Duration) {
        self.session_delay = Some(delay);
    }

    /// Direct access to the inner transport.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    fn metadata_blocks(&self, flags: SendFlags) -> Vec<u8> {
        let mut blocks = Vec::new();
        let mut count = 0u8;
        if flags.contains(SendFlags::NEED_USERAGENT) && !self.user_agent.is_empty() {
            blocks.push(BLOCK_USER_AGENT);
            blocks.push(self.user_agent.len().min(255) as u8);
            blocks.extend_from_slice(&self.user_agent.as_bytes()[..self.user_agent.len().min(255)]);
            count += 1;
        }
        if flags.contains(SendFlags::WANT_GSM_BEARER) {
            if let Some(bearer) = &self.bearer {
                let info = bearer.lock().clone();
                // Absence is signalled by omission, never by blocking.
                if !info.name.is_empty() || info.strength != 0 {
                    let name = &info.name.as_bytes()[..info.name.len().min(254)];
                    blocks.push(BLOCK_GSM_BEARER);
                    blocks.push((name.len() + 1) as u8);
                    blocks.push(info.strength);
                    blocks.extend_from_slice(name);
                    count += 1;
                }
            }
        }
        let mut out = Vec::with_capacity(blocks.len() + 1);
        out.push(count);
        out.extend_from_slice(&blocks);
        out
    }

    fn enforce_session_delay(&mut self) {
        if let (Some(delay), Some(last)) = (self.session_delay, self.last_session) {
            let elapsed = last.elapsed();
            if elapsed < delay {
                std::thread::sleep(delay - elapsed);
            }
        }
    }

    /// Consume one inbound frame, returning a complete message when this
    /// frame finishes one.
    fn accept_frame(&mut self, frame: &[u8]) -> TransportResult<Option<Vec<u8>>> {
        if frame.len() < CONT_HEADER_LEN {
            return Err(TransportError::UnexpectedData);
        }
        let seq = frame[0];
        let last = frame[1] & PART_LAST != 0;
        let part = frame[1] & !PART_LAST;
        let payload = if part == 0 {
            if self.reassembly.take().is_some() {
                log::warn!("framing: new message interrupted a partial reassembly");
                return Err(TransportError::InternalError);
            }
            let mut rest = frame
                .get(FIRST_HEADER_LEN..)
                .ok_or(TransportError::UnexpectedData)?;
            let nblocks = frame[2];
            for _ in 0..nblocks {
                if rest.len() < 2 || rest.len() < 2 + rest[1] as usize {
                    return Err(TransportError::UnexpectedData);
                }
                rest = &rest[2 + rest[1] as usize..];
            }
            rest
        } else {
            match &self.reassembly {
                Some(r) if r.seq == seq && r.next_part == part => {}
                _ => {
                    self.reassembly = None;
                    return Err(TransportError::InternalError);
                }
            }
            &frame[CONT_HEADER_LEN..]
        };
        if !last && self.dedicated.is_none() {
            return Err(TransportError::InternalError);
        }
        let mut buf = match self.reassembly.take() {
            Some(r) => r.buf,
            None => Vec::new(),
        };
        if let Some(capacity) = self.dedicated {
            if buf.len() + payload.len() > capacity {
                self.reassembly = None;
                return Err(TransportError::ReadOverflow);
            }
        }
        buf.extend_from_slice(payload);
        if last {
            Ok(Some(buf))
        } else {
            self.reassembly = Some(Reassembly {
                seq,
                next_part: part + 1,
                buf,
            });
            Ok(None)
        }
    }

    fn deliver(&mut self) -> TransportResult<bool> {
        let mut delivered = false;
        loop {
            let frame = self.frames.lock().pop_front();
            let Some(frame) = frame else { break };
            if frame.is_empty() {
                log::warn!("framing: dropping empty frame");
                continue;
            }
            if let Some(message) = self.accept_frame(&frame)? {
                if let Some(cb) = self.callback.as_mut() {
                    cb(&message);
                    delivered = true;
                }
            }
        }
        Ok(delivered)
    }
}

impl<T: Transport> Transport for FramingTransport<T> {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        if version != TRANSPORT_VERSION {
            return Err(TransportError::VersionMismatch);
        }
        self.inner.init(version)?;
        let frames = Arc::clone(&self.frames);
        self.inner.register_callback(Box::new(move |bytes| {
            frames.lock().push_back(bytes.to_vec());
        }))
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        let _ = self.inner.deregister_callback();
        self.inner.shutdown()?;
        self.callback = None;
        self.reassembly = None;
        self.frames.lock().clear();
        self.last_session = None;
        Ok(())
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        match self.dedicated {
            Some(capacity) => Ok(capacity),
            None => Ok(self.inner.buffer_capacity()?.saturating_sub(FIRST_HEADER_LEN)),
        }
    }

    fn client_id(&self) -> String {
        self.inner.client_id()
    }

    fn send(&mut self, flags: SendFlags, data: &[u8], timeout: Duration) -> TransportResult<()> {
        if flags.contains(SendFlags::JUST_FLUSH) && data.is_empty() {
            return self.inner.send(flags, data, timeout);
        }
        self.enforce_session_delay();
        let mtu = self.inner.buffer_capacity()?;
        let header = self.metadata_blocks(flags);
        let first_room = mtu
            .checked_sub(CONT_HEADER_LEN + header.len())
            .ok_or(TransportError::IllegalArgument)?;
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let single = data.len() <= first_room;
        if !single && self.dedicated.is_none() {
            return Err(TransportError::IllegalArgument);
        }
        let mut offset = 0usize;
        let mut part = 0u8;
        loop {
            let room = if part == 0 {
                first_room
            } else {
                mtu - CONT_HEADER_LEN
            };
            let end = (offset + room).min(data.len());
            let last = end == data.len();
            let mut frame = Vec::with_capacity(CONT_HEADER_LEN + header.len() + (end - offset));
            frame.put_u8(seq);
            frame.put_u8(part | if last { PART_LAST } else { 0 });
            if part == 0 {
                frame.extend_from_slice(&header);
            }
            frame.extend_from_slice(&data[offset..end]);
            let inner_flags = if last && flags.contains(SendFlags::USSD_SESSION_END) {
                SendFlags::USSD_SESSION_END
            } else {
                SendFlags::NONE
            };
            self.inner.send(inner_flags, &frame, timeout)?;
            if last {
                break;
            }
            offset = end;
            part += 1;
        }
        self.last_session = Some(Instant::now());
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

#[cfg(test)]
mod tests {
    use super::*;
    use modemlink_transport::{GsmBearer, LoopbackTransport};

    fn collect(framing: &mut FramingTransport<LoopbackTransport>) -> Arc<Mutex<Vec<Vec<u8>>>> {
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        framing
            .register_callback(Box::new(move |bytes| sink.lock().push(bytes.to_vec())))
            .unwrap();
        seen
    }

    #[test]
    fn single_frame_round_trip() {
        let mut framing = FramingTransport::new(LoopbackTransport::new(64));
        framing.init(TRANSPORT_VERSION).unwrap();
        let seen = collect(&mut framing);
        framing
            .send(SendFlags::NONE, b"hello", Duration::from_millis(10))
            .unwrap();
        framing.run(Duration::ZERO).unwrap();
        assert_eq!(&*seen.lock(), &vec![b"hello".to_vec()]);
    }

    #[test]
    fn fragmentation_and_reassembly() {
        let mut loopback = LoopbackTransport::new(16);
        let frames: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        loopback.set_send_observer(Box::new(move |bytes| sink.lock().push(bytes.to_vec())));
        let mut framing = FramingTransport::new(loopback).with_dedicated_buffer(128);
        framing.init(TRANSPORT_VERSION).unwrap();
        let seen = collect(&mut framing);
        let message: Vec<u8> = (0u8..40).collect();
        framing
            .send(SendFlags::NONE, &message, Duration::from_millis(10))
            .unwrap();
        framing.run(Duration::ZERO).unwrap();
        assert_eq!(&*seen.lock(), &vec![message]);
        let frames = frames.lock();
        assert!(frames.len() >= 3);
        assert!(frames.iter().all(|f| f.len() <= 16));
        // Only the final frame carries the last-part marker.
        assert!(frames
            .iter()
            .rev()
            .skip(1)
            .all(|f| f[1] & PART_LAST == 0));
        assert!(frames.last().unwrap()[1] & PART_LAST != 0);
    }

    #[test]
    fn oversize_without_dedicated_buffer_is_rejected() {
        let mut framing = FramingTransport::new(LoopbackTransport::new(16));
        framing.init(TRANSPORT_VERSION).unwrap();
        let message = vec![0u8; 40];
        assert_eq!(
            framing.send(SendFlags::NONE, &message, Duration::from_millis(10)),
            Err(TransportError::IllegalArgument)
        );
        // Nothing partially transmitted.
        assert_eq!(framing.inner.pending(), 0);
    }

    #[test]
    fn user_agent_block_on_first_part() {
        let mut loopback = LoopbackTransport::new(64);
        let frames: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        loopback.set_send_observer(Box::new(move |bytes| sink.lock().push(bytes.to_vec())));
        let mut framing = FramingTransport::new(loopback);
        framing.set_user_agent("modemlink/0.1");
        framing.init(TRANSPORT_VERSION).unwrap();
        let seen = collect(&mut framing);
        framing
            .send(SendFlags::NEED_USERAGENT, b"data", Duration::from_millis(10))
            .unwrap();
        let frame = frames.lock()[0].clone();
        assert_eq!(frame[2], 1);
        assert_eq!(frame[3], BLOCK_USER_AGENT);
        assert_eq!(frame[4] as usize, "modemlink/0.1".len());
        assert_eq!(&frame[5..5 + 13], b"modemlink/0.1");
        // The receiving side skips the blocks and sees the payload alone.
        framing.run(Duration::ZERO).unwrap();
        assert_eq!(&*seen.lock(), &vec![b"data".to_vec()]);
    }

    #[test]
    fn bearer_block_carries_strength_and_name() {
        let mut loopback = LoopbackTransport::new(64);
        let frames: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        loopback.set_send_observer(Box::new(move |bytes| sink.lock().push(bytes.to_vec())));
        let mut framing = FramingTransport::new(loopback);
        let bearer: BearerHandle = Arc::new(Mutex::new(GsmBearer {
            strength: 23,
            name: "Op".to_string(),
        }));
        framing.set_bearer(Arc::clone(&bearer));
        framing.init(TRANSPORT_VERSION).unwrap();
        framing
            .send(SendFlags::WANT_GSM_BEARER, b"x", Duration::from_millis(10))
            .unwrap();
        let frame = frames.lock()[0].clone();
        assert_eq!(frame[2], 1);
        assert_eq!(frame[3], BLOCK_GSM_BEARER);
        assert_eq!(frame[4], 3);
        assert_eq!(frame[5], 23);
        assert_eq!(&frame[6..8], b"Op");
    }

    #[test]
    fn bearer_absence_is_signalled_by_omission() {
        let mut loopback = LoopbackTransport::new(64);
        let frames: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        loopback.set_send_observer(Box::new(move |bytes| sink.lock().push(bytes.to_vec())));
        let mut framing = FramingTransport::new(loopback);
        framing.init(TRANSPORT_VERSION).unwrap();
        framing
            .send(SendFlags::WANT_GSM_BEARER, b"x", Duration::from_millis(10))
            .unwrap();
        assert_eq!(frames.lock()[0][2], 0);
    }

    #[test]
    fn out_of_order_part_is_an_internal_error() {
        let mut framing =
            FramingTransport::new(LoopbackTransport::new(64)).with_dedicated_buffer(64);
        framing.init(TRANSPORT_VERSION).unwrap();
        let _seen = collect(&mut framing);
        // First part of message 5, then a continuation that skips part 1.
        framing
            .inner
            .send(SendFlags::NONE, &[5, 0x00, 0, b'a'], Duration::from_millis(10))
            .unwrap();
        framing
            .inner
            .send(
                SendFlags::NONE,
                &[5, 0x80 | 0x02, b'b'],
                Duration::from_millis(10),
            )
            .unwrap();
        assert_eq!(
            framing.run(Duration::ZERO),
            Err(TransportError::InternalError)
        );
    }

    #[test]
    fn session_delay_spaces_out_sends() {
        let mut framing = FramingTransport::new(LoopbackTransport::new(64));
        framing.set_session_delay(Duration::from_millis(30));
        framing.init(TRANSPORT_VERSION).unwrap();
        let started = Instant::now();
        framing
            .send(SendFlags::NONE, b"a", Duration::from_millis(10))
            .unwrap();
        framing
            .send(SendFlags::NONE, b"b", Duration::from_millis(10))
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn capacity_reports_room_under_the_header() {
        let framing = FramingTransport::new(LoopbackTransport::new(64));
        assert_eq!(framing.buffer_capacity(), Ok(61));
        let dedicated =
            FramingTransport::new(LoopbackTransport::new(64)).with_dedicated_buffer(256);
        assert_eq!(dedicated.buffer_capacity(), Ok(256));
    }
}
