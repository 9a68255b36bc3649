//! The pub/sub client driving a transport chain.
//!
//! Single-threaded discipline: every blocking operation pumps the transport
//! through [`Transport::run`] on the caller's thread, and the subscribe
//! callback only ever fires from [`Client::run`]. Packets that arrive while
//! a command waits for its acknowledgement are queued and dispatched on the
//! next `run`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use modemlink_transport::{SendFlags, Transport, TRANSPORT_VERSION};

use crate::error::{ClientError, ClientResult};
use crate::packet::{Packet, QoS, ReturnCode, SubscribeTarget};
use crate::topic::Topic;

/// Keepalive interval sent in CONNECT, in seconds.
pub const DEFAULT_CONNECT_KEEPALIVE: u16 = 360;

/// Longest client id the server accepts.
const MAX_CLIENT_ID_LEN: usize = 23;

/// Worst-case PUBLISH overhead: three-byte length escape, type, flags,
/// topic id and message id.
const PUBLISH_OVERHEAD: usize = 9;

/// Invoked from [`Client::run`] for every inbound PUBLISH.
pub type SubscribeCallback = Box<dyn FnMut(Topic, QoS, bool, &[u8]) + Send>;

/// Publish/subscribe client over a [`Transport`] chain.
pub struct Client<T: Transport> {
    transport: T,
    transport_ready: bool,
    connected: bool,
    inbound: Arc<Mutex<VecDeque<Vec<u8>>>>,
    pending: VecDeque<Packet>,
    subscribe_callback: Option<SubscribeCallback>,
    /// Topic names announced by the server through REGISTER.
    server_topics: HashMap<u16, String>,
    next_msg_id: u16,
    keepalive: u16,
    command_timeout: Duration,
}

impl<T: Transport> Client<T> {
    pub fn new(transport: T) -> Self {
        Client {
            transport,
            transport_ready: false,
            connected: false,
            inbound: Arc::new(Mutex::new(VecDeque::new())),
            pending: VecDeque::new(),
            subscribe_callback: None,
            server_topics: HashMap::new(),
            next_msg_id: 1,
            keepalive: DEFAULT_CONNECT_KEEPALIVE,
            command_timeout: Duration::from_secs(30),
        }
    }

    /// Keepalive interval advertised in the next CONNECT, in seconds.
    pub fn set_keepalive(&mut self, seconds: u16) {
        self.keepalive = seconds;
    }

    /// Budget for each command round trip.
    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The topic name the server announced for `topic`, if any.
    pub fn topic_name(&self, topic: &Topic) -> Option<&str> {
        match topic {
            Topic::Normal(id) => self.server_topics.get(id).map(String::as_str),
            _ => None,
        }
    }

    pub fn set_subscribe_callback(&mut self, callback: SubscribeCallback) {
        self.subscribe_callback = Some(callback);
    }

    pub fn clear_subscribe_callback(&mut self) {
        self.subscribe_callback = None;
    }

    /// Access the transport chain, e.g. for capacity queries.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Connect (or resume) the session with the server.
    pub fn connect(&mut self, clean_session: bool) -> ClientResult<()> {
        if self.connected {
            return Ok(());
        }
        self.ensure_transport()?;
        let client_id = self.transport.client_id();
        if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(ClientError::ClientIdInvalid);
        }
        let connect = Packet::Connect {
            clean_session,
            keepalive: self.keepalive,
            client_id,
        };
        self.send_packet(
            SendFlags::NEED_USERAGENT | SendFlags::WANT_GSM_BEARER,
            &connect,
        )?;
        let outcome = self.wait_for(|packet| match packet {
            Packet::Connack { return_code } => Some(match return_code {
                ReturnCode::Accepted => Ok(()),
                ReturnCode::Congestion => Err(ClientError::Congestion),
                _ => Err(ClientError::ConnectBadAck),
            }),
            _ => None,
        })?;
        self.connected = true;
        if clean_session {
            self.server_topics.clear();
        }
        Ok(outcome)
    }

    /// Tear down the session. With a `duration` the server keeps state and
    /// expects the client back within that many seconds.
    pub fn disconnect(&mut self, duration: Option<u16>) -> ClientResult<()> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        self.send_packet(SendFlags::NONE, &Packet::Disconnect { duration })?;
        self.wait_for(|packet| match packet {
            Packet::Disconnect { .. } => Some(Ok(())),
            _ => None,
        })?;
        self.connected = false;
        self.transport.shutdown()?;
        self.transport_ready = false;
        Ok(())
    }

    /// Resolve `name` to a topic id for later publishes.
    pub fn register(&mut self, name: &str) -> ClientResult<Topic> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        if name.is_empty() {
            return Err(ClientError::TopicInvalid);
        }
        let msg_id = self.take_msg_id();
        self.send_packet(
            SendFlags::NONE,
            &Packet::Register {
                topic_id: 0,
                msg_id,
                topic_name: name.to_string(),
            },
        )?;
        self.wait_for(|packet| match packet {
            Packet::Regack {
                topic_id,
                msg_id: ack_id,
                return_code,
            } if *ack_id == msg_id => Some(match return_code {
                ReturnCode::Accepted => Ok(Topic::Normal(*topic_id)),
                ReturnCode::Congestion => Err(ClientError::Congestion),
                ReturnCode::InvalidTopic => Err(ClientError::TopicInvalid),
                ReturnCode::NotSupported => Err(ClientError::RegisterBadAck),
            }),
            _ => None,
        })
    }

    /// Publish `payload` on `topic`.
    ///
    /// QoS 0 and −1 are fire and forget; QoS 1 waits for the PUBACK. QoS 2
    /// is downgraded to acknowledged-once delivery.
    pub fn publish(
        &mut self,
        topic: Topic,
        qos: QoS,
        retained: bool,
        payload: &[u8],
    ) -> ClientResult<()> {
        match qos {
            QoS::MinusOne => {
                // Connectionless publish only addresses pre-agreed topics.
                if matches!(topic, Topic::Normal(_)) {
                    return Err(ClientError::TopicInvalid);
                }
                self.ensure_transport()?;
            }
            _ if !self.connected => return Err(ClientError::NotConnected),
            _ => {}
        }
        let capacity = self.transport.buffer_capacity().map_err(ClientError::from)?;
        if payload.len() + PUBLISH_OVERHEAD > capacity {
            return Err(ClientError::PublishTooLong);
        }
        let msg_id = if qos.acknowledged() {
            self.take_msg_id()
        } else {
            0
        };
        let packet = Packet::Publish {
            qos,
            retained,
            topic,
            msg_id,
            payload: payload.to_vec(),
        };
        // Nothing comes back for a fire-and-forget publish, so the session
        // can end with the payload.
        let flags = if qos.acknowledged() {
            SendFlags::NONE
        } else {
            SendFlags::USSD_SESSION_END
        };
        self.send_packet(flags, &packet)?;
        if !qos.acknowledged() {
            return Ok(());
        }
        self.wait_for(|packet| match packet {
            Packet::Puback {
                msg_id: ack_id,
                return_code,
                ..
            } if *ack_id == msg_id => Some(match return_code {
                ReturnCode::Accepted => Ok(()),
                ReturnCode::Congestion => Err(ClientError::Congestion),
                ReturnCode::InvalidTopic => Err(ClientError::TopicInvalid),
                ReturnCode::NotSupported => Err(ClientError::PublishBadAck),
            }),
            _ => None,
        })
    }

    /// Subscribe to a topic name, possibly containing wildcards. Returns the
    /// resolved topic (when the name was concrete) and the granted QoS.
    pub fn subscribe_name(&mut self, name: &str, qos: QoS) -> ClientResult<(Option<Topic>, QoS)> {
        if name.is_empty() {
            return Err(ClientError::TopicInvalid);
        }
        // A two-character name is carried in the short-topic form; by name
        // it would be indistinguishable from a resolved id on the wire.
        if let Ok(topic) = Topic::short(name) {
            return self.subscribe(SubscribeTarget::Fixed(topic), qos);
        }
        self.subscribe(SubscribeTarget::Name(name.to_string()), qos)
    }

    /// Subscribe to an already-resolved topic. Returns the granted QoS.
    pub fn subscribe_topic(&mut self, topic: Topic, qos: QoS) -> ClientResult<QoS> {
        let (_, granted) = self.subscribe(SubscribeTarget::Fixed(topic), qos)?;
        Ok(granted)
    }

    fn subscribe(
        &mut self,
        target: SubscribeTarget,
        qos: QoS,
    ) -> ClientResult<(Option<Topic>, QoS)> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        let msg_id = self.take_msg_id();
        self.send_packet(SendFlags::NONE, &Packet::Subscribe { msg_id, target, qos })?;
        self.wait_for(|packet| match packet {
            Packet::Suback {
                qos: granted,
                topic_id,
                msg_id: ack_id,
                return_code,
            } if *ack_id == msg_id => Some(match return_code {
                ReturnCode::Accepted => {
                    let topic = (*topic_id != 0).then_some(Topic::Normal(*topic_id));
                    Ok((topic, *granted))
                }
                ReturnCode::Congestion => Err(ClientError::Congestion),
                ReturnCode::InvalidTopic => Err(ClientError::TopicInvalid),
                ReturnCode::NotSupported => Err(ClientError::SubscribeBadAck),
            }),
            _ => None,
        })
    }

    pub fn unsubscribe_name(&mut self, name: &str) -> ClientResult<()> {
        if name.is_empty() {
            return Err(ClientError::TopicInvalid);
        }
        if let Ok(topic) = Topic::short(name) {
            return self.unsubscribe(SubscribeTarget::Fixed(topic));
        }
        self.unsubscribe(SubscribeTarget::Name(name.to_string()))
    }

    pub fn unsubscribe_topic(&mut self, topic: Topic) -> ClientResult<()> {
        self.unsubscribe(SubscribeTarget::Fixed(topic))
    }

    fn unsubscribe(&mut self, target: SubscribeTarget) -> ClientResult<()> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        let msg_id = self.take_msg_id();
        self.send_packet(SendFlags::NONE, &Packet::Unsubscribe { msg_id, target })?;
        self.wait_for(|packet| match packet {
            Packet::Unsuback { msg_id: ack_id } if *ack_id == msg_id => Some(Ok(())),
            _ => None,
        })
    }

    /// Pump the transport chain and dispatch queued inbound traffic. The
    /// subscribe callback only fires from here.
    pub fn run(&mut self, timeout: Duration) -> ClientResult<()> {
        if !self.transport_ready {
            return Err(ClientError::NotConnected);
        }
        let deadline = Instant::now() + timeout;
        loop {
            self.transport.run(Duration::ZERO)?;
            self.drain_inbound();
            let dispatched = self.dispatch_pending()?;
            if dispatched || timeout.is_zero() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.transport.run(deadline - now)?;
        }
    }

    fn ensure_transport(&mut self) -> ClientResult<()> {
        if self.transport_ready {
            return Ok(());
        }
        self.transport.init(TRANSPORT_VERSION)?;
        let inbound = Arc::clone(&self.inbound);
        self.transport.register_callback(Box::new(move |bytes| {
            inbound.lock().push_back(bytes.to_vec());
        }))?;
        self.transport_ready = true;
        Ok(())
    }

    fn take_msg_id(&mut self) -> u16 {
        let id = self.next_msg_id;
        self.next_msg_id = self.next_msg_id.wrapping_add(1);
        if self.next_msg_id == 0 {
            self.next_msg_id = 1;
        }
        id
    }

    fn send_packet(&mut self, flags: SendFlags, packet: &Packet) -> ClientResult<()> {
        self.transport
            .send(flags, &packet.encode(), self.command_timeout)?;
        Ok(())
    }

    /// Wait for the packet `accept` recognizes, queueing everything else for
    /// the next `run`.
    fn wait_for<F, R>(&mut self, mut accept: F) -> ClientResult<R>
    where
        F: FnMut(&Packet) -> Option<ClientResult<R>>,
    {
        let deadline = Instant::now() + self.command_timeout;
        loop {
            self.transport.run(Duration::ZERO)?;
            loop {
                let bytes = self.inbound.lock().pop_front();
                let Some(bytes) = bytes else { break };
                let packet = match Packet::decode(&bytes) {
                    Ok(packet) => packet,
                    Err(_) => {
                        log::warn!("discarding undecodable packet ({} bytes)", bytes.len());
                        continue;
                    }
                };
                match accept(&packet) {
                    Some(outcome) => return outcome,
                    None => self.defer(packet),
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::OperationTimedOut);
            }
            self.transport.run(deadline - now)?;
        }
    }

    fn drain_inbound(&mut self) {
        loop {
            let bytes = self.inbound.lock().pop_front();
            let Some(bytes) = bytes else { break };
            match Packet::decode(&bytes) {
                Ok(packet) => self.defer(packet),
                Err(_) => log::warn!("discarding undecodable packet ({} bytes)", bytes.len()),
            }
        }
    }

    fn defer(&mut self, packet: Packet) {
        match packet {
            Packet::Publish { .. } | Packet::Register { .. } | Packet::Disconnect { .. } => {
                self.pending.push_back(packet);
            }
            other => {
                // A stale acknowledgement, most likely for a command that
                // already timed out.
                log::debug!("ignoring unexpected {other:?}");
            }
        }
    }

    fn dispatch_pending(&mut self) -> ClientResult<bool> {
        let mut dispatched = false;
        while let Some(packet) = self.pending.pop_front() {
            match packet {
                Packet::Publish {
                    qos,
                    retained,
                    topic,
                    msg_id,
                    payload,
                } => {
                    if let Some(cb) = self.subscribe_callback.as_mut() {
                        cb(topic, qos, retained, &payload);
                        dispatched = true;
                    } else {
                        log::warn!("dropping inbound publish, no subscribe callback");
                    }
                    if qos.acknowledged() {
                        self.send_packet(
                            SendFlags::USSD_SESSION_END,
                            &Packet::Puback {
                                topic_id: topic.id(),
                                msg_id,
                                return_code: ReturnCode::Accepted,
                            },
                        )?;
                    }
                }
                Packet::Register {
                    topic_id,
                    msg_id,
                    topic_name,
                } => {
                    self.server_topics.insert(topic_id, topic_name);
                    self.send_packet(
                        SendFlags::USSD_SESSION_END,
                        &Packet::Regack {
                            topic_id,
                            msg_id,
                            return_code: ReturnCode::Accepted,
                        },
                    )?;
                }
                Packet::Disconnect { .. } => {
                    log::info!("server closed the session");
                    self.connected = false;
                }
                _ => {}
            }
        }
        Ok(dispatched)
    }
}
