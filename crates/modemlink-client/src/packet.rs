//! Wire codec for the pub/sub protocol packets.
//!
//! A compact MQTT-SN-flavoured encoding: every packet starts with a length
//! prefix (one byte, or the three-byte escape for packets over 255 bytes)
//! and a message type byte. Multi-byte integers are big-endian.

use bytes::{BufMut, BytesMut};

use crate::error::{ClientError, ClientResult};
use crate::topic::Topic;

const CONNECT: u8 = 0x04;
const CONNACK: u8 = 0x05;
const REGISTER: u8 = 0x0A;
const REGACK: u8 = 0x0B;
const PUBLISH: u8 = 0x0C;
const PUBACK: u8 = 0x0D;
const SUBSCRIBE: u8 = 0x12;
const SUBACK: u8 = 0x13;
const UNSUBSCRIBE: u8 = 0x14;
const UNSUBACK: u8 = 0x15;
const DISCONNECT: u8 = 0x18;

const PROTOCOL_ID: u8 = 0x01;

const FLAG_RETAIN: u8 = 0x10;
const FLAG_CLEAN_SESSION: u8 = 0x04;
const QOS_SHIFT: u8 = 5;
const QOS_MASK: u8 = 0x60;
const TOPIC_TYPE_MASK: u8 = 0x03;

/// Delivery quality requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    /// Fire and forget.
    #[default]
    AtMostOnce,
    /// Acknowledged delivery.
    AtLeastOnce,
    /// Assured delivery.
    ExactlyOnce,
    /// Fire and forget without a connection (QoS −1).
    MinusOne,
}

impl QoS {
    fn bits(self) -> u8 {
        let level: u8 = match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
            QoS::MinusOne => 3,
        };
        level << QOS_SHIFT
    }

    fn from_bits(flags: u8) -> QoS {
        match (flags & QOS_MASK) >> QOS_SHIFT {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::MinusOne,
        }
    }

    /// True when the publish expects an acknowledgement.
    pub fn acknowledged(self) -> bool {
        matches!(self, QoS::AtLeastOnce | QoS::ExactlyOnce)
    }
}

/// Server verdict carried in acknowledgement packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// Request accepted.
    Accepted,
    /// Rejected, server congested; retry later.
    Congestion,
    /// Rejected, the topic is invalid.
    InvalidTopic,
    /// Rejected, the request is not supported.
    NotSupported,
}

impl ReturnCode {
    fn byte(self) -> u8 {
        match self {
            ReturnCode::Accepted => 0,
            ReturnCode::Congestion => 1,
            ReturnCode::InvalidTopic => 2,
            ReturnCode::NotSupported => 3,
        }
    }

    fn from_byte(byte: u8) -> ClientResult<ReturnCode> {
        match byte {
            0 => Ok(ReturnCode::Accepted),
            1 => Ok(ReturnCode::Congestion),
            2 => Ok(ReturnCode::InvalidTopic),
            3 => Ok(ReturnCode::NotSupported),
            _ => Err(ClientError::DecodeError),
        }
    }
}

/// What a SUBSCRIBE or UNSUBSCRIBE addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeTarget {
    /// A topic name to be resolved by the server.
    Name(String),
    /// An already-resolved topic.
    Fixed(Topic),
}

/// One protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect {
        clean_session: bool,
        keepalive: u16,
        client_id: String,
    },
    Connack {
        return_code: ReturnCode,
    },
    Register {
        topic_id: u16,
        msg_id: u16,
        topic_name: String,
    },
    Regack {
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Publish {
        qos: QoS,
        retained: bool,
        topic: Topic,
        msg_id: u16,
        payload: Vec<u8>,
    },
    Puback {
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Subscribe {
        msg_id: u16,
        target: SubscribeTarget,
        qos: QoS,
    },
    Suback {
        qos: QoS,
        topic_id: u16,
        msg_id: u16,
        return_code: ReturnCode,
    },
    Unsubscribe {
        msg_id: u16,
        target: SubscribeTarget,
    },
    Unsuback {
        msg_id: u16,
    },
    Disconnect {
        duration: Option<u16>,
    },
}

impl Packet {
    /// Encode to wire bytes, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::new();
        match self {
            Packet::Connect {
                clean_session,
                keepalive,
                client_id,
            } => {
                body.put_u8(CONNECT);
                let mut flags = 0;
                if *clean_session {
                    flags |= FLAG_CLEAN_SESSION;
                }
                body.put_u8(flags);
                body.put_u8(PROTOCOL_ID);
                body.put_u16(*keepalive);
                body.put_slice(client_id.as_bytes());
            }
            Packet::Connack { return_code } => {
                body.put_u8(CONNACK);
                body.put_u8(return_code.byte());
            }
            Packet::Register {
                topic_id,
                msg_id,
                topic_name,
            } => {
                body.put_u8(REGISTER);
                body.put_u16(*topic_id);
                body.put_u16(*msg_id);
                body.put_slice(topic_name.as_bytes());
            }
            Packet::Regack {
                topic_id,
                msg_id,
                return_code,
            } => {
                body.put_u8(REGACK);
                body.put_u16(*topic_id);
                body.put_u16(*msg_id);
                body.put_u8(return_code.byte());
            }
            Packet::Publish {
                qos,
                retained,
                topic,
                msg_id,
                payload,
            } => {
                body.put_u8(PUBLISH);
                let mut flags = qos.bits() | topic.type_code();
                if *retained {
                    flags |= FLAG_RETAIN;
                }
                body.put_u8(flags);
                body.put_u16(topic.id());
                body.put_u16(*msg_id);
                body.put_slice(payload);
            }
            Packet::Puback {
                topic_id,
                msg_id,
                return_code,
            } => {
                body.put_u8(PUBACK);
                body.put_u16(*topic_id);
                body.put_u16(*msg_id);
                body.put_u8(return_code.byte());
            }
            Packet::Subscribe { msg_id, target, qos } => {
                body.put_u8(SUBSCRIBE);
                encode_target(&mut body, *qos, target);
                body.put_u16(*msg_id);
                encode_target_body(&mut body, target);
            }
            Packet::Suback {
                qos,
                topic_id,
                msg_id,
                return_code,
            } => {
                body.put_u8(SUBACK);
                body.put_u8(qos.bits());
                body.put_u16(*topic_id);
                body.put_u16(*msg_id);
                body.put_u8(return_code.byte());
            }
            Packet::Unsubscribe { msg_id, target } => {
                body.put_u8(UNSUBSCRIBE);
                encode_target(&mut body, QoS::AtMostOnce, target);
                body.put_u16(*msg_id);
                encode_target_body(&mut body, target);
            }
            Packet::Unsuback { msg_id } => {
                body.put_u8(UNSUBACK);
                body.put_u16(*msg_id);
            }
            Packet::Disconnect { duration } => {
                body.put_u8(DISCONNECT);
                if let Some(duration) = duration {
                    body.put_u16(*duration);
                }
            }
        }
        let mut out = Vec::with_capacity(body.len() + 3);
        if body.len() + 1 <= 0xFF {
            out.push((body.len() + 1) as u8);
        } else {
            // Three-byte length escape for big payloads.
            out.push(0x01);
            out.extend_from_slice(&((body.len() + 3) as u16).to_be_bytes());
        }
        out.extend_from_slice(&body);
        out
    }

    /// Decode one packet from wire bytes.
    pub fn decode(data: &[u8]) -> ClientResult<Packet> {
        let (declared, mut rest) = match data {
            [] => return Err(ClientError::DecodeError),
            [0x01, hi, lo, rest @ ..] => (u16::from_be_bytes([*hi, *lo]) as usize, rest),
            [len, rest @ ..] => (*len as usize, rest),
        };
        if declared != data.len() {
            return Err(ClientError::DecodeError);
        }
        let msg_type = take_u8(&mut rest)?;
        let packet = match msg_type {
            CONNECT => {
                let flags = take_u8(&mut rest)?;
                if take_u8(&mut rest)? != PROTOCOL_ID {
                    return Err(ClientError::DecodeError);
                }
                let keepalive = take_u16(&mut rest)?;
                Packet::Connect {
                    clean_session: flags & FLAG_CLEAN_SESSION != 0,
                    keepalive,
                    client_id: take_string(rest)?,
                }
            }
            CONNACK => Packet::Connack {
                return_code: ReturnCode::from_byte(take_u8(&mut rest)?)?,
            },
            REGISTER => Packet::Register {
                topic_id: take_u16(&mut rest)?,
                msg_id: take_u16(&mut rest)?,
                topic_name: take_string(rest)?,
            },
            REGACK => Packet::Regack {
                topic_id: take_u16(&mut rest)?,
                msg_id: take_u16(&mut rest)?,
                return_code: ReturnCode::from_byte(take_u8(&mut rest)?)?,
            },
            PUBLISH => {
                let flags = take_u8(&mut rest)?;
                let topic_id = take_u16(&mut rest)?;
                let msg_id = take_u16(&mut rest)?;
                Packet::Publish {
                    qos: QoS::from_bits(flags),
                    retained: flags & FLAG_RETAIN != 0,
                    topic: Topic::from_wire(flags & TOPIC_TYPE_MASK, topic_id)?,
                    msg_id,
                    payload: rest.to_vec(),
                }
            }
            PUBACK => Packet::Puback {
                topic_id: take_u16(&mut rest)?,
                msg_id: take_u16(&mut rest)?,
                return_code: ReturnCode::from_byte(take_u8(&mut rest)?)?,
            },
            SUBSCRIBE => {
                let flags = take_u8(&mut rest)?;
                let msg_id = take_u16(&mut rest)?;
                Packet::Subscribe {
                    msg_id,
                    target: decode_target(flags, rest)?,
                    qos: QoS::from_bits(flags),
                }
            }
            SUBACK => Packet::Suback {
                qos: QoS::from_bits(take_u8(&mut rest)?),
                topic_id: take_u16(&mut rest)?,
                msg_id: take_u16(&mut rest)?,
                return_code: ReturnCode::from_byte(take_u8(&mut rest)?)?,
            },
            UNSUBSCRIBE => {
                let flags = take_u8(&mut rest)?;
                let msg_id = take_u16(&mut rest)?;
                Packet::Unsubscribe {
                    msg_id,
                    target: decode_target(flags, rest)?,
                }
            }
            UNSUBACK => Packet::Unsuback {
                msg_id: take_u16(&mut rest)?,
            },
            DISCONNECT => Packet::Disconnect {
                duration: if rest.is_empty() {
                    None
                } else {
                    Some(take_u16(&mut rest)?)
                },
            },
            _ => return Err(ClientError::DecodeError),
        };
        Ok(packet)
    }
}

/// Flags byte for a (UN)SUBSCRIBE: QoS bits plus the topic-id-type of the
/// target (a name is "not resolved", type 0).
fn encode_target(body: &mut BytesMut, qos: QoS, target: &SubscribeTarget) {
    let type_code = match target {
        SubscribeTarget::Name(_) => 0,
        SubscribeTarget::Fixed(topic) => topic.type_code(),
    };
    body.put_u8(qos.bits() | type_code);
}

fn encode_target_body(body: &mut BytesMut, target: &SubscribeTarget) {
    match target {
        SubscribeTarget::Name(name) => body.put_slice(name.as_bytes()),
        SubscribeTarget::Fixed(topic) => body.put_u16(topic.id()),
    }
}

/// Type 0 with a two-byte body reads as a resolved normal id, never as a
/// name: a two-character name is indistinguishable from an id on the wire,
/// so it must travel as a short topic instead.
fn decode_target(flags: u8, rest: &[u8]) -> ClientResult<SubscribeTarget> {
    match flags & TOPIC_TYPE_MASK {
        0 if rest.len() != 2 => Ok(SubscribeTarget::Name(take_string(rest)?)),
        type_code => {
            let mut rest = rest;
            let id = take_u16(&mut rest)?;
            Ok(SubscribeTarget::Fixed(Topic::from_wire(type_code, id)?))
        }
    }
}

fn take_u8(rest: &mut &[u8]) -> ClientResult<u8> {
    let (&first, tail) = rest.split_first().ok_or(ClientError::DecodeError)?;
    *rest = tail;
    Ok(first)
}

fn take_u16(rest: &mut &[u8]) -> ClientResult<u16> {
    if rest.len() < 2 {
        return Err(ClientError::DecodeError);
    }
    let value = u16::from_be_bytes([rest[0], rest[1]]);
    *rest = &rest[2..];
    Ok(value)
}

fn take_string(rest: &[u8]) -> ClientResult<String> {
    String::from_utf8(rest.to_vec()).map_err(|_| ClientError::DecodeError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_known_bytes() {
        let packet = Packet::Connect {
            clean_session: true,
            keepalive: 360,
            client_id: "client".to_string(),
        };
        let bytes = packet.encode();
        assert_eq!(
            bytes,
            vec![0x0C, 0x04, 0x04, 0x01, 0x01, 0x68, b'c', b'l', b'i', b'e', b'n', b't']
        );
        assert_eq!(Packet::decode(&bytes), Ok(packet));
    }

    #[test]
    fn connack_known_bytes() {
        assert_eq!(
            Packet::Connack {
                return_code: ReturnCode::Accepted
            }
            .encode(),
            vec![0x03, 0x05, 0x00]
        );
        assert_eq!(
            Packet::decode(&[0x03, 0x05, 0x01]),
            Ok(Packet::Connack {
                return_code: ReturnCode::Congestion
            })
        );
    }

    #[test]
    fn publish_carries_topic_type_in_flags() {
        let packet = Packet::Publish {
            qos: QoS::AtLeastOnce,
            retained: false,
            topic: Topic::Predefined(1),
            msg_id: 9,
            payload: b"hi".to_vec(),
        };
        let bytes = packet.encode();
        assert_eq!(bytes[1], 0x0C);
        assert_eq!(bytes[2], 0x20 | 0x01);
        assert_eq!(Packet::decode(&bytes), Ok(packet));
    }

    #[test]
    fn subscribe_by_name_and_by_topic() {
        let by_name = Packet::Subscribe {
            msg_id: 2,
            target: SubscribeTarget::Name("alerts".to_string()),
            qos: QoS::AtMostOnce,
        };
        assert_eq!(Packet::decode(&by_name.encode()), Ok(by_name));
        let by_topic = Packet::Subscribe {
            msg_id: 3,
            target: SubscribeTarget::Fixed(Topic::Predefined(1)),
            qos: QoS::AtLeastOnce,
        };
        assert_eq!(Packet::decode(&by_topic.encode()), Ok(by_topic));
    }

    #[test]
    fn two_byte_type_zero_target_reads_as_a_resolved_id() {
        let packet = Packet::Subscribe {
            msg_id: 8,
            target: SubscribeTarget::Name("ab".to_string()),
            qos: QoS::AtMostOnce,
        };
        assert_eq!(
            Packet::decode(&packet.encode()),
            Ok(Packet::Subscribe {
                msg_id: 8,
                target: SubscribeTarget::Fixed(Topic::Normal(0x6162)),
                qos: QoS::AtMostOnce,
            })
        );
    }

    #[test]
    fn register_and_acks_round_trip() {
        for packet in [
            Packet::Register {
                topic_id: 0,
                msg_id: 4,
                topic_name: "sensors/a".to_string(),
            },
            Packet::Regack {
                topic_id: 17,
                msg_id: 4,
                return_code: ReturnCode::Accepted,
            },
            Packet::Puback {
                topic_id: 17,
                msg_id: 5,
                return_code: ReturnCode::InvalidTopic,
            },
            Packet::Suback {
                qos: QoS::AtLeastOnce,
                topic_id: 17,
                msg_id: 6,
                return_code: ReturnCode::Accepted,
            },
            Packet::Unsubscribe {
                msg_id: 7,
                target: SubscribeTarget::Fixed(Topic::Normal(17)),
            },
            Packet::Unsuback { msg_id: 7 },
            Packet::Disconnect { duration: None },
            Packet::Disconnect {
                duration: Some(120),
            },
        ] {
            assert_eq!(Packet::decode(&packet.encode()), Ok(packet));
        }
    }

    #[test]
    fn long_packets_use_the_length_escape() {
        let packet = Packet::Publish {
            qos: QoS::AtMostOnce,
            retained: false,
            topic: Topic::Predefined(1),
            msg_id: 0,
            payload: vec![0xAA; 400],
        };
        let bytes = packet.encode();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(Packet::decode(&bytes), Ok(packet));
    }

    #[test]
    fn truncated_input_is_a_decode_error() {
        assert_eq!(Packet::decode(&[]), Err(ClientError::DecodeError));
        assert_eq!(Packet::decode(&[0x05, 0x0C, 0x00]), Err(ClientError::DecodeError));
        assert_eq!(Packet::decode(&[0x02, 0x7F]), Err(ClientError::DecodeError));
    }
}
