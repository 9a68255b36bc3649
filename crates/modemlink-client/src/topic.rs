//! Topic addressing.

use crate::error::{ClientError, ClientResult};

/// A resolved topic: the type plus a 16-bit id.
///
/// Normal ids are only meaningful after a successful registration round
/// trip in the current connection; predefined ids are agreed out of band;
/// short topics pack two characters into the id, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// A topic id obtained from a REGISTER round trip.
    Normal(u16),
    /// A topic id agreed out of band.
    Predefined(u16),
    /// A two-character topic name carried in the id field.
    Short(u16),
}

/// The predefined topic addressing the device itself.
pub const PREDEFINED_SELF_TOPIC: Topic = Topic::Predefined(1);

impl Topic {
    /// Build a short topic from exactly two ASCII characters.
    pub fn short(name: &str) -> ClientResult<Topic> {
        let bytes = name.as_bytes();
        if bytes.len() != 2 || !bytes.iter().all(u8::is_ascii) {
            return Err(ClientError::TopicInvalid);
        }
        Ok(Topic::Short(u16::from_be_bytes([bytes[0], bytes[1]])))
    }

    /// The 16-bit id carried on the wire.
    pub fn id(&self) -> u16 {
        match self {
            Topic::Normal(id) | Topic::Predefined(id) | Topic::Short(id) => *id,
        }
    }

    /// The topic-id-type bits of the flags byte.
    pub(crate) fn type_code(&self) -> u8 {
        match self {
            Topic::Normal(_) => 0,
            Topic::Predefined(_) => 1,
            Topic::Short(_) => 2,
        }
    }

    /// Rebuild a topic from the flags byte and id field.
    pub(crate) fn from_wire(type_code: u8, id: u16) -> ClientResult<Topic> {
        match type_code {
            0 => Ok(Topic::Normal(id)),
            1 => Ok(Topic::Predefined(id)),
            2 => Ok(Topic::Short(id)),
            _ => Err(ClientError::DecodeError),
        }
    }
}
