//! Client-level result codes.
//!
//! Client errors occupy the −1..−39 band of the uniform result-code space;
//! transport and modem errors pass through unchanged with their own codes
//! (−40..−52 and −60..−79). Zero is always success.

use thiserror::Error;

use modemlink_transport::TransportError;

/// Errors produced by the pub/sub client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The command should be retried.
    #[error("command should be retried")]
    CommandRetry,

    /// Another command is still in progress.
    #[error("command already in progress")]
    CommandInProgress,

    /// The publish payload does not fit the transport buffer.
    #[error("publish payload too long")]
    PublishTooLong,

    /// The operation timed out.
    #[error("operation timed out")]
    OperationTimedOut,

    /// The client id is empty or too long.
    #[error("client id invalid")]
    ClientIdInvalid,

    /// The operation requires a connection.
    #[error("not connected")]
    NotConnected,

    /// The requested feature is not implemented.
    #[error("feature not implemented")]
    FeatureNotImplemented,

    /// Illegal argument or parameter.
    #[error("illegal argument")]
    IllegalArgument,

    /// A received packet could not be decoded.
    #[error("packet decode failed")]
    DecodeError,

    /// The topic is invalid or was rejected by the server.
    #[error("topic invalid")]
    TopicInvalid,

    /// The server reported congestion.
    #[error("congestion")]
    Congestion,

    /// The operation is not valid in the current state.
    #[error("wrong state")]
    WrongState,

    /// An inbound packet was discarded.
    #[error("received packet discarded")]
    RxPacketDiscarded,

    /// The CONNACK did not match the CONNECT.
    #[error("bad connect acknowledgement")]
    ConnectBadAck,

    /// The REGACK did not match the REGISTER.
    #[error("bad register acknowledgement")]
    RegisterBadAck,

    /// The PUBACK did not match the PUBLISH.
    #[error("bad publish acknowledgement")]
    PublishBadAck,

    /// The SUBACK did not match the SUBSCRIBE.
    #[error("bad subscribe acknowledgement")]
    SubscribeBadAck,

    /// The UNSUBACK did not match the UNSUBSCRIBE.
    #[error("bad unsubscribe acknowledgement")]
    UnsubscribeBadAck,

    /// The transport failed in a way the client cannot classify.
    #[error("unknown transport error")]
    UnknownTransportError,

    /// A transport or modem fault from the layers below.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// The stable numeric code for this error.
    pub fn code(&self) -> i32 {
        match self {
            ClientError::CommandRetry => -1,
            ClientError::CommandInProgress => -2,
            ClientError::PublishTooLong => -3,
            ClientError::OperationTimedOut => -5,
            ClientError::ClientIdInvalid => -6,
            ClientError::NotConnected => -10,
            ClientError::FeatureNotImplemented => -11,
            ClientError::IllegalArgument => -12,
            ClientError::DecodeError => -13,
            ClientError::TopicInvalid => -14,
            ClientError::Congestion => -15,
            ClientError::WrongState => -16,
            ClientError::RxPacketDiscarded => -17,
            ClientError::ConnectBadAck => -18,
            ClientError::RegisterBadAck => -19,
            ClientError::PublishBadAck => -20,
            ClientError::SubscribeBadAck => -21,
            ClientError::UnsubscribeBadAck => -22,
            ClientError::UnknownTransportError => -39,
            ClientError::Transport(e) => e.code(),
        }
    }
}

/// Result alias used by every client operation.
pub type ClientResult<T> = Result<T, ClientError>;

/// Concise text for any result code in the uniform space.
pub fn error_text(code: i32) -> &'static str {
    match code {
        0 => "success",
        -1 => "command retry",
        -2 => "command in progress",
        -3 => "publish too long",
        -5 => "operation timed out",
        -6 => "client id invalid",
        -10 => "not connected",
        -11 => "feature not implemented",
        -12 => "illegal argument",
        -13 => "decode error",
        -14 => "topic invalid",
        -15 => "congestion",
        -16 => "wrong state",
        -17 => "rx packet discarded",
        -18 => "connect bad ack",
        -19 => "register bad ack",
        -20 => "publish bad ack",
        -21 => "subscribe bad ack",
        -22 => "unsubscribe bad ack",
        -39 => "unknown transport error",
        -40 => "transport error",
        -41 => "transport version mismatch",
        -42 => "unexpected data",
        -43 => "init timeout",
        -44 => "read timeout",
        -45 => "read overflow",
        -46 => "send timeout",
        -47 => "transport illegal argument",
        -48 => "internal protocol error",
        -49 => "ack timeout",
        -50 => "interpacket ack timeout",
        -51 => "deferred session end timeout",
        -52 => "session end timeout",
        -60 => "modem command rejected",
        -61 => "modem equipment error",
        -62 => "registration denied",
        -63 => "ussd session aborted",
        -64 => "modem reset failed",
        -70 => "apn config failed",
        -71 => "socket create failed",
        -72 => "local address failed",
        -73 => "remote connect failed",
        -74 => "datagram send failed",
        -75 => "mss set too late",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modemlink_transport::{is_client_code, ModemError};

    #[test]
    fn client_codes_stay_in_band() {
        let all = [
            ClientError::CommandRetry,
            ClientError::CommandInProgress,
            ClientError::PublishTooLong,
            ClientError::OperationTimedOut,
            ClientError::ClientIdInvalid,
            ClientError::NotConnected,
            ClientError::FeatureNotImplemented,
            ClientError::IllegalArgument,
            ClientError::DecodeError,
            ClientError::TopicInvalid,
            ClientError::Congestion,
            ClientError::WrongState,
            ClientError::RxPacketDiscarded,
            ClientError::ConnectBadAck,
            ClientError::RegisterBadAck,
            ClientError::PublishBadAck,
            ClientError::SubscribeBadAck,
            ClientError::UnsubscribeBadAck,
            ClientError::UnknownTransportError,
        ];
        for e in &all {
            assert!(is_client_code(e.code()), "{e:?} out of band");
        }
    }

    #[test]
    fn transport_errors_pass_through_unchanged() {
        let wrapped = ClientError::from(TransportError::SendTimeout);
        assert_eq!(wrapped.code(), -46);
        let modem = ClientError::from(TransportError::from(ModemError::UssdSessionAborted));
        assert_eq!(modem.code(), -63);
    }

    #[test]
    fn error_text_covers_all_bands() {
        assert_eq!(error_text(0), "success");
        assert_eq!(error_text(-3), "publish too long");
        assert_eq!(error_text(-49), "ack timeout");
        assert_eq!(error_text(-63), "ussd session aborted");
        assert_eq!(error_text(-1234), "unknown error");
    }
}
