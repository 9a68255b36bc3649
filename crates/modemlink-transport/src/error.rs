//! Result codes for the transport stack.
//!
//! The numeric codes are wire-stable: generic transport errors occupy
//! −40..−52, modem/carrier errors occupy −60..−79, and client-level errors
//! (defined in the client crate) occupy −1..−39. Zero is always success, so
//! a caller can classify any code with a range comparison.

use thiserror::Error;

/// Errors produced by the generic transport layers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Operation failed with an unspecified error.
    #[error("transport operation failed")]
    Error,

    /// Transport initialized with the wrong API version.
    #[error("transport initialized with wrong version")]
    VersionMismatch,

    /// The transport encountered data it could not interpret.
    #[error("transport encountered unexpected data")]
    UnexpectedData,

    /// Initialisation timed out.
    #[error("initialisation timed out")]
    InitTimeout,

    /// A read operation timed out.
    #[error("read operation timed out")]
    ReadTimeout,

    /// A read operation overflowed the available buffer.
    #[error("read operation overflowed the available buffer")]
    ReadOverflow,

    /// A send operation timed out.
    #[error("send operation timed out")]
    SendTimeout,

    /// Illegal argument or parameter.
    #[error("illegal argument or parameter")]
    IllegalArgument,

    /// Internal protocol error.
    #[error("internal protocol error")]
    InternalError,

    /// A send operation timed out waiting for the acknowledgement.
    #[error("send timed out waiting for ACK")]
    AckTimeout,

    /// A send operation timed out waiting for the acknowledgement between
    /// packets of one exchange.
    #[error("send timed out waiting for ACK between packets")]
    InterpacketAckTimeout,

    /// A send operation timed out waiting for a session end that had been
    /// deferred from a previous send.
    #[error("send timed out waiting for deferred session end")]
    DeferredEndTimeout,

    /// A send operation timed out waiting for the session end.
    #[error("send timed out waiting for session end")]
    EndTimeout,

    /// A modem/carrier fault from the layer below.
    #[error(transparent)]
    Modem(#[from] ModemError),
}

impl TransportError {
    /// The stable numeric code for this error.
    pub fn code(&self) -> i32 {
        match self {
            TransportError::Error => -40,
            TransportError::VersionMismatch => -41,
            TransportError::UnexpectedData => -42,
            TransportError::InitTimeout => -43,
            TransportError::ReadTimeout => -44,
            TransportError::ReadOverflow => -45,
            TransportError::SendTimeout => -46,
            TransportError::IllegalArgument => -47,
            TransportError::InternalError => -48,
            TransportError::AckTimeout => -49,
            TransportError::InterpacketAckTimeout => -50,
            TransportError::DeferredEndTimeout => -51,
            TransportError::EndTimeout => -52,
            TransportError::Modem(e) => e.code(),
        }
    }
}

/// Faults raised by the modem command/response engine and its carriers.
///
/// These sit in their own numeric band so a caller can test "is this a modem
/// error" without enumerating variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModemError {
    /// The modem answered `ERROR` to a command.
    #[error("modem rejected the command")]
    CommandRejected,

    /// The modem answered `+CME ERROR:` to a command.
    #[error("modem reported equipment error")]
    CmeError,

    /// The network refused registration.
    #[error("network registration denied")]
    RegistrationDenied,

    /// The USSD session was aborted by the network.
    #[error("USSD session aborted")]
    UssdSessionAborted,

    /// The forced modem reset sequence failed.
    #[error("modem reset failed")]
    ResetFailed,

    /// APN configuration was rejected during network attach.
    #[error("APN configuration failed")]
    ApnConfigFailed,

    /// Socket creation failed during network attach.
    #[error("socket creation failed")]
    SocketCreateFailed,

    /// The local address could not be acquired.
    #[error("local address acquisition failed")]
    LocalAddressFailed,

    /// The remote endpoint could not be connected.
    #[error("remote connect failed")]
    RemoteConnectFailed,

    /// The modem refused the outbound datagram.
    #[error("datagram send failed")]
    DatagramSendFailed,

    /// The maximum segment size can only be changed before init.
    #[error("maximum segment size set after init")]
    MssTooLate,
}

impl ModemError {
    /// The stable numeric code for this error.
    pub fn code(&self) -> i32 {
        match self {
            ModemError::CommandRejected => -60,
            ModemError::CmeError => -61,
            ModemError::RegistrationDenied => -62,
            ModemError::UssdSessionAborted => -63,
            ModemError::ResetFailed => -64,
            ModemError::ApnConfigFailed => -70,
            ModemError::SocketCreateFailed => -71,
            ModemError::LocalAddressFailed => -72,
            ModemError::RemoteConnectFailed => -73,
            ModemError::DatagramSendFailed => -74,
            ModemError::MssTooLate => -75,
        }
    }
}

/// Result alias used by every transport operation.
pub type TransportResult<T> = Result<T, TransportError>;

/// True if `code` falls in the generic transport error band.
pub fn is_transport_code(code: i32) -> bool {
    (-52..=-40).contains(&code)
}

/// True if `code` falls in the modem/carrier error band.
pub fn is_modem_code(code: i32) -> bool {
    (-79..=-60).contains(&code)
}

/// True if `code` falls in the client error band.
pub fn is_client_code(code: i32) -> bool {
    (-39..=-1).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_codes_stay_in_band() {
        let all = [
            TransportError::Error,
            TransportError::VersionMismatch,
            TransportError::UnexpectedData,
            TransportError::InitTimeout,
            TransportError::ReadTimeout,
            TransportError::ReadOverflow,
            TransportError::SendTimeout,
            TransportError::IllegalArgument,
            TransportError::InternalError,
            TransportError::AckTimeout,
            TransportError::InterpacketAckTimeout,
            TransportError::DeferredEndTimeout,
            TransportError::EndTimeout,
        ];
        for e in &all {
            assert!(is_transport_code(e.code()), "{e:?} out of band");
            assert!(!is_modem_code(e.code()));
            assert!(!is_client_code(e.code()));
        }
    }

    #[test]
    fn modem_codes_stay_in_band() {
        let all = [
            ModemError::CommandRejected,
            ModemError::CmeError,
            ModemError::RegistrationDenied,
            ModemError::UssdSessionAborted,
            ModemError::ResetFailed,
            ModemError::ApnConfigFailed,
            ModemError::SocketCreateFailed,
            ModemError::LocalAddressFailed,
            ModemError::RemoteConnectFailed,
            ModemError::DatagramSendFailed,
            ModemError::MssTooLate,
        ];
        for e in &all {
            assert!(is_modem_code(e.code()), "{e:?} out of band");
        }
    }

    #[test]
    fn modem_error_passes_through_transport_wrapper() {
        let wrapped = TransportError::from(ModemError::ApnConfigFailed);
        assert_eq!(wrapped.code(), -70);
        assert!(is_modem_code(wrapped.code()));
    }

    #[test]
    fn exact_legacy_codes() {
        assert_eq!(TransportError::Error.code(), -40);
        assert_eq!(TransportError::VersionMismatch.code(), -41);
        assert_eq!(TransportError::SendTimeout.code(), -46);
        assert_eq!(TransportError::AckTimeout.code(), -49);
        assert_eq!(TransportError::EndTimeout.code(), -52);
    }
}
