//! The contract every transport layer implements.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::TransportResult;

/// Transport API version, checked at `init` so that a chain cannot silently
/// mix layers compiled against different revisions of the contract.
pub const TRANSPORT_VERSION: u16 = 0x0105;

/// The biggest payload the server believes a typical modem can carry in one
/// USSD round trip. Layers above the modem must not exceed this.
pub const USSD_BUFFER_LEN: usize = 145;

/// Callback invoked when a layer has inbound data for the layer above it.
///
/// A zero-length invocation is the sentinel for a hardware fault surfaced
/// from the serial leaf; buffering layers translate it into an error result
/// from their next `run`.
pub type TransportCallback = Box<dyn FnMut(&[u8]) + Send>;

// ============================================================================
// Send flags
// ============================================================================

/// Advisory bits passed down through [`Transport::send`].
///
/// Layers interpret the bits they understand and pass the rest through
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags(u16);

impl SendFlags {
    /// Normal data, no special handling.
    pub const NONE: SendFlags = SendFlags(0);
    /// The packet being sent requires an additional user-agent block.
    pub const NEED_USERAGENT: SendFlags = SendFlags(1 << 15);
    /// A USSD session end marker is needed after this payload.
    pub const USSD_SESSION_END: SendFlags = SendFlags(1 << 14);
    /// Zero-length send that only flushes pending delays and timers.
    pub const JUST_FLUSH: SendFlags = SendFlags(1 << 13);
    /// The sender would like a GSM bearer block if the info is available.
    pub const WANT_GSM_BEARER: SendFlags = SendFlags(1 << 12);
    /// The sender would like a bearer indicator if the info is available.
    pub const WANT_BEARER_INDICATOR: SendFlags = SendFlags(1 << 11);

    /// Raw bit representation.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Construct from raw bits.
    pub const fn from_bits(bits: u16) -> SendFlags {
        SendFlags(bits)
    }

    /// True if every bit of `other` is set in `self`.
    pub const fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SendFlags {
    fn bitor_assign(&mut self, rhs: SendFlags) {
        self.0 |= rhs.0;
    }
}

// ============================================================================
// Carrier info shared between the modem layer and the framing layer
// ============================================================================

/// Signal strength and operator name captured from the modem during
/// initialisation (`AT+CSQ` / `AT+COPS?`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GsmBearer {
    /// Signal strength as reported by `AT+CSQ` (0..31, 99 = unknown).
    pub strength: u8,
    /// Operator name as reported by `AT+COPS?`, possibly empty.
    pub name: String,
}

/// Network registration state captured from `+CREG:` responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CregInfo {
    /// Registration status 0..5 (1 = home network, 5 = roaming).
    pub stat: u8,
    /// Location area code.
    pub lac: u32,
    /// Cell id.
    pub cid: u32,
}

impl CregInfo {
    /// True when the modem is registered on a network (home or roaming).
    pub fn registered(&self) -> bool {
        self.stat == 1 || self.stat == 5
    }
}

/// Shared handle through which the modem layer publishes bearer info for the
/// framing layer to consume when a send requests it.
pub type BearerHandle = Arc<Mutex<GsmBearer>>;

// ============================================================================
// The transport contract
// ============================================================================

/// One layer in the byte-processing chain.
///
/// Every operation returns a result code; there are no panics on the error
/// paths. Callers check every result and either recover locally or propagate
/// it upward unchanged.
pub trait Transport: Send {
    /// Layer-specific setup. Fails with
    /// [`TransportError::VersionMismatch`](crate::TransportError::VersionMismatch)
    /// unless `version` equals [`TRANSPORT_VERSION`]. Safe to call again
    /// after a matching [`shutdown`](Transport::shutdown).
    fn init(&mut self, version: u16) -> TransportResult<()>;

    /// Release resources, abort in-flight I/O and clear the callback
    /// registration. Always succeeds, including when called twice in a row
    /// or without a prior `init`.
    fn shutdown(&mut self) -> TransportResult<()>;

    /// The reusable payload capacity of this layer, the negotiated MTU for
    /// the layers above it. The serial leaf has no reusable buffer and
    /// returns an error.
    fn buffer_capacity(&self) -> TransportResult<usize>;

    /// A stable identifier for this client (e.g. the IMSI read from the
    /// modem). Never empty; a fixed placeholder is returned when the carrier
    /// cannot supply one.
    fn client_id(&self) -> String;

    /// Transform `data` and forward it to the inner transport, returning
    /// `SendTimeout` (or a stage-specific timeout) if the operation cannot
    /// complete within `timeout`.
    fn send(&mut self, flags: SendFlags, data: &[u8], timeout: Duration) -> TransportResult<()>;

    /// Arm the upward notification path. Registering replaces any previous
    /// registration; there is no multiplexing.
    fn register_callback(&mut self, callback: TransportCallback) -> TransportResult<()>;

    /// Disarm the upward notification path.
    fn deregister_callback(&mut self) -> TransportResult<()>;

    /// The layer's single polling point: pump the inner transport, drive
    /// timers and retries, and deliver buffered inbound data upward. A zero
    /// `timeout` performs only immediately-ready work without blocking.
    fn run(&mut self, timeout: Duration) -> TransportResult<()>;
}

/// A type-erased transport behind a shared handle, for call sites that need
/// to hand the same inner instance to more than one owner (e.g. the
/// line-buffer wrapper pool).
pub type SharedTransport = Arc<Mutex<dyn Transport>>;

impl Transport for SharedTransport {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        self.lock().init(version)
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        self.lock().shutdown()
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        self.lock().buffer_capacity()
    }

    fn client_id(&self) -> String {
        self.lock().client_id()
    }

    fn send(&mut self, flags: SendFlags, data: &[u8], timeout: Duration) -> TransportResult<()> {
        self.lock().send(flags, data, timeout)
    }

    fn register_callback(&mut self, callback: TransportCallback) -> TransportResult<()> {
        self.lock().register_callback(callback)
    }

    fn deregister_callback(&mut self) -> TransportResult<()> {
        self.lock().deregister_callback()
    }

    fn run(&mut self, timeout: Duration) -> TransportResult<()> {
        self.lock().run(timeout)
    }
}
