//! Layered transport stack for constrained cellular links.
//!
//! This crate provides the transport contract and the generic layers used to
//! carry a lightweight publish/subscribe protocol over channels such as USSD
//! text sessions or small UDP datagrams. Each layer wraps an inner transport,
//! presents the identical [`Transport`] contract upward, and transforms the
//! byte stream on the way through:
//!
//! - [`SerialTransport`]: the leaf, bridging a physical UART behind a
//!   [`UartPort`] driver with an interrupt-fed receive ring.
//! - [`LineBufferTransport`] / [`RingBufferTransport`]: turn the raw byte
//!   trickle into discrete upward-delivered records.
//! - [`Base64CodecTransport`]: reversible payload encoding for text-only
//!   carriers.
//! - [`LogTransport`]: transparent traffic observer.
//! - [`LoopbackTransport`]: in-process leaf for exercising a chain without
//!   hardware.
//!
//! Outbound data flows down the chain through [`Transport::send`]; inbound
//! bytes climb back up through registered callbacks, which only ever fire
//! from within a layer's [`Transport::run`] (or from `send` while it drains
//! pending input) and never from the interrupt-side producer.

mod api;
mod base64_codec;
mod error;
mod irq_ring;
mod line_buffer;
mod logger;
mod loopback;
mod ring_buffer;
mod serial;

pub use api::*;
pub use base64_codec::*;
pub use error::*;
pub use irq_ring::*;
pub use line_buffer::*;
pub use logger::*;
pub use loopback::*;
pub use ring_buffer::*;
pub use serial::*;
