//! Publish/subscribe client for the modemlink transport stack.
//!
//! The crate has two halves. [`FramingTransport`] is the topmost transport
//! layer: it splits protocol messages into frames sized for the layer below
//! and attaches metadata blocks (user agent, GSM bearer) when a send
//! requests them. [`Client`] speaks the compact pub/sub protocol over
//! whatever chain it is given: connect, register, publish, subscribe, and a
//! `run` pump that dispatches inbound publishes to a callback.
//!
//! Everything runs on the caller's thread; no operation spawns.

mod client;
mod error;
mod framing;
mod packet;
mod topic;

pub use client::{Client, SubscribeCallback, DEFAULT_CONNECT_KEEPALIVE};
pub use error::{error_text, ClientError, ClientResult};
pub use framing::FramingTransport;
pub use packet::{Packet, QoS, ReturnCode, SubscribeTarget};
pub use topic::{Topic, PREDEFINED_SELF_TOPIC};
