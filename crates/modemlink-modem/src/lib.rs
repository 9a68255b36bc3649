//! Cellular modem drivers for the layered transport stack.
//!
//! Two dialects of the same AT command engine:
//!
//! - [`ModemTransport`] carries payloads through USSD sessions
//!   (`AT+CUSD`), the narrow text channel available without a data plan.
//! - [`UdpModemTransport`] carries datagrams through the packet-data
//!   commands of a specific modem family ([`UdpModemConfig`]).
//!
//! Both sit on top of a buffered serial chain from `modemlink-transport`
//! and present the same [`Transport`](modemlink_transport::Transport)
//! contract upward. [`ScriptedModemLink`] stands in for the hardware in
//! tests.

mod config;
mod engine;
mod script;
mod scripted;
mod udp;
mod ussd;

pub use config::*;
pub use engine::{AtEngine, ModemCallback, ModemFlags, SERIOUS_ERROR_RESET_THRESHOLD};
pub use script::*;
pub use scripted::*;
pub use udp::*;
pub use ussd::*;
