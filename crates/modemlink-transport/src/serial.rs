//! Serial leaf transport.
//!
//! Bridges a physical asynchronous byte stream to the [`Transport`] contract.
//! Reception is interrupt-driven: the driver's interrupt side pushes single
//! bytes into an [`IrqConsumer`](crate::IrqConsumer) ring which `run`/`send`
//! drain in normal context, invoking the registered callback one byte at a
//! time. Transmission is interrupt-driven but `send` blocks the calling
//! layer, busy-polling the transmit status with idle waits until completion
//! or timeout.

use std::time::{Duration, Instant};

use crate::api::{SendFlags, Transport, TransportCallback, TRANSPORT_VERSION};
use crate::error::{TransportError, TransportResult};
use crate::irq_ring::IrqConsumer;

/// Outcome of arming single-byte reception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmOutcome {
    /// Reception armed.
    Armed,
    /// The peripheral is busy transmitting; retry at the next opportunity.
    TxBusy,
}

/// Hardware abstraction for an interrupt-driven UART.
///
/// The receive side is not part of this trait: the driver owns the
/// [`IrqProducer`](crate::IrqProducer) half of the ring and feeds it from its
/// receive-complete interrupt, one byte per completion.
pub trait UartPort: Send {
    /// Start an interrupt-driven transmit of `data`. Returns `false` if the
    /// hardware refused to accept the transfer.
    fn begin_transmit(&mut self, data: &[u8]) -> bool;

    /// True while a transmit is still in flight.
    fn transmit_busy(&self) -> bool;

    /// Abort the in-flight transmit, if any.
    fn abort_transmit(&mut self);

    /// Re-arm single-byte reception.
    fn arm_receive(&mut self) -> ArmOutcome;

    /// Abort all in-flight transfers, both directions.
    fn abort(&mut self);

    /// Sleep until the next hardware event or `limit`, whichever comes
    /// first. The power-saving idle between status polls.
    fn idle(&mut self, limit: Duration);
}

/// Granularity of the transmit status poll.
const IDLE_POLL: Duration = Duration::from_millis(1);

const SERIAL_CLIENT_ID: &str = "modemlink-serial";

/// The leaf transport driving a [`UartPort`].
pub struct SerialTransport<P: UartPort> {
    port: P,
    rx: IrqConsumer,
    callback: Option<TransportCallback>,
    /// Set when reception could not be re-armed because a transmit was in
    /// progress; retried on send completion and at the start of `run`.
    rx_restart: bool,
}

impl<P: UartPort> SerialTransport<P> {
    /// Create a serial transport over `port`, draining received bytes from
    /// `rx` (whose producer half the driver feeds from interrupt context).
    pub fn new(port: P, rx: IrqConsumer) -> Self {
        SerialTransport {
            port,
            rx,
            callback: None,
            rx_restart: false,
        }
    }

    fn try_arm(&mut self) {
        self.rx_restart = matches!(self.port.arm_receive(), ArmOutcome::TxBusy);
    }

    /// Drain the receive ring, invoking the callback per byte. A hardware
    /// fault is recovered locally (abort + re-arm) and surfaced upward as a
    /// zero-length callback invocation.
    fn drain(&mut self) {
        if self.rx.take_fault() {
            log::warn!("serial: hardware fault, aborting and re-arming");
            self.port.abort();
            self.try_arm();
            if let Some(cb) = self.callback.as_mut() {
                cb(&[]);
            }
        }
        while let Some(byte) = self.rx.pop() {
            if let Some(cb) = self.callback.as_mut() {
                cb(&[byte]);
            }
        }
    }
}

impl<P: UartPort> Transport for SerialTransport<P> {
    fn init(&mut self, version: u16) -> TransportResult<()> {
        if version != TRANSPORT_VERSION {
            return Err(TransportError::VersionMismatch);
        }
        self.port.abort();
        self.try_arm();
        if self.rx_restart {
            Err(TransportError::Error)
        } else {
            Ok(())
        }
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        self.port.abort();
        self.callback = None;
        self.rx_restart = false;
        Ok(())
    }

    fn buffer_capacity(&self) -> TransportResult<usize> {
        // Framing is not the leaf's job; there is no reusable buffer here.
        Err(TransportError::Error)
    }

    fn client_id(&self) -> String {
        SERIAL_CLIENT_ID.to_string()
    }

    fn send(&mut self, _flags: SendFlags, data: &[u8], timeout: Duration) -> TransportResult<()> {
        let mut result = Ok(());
        if self.port.begin_transmit(data) {
            let deadline = Instant::now() + timeout;
            while self.port.transmit_busy() {
                if Instant::now() >= deadline {
                    self.port.abort_transmit();
                    result = Err(TransportError::SendTimeout);
                    break;
                }
                self.port.idle(IDLE_POLL);
            }
        } else {
            result = Err(TransportError::Error);
        }
        if self.rx_restart {
            self.try_arm();
        }
        result
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
        if self.rx_restart {
            self.try_arm();
        }
        self.drain();
        if !timeout.is_zero() && self.rx.is_empty() {
            // Wait for the next hardware event and re-test; the layer above
            // loops until its own deadline.
            self.port.idle(timeout);
            self.drain();
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Port whose transmits complete immediately and whose receive arming
    /// always succeeds, for tests of the layers above the leaf.
    pub(crate) struct NoopPort;

    impl UartPort for NoopPort {
        fn begin_transmit(&mut self, _data: &[u8]) -> bool {
            true
        }

        fn transmit_busy(&self) -> bool {
            false
        }

        fn abort_transmit(&mut self) {}

        fn arm_receive(&mut self) -> ArmOutcome {
            ArmOutcome::Armed
        }

        fn abort(&mut self) {}

        fn idle(&mut self, _limit: Duration) {}
    }

    pub(crate) fn noop_port() -> NoopPort {
        NoopPort
    }
}
