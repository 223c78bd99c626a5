//! USB bus abstraction consumed by the streaming engine.
//!
//! The driver never talks to a host controller directly. It hands fully owned
//! [`BulkUrb`]s to a [`UsbBus`] implementation, which gives them back through a
//! [`CompletionSender`] once the device has consumed them (or the transfer failed
//! or was cancelled). The completion side is a channel drained by a dedicated
//! worker thread inside the PCM runtime, so bus implementations may complete
//! transfers from any thread, including from within [`UsbBus::cancel`].

use std::time::Duration;

use crossbeam_channel::Sender;

use crate::error::TransportError;

pub mod clocked;
pub mod mock;

/// Identifies one slot of the transfer pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UrbId(pub usize);

/// Outbound bulk transfer. Ownership moves to the bus while it is in flight.
#[derive(Debug)]
pub struct BulkUrb {
    id: UrbId,
    endpoint: u8,
    buffer: Box<[u8]>,
}

impl BulkUrb {
    pub(crate) fn new(id: UrbId, endpoint: u8, len: usize) -> Self {
        Self {
            id,
            endpoint,
            buffer: vec![0u8; len].into_boxed_slice(),
        }
    }

    /// Pool slot this transfer belongs to.
    pub fn id(&self) -> UrbId {
        self.id
    }

    /// Bulk OUT endpoint number (without the direction bit).
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Payload sent to the device.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

/// Standard 8-byte control request header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    /// Direction, type and recipient bitmap.
    pub bm_request_type: u8,
    /// Request code.
    pub b_request: u8,
    /// Request-specific value.
    pub w_value: u16,
    /// Request-specific index.
    pub w_index: u16,
    /// Data stage length; always zero for the requests this driver issues.
    pub w_length: u16,
}

impl SetupPacket {
    /// Encode in wire order (little-endian words).
    pub fn to_bytes(self) -> [u8; 8] {
        let value = self.w_value.to_le_bytes();
        let index = self.w_index.to_le_bytes();
        let length = self.w_length.to_le_bytes();
        [
            self.bm_request_type,
            self.b_request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}

/// Outcome of a finished bulk transfer: bytes transferred or the failure.
pub type UrbStatus = Result<usize, TransportError>;

/// A bulk transfer handed back by the bus.
#[derive(Debug)]
pub struct UrbCompletion {
    /// The transfer, returned to the driver.
    pub urb: BulkUrb,
    /// How it finished.
    pub status: UrbStatus,
}

#[derive(Debug)]
pub(crate) enum CompletionEvent {
    Urb(UrbCompletion),
    Shutdown,
}

/// Channel endpoint a bus uses to return finished transfers to the driver.
#[derive(Clone, Debug)]
pub struct CompletionSender {
    tx: Sender<CompletionEvent>,
}

impl CompletionSender {
    pub(crate) fn new(tx: Sender<CompletionEvent>) -> Self {
        Self { tx }
    }

    /// Deliver a finished transfer. Returns `false` once the driver has been
    /// destroyed; the transfer is dropped in that case.
    pub fn complete(&self, urb: BulkUrb, status: UrbStatus) -> bool {
        self.tx
            .send(CompletionEvent::Urb(UrbCompletion { urb, status }))
            .is_ok()
    }

    pub(crate) fn shutdown(&self) -> bool {
        self.tx.send(CompletionEvent::Shutdown).is_ok()
    }
}

/// Submission refused by the bus; the transfer is handed back untouched.
#[derive(Debug)]
pub struct SubmitError {
    /// Why the bus refused the transfer.
    pub error: TransportError,
    /// The rejected transfer.
    pub urb: BulkUrb,
}

/// Operations the driver needs from the host controller for one device.
pub trait UsbBus: Send + Sync {
    /// Select an alternate setting on an interface.
    fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError>;

    /// Issue a host-to-device control request without a data stage.
    fn control_out(&self, setup: SetupPacket, timeout: Duration) -> Result<(), TransportError>;

    /// Queue a bulk OUT transfer. On success the bus owns `urb` until it is
    /// passed to `completion`. Must not block.
    fn submit_bulk_out(
        &self,
        urb: BulkUrb,
        completion: &CompletionSender,
    ) -> Result<(), SubmitError>;

    /// Cancel the transfer with the given id if it is in flight. A cancelled
    /// transfer must still be delivered to its completion sender, with
    /// [`TransportError::Cancelled`]. Unknown ids are ignored.
    fn cancel(&self, id: UrbId);
}
