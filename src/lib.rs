#![deny(missing_docs)]

//! Streaming engine for the M2Tech hiFace USB-to-S/PDIF bridge.
//!
//! The device takes 32-bit stereo samples over a single bulk OUT endpoint and
//! is clocked by a vendor control request selecting one of eight sample rates.
//! [`pcm::PcmDevice`] keeps a fixed pool of eight 4096-byte transfers in
//! flight, refilling each one from the host's ring buffer (with the two 16-bit
//! halves of every sample exchanged) as the device hands it back.
//! [`chip::ChipRegistry`] binds devices to runtimes and tears them down on
//! disconnect. The bus itself is abstracted behind [`bus::UsbBus`]; an
//! in-memory [`bus::mock::MockBus`] and a real-time [`bus::clocked::ClockedBus`]
//! ship with the crate.

use std::sync::Once;

/// USB bus abstraction and bundled bus implementations.
pub mod bus;
/// Device registry and chip lifecycle.
pub mod chip;
mod clock;
/// Driver tunables.
pub mod config;
/// Developer-facing control and TUI support.
pub mod control;
/// Host ring buffer and the sample word swap.
pub mod dma;
/// Error types.
pub mod error;
/// Interface to the host audio subsystem.
pub mod host;
/// Host-facing PCM operations and the streaming state machine.
pub mod pcm;
/// Sample-rate table and control.
pub mod rate;
/// Outbound transfer pool.
pub mod urb;

#[cfg(test)]
mod tests;

pub use chip::{Chip, ChipRegistry, DeviceAddress, UsbDeviceInfo, UsbInterface};
pub use clock::monotonic_timestamp_ns;
pub use config::{DmaBacking, DriverConfig};
pub use error::{DriverError, Result, TransportError};
pub use host::{HostPcm, StreamDirection, TriggerCommand};
pub use pcm::{HwParams, PcmDevice, PcmHardware, StreamState, StreamStatus};
pub use rate::{RateControl, RateIndex, RatePolicy};

static TRACING_INIT: Once = Once::new();

/// Install the default `tracing` subscriber once per process.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}
