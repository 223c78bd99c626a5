//! Sample-rate table and the vendor control request that selects a rate.
//!
//! The device has no acknowledgement for rate changes: a request counts as
//! applied once the control transfer itself goes through.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::bus::{SetupPacket, UsbBus};
use crate::error::{DriverError, Result};

/// Number of entries in the rate table.
pub const N_RATES: usize = 8;

/// Entries below this index are available on every device.
pub const BASE_RATES: usize = 6;

/// Supported sample rates in Hz, indexed by [`RateIndex`].
pub const RATES: [u32; N_RATES] = [
    44_100, 48_000, 88_200, 96_000, 176_400, 192_000, 352_800, 384_000,
];

const RATE_VALUES: [u8; N_RATES] = [0x43, 0x4b, 0x42, 0x4a, 0x40, 0x48, 0x58, 0x68];

/// Host-to-device, vendor request, recipient "other".
pub const RATE_REQUEST_TYPE: u8 = 0x43;
/// Vendor request code carrying the rate byte in `wValue`.
pub const RATE_REQUEST: u8 = 0xb0;

/// Validated position in the rate table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateIndex(u8);

impl RateIndex {
    /// Validate a raw table index.
    pub fn new(index: usize) -> Result<Self> {
        if index >= N_RATES {
            return Err(DriverError::InvalidArgument(format!(
                "rate index {index} out of range (0..{N_RATES})"
            )));
        }
        Ok(Self(index as u8))
    }

    /// Look up the table entry for a rate in Hz.
    pub fn from_hz(hz: u32) -> Option<Self> {
        RATES.iter().position(|&r| r == hz).map(|i| Self(i as u8))
    }

    /// Reverse lookup of the byte the device receives.
    pub fn from_wire_value(value: u8) -> Option<Self> {
        RATE_VALUES
            .iter()
            .position(|&v| v == value)
            .map(|i| Self(i as u8))
    }

    /// Every table entry, lowest rate first.
    pub fn all() -> impl Iterator<Item = RateIndex> {
        (0..N_RATES as u8).map(RateIndex)
    }

    /// Table position.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Rate in Hz.
    pub fn hz(self) -> u32 {
        RATES[self.index()]
    }

    /// Byte sent in `wValue` to select this rate.
    pub fn wire_value(self) -> u8 {
        RATE_VALUES[self.index()]
    }

    /// Whether this rate needs the extra-frequency capability.
    pub fn is_extra(self) -> bool {
        self.index() >= BASE_RATES
    }
}

/// What to do when the requested rate is already the active one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RatePolicy {
    /// Skip the control transfer.
    #[default]
    SkipUnchanged,
    /// Always send the control transfer.
    AlwaysSend,
}

/// Control request that selects `rate`.
pub fn rate_request(rate: RateIndex) -> SetupPacket {
    SetupPacket {
        bm_request_type: RATE_REQUEST_TYPE,
        b_request: RATE_REQUEST,
        w_value: rate.wire_value() as u16,
        w_index: 0,
        w_length: 0,
    }
}

/// Sends rate selections to the device and remembers the last one applied.
pub struct RateControl {
    bus: Arc<dyn UsbBus>,
    policy: RatePolicy,
    timeout: Duration,
    extra_freq: bool,
    stored: Mutex<Option<RateIndex>>,
}

impl RateControl {
    /// Create a controller; no rate is considered active yet. Rates above
    /// 192 kHz are only accepted when `extra_freq` is set.
    pub fn new(
        bus: Arc<dyn UsbBus>,
        policy: RatePolicy,
        timeout: Duration,
        extra_freq: bool,
    ) -> Self {
        Self {
            bus,
            policy,
            timeout,
            extra_freq,
            stored: Mutex::new(None),
        }
    }

    /// Select a rate by raw table index.
    pub fn set_rate_index(&self, index: usize) -> Result<()> {
        self.set_rate(RateIndex::new(index)?)
    }

    /// Select `rate` on the device.
    pub fn set_rate(&self, rate: RateIndex) -> Result<()> {
        if rate.is_extra() && !self.extra_freq {
            return Err(DriverError::InvalidArgument(format!(
                "{} Hz needs an extra-frequency device",
                rate.hz()
            )));
        }
        let mut stored = self.stored.lock();
        if *stored == Some(rate) && self.policy == RatePolicy::SkipUnchanged {
            debug!(rate_hz = rate.hz(), "rate unchanged, skipping request");
            return Ok(());
        }

        info!(rate_hz = rate.hz(), index = rate.index(), "set rate");
        self.bus.set_interface(0, 0)?;
        self.bus.control_out(rate_request(rate), self.timeout)?;
        *stored = Some(rate);
        Ok(())
    }

    /// Last rate successfully sent to the device.
    pub fn current(&self) -> Option<RateIndex> {
        *self.stored.lock()
    }

    /// Forget the active rate so the next selection is always sent.
    pub fn reset(&self) {
        *self.stored.lock() = None;
    }
}
