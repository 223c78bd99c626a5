//! Hardware description reported to the host and validation of the
//! parameters it picks.

use crate::error::{DriverError, Result};
use crate::rate::{BASE_RATES, RATES, RateIndex};
use crate::urb::{PCM_N_URBS, PCM_PACKET_SIZE};

/// Largest ring buffer the host may allocate.
pub const MAX_BUFSIZE: usize = 2 * PCM_N_URBS * PCM_PACKET_SIZE;

/// Sample encodings a host may ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian.
    S16Le,
    /// Signed 24-bit in 32-bit little-endian containers.
    S24Le,
    /// Signed 32-bit little-endian.
    S32Le,
}

impl SampleFormat {
    /// Bytes one sample occupies in the ring buffer.
    pub fn physical_bytes(self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
            SampleFormat::S24Le | SampleFormat::S32Le => 4,
        }
    }
}

/// Stream configuration committed by the host in `hw_params`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwParams {
    /// Sample encoding.
    pub format: SampleFormat,
    /// Interleaved channels per frame.
    pub channels: u32,
    /// Frames per second.
    pub rate: u32,
    /// Bytes per period.
    pub period_bytes: usize,
    /// Periods in the ring buffer.
    pub periods: usize,
}

impl HwParams {
    /// Stereo S32 parameters at `rate` with the given geometry.
    pub fn s32_stereo(rate: u32, period_bytes: usize, periods: usize) -> Self {
        Self {
            format: SampleFormat::S32Le,
            channels: 2,
            rate,
            period_bytes,
            periods,
        }
    }

    /// Bytes per interleaved frame.
    pub fn frame_bytes(&self) -> usize {
        self.format.physical_bytes() * self.channels as usize
    }

    /// Ring buffer size in bytes.
    pub fn buffer_bytes(&self) -> usize {
        self.period_bytes * self.periods
    }
}

/// What the device can do, as reported at `open`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcmHardware {
    /// Accepted sample formats.
    pub formats: Vec<SampleFormat>,
    /// Accepted rates in Hz.
    pub rates: Vec<u32>,
    /// Lowest accepted rate.
    pub rate_min: u32,
    /// Highest accepted rate.
    pub rate_max: u32,
    /// Fewest channels.
    pub channels_min: u32,
    /// Most channels.
    pub channels_max: u32,
    /// Largest ring buffer in bytes.
    pub buffer_bytes_max: usize,
    /// Smallest period in bytes.
    pub period_bytes_min: usize,
    /// Largest period in bytes.
    pub period_bytes_max: usize,
    /// Fewest periods per buffer.
    pub periods_min: usize,
    /// Most periods per buffer.
    pub periods_max: usize,
}

impl PcmHardware {
    /// Capabilities of a device. With a committed rate the host is pinned to it.
    pub fn for_device(extra_freq: bool, committed: Option<RateIndex>) -> Self {
        let available = if extra_freq { RATES.len() } else { BASE_RATES };
        let rates = match committed {
            Some(rate) if rate.index() < available => vec![rate.hz()],
            _ => RATES[..available].to_vec(),
        };
        Self {
            formats: vec![SampleFormat::S32Le],
            rates,
            rate_min: RATES[0],
            rate_max: RATES[available - 1],
            channels_min: 2,
            channels_max: 2,
            buffer_bytes_max: MAX_BUFSIZE,
            period_bytes_min: PCM_PACKET_SIZE,
            period_bytes_max: MAX_BUFSIZE,
            periods_min: 2,
            periods_max: 1024,
        }
    }

    /// Reject parameters outside these capabilities.
    pub fn validate(&self, params: &HwParams) -> Result<()> {
        let invalid = |what: String| Err(DriverError::InvalidArgument(what));
        if !self.formats.contains(&params.format) {
            return invalid(format!("unsupported sample format {:?}", params.format));
        }
        if params.channels < self.channels_min || params.channels > self.channels_max {
            return invalid(format!("unsupported channel count {}", params.channels));
        }
        if !self.rates.contains(&params.rate)
            || params.rate < self.rate_min
            || params.rate > self.rate_max
        {
            return invalid(format!("unsupported rate {}", params.rate));
        }
        if params.period_bytes < self.period_bytes_min
            || params.period_bytes > self.period_bytes_max
            || params.period_bytes % params.frame_bytes() != 0
        {
            return invalid(format!("unsupported period size {}", params.period_bytes));
        }
        if params.periods < self.periods_min || params.periods > self.periods_max {
            return invalid(format!("unsupported period count {}", params.periods));
        }
        if params.buffer_bytes() > self.buffer_bytes_max {
            return invalid(format!("buffer of {} bytes too large", params.buffer_bytes()));
        }
        Ok(())
    }
}
