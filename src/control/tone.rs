//! Sine generator that plays the host side of a playback stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dasp_frame::{Frame, Stereo};
use dasp_signal::{self as signal, Signal};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::dma::DmaArea;
use crate::host::HostPcm;
use crate::pcm::HwParams;

const BYTES_PER_SAMPLE: usize = 4;

struct ToneState {
    dma: Arc<DmaArea>,
    signal: signal::Sine<signal::ConstHz>,
    write_off: usize,
    period_bytes: usize,
}

/// Host stream that keeps the ring buffer filled with a stereo S32 sine,
/// one period ahead of the device.
pub struct ToneSource {
    frequency_hz: f64,
    amplitude: f64,
    state: Mutex<Option<ToneState>>,
    periods: AtomicU64,
    xruns: AtomicU64,
}

impl ToneSource {
    /// Tone at `frequency_hz` scaled by `amplitude` (0-1).
    pub fn new(frequency_hz: f64, amplitude: f64) -> Self {
        Self {
            frequency_hz,
            amplitude: amplitude.clamp(0.0, 1.0),
            state: Mutex::new(None),
            periods: AtomicU64::new(0),
            xruns: AtomicU64::new(0),
        }
    }

    /// Start writing into `dma` and fill it completely.
    pub fn attach(&self, dma: Arc<DmaArea>, params: &HwParams) {
        let mut state = ToneState {
            dma,
            signal: signal::rate(params.rate as f64).const_hz(self.frequency_hz).sine(),
            write_off: 0,
            period_bytes: params.period_bytes,
        };
        let prefill = self.render(&mut state.signal, state.dma.len());
        state.write_off = state.dma.write(0, &prefill);
        debug!(rate = params.rate, frequency = self.frequency_hz, "tone attached");
        *self.state.lock() = Some(state);
    }

    /// Stop writing.
    pub fn detach(&self) {
        self.state.lock().take();
    }

    /// Periods rendered since creation.
    pub fn periods(&self) -> u64 {
        self.periods.load(Ordering::Relaxed)
    }

    /// Times the driver pushed the stream into xrun.
    pub fn xruns(&self) -> u64 {
        self.xruns.load(Ordering::Relaxed)
    }

    /// Interleaved little-endian S32 stereo bytes for the next `len` bytes of the tone.
    fn render(&self, sine: &mut signal::Sine<signal::ConstHz>, len: usize) -> Vec<u8> {
        let frames = len / (BYTES_PER_SAMPLE * 2);
        let mut out = Vec::with_capacity(len);
        for _ in 0..frames {
            let sample = (sine.next() * self.amplitude * i32::MAX as f64) as i32;
            let frame: Stereo<i32> = [sample, sample];
            for channel in frame.channels() {
                out.extend_from_slice(&channel.to_le_bytes());
            }
        }
        out
    }
}

impl HostPcm for ToneSource {
    fn period_elapsed(&self) {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return;
        };
        let period = self.render(&mut state.signal, state.period_bytes);
        state.write_off = state.dma.write(state.write_off, &period);
        self.periods.fetch_add(1, Ordering::Relaxed);
    }

    fn stop_xrun(&self) {
        warn!("tone stream stopped by driver");
        self.xruns.fetch_add(1, Ordering::Relaxed);
    }
}
