//! Simulated DAC that consumes bulk transfers in real time.
//!
//! A ticker thread pops one queued transfer every packet period (payload
//! length divided by the byte rate of the last rate selected over the control
//! pipe) and completes it, so the driver sees the same cadence a real device
//! imposes. Used by the developer console and the self-tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{BulkUrb, CompletionSender, SetupPacket, SubmitError, UrbId, UsbBus};
use crate::dma::swap_word;
use crate::error::TransportError;
use crate::rate::{RATE_REQUEST, RateIndex};

const FRAME_BYTES: f64 = 8.0;
const IDLE_TICK: Duration = Duration::from_millis(5);

struct Shared {
    queue: Mutex<VecDeque<(BulkUrb, CompletionSender)>>,
    rate_hz: AtomicU32,
    running: AtomicBool,
    unplugged: AtomicBool,
    bytes: AtomicU64,
    packets: AtomicU64,
    peak_bits: AtomicU32,
}

/// Bus whose device side plays transfers back at the selected sample rate.
pub struct ClockedBus {
    shared: Arc<Shared>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ClockedBus {
    /// Start the simulated device at `initial_rate_hz` until a rate request arrives.
    pub fn new(initial_rate_hz: u32) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            rate_hz: AtomicU32::new(initial_rate_hz.max(1)),
            running: AtomicBool::new(true),
            unplugged: AtomicBool::new(false),
            bytes: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            peak_bits: AtomicU32::new(0.0f32.to_bits()),
        });
        let worker = shared.clone();
        let ticker = thread::Builder::new()
            .name("hiface-clocked-bus".into())
            .spawn(move || run_ticker(&worker))?;
        Ok(Self {
            shared,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    /// Sample rate the simulated device is currently clocked at.
    pub fn rate_hz(&self) -> u32 {
        self.shared.rate_hz.load(Ordering::Relaxed)
    }

    /// Payload bytes consumed by the device so far.
    pub fn bytes_streamed(&self) -> u64 {
        self.shared.bytes.load(Ordering::Relaxed)
    }

    /// Transfers consumed by the device so far.
    pub fn packets(&self) -> u64 {
        self.shared.packets.load(Ordering::Relaxed)
    }

    /// Peak absolute sample level (0-1) of the most recent packet.
    pub fn peak_level(&self) -> f32 {
        f32::from_bits(self.shared.peak_bits.load(Ordering::Relaxed))
    }

    /// Transfers queued on the device side.
    pub fn in_flight(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Simulate the cable being pulled.
    pub fn unplug(&self) {
        self.shared.unplugged.store(true, Ordering::SeqCst);
        let drained: Vec<_> = self.shared.queue.lock().drain(..).collect();
        for (urb, sender) in drained {
            sender.complete(urb, Err(TransportError::NoDevice));
        }
    }

    /// Whether [`ClockedBus::unplug`] has been called.
    pub fn is_unplugged(&self) -> bool {
        self.shared.unplugged.load(Ordering::SeqCst)
    }
}

impl Drop for ClockedBus {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().take() {
            if handle.join().is_err() {
                warn!("clocked bus ticker panicked");
            }
        }
    }
}

fn run_ticker(shared: &Shared) {
    while shared.running.load(Ordering::SeqCst) {
        let next = shared.queue.lock().pop_front();
        let Some((urb, sender)) = next else {
            thread::sleep(IDLE_TICK);
            continue;
        };
        let rate = shared.rate_hz.load(Ordering::Relaxed).max(1) as f64;
        thread::sleep(Duration::from_secs_f64(urb.len() as f64 / (rate * FRAME_BYTES)));
        if shared.unplugged.load(Ordering::SeqCst) {
            sender.complete(urb, Err(TransportError::NoDevice));
            continue;
        }

        shared
            .peak_bits
            .store(packet_peak(urb.data()).to_bits(), Ordering::Relaxed);
        shared.bytes.fetch_add(urb.len() as u64, Ordering::Relaxed);
        shared.packets.fetch_add(1, Ordering::Relaxed);
        let len = urb.len();
        sender.complete(urb, Ok(len));
    }
}

fn packet_peak(data: &[u8]) -> f32 {
    let mut word = [0u8; 4];
    let mut peak = 0u32;
    for chunk in data.chunks_exact(4) {
        swap_word(&mut word, chunk);
        peak = peak.max(i32::from_le_bytes(word).unsigned_abs());
    }
    peak as f32 / i32::MAX as f32
}

impl UsbBus for ClockedBus {
    fn set_interface(&self, _interface: u8, _alt_setting: u8) -> Result<(), TransportError> {
        if self.is_unplugged() {
            return Err(TransportError::NoDevice);
        }
        Ok(())
    }

    fn control_out(&self, setup: SetupPacket, _timeout: Duration) -> Result<(), TransportError> {
        if self.is_unplugged() {
            return Err(TransportError::NoDevice);
        }
        if setup.b_request == RATE_REQUEST {
            match RateIndex::from_wire_value(setup.w_value as u8) {
                Some(rate) => {
                    debug!(rate_hz = rate.hz(), "simulated dac reclocked");
                    self.shared.rate_hz.store(rate.hz(), Ordering::Relaxed);
                }
                None => return Err(TransportError::Stall),
            }
        }
        Ok(())
    }

    fn submit_bulk_out(
        &self,
        urb: BulkUrb,
        completion: &CompletionSender,
    ) -> Result<(), SubmitError> {
        if self.is_unplugged() {
            return Err(SubmitError {
                error: TransportError::NoDevice,
                urb,
            });
        }
        self.shared
            .queue
            .lock()
            .push_back((urb, completion.clone()));
        Ok(())
    }

    fn cancel(&self, id: UrbId) {
        let cancelled = {
            let mut queue = self.shared.queue.lock();
            let position = queue.iter().position(|(urb, _)| urb.id() == id);
            position.and_then(|idx| queue.remove(idx))
        };
        if let Some((urb, sender)) = cancelled {
            sender.complete(urb, Err(TransportError::Cancelled));
        }
    }
}
