//! Playback engine for one device: host-facing PCM operations on top of the
//! transfer pool and its state machine.
//!
//! Completed transfers are delivered over a channel to a dedicated worker
//! thread. The worker refills each transfer from the host ring buffer and
//! hands it straight back to the bus, so the number of transfers in flight
//! stays constant while the stream runs. The worker never takes the stream
//! mutex; everything that blocks (rate changes, start, stop) happens on the
//! caller's thread under that mutex.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::bus::{CompletionEvent, CompletionSender, UrbCompletion, UsbBus};
use crate::clock::monotonic_timestamp_ns;
use crate::config::{DmaBacking, DriverConfig};
use crate::dma::DmaArea;
use crate::error::{DriverError, Result, TransportError};
use crate::host::{HostPcm, StreamDirection, TriggerCommand};
use crate::rate::{RateControl, RateIndex};
use crate::urb::UrbPool;

pub mod hw;
pub mod stream;
pub mod substream;

pub use hw::{HwParams, MAX_BUFSIZE, PcmHardware, SampleFormat};
pub use stream::StreamState;
pub use substream::SubstreamPosition;

use stream::{StreamCore, StreamEngine};
use substream::{HostRuntime, PlaybackSubstream};

#[derive(Default)]
struct StreamStats {
    completions: AtomicU64,
    periods: AtomicU64,
    resubmits: AtomicU64,
    errors: AtomicU64,
    starts: AtomicU64,
    last_completion_ns: AtomicU64,
}

/// Point-in-time view of a device's playback stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamStatus {
    /// State machine position.
    pub state: StreamState,
    /// Rate last committed to the device.
    pub rate_hz: Option<u32>,
    /// Host ring buffer position.
    pub position: SubstreamPosition,
    /// Whether a host stream is open.
    pub open: bool,
    /// Whether the runtime has been aborted.
    pub panicked: bool,
    /// Transfers owned by the bus or the completion worker.
    pub in_flight: usize,
    /// Transfers handed back by the bus.
    pub completions: u64,
    /// Period notifications sent to the host.
    pub periods: u64,
    /// Successful resubmissions from the completion worker.
    pub resubmits: u64,
    /// Completions that carried an error or resubmissions that failed.
    pub errors: u64,
    /// Successful stream starts.
    pub starts: u64,
    /// Monotonic timestamp of the latest completion, 0 if none.
    pub last_completion_ns: u64,
}

struct PcmRuntime {
    config: DriverConfig,
    control: Arc<RateControl>,
    extra_freq: bool,
    stream: Mutex<StreamCore>,
    engine: StreamEngine,
    playback: PlaybackSubstream,
    completions: CompletionSender,
    stats: StreamStats,
}

impl PcmRuntime {
    fn handle_completion(&self, done: UrbCompletion) {
        let UrbCompletion { mut urb, status } = done;
        let pool = self.engine.pool();
        self.stats.completions.fetch_add(1, Ordering::Relaxed);
        self.stats
            .last_completion_ns
            .store(monotonic_timestamp_ns(), Ordering::Relaxed);

        if let Err(err) = status {
            trace!(slot = urb.id().0, error = %err, "transfer finished with error");
            if err != TransportError::Cancelled {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
            pool.reclaim(urb);
            return;
        }
        if self.engine.is_panicked() {
            pool.reclaim(urb);
            return;
        }
        match self.engine.state() {
            StreamState::Stopping | StreamState::Disabled => {
                pool.reclaim(urb);
                return;
            }
            StreamState::Starting => self.engine.notify_started(),
            StreamState::Running => {}
        }

        if let Some(host) = self.playback.fill_packet(urb.buffer_mut()) {
            self.stats.periods.fetch_add(1, Ordering::Relaxed);
            host.period_elapsed();
        }

        match pool.resubmit(urb) {
            Ok(()) => {
                self.stats.resubmits.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                debug!(error = %err, "resubmission failed");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn run_worker(&self, events: Receiver<CompletionEvent>) {
        for event in events.iter() {
            match event {
                CompletionEvent::Urb(done) => self.handle_completion(done),
                CompletionEvent::Shutdown => break,
            }
        }
        debug!("completion worker exiting");
    }
}

/// PCM device serving the single playback substream of one USB device.
pub struct PcmDevice {
    runtime: Arc<PcmRuntime>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PcmDevice {
    /// Build the transfer pool for `bus` and start the completion worker.
    pub fn new(
        bus: Arc<dyn UsbBus>,
        control: Arc<RateControl>,
        config: &DriverConfig,
        extra_freq: bool,
    ) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let completions = CompletionSender::new(tx);
        let pool = UrbPool::new(bus, completions.clone(), config.drain_timeout);
        let runtime = Arc::new(PcmRuntime {
            config: config.clone(),
            control,
            extra_freq,
            stream: Mutex::new(StreamCore::default()),
            engine: StreamEngine::new(pool, config.start_timeout),
            playback: PlaybackSubstream::default(),
            completions,
            stats: StreamStats::default(),
        });

        let worker_runtime = runtime.clone();
        let worker = thread::Builder::new()
            .name("hiface-completion".into())
            .spawn(move || worker_runtime.run_worker(rx))
            .map_err(|err| DriverError::Resource(err.to_string()))?;

        debug!(extra_freq, "pcm runtime initialized");
        Ok(Self {
            runtime,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn check_alive(&self) -> Result<()> {
        if self.runtime.engine.is_panicked() {
            return Err(DriverError::DeviceShutdown);
        }
        Ok(())
    }

    /// Attach a host playback stream and report what the device accepts.
    pub fn open(&self, direction: StreamDirection, host: Arc<dyn HostPcm>) -> Result<PcmHardware> {
        self.check_alive()?;
        if direction != StreamDirection::Playback {
            return Err(DriverError::InvalidArgument(
                "only playback streams are supported".into(),
            ));
        }
        let rt = &self.runtime;
        let _core = rt.stream.lock();
        let hardware = PcmHardware::for_device(rt.extra_freq, rt.control.current());
        rt.playback.attach(host, hardware.clone())?;
        info!(rates = ?hardware.rates, "pcm open");
        Ok(hardware)
    }

    /// Detach the host stream, stop streaming and forget the committed rate.
    pub fn close(&self) -> Result<()> {
        if self.runtime.engine.is_panicked() {
            return Ok(());
        }
        let rt = &self.runtime;
        let mut core = rt.stream.lock();
        if rt.playback.detach() {
            rt.engine.stop(&mut core);
            rt.control.reset();
            info!("pcm close");
        }
        Ok(())
    }

    /// Validate the host's stream configuration and allocate the ring buffer.
    pub fn hw_params(&self, params: HwParams) -> Result<Arc<DmaArea>> {
        self.check_alive()?;
        let rt = &self.runtime;
        let _core = rt.stream.lock();
        let hardware = rt.playback.hardware().ok_or(DriverError::NoDevice)?;
        if rt.playback.is_active() {
            return Err(DriverError::Busy);
        }
        hardware.validate(&params)?;

        let len = params.buffer_bytes();
        let dma = match rt.config.dma_backing {
            DmaBacking::Local => DmaArea::new_local(len),
            DmaBacking::Shared => {
                DmaArea::new_shared(len).map_err(|err| DriverError::Resource(err.to_string()))?
            }
        };
        let dma = Arc::new(dma);
        rt.playback.set_runtime(Some(HostRuntime {
            params,
            dma: dma.clone(),
        }));
        debug!(
            rate = params.rate,
            period_bytes = params.period_bytes,
            periods = params.periods,
            "pcm hw_params"
        );
        Ok(dma)
    }

    /// Release the ring buffer.
    pub fn hw_free(&self) -> Result<()> {
        let rt = &self.runtime;
        let _core = rt.stream.lock();
        if rt.playback.is_active() {
            return Err(DriverError::Busy);
        }
        rt.playback.set_runtime(None);
        Ok(())
    }

    /// Rewind the ring buffer and, if the stream is not running yet, commit
    /// the rate and start it.
    pub fn prepare(&self) -> Result<()> {
        self.check_alive()?;
        let rt = &self.runtime;
        let mut core = rt.stream.lock();
        if rt.playback.instance().is_none() {
            return Err(DriverError::NoDevice);
        }
        let params = rt
            .playback
            .params()
            .ok_or_else(|| DriverError::InvalidArgument("hw_params not set".into()))?;
        rt.playback.reset_offsets();

        if rt.engine.state() == StreamState::Disabled {
            let rate = RateIndex::from_hz(params.rate)
                .filter(|rate| rt.extra_freq || !rate.is_extra())
                .ok_or_else(|| {
                    DriverError::InvalidArgument(format!("unsupported rate {}", params.rate))
                })?;
            rt.control.set_rate(rate)?;
            rt.engine.start(&mut core)?;
            rt.stats.starts.fetch_add(1, Ordering::Relaxed);
        }
        debug!(rate = params.rate, "pcm prepare");
        Ok(())
    }

    /// Activate or deactivate reading from the ring buffer.
    pub fn trigger(&self, cmd: TriggerCommand) -> Result<()> {
        self.check_alive()?;
        let active = match cmd {
            TriggerCommand::Start | TriggerCommand::PauseRelease => true,
            TriggerCommand::Stop | TriggerCommand::PausePush => false,
            other => {
                return Err(DriverError::InvalidArgument(format!(
                    "unsupported trigger {other:?}"
                )));
            }
        };
        self.runtime.playback.set_active(active)?;
        debug!(?cmd, "pcm trigger");
        Ok(())
    }

    /// Current read position in frames.
    pub fn pointer(&self) -> Result<usize> {
        self.check_alive()?;
        self.runtime
            .playback
            .frames_played()
            .ok_or(DriverError::NoDevice)
    }

    /// Latch the panic flag, push the host stream into xrun and stop every
    /// transfer. Safe to call concurrently with completions and host calls.
    pub fn abort(&self) {
        let rt = &self.runtime;
        if !rt.engine.set_panic() {
            warn!("aborting pcm stream");
        }
        if let Some(host) = rt.playback.instance() {
            host.stop_xrun();
        }
        rt.playback.deactivate();
        let mut core = rt.stream.lock();
        rt.engine.stop(&mut core);
    }

    /// Latch the panic flag and stop the completion worker. Aborts first if
    /// the stream is still running. Idempotent; every later host operation
    /// fails with [`DriverError::DeviceShutdown`].
    pub fn destroy(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let rt = &self.runtime;
        if !rt.engine.set_panic() {
            debug!("pcm runtime shutting down");
        }
        if rt.engine.state() != StreamState::Disabled {
            self.abort();
        }
        rt.completions.shutdown();
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            error!("completion worker panicked");
        }
        debug!("pcm runtime destroyed");
    }

    /// Whether `abort` has run.
    pub fn is_panicked(&self) -> bool {
        self.runtime.engine.is_panicked()
    }

    /// Current state machine position.
    pub fn state(&self) -> StreamState {
        self.runtime.engine.state()
    }

    /// Snapshot of the stream for diagnostics.
    pub fn status(&self) -> StreamStatus {
        let rt = &self.runtime;
        let stats = &rt.stats;
        StreamStatus {
            state: rt.engine.state(),
            rate_hz: rt.control.current().map(RateIndex::hz),
            position: rt.playback.position(),
            open: rt.playback.instance().is_some(),
            panicked: rt.engine.is_panicked(),
            in_flight: rt.engine.pool().in_flight(),
            completions: stats.completions.load(Ordering::Relaxed),
            periods: stats.periods.load(Ordering::Relaxed),
            resubmits: stats.resubmits.load(Ordering::Relaxed),
            errors: stats.errors.load(Ordering::Relaxed),
            starts: stats.starts.load(Ordering::Relaxed),
            last_completion_ns: stats.last_completion_ns.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PcmDevice {
    fn drop(&mut self) {
        self.destroy();
    }
}
