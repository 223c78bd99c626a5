//! A simulated device wired through the registry, driven by the console.

use std::sync::Arc;

use tracing::info;

use super::api;
use super::tone::ToneSource;
use crate::bus::clocked::ClockedBus;
use crate::chip::{Chip, ChipRegistry, DeviceAddress, UsbDeviceInfo, UsbInterface};
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::host::{StreamDirection, TriggerCommand};
use crate::pcm::{HwParams, StreamState, StreamStatus};
use crate::rate::{BASE_RATES, RateIndex};

const DEMO_ADDRESS: DeviceAddress = DeviceAddress { bus: 1, device: 2 };
const DEMO_PERIOD_BYTES: usize = 8192;
const DEMO_PERIODS: usize = 4;
const DEMO_TONE_HZ: f64 = 1_000.0;
const DEMO_TONE_AMPLITUDE: f64 = 0.5;

/// Combined view of driver and simulated device.
#[derive(Clone, Debug)]
pub struct SessionStatus {
    /// Card long name, if the device is still bound.
    pub card: Option<String>,
    /// Driver-side stream status, if the device is still bound.
    pub stream: Option<StreamStatus>,
    /// Rate the simulated device is clocked at.
    pub device_rate_hz: u32,
    /// Bytes the simulated device has consumed.
    pub bytes_streamed: u64,
    /// Transfers the simulated device has consumed.
    pub packets: u64,
    /// Peak level of the latest packet, 0-1.
    pub peak_level: f32,
    /// Periods the tone generator has rendered.
    pub tone_periods: u64,
    /// Whether playback is triggered.
    pub playing: bool,
    /// Whether the device has been unplugged.
    pub unplugged: bool,
}

/// One simulated device playing a test tone.
pub struct DemoSession {
    registry: ChipRegistry,
    bus: Arc<ClockedBus>,
    tone: Arc<ToneSource>,
    rate: RateIndex,
    playing: bool,
}

impl DemoSession {
    /// Plug in a simulated device and open its playback stream at `rate_hz`.
    pub fn new(config: DriverConfig, rate_hz: u32) -> Result<Self> {
        let rate = RateIndex::from_hz(rate_hz)
            .filter(|rate| !rate.is_extra())
            .ok_or_else(|| DriverError::InvalidArgument(format!("unsupported rate {rate_hz}")))?;
        let bus = Arc::new(
            ClockedBus::new(rate_hz).map_err(|err| DriverError::Resource(err.to_string()))?,
        );
        let registry = ChipRegistry::new(config);
        let chip = registry.probe(&UsbInterface {
            device: UsbDeviceInfo {
                vendor: 0x04b4,
                product: 0x930b,
                address: DEMO_ADDRESS,
            },
            interface_number: 0,
            bus: bus.clone(),
        })?;
        let tone = Arc::new(ToneSource::new(DEMO_TONE_HZ, DEMO_TONE_AMPLITUDE));
        chip.pcm().open(StreamDirection::Playback, tone.clone())?;
        info!(card = chip.longname(), "demo session ready");
        Ok(Self {
            registry,
            bus,
            tone,
            rate,
            playing: false,
        })
    }

    fn chip(&self) -> Result<Arc<Chip>> {
        self.registry
            .lookup(DEMO_ADDRESS)
            .ok_or(DriverError::NoDevice)
    }

    fn configure(&self, chip: &Chip) -> Result<()> {
        let params = HwParams::s32_stereo(self.rate.hz(), DEMO_PERIOD_BYTES, DEMO_PERIODS);
        let dma = chip.pcm().hw_params(params)?;
        self.tone.attach(dma, &params);
        chip.pcm().prepare()
    }

    /// Commit the stream and start playing.
    pub fn start(&mut self) -> Result<()> {
        let chip = self.chip()?;
        if chip.pcm().status().state == StreamState::Disabled {
            self.configure(&chip)?;
        }
        chip.pcm().trigger(TriggerCommand::Start)?;
        self.playing = true;
        Ok(())
    }

    /// Pause or resume. Streaming continues with silence while paused.
    pub fn toggle_pause(&mut self) -> Result<()> {
        let chip = self.chip()?;
        let cmd = if self.playing {
            TriggerCommand::PausePush
        } else {
            TriggerCommand::PauseRelease
        };
        chip.pcm().trigger(cmd)?;
        self.playing = !self.playing;
        Ok(())
    }

    /// Reopen the stream at the next base rate. Returns the new rate in Hz.
    pub fn cycle_rate(&mut self) -> Result<u32> {
        let chip = self.chip()?;
        let pcm = chip.pcm();
        pcm.trigger(TriggerCommand::Stop)?;
        self.tone.detach();
        pcm.hw_free()?;
        pcm.close()?;

        self.rate = RateIndex::new((self.rate.index() + 1) % BASE_RATES)?;
        pcm.open(StreamDirection::Playback, self.tone.clone())?;
        if self.playing {
            self.configure(&chip)?;
            pcm.trigger(TriggerCommand::Start)?;
        }
        Ok(self.rate.hz())
    }

    /// Pull the simulated cable and let the registry tear the device down.
    pub fn unplug(&mut self) -> Result<()> {
        self.bus.unplug();
        self.registry.disconnect(DEMO_ADDRESS)?;
        self.tone.detach();
        self.playing = false;
        Ok(())
    }

    /// Abort streaming without unplugging. The stream stays dead until the
    /// device is unplugged.
    pub fn abort(&mut self) -> Result<()> {
        api::abort(&self.registry, DEMO_ADDRESS)?;
        self.playing = false;
        Ok(())
    }

    /// Registry the simulated device is bound in.
    pub fn registry(&self) -> &ChipRegistry {
        &self.registry
    }

    /// Rate the stream is configured for.
    pub fn rate_hz(&self) -> u32 {
        self.rate.hz()
    }

    /// Snapshot for display.
    pub fn status(&self) -> SessionStatus {
        let chip = self.registry.lookup(DEMO_ADDRESS);
        SessionStatus {
            card: chip.as_ref().map(|c| c.longname().to_string()),
            stream: api::get_status(&self.registry, DEMO_ADDRESS),
            device_rate_hz: self.bus.rate_hz(),
            bytes_streamed: self.bus.bytes_streamed(),
            packets: self.bus.packets(),
            peak_level: self.bus.peak_level(),
            tone_periods: self.tone.periods(),
            playing: self.playing,
            unplugged: self.bus.is_unplugged(),
        }
    }
}
