//! Playback substream: the host's ring buffer and the read position the
//! completion path advances through it.

use std::sync::Arc;

use parking_lot::Mutex;

use super::hw::{HwParams, PcmHardware};
use crate::dma::{DmaArea, copy_swapped};
use crate::error::{DriverError, Result};
use crate::host::HostPcm;

/// Buffer committed by `hw_params`.
pub(crate) struct HostRuntime {
    pub(crate) params: HwParams,
    pub(crate) dma: Arc<DmaArea>,
}

#[derive(Default)]
struct SubstreamState {
    instance: Option<Arc<dyn HostPcm>>,
    hardware: Option<PcmHardware>,
    runtime: Option<HostRuntime>,
    active: bool,
    dma_off: usize,
    period_off: usize,
}

/// Position snapshot for status reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubstreamPosition {
    /// Whether the host has triggered playback.
    pub active: bool,
    /// Byte offset of the next read from the ring buffer.
    pub dma_off: usize,
    /// Bytes consumed since the last period boundary.
    pub period_off: usize,
}

/// The single playback substream of a device. The lock is only ever held
/// for a copy or a field update.
#[derive(Default)]
pub(crate) struct PlaybackSubstream {
    lock: Mutex<SubstreamState>,
}

impl PlaybackSubstream {
    pub(crate) fn attach(&self, instance: Arc<dyn HostPcm>, hardware: PcmHardware) -> Result<()> {
        let mut sub = self.lock.lock();
        if sub.instance.is_some() {
            return Err(DriverError::Busy);
        }
        *sub = SubstreamState {
            instance: Some(instance),
            hardware: Some(hardware),
            ..SubstreamState::default()
        };
        Ok(())
    }

    /// Deactivate and forget the host stream. Returns `false` if none was attached.
    pub(crate) fn detach(&self) -> bool {
        let mut sub = self.lock.lock();
        let attached = sub.instance.is_some();
        *sub = SubstreamState::default();
        attached
    }

    pub(crate) fn instance(&self) -> Option<Arc<dyn HostPcm>> {
        self.lock.lock().instance.clone()
    }

    pub(crate) fn hardware(&self) -> Option<PcmHardware> {
        self.lock.lock().hardware.clone()
    }

    pub(crate) fn params(&self) -> Option<HwParams> {
        self.lock.lock().runtime.as_ref().map(|rt| rt.params)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lock.lock().active
    }

    pub(crate) fn set_runtime(&self, runtime: Option<HostRuntime>) {
        let mut sub = self.lock.lock();
        sub.runtime = runtime;
        sub.dma_off = 0;
        sub.period_off = 0;
    }

    pub(crate) fn set_active(&self, active: bool) -> Result<()> {
        let mut sub = self.lock.lock();
        if sub.instance.is_none() {
            return Err(DriverError::NoDevice);
        }
        sub.active = active;
        Ok(())
    }

    pub(crate) fn deactivate(&self) {
        self.lock.lock().active = false;
    }

    pub(crate) fn reset_offsets(&self) {
        let mut sub = self.lock.lock();
        sub.dma_off = 0;
        sub.period_off = 0;
    }

    /// Read position in frames, or `None` without an open substream.
    pub(crate) fn frames_played(&self) -> Option<usize> {
        let sub = self.lock.lock();
        sub.instance.as_ref()?;
        Some(match &sub.runtime {
            Some(rt) => sub.dma_off / rt.params.frame_bytes(),
            None => 0,
        })
    }

    pub(crate) fn position(&self) -> SubstreamPosition {
        let sub = self.lock.lock();
        SubstreamPosition {
            active: sub.active,
            dma_off: sub.dma_off,
            period_off: sub.period_off,
        }
    }

    /// Fill one transfer buffer: swapped ring data while active, silence
    /// otherwise. Returns the host to notify when a period boundary was
    /// crossed; the caller notifies after this returns, with the lock released.
    pub(crate) fn fill_packet(&self, dest: &mut [u8]) -> Option<Arc<dyn HostPcm>> {
        let mut guard = self.lock.lock();
        let sub = &mut *guard;
        let runtime = match (&sub.runtime, sub.active) {
            (Some(runtime), true) => runtime,
            _ => {
                dest.fill(0);
                return None;
            }
        };

        let dma_off = sub.dma_off;
        sub.dma_off = runtime.dma.with_bytes(|ring| copy_swapped(dest, ring, dma_off));
        sub.period_off += dest.len();
        let period_bytes = runtime.params.period_bytes;
        if sub.period_off >= period_bytes {
            sub.period_off %= period_bytes;
            return sub.instance.clone();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHost {
        periods: AtomicUsize,
    }

    impl HostPcm for CountingHost {
        fn period_elapsed(&self) {
            self.periods.fetch_add(1, Ordering::SeqCst);
        }

        fn stop_xrun(&self) {}
    }

    fn attached(period_bytes: usize, periods: usize) -> (PlaybackSubstream, Arc<DmaArea>) {
        let sub = PlaybackSubstream::default();
        sub.attach(
            Arc::new(CountingHost::default()),
            PcmHardware::for_device(false, None),
        )
        .unwrap();
        let params = HwParams::s32_stereo(48_000, period_bytes, periods);
        let dma = Arc::new(DmaArea::new_local(params.buffer_bytes()));
        sub.set_runtime(Some(HostRuntime {
            params,
            dma: dma.clone(),
        }));
        (sub, dma)
    }

    #[test]
    fn inactive_substream_sends_silence() {
        let (sub, dma) = attached(4096, 4);
        dma.fill(0x55);
        let mut packet = vec![0xffu8; 4096];
        assert!(sub.fill_packet(&mut packet).is_none());
        assert!(packet.iter().all(|&b| b == 0));
        assert_eq!(sub.position().dma_off, 0);
    }

    #[test]
    fn period_boundary_is_reported_once_per_period() {
        let (sub, _dma) = attached(8192, 4);
        sub.set_active(true).unwrap();
        let mut packet = vec![0u8; 4096];
        let notified: Vec<bool> = (0..8).map(|_| sub.fill_packet(&mut packet).is_some()).collect();
        assert_eq!(notified, [false, true, false, true, false, true, false, true]);
        let pos = sub.position();
        assert_eq!(pos.dma_off, 0);
        assert_eq!(pos.period_off, 0);
    }

    #[test]
    fn uneven_period_keeps_remainder() {
        let (sub, _dma) = attached(6144, 4);
        sub.set_active(true).unwrap();
        let mut packet = vec![0u8; 4096];
        assert!(sub.fill_packet(&mut packet).is_none());
        assert!(sub.fill_packet(&mut packet).is_some());
        assert_eq!(sub.position().period_off, 2048);
        assert_eq!(sub.frames_played(), Some(8192 / 8));
    }

    #[test]
    fn second_attach_is_busy() {
        let (sub, _dma) = attached(4096, 2);
        let again = sub.attach(
            Arc::new(CountingHost::default()),
            PcmHardware::for_device(false, None),
        );
        assert_eq!(again, Err(DriverError::Busy));
        assert!(sub.detach());
        assert_eq!(sub.frames_played(), None);
        assert_eq!(sub.set_active(true), Err(DriverError::NoDevice));
    }
}
