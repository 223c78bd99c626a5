//! Fixed pool of outbound bulk transfers.
//!
//! Each slot owns one packet-sized buffer. While a transfer is in flight its
//! [`BulkUrb`] lives inside the bus and the slot's anchor is busy; the anchor
//! only drains once the completion path decides not to resubmit and hands the
//! buffer back. Killing a slot blocks new submissions on it until the anchor
//! drains, so no completion for that slot runs after `kill` returns.
//!
//! The pool also owns the panic latch. It is checked under the same slot lock
//! that guards submission, so once [`UrbPool::latch_panic`] returns no
//! transfer reaches the bus again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::bus::{BulkUrb, CompletionSender, SubmitError, UrbId, UsbBus};
use crate::error::TransportError;

/// Transfers kept in flight while streaming.
pub const PCM_N_URBS: usize = 8;
/// Payload bytes per transfer.
pub const PCM_PACKET_SIZE: usize = 4096;
/// Bulk OUT endpoint the device reads samples from.
pub const OUT_EP: u8 = 2;

const KILL_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Tracks whether a slot's transfer is owned by the bus or the completion path.
#[derive(Default)]
struct Anchor {
    busy: Mutex<bool>,
    drained: Condvar,
}

impl Anchor {
    fn claim(&self) {
        *self.busy.lock() = true;
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.drained.notify_all();
    }

    fn is_busy(&self) -> bool {
        *self.busy.lock()
    }

    /// Returns `true` if the anchor is empty when the wait ends.
    fn wait_empty_timeout(&self, timeout: Duration) -> bool {
        let mut busy = self.busy.lock();
        if *busy {
            self.drained.wait_while_for(&mut busy, |busy| *busy, timeout);
        }
        !*busy
    }
}

struct UrbSlot {
    id: UrbId,
    idle: Mutex<Option<BulkUrb>>,
    /// Set while the slot is being killed; held across submission.
    rejecting: Mutex<bool>,
    anchor: Anchor,
}

/// The fixed set of transfer buffers for one playback direction.
pub struct UrbPool {
    bus: Arc<dyn UsbBus>,
    completions: CompletionSender,
    slots: Vec<UrbSlot>,
    drain_timeout: Duration,
    panic: AtomicBool,
}

impl UrbPool {
    pub(crate) fn new(
        bus: Arc<dyn UsbBus>,
        completions: CompletionSender,
        drain_timeout: Duration,
    ) -> Self {
        let slots = (0..PCM_N_URBS)
            .map(|i| Self::init_urb(UrbId(i), OUT_EP))
            .collect();
        Self {
            bus,
            completions,
            slots,
            drain_timeout,
            panic: AtomicBool::new(false),
        }
    }

    fn init_urb(id: UrbId, endpoint: u8) -> UrbSlot {
        UrbSlot {
            id,
            idle: Mutex::new(Some(BulkUrb::new(id, endpoint, PCM_PACKET_SIZE))),
            rejecting: Mutex::new(false),
            anchor: Anchor::default(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slots whose transfer is currently owned by the bus or the completion path.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.anchor.is_busy()).count()
    }

    /// Whether the panic latch is set.
    pub fn is_panicked(&self) -> bool {
        self.panic.load(Ordering::Acquire)
    }

    /// Set the panic latch while holding every slot's submission lock, so no
    /// submission straddles it. Returns `true` if it was already set.
    pub(crate) fn latch_panic(&self) -> bool {
        let _held: Vec<_> = self.slots.iter().map(|s| s.rejecting.lock()).collect();
        self.panic.swap(true, Ordering::AcqRel)
    }

    /// Zero every buffer and submit it. On the first failure every transfer
    /// already submitted is stopped again and the error is returned.
    pub fn submit_all(&self) -> Result<(), TransportError> {
        for slot in &self.slots {
            let Some(mut urb) = slot.idle.lock().take() else {
                warn!(slot = slot.id.0, "transfer still owned by the bus, not resubmitting");
                continue;
            };
            urb.buffer_mut().fill(0);
            if let Err(err) = self.submit(slot, urb) {
                warn!(slot = slot.id.0, error = %err, "bulk submission failed");
                self.stop_all();
                return Err(err);
            }
        }
        debug!(count = self.slots.len(), "submitted all transfers");
        Ok(())
    }

    /// Hand a completed transfer straight back to the bus. On failure the
    /// buffer returns to its slot.
    pub(crate) fn resubmit(&self, urb: BulkUrb) -> Result<(), TransportError> {
        let slot = &self.slots[urb.id().0];
        self.submit(slot, urb)
    }

    /// Return a completed transfer to its slot without resubmitting it.
    pub(crate) fn reclaim(&self, urb: BulkUrb) {
        let slot = &self.slots[urb.id().0];
        *slot.idle.lock() = Some(urb);
        slot.anchor.release();
    }

    fn submit(&self, slot: &UrbSlot, urb: BulkUrb) -> Result<(), TransportError> {
        let rejecting = slot.rejecting.lock();
        if *rejecting || self.is_panicked() {
            drop(rejecting);
            self.reclaim(urb);
            return Err(TransportError::Rejected);
        }
        slot.anchor.claim();
        match self.bus.submit_bulk_out(urb, &self.completions) {
            Ok(()) => Ok(()),
            Err(SubmitError { error, urb }) => {
                drop(rejecting);
                self.reclaim(urb);
                Err(error)
            }
        }
    }

    /// Wait up to the drain timeout for each slot's transfer to come back,
    /// cancel whatever is still outstanding, then kill every slot. Blocks the
    /// caller; must never run on the completion path.
    pub fn stop_all(&self) {
        for slot in &self.slots {
            if !slot.anchor.wait_empty_timeout(self.drain_timeout) {
                trace!(slot = slot.id.0, "drain timed out, cancelling");
                self.bus.cancel(slot.id);
            }
            self.kill(slot);
        }
    }

    fn kill(&self, slot: &UrbSlot) {
        *slot.rejecting.lock() = true;
        self.bus.cancel(slot.id);
        while !slot.anchor.wait_empty_timeout(KILL_WARN_INTERVAL) {
            warn!(slot = slot.id.0, "transfer did not return after cancel, retrying");
            self.bus.cancel(slot.id);
        }
        *slot.rejecting.lock() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CompletionEvent;
    use crate::bus::mock::MockBus;
    use crossbeam_channel::Receiver;

    fn pool(bus: &Arc<MockBus>) -> (UrbPool, Receiver<CompletionEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let pool = UrbPool::new(
            bus.clone(),
            CompletionSender::new(tx),
            Duration::from_millis(5),
        );
        (pool, rx)
    }

    // Plays the completion path: every returned transfer goes back to its slot.
    fn reclaim_all(pool: &UrbPool, rx: &Receiver<CompletionEvent>) {
        while let Ok(CompletionEvent::Urb(done)) = rx.try_recv() {
            pool.reclaim(done.urb);
        }
    }

    #[test]
    fn submit_all_hands_every_buffer_to_the_bus() {
        let bus = Arc::new(MockBus::new());
        let (pool, _rx) = pool(&bus);
        pool.submit_all().unwrap();
        assert_eq!(bus.in_flight(), PCM_N_URBS);
        assert_eq!(pool.in_flight(), PCM_N_URBS);
        assert!(pool.slots.iter().all(|s| s.idle.lock().is_none()));
    }

    #[test]
    fn failed_submission_unwinds_earlier_ones() {
        let bus = Arc::new(MockBus::new());
        let (pool, rx) = pool(&bus);
        bus.fail_submissions_after(3);

        // Cancelled transfers must be reclaimed for kill to return.
        let result = std::thread::scope(|scope| {
            let submit = scope.spawn(|| pool.submit_all());
            while !submit.is_finished() {
                reclaim_all(&pool, &rx);
                std::thread::sleep(Duration::from_millis(1));
            }
            submit.join().unwrap()
        });

        assert!(matches!(result, Err(TransportError::Io(_))));
        assert_eq!(bus.cancellations(), 3);
        assert_eq!(bus.in_flight(), 0);
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.slots.iter().all(|s| s.idle.lock().is_some()));
    }

    #[test]
    fn kill_rejects_resubmission_while_draining() {
        let bus = Arc::new(MockBus::new());
        let (pool, _rx) = pool(&bus);
        let slot = &pool.slots[0];
        *slot.rejecting.lock() = true;
        let urb = slot.idle.lock().take().unwrap();
        assert_eq!(pool.resubmit(urb), Err(TransportError::Rejected));
        assert_eq!(bus.submissions(), 0);
        assert!(slot.idle.lock().is_some());
        assert!(!slot.anchor.is_busy());
    }

    #[test]
    fn latched_panic_refuses_every_submission() {
        let bus = Arc::new(MockBus::new());
        let (pool, _rx) = pool(&bus);
        assert!(!pool.latch_panic());
        assert!(pool.latch_panic());

        let urb = pool.slots[3].idle.lock().take().unwrap();
        assert_eq!(pool.resubmit(urb), Err(TransportError::Rejected));
        assert_eq!(pool.submit_all(), Err(TransportError::Rejected));
        assert_eq!(bus.submissions(), 0);
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.slots.iter().all(|s| s.idle.lock().is_some()));
    }

    #[test]
    fn stop_all_on_idle_pool_returns_immediately() {
        let bus = Arc::new(MockBus::new());
        let (pool, _rx) = pool(&bus);
        pool.stop_all();
        assert_eq!(bus.cancellations(), 0);
        assert_eq!(pool.in_flight(), 0);
    }
}
