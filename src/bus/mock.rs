//! Deterministic in-memory bus for exercising the streaming engine.
//!
//! Nothing completes on its own: tests decide when and how each queued
//! transfer finishes, and can inject failures into submissions and control
//! requests or unplug the device altogether.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{BulkUrb, CompletionSender, SetupPacket, SubmitError, UrbId, UrbStatus, UsbBus};
use crate::error::TransportError;

#[derive(Default)]
struct MockState {
    in_flight: VecDeque<(BulkUrb, CompletionSender)>,
    controls: Vec<SetupPacket>,
    interfaces: Vec<(u8, u8)>,
    submissions: usize,
    cancellations: usize,
    captured: Vec<u8>,
    fail_submit: Option<TransportError>,
    fail_submit_after: Option<usize>,
    fail_control: Option<TransportError>,
    fail_interface: Option<TransportError>,
    unplugged: bool,
}

/// Bus double that queues submitted transfers until the test completes them.
#[derive(Default)]
pub struct MockBus {
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockBus {
    /// Create an empty bus with no faults configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every future bulk submission with `error` (or stop failing with `None`).
    pub fn fail_submissions(&self, error: Option<TransportError>) {
        self.state.lock().fail_submit = error;
    }

    /// Accept the next `accepted` submissions, then fail the rest with an I/O error.
    pub fn fail_submissions_after(&self, accepted: usize) {
        let mut state = self.state.lock();
        state.fail_submit_after = Some(state.submissions + accepted);
    }

    /// Fail future vendor control requests.
    pub fn fail_control(&self, error: Option<TransportError>) {
        self.state.lock().fail_control = error;
    }

    /// Fail future alternate-setting selections.
    pub fn fail_set_interface(&self, error: Option<TransportError>) {
        self.state.lock().fail_interface = error;
    }

    /// Simulate removal: every queued transfer completes with
    /// [`TransportError::NoDevice`] and later operations fail the same way.
    pub fn unplug(&self) {
        let drained: Vec<_> = {
            let mut state = self.state.lock();
            state.unplugged = true;
            state.in_flight.drain(..).collect()
        };
        self.changed.notify_all();
        for (urb, sender) in drained {
            sender.complete(urb, Err(TransportError::NoDevice));
        }
    }

    /// Complete the oldest queued transfer successfully. Returns `false` when
    /// nothing is in flight.
    pub fn complete_next(&self) -> bool {
        self.complete_next_with(|urb| Ok(urb.len()))
    }

    /// Complete the oldest queued transfer with a status derived from it.
    pub fn complete_next_with(&self, status: impl FnOnce(&BulkUrb) -> UrbStatus) -> bool {
        let next = {
            let mut state = self.state.lock();
            let next = state.in_flight.pop_front();
            if let Some((urb, _)) = &next {
                let status = status(urb);
                if status.is_ok() {
                    state.captured.extend_from_slice(urb.data());
                }
                next.map(|(urb, sender)| (urb, sender, status))
            } else {
                None
            }
        };
        self.changed.notify_all();
        match next {
            Some((urb, sender, status)) => {
                sender.complete(urb, status);
                true
            }
            None => false,
        }
    }

    /// Complete every currently queued transfer successfully. Transfers
    /// resubmitted while this runs stay queued.
    pub fn complete_all(&self) -> usize {
        let pending = self.in_flight();
        let mut done = 0;
        while done < pending && self.complete_next() {
            done += 1;
        }
        done
    }

    /// Transfers currently owned by the bus.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Block until exactly `count` transfers are queued or the timeout expires.
    pub fn wait_in_flight(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.in_flight.len() != count {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.in_flight.len() == count;
            }
        }
        true
    }

    /// Total bulk submissions accepted so far.
    pub fn submissions(&self) -> usize {
        self.state.lock().submissions
    }

    /// Cancellation requests that found a transfer in flight.
    pub fn cancellations(&self) -> usize {
        self.state.lock().cancellations
    }

    /// Control requests issued so far, oldest first.
    pub fn control_requests(&self) -> Vec<SetupPacket> {
        self.state.lock().controls.clone()
    }

    /// Alternate settings selected so far as `(interface, alt_setting)`.
    pub fn interface_selections(&self) -> Vec<(u8, u8)> {
        self.state.lock().interfaces.clone()
    }

    /// Take the payload bytes of every successfully completed transfer, in
    /// completion order.
    pub fn take_captured(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().captured)
    }
}

impl UsbBus for MockBus {
    fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.unplugged {
            return Err(TransportError::NoDevice);
        }
        if let Some(err) = state.fail_interface.clone() {
            return Err(err);
        }
        state.interfaces.push((interface, alt_setting));
        Ok(())
    }

    fn control_out(&self, setup: SetupPacket, _timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.unplugged {
            return Err(TransportError::NoDevice);
        }
        if let Some(err) = state.fail_control.clone() {
            return Err(err);
        }
        state.controls.push(setup);
        Ok(())
    }

    fn submit_bulk_out(
        &self,
        urb: BulkUrb,
        completion: &CompletionSender,
    ) -> Result<(), SubmitError> {
        let mut state = self.state.lock();
        let failure = if state.unplugged {
            Some(TransportError::NoDevice)
        } else if let Some(err) = state.fail_submit.clone() {
            Some(err)
        } else if state
            .fail_submit_after
            .is_some_and(|limit| state.submissions >= limit)
        {
            Some(TransportError::Io("injected submission failure".into()))
        } else {
            None
        };
        if let Some(error) = failure {
            return Err(SubmitError { error, urb });
        }
        state.submissions += 1;
        state.in_flight.push_back((urb, completion.clone()));
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn cancel(&self, id: UrbId) {
        let cancelled = {
            let mut state = self.state.lock();
            let position = state.in_flight.iter().position(|(urb, _)| urb.id() == id);
            let cancelled = position.and_then(|idx| state.in_flight.remove(idx));
            if cancelled.is_some() {
                state.cancellations += 1;
            }
            cancelled
        };
        if let Some((urb, sender)) = cancelled {
            self.changed.notify_all();
            sender.complete(urb, Err(TransportError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::CompletionEvent;

    fn sender() -> (CompletionSender, crossbeam_channel::Receiver<CompletionEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (CompletionSender::new(tx), rx)
    }

    #[test]
    fn completes_in_submission_order_and_captures_payload() {
        let bus = MockBus::new();
        let (tx, rx) = sender();
        let mut first = BulkUrb::new(UrbId(0), 2, 4);
        first.buffer_mut().copy_from_slice(&[1, 2, 3, 4]);
        bus.submit_bulk_out(first, &tx).unwrap();
        bus.submit_bulk_out(BulkUrb::new(UrbId(1), 2, 4), &tx).unwrap();

        assert!(bus.complete_next());
        match rx.try_recv().unwrap() {
            CompletionEvent::Urb(done) => {
                assert_eq!(done.urb.id(), UrbId(0));
                assert_eq!(done.status, Ok(4));
            }
            CompletionEvent::Shutdown => panic!("unexpected shutdown"),
        }
        assert_eq!(bus.take_captured(), vec![1, 2, 3, 4]);
        assert_eq!(bus.in_flight(), 1);
    }

    #[test]
    fn cancel_delivers_cancelled_status() {
        let bus = MockBus::new();
        let (tx, rx) = sender();
        bus.submit_bulk_out(BulkUrb::new(UrbId(3), 2, 4), &tx).unwrap();
        bus.cancel(UrbId(7));
        assert_eq!(bus.cancellations(), 0);
        bus.cancel(UrbId(3));
        assert_eq!(bus.cancellations(), 1);
        match rx.try_recv().unwrap() {
            CompletionEvent::Urb(done) => assert_eq!(done.status, Err(TransportError::Cancelled)),
            CompletionEvent::Shutdown => panic!("unexpected shutdown"),
        }
    }

    #[test]
    fn injected_failures_hand_the_transfer_back() {
        let bus = MockBus::new();
        let (tx, _rx) = sender();
        bus.fail_submissions_after(1);
        assert!(bus.submit_bulk_out(BulkUrb::new(UrbId(0), 2, 4), &tx).is_ok());
        let err = bus
            .submit_bulk_out(BulkUrb::new(UrbId(1), 2, 4), &tx)
            .unwrap_err();
        assert_eq!(err.urb.id(), UrbId(1));
        assert!(matches!(err.error, TransportError::Io(_)));
    }
}
