//! Start/stop state machine gating the transfer pool.
//!
//! The state is mirrored in an atomic so the completion worker can read it
//! without the stream mutex. Writes only happen through a `&mut StreamCore`,
//! which can only be obtained from the locked stream mutex.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::error::{DriverError, Result};
use crate::urb::UrbPool;

/// Where the transfer pipeline currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// No transfers in flight.
    Disabled = 0,
    /// Transfers submitted, first completion not yet seen.
    Starting = 1,
    /// Steady-state resubmission loop.
    Running = 2,
    /// Draining; completions are reclaimed instead of resubmitted.
    Stopping = 3,
}

impl StreamState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => StreamState::Starting,
            2 => StreamState::Running,
            3 => StreamState::Stopping,
            _ => StreamState::Disabled,
        }
    }

    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::*;
        matches!(
            (self, next),
            (Disabled, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Disabled)
        )
    }

    /// Lower-case name for logs and the console.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Disabled => "disabled",
            StreamState::Starting => "starting",
            StreamState::Running => "running",
            StreamState::Stopping => "stopping",
        }
    }
}

/// Contents of the stream mutex. Holding `&mut StreamCore` proves the
/// mutex is locked.
#[derive(Debug, Default)]
pub(crate) struct StreamCore {
    _private: (),
}

/// One-shot "first transfer came back" signal, re-armed on every start.
#[derive(Default)]
struct StartSignal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl StartSignal {
    fn reset(&self) {
        *self.fired.lock() = false;
    }

    fn notify(&self) {
        let mut fired = self.fired.lock();
        if !*fired {
            *fired = true;
            self.cond.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let mut fired = self.fired.lock();
        if !*fired {
            self.cond.wait_while_for(&mut fired, |fired| !*fired, timeout);
        }
        *fired
    }
}

/// The transfer pool plus the state that decides whether it may run.
pub(crate) struct StreamEngine {
    pool: UrbPool,
    state: AtomicU8,
    started: StartSignal,
    start_timeout: Duration,
}

impl StreamEngine {
    pub(crate) fn new(pool: UrbPool, start_timeout: Duration) -> Self {
        Self {
            pool,
            state: AtomicU8::new(StreamState::Disabled as u8),
            started: StartSignal::default(),
            start_timeout,
        }
    }

    pub(crate) fn pool(&self) -> &UrbPool {
        &self.pool
    }

    pub(crate) fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_panicked(&self) -> bool {
        self.pool.is_panicked()
    }

    /// Latch the panic flag. Returns `true` if it was already set.
    pub(crate) fn set_panic(&self) -> bool {
        self.pool.latch_panic()
    }

    pub(crate) fn notify_started(&self) {
        self.started.notify();
    }

    fn transition(&self, _core: &mut StreamCore, next: StreamState) {
        let current = self.state();
        debug_assert!(
            current.can_transition_to(next),
            "invalid stream transition {current:?} -> {next:?}"
        );
        trace!(from = current.as_str(), to = next.as_str(), "stream transition");
        self.state.store(next as u8, Ordering::Release);
    }

    /// Submit every transfer and wait for the first one to come back.
    pub(crate) fn start(&self, core: &mut StreamCore) -> Result<()> {
        if self.is_panicked() {
            return Err(DriverError::DeviceShutdown);
        }
        if self.state() != StreamState::Disabled {
            debug!(state = self.state().as_str(), "start requested while not disabled");
            return Ok(());
        }

        self.started.reset();
        self.transition(core, StreamState::Starting);
        if let Err(err) = self.pool.submit_all() {
            warn!(error = %err, "stream start failed");
            self.stop(core);
            return Err(err.into());
        }

        if !self.started.wait(self.start_timeout) {
            warn!(timeout = ?self.start_timeout, "no transfer completed, stopping stream");
            self.stop(core);
            return Err(DriverError::IoTimeout(self.start_timeout));
        }

        self.transition(core, StreamState::Running);
        info!("stream running");
        Ok(())
    }

    /// Drain and kill every transfer. Blocks; never call from the
    /// completion path.
    pub(crate) fn stop(&self, core: &mut StreamCore) {
        if self.state() == StreamState::Disabled {
            return;
        }
        self.transition(core, StreamState::Stopping);
        self.pool.stop_all();
        self.transition(core, StreamState::Disabled);
        info!("stream stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::bus::mock::MockBus;
    use crate::bus::{CompletionEvent, CompletionSender};
    use crate::error::TransportError;
    use crossbeam_channel::Receiver;

    fn engine(bus: &Arc<MockBus>, timeout: Duration) -> (StreamEngine, Receiver<CompletionEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let pool = UrbPool::new(
            bus.clone(),
            CompletionSender::new(tx),
            Duration::from_millis(5),
        );
        (StreamEngine::new(pool, timeout), rx)
    }

    #[test]
    fn only_forward_transitions_are_allowed() {
        use StreamState::*;
        assert!(Disabled.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Disabled));
        assert!(!Disabled.can_transition_to(Running));
        assert!(!Running.can_transition_to(Disabled));
        assert!(!Stopping.can_transition_to(Starting));
    }

    #[test]
    fn start_signal_is_rearmed() {
        let signal = StartSignal::default();
        signal.notify();
        assert!(signal.wait(Duration::from_millis(1)));
        signal.reset();
        assert!(!signal.wait(Duration::from_millis(1)));
    }

    #[test]
    fn submission_failure_leaves_stream_disabled() {
        let bus = Arc::new(MockBus::new());
        let (engine, _rx) = engine(&bus, Duration::from_millis(50));
        bus.fail_submissions(Some(TransportError::Stall));
        let mut core = StreamCore::default();
        assert_eq!(
            engine.start(&mut core),
            Err(DriverError::Transport(TransportError::Stall))
        );
        assert_eq!(engine.state(), StreamState::Disabled);
        assert_eq!(engine.pool().in_flight(), 0);
    }

    #[test]
    fn panicked_engine_refuses_to_start() {
        let bus = Arc::new(MockBus::new());
        let (engine, _rx) = engine(&bus, Duration::from_millis(50));
        assert!(!engine.set_panic());
        let mut core = StreamCore::default();
        assert_eq!(engine.start(&mut core), Err(DriverError::DeviceShutdown));
        assert_eq!(bus.submissions(), 0);
    }
}
