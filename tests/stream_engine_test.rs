use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use hiface::bus::mock::MockBus;
use hiface::{
    DriverConfig, DriverError, HostPcm, HwParams, PcmDevice, RateControl, RatePolicy,
    StreamDirection, StreamState, TransportError, TriggerCommand,
};

const N_URBS: usize = 8;
const PACKET: usize = 4096;
const WAIT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct RecordingHost {
    periods: AtomicUsize,
    xruns: AtomicUsize,
}

impl HostPcm for RecordingHost {
    fn period_elapsed(&self) {
        self.periods.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_xrun(&self) {
        self.xruns.fetch_add(1, Ordering::SeqCst);
    }
}

fn config() -> DriverConfig {
    DriverConfig::default()
        .with_start_timeout(Duration::from_secs(2))
        .with_drain_timeout(Duration::from_millis(5))
}

fn device(bus: &Arc<MockBus>, config: DriverConfig) -> (PcmDevice, Arc<RateControl>) {
    let control = Arc::new(RateControl::new(
        bus.clone(),
        config.rate_policy,
        config.control_timeout,
        false,
    ));
    let pcm = PcmDevice::new(bus.clone(), control.clone(), &config, false).unwrap();
    (pcm, control)
}

/// Run `prepare` while completing the first transfer, as the device would.
fn prepare_with_first_completion(pcm: &PcmDevice, bus: &MockBus) -> hiface::Result<()> {
    thread::scope(|scope| {
        let prepare = scope.spawn(|| pcm.prepare());
        if bus.wait_in_flight(N_URBS, WAIT) {
            bus.complete_next();
        }
        prepare.join().unwrap()
    })
}

fn complete_one(bus: &MockBus) {
    assert!(bus.complete_next());
    assert!(bus.wait_in_flight(N_URBS, WAIT));
}

#[test]
fn playback_at_96k_commits_rate_and_swaps_samples() {
    let bus = Arc::new(MockBus::new());
    let (pcm, control) = device(&bus, config());
    let host = Arc::new(RecordingHost::default());

    pcm.open(StreamDirection::Playback, host.clone()).unwrap();
    let params = HwParams::s32_stereo(96_000, 4096, 8);
    assert_eq!(params.buffer_bytes(), 32_768);
    let dma = pcm.hw_params(params).unwrap();
    let frames: Vec<u8> = (0u8..64).collect();
    dma.write(0, &frames);
    pcm.trigger(TriggerCommand::Start).unwrap();

    prepare_with_first_completion(&pcm, &bus).unwrap();
    assert_eq!(pcm.state(), StreamState::Running);
    assert_eq!(control.current().map(|rate| rate.index()), Some(3));
    let requests = bus.control_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].bm_request_type, 0x43);
    assert_eq!(requests[0].b_request, 0xb0);
    assert_eq!(requests[0].w_value, 0x4a);
    assert_eq!(bus.interface_selections(), vec![(0, 0)]);

    // Eight initial submissions plus the refill of the first completion.
    assert!(bus.wait_in_flight(N_URBS, WAIT));
    assert_eq!(bus.submissions(), N_URBS + 1);
    assert_eq!(pcm.pointer().unwrap(), PACKET / 8);

    for _ in 1..N_URBS {
        complete_one(&bus);
    }
    complete_one(&bus);
    let captured = bus.take_captured();
    assert_eq!(captured.len(), (N_URBS + 1) * PACKET);
    assert!(captured[..N_URBS * PACKET].iter().all(|&b| b == 0));

    let expected: [u8; 64] = [
        2, 3, 0, 1, 6, 7, 4, 5, 10, 11, 8, 9, 14, 15, 12, 13, //
        18, 19, 16, 17, 22, 23, 20, 21, 26, 27, 24, 25, 30, 31, 28, 29, //
        34, 35, 32, 33, 38, 39, 36, 37, 42, 43, 40, 41, 46, 47, 44, 45, //
        50, 51, 48, 49, 54, 55, 52, 53, 58, 59, 56, 57, 62, 63, 60, 61,
    ];
    let first = &captured[N_URBS * PACKET..];
    assert_eq!(&first[..64], &expected);
    assert!(first[64..].iter().all(|&b| b == 0));

    // Nine packets of 4096 bytes: one period per packet.
    assert_eq!(host.periods.load(Ordering::SeqCst), N_URBS + 1);
    assert_eq!(pcm.pointer().unwrap(), (9 * PACKET % 32_768) / 8);
}

#[test]
fn failing_submissions_leave_stream_disabled() {
    let bus = Arc::new(MockBus::new());
    let (pcm, _control) = device(&bus, config());
    pcm.open(StreamDirection::Playback, Arc::new(RecordingHost::default()))
        .unwrap();
    pcm.hw_params(HwParams::s32_stereo(44_100, 4096, 4)).unwrap();

    bus.fail_submissions(Some(TransportError::Stall));
    assert_eq!(
        pcm.prepare(),
        Err(DriverError::Transport(TransportError::Stall))
    );
    assert_eq!(pcm.state(), StreamState::Disabled);
    assert_eq!(pcm.status().in_flight, 0);
    assert_eq!(bus.in_flight(), 0);
}

#[test]
fn partial_submission_is_unwound() {
    let bus = Arc::new(MockBus::new());
    let (pcm, _control) = device(&bus, config());
    pcm.open(StreamDirection::Playback, Arc::new(RecordingHost::default()))
        .unwrap();
    pcm.hw_params(HwParams::s32_stereo(44_100, 4096, 4)).unwrap();

    bus.fail_submissions_after(5);
    assert!(matches!(
        pcm.prepare(),
        Err(DriverError::Transport(TransportError::Io(_)))
    ));
    assert_eq!(pcm.state(), StreamState::Disabled);
    assert_eq!(bus.cancellations(), 5);
    assert_eq!(bus.in_flight(), 0);
    assert_eq!(pcm.status().in_flight, 0);

    // The failed start leaves nothing behind; a later start succeeds.
    bus.fail_submissions(None);
    bus.fail_submissions_after(usize::MAX / 2);
    prepare_with_first_completion(&pcm, &bus).unwrap();
    assert_eq!(pcm.state(), StreamState::Running);
}

#[test]
fn silent_device_times_out_and_is_cancelled() {
    let bus = Arc::new(MockBus::new());
    let timeout = Duration::from_millis(50);
    let (pcm, _control) = device(&bus, config().with_start_timeout(timeout));
    pcm.open(StreamDirection::Playback, Arc::new(RecordingHost::default()))
        .unwrap();
    pcm.hw_params(HwParams::s32_stereo(48_000, 4096, 4)).unwrap();

    assert_eq!(pcm.prepare(), Err(DriverError::IoTimeout(timeout)));
    assert_eq!(pcm.state(), StreamState::Disabled);
    assert_eq!(bus.cancellations(), N_URBS);
    assert_eq!(bus.in_flight(), 0);
    assert_eq!(pcm.status().in_flight, 0);
}

#[test]
fn abort_during_completion_burst_stops_resubmission() {
    let bus = Arc::new(MockBus::new());
    let (pcm, _control) = device(&bus, config());
    let host = Arc::new(RecordingHost::default());
    pcm.open(StreamDirection::Playback, host.clone()).unwrap();
    pcm.hw_params(HwParams::s32_stereo(48_000, 4096, 4)).unwrap();
    pcm.trigger(TriggerCommand::Start).unwrap();
    prepare_with_first_completion(&pcm, &bus).unwrap();

    let done = AtomicBool::new(false);
    let submissions_after_abort = thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                if !bus.complete_next() {
                    thread::yield_now();
                }
            }
        });
        thread::sleep(Duration::from_millis(20));
        pcm.abort();
        let after = bus.submissions();
        thread::sleep(Duration::from_millis(20));
        done.store(true, Ordering::SeqCst);
        (after, bus.submissions())
    });

    assert_eq!(submissions_after_abort.0, submissions_after_abort.1);
    assert!(pcm.is_panicked());
    assert_eq!(pcm.state(), StreamState::Disabled);
    assert_eq!(pcm.status().in_flight, 0);
    assert_eq!(bus.in_flight(), 0);
    assert_eq!(host.xruns.load(Ordering::SeqCst), 1);
    assert!(!pcm.status().position.active);

    pcm.destroy();
    assert_eq!(pcm.status().in_flight, 0);
}

/// Host that parks inside `period_elapsed` once armed, until released.
struct ParkingHost {
    armed: AtomicBool,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl HostPcm for ParkingHost {
    fn period_elapsed(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.entered.send(());
            let _ = self.release.recv_timeout(WAIT);
        }
    }

    fn stop_xrun(&self) {}
}

#[test]
fn abort_while_completion_is_in_host_callback_submits_nothing_more() {
    let bus = Arc::new(MockBus::new());
    let (pcm, _control) = device(&bus, config());
    let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    let host = Arc::new(ParkingHost {
        armed: AtomicBool::new(false),
        entered: entered_tx,
        release: release_rx,
    });
    pcm.open(StreamDirection::Playback, host.clone()).unwrap();
    pcm.hw_params(HwParams::s32_stereo(48_000, 4096, 4)).unwrap();
    pcm.trigger(TriggerCommand::Start).unwrap();
    prepare_with_first_completion(&pcm, &bus).unwrap();
    assert!(bus.wait_in_flight(N_URBS, WAIT));

    host.armed.store(true, Ordering::SeqCst);
    assert!(bus.complete_next());
    entered_rx.recv_timeout(WAIT).unwrap();

    let (latched, after) = thread::scope(|scope| {
        let abort = scope.spawn(|| pcm.abort());
        while !pcm.is_panicked() {
            thread::yield_now();
        }
        let latched = bus.submissions();
        release_tx.send(()).unwrap();
        abort.join().unwrap();
        (latched, bus.submissions())
    });

    assert_eq!(latched, after);
    assert_eq!(pcm.state(), StreamState::Disabled);
    assert_eq!(pcm.status().in_flight, 0);
    assert_eq!(bus.in_flight(), 0);
}

#[test]
fn operations_after_abort_report_shutdown() {
    let bus = Arc::new(MockBus::new());
    let (pcm, _control) = device(&bus, config());
    pcm.open(StreamDirection::Playback, Arc::new(RecordingHost::default()))
        .unwrap();
    pcm.abort();

    assert_eq!(pcm.pointer(), Err(DriverError::DeviceShutdown));
    assert_eq!(pcm.prepare(), Err(DriverError::DeviceShutdown));
    assert_eq!(
        pcm.trigger(TriggerCommand::Start),
        Err(DriverError::DeviceShutdown)
    );
    assert!(matches!(
        pcm.open(StreamDirection::Playback, Arc::new(RecordingHost::default())),
        Err(DriverError::DeviceShutdown)
    ));
    assert_eq!(pcm.close(), Ok(()));
    assert_eq!(DriverError::DeviceShutdown.errno(), -32);
}

#[test]
fn close_forgets_rate_and_reopen_resends_it() {
    let bus = Arc::new(MockBus::new());
    let (pcm, control) = device(&bus, config());
    pcm.open(StreamDirection::Playback, Arc::new(RecordingHost::default()))
        .unwrap();
    pcm.hw_params(HwParams::s32_stereo(88_200, 4096, 4)).unwrap();
    prepare_with_first_completion(&pcm, &bus).unwrap();

    // Preparing a running stream only rewinds it.
    pcm.prepare().unwrap();
    assert_eq!(bus.control_requests().len(), 1);
    assert!(matches!(
        pcm.open(StreamDirection::Playback, Arc::new(RecordingHost::default())),
        Err(DriverError::Busy)
    ));

    pcm.close().unwrap();
    assert_eq!(pcm.state(), StreamState::Disabled);
    assert_eq!(control.current(), None);
    assert_eq!(bus.in_flight(), 0);

    let hw = pcm
        .open(StreamDirection::Playback, Arc::new(RecordingHost::default()))
        .unwrap();
    assert_eq!(hw.rates.len(), 6);
    pcm.hw_params(HwParams::s32_stereo(88_200, 4096, 4)).unwrap();
    prepare_with_first_completion(&pcm, &bus).unwrap();
    assert_eq!(bus.control_requests().len(), 2);
}

#[test]
fn open_is_pinned_to_the_committed_rate() {
    let bus = Arc::new(MockBus::new());
    let (pcm, control) = device(&bus, config().with_rate_policy(RatePolicy::AlwaysSend));
    control.set_rate_index(1).unwrap();
    let hw = pcm
        .open(StreamDirection::Playback, Arc::new(RecordingHost::default()))
        .unwrap();
    assert_eq!(hw.rates, vec![48_000]);
    assert!(matches!(
        pcm.hw_params(HwParams::s32_stereo(44_100, 4096, 4)),
        Err(DriverError::InvalidArgument(_))
    ));
}
