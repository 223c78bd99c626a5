use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::bus::clocked::ClockedBus;
use crate::bus::mock::MockBus;
use crate::chip::{ChipRegistry, DeviceAddress, UsbDeviceInfo, UsbInterface};
use crate::config::DriverConfig;
use crate::control::tone::ToneSource;
use crate::dma::{DmaArea, swap_word};
use crate::error::DriverError;
use crate::host::{StreamDirection, TriggerCommand};
use crate::pcm::{HwParams, StreamState};
use crate::urb::{PCM_N_URBS, PCM_PACKET_SIZE};

const ADDRESS: DeviceAddress = DeviceAddress { bus: 3, device: 9 };

fn interface(bus: Arc<dyn crate::bus::UsbBus>) -> UsbInterface {
    UsbInterface {
        device: UsbDeviceInfo {
            vendor: 0x04b4,
            product: 0x930b,
            address: ADDRESS,
        },
        interface_number: 0,
        bus,
    }
}

fn unswap(packet: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; packet.len()];
    for (dest, src) in out.chunks_exact_mut(4).zip(packet.chunks_exact(4)) {
        swap_word(dest, src);
    }
    out
}

#[test]
fn tone_reaches_the_wire_in_order_and_swapped() {
    let bus = Arc::new(MockBus::new());
    let config = DriverConfig::default()
        .with_start_timeout(Duration::from_secs(2))
        .with_drain_timeout(Duration::from_millis(5));
    let registry = ChipRegistry::new(config);
    let chip = registry.probe(&interface(bus.clone())).unwrap();
    let pcm = chip.pcm();

    let tone = Arc::new(ToneSource::new(997.0, 0.8));
    pcm.open(StreamDirection::Playback, tone.clone()).unwrap();
    let params = HwParams::s32_stereo(48_000, PCM_PACKET_SIZE, 4);
    let dma = pcm.hw_params(params).unwrap();
    tone.attach(dma, &params);
    pcm.trigger(TriggerCommand::Start).unwrap();

    thread::scope(|scope| {
        let prepare = scope.spawn(|| pcm.prepare());
        assert!(bus.wait_in_flight(PCM_N_URBS, Duration::from_secs(1)));
        assert!(bus.complete_next());
        prepare.join().unwrap().unwrap();
    });
    assert_eq!(pcm.state(), StreamState::Running);

    let wanted_packets = 12;
    let wanted = (PCM_N_URBS + wanted_packets) * PCM_PACKET_SIZE;
    let mut captured = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while captured.len() < wanted && Instant::now() < deadline {
        if !bus.complete_next() {
            thread::sleep(Duration::from_millis(1));
        }
        captured.extend(bus.take_captured());
    }
    assert!(captured.len() >= wanted, "only {} bytes captured", captured.len());

    // The first wave is the zero-filled initial submission.
    let (initial, streamed) = captured.split_at(PCM_N_URBS * PCM_PACKET_SIZE);
    assert!(initial.iter().all(|&b| b == 0));

    let reference = Arc::new(DmaArea::new_local(wanted_packets * PCM_PACKET_SIZE));
    ToneSource::new(997.0, 0.8).attach(reference.clone(), &params);
    let expected = reference.to_vec();
    let played = unswap(&streamed[..expected.len()]);
    assert_eq!(played, expected);

    let status = pcm.status();
    assert!(status.periods >= wanted_packets as u64 - 1);
    assert_eq!(status.rate_hz, Some(48_000));

    registry.disconnect(ADDRESS).unwrap();
    assert!(chip.is_shutdown());
    assert_eq!(tone.xruns(), 1);
    assert_eq!(pcm.pointer(), Err(DriverError::DeviceShutdown));
    assert_eq!(pcm.status().in_flight, 0);
    assert_eq!(bus.in_flight(), 0);
}

#[test]
fn clocked_device_plays_the_tone_in_real_time() {
    let bus = Arc::new(ClockedBus::new(44_100).unwrap());
    let registry = ChipRegistry::new(DriverConfig::default());
    let chip = registry.probe(&interface(bus.clone())).unwrap();
    let pcm = chip.pcm();

    let tone = Arc::new(ToneSource::new(1_000.0, 0.5));
    pcm.open(StreamDirection::Playback, tone.clone()).unwrap();
    let params = HwParams::s32_stereo(192_000, 8192, 4);
    let dma = pcm.hw_params(params).unwrap();
    tone.attach(dma, &params);
    pcm.trigger(TriggerCommand::Start).unwrap();
    pcm.prepare().unwrap();
    assert_eq!(bus.rate_hz(), 192_000);

    let deadline = Instant::now() + Duration::from_secs(5);
    while bus.packets() < 48 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(bus.packets() >= 48);
    assert!((bus.peak_level() - 0.5).abs() < 0.02, "peak {}", bus.peak_level());
    assert!(tone.periods() > 0);
    assert!(pcm.pointer().unwrap() < params.buffer_bytes() / params.frame_bytes());

    pcm.trigger(TriggerCommand::Stop).unwrap();
    pcm.close().unwrap();
    assert_eq!(pcm.state(), StreamState::Disabled);
    assert_eq!(chip.control().current(), None);
    assert_eq!(pcm.status().in_flight, 0);
}
