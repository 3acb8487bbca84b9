//! Probe / remove lifecycle on the simulated bus
//!
//! Every acquisition step is forced to fail in turn, and the bus's own
//! accounting (enable state, reservations, live mappings) proves that
//! nothing leaks.

use pci_char::model::{BarIndex, BarMask, DeviceIds, PciAddress};
use pci_char::{
    Controller, DeviceState, EndpointId, EndpointRegistry, NullPublisher, PciCharError,
    SeekMode, SimBar, SimBus, SimDevice, SimFaults,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn addr() -> PciAddress {
    PciAddress::new(1, 0, 1).unwrap()
}

/// Route rollback logs to the test harness (`--nocapture` shows them)
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pci_char=debug")
        .with_test_writer()
        .try_init();
}

fn controller_with(device: SimDevice) -> Controller<SimBus> {
    init_logging();
    let bus = SimBus::new();
    bus.add(device);
    let registry = EndpointRegistry::new(Box::new(NullPublisher), 240, 8);
    Controller::new(Arc::new(bus), Arc::new(registry))
}

/// A device with a 4 KiB memory BAR in every slot
fn six_bar_device() -> SimDevice {
    (0..6).fold(
        SimDevice::new(addr(), DeviceIds::new(0x10ee, 0x7014)),
        |dev, n| dev.with_bar(n, SimBar::Memory(4096)),
    )
}

fn assert_released(ctl: &Controller<SimBus>) {
    let bus = ctl.bus();
    assert_eq!(ctl.state(addr()), DeviceState::Unbound);
    assert_eq!(bus.live_mappings(addr()), 0, "leaked mappings");
    assert!(bus.reserved(addr()).is_empty(), "leaked reservations");
    assert!(!bus.is_enabled(addr()), "device left enabled");
    assert!(ctl.registry().endpoints().is_empty(), "leaked endpoints");
    assert_eq!(ctl.registry().ranges_in_use(), 0, "leaked identity range");
}

#[test]
fn test_mapping_failure_at_each_slot_rolls_back() {
    for failing in 1..6u8 {
        let ctl = controller_with(six_bar_device());
        ctl.bus().set_faults(
            addr(),
            SimFaults {
                fail_map: BarIndex::new(failing),
                ..SimFaults::default()
            },
        );

        let err = ctl.probe(addr()).unwrap_err();
        assert!(matches!(err, PciCharError::Mapping { .. }), "slot {failing}: {err}");
        assert!(ctl.lengths(addr()).is_none());
        assert_released(&ctl);
    }
}

#[test]
fn test_enable_failure_rolls_back() {
    let ctl = controller_with(six_bar_device());
    ctl.bus().set_faults(
        addr(),
        SimFaults {
            fail_enable: true,
            ..SimFaults::default()
        },
    );
    assert!(matches!(ctl.probe(addr()), Err(PciCharError::DeviceEnable { .. })));
    assert_released(&ctl);
}

#[test]
fn test_region_conflict_rolls_back() {
    let ctl = controller_with(six_bar_device());
    ctl.bus()
        .claim_foreign(addr(), BarMask::EMPTY.with(BarIndex::new(5).unwrap()));
    assert!(matches!(ctl.probe(addr()), Err(PciCharError::RegionConflict { .. })));
    assert_released(&ctl);
}

#[test]
fn test_kernel_driver_blocks_probe() {
    let ctl = controller_with(six_bar_device().with_kernel_driver("xdma"));
    assert!(matches!(ctl.probe(addr()), Err(PciCharError::RegionConflict { .. })));
    assert_released(&ctl);
}

#[test]
fn test_identity_exhaustion_rolls_back_mapping() {
    let bus = SimBus::new();
    bus.add(six_bar_device());
    let registry = EndpointRegistry::new(Box::new(NullPublisher), 240, 0);
    let ctl = Controller::new(Arc::new(bus), Arc::new(registry));

    assert!(matches!(
        ctl.probe(addr()),
        Err(PciCharError::IdentityRangeExhausted { capacity: 0 })
    ));
    assert_released(&ctl);
}

#[test]
fn test_remove_with_zero_to_six_regions() {
    for mapped in 0..=6u8 {
        let device = (0..mapped).fold(
            SimDevice::new(addr(), DeviceIds::new(0x10ee, 0x7014)),
            |dev, n| dev.with_bar(n, SimBar::Memory(256)),
        );
        let ctl = controller_with(device);

        ctl.probe(addr()).unwrap();
        assert_eq!(ctl.state(addr()), DeviceState::Active);
        assert_eq!(ctl.registry().endpoints().len(), usize::from(mapped));

        ctl.remove(addr()).unwrap();
        assert_released(&ctl);
    }
}

#[test]
fn test_probe_remove_cycles_reuse_identity() {
    let ctl = controller_with(six_bar_device());
    for _ in 0..3 {
        let range = ctl.probe(addr()).unwrap();
        assert_eq!(range.major(), 240);
        ctl.remove(addr()).unwrap();
    }
    assert_released(&ctl);
}

#[test]
fn test_open_session_goes_stale_on_remove() {
    let ctl = controller_with(six_bar_device());
    let range = ctl.probe(addr()).unwrap();
    let mut session = ctl.registry().open(EndpointId::new(range.major(), 2)).unwrap();
    session.write(&7u32.to_ne_bytes()).unwrap();

    ctl.remove(addr()).unwrap();

    session.seek(SeekMode::Absolute(0)).unwrap();
    assert!(session.read(4).unwrap_err().is_stale());
    assert!(session.write(&[0; 4]).unwrap_err().is_stale());
    assert!(matches!(
        ctl.registry().open(session.id()),
        Err(PciCharError::NoSuchEndpoint { .. })
    ));

    // A new claim of the same device does not revive the old session.
    ctl.probe(addr()).unwrap();
    assert!(session.read(4).unwrap_err().is_stale());
    ctl.shutdown();
}

#[test]
fn test_remove_races_in_flight_transfers() {
    let ctl = Arc::new(controller_with(six_bar_device()));
    let range = ctl.probe(addr()).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let completed = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4u8)
        .map(|n| {
            let ctl = Arc::clone(&ctl);
            let stop = Arc::clone(&stop);
            let completed = Arc::clone(&completed);
            thread::spawn(move || {
                let Ok(mut session) = ctl.registry().open(EndpointId::new(range.major(), n)) else {
                    return;
                };
                while !stop.load(Ordering::Relaxed) {
                    session.seek(SeekMode::Absolute(0)).unwrap();
                    match session.read(4096) {
                        Ok(bytes) => {
                            assert_eq!(bytes.len(), 4096);
                            completed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            assert!(e.is_stale(), "unexpected error: {e}");
                            return;
                        }
                    }
                }
            })
        })
        .collect();

    while completed.load(Ordering::Relaxed) < 8 {
        thread::yield_now();
    }
    ctl.remove(addr()).unwrap();
    stop.store(true, Ordering::Relaxed);

    for worker in workers {
        worker.join().unwrap();
    }
    assert_released(&ctl);
}

#[test]
fn test_concurrent_probes_claim_once() {
    let ctl = Arc::new(controller_with(six_bar_device()));
    let results: Vec<_> = (0..8)
        .map(|_| {
            let ctl = Arc::clone(&ctl);
            thread::spawn(move || ctl.probe(addr()))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, PciCharError::AlreadyBound { .. })));
    assert_eq!(ctl.bus().live_mappings(addr()), 6);
    ctl.shutdown();
    assert_released(&ctl);
}
