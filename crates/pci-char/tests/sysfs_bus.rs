//! Sysfs bus against a fake `/sys/bus/pci/devices` tree
//!
//! The tree is made of ordinary files, so enumeration, `enable` handling,
//! `flock` reservations, and `mmap` of `resourceN` all run for real.

use pci_char::model::PciAddress;
use pci_char::{
    DriverConfig, EndpointId, PciBus, PciCharDriver, PciCharError, SeekMode, SysfsBus,
};
use rustix::fs::{flock, FlockOperation};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const FPGA: &str = "0000:01:00.1";
const NIC: &str = "0000:02:00.0";

/// BAR0 memory 4 KiB, BAR1 I/O, BAR3 memory 256 bytes
const FPGA_RESOURCE: &str = "\
0x00000000f7000000 0x00000000f7000fff 0x0000000000040200
0x000000000000e000 0x000000000000e07f 0x0000000000040101
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x00000000f6000000 0x00000000f60000ff 0x0000000000040200
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x0000000000000000 0x0000000000000000 0x0000000000000000
0x0000000000000000 0x0000000000000000 0x0000000000000000
";

struct FakeSysfs {
    dir: TempDir,
}

impl FakeSysfs {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let fake = Self { dir };

        let fpga = fake.device(FPGA, "0x10ee", "0x7014", "0x058000");
        std::fs::write(fpga.join("resource"), FPGA_RESOURCE).unwrap();
        sized(&fpga.join("resource0"), 4096);
        sized(&fpga.join("resource1"), 128);
        sized(&fpga.join("resource3"), 256);

        let nic = fake.device(NIC, "0x8086", "0x1533", "0x020000");
        std::fs::write(
            nic.join("resource"),
            "0x00000000f7200000 0x00000000f721ffff 0x0000000000040200\n",
        )
        .unwrap();
        sized(&nic.join("resource0"), 0x2_0000);
        std::os::unix::fs::symlink("../../../bus/pci/drivers/igb", nic.join("driver")).unwrap();

        // Not a function directory
        std::fs::create_dir(fake.root().join("power")).unwrap();
        fake
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn device(&self, name: &str, vendor: &str, device: &str, class: &str) -> PathBuf {
        let dir = self.root().join(name);
        std::fs::create_dir(&dir).unwrap();
        for (attr, value) in [
            ("vendor", vendor),
            ("device", device),
            ("subsystem_vendor", "0x0000"),
            ("subsystem_device", "0x0000"),
            ("class", class),
            ("enable", "0"),
        ] {
            std::fs::write(dir.join(attr), format!("{value}\n")).unwrap();
        }
        dir
    }

    fn enable_state(&self, name: &str) -> String {
        std::fs::read_to_string(self.root().join(name).join("enable"))
            .unwrap()
            .trim()
            .to_string()
    }

    fn open(&self, name: &str, attr: &str) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.root().join(name).join(attr))
            .unwrap()
    }

    fn bus(&self) -> Arc<SysfsBus> {
        Arc::new(SysfsBus::new(self.root()))
    }
}

fn sized(path: &Path, len: u64) {
    File::create(path).unwrap().set_len(len).unwrap();
}

fn fpga() -> PciAddress {
    FPGA.parse().unwrap()
}

fn fpga_config() -> DriverConfig {
    DriverConfig {
        ids: "10ee:7014".to_string(),
        ..DriverConfig::default()
    }
}

#[test]
fn test_enumerates_functions() {
    let fake = FakeSysfs::new();
    let devices = fake.bus().devices().unwrap();

    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].address, fpga());
    assert_eq!(devices[0].ids.vendor, 0x10ee);
    assert_eq!(devices[0].ids.class, 0x05_8000);
    assert_eq!(devices[0].kernel_driver, None);
    assert_eq!(devices[1].kernel_driver.as_deref(), Some("igb"));
}

#[test]
fn test_claim_write_read_release() {
    let fake = FakeSysfs::new();
    let driver = PciCharDriver::init(fake.bus(), &fpga_config()).unwrap();
    assert_eq!(driver.controller().active_devices(), vec![fpga()]);
    assert_eq!(fake.enable_state(FPGA), "1");

    let mut bar0 = driver.open_path("pci-char/01:00.01/bar0").unwrap();
    assert_eq!(bar0.len(), 4096);
    bar0.seek(SeekMode::Absolute(0x10)).unwrap();
    bar0.write(&0xCAFE_BABEu32.to_ne_bytes()).unwrap();
    bar0.seek(SeekMode::Absolute(0x10)).unwrap();
    assert_eq!(&bar0.read(4).unwrap()[..], &0xCAFE_BABEu32.to_ne_bytes());

    // The store went through the shared mapping into the file.
    let contents = std::fs::read(fake.root().join(FPGA).join("resource0")).unwrap();
    assert_eq!(&contents[0x10..0x14], &0xCAFE_BABEu32.to_ne_bytes());

    // BAR1 is I/O space.
    let major = driver.controller().range(fpga()).unwrap().major();
    assert!(matches!(
        driver.open(EndpointId::new(major, 1)),
        Err(PciCharError::RegionNotMapped { .. })
    ));

    driver.unbind(fpga()).unwrap();
    assert_eq!(fake.enable_state(FPGA), "0");
    assert!(bar0.read(4).unwrap_err().is_stale());

    // Reservation locks are gone.
    flock(fake.open(FPGA, "resource0"), FlockOperation::NonBlockingLockExclusive).unwrap();
}

#[test]
fn test_already_enabled_device_stays_enabled() {
    let fake = FakeSysfs::new();
    std::fs::write(fake.root().join(FPGA).join("enable"), "1\n").unwrap();

    let driver = PciCharDriver::init(fake.bus(), &fpga_config()).unwrap();
    driver.unbind(fpga()).unwrap();
    assert_eq!(fake.enable_state(FPGA), "1");
}

#[test]
fn test_locked_region_is_conflict() {
    let fake = FakeSysfs::new();
    let holder = fake.open(FPGA, "resource3");
    flock(&holder, FlockOperation::NonBlockingLockExclusive).unwrap();

    let driver = PciCharDriver::init(fake.bus(), &DriverConfig::default()).unwrap();
    assert!(matches!(driver.bind(fpga()), Err(PciCharError::RegionConflict { .. })));
    assert_eq!(fake.enable_state(FPGA), "0");

    // BAR0 was locked first and must have been released again.
    flock(fake.open(FPGA, "resource0"), FlockOperation::NonBlockingLockExclusive).unwrap();
}

#[test]
fn test_second_process_cannot_claim() {
    let fake = FakeSysfs::new();
    let first = PciCharDriver::init(fake.bus(), &fpga_config()).unwrap();
    let second = PciCharDriver::init(fake.bus(), &DriverConfig::default()).unwrap();

    assert!(matches!(second.bind(fpga()), Err(PciCharError::RegionConflict { .. })));
    assert_eq!(first.controller().active_devices(), vec![fpga()]);
}

#[test]
fn test_kernel_driver_owner_is_skipped() {
    let fake = FakeSysfs::new();
    let config = DriverConfig {
        ids: "8086:1533".to_string(),
        ..DriverConfig::default()
    };
    let driver = PciCharDriver::init(fake.bus(), &config).unwrap();
    assert!(driver.controller().active_devices().is_empty());

    let nic: PciAddress = NIC.parse().unwrap();
    assert!(matches!(driver.bind(nic), Err(PciCharError::RegionConflict { .. })));
    assert_eq!(fake.enable_state(NIC), "0");
}

#[test]
fn test_short_resource_file_is_mapping_error() {
    let fake = FakeSysfs::new();
    sized(&fake.root().join(FPGA).join("resource3"), 16);

    let driver = PciCharDriver::init(fake.bus(), &DriverConfig::default()).unwrap();
    assert!(matches!(driver.bind(fpga()), Err(PciCharError::Mapping { .. })));
    assert_eq!(fake.enable_state(FPGA), "0");
    assert!(driver.registry().endpoints().is_empty());
}

#[test]
fn test_nodes_published_under_directory() {
    let fake = FakeSysfs::new();
    let nodes = tempfile::tempdir().unwrap();
    let config = DriverConfig {
        node_root: Some(nodes.path().to_path_buf()),
        ..fpga_config()
    };

    let driver = PciCharDriver::init(fake.bus(), &config).unwrap();
    let node = nodes.path().join("pci-char/01:00.01/bar3");
    assert_eq!(std::fs::read_to_string(&node).unwrap(), "240:3\n");
    assert!(!nodes.path().join("pci-char/01:00.01/bar1").exists());

    driver.shutdown();
    assert!(!node.exists());
}

#[test]
#[ignore] // Requires root and a real device bound to no driver
fn test_real_device_from_env() {
    let config = DriverConfig::from_env().unwrap();
    let driver =
        PciCharDriver::init(Arc::new(SysfsBus::new(&config.sysfs_root)), &config).unwrap();
    for ep in driver.registry().endpoints() {
        let mut session = driver.open(ep.id).unwrap();
        let first = session.read(4).unwrap();
        println!("{} ({:#x} bytes): {:02x?}", ep.path, ep.length, &first[..]);
    }
}
