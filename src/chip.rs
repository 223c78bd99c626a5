//! Device registry: binds USB interfaces to chips and tears them down on
//! disconnect.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::bus::UsbBus;
use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::pcm::PcmDevice;
use crate::rate::RateControl;

/// Short card name reported to the host.
pub const CARD_SHORTNAME: &str = "M2Tech HIFACE";

/// Bus number and device number of an attached device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    /// Host controller bus number.
    pub bus: u8,
    /// Device number on that bus.
    pub device: u8,
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bus, self.device)
    }
}

/// Identity of an attached USB device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    /// idVendor.
    pub vendor: u16,
    /// idProduct.
    pub product: u16,
    /// Where the device sits on the bus.
    pub address: DeviceAddress,
}

/// One interface of a device, as offered to `probe`.
#[derive(Clone)]
pub struct UsbInterface {
    /// Owning device.
    pub device: UsbDeviceInfo,
    /// bInterfaceNumber.
    pub interface_number: u8,
    /// Bus handle for the device.
    pub bus: Arc<dyn UsbBus>,
}

/// Entry of the supported device table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceMatch {
    /// idVendor.
    pub vendor: u16,
    /// idProduct.
    pub product: u16,
    /// Whether the device accepts 352.8 kHz and 384 kHz.
    pub extra_freq: bool,
}

/// Devices served by this driver.
pub const DEVICE_TABLE: &[DeviceMatch] = &[
    DeviceMatch {
        vendor: 0x04b4,
        product: 0x930b,
        extra_freq: false,
    },
    DeviceMatch {
        vendor: 0x04b4,
        product: 0x0384,
        extra_freq: false,
    },
];

/// A served device: its rate control and PCM runtime.
pub struct Chip {
    index: usize,
    address: DeviceAddress,
    shortname: String,
    longname: String,
    intf_count: AtomicUsize,
    shutdown: AtomicBool,
    control: Arc<RateControl>,
    pcm: PcmDevice,
}

impl Chip {
    /// Registry slot.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Bus address of the device.
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Card short name.
    pub fn shortname(&self) -> &str {
        &self.shortname
    }

    /// Card long name, including the bus address.
    pub fn longname(&self) -> &str {
        &self.longname
    }

    /// Interfaces of the device currently bound to this chip.
    pub fn interface_count(&self) -> usize {
        self.intf_count.load(Ordering::Acquire)
    }

    /// Whether the device has been disconnected.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Rate controller of the device.
    pub fn control(&self) -> &Arc<RateControl> {
        &self.control
    }

    /// The playback runtime.
    pub fn pcm(&self) -> &PcmDevice {
        &self.pcm
    }

    /// Stop all streaming on the device.
    pub fn abort(&self) {
        self.pcm.abort();
    }

    fn destroy(&self) {
        self.pcm.destroy();
    }
}

struct Slot {
    address: DeviceAddress,
    chip: Option<Arc<Chip>>,
}

/// Fixed-size table of served devices, guarded by one lock.
pub struct ChipRegistry {
    config: DriverConfig,
    table: &'static [DeviceMatch],
    slots: Mutex<Vec<Option<Slot>>>,
}

impl ChipRegistry {
    /// Registry for [`DEVICE_TABLE`] with `config.max_devices` slots.
    pub fn new(config: DriverConfig) -> Self {
        Self::with_table(config, DEVICE_TABLE)
    }

    /// Registry serving a custom device table.
    pub fn with_table(config: DriverConfig, table: &'static [DeviceMatch]) -> Self {
        let slots = (0..config.max_devices).map(|_| None).collect();
        Self {
            config,
            table,
            slots: Mutex::new(slots),
        }
    }

    /// Bind an interface. A further interface of a device already served
    /// joins the existing chip.
    pub fn probe(&self, intf: &UsbInterface) -> Result<Arc<Chip>> {
        let info = intf.device;
        let quirk = self
            .table
            .iter()
            .find(|m| m.vendor == info.vendor && m.product == info.product)
            .copied()
            .ok_or(DriverError::UnsupportedDevice {
                vendor: info.vendor,
                product: info.product,
            })?;

        let index = {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.iter().flatten().find(|s| s.address == info.address) {
                return match &slot.chip {
                    Some(chip) => {
                        chip.intf_count.fetch_add(1, Ordering::AcqRel);
                        Ok(chip.clone())
                    }
                    None => Err(DriverError::Busy),
                };
            }
            let Some(index) = slots.iter().position(Option::is_none) else {
                warn!(address = %info.address, "too many devices registered");
                return Err(DriverError::TooManyDevices);
            };
            slots[index] = Some(Slot {
                address: info.address,
                chip: None,
            });
            index
        };

        info!(address = %info.address, interface = intf.interface_number, "probe");
        match self.create_chip(index, intf, quirk) {
            Ok(chip) => {
                if let Some(slot) = self.slots.lock()[index].as_mut() {
                    slot.chip = Some(chip.clone());
                }
                Ok(chip)
            }
            Err(err) => {
                warn!(address = %info.address, error = %err, "probe failed");
                self.slots.lock()[index] = None;
                Err(err)
            }
        }
    }

    fn create_chip(&self, index: usize, intf: &UsbInterface, quirk: DeviceMatch) -> Result<Arc<Chip>> {
        intf.bus.set_interface(0, 0)?;
        let control = Arc::new(RateControl::new(
            intf.bus.clone(),
            self.config.rate_policy,
            self.config.control_timeout,
            quirk.extra_freq,
        ));
        let pcm = PcmDevice::new(intf.bus.clone(), control.clone(), &self.config, quirk.extra_freq)?;
        let address = intf.device.address;
        Ok(Arc::new(Chip {
            index,
            address,
            shortname: CARD_SHORTNAME.to_string(),
            longname: format!("{CARD_SHORTNAME} at {address}"),
            intf_count: AtomicUsize::new(1),
            shutdown: AtomicBool::new(false),
            control,
            pcm,
        }))
    }

    /// Unbind one interface. When the last one goes the chip is removed,
    /// aborted and destroyed.
    pub fn disconnect(&self, address: DeviceAddress) -> Result<()> {
        let chip = {
            let mut slots = self.slots.lock();
            let index = slots
                .iter()
                .position(|s| s.as_ref().is_some_and(|s| s.address == address && s.chip.is_some()))
                .ok_or(DriverError::NoDevice)?;
            let Some(chip) = slots[index].as_ref().and_then(|s| s.chip.clone()) else {
                return Err(DriverError::NoDevice);
            };
            if chip.intf_count.fetch_sub(1, Ordering::AcqRel) > 1 {
                return Ok(());
            }
            slots[index] = None;
            chip
        };

        info!(address = %address, "disconnect");
        chip.shutdown.store(true, Ordering::Release);
        chip.abort();
        chip.destroy();
        Ok(())
    }

    /// Chip serving `address`, if any.
    pub fn lookup(&self, address: DeviceAddress) -> Option<Arc<Chip>> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|s| s.address == address)
            .and_then(|s| s.chip.clone())
    }

    /// Every chip currently served.
    pub fn chips(&self) -> Vec<Arc<Chip>> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .filter_map(|s| s.chip.clone())
            .collect()
    }

    /// Number of served devices.
    pub fn len(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }

    /// Whether no device is served.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
