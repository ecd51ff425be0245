//! Platform storage bring-up: register every controller the machine has and
//! enumerate the disks behind them.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::block::ahci::{AhciConfig, AhciController};
use crate::block::ide::{IdeConfig, IdeController};
use crate::block::{BlockDeviceRegistry, ControllerId, DeviceClass};
use crate::hal::{MmioMapper, PortIo, Timer};
use crate::pci::{self, class_code, PciConfigSpace};

/// Hardware access the storage engines need from the host firmware.
#[derive(Clone)]
pub struct Platform {
    pub pci: Arc<dyn PciConfigSpace>,
    pub mapper: Arc<dyn MmioMapper>,
    pub io: Arc<dyn PortIo>,
    pub timer: Arc<dyn Timer>,
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl Platform {
    /// Real port I/O, configuration mechanism #1 and identity-mapped MMIO.
    pub fn x86(timer: Arc<dyn Timer>) -> Self {
        let io: Arc<dyn PortIo> = Arc::new(crate::hal::X86PortIo);
        Self {
            pci: Arc::new(pci::ConfigMechanism1::new(io.clone())),
            mapper: Arc::new(crate::hal::IdentityMapper),
            io,
            timer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageConfig {
    pub ahci: AhciConfig,
    pub ide: IdeConfig,
    /// Register the legacy IDE channels next to the AHCI controllers
    pub legacy_ide: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { ahci: AhciConfig::default(), ide: IdeConfig::default(), legacy_ide: true }
    }
}

/// Registers one AHCI controller per PCI function of class 0x0106, then the
/// legacy IDE controller. All of them are fixed-class controllers.
pub fn register_controllers(
    registry: &mut BlockDeviceRegistry,
    platform: &Platform,
    config: &StorageConfig,
) -> Vec<ControllerId> {
    let mut ids = Vec::new();

    for dev in pci::find_class(&*platform.pci, class_code::SATA_AHCI) {
        log::info!("[storage] AHCI controller at {}", dev);
        let ctrl = AhciController::new(
            platform.pci.clone(),
            dev,
            platform.mapper.clone(),
            platform.timer.clone(),
            config.ahci,
        );
        ids.push(registry.register_controller(DeviceClass::Fixed, Box::new(ctrl)));
    }

    if config.legacy_ide {
        let ctrl = IdeController::new(
            platform.io.clone(),
            platform.timer.clone(),
            Some(platform.pci.clone()),
            config.ide,
        );
        ids.push(registry.register_controller(DeviceClass::Fixed, Box::new(ctrl)));
    }

    ids
}

/// Registers the platform's controllers and enumerates both device classes.
///
/// Returns the number of devices known afterwards.
pub fn enumerate_disks(registry: &mut BlockDeviceRegistry, platform: &Platform, config: &StorageConfig) -> usize {
    register_controllers(registry, platform, config);

    let fixed = registry.enumerate(DeviceClass::Fixed).len();
    let removable = registry.enumerate(DeviceClass::Removable).len();
    log::info!("[storage] {} fixed and {} removable block devices", fixed, removable);

    fixed + removable
}
