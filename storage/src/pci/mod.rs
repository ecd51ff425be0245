//! # PCI Configuration Access
//!
//! Just enough PCI for storage discovery: configuration space reads and
//! writes, BAR decoding, class-code search across every bus, and the ATA
//! controller walk used by the legacy IDE engine.
//!
//! ## Features
//!
//! - [`PciConfigSpace`] seam with sub-dword accessors built on 32-bit access
//! - Configuration mechanism #1 over any [`PortIo`]
//! - Bridge-following ATA controller search

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::hal::PortIo;

/// PCI configuration space I/O port (address).
const PCI_CONFIG_ADDRESS: u16 = 0xCF8;
/// PCI configuration space I/O port (data).
const PCI_CONFIG_DATA: u16 = 0xCFC;

/// Maximum devices per bus.
const MAX_DEVICE: u8 = 32;
/// Maximum functions per device.
const MAX_FUNCTION: u8 = 8;

/// Combined class/subclass words (config offset 0x0A) used by the storage engines.
pub mod class_code {
    /// Legacy IDE controller.
    pub const IDE: u16 = 0x0101;
    /// AHCI SATA controller.
    pub const SATA_AHCI: u16 = 0x0106;
    /// "Other" mass storage, how SATA parts in legacy mode tend to report.
    pub const STORAGE_OTHER: u16 = 0x0180;
}

/// PCI configuration space registers.
pub mod reg {
    pub const VENDOR_ID: u8 = 0x00;
    pub const DEVICE_ID: u8 = 0x02;
    pub const COMMAND: u8 = 0x04;
    pub const PROG_IF: u8 = 0x09;
    pub const SUBCLASS: u8 = 0x0A;
    pub const HEADER_TYPE: u8 = 0x0E;
    pub const BAR0: u8 = 0x10;
    /// Secondary bus number (type 1 header).
    pub const SECONDARY_BUS: u8 = 0x19;
}

/// PCI command register bits.
pub mod cmd {
    pub const BUS_MASTER: u16 = 1 << 2;
}

/// PCI address (bus, device, function).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// Creates a new PCI address.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self { bus, device, function }
    }

    /// Converts to configuration address format.
    fn to_config_address(self, offset: u8) -> u32 {
        (1u32 << 31)
            | ((self.bus as u32) << 16)
            | ((self.device as u32) << 11)
            | ((self.function as u32) << 8)
            | ((offset as u32) & 0xFC)
    }
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Access to PCI configuration space.
///
/// Only the dword accessors are required; narrower accesses are derived with
/// read-modify-write on the containing dword.
pub trait PciConfigSpace: Send + Sync {
    /// Reads the dword at `offset & !3`. Absent functions read all ones.
    fn read32(&self, addr: PciAddress, offset: u8) -> u32;
    fn write32(&self, addr: PciAddress, offset: u8, value: u32);

    fn read16(&self, addr: PciAddress, offset: u8) -> u16 {
        let value = self.read32(addr, offset & 0xFC);
        ((value >> ((offset & 2) * 8)) & 0xFFFF) as u16
    }

    fn read8(&self, addr: PciAddress, offset: u8) -> u8 {
        let value = self.read32(addr, offset & 0xFC);
        ((value >> ((offset & 3) * 8)) & 0xFF) as u8
    }

    fn write16(&self, addr: PciAddress, offset: u8, value: u16) {
        let aligned = offset & 0xFC;
        let shift = (offset & 2) * 8;
        let mut dword = self.read32(addr, aligned);
        dword &= !(0xFFFF << shift);
        dword |= (value as u32) << shift;
        self.write32(addr, aligned, dword);
    }

    fn write8(&self, addr: PciAddress, offset: u8, value: u8) {
        let aligned = offset & 0xFC;
        let shift = (offset & 3) * 8;
        let mut dword = self.read32(addr, aligned);
        dword &= !(0xFF << shift);
        dword |= (value as u32) << shift;
        self.write32(addr, aligned, dword);
    }
}

/// Configuration mechanism #1 (ports 0xCF8/0xCFC).
pub struct ConfigMechanism1 {
    io: Arc<dyn PortIo>,
}

impl ConfigMechanism1 {
    pub fn new(io: Arc<dyn PortIo>) -> Self {
        Self { io }
    }
}

impl PciConfigSpace for ConfigMechanism1 {
    fn read32(&self, addr: PciAddress, offset: u8) -> u32 {
        self.io.outl(PCI_CONFIG_ADDRESS, addr.to_config_address(offset));
        self.io.inl(PCI_CONFIG_DATA)
    }

    fn write32(&self, addr: PciAddress, offset: u8, value: u32) {
        self.io.outl(PCI_CONFIG_ADDRESS, addr.to_config_address(offset));
        self.io.outl(PCI_CONFIG_DATA, value);
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Returns the class/subclass word of `addr`.
pub fn class_of(cfg: &dyn PciConfigSpace, addr: PciAddress) -> u16 {
    cfg.read16(addr, reg::SUBCLASS)
}

/// Returns the base address held in BAR `index` with the flag bits stripped.
///
/// I/O BARs are masked with `!3`, memory BARs with `!0xF`; a 64-bit memory
/// BAR contributes the following register as the high half.
pub fn read_bar(cfg: &dyn PciConfigSpace, addr: PciAddress, index: u8) -> u64 {
    let offset = reg::BAR0 + index * 4;
    let low = cfg.read32(addr, offset);

    if low & 1 != 0 {
        return (low & !0x3) as u64;
    }

    let is_64bit = (low >> 1) & 3 == 2;
    let base = (low & !0xF) as u64;
    if is_64bit && index < 5 {
        let high = cfg.read32(addr, offset + 4) as u64;
        (high << 32) | base
    } else {
        base
    }
}

/// Sets the bus master bit in the command register.
pub fn enable_bus_master(cfg: &dyn PciConfigSpace, addr: PciAddress) {
    let command = cfg.read16(addr, reg::COMMAND);
    cfg.write16(addr, reg::COMMAND, command | cmd::BUS_MASTER);
}

fn is_absent(id: u32) -> bool {
    matches!(id, 0xFFFF_FFFF | 0 | 0xFFFF_0000 | 0x0000_FFFF)
}

fn is_multifunction(cfg: &dyn PciConfigSpace, addr: PciAddress) -> bool {
    cfg.read8(addr, reg::HEADER_TYPE) & 0x80 != 0
}

/// Brute-force scan of every bus for functions with class/subclass `class`.
pub fn find_class(cfg: &dyn PciConfigSpace, class: u16) -> Vec<PciAddress> {
    let mut found = Vec::new();

    for bus in 0..=255u8 {
        for device in 0..MAX_DEVICE {
            for function in 0..MAX_FUNCTION {
                let addr = PciAddress::new(bus, device, function);
                let id = cfg.read32(addr, reg::VENDOR_ID);
                if is_absent(id) {
                    if function == 0 {
                        break;
                    }
                    continue;
                }
                if class_of(cfg, addr) == class {
                    found.push(addr);
                }
                if function == 0 && !is_multifunction(cfg, addr) {
                    break;
                }
            }
        }
    }

    found
}

/// PCI-to-PCI bridges the ATA walk must not descend into.
const SKIPPED_BRIDGES: [u32; 2] = [0xAC8F_104C, 0x803B_104C];

/// Finds the `index`-th ATA controller, descending through PCI bridges.
///
/// `sata` matches class 0x0180 (SATA parts in legacy mode), `pata` matches
/// class 0x0101. `index` is decremented for every match that is skipped, so
/// on failure it holds how many matches are still owed.
pub fn find_ata_device(
    cfg: &dyn PciConfigSpace,
    index: &mut usize,
    sata: bool,
    pata: bool,
) -> Option<PciAddress> {
    find_ata_device_on_bus(cfg, 0, index, sata, pata, 0)
}

fn find_ata_device_on_bus(
    cfg: &dyn PciConfigSpace,
    bus: u8,
    index: &mut usize,
    sata: bool,
    pata: bool,
    depth: usize,
) -> Option<PciAddress> {
    if depth > 32 {
        return None;
    }

    for device in 0..MAX_DEVICE {
        for function in 0..MAX_FUNCTION {
            let addr = PciAddress::new(bus, device, function);
            let id = cfg.read32(addr, reg::VENDOR_ID);
            if is_absent(id) {
                if function == 0 {
                    break;
                }
                continue;
            }

            let class = class_of(cfg, addr);
            if (sata && class == class_code::STORAGE_OTHER) || (pata && class == class_code::IDE) {
                if *index == 0 {
                    return Some(addr);
                }
                *index -= 1;
            }

            let header = cfg.read8(addr, reg::HEADER_TYPE) & 0x7F;
            if header == 1 && !SKIPPED_BRIDGES.contains(&id) {
                let secondary = cfg.read8(addr, reg::SECONDARY_BUS);
                if secondary > bus {
                    log::debug!("[pci] Following bridge {} to bus {:02x}", addr, secondary);
                    if let Some(found) =
                        find_ata_device_on_bus(cfg, secondary, index, sata, pata, depth + 1)
                    {
                        return Some(found);
                    }
                }
            }

            if function == 0 && !is_multifunction(cfg, addr) {
                break;
            }
        }
    }

    None
}
