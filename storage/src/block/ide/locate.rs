//! Where a channel's registers live.
//!
//! Channels are numbered the way drives are: channel `n` holds drives
//! `2n` and `2n + 1`. A PCI controller contributes two channels (primary
//! and secondary); each runs either in compatibility mode at the fixed ISA
//! ports or in native mode at the ports its BARs name.

use super::{IdeConfig, MAX_CHANNELS};
use crate::pci::{self, class_code, reg as pci_reg, PciAddress, PciConfigSpace};

/// Command block and control block base of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPorts {
    /// Data register; the other task file registers follow it
    pub command: u16,
    /// Device control (write) / alternate status (read)
    pub control: u16,
}

impl ChannelPorts {
    pub const fn new(command: u16, control: u16) -> Self {
        Self { command, control }
    }
}

/// Fixed ISA port bases of the four compatibility channels.
pub const LEGACY_PORTS: [ChannelPorts; MAX_CHANNELS] = [
    ChannelPorts::new(0x1F0, 0x3F6),
    ChannelPorts::new(0x170, 0x376),
    ChannelPorts::new(0x1E8, 0x3EE),
    ChannelPorts::new(0x168, 0x36E),
];

/// PCMCIA CompactFlash slot, replaces the third channel when configured.
pub const PCMCIA_CF_PORTS: ChannelPorts = ChannelPorts::new(0x1E0, 0x1EC);

/// Programming interface: primary channel in native mode
const PROG_IF_PRIMARY_NATIVE: u8 = 0x01;
/// Programming interface: secondary channel in native mode
const PROG_IF_SECONDARY_NATIVE: u8 = 0x04;

/// Resolves the ports of channel `index`, or `None` if there is no such channel.
///
/// `pci` is only consulted when PCI discovery is enabled in `config`.
pub fn channel_ports(index: usize, config: &IdeConfig, pci: Option<&dyn PciConfigSpace>) -> Option<ChannelPorts> {
    match pci {
        Some(cfg) if config.pci_discovery => pci_ports(cfg, index, config),
        _ => compat_ports(None, index, config),
    }
}

/// Ports of a channel in compatibility mode.
///
/// With PCI available, channels of controllers running in native mode come
/// first in the drive numbering, so they are subtracted from `index` before
/// picking a legacy port pair.
fn compat_ports(pci: Option<&dyn PciConfigSpace>, index: usize, config: &IdeConfig) -> Option<ChannelPorts> {
    if config.pcmcia_cf && index == 2 {
        return Some(PCMCIA_CF_PORTS);
    }

    let mut index = index;
    if let Some(cfg) = pci {
        let mut skip = 0;
        for i in 0..index / 2 {
            let mut nth = i;
            let Some(dev) = pci::find_ata_device(cfg, &mut nth, true, true) else {
                break;
            };

            // only IDE can be in compat mode, anything else has two native channels
            if pci::class_of(cfg, dev) != class_code::IDE {
                skip += 2;
                continue;
            }

            let prog_if = cfg.read8(dev, pci_reg::PROG_IF);
            if prog_if & PROG_IF_PRIMARY_NATIVE != 0 {
                skip += 1;
            }
            if prog_if & PROG_IF_SECONDARY_NATIVE != 0 {
                skip += 1;
            }
        }
        index = index.saturating_sub(skip);
        log::debug!("[ide] skipping {} native PCI channels, new index={}", skip, index);
    }

    LEGACY_PORTS.get(index).copied()
}

/// Ports of a channel as its PCI controller reports them.
fn pci_ports(cfg: &dyn PciConfigSpace, index: usize, config: &IdeConfig) -> Option<ChannelPorts> {
    let Some(dev) = find_controller(cfg, index / 2) else {
        log::debug!("[ide] PCI IDE #{} not found", index / 2);
        return None;
    };

    let vendor = cfg.read16(dev, pci_reg::VENDOR_ID);
    let device = cfg.read16(dev, pci_reg::DEVICE_ID);
    let prog_if = cfg.read8(dev, pci_reg::PROG_IF);
    let class = pci::class_of(cfg, dev);
    log::debug!("[ide] found PCI IDE controller {:04x}:{:04x} prog_if={:#x}", vendor, device, prog_if);

    let secondary = index & 1 != 0;
    let mask = if secondary { PROG_IF_SECONDARY_NATIVE } else { PROG_IF_PRIMARY_NATIVE };

    if prog_if & mask == 0 && class == class_code::IDE {
        log::debug!("[ide] {} channel: compatibility mode", if secondary { "secondary" } else { "primary" });
        return compat_ports(Some(cfg), index, config);
    }

    log::debug!("[ide] {} channel: native PCI mode", if secondary { "secondary" } else { "primary" });
    let (command_bar, control_bar) = if secondary { (2, 3) } else { (0, 1) };
    Some(ChannelPorts::new(
        pci::read_bar(cfg, dev, command_bar) as u16 & !3,
        pci::read_bar(cfg, dev, control_bar) as u16 & !3,
    ))
}

/// SATA parts in legacy mode are preferred over plain IDE controllers.
fn find_controller(cfg: &dyn PciConfigSpace, nth: usize) -> Option<PciAddress> {
    let mut index = nth;
    if let Some(dev) = pci::find_ata_device(cfg, &mut index, true, false) {
        return Some(dev);
    }
    let mut index = nth;
    pci::find_ata_device(cfg, &mut index, false, true)
}
