//! # Legacy IDE / ATAPI Driver
//!
//! Polled PIO driver for the legacy IDE channels.
//!
//! ## Channel lifecycle
//!
//! ```text
//! Unscanned ──► Present/Absent ──► Typed ──► Identified
//!                │                  │
//!                │                  └─ signature after soft reset:
//!                │                     14/EB = ATAPI, 00/00 = ATA
//!                └─ floating bus (status 0xFF): channel absent
//! ```
//!
//! Each channel is shared by its two drives behind an `Arc<Mutex<_>>`;
//! an [`IdeDisk`] refers to its drive by unit index. Reads are exposed in
//! 512-byte logical sectors whatever the native block size is. Writes are
//! not supported.

pub mod atapi;
pub mod locate;

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use super::ata::{self, command, AtaStatus, IdentifyData, IDENTIFY_SIZE};
use super::{transfer_len, BlockDevice, BlockDeviceController, BlockDeviceInfo, BlockError, SECTOR_SIZE};
use crate::hal::{self, PortIo, Timer};
use crate::pci::PciConfigSpace;

pub use atapi::SenseData;
pub use locate::ChannelPorts;

/// Channels the engine knows port bases for
pub const MAX_CHANNELS: usize = 4;

/// Task file register indices (offsets from the command block base)
pub mod reg {
    pub const DATA: u16 = 0;
    pub const ERROR: u16 = 1;
    pub const FEATURE: u16 = 1;
    /// Sector count; interrupt reason for ATAPI
    pub const NSECTOR: u16 = 2;
    pub const SECTOR: u16 = 3;
    pub const LCYL: u16 = 4;
    pub const HCYL: u16 = 5;
    pub const DEVICE: u16 = 6;
    pub const STATUS: u16 = 7;
    pub const COMMAND: u16 = 7;
}

/// Device register: select master
pub const DEVICE_DEV0: u8 = 0xA0;
/// Device register: select slave
pub const DEVICE_DEV1: u8 = 0xB0;
/// Device register: LBA addressing
pub const DEVICE_LBA: u8 = 0x40;

/// Device control: interrupts disabled
pub const CONTROL_NIEN: u8 = 0x02;
/// Device control: software reset
pub const CONTROL_SRST: u8 = 0x04;

/// Attempts at the pre-command ready check, 400 ns apart
const PIO_READY_ATTEMPTS: usize = 1000;
/// Attempts at the slave register-access check after reset
const RESET_SLAVE_ATTEMPTS: usize = 1000;
/// Status poll interval (microseconds)
const STATUS_POLL_US: u64 = 1000;

/// Largest sector count one LBA28/CHS command can carry
const MAX_SECTORS_28: u64 = 255;
const LBA28_LIMIT: u64 = 1 << 28;

// =============================================================================
// Configuration
// =============================================================================

/// Tunables for the IDE engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdeConfig {
    /// Channels to scan, at most [`MAX_CHANNELS`]
    pub channels: usize,
    /// Use LBA48 when the drive supports it
    pub lba48: bool,
    /// Ask PCI where the channel registers are
    pub pci_discovery: bool,
    /// Third channel is a PCMCIA CompactFlash slot
    pub pcmcia_cf: bool,
    pub status_timeout_ms: u64,
    pub becoming_ready_delay_ms: u64,
    /// Packet command attempts before giving up
    pub atapi_attempts: usize,
}

impl Default for IdeConfig {
    fn default() -> Self {
        Self {
            channels: MAX_CHANNELS,
            lba48: cfg!(feature = "ide-lba48"),
            pci_discovery: cfg!(feature = "pci"),
            pcmcia_cf: cfg!(feature = "pcmcia-cf"),
            status_timeout_ms: 5000,
            becoming_ready_delay_ms: 3000,
            atapi_attempts: 10,
        }
    }
}

// =============================================================================
// Drive state
// =============================================================================

/// What the drive signature said after reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveType {
    /// Echoed the register pattern, not typed yet
    Unknown,
    Ata,
    Atapi,
}

/// Medium behind a drive, from IDENTIFY PACKET's device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Disk,
    Floppy,
    CdRom,
    Optical,
    Other(u8),
}

impl MediaKind {
    pub fn from_packet_type(kind: u8) -> Self {
        match kind {
            0x00 => Self::Floppy,
            0x05 => Self::CdRom,
            0x07 => Self::Optical,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk => write!(f, "Disk"),
            Self::Floppy => write!(f, "Floppy"),
            Self::CdRom => write!(f, "CD-ROM"),
            Self::Optical => write!(f, "MO"),
            Self::Other(_) => write!(f, "UNKNOWN"),
        }
    }
}

/// ATA addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    Chs,
    Lba28,
    Lba48,
}

/// One of the two drive positions on a channel.
#[derive(Debug, Clone)]
pub struct IdeDrive {
    pub unit: usize,
    /// Global drive number (channel * 2 + unit)
    pub number: usize,
    pub present: bool,
    pub kind: DriveType,
    pub media: MediaKind,
    pub model: String,
    pub addressing: Addressing,
    /// Capacity in native blocks
    pub sectors: u64,
    /// Native block size
    pub block_size: u32,
    /// Native blocks per command
    pub max_sectors: u64,
    pub cylinders: u16,
    pub heads: u16,
    pub sectors_per_track: u16,
}

impl IdeDrive {
    fn new(channel: usize, unit: usize) -> Self {
        Self {
            unit,
            number: channel * 2 + unit,
            present: false,
            kind: DriveType::Unknown,
            media: MediaKind::Disk,
            model: String::new(),
            addressing: Addressing::Chs,
            sectors: 0,
            block_size: SECTOR_SIZE as u32,
            max_sectors: 1,
            cylinders: 0,
            heads: 0,
            sectors_per_track: 0,
        }
    }

    /// `hda`, `hdb`, ...
    pub fn name(&self) -> String {
        format!("hd{}", (b'a' + self.number as u8) as char)
    }

    /// Logical 512-byte sectors per native block.
    fn ratio(&self) -> u64 {
        (self.block_size as u64 / SECTOR_SIZE as u64).max(1)
    }

    /// Capacity in 512-byte logical sectors.
    pub fn logical_sectors(&self) -> u64 {
        self.sectors.saturating_mul(self.ratio())
    }

    /// Largest read in logical sectors.
    fn max_transfer(&self) -> u64 {
        (self.max_sectors * self.ratio()).max(1)
    }
}

// =============================================================================
// Task file
// =============================================================================

/// Register image for one command.
///
/// `hob` holds the previous-content bytes (feature, nsector, sector, lcyl,
/// hcyl) of a 48-bit command; they are written before the current bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFile {
    pub feature: u8,
    pub nsector: u8,
    pub sector: u8,
    pub lcyl: u8,
    pub hcyl: u8,
    pub device: u8,
    pub command: u8,
    pub hob: Option<[u8; 5]>,
}

impl TaskFile {
    pub fn new(command: u8) -> Self {
        Self { command, ..Default::default() }
    }

    pub fn lba28(command: u8, block: u64, count: u8) -> Self {
        Self {
            nsector: count,
            sector: block as u8,
            lcyl: (block >> 8) as u8,
            hcyl: (block >> 16) as u8,
            device: DEVICE_LBA | ((block >> 24) & 0x0F) as u8,
            command,
            ..Default::default()
        }
    }

    pub fn lba48(command: u8, block: u64, count: u16) -> Self {
        let lba = ata::lba48_bytes(block);
        let [count_lo, count_hi] = count.to_le_bytes();
        Self {
            nsector: count_lo,
            sector: lba[0],
            lcyl: lba[1],
            hcyl: lba[2],
            device: DEVICE_LBA,
            command,
            hob: Some([0, count_hi, lba[3], lba[4], lba[5]]),
            ..Default::default()
        }
    }

    pub fn chs(command: u8, cylinder: u16, head: u8, sector: u8, count: u8) -> Self {
        let [lcyl, hcyl] = cylinder.to_le_bytes();
        Self {
            nsector: count,
            sector,
            lcyl,
            hcyl,
            device: head & 0x0F,
            command,
            ..Default::default()
        }
    }

    /// PACKET with the host's byte count limit in the cylinder registers.
    pub fn packet(byte_count: u16) -> Self {
        let [lcyl, hcyl] = byte_count.to_le_bytes();
        Self { lcyl, hcyl, command: command::PACKET, ..Default::default() }
    }
}

/// Data phase of a packet command.
pub enum DataPhase<'a> {
    None,
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl DataPhase<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Read(buf) => buf.len(),
            Self::Write(buf) => buf.len(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn is_read(&self) -> bool {
        matches!(self, Self::Read(_))
    }

    fn reborrow(&mut self) -> DataPhase<'_> {
        match self {
            Self::None => DataPhase::None,
            Self::Read(buf) => DataPhase::Read(buf),
            Self::Write(buf) => DataPhase::Write(buf),
        }
    }
}

// =============================================================================
// Channel
// =============================================================================

/// One IDE channel: register block, both drive slots and selection latch.
pub struct IdeChannel {
    index: usize,
    ports: ChannelPorts,
    io: Arc<dyn PortIo>,
    timer: Arc<dyn Timer>,
    config: IdeConfig,
    /// Cleared by a floating bus or by a "medium not present" sense
    present: bool,
    selected: Option<usize>,
    drives: [IdeDrive; 2],
    last_sense: Option<SenseData>,
}

impl IdeChannel {
    pub fn new(
        index: usize,
        ports: ChannelPorts,
        io: Arc<dyn PortIo>,
        timer: Arc<dyn Timer>,
        config: IdeConfig,
    ) -> Self {
        Self {
            index,
            ports,
            io,
            timer,
            config,
            present: false,
            selected: None,
            drives: [IdeDrive::new(index, 0), IdeDrive::new(index, 1)],
            last_sense: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn ports(&self) -> ChannelPorts {
        self.ports
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn drive(&self, unit: usize) -> Option<&IdeDrive> {
        self.drives.get(unit)
    }

    /// Sense data of the last failed packet command.
    pub fn last_sense(&self) -> Option<SenseData> {
        self.last_sense
    }

    fn inb(&self, register: u16) -> u8 {
        self.io.inb(self.ports.command + register)
    }

    fn outb(&self, register: u16, value: u8) {
        self.io.outb(self.ports.command + register, value);
    }

    fn status(&self) -> AtaStatus {
        AtaStatus::from_bits_retain(self.inb(reg::STATUS))
    }

    fn altstatus(&self) -> AtaStatus {
        AtaStatus::from_bits_retain(self.io.inb(self.ports.control))
    }

    fn write_control(&self, value: u8) {
        self.io.outb(self.ports.control, value);
    }

    /// 400 ns settle: four alternate status reads.
    fn settle(&self) {
        for _ in 0..4 {
            self.altstatus();
        }
        self.timer.ndelay(400);
    }

    fn device_error(&self, status: AtaStatus) -> BlockError {
        let error = if status & (AtaStatus::BUSY | AtaStatus::ERR) == AtaStatus::ERR {
            self.inb(reg::ERROR)
        } else {
            0
        };
        BlockError::DeviceError { status: status.bits(), error }
    }

    /// Settles, waits for BUSY to clear, then applies the `bad`/`ok` masks.
    ///
    /// An empty `ok` accepts any status without a `bad` bit.
    fn wait_status(&self, ok: AtaStatus, bad: AtaStatus) -> Result<AtaStatus, BlockError> {
        self.settle();

        let status = hal::wait_until(&*self.timer, self.config.status_timeout_ms * 1000, STATUS_POLL_US, || {
            let status = self.status();
            (!status.contains(AtaStatus::BUSY)).then_some(status)
        })?;

        if status.intersects(bad) {
            return Err(self.device_error(status));
        }
        if ok.is_empty() || status.intersects(ok) {
            return Ok(status);
        }
        Err(self.device_error(status))
    }

    /// Selects `unit`; reselecting the current unit only waits for BUSY.
    fn select(&mut self, unit: usize) -> Result<(), BlockError> {
        self.wait_status(AtaStatus::empty(), AtaStatus::BUSY).map_err(|err| {
            log::debug!("[ide] select {}: timed out", self.drives[unit].name());
            err
        })?;

        if self.selected == Some(unit) {
            return Ok(());
        }

        self.outb(reg::DEVICE, if unit == 1 { DEVICE_DEV1 } else { DEVICE_DEV0 });
        self.settle();

        self.wait_status(AtaStatus::empty(), AtaStatus::BUSY).map_err(|err| {
            log::debug!("[ide] select {}: timed out", self.drives[unit].name());
            err
        })?;

        self.selected = Some(unit);
        Ok(())
    }

    fn write_registers(&self, unit: usize, tf: &TaskFile) {
        // always polled
        self.write_control(CONTROL_NIEN);

        if let Some([feature, nsector, sector, lcyl, hcyl]) = tf.hob {
            self.outb(reg::FEATURE, feature);
            self.outb(reg::NSECTOR, nsector);
            self.outb(reg::SECTOR, sector);
            self.outb(reg::LCYL, lcyl);
            self.outb(reg::HCYL, hcyl);
        }

        self.outb(reg::FEATURE, tf.feature);
        self.outb(reg::NSECTOR, tf.nsector);
        self.outb(reg::SECTOR, tf.sector);
        self.outb(reg::LCYL, tf.lcyl);
        self.outb(reg::HCYL, tf.hcyl);

        let device = if unit == 1 { tf.device | DEVICE_DEV1 } else { tf.device };
        self.outb(reg::DEVICE, device);

        self.outb(reg::COMMAND, tf.command);
        self.settle();
    }

    /// Runs `tf` and reads `buf.len()` bytes in native-block chunks.
    fn pio_data_in(&mut self, unit: usize, tf: &TaskFile, buf: &mut [u8]) -> Result<(), BlockError> {
        if buf.len() % 2 != 0 {
            log::warn!("[ide] {}: command not word aligned", self.drives[unit].name());
            return Err(BlockError::Misaligned);
        }

        self.select(unit)?;

        // ATA must report READY, ATAPI only has to drop BUSY
        let atapi = self.drives[unit].kind == DriveType::Atapi;
        let mut status = AtaStatus::empty();
        let mut ready = false;
        for _ in 0..PIO_READY_ATTEMPTS {
            status = self.status();
            ready = if atapi {
                !status.contains(AtaStatus::BUSY)
            } else {
                status & (AtaStatus::BUSY | AtaStatus::READY) == AtaStatus::READY
            };
            if ready {
                break;
            }
            self.settle();
        }
        if !ready {
            log::warn!("[ide] {}: drive timed out, status {:#04x}", self.drives[unit].name(), status.bits());
            return Err(BlockError::Timeout);
        }

        self.write_registers(unit, tf);

        let chunk = (self.drives[unit].block_size as usize).max(2);
        let mut done = 0;
        while done < buf.len() {
            status = self.wait_status(AtaStatus::empty(), AtaStatus::BUSY | AtaStatus::ERR).map_err(|err| {
                log::warn!("[ide] {}: timed out waiting for BUSY clear: {}", self.drives[unit].name(), err);
                err
            })?;

            if status & (AtaStatus::BUSY | AtaStatus::DRQ) == AtaStatus::DRQ {
                let count = chunk.min(buf.len() - done);
                self.io.insw(self.ports.command + reg::DATA, &mut buf[done..done + count]);
                done += count;
                self.settle();
            }

            if status.intersects(AtaStatus::BUSY | AtaStatus::FAULT | AtaStatus::ERR) || !status.contains(AtaStatus::DRQ) {
                break;
            }
        }

        if done < buf.len() {
            log::debug!("[ide] bytes={}, stat={:#04x}", buf.len() - done, status.bits());
            if status.intersects(AtaStatus::ERR | AtaStatus::FAULT) {
                return Err(self.device_error(status));
            }
            return Err(BlockError::Protocol);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Probing
    // -------------------------------------------------------------------------

    /// Pattern test: does anything latch the sector registers?
    fn device_check(&mut self, unit: usize) {
        // a non-existing port reads 0xff, don't scan this channel at all then
        if self.inb(reg::STATUS) == 0xFF {
            self.present = false;
            return;
        }

        if self.select(unit).is_err() {
            return;
        }

        self.outb(reg::NSECTOR, 0x55);
        self.outb(reg::SECTOR, 0xAA);
        self.outb(reg::NSECTOR, 0xAA);
        self.outb(reg::SECTOR, 0x55);
        self.outb(reg::NSECTOR, 0x55);
        self.outb(reg::SECTOR, 0xAA);

        let count = self.inb(reg::NSECTOR);
        let sector = self.inb(reg::SECTOR);

        // tentative, the signature check confirms it
        if count == 0x55 && sector == 0xAA {
            self.drives[unit].present = true;
            self.drives[unit].kind = DriveType::Unknown;
        }
    }

    /// Software reset, master/slave ordering per ATA-4 section 8.3.
    fn software_reset(&mut self, unit: usize) {
        self.write_control(CONTROL_NIEN | CONTROL_SRST);
        self.settle();
        self.write_control(CONTROL_NIEN);
        self.settle();

        if self.drives[0].present {
            let _ = self.wait_status(AtaStatus::empty(), AtaStatus::BUSY);
        }

        // slave must allow register access again
        if self.drives[1].present {
            for _ in 0..RESET_SLAVE_ATTEMPTS {
                self.outb(reg::DEVICE, DEVICE_DEV1);
                self.settle();

                let sector = self.inb(reg::SECTOR);
                let count = self.inb(reg::NSECTOR);
                if count == 0x01 && sector == 0x01 {
                    break;
                }
            }
        }

        self.selected = None;
        let _ = self.select(unit);
    }

    /// Confirms a tentatively present drive by its signature.
    fn device_type_check(&mut self, unit: usize) {
        if self.select(unit).is_err() {
            return;
        }

        let count = self.inb(reg::NSECTOR);
        let sector = self.inb(reg::SECTOR);
        let drive = &mut self.drives[unit];

        if count != 0x01 || sector != 0x01 {
            drive.present = false;
            return;
        }

        let lcyl = self.io.inb(self.ports.command + reg::LCYL);
        let hcyl = self.io.inb(self.ports.command + reg::HCYL);
        let status = self.io.inb(self.ports.command + reg::STATUS);
        match (lcyl, hcyl) {
            (0x14, 0xEB) => drive.kind = DriveType::Atapi,
            (0x00, 0x00) if status != 0 => drive.kind = DriveType::Ata,
            _ => drive.present = false,
        }
    }

    fn detect(&mut self) {
        for unit in 0..2 {
            self.device_check(unit);

            // no point in continuing
            if !self.present {
                break;
            }
            if !self.drives[unit].present {
                continue;
            }
            if self.select(unit).is_err() {
                continue;
            }

            self.software_reset(unit);
            self.device_type_check(unit);
        }
    }

    fn identify(&mut self, unit: usize) -> Result<(), BlockError> {
        let kind = self.drives[unit].kind;
        let opcode = match kind {
            DriveType::Ata => command::IDENTIFY_DEVICE,
            DriveType::Atapi => command::IDENTIFY_PACKET_DEVICE,
            DriveType::Unknown => return Err(BlockError::NotPresent),
        };

        let mut raw = [0u8; IDENTIFY_SIZE];
        self.pio_data_in(unit, &TaskFile::new(opcode), &mut raw)?;
        let id = IdentifyData::from_bytes(&raw)?;
        let lba48 = self.config.lba48;

        let drive = &mut self.drives[unit];
        drive.model = id.model();

        if kind == DriveType::Atapi {
            drive.media = MediaKind::from_packet_type(id.packet_device_type());
            drive.sectors = 0x7FFF_FFFF;
            drive.block_size = 2048;
            drive.max_sectors = 31;
            return Ok(());
        }

        drive.media = MediaKind::Disk;
        drive.block_size = SECTOR_SIZE as u32;
        drive.max_sectors = MAX_SECTORS_28;
        drive.cylinders = id.cylinders();
        drive.heads = id.heads();
        drive.sectors_per_track = id.sectors_per_track();

        let chs = drive.cylinders as u64 * drive.heads as u64 * drive.sectors_per_track as u64;
        let sectors28 = match id.sectors28() {
            0 => chs,
            sectors => sectors as u64,
        };

        if lba48 && id.supports_lba48() {
            drive.addressing = Addressing::Lba48;
            drive.max_sectors = u16::MAX as u64;
            drive.sectors = match id.sectors48() {
                0 => sectors28,
                sectors => sectors,
            };
        } else if id.supports_lba() {
            drive.addressing = Addressing::Lba28;
            drive.sectors = sectors28;
        } else {
            drive.addressing = Addressing::Chs;
            drive.sectors = sectors28;
        }
        Ok(())
    }

    /// Scans the channel and identifies what it finds.
    ///
    /// Returns whether the channel responded at all.
    pub fn init(&mut self) -> bool {
        self.present = true;
        self.selected = None;
        self.drives = [IdeDrive::new(self.index, 0), IdeDrive::new(self.index, 1)];

        self.detect();
        if !self.present {
            log::debug!("[ide] channel {} is floating", self.index);
            return false;
        }

        for unit in 0..2 {
            if !self.drives[unit].present {
                continue;
            }
            if let Err(err) = self.identify(unit) {
                log::warn!("[ide] {}: identify failed: {}", self.drives[unit].name(), err);
                self.drives[unit].present = false;
            }
        }

        log::info!(
            "[ide] ATA-{}: [io ports {:#x}-{:#x},{:#x}]",
            self.index,
            self.ports.command,
            self.ports.command + 7,
            self.ports.control
        );
        for drive in self.drives.iter().filter(|d| d.present) {
            log::info!(
                "[ide] * {} [ATA{} {}]: {} ({:?}, {} sectors of {} bytes)",
                drive.name(),
                if drive.kind == DriveType::Atapi { "PI" } else { "" },
                drive.media,
                drive.model,
                drive.addressing,
                drive.sectors,
                drive.block_size
            );
        }
        true
    }

    /// Rescans a channel that lost its medium or was never scanned.
    fn ensure_scanned(&mut self) -> Result<(), BlockError> {
        if !self.present {
            log::info!("[ide] re-evaluating channel {}", self.index);
            if !self.init() {
                return Err(BlockError::NotPresent);
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn read_ata(&mut self, unit: usize, block: u64, count: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let drive = &self.drives[unit];
        let end = block.checked_add(count).ok_or(BlockError::OutOfRange)?;
        if end > drive.sectors {
            return Err(BlockError::OutOfRange);
        }

        let need_lba48 = end > LBA28_LIMIT || count > MAX_SECTORS_28;
        if need_lba48 && drive.addressing != Addressing::Lba48 {
            log::warn!("[ide] {}: {} sectors at {} need LBA48", drive.name(), count, block);
            return Err(BlockError::Unsupported);
        }

        let tf = if need_lba48 {
            let count = u16::try_from(count).map_err(|_| BlockError::InvalidSize)?;
            TaskFile::lba48(command::READ_SECTORS_EXT, block, count)
        } else if drive.addressing != Addressing::Chs {
            TaskFile::lba28(command::READ_SECTORS, block, count as u8)
        } else {
            let (cylinder, head, sector) =
                ata::lba_to_chs(block, drive.heads, drive.sectors_per_track).ok_or(BlockError::OutOfRange)?;
            TaskFile::chs(command::READ_SECTORS, cylinder, head, sector, count as u8)
        };

        let bytes = count as usize * SECTOR_SIZE;
        self.pio_data_in(unit, &tf, &mut buf[..bytes])
    }

    /// Reads `count` logical sectors in a single command.
    pub fn read_sectors(&mut self, unit: usize, block: u64, count: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        if count == 0 {
            return Err(BlockError::InvalidSize);
        }
        transfer_len(count, SECTOR_SIZE as u32, buf.len())?;

        let drive = self.drives.get(unit).ok_or(BlockError::NotFound)?;
        if !drive.present {
            return Err(BlockError::NotPresent);
        }
        if block.saturating_add(count) > drive.logical_sectors() {
            return Err(BlockError::OutOfRange);
        }

        let kind = drive.kind;
        log::debug!("[ide] read_sectors: block={} sectors={}", block, count);
        match kind {
            DriveType::Ata => self.read_ata(unit, block, count, buf),
            DriveType::Atapi => self.read_atapi(unit, block, count, buf),
            DriveType::Unknown => Err(BlockError::NotPresent),
        }
    }

    /// Reads `count` logical sectors, split by the drive's transfer limit.
    pub fn read_blocks(&mut self, unit: usize, block: u64, count: u64, buf: &mut [u8]) -> Result<u64, BlockError> {
        transfer_len(count, SECTOR_SIZE as u32, buf.len())?;
        let drive = self.drives.get(unit).ok_or(BlockError::NotFound)?;
        if !drive.present {
            return Err(BlockError::NotPresent);
        }

        let mut done = 0u64;
        while done < count {
            let len = (count - done).min(self.drives[unit].max_transfer());
            let offset = done as usize * SECTOR_SIZE;
            log::debug!("[ide] reading {} sectors from blk {}", len, block + done);
            self.read_sectors(unit, block + done, len, &mut buf[offset..offset + len as usize * SECTOR_SIZE])?;
            done += len;
        }
        Ok(count)
    }
}

// =============================================================================
// Block device
// =============================================================================

/// A drive on a shared IDE channel.
pub struct IdeDisk {
    channel: Arc<Mutex<IdeChannel>>,
    unit: usize,
    name: String,
}

impl IdeDisk {
    pub fn new(channel: Arc<Mutex<IdeChannel>>, unit: usize) -> Self {
        let name = channel.lock().drives[unit].name();
        Self { channel, unit, name }
    }
}

impl BlockDevice for IdeDisk {
    fn info(&self) -> BlockDeviceInfo {
        let channel = self.channel.lock();
        let drive = &channel.drives[self.unit];
        BlockDeviceInfo {
            name: self.name.clone(),
            block_size: SECTOR_SIZE as u32,
            block_count: drive.logical_sectors(),
            removable: drive.kind == DriveType::Atapi,
            model: drive.model.clone(),
        }
    }

    fn read_blocks(&self, start: u64, count: u64, buf: &mut [u8]) -> Result<u64, BlockError> {
        let mut channel = self.channel.lock();
        channel.ensure_scanned()?;
        channel.read_blocks(self.unit, start, count, buf)
    }

    fn write_blocks(&self, _start: u64, _count: u64, _buf: &[u8]) -> Result<u64, BlockError> {
        Err(BlockError::Unsupported)
    }
}

// =============================================================================
// Controller
// =============================================================================

/// All legacy IDE channels of the machine.
pub struct IdeController {
    io: Arc<dyn PortIo>,
    timer: Arc<dyn Timer>,
    pci: Option<Arc<dyn PciConfigSpace>>,
    config: IdeConfig,
    channels: Vec<Arc<Mutex<IdeChannel>>>,
}

impl IdeController {
    pub fn new(
        io: Arc<dyn PortIo>,
        timer: Arc<dyn Timer>,
        pci: Option<Arc<dyn PciConfigSpace>>,
        config: IdeConfig,
    ) -> Self {
        Self { io, timer, pci, config, channels: Vec::new() }
    }

    /// Channel with the given index, if it was found on the last update.
    pub fn channel(&self, index: usize) -> Option<Arc<Mutex<IdeChannel>>> {
        self.channels.iter().find(|c| c.lock().index() == index).cloned()
    }

    /// Reads by global drive number (`hda` = 0).
    pub fn read_blocks(&self, drive: usize, block: u64, count: u64, buf: &mut [u8]) -> Result<u64, BlockError> {
        let channel = self.channel(drive / 2).ok_or(BlockError::NotFound)?;
        let mut channel = channel.lock();
        channel.ensure_scanned()?;
        channel.read_blocks(drive % 2, block, count, buf)
    }
}

impl BlockDeviceController for IdeController {
    fn name(&self) -> &str {
        "ide"
    }

    /// Scans the channels that have no disks yet.
    ///
    /// Channels whose drives were handed out before are left alone; they
    /// rescan themselves when their medium goes away.
    fn update(&mut self) -> Result<Vec<Box<dyn BlockDevice>>, BlockError> {
        let mut devices: Vec<Box<dyn BlockDevice>> = Vec::new();

        for index in 0..self.config.channels.min(MAX_CHANNELS) {
            if self.channel(index).is_some() {
                continue;
            }
            let pci = if self.config.pci_discovery { self.pci.as_deref() } else { None };
            let Some(ports) = locate::channel_ports(index, &self.config, pci) else {
                log::info!("[ide] IDE channel {} not found", index);
                continue;
            };

            let mut channel = IdeChannel::new(index, ports, self.io.clone(), self.timer.clone(), self.config);
            if !channel.init() {
                continue;
            }

            let units: Vec<usize> = (0..2).filter(|&u| channel.drives[u].present).collect();
            if units.is_empty() {
                continue;
            }
            let channel = Arc::new(Mutex::new(channel));
            for unit in units {
                devices.push(Box::new(IdeDisk::new(channel.clone(), unit)));
            }
            self.channels.push(channel);
        }

        Ok(devices)
    }
}
