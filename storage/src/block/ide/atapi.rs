//! ATAPI packet protocol over a PIO channel.
//!
//! Packet commands are retried on sense data: UNIT ATTENTION and NOT READY
//! are retried (with a pause while the drive is becoming ready), "medium not
//! present" ends the command and marks the channel for re-probing.

use super::{reg, DataPhase, DriveType, IdeChannel, TaskFile};
use crate::block::ata::{scsi, AtaStatus};
use crate::block::{BlockError, SECTOR_SIZE};

/// Interrupt reason: command/data
pub const REASON_CD: u8 = 0x01;
/// Interrupt reason: transfer direction is device to host
pub const REASON_IO: u8 = 0x02;

/// Length of a packet command block
pub const CDB_LEN: usize = 12;
/// Length of the fixed-format sense data we request
pub const SENSE_LEN: usize = 18;

/// Largest byte count a single packet command can move
const MAX_PACKET_BYTES: usize = 0xFFFF;

/// Capacity assumed when READ CAPACITY fails.
const FALLBACK_SECTORS: u64 = 0x1F_FFFF;
const FALLBACK_BLOCK_SIZE: u32 = 2048;

pub mod sense_key {
    pub const NOT_READY: u8 = 0x02;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
}

/// ASC for NOT READY: "logical unit is in process of becoming ready"
pub const ASC_BECOMING_READY: u8 = 0x04;
/// ASC for NOT READY: "medium not present"
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;

/// Fixed-format sense data, reduced to what the retry policy needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    pub fn from_bytes(raw: &[u8; SENSE_LEN]) -> Self {
        Self {
            key: raw[2] & 0x0F,
            asc: raw[12],
            ascq: raw[13],
        }
    }
}

/// Builds a READ(10) block for `count` native blocks at `block`.
pub fn read10_cdb(block: u32, count: u16) -> [u8; CDB_LEN] {
    let mut cdb = [0u8; CDB_LEN];
    cdb[0] = scsi::READ_10;
    cdb[2..6].copy_from_slice(&block.to_be_bytes());
    cdb[7..9].copy_from_slice(&count.to_be_bytes());
    cdb
}

impl IdeChannel {
    /// One packet command without retries.
    pub(super) fn pio_packet(
        &mut self,
        unit: usize,
        cdb: &[u8; CDB_LEN],
        mut data: DataPhase<'_>,
    ) -> Result<(), BlockError> {
        let total = data.len();
        if total % 2 != 0 {
            return Err(BlockError::Misaligned);
        }

        self.select(unit)?;
        self.write_registers(unit, &TaskFile::packet(total as u16));

        let status = self.altstatus();
        if !status.contains(AtaStatus::BUSY) && !status.intersects(AtaStatus::DRQ | AtaStatus::ERR) {
            log::warn!("[ide] {}: bad stat in atapi cmd: {:#04x}", self.drives[unit].name(), status.bits());
            return Err(BlockError::Protocol);
        }

        let status = self.wait_status(AtaStatus::empty(), AtaStatus::BUSY | AtaStatus::ERR)?;
        if status & (AtaStatus::BUSY | AtaStatus::DRQ | AtaStatus::ERR) != AtaStatus::DRQ {
            // a sense request may legitimately see the previous CHECK CONDITION
            if cdb[0] != scsi::REQUEST_SENSE {
                log::debug!("[ide] odd, drive didn't want to transfer {:#04x}", status.bits());
                return Err(BlockError::Protocol);
            }
        }

        self.io.outsw(self.ports.command + reg::DATA, cdb);
        self.settle();

        let mut remaining = total;
        let mut status = loop {
            let status = match self.wait_status(AtaStatus::empty(), AtaStatus::BUSY | AtaStatus::ERR) {
                Ok(status) => status,
                Err(BlockError::DeviceError { status, .. }) => {
                    break AtaStatus::from_bits_retain(status);
                }
                Err(err) => return Err(err),
            };

            if status & (AtaStatus::BUSY | AtaStatus::DRQ) != AtaStatus::DRQ {
                break status;
            }

            let reason = self.inb(reg::NSECTOR);
            let lcyl = self.inb(reg::LCYL);
            let hcyl = self.inb(reg::HCYL);

            if reason & REASON_CD != 0 {
                log::warn!("[ide] {}: drive wants a command during data phase", self.drives[unit].name());
                return Err(BlockError::Protocol);
            }
            let to_host = reason & REASON_IO != 0;
            if data.is_none() || to_host != data.is_read() {
                log::warn!("[ide] {}: atapi, bad transfer ddir", self.drives[unit].name());
                return Err(BlockError::DirectionMismatch);
            }

            let byte_count = u16::from_le_bytes([lcyl, hcyl]) as usize;
            if byte_count == 0 {
                break status;
            }
            if byte_count % 2 != 0 {
                return Err(BlockError::Misaligned);
            }

            let chunk = byte_count.min(remaining);
            let offset = total - remaining;
            let port = self.ports.command + reg::DATA;
            match &mut data {
                DataPhase::Read(buf) => self.io.insw(port, &mut buf[offset..offset + chunk]),
                DataPhase::Write(buf) => self.io.outsw(port, &buf[offset..offset + chunk]),
                DataPhase::None => {}
            }
            remaining -= chunk;
            self.settle();

            if remaining == 0 {
                break status;
            }
        };

        if !data.is_none() {
            status = self.wait_status(AtaStatus::empty(), AtaStatus::BUSY)?;
        }

        if status.contains(AtaStatus::ERR) {
            return Err(self.device_error(status));
        }
        if remaining > 0 {
            log::debug!("[ide] cdb failed, bytes={}, stat={:#04x}", remaining, status.bits());
            return Err(BlockError::Protocol);
        }
        Ok(())
    }

    /// Fetches and records the sense data of the last failed command.
    fn request_sense(&mut self, unit: usize) -> Result<SenseData, BlockError> {
        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = scsi::REQUEST_SENSE;
        cdb[4] = SENSE_LEN as u8;

        let mut raw = [0u8; SENSE_LEN];
        self.pio_packet(unit, &cdb, DataPhase::Read(&mut raw))?;

        let sense = SenseData::from_bytes(&raw);
        self.last_sense = Some(sense);
        Ok(sense)
    }

    /// Runs a packet command with sense-driven retries.
    pub fn atapi_packet(&mut self, unit: usize, cdb: &[u8; CDB_LEN], mut data: DataPhase<'_>) -> Result<(), BlockError> {
        let drive = self.drives.get(unit).ok_or(BlockError::NotFound)?;
        if drive.kind != DriveType::Atapi {
            return Err(BlockError::Unsupported);
        }
        if data.len() > MAX_PACKET_BYTES {
            return Err(BlockError::InvalidSize);
        }

        let mut last = BlockError::Protocol;
        for _ in 0..self.config.atapi_attempts.max(1) {
            match self.pio_packet(unit, cdb, data.reborrow()) {
                Ok(()) => return Ok(()),
                Err(err) => last = err,
            }

            let Ok(sense) = self.request_sense(unit) else {
                break;
            };

            match (sense.key, sense.asc) {
                (sense_key::UNIT_ATTENTION, _) => {}
                (sense_key::NOT_READY, ASC_BECOMING_READY) => {
                    self.timer.mdelay(self.config.becoming_ready_delay_ms);
                }
                (sense_key::NOT_READY, ASC_MEDIUM_NOT_PRESENT) => {
                    // force a fresh scan on next access
                    self.present = false;
                    return Err(BlockError::NoMedium);
                }
                (sense_key::NOT_READY, _) => {}
                _ => break,
            }
        }

        log::warn!("[ide] {}: atapi command {:#04x} failed: {}", self.drives[unit].name(), cdb[0], last);
        Err(last)
    }

    /// Spins the medium up, unlocks it and reads its capacity.
    fn drive_ready(&mut self, unit: usize) -> Result<(), BlockError> {
        let name = self.drives[unit].name();

        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = scsi::TEST_UNIT_READY;
        self.atapi_packet(unit, &cdb, DataPhase::None).map_err(|err| {
            log::info!("[ide] {}: TUR failed", name);
            err
        })?;

        // start the unit but never load the tray
        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = scsi::START_STOP_UNIT;
        cdb[4] = 0x01;
        self.atapi_packet(unit, &cdb, DataPhase::None).map_err(|err| {
            log::info!("[ide] {}: START_STOP unit failed", name);
            err
        })?;

        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = scsi::PREVENT_ALLOW_MEDIUM_REMOVAL;
        cdb[2] = 2;
        if self.atapi_packet(unit, &cdb, DataPhase::None).is_err() {
            log::info!("[ide] {}: could not persistently unlock device", name);
        }

        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = scsi::PREVENT_ALLOW_MEDIUM_REMOVAL;
        if self.atapi_packet(unit, &cdb, DataPhase::None).is_err() {
            log::info!("[ide] {}: could not unlock device", name);
        }

        let mut cdb = [0u8; CDB_LEN];
        cdb[0] = scsi::READ_CAPACITY;
        let mut capacity = [0u8; 8];
        let result = self.atapi_packet(unit, &cdb, DataPhase::Read(&mut capacity));

        let drive = &mut self.drives[unit];
        if let Err(err) = result {
            drive.sectors = FALLBACK_SECTORS;
            drive.block_size = FALLBACK_BLOCK_SIZE;
            return Err(err);
        }

        let last_lba = u32::from_be_bytes([capacity[0], capacity[1], capacity[2], capacity[3]]);
        drive.sectors = last_lba as u64 + 1;
        drive.block_size = u32::from_be_bytes([capacity[4], capacity[5], capacity[6], capacity[7]]);
        Ok(())
    }

    /// Reads 512-byte logical sectors from a packet device with READ(10).
    pub(super) fn read_atapi(&mut self, unit: usize, block: u64, count: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        if let Err(err) = self.drive_ready(unit) {
            log::debug!("[ide] {}: not ready: {}", self.drives[unit].name(), err);
            return Err(BlockError::NoMedium);
        }

        let drive = &self.drives[unit];
        let block_size = drive.block_size as u64;
        if block_size < SECTOR_SIZE as u64 || block_size % SECTOR_SIZE as u64 != 0 {
            log::warn!("[ide] {}: unusable block size {}", drive.name(), block_size);
            return Err(BlockError::Protocol);
        }
        if block.saturating_add(count) > drive.logical_sectors() {
            return Err(BlockError::OutOfRange);
        }

        let ratio = block_size / SECTOR_SIZE as u64;
        if block % ratio != 0 || count % ratio != 0 {
            log::debug!("[ide] unaligned atapi access: {:#x} blocks, starting from {:#x}", count, block);
            return Err(BlockError::Misaligned);
        }

        let native_block = u32::try_from(block / ratio).map_err(|_| BlockError::OutOfRange)?;
        let native_count = u16::try_from(count / ratio).map_err(|_| BlockError::InvalidSize)?;
        let bytes = native_count as usize * block_size as usize;

        let cdb = read10_cdb(native_block, native_count);
        self.atapi_packet(unit, &cdb, DataPhase::Read(&mut buf[..bytes]))
    }
}
