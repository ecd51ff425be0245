//! ATA/ATAPI definitions shared by the AHCI and IDE engines.
//!
//! IDENTIFY data is kept as raw little-endian words and decoded on demand;
//! nothing is overlaid on hardware-defined layouts.

use alloc::string::String;

use super::BlockError;

bitflags::bitflags! {
    /// ATA status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtaStatus: u8 {
        const BUSY = 0x80;
        const READY = 0x40;
        /// Device fault / write error
        const FAULT = 0x20;
        const SEEK = 0x10;
        const DRQ = 0x08;
        const CORR = 0x04;
        const INDEX = 0x02;
        const ERR = 0x01;
    }
}

/// ATA command opcodes
pub mod command {
    pub const READ_SECTORS: u8 = 0x20;
    pub const READ_SECTORS_EXT: u8 = 0x24;
    pub const READ_DMA_EXT: u8 = 0x25;
    pub const WRITE_DMA_EXT: u8 = 0x35;
    pub const PACKET: u8 = 0xA0;
    pub const IDENTIFY_PACKET_DEVICE: u8 = 0xA1;
    pub const FLUSH_CACHE_EXT: u8 = 0xEA;
    pub const IDENTIFY_DEVICE: u8 = 0xEC;
}

/// SCSI/MMC opcodes carried in ATAPI packets
pub mod scsi {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const START_STOP_UNIT: u8 = 0x1B;
    pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
    pub const READ_CAPACITY: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
}

/// Error register: command aborted
pub const ERROR_ABORT: u8 = 0x04;

/// `sectors28` value telling us to look at the 48-bit capacity instead.
pub const SECTORS28_SENTINEL: u32 = 0x0FFF_FFFF;

/// Size of an IDENTIFY (PACKET) DEVICE response
pub const IDENTIFY_SIZE: usize = 512;

/// Decoded view of an IDENTIFY (PACKET) DEVICE response.
#[derive(Clone)]
pub struct IdentifyData {
    words: [u16; 256],
}

impl IdentifyData {
    /// Decodes the first 512 bytes of `raw`.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, BlockError> {
        if raw.len() < IDENTIFY_SIZE {
            return Err(BlockError::InvalidSize);
        }
        let mut words = [0u16; 256];
        for (word, bytes) in words.iter_mut().zip(raw.chunks_exact(2)) {
            *word = u16::from_le_bytes([bytes[0], bytes[1]]);
        }
        Ok(Self { words })
    }

    fn dword(&self, index: usize) -> u32 {
        self.words[index] as u32 | (self.words[index + 1] as u32) << 16
    }

    /// Peripheral device type of an ATAPI device (word 0 bits 8..12)
    pub fn packet_device_type(&self) -> u8 {
        ((self.words[0] >> 8) & 0x1F) as u8
    }

    pub fn cylinders(&self) -> u16 {
        self.words[1]
    }

    pub fn heads(&self) -> u16 {
        self.words[3]
    }

    pub fn sectors_per_track(&self) -> u16 {
        self.words[6]
    }

    pub fn model(&self) -> String {
        ata_string(&self.words[27..47])
    }

    /// LBA addressing supported (word 49 bit 9)
    pub fn supports_lba(&self) -> bool {
        self.words[49] & (1 << 9) != 0
    }

    /// 48-bit addressing both supported (word 83) and enabled (word 86)
    pub fn supports_lba48(&self) -> bool {
        const LBA48: u16 = 1 << 10;
        self.words[83] & LBA48 != 0 && self.words[86] & LBA48 != 0
    }

    /// User addressable sectors, 28-bit (words 60-61)
    pub fn sectors28(&self) -> u32 {
        self.dword(60)
    }

    /// User addressable sectors, 48-bit (words 100-103)
    pub fn sectors48(&self) -> u64 {
        (100..104)
            .rev()
            .fold(0u64, |acc, i| (acc << 16) | self.words[i] as u64)
    }

    /// Capacity in 512-byte sectors, following the 28-bit sentinel to the 48-bit field.
    pub fn capacity(&self) -> u64 {
        match self.sectors28() {
            SECTORS28_SENTINEL => self.sectors48(),
            sectors => sectors as u64,
        }
    }

    /// Checks the optional integrity word (255).
    ///
    /// When the low byte carries the 0xA5 signature, all 512 bytes must sum
    /// to zero modulo 256.
    pub fn verify_checksum(&self) -> Result<(), BlockError> {
        let integrity = self.words[255];
        if integrity & 0xFF != 0xA5 {
            return Ok(());
        }

        let sum = self
            .words
            .iter()
            .fold(0u8, |acc, w| acc.wrapping_add(*w as u8).wrapping_add((*w >> 8) as u8));
        if sum != 0 {
            return Err(BlockError::ChecksumMismatch);
        }
        Ok(())
    }
}

/// Decodes an IDENTIFY string field.
///
/// ATA strings store two characters per word, high byte first. Leading and
/// trailing blanks are dropped and runs of blanks collapse to one.
pub fn ata_string(words: &[u16]) -> String {
    let mut out = String::new();
    let mut pending_space = false;

    for byte in words.iter().flat_map(|w| w.to_be_bytes()) {
        match byte {
            0 => break,
            b' ' => pending_space = !out.is_empty(),
            _ => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                out.push(if byte.is_ascii_graphic() { byte as char } else { '?' });
            }
        }
    }

    out
}

/// Splits a 48-bit LBA into its six bytes, least significant first.
pub fn lba48_bytes(lba: u64) -> [u8; 6] {
    let b = lba.to_le_bytes();
    [b[0], b[1], b[2], b[3], b[4], b[5]]
}

/// Cylinder/head/sector triple for `lba` on a drive with the given geometry.
pub fn lba_to_chs(lba: u64, heads: u16, sectors_per_track: u16) -> Option<(u16, u8, u8)> {
    if heads == 0 || sectors_per_track == 0 {
        return None;
    }
    let spt = sectors_per_track as u64;
    let track = lba / spt;
    let sector = (lba % spt) + 1;
    let head = track % heads as u64;
    let cylinder = track / heads as u64;

    Some((u16::try_from(cylinder).ok()?, head as u8, sector as u8))
}
