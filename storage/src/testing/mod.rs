//! Register-level simulators and fixtures shared by the unit tests.

mod ahci;
mod ide;

pub use ahci::{AhciRig, SimPort};
pub use ide::{IdeRig, SimIdeDevice};

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::block::ata::SECTORS28_SENTINEL;
use crate::block::{transfer_len, BlockDevice, BlockDeviceInfo, BlockError};
use crate::hal::Timer;
use crate::pci::{PciAddress, PciConfigSpace};

// =============================================================================
// Time
// =============================================================================

/// Timer that only advances a counter.
pub struct FakeTimer {
    elapsed_us: AtomicU64,
}

impl FakeTimer {
    pub fn new() -> Self {
        Self { elapsed_us: AtomicU64::new(0) }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.elapsed_us.load(Ordering::SeqCst)
    }
}

impl Timer for FakeTimer {
    fn udelay(&self, us: u64) {
        self.elapsed_us.fetch_add(us, Ordering::SeqCst);
    }
}

// =============================================================================
// Memory-backed disk
// =============================================================================

/// RAM disk with knobs for failure injection.
pub struct MemDisk {
    name: String,
    block_size: u32,
    blocks: u64,
    removable: bool,
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    fail: AtomicBool,
    limit: AtomicU64,
}

impl MemDisk {
    pub fn new(name: &str, block_size: u32, blocks: u64) -> Self {
        Self {
            name: name.into(),
            block_size,
            blocks,
            removable: false,
            data: Mutex::new(vec![0; block_size as usize * blocks as usize]),
            reads: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            limit: AtomicU64::new(u64::MAX),
        }
    }

    pub fn set_removable(&mut self, removable: bool) {
        self.removable = removable;
    }

    pub fn fill_sector(&self, sector: u64, value: u8) {
        let bs = self.block_size as usize;
        let start = sector as usize * bs;
        self.data.lock()[start..start + bs].fill(value);
    }

    /// Number of `read_blocks` calls that reached the device.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Caps how many blocks a single read transfers.
    pub fn limit_reads_to(&self, blocks: u64) {
        self.limit.store(blocks, Ordering::SeqCst);
    }

    fn check(&self, start: u64, count: u64, buf_len: usize) -> Result<usize, BlockError> {
        match start.checked_add(count) {
            Some(end) if end <= self.blocks => transfer_len(count, self.block_size, buf_len),
            _ => Err(BlockError::OutOfRange),
        }
    }
}

impl BlockDevice for MemDisk {
    fn info(&self) -> BlockDeviceInfo {
        BlockDeviceInfo {
            name: self.name.clone(),
            block_size: self.block_size,
            block_count: self.blocks,
            removable: self.removable,
            model: String::from("MEMDISK"),
        }
    }

    fn read_blocks(&self, start: u64, count: u64, buf: &mut [u8]) -> Result<u64, BlockError> {
        self.check(start, count, buf.len())?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BlockError::DeviceError { status: 0x51, error: 0x40 });
        }

        let count = count.min(self.limit.load(Ordering::SeqCst));
        let bs = self.block_size as usize;
        let offset = start as usize * bs;
        let len = count as usize * bs;
        buf[..len].copy_from_slice(&self.data.lock()[offset..offset + len]);
        Ok(count)
    }

    fn write_blocks(&self, start: u64, count: u64, buf: &[u8]) -> Result<u64, BlockError> {
        let len = self.check(start, count, buf.len())?;
        let offset = start as usize * self.block_size as usize;
        self.data.lock()[offset..offset + len].copy_from_slice(&buf[..len]);
        Ok(count)
    }
}

// =============================================================================
// IDENTIFY images
// =============================================================================

/// Builds 512-byte IDENTIFY (PACKET) DEVICE responses.
#[derive(Clone)]
pub struct IdentifyBuilder {
    words: [u16; 256],
    checksum: bool,
}

impl IdentifyBuilder {
    pub fn ata(model: &str) -> Self {
        let mut builder = Self { words: [0; 256], checksum: false };
        builder.model(model);
        builder
    }

    /// `kind` is the peripheral device type (0x05 for CD-ROM).
    pub fn atapi(model: &str, kind: u8) -> Self {
        let mut builder = Self::ata(model);
        builder.words[0] = 0x8000 | ((kind as u16 & 0x1F) << 8);
        builder
    }

    fn model(&mut self, model: &str) {
        let mut bytes = [b' '; 40];
        for (dst, src) in bytes.iter_mut().zip(model.bytes()) {
            *dst = src;
        }
        for (i, pair) in bytes.chunks(2).enumerate() {
            self.words[27 + i] = u16::from_be_bytes([pair[0], pair[1]]);
        }
    }

    pub fn lba(mut self) -> Self {
        self.words[49] |= 1 << 9;
        self
    }

    pub fn lba48(mut self) -> Self {
        self.words[83] |= 1 << 10;
        self.words[86] |= 1 << 10;
        self
    }

    pub fn geometry(mut self, cylinders: u16, heads: u16, sectors_per_track: u16) -> Self {
        self.words[1] = cylinders;
        self.words[3] = heads;
        self.words[6] = sectors_per_track;
        self
    }

    pub fn sectors28(mut self, sectors: u32) -> Self {
        self.words[60] = sectors as u16;
        self.words[61] = (sectors >> 16) as u16;
        self
    }

    pub fn sectors48(mut self, sectors: u64) -> Self {
        for i in 0..4 {
            self.words[100 + i] = (sectors >> (16 * i)) as u16;
        }
        self
    }

    /// Sets both capacity fields the way a drive of `sectors` reports them.
    pub fn sectors(self, sectors: u64) -> Self {
        let sectors28 = if sectors >= SECTORS28_SENTINEL as u64 { SECTORS28_SENTINEL } else { sectors as u32 };
        self.sectors28(sectors28).sectors48(sectors)
    }

    /// Signs word 255 so all bytes sum to zero.
    pub fn checksum(mut self) -> Self {
        self.checksum = true;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut raw: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        if self.checksum {
            raw[510] = 0xA5;
            let sum = raw[..511].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            raw[511] = sum.wrapping_neg();
        }
        raw
    }
}

// =============================================================================
// PCI configuration space
// =============================================================================

/// Sparse configuration space; unpopulated functions read all ones.
pub struct SimPci {
    functions: Mutex<BTreeMap<PciAddress, [u32; 64]>>,
}

impl SimPci {
    pub fn new() -> Self {
        Self { functions: Mutex::new(BTreeMap::new()) }
    }

    /// Adds a multi-function type 0 header.
    pub fn add_function(&self, addr: PciAddress, vendor: u16, device: u16, class: u16, prog_if: u8) {
        let mut space = [0u32; 64];
        space[0] = (device as u32) << 16 | vendor as u32;
        space[2] = (class as u32) << 16 | (prog_if as u32) << 8;
        space[3] = 0x80 << 16;
        self.functions.lock().insert(addr, space);
    }

    /// Adds a PCI-to-PCI bridge forwarding to `secondary`.
    pub fn add_bridge(&self, addr: PciAddress, vendor: u16, device: u16, secondary: u8) {
        self.add_function(addr, vendor, device, 0x0604, 0);
        let mut functions = self.functions.lock();
        if let Some(space) = functions.get_mut(&addr) {
            space[3] = 0x81 << 16;
            space[6] = (secondary as u32) << 8 | addr.bus as u32;
        }
    }

    pub fn set_bar(&self, addr: PciAddress, index: u8, value: u32) {
        self.write32(addr, 0x10 + index * 4, value);
    }
}

impl PciConfigSpace for SimPci {
    fn read32(&self, addr: PciAddress, offset: u8) -> u32 {
        self.functions
            .lock()
            .get(&addr)
            .map(|space| space[(offset >> 2) as usize])
            .unwrap_or(0xFFFF_FFFF)
    }

    fn write32(&self, addr: PciAddress, offset: u8, value: u32) {
        if let Some(space) = self.functions.lock().get_mut(&addr) {
            space[(offset >> 2) as usize] = value;
        }
    }
}
