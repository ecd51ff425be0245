//! # AHCI (SATA) Storage Driver
//!
//! Polled AHCI driver for the SATA disks attached to an HBA.
//!
//! ## AHCI Architecture
//!
//! - Host Bus Adapter (HBA) manages up to 32 ports
//! - Each port can have one SATA device attached
//! - Commands sent via Command List (32 slots per port, slot 0 used)
//! - Data transferred via Physical Region Descriptor Table (PRDT)
//! - Completion detected by polling the command issue register
//!
//! ## Controller bring-up
//!
//! ```text
//! Reset ──► Register GHC/Ports ──► Per-Port Link Bring-up ──► Ready
//!   │                                   │
//!   └─ reset timeout: no ports          └─ link timeout: port skipped
//! ```
//!
//! Every port that comes up gets one DMA region holding its command list,
//! received-FIS area, command table and scatter-gather list. The region is
//! allocated when the port is started and lives as long as the port.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use core::sync::atomic::{fence, Ordering};
use spin::Mutex;

use super::ata::{command, AtaStatus, IdentifyData, IDENTIFY_SIZE};
use super::{transfer_len, BlockDevice, BlockDeviceController, BlockDeviceInfo, BlockError, SECTOR_SIZE};
use crate::hal::{self, Mmio, MmioMapper, Timer};
use crate::pci::{self, PciAddress, PciConfigSpace};

// =============================================================================
// AHCI Constants
// =============================================================================

/// Maximum ports per HBA
const MAX_PORTS: usize = 32;

/// Maximum commands per port
const MAX_COMMANDS: usize = 32;

/// PRDT entries per command table
pub const MAX_SG: usize = 56;

/// Largest byte count a single PRDT entry can describe
pub const MAX_SG_BYTES: usize = 4 * 1024 * 1024;

/// Size of the register window (generic host control + 32 ports)
const ABAR_SIZE: usize = PORT_OFFSET + MAX_PORTS * PORT_SIZE;

/// JMicron parts need to be switched into AHCI mode by hand
const JMICRON_VENDOR_ID: u16 = 0x197B;

/// Poll interval for command completion and reset (microseconds)
const POLL_US: u64 = 10;

/// Poll interval for link and spin-up state (microseconds)
const LINK_POLL_US: u64 = 1000;

// =============================================================================
// AHCI Register Offsets (Generic Host Control)
// =============================================================================

/// Host Capabilities
const REG_CAP: usize = 0x00;
/// Global Host Control
const REG_GHC: usize = 0x04;
/// Interrupt Status
const REG_IS: usize = 0x08;
/// Ports Implemented
const REG_PI: usize = 0x0C;
/// AHCI Version
const REG_VS: usize = 0x10;
/// Host Capabilities Extended
const REG_CAP2: usize = 0x24;

/// Port registers offset (port n at 0x100 + n*0x80)
const PORT_OFFSET: usize = 0x100;
const PORT_SIZE: usize = 0x80;

// =============================================================================
// Port Register Offsets (relative to port base)
// =============================================================================

/// Port Command List Base Address (Low)
const PX_CLB: usize = 0x00;
/// Port Command List Base Address (High)
const PX_CLBU: usize = 0x04;
/// Port FIS Base Address (Low)
const PX_FB: usize = 0x08;
/// Port FIS Base Address (High)
const PX_FBU: usize = 0x0C;
/// Port Interrupt Status
const PX_IS: usize = 0x10;
/// Port Interrupt Enable
const PX_IE: usize = 0x14;
/// Port Command and Status
const PX_CMD: usize = 0x18;
/// Port Task File Data
const PX_TFD: usize = 0x20;
/// Port SATA Status (SCR0: SStatus)
const PX_SSTS: usize = 0x28;
/// Port SATA Error (SCR1: SError)
const PX_SERR: usize = 0x30;
/// Port Command Issue
const PX_CI: usize = 0x38;

/// SStatus device detection field
const SSTS_DET_MASK: u32 = 0xF;
/// Device present and PHY communication established
const SSTS_DET_PRESENT: u32 = 0x3;

bitflags::bitflags! {
    /// Host Capabilities (CAP) flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostCap: u32 {
        const ADDR64 = 1 << 31;
        const NCQ = 1 << 30;
        /// Mechanical presence switch
        const MPS = 1 << 28;
        /// Staggered spin-up
        const SSS = 1 << 27;
        const ALPM = 1 << 26;
        const LED = 1 << 25;
        const CLO = 1 << 24;
        const NZO = 1 << 19;
        const AHCI_ONLY = 1 << 18;
        /// Port multiplier
        const PMP = 1 << 17;
        const FBSS = 1 << 16;
        const PIO_MULTI = 1 << 15;
        const SLUMBER = 1 << 14;
        const PARTIAL = 1 << 13;
        const CCC = 1 << 7;
        const EMS = 1 << 6;
        const SXS = 1 << 5;
    }

    /// Host Capabilities Extended (CAP2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostCap2: u32 {
        const BOH = 1 << 0;
        const NVMP = 1 << 1;
        const APST = 1 << 2;
    }

    /// Global Host Control (GHC)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostCtl: u32 {
        const RESET = 1 << 0;
        const IRQ_EN = 1 << 1;
        const AHCI_EN = 1 << 31;
    }

    /// Port Command and Status (PxCMD)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortCmd: u32 {
        const START = 1 << 0;
        const SPIN_UP = 1 << 1;
        const POWER_ON = 1 << 2;
        const CLO = 1 << 3;
        const FIS_RX = 1 << 4;
        const FIS_ON = 1 << 14;
        const LIST_ON = 1 << 15;
        const ICC_ACTIVE = 1 << 28;
    }

    /// Port interrupt status/enable bits (PxIS, PxIE)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortIrq: u32 {
        const COLD_PRES = 1 << 31;
        const TF_ERR = 1 << 30;
        const HBUS_ERR = 1 << 29;
        const HBUS_DATA_ERR = 1 << 28;
        const IF_ERR = 1 << 27;
        const IF_NONFATAL = 1 << 26;
        const OVERFLOW = 1 << 24;
        const BAD_PMP = 1 << 23;
        const PHYRDY = 1 << 22;
        const DEV_ILCK = 1 << 7;
        const CONNECT = 1 << 6;
        const SG_DONE = 1 << 5;
        const UNK_FIS = 1 << 4;
        const SDB_FIS = 1 << 3;
        const DMAS_FIS = 1 << 2;
        const PIOS_FIS = 1 << 1;
        const D2H_REG_FIS = 1 << 0;

        const FREEZE = Self::HBUS_ERR.bits()
            | Self::IF_ERR.bits()
            | Self::CONNECT.bits()
            | Self::PHYRDY.bits()
            | Self::UNK_FIS.bits();
        const ERROR = Self::FREEZE.bits() | Self::TF_ERR.bits() | Self::HBUS_DATA_ERR.bits();
        /// Mask programmed into PxIE for every linked port
        const DEFAULT = Self::ERROR.bits()
            | Self::SG_DONE.bits()
            | Self::SDB_FIS.bits()
            | Self::DMAS_FIS.bits()
            | Self::PIOS_FIS.bits()
            | Self::D2H_REG_FIS.bits();
    }
}

impl HostCap {
    /// Command slots per port.
    pub fn command_slots(raw: u32) -> u32 {
        ((raw >> 8) & 0x1F) + 1
    }

    /// Advertised port count. Off by one on some parts; informational only.
    pub fn advertised_ports(raw: u32) -> u32 {
        (raw & 0x1F) + 1
    }

    /// Interface speed support field.
    pub fn speed(raw: u32) -> u32 {
        (raw >> 20) & 0xF
    }
}

// =============================================================================
// Wire formats
// =============================================================================

/// FIS type: Register - Host to Device
const FIS_TYPE_REG_H2D: u8 = 0x27;

/// Device register value selecting LBA addressing
const DEVICE_LBA: u8 = 1 << 6;

/// Host to Device register FIS.
///
/// Packed to and from its 20-byte wire layout explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FisRegH2D {
    pub command: u8,
    pub features: u16,
    /// 48-bit LBA
    pub lba: u64,
    pub device: u8,
    pub count: u16,
    pub control: u8,
}

impl FisRegH2D {
    /// Length of the FIS on the wire
    pub const LEN: usize = 20;

    pub fn new(command: u8) -> Self {
        Self { command, ..Default::default() }
    }

    pub fn identify() -> Self {
        Self::new(command::IDENTIFY_DEVICE)
    }

    pub fn read_dma_ext(lba: u64, count: u16) -> Self {
        Self { command: command::READ_DMA_EXT, lba, count, device: DEVICE_LBA, ..Default::default() }
    }

    pub fn write_dma_ext(lba: u64, count: u16) -> Self {
        Self { command: command::WRITE_DMA_EXT, lba, count, device: DEVICE_LBA, ..Default::default() }
    }

    pub fn flush_cache_ext() -> Self {
        Self::new(command::FLUSH_CACHE_EXT)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut fis = [0u8; Self::LEN];
        let lba = self.lba.to_le_bytes();

        fis[0] = FIS_TYPE_REG_H2D;
        fis[1] = 1 << 7; // command, not control
        fis[2] = self.command;
        fis[3] = self.features as u8;
        fis[4..7].copy_from_slice(&lba[0..3]);
        fis[7] = self.device;
        fis[8..11].copy_from_slice(&lba[3..6]);
        fis[11] = (self.features >> 8) as u8;
        fis[12..14].copy_from_slice(&self.count.to_le_bytes());
        fis[15] = self.control;
        fis
    }

    /// Decodes a command FIS; `None` if it is not an H2D command FIS.
    pub fn from_bytes(fis: &[u8]) -> Option<Self> {
        if fis.len() < Self::LEN || fis[0] != FIS_TYPE_REG_H2D || fis[1] & 0x80 == 0 {
            return None;
        }
        let mut lba = [0u8; 8];
        lba[0..3].copy_from_slice(&fis[4..7]);
        lba[3..6].copy_from_slice(&fis[8..11]);

        Some(Self {
            command: fis[2],
            features: u16::from_le_bytes([fis[3], fis[11]]),
            lba: u64::from_le_bytes(lba),
            device: fis[7],
            count: u16::from_le_bytes([fis[12], fis[13]]),
            control: fis[15],
        })
    }
}

/// Command list entry (32 bytes each, 32 per port).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandHeader {
    /// DW0: FIS length, direction, PRDT length
    pub opts: u32,
    /// DW1: Physical Region Descriptor Byte Count
    pub prdbc: u32,
    /// DW2-3: Command Table Base Address
    pub ctba: u64,
}

impl CommandHeader {
    pub const LEN: usize = 32;

    pub fn new(ctba: u64, fis_len: usize, prdtl: u16, write: bool) -> Self {
        let opts = ((fis_len as u32 >> 2) & 0x1F)
            | if write { 1 << 6 } else { 0 }
            | ((prdtl as u32) << 16);
        Self { opts, prdbc: 0, ctba }
    }

    pub fn fis_len(&self) -> usize {
        ((self.opts & 0x1F) as usize) << 2
    }

    pub fn is_write(&self) -> bool {
        self.opts & (1 << 6) != 0
    }

    pub fn prdtl(&self) -> usize {
        (self.opts >> 16) as usize
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[..Self::LEN].fill(0);
        out[0..4].copy_from_slice(&self.opts.to_le_bytes());
        out[4..8].copy_from_slice(&self.prdbc.to_le_bytes());
        out[8..16].copy_from_slice(&self.ctba.to_le_bytes());
    }

    pub fn read_from(raw: &[u8]) -> Self {
        Self {
            opts: le32(&raw[0..4]),
            prdbc: le32(&raw[4..8]),
            ctba: le32(&raw[8..12]) as u64 | (le32(&raw[12..16]) as u64) << 32,
        }
    }
}

/// Physical Region Descriptor Table Entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrdtEntry {
    /// Data base address
    pub addr: u64,
    /// Bytes described, 1..=4 MiB
    pub byte_count: u32,
    /// Interrupt on completion
    pub interrupt: bool,
}

impl PrdtEntry {
    pub const LEN: usize = 16;

    pub fn new(addr: u64, byte_count: u32, interrupt: bool) -> Self {
        Self { addr, byte_count, interrupt }
    }

    pub fn write_to(&self, out: &mut [u8]) {
        let dbc = (self.byte_count.wrapping_sub(1) & 0x3F_FFFF) | if self.interrupt { 1 << 31 } else { 0 };
        out[0..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..12].fill(0);
        out[12..16].copy_from_slice(&dbc.to_le_bytes());
    }

    pub fn read_from(raw: &[u8]) -> Self {
        let dbc = le32(&raw[12..16]);
        Self {
            addr: le32(&raw[0..4]) as u64 | (le32(&raw[4..8]) as u64) << 32,
            byte_count: (dbc & 0x3F_FFFF) + 1,
            interrupt: dbc & (1 << 31) != 0,
        }
    }
}

fn le32(raw: &[u8]) -> u32 {
    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}

/// Splits `[addr, addr + len)` into PRDT entries of at most 4 MiB.
///
/// Needing more than `max_segments` entries is an error; the transfer is
/// never silently truncated.
pub fn scatter_gather(addr: u64, len: usize, max_segments: usize) -> Result<Vec<PrdtEntry>, BlockError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let count = (len - 1) / MAX_SG_BYTES + 1;
    if count > max_segments {
        log::warn!("[ahci] Transfer of {} bytes needs {} segments (max {})", len, count, max_segments);
        return Err(BlockError::TooManySegments);
    }

    let mut remaining = len;
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let bytes = remaining.min(MAX_SG_BYTES);
        entries.push(PrdtEntry::new(addr + (i * MAX_SG_BYTES) as u64, bytes as u32, false));
        remaining -= bytes;
    }
    Ok(entries)
}

// =============================================================================
// Port DMA memory
// =============================================================================

const CMD_LIST_SIZE: usize = MAX_COMMANDS * CommandHeader::LEN;
const RX_FIS_SIZE: usize = 256;
const CMD_TBL_HDR: usize = 0x80;

const CMD_LIST_OFF: usize = 0;
const RX_FIS_OFF: usize = CMD_LIST_OFF + CMD_LIST_SIZE;
const CMD_TBL_OFF: usize = RX_FIS_OFF + RX_FIS_SIZE;
const CMD_SG_OFF: usize = CMD_TBL_OFF + CMD_TBL_HDR;

/// Command list + received FIS + command table + PRDT
pub const PORT_DMA_SIZE: usize = CMD_SG_OFF + MAX_SG * PrdtEntry::LEN;
pub const PORT_DMA_ALIGN: usize = 2048;

/// Zeroed, pinned, physically contiguous memory owned by one port.
struct DmaRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is exclusively owned; only the owning port touches it.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    fn new(size: usize, align: usize) -> Result<Self, BlockError> {
        let layout = Layout::from_size_align(size, align).map_err(|_| BlockError::InvalidSize)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(BlockError::OutOfMemory)?;
        Ok(Self { ptr, layout })
    }

    /// Bus address; the payload runs identity mapped.
    fn phys(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for layout.size() bytes and uniquely borrowed.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Tunables for the AHCI engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhciConfig {
    /// Largest number of blocks moved by one command.
    ///
    /// Some controllers cap a single transfer, and SSDs do best with
    /// power-of-two sized requests.
    pub max_blocks_per_transfer: u16,
    pub reset_timeout_ms: u64,
    pub deactivate_settle_ms: u64,
    pub link_up_timeout_ms: u64,
    pub spinup_timeout_ms: u64,
    pub flush_timeout_ms: u64,
    pub data_io_timeout_ms: u64,
}

impl Default for AhciConfig {
    fn default() -> Self {
        Self {
            max_blocks_per_transfer: 128,
            reset_timeout_ms: 1000,
            deactivate_settle_ms: 500,
            link_up_timeout_ms: 4,
            spinup_timeout_ms: 10_000,
            flush_timeout_ms: 5000,
            data_io_timeout_ms: 5000,
        }
    }
}

// =============================================================================
// Port
// =============================================================================

/// Data phase of a command.
enum Transfer<'a> {
    None,
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Transfer<'_> {
    fn describe(&mut self) -> (u64, usize, bool) {
        match self {
            Transfer::None => (0, 0, false),
            Transfer::Read(buf) => (buf.as_mut_ptr() as u64, buf.len(), false),
            Transfer::Write(buf) => (buf.as_ptr() as u64, buf.len(), true),
        }
    }
}

fn port_base(index: usize) -> usize {
    PORT_OFFSET + index * PORT_SIZE
}

/// A started AHCI port with its DMA region.
///
/// The region is only freed once the command list and FIS receive engines
/// have stopped; a port whose engines never stop keeps it forever.
pub struct AhciPort {
    index: usize,
    base: usize,
    mmio: Arc<dyn Mmio>,
    timer: Arc<dyn Timer>,
    config: AhciConfig,
    dma: ManuallyDrop<DmaRegion>,
    /// Set when a hung command could not be cleared
    offline: bool,
}

impl AhciPort {
    /// Allocates the port's DMA region, programs it and starts the command engine.
    pub fn start(
        index: usize,
        mmio: Arc<dyn Mmio>,
        timer: Arc<dyn Timer>,
        config: AhciConfig,
    ) -> Result<Self, BlockError> {
        let base = port_base(index);
        let status = mmio.read32(base + PX_SSTS);
        log::debug!("[ahci] Port {} status: {:#x}", index, status);
        if status & SSTS_DET_MASK != SSTS_DET_PRESENT {
            log::warn!("[ahci] No link on port {}", index);
            return Err(BlockError::NoLink);
        }

        let dma = DmaRegion::new(PORT_DMA_SIZE, PORT_DMA_ALIGN).map_err(|err| {
            log::error!("[ahci] No memory for port {} command table", index);
            err
        })?;

        let port = Self { index, base, mmio, timer, config, dma: ManuallyDrop::new(dma), offline: false };
        let clb = port.dma.phys() + CMD_LIST_OFF as u64;
        let fb = port.dma.phys() + RX_FIS_OFF as u64;

        port.write_flush(PX_CLB, clb as u32);
        port.write_flush(PX_CLBU, (clb >> 32) as u32);
        port.write_flush(PX_FB, fb as u32);
        port.write_flush(PX_FBU, (fb >> 32) as u32);
        port.run();

        Ok(port)
    }

    fn run(&self) {
        let cmd = PortCmd::ICC_ACTIVE | PortCmd::FIS_RX | PortCmd::POWER_ON | PortCmd::SPIN_UP | PortCmd::START;
        self.write_flush(PX_CMD, cmd.bits());
    }

    /// Stops the command list engine, then FIS receive.
    ///
    /// Clearing ST also makes the HBA drop every outstanding issue bit.
    fn stop(&self) -> Result<(), BlockError> {
        let settle = self.config.deactivate_settle_ms * 1000;
        let timer = &*self.timer;

        let cmd = self.read_reg(PX_CMD);
        self.write_flush(PX_CMD, cmd & !PortCmd::START.bits());
        hal::wait_for(timer, settle, LINK_POLL_US, || self.read_reg(PX_CMD) & PortCmd::LIST_ON.bits() == 0)?;

        let cmd = self.read_reg(PX_CMD);
        self.write_flush(PX_CMD, cmd & !PortCmd::FIS_RX.bits());
        hal::wait_for(timer, settle, LINK_POLL_US, || self.read_reg(PX_CMD) & PortCmd::FIS_ON.bits() == 0)?;
        Ok(())
    }

    /// Clears a command the device never completed by cycling the engines.
    fn recover(&mut self) {
        match self.stop() {
            Ok(()) => self.run(),
            Err(_) => {
                log::error!("[ahci] Port {} does not stop, taking it offline", self.index);
                self.offline = true;
            }
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn read_reg(&self, reg: usize) -> u32 {
        self.mmio.read32(self.base + reg)
    }

    fn write_reg(&self, reg: usize, value: u32) {
        self.mmio.write32(self.base + reg, value);
    }

    fn write_flush(&self, reg: usize, value: u32) {
        self.write_reg(reg, value);
        self.read_reg(reg);
    }

    fn link_up(&self) -> bool {
        self.read_reg(PX_SSTS) & SSTS_DET_MASK == SSTS_DET_PRESENT
    }

    /// Issues `fis` in slot 0 and polls until the HBA clears the issue bit.
    fn data_io(&mut self, fis: &FisRegH2D, mut transfer: Transfer<'_>, wait_ms: u64) -> Result<(), BlockError> {
        if self.offline || self.read_reg(PX_CI) & 1 != 0 {
            log::warn!("[ahci] Port {} is offline", self.index);
            return Err(BlockError::NotPresent);
        }
        if !self.link_up() {
            log::warn!("[ahci] No link on port {}", self.index);
            return Err(BlockError::NoLink);
        }

        let (addr, len, write) = transfer.describe();
        let segments = scatter_gather(addr, len, MAX_SG)?;
        let table = self.dma.phys() + CMD_TBL_OFF as u64;

        let mem = self.dma.as_mut_slice();
        mem[CMD_TBL_OFF..CMD_SG_OFF].fill(0);
        mem[CMD_TBL_OFF..CMD_TBL_OFF + FisRegH2D::LEN].copy_from_slice(&fis.to_bytes());
        for (i, segment) in segments.iter().enumerate() {
            let offset = CMD_SG_OFF + i * PrdtEntry::LEN;
            segment.write_to(&mut mem[offset..offset + PrdtEntry::LEN]);
        }
        CommandHeader::new(table, FisRegH2D::LEN, segments.len() as u16, write)
            .write_to(&mut mem[CMD_LIST_OFF..CMD_LIST_OFF + CommandHeader::LEN]);

        fence(Ordering::SeqCst);

        let stale = self.read_reg(PX_IS);
        if stale != 0 {
            self.write_reg(PX_IS, stale);
        }
        self.write_flush(PX_CI, 1);

        if hal::wait_for(&*self.timer, wait_ms * 1000, POLL_US, || self.read_reg(PX_CI) & 1 == 0).is_err() {
            log::warn!("[ahci] I/O timeout on port {} (command {:#04x})", self.index, fis.command);
            // the buffer is about to go back to the caller
            self.recover();
            return Err(BlockError::Timeout);
        }

        fence(Ordering::SeqCst);

        let tfd = self.read_reg(PX_TFD);
        let status = AtaStatus::from_bits_retain(tfd as u8);
        if status.intersects(AtaStatus::ERR | AtaStatus::FAULT) {
            log::warn!("[ahci] Port {} command {:#04x} failed, TFD {:#06x}", self.index, fis.command, tfd);
            return Err(BlockError::DeviceError { status: tfd as u8, error: (tfd >> 8) as u8 });
        }
        Ok(())
    }

    /// IDENTIFY DEVICE, with the optional integrity check applied.
    pub fn identify(&mut self) -> Result<IdentifyData, BlockError> {
        let mut raw = vec![0u8; IDENTIFY_SIZE];
        let timeout = self.config.data_io_timeout_ms;
        self.data_io(&FisRegH2D::identify(), Transfer::Read(&mut raw), timeout)
            .map_err(|err| {
                log::warn!("[ahci] Identify command failed on port {}: {}", self.index, err);
                err
            })?;

        let id = IdentifyData::from_bytes(&raw)?;
        id.verify_checksum().map_err(|err| {
            log::warn!("[ahci] ATA identify integrity failed on port {}", self.index);
            err
        })?;
        Ok(id)
    }

    /// FLUSH CACHE EXT
    pub fn flush(&mut self) -> Result<(), BlockError> {
        let timeout = self.config.flush_timeout_ms;
        self.data_io(&FisRegH2D::flush_cache_ext(), Transfer::None, timeout).map_err(|err| {
            log::warn!("[ahci] Flush command failed on port {}: {}", self.index, err);
            err
        })
    }

    fn chunk_bytes(&self) -> usize {
        self.config.max_blocks_per_transfer.max(1) as usize * SECTOR_SIZE
    }

    /// Reads `count` sectors, at most `max_blocks_per_transfer` per command.
    pub fn read(&mut self, start: u64, count: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let bytes = transfer_len(count, SECTOR_SIZE as u32, buf.len())?;
        let chunk = self.chunk_bytes();
        let timeout = self.config.data_io_timeout_ms;
        let mut lba = start;

        for piece in buf[..bytes].chunks_mut(chunk) {
            let blocks = (piece.len() / SECTOR_SIZE) as u16;
            self.data_io(&FisRegH2D::read_dma_ext(lba, blocks), Transfer::Read(piece), timeout)
                .map_err(|err| {
                    log::warn!("[ahci] Read of {} blocks at {} failed on port {}", blocks, lba, self.index);
                    err
                })?;
            lba += blocks as u64;
        }
        Ok(())
    }

    /// Writes `count` sectors; every command is followed by a cache flush.
    pub fn write(&mut self, start: u64, count: u64, buf: &[u8]) -> Result<(), BlockError> {
        let bytes = transfer_len(count, SECTOR_SIZE as u32, buf.len())?;
        let chunk = self.chunk_bytes();
        let timeout = self.config.data_io_timeout_ms;
        let mut lba = start;

        for piece in buf[..bytes].chunks(chunk) {
            let blocks = (piece.len() / SECTOR_SIZE) as u16;
            self.data_io(&FisRegH2D::write_dma_ext(lba, blocks), Transfer::Write(piece), timeout)
                .map_err(|err| {
                    log::warn!("[ahci] Write of {} blocks at {} failed on port {}", blocks, lba, self.index);
                    err
                })?;
            self.flush()?;
            lba += blocks as u64;
        }
        Ok(())
    }
}

impl Drop for AhciPort {
    fn drop(&mut self) {
        if self.stop().is_err() {
            log::error!("[ahci] Port {} still running, leaking its DMA region", self.index);
            return;
        }
        for reg in [PX_CLB, PX_CLBU, PX_FB, PX_FBU] {
            self.write_flush(reg, 0);
        }
        // SAFETY: both engines are idle, nothing on the HBA side points at the region anymore
        unsafe { ManuallyDrop::drop(&mut self.dma) }
    }
}

// =============================================================================
// AHCI Block Device
// =============================================================================

/// A disk behind one AHCI port.
pub struct SataDrive {
    name: String,
    model: String,
    block_count: u64,
    port: Mutex<AhciPort>,
}

impl SataDrive {
    pub fn new(port: AhciPort, block_count: u64, model: String) -> Self {
        Self {
            name: format!("Sata port {}", port.index()),
            model,
            block_count,
            port: Mutex::new(port),
        }
    }

    fn check_range(&self, start: u64, count: u64) -> Result<(), BlockError> {
        match start.checked_add(count) {
            Some(end) if end <= self.block_count => Ok(()),
            _ => Err(BlockError::OutOfRange),
        }
    }
}

impl BlockDevice for SataDrive {
    fn info(&self) -> BlockDeviceInfo {
        BlockDeviceInfo {
            name: self.name.clone(),
            block_size: SECTOR_SIZE as u32,
            block_count: self.block_count,
            removable: false,
            model: self.model.clone(),
        }
    }

    fn read_blocks(&self, start: u64, count: u64, buf: &mut [u8]) -> Result<u64, BlockError> {
        self.check_range(start, count)?;
        self.port.lock().read(start, count, buf)?;
        Ok(count)
    }

    fn write_blocks(&self, start: u64, count: u64, buf: &[u8]) -> Result<u64, BlockError> {
        self.check_range(start, count)?;
        self.port.lock().write(start, count, buf)?;
        Ok(count)
    }
}

// =============================================================================
// AHCI Controller
// =============================================================================

/// State captured once the HBA has been reset.
#[derive(Debug, Clone, Copy, Default)]
struct HbaState {
    cap: u32,
    port_map: u32,
    link_port_map: u32,
}

/// AHCI Host Bus Adapter found on PCI.
///
/// Nothing is touched until [`BlockDeviceController::update`] runs. Once a
/// port backs a [`SataDrive`] the HBA is never reset again; later updates
/// only bring up the ports that have no drive yet.
pub struct AhciController {
    name: String,
    pci: Arc<dyn PciConfigSpace>,
    dev: PciAddress,
    mapper: Arc<dyn MmioMapper>,
    timer: Arc<dyn Timer>,
    config: AhciConfig,
    state: HbaState,
    /// Ports handed out as drives
    claimed: u32,
}

impl AhciController {
    pub fn new(
        pci: Arc<dyn PciConfigSpace>,
        dev: PciAddress,
        mapper: Arc<dyn MmioMapper>,
        timer: Arc<dyn Timer>,
        config: AhciConfig,
    ) -> Self {
        Self {
            name: format!("ahci@{}", dev),
            pci,
            dev,
            mapper,
            timer,
            config,
            state: HbaState::default(),
            claimed: 0,
        }
    }

    /// Ports that reported a link during the last bring-up.
    pub fn link_port_map(&self) -> u32 {
        self.state.link_port_map
    }

    /// Implemented ports, as read back after reset.
    pub fn port_map(&self) -> u32 {
        self.state.port_map
    }

    /// Global reset, AHCI enable and port bring-up.
    fn reset_and_bring_up(&mut self, mmio: &Arc<dyn Mmio>) -> Result<(), BlockError> {
        let cap_save = (mmio.read32(REG_CAP) & (HostCap::MPS | HostCap::PMP).bits()) | HostCap::SSS.bits();
        let pi_save = mmio.read32(REG_PI);

        let ghc = mmio.read32(REG_GHC);
        if ghc & HostCtl::RESET.bits() == 0 {
            write_flush(mmio, REG_GHC, ghc | HostCtl::RESET.bits());
        }
        let timeout = self.config.reset_timeout_ms * 1000;
        hal::wait_for(&*self.timer, timeout, POLL_US, || mmio.read32(REG_GHC) & HostCtl::RESET.bits() == 0)
            .map_err(|_| {
                log::error!("[ahci] {}: controller reset failed", self.name);
                BlockError::Timeout
            })?;

        write_flush(mmio, REG_GHC, HostCtl::AHCI_EN.bits());
        mmio.write32(REG_CAP, cap_save);
        write_flush(mmio, REG_PI, pi_save);

        self.state = HbaState {
            cap: mmio.read32(REG_CAP),
            port_map: mmio.read32(REG_PI),
            link_port_map: 0,
        };
        log::info!(
            "[ahci] cap {:#x} port_map {:#x} n_ports {}",
            self.state.cap,
            self.state.port_map,
            self.state.port_map.count_ones()
        );

        for index in (0..MAX_PORTS).filter(|i| self.state.port_map & (1 << i) != 0) {
            if self.bring_up_port(mmio, index) {
                self.state.link_port_map |= 1 << index;
            }
        }

        let ghc = mmio.read32(REG_GHC);
        mmio.write32(REG_GHC, ghc | HostCtl::IRQ_EN.bits());
        log::debug!("[ahci] HOST_CTL {:#x}", mmio.read32(REG_GHC));

        pci::enable_bus_master(&*self.pci, self.dev);
        self.print_info(mmio);
        Ok(())
    }

    /// Retries link bring-up on the implemented ports that have no drive.
    fn rescan_ports(&mut self, mmio: &Arc<dyn Mmio>) {
        for index in (0..MAX_PORTS).filter(|i| self.state.port_map & !self.claimed & (1 << i) != 0) {
            if self.bring_up_port(mmio, index) {
                self.state.link_port_map |= 1 << index;
            } else {
                self.state.link_port_map &= !(1 << index);
            }
        }
    }

    /// Returns whether the port ended up with a link.
    fn bring_up_port(&self, mmio: &Arc<dyn Mmio>, index: usize) -> bool {
        let base = port_base(index);
        let read = |reg: usize| mmio.read32(base + reg);
        let timer = &*self.timer;

        let active = PortCmd::LIST_ON | PortCmd::FIS_ON | PortCmd::FIS_RX | PortCmd::START;
        let cmd = read(PX_CMD);
        if cmd & active.bits() != 0 {
            log::info!("[ahci] Port {} is active. Deactivating.", index);
            write_flush(mmio, base + PX_CMD, cmd & !active.bits());
            let settle = self.config.deactivate_settle_ms * 1000;
            let idle = (PortCmd::LIST_ON | PortCmd::FIS_ON).bits();
            if hal::wait_for(timer, settle, LINK_POLL_US, || read(PX_CMD) & idle == 0).is_err() {
                log::warn!("[ahci] Port {} still running after {} ms", index, self.config.deactivate_settle_ms);
            }
        }

        write_flush(mmio, base + PX_CMD, (PortCmd::SPIN_UP | PortCmd::FIS_RX).bits());

        let linkup = self.config.link_up_timeout_ms * 1000;
        if hal::wait_for(timer, linkup, LINK_POLL_US, || read(PX_SSTS) & SSTS_DET_MASK == SSTS_DET_PRESENT)
            .is_err()
        {
            log::info!("[ahci] SATA link {} timeout.", index);
            return false;
        }
        log::info!("[ahci] SATA link {} ok.", index);

        let serr = read(PX_SERR);
        if serr != 0 {
            mmio.write32(base + PX_SERR, serr);
        }

        let spinup = self.config.spinup_timeout_ms * 1000;
        let busy = (AtaStatus::BUSY | AtaStatus::DRQ).bits() as u32;
        match hal::wait_for(timer, spinup, LINK_POLL_US, || read(PX_TFD) & busy == 0) {
            Ok(()) => log::debug!("[ahci] Device on port {} spun up", index),
            Err(_) => log::warn!("[ahci] Waiting for device on port {}: timeout", index),
        }

        let serr = read(PX_SERR);
        if serr != 0 {
            log::debug!("[ahci] PORT_SCR_ERR {:#x}", serr);
            mmio.write32(base + PX_SERR, serr);
        }

        let irq = read(PX_IS);
        if irq != 0 {
            log::debug!("[ahci] PORT_IRQ_STAT {:#x}", irq);
            mmio.write32(base + PX_IS, irq);
        }
        mmio.write32(REG_IS, 1 << index);
        mmio.write32(base + PX_IE, PortIrq::DEFAULT.bits());

        let status = read(PX_SSTS);
        log::debug!("[ahci] Port {} status: {:#x}", index, status);
        status & SSTS_DET_MASK == SSTS_DET_PRESENT
    }

    fn print_info(&self, mmio: &Arc<dyn Mmio>) {
        let cap = self.state.cap;
        let cap2 = mmio.read32(REG_CAP2);
        let vs = mmio.read32(REG_VS);

        let speed = match HostCap::speed(cap) {
            1 => "1.5",
            2 => "3",
            3 => "6",
            _ => "?",
        };
        let mode = match pci::class_of(&*self.pci, self.dev) {
            0x0101 => "IDE",
            0x0104 => "RAID",
            0x0106 => "SATA",
            _ => "unknown",
        };
        log::info!(
            "[ahci] AHCI {:04x}.{:04x} {} slots {} ports {} Gbps {:#x} impl {} mode",
            vs >> 16,
            vs & 0xFFFF,
            HostCap::command_slots(cap),
            HostCap::advertised_ports(cap),
            speed,
            self.state.port_map,
            mode
        );

        let mut flags: Vec<&str> = HostCap::from_bits_truncate(cap).iter_names().map(|(name, _)| name).collect();
        flags.extend(HostCap2::from_bits_truncate(cap2).iter_names().map(|(name, _)| name));
        log::info!("[ahci] flags: {}", flags.join(" "));
    }

    /// Starts every linked port and wraps the ones that identify cleanly.
    fn start_linked_ports(&mut self, mmio: &Arc<dyn Mmio>) -> Vec<Box<dyn BlockDevice>> {
        let mut devices: Vec<Box<dyn BlockDevice>> = Vec::new();
        let pending = self.state.link_port_map & !self.claimed;

        for index in (0..MAX_PORTS).filter(|i| pending & (1 << i) != 0) {
            let mut port = match AhciPort::start(index, mmio.clone(), self.timer.clone(), self.config) {
                Ok(port) => port,
                Err(err) => {
                    log::warn!("[ahci] Can not start port {}: {}", index, err);
                    continue;
                }
            };

            let id = match port.identify() {
                Ok(id) => id,
                Err(err) => {
                    log::warn!("[ahci] Can't read port {}'s capacity: {}", index, err);
                    continue;
                }
            };

            let drive = SataDrive::new(port, id.capacity(), id.model());
            log::info!(
                "[ahci] Port {}: {} ({} sectors, {} MB)",
                index,
                drive.model,
                drive.block_count,
                drive.block_count * SECTOR_SIZE as u64 / (1024 * 1024)
            );
            self.claimed |= 1 << index;
            devices.push(Box::new(drive));
        }

        devices
    }
}

fn write_flush(mmio: &Arc<dyn Mmio>, offset: usize, value: u32) {
    mmio.write32(offset, value);
    mmio.read32(offset);
}

impl BlockDeviceController for AhciController {
    fn name(&self) -> &str {
        &self.name
    }

    fn update(&mut self) -> Result<Vec<Box<dyn BlockDevice>>, BlockError> {
        let base = pci::read_bar(&*self.pci, self.dev, 5);
        log::info!("[ahci] {}: MMIO base = {:#x}", self.name, base);
        let mmio = self.mapper.map(base, ABAR_SIZE).ok_or_else(|| {
            log::error!("[ahci] {}: cannot map ABAR {:#x}", self.name, base);
            BlockError::NotFound
        })?;

        if self.claimed != 0 {
            self.rescan_ports(&mmio);
            return Ok(self.start_linked_ports(&mmio));
        }

        if self.pci.read16(self.dev, pci::reg::VENDOR_ID) == JMICRON_VENDOR_ID {
            self.pci.write8(self.dev, 0x41, 0xA1);
        }

        self.reset_and_bring_up(&mmio)?;
        Ok(self.start_linked_ports(&mmio))
    }
}
