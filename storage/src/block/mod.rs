//! # Block Layer
//!
//! Unified block device abstraction for boot-time storage.
//!
//! ## Design
//!
//! - Devices expose whole-block reads/writes plus a sequential stream
//! - Controllers discover devices lazily: nothing touches hardware until
//!   someone enumerates the class the controller was registered under
//! - A controller whose update fails contributes no devices and stays
//!   dirty, so the next enumeration retries it
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │          Disk adapter / boot loader              │
//! ├──────────────────────────────────────────────────┤
//! │               BlockDeviceRegistry                │
//! │   fixed: controllers + devices                   │
//! │   removable: controllers + devices               │
//! ├──────────────────────────────────────────────────┤
//! │      BlockDevice trait (+ SimpleStream)          │
//! ├────────────────────────┬─────────────────────────┤
//! │  AHCI (SataDrive)      │  IDE/ATAPI (IdeDisk)    │
//! └────────────────────────┴─────────────────────────┘
//! ```

pub mod ahci;
pub mod ata;
pub mod ide;
pub mod stream;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::hal::TimedOut;

pub use stream::{SimpleStream, Stream};

/// Standard sector size
pub const SECTOR_SIZE: usize = 512;

/// Block device errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Hardware did not reach the expected state within its budget
    Timeout,
    /// SATA link is down
    NoLink,
    /// Removable drive reports no medium
    NoMedium,
    /// Drive or channel did not respond
    NotPresent,
    /// Device finished the command with error bits set
    DeviceError {
        /// Status register
        status: u8,
        /// Error register
        error: u8,
    },
    /// Drive wanted to move data the other way
    DirectionMismatch,
    /// IDENTIFY data failed its integrity checksum
    ChecksumMismatch,
    /// Device broke the command protocol
    Protocol,
    /// DMA memory could not be allocated
    OutOfMemory,
    /// Transfer needs more scatter-gather segments than the table holds
    TooManySegments,
    /// Buffer or transfer length is wrong for the request
    InvalidSize,
    /// Request is not aligned to the device's native block
    Misaligned,
    /// Block range lies outside the device
    OutOfRange,
    /// Operation not supported by this device
    Unsupported,
    /// No such device, controller or PCI function
    NotFound,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out"),
            Self::NoLink => write!(f, "no link"),
            Self::NoMedium => write!(f, "no medium"),
            Self::NotPresent => write!(f, "device not present"),
            Self::DeviceError { status, error } => {
                write!(f, "device error (status {:#04x}, error {:#04x})", status, error)
            }
            Self::DirectionMismatch => write!(f, "transfer direction mismatch"),
            Self::ChecksumMismatch => write!(f, "identify checksum mismatch"),
            Self::Protocol => write!(f, "protocol violation"),
            Self::OutOfMemory => write!(f, "out of DMA memory"),
            Self::TooManySegments => write!(f, "too many scatter-gather segments"),
            Self::InvalidSize => write!(f, "invalid transfer size"),
            Self::Misaligned => write!(f, "misaligned transfer"),
            Self::OutOfRange => write!(f, "block range out of bounds"),
            Self::Unsupported => write!(f, "operation not supported"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

impl From<TimedOut> for BlockError {
    fn from(_: TimedOut) -> Self {
        Self::Timeout
    }
}

/// Block device information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    /// Device name (e.g., "Sata port 0", "hdc")
    pub name: String,
    /// Block size in bytes, always a power of two
    pub block_size: u32,
    /// Number of blocks
    pub block_count: u64,
    /// Removable media (ATAPI)
    pub removable: bool,
    /// Model string from IDENTIFY
    pub model: String,
}

/// Block device trait
///
/// Reads and writes return the number of blocks transferred.
pub trait BlockDevice: Send + Sync {
    /// Get device information
    fn info(&self) -> BlockDeviceInfo;

    /// Read `count` blocks starting at `start` into `buf`
    fn read_blocks(&self, start: u64, count: u64, buf: &mut [u8]) -> Result<u64, BlockError>;

    /// Write `count` blocks from `buf` starting at `start`
    fn write_blocks(&self, start: u64, count: u64, buf: &[u8]) -> Result<u64, BlockError>;

    /// Open a single-pass sequential reader over `[start, start + count)`
    fn open_stream(&self, start: u64, count: u64) -> Result<Box<dyn Stream + '_>, BlockError> {
        Ok(Box::new(SimpleStream::new(self, start, count)?))
    }
}

/// Rejects buffers too small for `count` blocks of `block_size` bytes.
///
/// Returns the number of bytes the transfer covers.
pub(crate) fn transfer_len(count: u64, block_size: u32, buf_len: usize) -> Result<usize, BlockError> {
    let bytes = count
        .checked_mul(block_size as u64)
        .and_then(|b| usize::try_from(b).ok())
        .ok_or(BlockError::InvalidSize)?;
    if buf_len < bytes {
        return Err(BlockError::InvalidSize);
    }
    Ok(bytes)
}

/// Something that can discover block devices.
pub trait BlockDeviceController: Send {
    /// Short name for diagnostics.
    fn name(&self) -> &str;

    /// (Re)initializes the hardware and returns the devices found.
    fn update(&mut self) -> Result<Vec<Box<dyn BlockDevice>>, BlockError>;
}

/// Device class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Fixed,
    Removable,
}

/// Index of a controller in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerId {
    pub class: DeviceClass,
    pub index: usize,
}

/// Index of a device in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub class: DeviceClass,
    pub index: usize,
}

struct ControllerEntry {
    controller: Box<dyn BlockDeviceController>,
    need_update: bool,
}

#[derive(Default)]
struct ClassLists {
    devices: Vec<Box<dyn BlockDevice>>,
    controllers: Vec<ControllerEntry>,
}

/// Every block device and controller the firmware knows about.
///
/// Created once at platform init and passed around explicitly. Entries are
/// only ever appended, so iteration order is stable across calls.
#[derive(Default)]
pub struct BlockDeviceRegistry {
    fixed: ClassLists,
    removable: ClassLists,
}

impl BlockDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lists(&self, class: DeviceClass) -> &ClassLists {
        match class {
            DeviceClass::Fixed => &self.fixed,
            DeviceClass::Removable => &self.removable,
        }
    }

    fn lists_mut(&mut self, class: DeviceClass) -> &mut ClassLists {
        match class {
            DeviceClass::Fixed => &mut self.fixed,
            DeviceClass::Removable => &mut self.removable,
        }
    }

    /// Registers a controller; it is updated on the next enumeration of `class`.
    pub fn register_controller(
        &mut self,
        class: DeviceClass,
        controller: Box<dyn BlockDeviceController>,
    ) -> ControllerId {
        let lists = self.lists_mut(class);
        lists.controllers.push(ControllerEntry { controller, need_update: true });
        ControllerId { class, index: lists.controllers.len() - 1 }
    }

    /// Forces the controller to be updated again on the next enumeration.
    pub fn mark_dirty(&mut self, id: ControllerId) -> Result<(), BlockError> {
        let entry = self
            .lists_mut(id.class)
            .controllers
            .get_mut(id.index)
            .ok_or(BlockError::NotFound)?;
        entry.need_update = true;
        Ok(())
    }

    /// Whether the controller still waits for a successful update.
    pub fn needs_update(&self, id: ControllerId) -> Option<bool> {
        self.lists(id.class).controllers.get(id.index).map(|e| e.need_update)
    }

    /// Registers a device in the fixed or removable list, by its own flag.
    pub fn register_device(&mut self, device: Box<dyn BlockDevice>) -> DeviceId {
        let info = device.info();
        let class = if info.removable { DeviceClass::Removable } else { DeviceClass::Fixed };
        log::info!(
            "[block] Registered {} device '{}': {} blocks of {} bytes",
            if info.removable { "removable" } else { "fixed" },
            info.name,
            info.block_count,
            info.block_size
        );

        let lists = self.lists_mut(class);
        lists.devices.push(device);
        DeviceId { class, index: lists.devices.len() - 1 }
    }

    /// Updates every dirty controller of `class`, then returns all devices of `class`.
    ///
    /// A failing controller is logged and skipped; it stays dirty.
    pub fn enumerate(&mut self, class: DeviceClass) -> &[Box<dyn BlockDevice>] {
        let mut discovered = Vec::new();

        for entry in self.lists_mut(class).controllers.iter_mut() {
            if !entry.need_update {
                continue;
            }
            match entry.controller.update() {
                Ok(devices) => {
                    entry.need_update = false;
                    discovered.extend(devices);
                }
                Err(err) => {
                    log::warn!(
                        "[block] Updating storage controller {} failed: {}",
                        entry.controller.name(),
                        err
                    );
                }
            }
        }

        for device in discovered {
            self.register_device(device);
        }

        self.devices(class)
    }

    /// Devices of `class` without touching any controller.
    pub fn devices(&self, class: DeviceClass) -> &[Box<dyn BlockDevice>] {
        &self.lists(class).devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&dyn BlockDevice> {
        self.lists(id.class).devices.get(id.index).map(|d| d.as_ref())
    }

    pub fn controller_count(&self, class: DeviceClass) -> usize {
        self.lists(class).controllers.len()
    }
}
