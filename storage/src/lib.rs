//! # cbfw storage core
//!
//! Boot-time block storage for the cbfw UEFI payload running on top of
//! coreboot/libpayload. The crate is responsible for exactly three things:
//!
//! 1. **Block layer** (`block`): device/controller registry, lazy controller
//!    initialization on enumeration, and a sequential stream reader
//! 2. **AHCI engine** (`block::ahci`): HBA reset, per-port link bring-up,
//!    command slot/FIS construction, scatter-gather DMA, read/write/flush
//! 3. **IDE/ATAPI engine** (`block::ide`): polled legacy channel probing,
//!    ATA PIO reads and the ATAPI packet protocol with sense-driven retries
//!
//! ## Execution model
//!
//! Everything is single threaded and synchronous. Every wait on hardware is a
//! bounded poll (see [`hal::wait_until`]); running out of budget is a local
//! failure, never a hang. Interrupt masks are programmed but never serviced.
//!
//! ## Hardware access
//!
//! Register access goes through the traits in [`hal`] and [`pci`] so the
//! engines can run against the real machine or a register-level simulation.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod block;
pub mod hal;
pub mod pci;
pub mod platform;

#[cfg(test)]
pub(crate) mod testing;

pub use block::{
    BlockDevice, BlockDeviceController, BlockDeviceInfo, BlockDeviceRegistry, BlockError,
    ControllerId, DeviceClass, DeviceId,
};
