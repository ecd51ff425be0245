//! # Hardware Access Layer
//!
//! The engines never touch hardware directly. They go through three small
//! seams that the platform (or a simulator) provides:
//!
//! - [`Mmio`]: 32-bit memory-mapped register window (AHCI ABAR)
//! - [`PortIo`]: x86 I/O port space (legacy IDE, PCI mechanism #1)
//! - [`Timer`]: calibrated busy-wait delays
//!
//! All hardware waits are expressed with [`wait_until`] / [`wait_for`], which
//! take a timeout and poll interval and return [`TimedOut`] instead of
//! spinning forever.

use alloc::sync::Arc;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use core::arch::asm;

/// 32-bit register window.
///
/// Offsets are relative to the window base. Implementations must perform
/// exactly one access per call, in program order.
pub trait Mmio: Send + Sync {
    /// Reads the register at `offset`.
    fn read32(&self, offset: usize) -> u32;
    /// Writes `value` to the register at `offset`.
    fn write32(&self, offset: usize, value: u32);
}

/// I/O port space.
pub trait PortIo: Send + Sync {
    fn inb(&self, port: u16) -> u8;
    fn outb(&self, port: u16, value: u8);
    fn inl(&self, port: u16) -> u32;
    fn outl(&self, port: u16, value: u32);

    /// Reads `buf.len() / 2` little-endian words from `port`.
    fn insw(&self, port: u16, buf: &mut [u8]);
    /// Writes `buf.len() / 2` little-endian words to `port`.
    fn outsw(&self, port: u16, buf: &[u8]);
}

/// Busy-wait delay source.
pub trait Timer: Send + Sync {
    /// Spins for at least `us` microseconds.
    fn udelay(&self, us: u64);

    /// Spins for at least `ms` milliseconds.
    fn mdelay(&self, ms: u64) {
        self.udelay(ms * 1000);
    }

    /// Spins for at least `ns` nanoseconds (rounded up to whole microseconds).
    fn ndelay(&self, ns: u64) {
        self.udelay(ns.div_ceil(1000));
    }
}

/// Turns a physical BAR address into a register window.
pub trait MmioMapper: Send + Sync {
    /// Returns `None` when the range cannot be mapped.
    fn map(&self, phys: u64, len: usize) -> Option<Arc<dyn Mmio>>;
}

// =============================================================================
// Bounded polling
// =============================================================================

/// A bounded poll ran out of budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut {
    /// Microseconds spent waiting before giving up.
    pub waited_us: u64,
}

/// Polls `check` until it yields a value or `timeout_us` has elapsed.
///
/// `check` is evaluated once up front and then after every `interval_us`
/// delay, so a zero timeout still gets exactly one look at the hardware.
pub fn wait_until<T>(
    timer: &dyn Timer,
    timeout_us: u64,
    interval_us: u64,
    mut check: impl FnMut() -> Option<T>,
) -> Result<T, TimedOut> {
    let interval = interval_us.max(1);
    let mut waited = 0u64;

    loop {
        if let Some(value) = check() {
            return Ok(value);
        }
        if waited >= timeout_us {
            return Err(TimedOut { waited_us: waited });
        }
        timer.udelay(interval);
        waited += interval;
    }
}

/// [`wait_until`] for plain predicates.
pub fn wait_for(
    timer: &dyn Timer,
    timeout_us: u64,
    interval_us: u64,
    mut ready: impl FnMut() -> bool,
) -> Result<(), TimedOut> {
    wait_until(timer, timeout_us, interval_us, || ready().then_some(()))
}

// =============================================================================
// Real hardware
// =============================================================================

/// Volatile register window at a fixed virtual address.
pub struct VolatileMmio {
    base: usize,
}

impl VolatileMmio {
    /// # Safety
    ///
    /// `base` must point at a device register window that stays mapped for
    /// the lifetime of the returned value and is not aliased by normal memory.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl Mmio for VolatileMmio {
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: constructor contract guarantees the window is mapped.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: constructor contract guarantees the window is mapped.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

/// Maps BARs 1:1, which is how coreboot hands the payload its address space.
pub struct IdentityMapper;

impl MmioMapper for IdentityMapper {
    fn map(&self, phys: u64, _len: usize) -> Option<Arc<dyn Mmio>> {
        let base = usize::try_from(phys).ok()?;
        if base == 0 {
            return None;
        }
        // SAFETY: firmware runs identity mapped with MMIO uncached.
        Some(Arc::new(unsafe { VolatileMmio::new(base) }))
    }
}

/// Direct `in`/`out` instructions.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub struct X86PortIo;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl X86PortIo {
    fn inw(port: u16) -> u16 {
        let value: u16;
        // SAFETY: port input touches no memory; the firmware owns the I/O space
        unsafe {
            asm!("in ax, dx", out("ax") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn outw(port: u16, value: u16) {
        // SAFETY: port output touches no memory; the firmware owns the I/O space
        unsafe {
            asm!("out dx, ax", in("dx") port, in("ax") value, options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl PortIo for X86PortIo {
    fn inb(&self, port: u16) -> u8 {
        let value: u8;
        // SAFETY: port input touches no memory; the firmware owns the I/O space
        unsafe {
            asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn outb(&self, port: u16, value: u8) {
        // SAFETY: port output touches no memory; the firmware owns the I/O space
        unsafe {
            asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
        }
    }

    fn inl(&self, port: u16) -> u32 {
        let value: u32;
        // SAFETY: port input touches no memory; the firmware owns the I/O space
        unsafe {
            asm!("in eax, dx", out("eax") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn outl(&self, port: u16, value: u32) {
        // SAFETY: port output touches no memory; the firmware owns the I/O space
        unsafe {
            asm!("out dx, eax", in("dx") port, in("eax") value, options(nomem, nostack, preserves_flags));
        }
    }

    fn insw(&self, port: u16, buf: &mut [u8]) {
        for word in buf.chunks_exact_mut(2) {
            word.copy_from_slice(&Self::inw(port).to_le_bytes());
        }
    }

    fn outsw(&self, port: u16, buf: &[u8]) {
        for word in buf.chunks_exact(2) {
            Self::outw(port, u16::from_le_bytes([word[0], word[1]]));
        }
    }
}
