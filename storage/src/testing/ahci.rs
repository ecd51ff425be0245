//! Register-level AHCI HBA model.
//!
//! Command lists, tables and data buffers are host memory, so the model
//! follows the physical addresses the driver programs directly.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use super::{FakeTimer, SimPci};
use crate::block::ahci::{AhciConfig, AhciController, CommandHeader, FisRegH2D, HostCap, PrdtEntry};
use crate::block::ata::command;
use crate::hal::{Mmio, MmioMapper};
use crate::pci::{class_code, PciAddress};

const PORT_OFFSET: usize = 0x100;
const PORT_SIZE: usize = 0x80;
const CMD_TABLE_PRDT: u64 = 0x80;

const CAP_WRITABLE: u32 = HostCap::MPS.bits() | HostCap::SSS.bits() | HostCap::PMP.bits();
const GHC_RESET: u32 = 1 << 0;
const CMD_START: u32 = 1 << 0;
const CMD_SPIN_UP: u32 = 1 << 1;
const CMD_FIS_RX: u32 = 1 << 4;
const CMD_FIS_ON: u32 = 1 << 14;
const CMD_LIST_ON: u32 = 1 << 15;

/// One executed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimCommand {
    pub command: u8,
    pub lba: u64,
    pub count: u32,
    pub write: bool,
    /// PRDT entries the command carried
    pub segments: usize,
}

/// One port and the disk behind it.
#[derive(Debug, Clone, Default)]
pub struct SimPort {
    /// Link comes up once the port is spun up
    pub link: bool,
    pub cmd: u32,
    pub ssts: u32,
    pub ie: u32,
    pub is: u32,
    pub serr: u32,
    pub tfd: u32,
    pub ci: u32,
    pub clb: u64,
    pub fb: u64,
    pub identify: Vec<u8>,
    pub disk: Vec<u8>,
    pub commands: Vec<SimCommand>,
    /// Never complete an issued command
    pub hang: bool,
    /// Never complete commands with this opcode
    pub hang_on: Option<u8>,
    /// Command list and FIS receive engines ignore being stopped
    pub engine_stuck: bool,
    /// Complete commands with this (status, error) task file
    pub fail_with: Option<(u8, u8)>,
}

impl SimPort {
    pub fn disk(identify: Vec<u8>, sectors: u64) -> Self {
        Self {
            link: true,
            tfd: 0x50,
            identify,
            disk: vec![0; sectors as usize * 512],
            ..Default::default()
        }
    }
}

/// HBA register file.
pub struct HbaState {
    pub cap: u32,
    pub ghc: u32,
    pub pi: u32,
    pub reset_stuck: bool,
    /// Model HBAs that lose PI across a global reset
    pub reset_clears_pi: bool,
    pub ports: Vec<SimPort>,
    /// Every register write, in order
    pub writes: Vec<(usize, u32)>,
}

pub struct SimHba {
    state: Mutex<HbaState>,
}

impl SimHba {
    pub fn new(ports: &[(usize, SimPort)]) -> Self {
        let mut all = vec![SimPort::default(); 32];
        let mut pi = 0;
        for (index, port) in ports {
            all[*index] = port.clone();
            pi |= 1 << index;
        }
        // 64-bit, 32 slots, 3 Gbps, 32 ports
        let cap = HostCap::ADDR64.bits() | HostCap::SSS.bits() | (31 << 8) | (2 << 20) | 31;
        Self {
            state: Mutex::new(HbaState {
                cap,
                ghc: 0,
                pi,
                reset_stuck: false,
                reset_clears_pi: false,
                ports: all,
                writes: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, HbaState> {
        self.state.lock()
    }
}

impl Mmio for SimHba {
    fn read32(&self, offset: usize) -> u32 {
        let hba = self.state.lock();
        if offset < PORT_OFFSET {
            return match offset {
                0x00 => hba.cap,
                0x04 => hba.ghc,
                0x0C => hba.pi,
                0x10 => 0x0001_0300,
                _ => 0,
            };
        }

        let port = &hba.ports[(offset - PORT_OFFSET) / PORT_SIZE];
        match (offset - PORT_OFFSET) % PORT_SIZE {
            0x00 => port.clb as u32,
            0x04 => (port.clb >> 32) as u32,
            0x08 => port.fb as u32,
            0x0C => (port.fb >> 32) as u32,
            0x10 => port.is,
            0x14 => port.ie,
            0x18 => port.cmd,
            0x20 => port.tfd,
            0x28 => port.ssts,
            0x30 => port.serr,
            0x38 => port.ci,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut hba = self.state.lock();
        hba.writes.push((offset, value));

        if offset < PORT_OFFSET {
            match offset {
                0x00 => hba.cap = (hba.cap & !CAP_WRITABLE) | (value & CAP_WRITABLE),
                0x04 => {
                    if value & GHC_RESET != 0 && !hba.reset_stuck {
                        hba.ghc = 0;
                        hba.cap &= !CAP_WRITABLE;
                        if hba.reset_clears_pi {
                            hba.pi = 0;
                        }
                    } else {
                        hba.ghc = value;
                    }
                }
                0x0C => hba.pi = value,
                _ => {}
            }
            return;
        }

        let port = &mut hba.ports[(offset - PORT_OFFSET) / PORT_SIZE];
        match (offset - PORT_OFFSET) % PORT_SIZE {
            0x00 => port.clb = (port.clb & !0xFFFF_FFFF) | value as u64,
            0x04 => port.clb = (port.clb & 0xFFFF_FFFF) | (value as u64) << 32,
            0x08 => port.fb = (port.fb & !0xFFFF_FFFF) | value as u64,
            0x0C => port.fb = (port.fb & 0xFFFF_FFFF) | (value as u64) << 32,
            0x10 => port.is &= !value,
            0x14 => port.ie = value,
            0x18 => {
                let mut cmd = value & !(CMD_LIST_ON | CMD_FIS_ON);
                if value & CMD_START != 0 {
                    cmd |= CMD_LIST_ON;
                } else if !port.engine_stuck {
                    // stopping the list engine drops everything issued
                    port.ci = 0;
                }
                if value & CMD_FIS_RX != 0 {
                    cmd |= CMD_FIS_ON;
                }
                if port.engine_stuck {
                    cmd |= port.cmd & (CMD_LIST_ON | CMD_FIS_ON);
                }
                port.cmd = cmd;
                if value & CMD_SPIN_UP != 0 && port.link {
                    port.ssts = 0x123;
                }
            }
            0x30 => port.serr &= !value,
            0x38 => {
                if value & 1 != 0 {
                    port.ci |= 1;
                    if !port.hang {
                        execute(port);
                    }
                }
            }
            _ => {}
        }
    }
}

/// # Safety
///
/// `addr` must be a live host allocation of at least `len` bytes.
unsafe fn host_mem<'a>(addr: u64, len: usize) -> &'a mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(addr as usize as *mut u8, len) }
}

/// Runs the command in slot 0.
fn execute(port: &mut SimPort) {
    // SAFETY: the driver points CLB and the table at its live DMA region
    let header = CommandHeader::read_from(unsafe { host_mem(port.clb, CommandHeader::LEN) });
    let table = unsafe { host_mem(header.ctba, CMD_TABLE_PRDT as usize) };
    let Some(fis) = FisRegH2D::from_bytes(&table[..FisRegH2D::LEN]) else {
        port.tfd = 0x51 | 0x04 << 8;
        port.ci &= !1;
        return;
    };
    let prdt: Vec<PrdtEntry> = (0..header.prdtl())
        .map(|i| {
            let raw = unsafe { host_mem(header.ctba + CMD_TABLE_PRDT + i as u64 * 16, PrdtEntry::LEN) };
            PrdtEntry::read_from(raw)
        })
        .collect();

    port.commands.push(SimCommand {
        command: fis.command,
        lba: fis.lba,
        count: fis.count as u32,
        write: header.is_write(),
        segments: prdt.len(),
    });
    if port.hang_on == Some(fis.command) {
        return;
    }

    if let Some((status, error)) = port.fail_with {
        port.tfd = status as u32 | (error as u32) << 8;
    } else {
        let start = fis.lba as usize * 512;
        let len = fis.count as usize * 512;
        match fis.command {
            command::IDENTIFY_DEVICE => scatter(&prdt, &port.identify),
            command::READ_DMA_EXT => scatter(&prdt, &port.disk[start..start + len]),
            command::WRITE_DMA_EXT => gather(&prdt, &mut port.disk[start..start + len]),
            _ => {}
        }
        port.tfd = 0x50;
    }

    port.is |= 1;
    port.ci &= !1;
}

fn scatter(prdt: &[PrdtEntry], mut data: &[u8]) {
    for entry in prdt {
        let n = (entry.byte_count as usize).min(data.len());
        // SAFETY: PRDT entries describe the caller's buffer
        unsafe { host_mem(entry.addr, n) }.copy_from_slice(&data[..n]);
        data = &data[n..];
    }
}

fn gather(prdt: &[PrdtEntry], mut data: &mut [u8]) {
    for entry in prdt {
        let n = (entry.byte_count as usize).min(data.len());
        // SAFETY: PRDT entries describe the caller's buffer
        data[..n].copy_from_slice(unsafe { host_mem(entry.addr, n) });
        data = &mut data[n..];
    }
}

/// Maps any nonzero BAR onto the simulated HBA.
struct SimMapper {
    hba: Arc<SimHba>,
}

impl MmioMapper for SimMapper {
    fn map(&self, phys: u64, _len: usize) -> Option<Arc<dyn Mmio>> {
        if phys == 0 {
            return None;
        }
        let mmio: Arc<dyn Mmio> = self.hba.clone();
        Some(mmio)
    }
}

/// HBA, PCI function and clock wired together.
pub struct AhciRig {
    pub hba: Arc<SimHba>,
    pub pci: Arc<SimPci>,
    pub dev: PciAddress,
    pub timer: Arc<FakeTimer>,
}

impl AhciRig {
    pub fn new(ports: &[(usize, SimPort)]) -> Self {
        Self::with_vendor(0x8086, ports)
    }

    pub fn with_vendor(vendor: u16, ports: &[(usize, SimPort)]) -> Self {
        let dev = PciAddress::new(0, 0x1F, 2);
        let pci = Arc::new(SimPci::new());
        // LPC bridge in function 0, so bus scans reach the HBA
        pci.add_function(PciAddress::new(0, 0x1F, 0), vendor, 0x2918, 0x0601, 0);
        pci.add_function(dev, vendor, 0x2922, class_code::SATA_AHCI, 0x01);
        pci.set_bar(dev, 5, 0xFEBF_0000);

        Self {
            hba: Arc::new(SimHba::new(ports)),
            pci,
            dev,
            timer: Arc::new(FakeTimer::new()),
        }
    }

    pub fn controller(&self) -> AhciController {
        self.controller_with(AhciConfig::default())
    }

    pub fn port(&self, index: usize) -> SimPort {
        self.hba.state().ports[index].clone()
    }

    pub fn mapper(&self) -> Arc<dyn MmioMapper> {
        Arc::new(SimMapper { hba: self.hba.clone() })
    }

    pub fn controller_with(&self, config: AhciConfig) -> AhciController {
        AhciController::new(self.pci.clone(), self.dev, self.mapper(), self.timer.clone(), config)
    }
}
