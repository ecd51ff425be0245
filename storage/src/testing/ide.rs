//! Register-level model of the four legacy IDE channels.
//!
//! Each channel holds up to two devices sharing one register window. Writes
//! to the task file reach every device on the channel, reads come from the
//! selected one. A channel with nothing attached floats and reads 0xFF.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::FakeTimer;
use crate::block::ata::{command, scsi};
use crate::block::ide::locate::LEGACY_PORTS;
use crate::block::ide::{IdeChannel, IdeConfig, IdeController, MAX_CHANNELS};
use crate::hal::PortIo;

const STATUS_ERR: u8 = 0x01;
const STATUS_DRQ: u8 = 0x08;
const STATUS_READY: u8 = 0x50;
const STATUS_BUSY: u8 = 0x80;
const ERROR_ABORT: u8 = 0x04;
const ERROR_IDNF: u8 = 0x10;

const REASON_CD: u8 = 0x01;
const REASON_IO: u8 = 0x02;

const CONTROL_SRST: u8 = 0x04;

/// One command that reached a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimIdeCommand {
    pub command: u8,
    pub lba: u64,
    pub count: u32,
    /// Addressed by cylinder/head/sector
    pub chs: bool,
}

#[derive(Debug, Clone, Default)]
enum Phase {
    #[default]
    Idle,
    /// Device is waiting for the 12-byte packet
    AwaitCdb { cdb: Vec<u8>, limit: usize },
    /// Device has data for the host; `drq` bytes remain in the current block
    DataIn { data: Vec<u8>, pos: usize, drq: usize, limit: usize },
}

/// A drive with its own copy of the task file.
#[derive(Debug, Clone, Default)]
pub struct SimIdeDevice {
    atapi: bool,
    identify: Vec<u8>,
    disk: Vec<u8>,
    block_size: usize,
    heads: u64,
    sectors_per_track: u64,

    status: u8,
    error: u8,
    cur: [u8; 5],
    prev: [u8; 5],
    device: u8,
    phase: Phase,
    sense: (u8, u8),
    commands: Vec<SimIdeCommand>,
    packets: Vec<[u8; 12]>,

    /// Fail ATA reads with IDNF
    pub fail_reads: bool,
    pub abort_identify: bool,
    /// Status reads report BUSY forever
    pub busy: bool,
    pub no_medium: bool,
    /// Packet commands left to fail with UNIT ATTENTION
    pub unit_attention: u32,
    /// Packet commands left to fail with "becoming ready"
    pub becoming_ready: u32,
    /// Packet opcodes failed with ILLEGAL REQUEST
    pub reject: Vec<u8>,
    /// Largest byte count per DRQ block the device offers
    pub chunk_limit: Option<usize>,
    /// Report host-to-device in the interrupt reason of data-in phases
    pub wrong_direction: bool,
}

impl SimIdeDevice {
    pub fn ata(identify: Vec<u8>, sectors: u64) -> Self {
        let word = |i: usize| u16::from_le_bytes([identify[2 * i], identify[2 * i + 1]]) as u64;
        let (heads, sectors_per_track) = (word(3), word(6));
        let mut dev = Self {
            identify,
            disk: vec![0; sectors as usize * 512],
            block_size: 512,
            heads,
            sectors_per_track,
            ..Default::default()
        };
        dev.reset();
        dev
    }

    pub fn atapi(identify: Vec<u8>) -> Self {
        let mut dev = Self { atapi: true, identify, block_size: 2048, ..Default::default() };
        dev.reset();
        dev
    }

    /// Fills ATA sector `n` with `n as u8`.
    pub fn patterned(mut self) -> Self {
        for (n, sector) in self.disk.chunks_mut(512).enumerate() {
            sector.fill(n as u8);
        }
        self
    }

    /// Loads a medium whose 512-byte sector `n` is filled with `n as u8`.
    pub fn medium(mut self, blocks: u64, block_size: usize) -> Self {
        self.block_size = block_size;
        self.disk = vec![0; blocks as usize * block_size];
        self.patterned()
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.error = 0x01;
        self.cur = if self.atapi { [0, 1, 1, 0x14, 0xEB] } else { [0, 1, 1, 0, 0] };
        self.prev = [0; 5];
        self.device = 0;
        self.status = if self.atapi { 0 } else { STATUS_READY };
    }

    fn read_status(&self) -> u8 {
        if self.busy {
            STATUS_BUSY
        } else {
            self.status
        }
    }

    fn read_register(&self, reg: u16) -> u8 {
        match reg {
            1 => self.error,
            2..=5 => self.cur[reg as usize - 1],
            6 => self.device,
            7 => self.read_status(),
            _ => 0,
        }
    }

    fn write_register(&mut self, reg: u16, value: u8) {
        match reg {
            1..=5 => {
                let i = reg as usize - 1;
                self.prev[i] = self.cur[i];
                self.cur[i] = value;
            }
            6 => self.device = value,
            _ => {}
        }
    }

    fn abort(&mut self) {
        self.phase = Phase::Idle;
        self.status = STATUS_READY | STATUS_ERR;
        self.error = ERROR_ABORT;
    }

    fn send(&mut self, data: Vec<u8>, limit: usize) {
        self.error = 0;
        self.phase = Phase::DataIn { data, pos: 0, drq: 0, limit };
        self.next_drq();
    }

    /// Opens the next DRQ block or completes the command.
    fn next_drq(&mut self) {
        let Phase::DataIn { data, pos, drq, limit } = &mut self.phase else {
            return;
        };
        let remaining = data.len() - *pos;
        if remaining == 0 {
            self.complete();
            return;
        }

        if self.atapi {
            let mut bytes = remaining.min(*limit);
            if let Some(chunk) = self.chunk_limit {
                bytes = bytes.min(chunk);
            }
            *drq = bytes;
            self.cur[1] = if self.wrong_direction { 0 } else { REASON_IO };
            self.cur[3] = bytes as u8;
            self.cur[4] = (bytes >> 8) as u8;
        } else {
            *drq = remaining;
        }
        self.status = STATUS_READY | STATUS_DRQ;
    }

    fn complete(&mut self) {
        self.phase = Phase::Idle;
        self.status = STATUS_READY;
        if self.atapi {
            self.cur[1] = REASON_IO | REASON_CD;
        }
    }

    fn execute(&mut self, opcode: u8) {
        let [_, nsector, sector, lcyl, hcyl] = self.cur;
        let mut log = SimIdeCommand { command: opcode, lba: 0, count: 0, chs: false };

        match (opcode, self.atapi) {
            (command::IDENTIFY_DEVICE, false) | (command::IDENTIFY_PACKET_DEVICE, true) => {
                self.commands.push(log);
                if self.abort_identify {
                    self.abort();
                } else {
                    let data = self.identify.clone();
                    self.send(data, usize::MAX);
                }
            }
            (command::READ_SECTORS, false) | (command::READ_SECTORS_EXT, false) => {
                if opcode == command::READ_SECTORS_EXT {
                    let [_, hob_nsector, hob_sector, hob_lcyl, hob_hcyl] = self.prev;
                    log.lba = u64::from_le_bytes([sector, lcyl, hcyl, hob_sector, hob_lcyl, hob_hcyl, 0, 0]);
                    log.count = match u16::from_le_bytes([nsector, hob_nsector]) {
                        0 => 65536,
                        n => n as u32,
                    };
                } else if self.device & 0x40 != 0 {
                    log.lba = u64::from_le_bytes([sector, lcyl, hcyl, self.device & 0x0F, 0, 0, 0, 0]);
                    log.count = if nsector == 0 { 256 } else { nsector as u32 };
                } else {
                    let cylinder = u16::from_le_bytes([lcyl, hcyl]) as u64;
                    let head = (self.device & 0x0F) as u64;
                    log.lba = (cylinder * self.heads + head) * self.sectors_per_track + sector as u64 - 1;
                    log.count = if nsector == 0 { 256 } else { nsector as u32 };
                    log.chs = true;
                }
                self.commands.push(log);

                let start = log.lba as usize * 512;
                let end = start + log.count as usize * 512;
                if self.fail_reads || end > self.disk.len() {
                    self.phase = Phase::Idle;
                    self.status = STATUS_READY | STATUS_ERR;
                    self.error = ERROR_IDNF;
                    return;
                }
                let data = self.disk[start..end].to_vec();
                self.send(data, usize::MAX);
            }
            (command::PACKET, true) => {
                self.commands.push(log);
                self.error = 0;
                self.phase = Phase::AwaitCdb { cdb: Vec::new(), limit: u16::from_le_bytes([lcyl, hcyl]) as usize };
                self.cur[1] = REASON_CD;
                self.status = 0x40 | STATUS_DRQ;
            }
            _ => {
                self.commands.push(log);
                self.abort();
            }
        }
    }

    fn check_condition(&mut self, key: u8, asc: u8) {
        self.sense = (key, asc);
        self.phase = Phase::Idle;
        self.status = STATUS_READY | STATUS_ERR;
        self.error = key << 4;
        self.cur[1] = REASON_IO | REASON_CD;
    }

    fn execute_packet(&mut self, cdb: [u8; 12], limit: usize) {
        self.packets.push(cdb);
        let opcode = cdb[0];

        if opcode == scsi::REQUEST_SENSE {
            let mut sense = vec![0u8; 18];
            sense[0] = 0x70;
            sense[2] = self.sense.0;
            sense[7] = 10;
            sense[12] = self.sense.1;
            self.sense = (0, 0);
            self.send(sense, limit);
            return;
        }

        if self.unit_attention > 0 {
            self.unit_attention -= 1;
            return self.check_condition(0x06, 0x29);
        }
        if self.becoming_ready > 0 {
            self.becoming_ready -= 1;
            return self.check_condition(0x02, 0x04);
        }
        if self.no_medium {
            return self.check_condition(0x02, 0x3A);
        }
        if self.reject.contains(&opcode) {
            return self.check_condition(0x05, 0x24);
        }

        let blocks = (self.disk.len() / self.block_size) as u32;
        match opcode {
            scsi::TEST_UNIT_READY | scsi::START_STOP_UNIT | scsi::PREVENT_ALLOW_MEDIUM_REMOVAL => self.complete(),
            scsi::READ_CAPACITY => {
                let mut data = blocks.saturating_sub(1).to_be_bytes().to_vec();
                data.extend_from_slice(&(self.block_size as u32).to_be_bytes());
                self.send(data, limit);
            }
            scsi::READ_10 => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as usize;
                let count = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
                let (start, end) = (lba * self.block_size, (lba + count) * self.block_size);
                if end > self.disk.len() {
                    return self.check_condition(0x05, 0x21);
                }
                let data = self.disk[start..end].to_vec();
                self.send(data, limit);
            }
            _ => self.check_condition(0x05, 0x20),
        }
    }

    fn data_in(&mut self, buf: &mut [u8]) {
        let Phase::DataIn { data, pos, drq, .. } = &mut self.phase else {
            buf.fill(0);
            return;
        };
        let n = buf.len().min(*drq);
        buf[..n].copy_from_slice(&data[*pos..*pos + n]);
        buf[n..].fill(0);
        *pos += n;
        *drq -= n;
        if *drq == 0 {
            self.next_drq();
        }
    }

    fn data_out(&mut self, buf: &[u8]) {
        let Phase::AwaitCdb { cdb, limit } = &mut self.phase else {
            return;
        };
        cdb.extend_from_slice(buf);
        if cdb.len() >= 12 {
            let mut packet = [0u8; 12];
            packet.copy_from_slice(&cdb[..12]);
            let limit = *limit;
            self.execute_packet(packet, limit);
        }
    }
}

#[derive(Default)]
struct SimChannel {
    devices: [Option<SimIdeDevice>; 2],
    selected: usize,
    accesses: usize,
}

impl SimChannel {
    fn floating(&self) -> bool {
        self.devices.iter().all(Option::is_none)
    }

    fn selected(&mut self) -> Option<&mut SimIdeDevice> {
        self.devices[self.selected].as_mut()
    }

    fn read(&mut self, reg: u16) -> u8 {
        if self.floating() {
            return 0xFF;
        }
        self.selected().map_or(0, |dev| dev.read_register(reg))
    }

    fn write(&mut self, reg: u16, value: u8) {
        match reg {
            1..=5 => self.devices.iter_mut().flatten().for_each(|dev| dev.write_register(reg, value)),
            6 => {
                self.selected = ((value >> 4) & 1) as usize;
                self.devices.iter_mut().flatten().for_each(|dev| dev.write_register(reg, value));
            }
            7 => {
                if let Some(dev) = self.selected() {
                    dev.execute(value);
                }
            }
            _ => {}
        }
    }

    fn write_control(&mut self, value: u8) {
        if value & CONTROL_SRST != 0 {
            self.devices.iter_mut().flatten().for_each(SimIdeDevice::reset);
            self.selected = 0;
        }
    }
}

/// Which register window a port belongs to.
enum Decoded {
    Command(usize, u16),
    Control(usize),
}

/// Port I/O decoder over the four channels.
pub struct SimIdeBus {
    channels: Mutex<[SimChannel; MAX_CHANNELS]>,
}

impl SimIdeBus {
    pub fn new() -> Self {
        Self { channels: Mutex::new(Default::default()) }
    }

    pub fn attach(&self, channel: usize, unit: usize, device: SimIdeDevice) {
        self.channels.lock()[channel].devices[unit] = Some(device);
    }

    pub fn with_device(&self, channel: usize, unit: usize, f: impl FnOnce(&mut SimIdeDevice)) {
        if let Some(dev) = self.channels.lock()[channel].devices[unit].as_mut() {
            f(dev);
        }
    }

    /// Port accesses that hit `channel`'s register windows.
    pub fn accesses(&self, channel: usize) -> usize {
        self.channels.lock()[channel].accesses
    }

    pub fn commands(&self, channel: usize, unit: usize) -> Vec<SimIdeCommand> {
        self.channels.lock()[channel].devices[unit].as_ref().map(|d| d.commands.clone()).unwrap_or_default()
    }

    pub fn packets(&self, channel: usize, unit: usize) -> Vec<[u8; 12]> {
        self.channels.lock()[channel].devices[unit].as_ref().map(|d| d.packets.clone()).unwrap_or_default()
    }

    fn decode(port: u16) -> Option<Decoded> {
        LEGACY_PORTS.iter().enumerate().find_map(|(i, ports)| {
            if (ports.command..ports.command + 8).contains(&port) {
                Some(Decoded::Command(i, port - ports.command))
            } else if port == ports.control {
                Some(Decoded::Control(i))
            } else {
                None
            }
        })
    }
}

impl PortIo for SimIdeBus {
    fn inb(&self, port: u16) -> u8 {
        let mut channels = self.channels.lock();
        match Self::decode(port) {
            Some(Decoded::Command(i, reg)) => {
                channels[i].accesses += 1;
                channels[i].read(reg)
            }
            // alternate status
            Some(Decoded::Control(i)) => {
                channels[i].accesses += 1;
                channels[i].read(7)
            }
            None => 0xFF,
        }
    }

    fn outb(&self, port: u16, value: u8) {
        let mut channels = self.channels.lock();
        match Self::decode(port) {
            Some(Decoded::Command(i, reg)) => {
                channels[i].accesses += 1;
                channels[i].write(reg, value);
            }
            Some(Decoded::Control(i)) => {
                channels[i].accesses += 1;
                channels[i].write_control(value);
            }
            None => {}
        }
    }

    fn inl(&self, _port: u16) -> u32 {
        0xFFFF_FFFF
    }

    fn outl(&self, _port: u16, _value: u32) {}

    fn insw(&self, port: u16, buf: &mut [u8]) {
        let mut channels = self.channels.lock();
        let Some(Decoded::Command(i, 0)) = Self::decode(port) else {
            buf.fill(0xFF);
            return;
        };
        channels[i].accesses += 1;
        match channels[i].selected() {
            Some(dev) => dev.data_in(buf),
            None => buf.fill(0),
        }
    }

    fn outsw(&self, port: u16, buf: &[u8]) {
        let mut channels = self.channels.lock();
        let Some(Decoded::Command(i, 0)) = Self::decode(port) else {
            return;
        };
        channels[i].accesses += 1;
        if let Some(dev) = channels[i].selected() {
            dev.data_out(buf);
        }
    }
}

/// Bus, clock and a test-friendly engine configuration.
pub struct IdeRig {
    pub bus: Arc<SimIdeBus>,
    pub timer: Arc<FakeTimer>,
    pub config: IdeConfig,
}

impl IdeRig {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(SimIdeBus::new()),
            timer: Arc::new(FakeTimer::new()),
            config: IdeConfig { lba48: true, pci_discovery: false, pcmcia_cf: false, ..IdeConfig::default() },
        }
    }

    pub fn channel(&self, index: usize) -> IdeChannel {
        IdeChannel::new(index, LEGACY_PORTS[index], self.bus.clone(), self.timer.clone(), self.config)
    }

    pub fn controller(&self) -> IdeController {
        self.controller_with(self.config)
    }

    pub fn controller_with(&self, config: IdeConfig) -> IdeController {
        IdeController::new(self.bus.clone(), self.timer.clone(), None, config)
    }
}
