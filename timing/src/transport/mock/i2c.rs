//! A simulation of the OpenCores I2C master core as instantiated in timing firmware, with
//! attachable bus targets, so I2C drivers can be tested against the [`Mock`](super::Mock).

use super::Peripheral;
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    fmt::Debug,
    sync::{
        Arc,
        Mutex,
        PoisonError,
    },
};

/// Word offsets of the core's registers
pub const PS_LO: u32 = 0;
pub const PS_HI: u32 = 1;
pub const CTRL: u32 = 2;
pub const DATA: u32 = 3;
pub const CMD_STAT: u32 = 4;

const CMD_START: u32 = 0x80;
const CMD_STOP: u32 = 0x40;
const CMD_READ: u32 = 0x20;
const CMD_WRITE: u32 = 0x10;

const STAT_RX_NACK: u32 = 0x80;
const STAT_BUSY: u32 = 0x40;

const CTRL_ENABLE: u32 = 0x80;

/// A device hanging off the simulated I2C bus
pub trait I2cTarget: Debug + Send {
    /// Called when the target is addressed, `read` being the R/W bit
    fn start(&mut self, _read: bool) {}
    /// A byte written by the master, returns whether the target acknowledged it
    fn write_byte(&mut self, byte: u8) -> bool;
    /// A byte requested by the master
    fn read_byte(&mut self) -> u8;
    /// The master released the bus
    fn stop(&mut self) {}
}

impl<T: I2cTarget> I2cTarget for Arc<Mutex<T>> {
    fn start(&mut self, read: bool) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start(read);
    }

    fn write_byte(&mut self, byte: u8) -> bool {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_byte(byte)
    }

    fn read_byte(&mut self) -> u8 {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .read_byte()
    }

    fn stop(&mut self) {
        self.lock().unwrap_or_else(PoisonError::into_inner).stop();
    }
}

/// The OpenCores I2C master core
#[derive(Debug, Default)]
pub struct I2cCoreSim {
    prescale: u16,
    ctrl: u32,
    tx: u8,
    rx: u8,
    status: u32,
    /// The addressed target and whether it is being read
    active: Option<(u8, bool)>,
    targets: HashMap<u8, Box<dyn I2cTarget>>,
}

impl I2cCoreSim {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a target at the 7-bit address `addr`
    #[must_use]
    pub fn with_target<D>(mut self, addr: u8, target: D) -> Self
    where
        D: I2cTarget + 'static,
    {
        self.targets.insert(addr, Box::new(target));
        self
    }

    #[must_use]
    pub fn prescale(&self) -> u16 {
        self.prescale
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.ctrl & CTRL_ENABLE != 0
    }

    fn command(&mut self, cmd: u32) {
        let mut nack = false;
        if cmd & CMD_WRITE != 0 {
            if cmd & CMD_START != 0 {
                // (Repeated) start, this byte is the address
                let addr = self.tx >> 1;
                let read = self.tx & 1 == 1;
                self.active = None;
                if let Some(target) = self.targets.get_mut(&addr) {
                    target.start(read);
                    self.active = Some((addr, read));
                } else {
                    nack = true;
                }
            } else {
                nack = match self.active {
                    Some((addr, false)) => self
                        .targets
                        .get_mut(&addr)
                        .map_or(true, |t| !t.write_byte(self.tx)),
                    _ => true,
                };
            }
        }
        if cmd & CMD_READ != 0 {
            self.rx = match self.active {
                Some((addr, true)) => self.targets.get_mut(&addr).map_or(0xff, |t| t.read_byte()),
                _ => 0xff,
            };
        }
        if cmd & CMD_STOP != 0 {
            if let Some((addr, _)) = self.active.take() {
                if let Some(target) = self.targets.get_mut(&addr) {
                    target.stop();
                }
            }
        }
        // Transfers complete instantly, so TIP is never seen set
        self.status = if nack { STAT_RX_NACK } else { 0 };
        if self.active.is_some() {
            self.status |= STAT_BUSY;
        }
    }
}

impl Peripheral for I2cCoreSim {
    fn read(&mut self, offset: u32) -> u32 {
        match offset {
            PS_LO => u32::from(self.prescale & 0xff),
            PS_HI => u32::from(self.prescale >> 8),
            CTRL => self.ctrl,
            DATA => u32::from(self.rx),
            CMD_STAT => self.status,
            _ => 0,
        }
    }

    fn write(&mut self, offset: u32, value: u32) {
        let byte = (value & 0xff) as u8;
        match offset {
            PS_LO => self.prescale = (self.prescale & 0xff00) | u16::from(byte),
            PS_HI => self.prescale = (self.prescale & 0x00ff) | (u16::from(byte) << 8),
            CTRL => self.ctrl = value & 0xff,
            DATA => self.tx = byte,
            CMD_STAT => self.command(value),
            _ => (),
        }
    }
}

/// A register-file device: the first byte written after addressing sets the register pointer,
/// subsequent bytes read or write consecutive registers.
///
/// In paged mode, writes to register `0x01` select the page that forms the upper byte of the
/// register address, the way SI534x parts work.
#[derive(Debug, Default)]
pub struct RegisterTarget {
    regs: BTreeMap<u16, u8>,
    paged: bool,
    page: u8,
    pointer: u8,
    pointer_set: bool,
    writes: Vec<(u16, u8)>,
}

impl RegisterTarget {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn paged() -> Self {
        Self {
            paged: true,
            ..Default::default()
        }
    }

    /// Wrap into a shared handle, so the test can inspect the target after handing it to the bus
    #[must_use]
    pub fn shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    pub fn set(&mut self, addr: u16, value: u8) {
        self.regs.insert(addr, value);
    }

    #[must_use]
    pub fn get(&self, addr: u16) -> Option<u8> {
        self.regs.get(&addr).copied()
    }

    /// Every register write in order, page writes included
    #[must_use]
    pub fn writes(&self) -> &[(u16, u8)] {
        &self.writes
    }

    fn full_addr(&self) -> u16 {
        if self.paged {
            u16::from_be_bytes([self.page, self.pointer])
        } else {
            u16::from(self.pointer)
        }
    }
}

impl I2cTarget for RegisterTarget {
    fn start(&mut self, read: bool) {
        if !read {
            self.pointer_set = false;
        }
    }

    fn write_byte(&mut self, byte: u8) -> bool {
        if self.pointer_set {
            let addr = self.full_addr();
            if self.paged && self.pointer == 0x01 {
                self.page = byte;
            }
            self.regs.insert(addr, byte);
            self.writes.push((addr, byte));
            self.pointer = self.pointer.wrapping_add(1);
        } else {
            self.pointer = byte;
            self.pointer_set = true;
        }
        true
    }

    fn read_byte(&mut self) -> u8 {
        let value = if self.paged && self.pointer == 0x01 {
            self.page
        } else {
            self.regs.get(&self.full_addr()).copied().unwrap_or_default()
        };
        self.pointer = self.pointer.wrapping_add(1);
        value
    }
}

/// A device with a single control byte and no register pointer, like an I2C switch
#[derive(Debug, Default)]
pub struct SwitchTarget {
    value: u8,
    writes: Vec<u8>,
}

impl SwitchTarget {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    #[must_use]
    pub fn value(&self) -> u8 {
        self.value
    }

    #[must_use]
    pub fn writes(&self) -> &[u8] {
        &self.writes
    }
}

impl I2cTarget for SwitchTarget {
    fn write_byte(&mut self, byte: u8) -> bool {
        self.value = byte;
        self.writes.push(byte);
        true
    }

    fn read_byte(&mut self) -> u8 {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(core: &mut I2cCoreSim, byte: u8, cmd: u32) -> u32 {
        core.write(DATA, byte.into());
        core.write(CMD_STAT, cmd);
        core.read(CMD_STAT)
    }

    #[test]
    fn test_register_write_read() {
        let target = RegisterTarget::new().shared();
        let mut core = I2cCoreSim::new().with_target(0x50, target.clone());
        // Write 0xAB to register 0x10
        assert_eq!(transfer(&mut core, 0x50 << 1, CMD_START | CMD_WRITE) & STAT_RX_NACK, 0);
        transfer(&mut core, 0x10, CMD_WRITE);
        let stat = transfer(&mut core, 0xAB, CMD_WRITE | CMD_STOP);
        assert_eq!(stat, 0);
        assert_eq!(target.lock().unwrap().get(0x10), Some(0xAB));
        // Point back at 0x10 and read
        transfer(&mut core, 0x50 << 1, CMD_START | CMD_WRITE);
        transfer(&mut core, 0x10, CMD_WRITE);
        transfer(&mut core, (0x50 << 1) | 1, CMD_START | CMD_WRITE);
        core.write(CMD_STAT, CMD_READ | CMD_STOP);
        assert_eq!(core.read(DATA), 0xAB);
    }

    #[test]
    fn test_nack_on_missing_target() {
        let mut core = I2cCoreSim::new();
        let stat = transfer(&mut core, 0x20 << 1, CMD_START | CMD_WRITE);
        assert_eq!(stat & STAT_RX_NACK, STAT_RX_NACK);
    }

    #[test]
    fn test_paging() {
        let target = RegisterTarget::paged().shared();
        let mut core = I2cCoreSim::new().with_target(0x68, target.clone());
        // Select page 0x0B then write offset 0x24
        transfer(&mut core, 0x68 << 1, CMD_START | CMD_WRITE);
        transfer(&mut core, 0x01, CMD_WRITE);
        transfer(&mut core, 0x0B, CMD_WRITE | CMD_STOP);
        transfer(&mut core, 0x68 << 1, CMD_START | CMD_WRITE);
        transfer(&mut core, 0x24, CMD_WRITE);
        transfer(&mut core, 0xC0, CMD_WRITE | CMD_STOP);
        assert_eq!(target.lock().unwrap().get(0x0B24), Some(0xC0));
    }

    #[test]
    fn test_prescale() {
        let mut core = I2cCoreSim::new();
        core.write(PS_LO, 0x34);
        core.write(PS_HI, 0x12);
        core.write(CTRL, 0x80);
        assert_eq!(core.prescale(), 0x1234);
        assert!(core.enabled());
    }
}
