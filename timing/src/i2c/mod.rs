//! Drivers for the OpenCores I2C master cores in timing firmware and the devices hanging off them
//!
//! The core is driven through five registers below its node: `ps_lo`/`ps_hi` (clock prescale),
//! `ctrl` (core enable), `data` (transmit/receive byte) and `cmd_stat` (command on write, status
//! on read). Every byte moved on the bus is one command followed by a wait for the
//! transfer-in-progress flag to clear.
pub mod dac;
pub mod expander;
pub mod sfp;
pub mod si534x;
pub mod switch;

use crate::{
    node::{
        Node,
        PollError,
    },
    transport::{
        self,
        Deserialize,
        Serialize,
        Transport,
    },
};
use kstring::KString;
use std::{
    collections::HashMap,
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

/// Device registers with a fixed address on their I2C slave
pub trait Address {
    fn addr() -> u16;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error(transparent)]
    Packing(#[from] packed_struct::PackingError),
    #[error(transparent)]
    ClockConfig(#[from] timing_utils::clock_config::Error),
    #[error("No acknowledge from I2C slave at {0:#04x}")]
    Nack(u8),
    #[error("I2C slave at {addr:#04x} didn't acknowledge byte {byte:#04x}")]
    DataNack { addr: u8, byte: u8 },
    #[error("No slave named `{0}` on this I2C bus")]
    UnknownSlave(String),
    #[error("Register address {0:#x} doesn't fit in a single byte")]
    RegisterAddress(u16),
    #[error("Expander bank {0} doesn't exist, only 0 and 1 do")]
    ExpanderBank(u8),
    #[error("DAC channel {0} doesn't exist, only 0 to 7 do")]
    DacChannel(u8),
    #[error("Switch channel {0} doesn't exist")]
    SwitchChannel(u8),
    #[error("The SFP doesn't support {0}")]
    SfpUnsupported(&'static str),
}

pub type I2cResult<T> = Result<T, Error>;

const CTRL_ENABLE: u32 = 0x80;

const CMD_START: u32 = 0x80;
const CMD_STOP: u32 = 0x40;
const CMD_READ: u32 = 0x20;
const CMD_WRITE: u32 = 0x10;
const CMD_NACK: u32 = 0x08;

const STAT_RX_NACK: u32 = 0x80;
const STAT_TIP: u32 = 0x02;

/// How long a single byte transfer may take before we give up on the core
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(100);
const TRANSFER_POLL_INTERVAL: Duration = Duration::from_micros(10);

/// Prescale giving a ~100 kHz bus from the 31.25 MHz IPbus clock
pub const DEFAULT_PRESCALE: u16 = 0x40;

/// An I2C master core and the slaves the address table names on its bus
#[derive(Debug)]
pub struct I2cMasterNode<T> {
    node: Node<T>,
    slaves: HashMap<KString, u8>,
}

impl<T> Clone for I2cMasterNode<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            slaves: self.slaves.clone(),
        }
    }
}

impl<T> I2cMasterNode<T>
where
    T: Transport,
{
    /// Wrap the core at `node`, picking up its slaves from the address table
    /// # Errors
    /// Returns an error if the hardware handle is gone
    pub fn new(node: Node<T>) -> I2cResult<Self> {
        let slaves = node.i2c_slaves("")?;
        Ok(Self { node, slaves })
    }

    #[must_use]
    pub fn node(&self) -> &Node<T> {
        &self.node
    }

    /// Set the bus clock prescaler and enable the core
    /// # Errors
    /// Returns an error on transport errors
    pub fn configure(&self, prescale: u16) -> I2cResult<()> {
        let [hi, lo] = prescale.to_be_bytes();
        self.node.write("ctrl", 0)?;
        self.node.write("ps_lo", lo.into())?;
        self.node.write("ps_hi", hi.into())?;
        self.node.write("ctrl", CTRL_ENABLE)?;
        Ok(self.node.dispatch()?)
    }

    /// Issue `cmd` and wait for the transfer to finish, returning the status word
    fn transfer(&self, cmd: u32) -> I2cResult<u32> {
        self.node.write("cmd_stat", cmd)?;
        Ok(self.node.poll(
            "cmd_stat",
            |s| s & STAT_TIP == 0,
            TRANSFER_TIMEOUT,
            TRANSFER_POLL_INTERVAL,
        )?)
    }

    fn stop(&self) -> I2cResult<()> {
        self.transfer(CMD_STOP)?;
        Ok(())
    }

    /// Put `byte` on the bus, returning whether it was acknowledged
    fn send_byte(&self, byte: u8, cmd: u32) -> I2cResult<bool> {
        self.node.write("data", byte.into())?;
        let status = self.transfer(cmd | CMD_WRITE)?;
        Ok(status & STAT_RX_NACK == 0)
    }

    fn receive_byte(&self, last: bool) -> I2cResult<u8> {
        let cmd = if last {
            CMD_READ | CMD_NACK | CMD_STOP
        } else {
            CMD_READ
        };
        self.transfer(cmd)?;
        Ok((self.node.read("data")? & 0xff) as u8)
    }

    /// Address `addr`, releasing the bus on NACK
    fn start(&self, addr: u8, read: bool) -> I2cResult<()> {
        let byte = (addr << 1) | u8::from(read);
        if self.send_byte(byte, CMD_START)? {
            Ok(())
        } else {
            debug!(addr, "I2C address not acknowledged");
            self.stop()?;
            Err(Error::Nack(addr))
        }
    }

    fn send_bytes(&self, addr: u8, data: &[u8], stop: bool) -> I2cResult<()> {
        for (i, byte) in data.iter().enumerate() {
            let cmd = if stop && i + 1 == data.len() {
                CMD_STOP
            } else {
                0
            };
            if !self.send_byte(*byte, cmd)? {
                if cmd == 0 {
                    self.stop()?;
                }
                return Err(Error::DataNack { addr, byte: *byte });
            }
        }
        Ok(())
    }

    fn receive_bytes(&self, n: usize) -> I2cResult<Vec<u8>> {
        (0..n).map(|i| self.receive_byte(i + 1 == n)).collect()
    }

    /// Write `data` to the slave at `addr` without a register pointer
    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn write_i2c_primitive(&self, addr: u8, data: &[u8], stop: bool) -> I2cResult<()> {
        self.start(addr, false)?;
        if data.is_empty() {
            return if stop { self.stop() } else { Ok(()) };
        }
        self.send_bytes(addr, data, stop)
    }

    /// Read `n` bytes from the slave at `addr` without setting a register pointer first
    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn read_i2c_primitive(&self, addr: u8, n: usize) -> I2cResult<Vec<u8>> {
        self.start(addr, true)?;
        if n == 0 {
            self.stop()?;
            return Ok(vec![]);
        }
        self.receive_bytes(n)
    }

    /// Write `data` into consecutive registers starting at `reg`
    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn write_i2c_array(&self, addr: u8, reg: u8, data: &[u8], stop: bool) -> I2cResult<()> {
        let mut bytes = Vec::with_capacity(data.len() + 1);
        bytes.push(reg);
        bytes.extend_from_slice(data);
        self.write_i2c_primitive(addr, &bytes, stop)
    }

    /// Write a single register
    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn write_i2c(&self, addr: u8, reg: u8, data: u8) -> I2cResult<()> {
        self.write_i2c_array(addr, reg, &[data], true)
    }

    /// Read `n` consecutive registers starting at `reg`, using a repeated start
    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn read_i2c_array(&self, addr: u8, reg: u8, n: usize) -> I2cResult<Vec<u8>> {
        self.write_i2c_primitive(addr, &[reg], false)?;
        self.read_i2c_primitive(addr, n)
    }

    /// Read a single register
    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn read_i2c(&self, addr: u8, reg: u8) -> I2cResult<u8> {
        Ok(self.read_i2c_array(addr, reg, 1)?[0])
    }

    /// Whether a device acknowledges `addr`
    /// # Errors
    /// Returns an error on transport errors
    pub fn ping(&self, addr: u8) -> I2cResult<bool> {
        let ack = self.send_byte(addr << 1, CMD_START)?;
        self.stop()?;
        Ok(ack)
    }

    /// Every 7-bit address that acknowledges
    /// # Errors
    /// Returns an error on transport errors
    pub fn scan(&self) -> I2cResult<Vec<u8>> {
        let mut found = vec![];
        for addr in 0..0x80 {
            if self.ping(addr)? {
                found.push(addr);
            }
        }
        debug!(bus = self.node.path(), ?found, "I2C scan");
        Ok(found)
    }

    /// # Errors
    /// Returns an error if there is no slave called `name`
    pub fn get_slave_address(&self, name: &str) -> I2cResult<u8> {
        self.slaves
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownSlave(name.to_owned()))
    }

    /// Names of the slaves on this bus, sorted
    #[must_use]
    pub fn get_slave_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.slaves.keys().map(ToString::to_string).collect();
        names.sort();
        names
    }

    /// # Errors
    /// Returns an error if there is no slave called `name`
    pub fn get_slave(&self, name: &str) -> I2cResult<I2cSlave<T>> {
        let addr = self.get_slave_address(name)?;
        Ok(I2cSlave::new(self.clone(), addr))
    }
}

/// One device on an I2C bus
#[derive(Debug)]
pub struct I2cSlave<T> {
    master: I2cMasterNode<T>,
    addr: u8,
}

impl<T> Clone for I2cSlave<T> {
    fn clone(&self) -> Self {
        Self {
            master: self.master.clone(),
            addr: self.addr,
        }
    }
}

impl<T> I2cSlave<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(master: I2cMasterNode<T>, addr: u8) -> Self {
        Self { master, addr }
    }

    #[must_use]
    pub fn addr(&self) -> u8 {
        self.addr
    }

    #[must_use]
    pub fn master(&self) -> &I2cMasterNode<T> {
        &self.master
    }

    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn read_i2c(&self, reg: u8) -> I2cResult<u8> {
        self.master.read_i2c(self.addr, reg)
    }

    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn write_i2c(&self, reg: u8, data: u8) -> I2cResult<()> {
        self.master.write_i2c(self.addr, reg, data)
    }

    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn read_i2c_array(&self, reg: u8, n: usize) -> I2cResult<Vec<u8>> {
        self.master.read_i2c_array(self.addr, reg, n)
    }

    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn write_i2c_array(&self, reg: u8, data: &[u8]) -> I2cResult<()> {
        self.master.write_i2c_array(self.addr, reg, data, true)
    }

    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn read_i2c_primitive(&self, n: usize) -> I2cResult<Vec<u8>> {
        self.master.read_i2c_primitive(self.addr, n)
    }

    /// # Errors
    /// Returns an error on NACK or transport errors
    pub fn write_i2c_primitive(&self, data: &[u8]) -> I2cResult<()> {
        self.master.write_i2c_primitive(self.addr, data, true)
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn ping(&self) -> I2cResult<bool> {
        self.master.ping(self.addr)
    }

    /// Read the single byte register `R` lives in
    /// # Errors
    /// Returns an error on NACK, transport errors or if the byte doesn't unpack
    pub fn read_reg<R>(&self) -> I2cResult<R>
    where
        R: Deserialize<Chunk = [u8; 1]> + Address,
    {
        let reg = u8::try_from(R::addr()).map_err(|_| Error::RegisterAddress(R::addr()))?;
        Ok(R::deserialize([self.read_i2c(reg)?])?)
    }

    /// Write `value` into the single byte register it lives in
    /// # Errors
    /// Returns an error on NACK, transport errors or if the value doesn't pack
    pub fn write_reg<R>(&self, value: &R) -> I2cResult<()>
    where
        R: Serialize<Chunk = [u8; 1]> + Address,
    {
        let reg = u8::try_from(R::addr()).map_err(|_| Error::RegisterAddress(R::addr()))?;
        let [byte] = value.serialize()?;
        self.write_i2c(reg, byte)
    }
}
