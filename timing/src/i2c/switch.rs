//! PCA9548-style I2C multiplexers: one control byte, one enable bit per downstream channel

use super::{
    Error,
    I2cResult,
    I2cSlave,
};
use crate::transport::Transport;
use tracing::debug;

/// Channels one control byte can address
pub const MAX_CHANNELS: u8 = 8;

#[derive(Debug)]
pub struct I2cSwitch<T> {
    slave: I2cSlave<T>,
    channels: u8,
}

impl<T> I2cSwitch<T>
where
    T: Transport,
{
    /// A switch with 8 downstream channels
    #[must_use]
    pub fn new(slave: I2cSlave<T>) -> Self {
        Self::with_channels(slave, MAX_CHANNELS)
    }

    /// A switch with `channels` downstream channels, at most [`MAX_CHANNELS`]
    #[must_use]
    pub fn with_channels(slave: I2cSlave<T>, channels: u8) -> Self {
        Self {
            slave,
            channels: channels.min(MAX_CHANNELS),
        }
    }

    /// Connect `chan`, and only `chan`, to the upstream bus
    /// # Errors
    /// Returns an error on channels the switch doesn't have or bus errors
    pub fn select_channel(&self, chan: u8) -> I2cResult<()> {
        if chan >= self.channels {
            return Err(Error::SwitchChannel(chan));
        }
        debug!(addr = self.slave.addr(), chan, "Selecting I2C switch channel");
        self.slave.write_i2c_primitive(&[1 << chan])
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn disable_all(&self) -> I2cResult<()> {
        self.slave.write_i2c_primitive(&[0])
    }

    /// The enable mask of the downstream channels
    /// # Errors
    /// Returns an error on bus errors
    pub fn read_channels(&self) -> I2cResult<u8> {
        Ok(self.slave.read_i2c_primitive(1)?[0])
    }
}
