//! The AD5665R-style quad/octal DACs setting the TLU input thresholds

use super::{
    Error,
    I2cResult,
    I2cSlave,
};
use crate::transport::Transport;
use tracing::debug;

const CMD_INTERNAL_REF: u8 = 0x38;
/// Write to and update a single channel
const CMD_WRITE_UPDATE: u8 = 0x18;
const MAX_CHANNEL: u8 = 7;

#[derive(Debug)]
pub struct Dac<T> {
    slave: I2cSlave<T>,
}

impl<T> Dac<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(slave: I2cSlave<T>) -> Self {
        Self { slave }
    }

    /// Switch between the internal and an external voltage reference
    /// # Errors
    /// Returns an error on bus errors
    pub fn set_internal_ref(&self, internal: bool) -> I2cResult<()> {
        self.slave
            .write_i2c_array(CMD_INTERNAL_REF, &[0x00, u8::from(internal)])
    }

    /// Set channel `chan` to `code`
    /// # Errors
    /// Returns an error on channels above 7 or bus errors
    pub fn set_dac(&self, chan: u8, code: u16) -> I2cResult<()> {
        if chan > MAX_CHANNEL {
            return Err(Error::DacChannel(chan));
        }
        debug!(addr = self.slave.addr(), chan, code, "Setting DAC");
        self.slave
            .write_i2c_array(CMD_WRITE_UPDATE | chan, &code.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        i2c::{
            tests::i2c_hw,
            I2cMasterNode,
        },
        node::Node,
        transport::mock::i2c::{
            I2cCoreSim,
            RegisterTarget,
        },
    };

    #[test]
    fn test_dac() {
        let target = RegisterTarget::new().shared();
        let hw = i2c_hw(
            "i2c",
            0,
            &[("DAC1", 0x1F)],
            I2cCoreSim::new().with_target(0x1F, target.clone()),
        );
        let dac = Dac::new(
            I2cMasterNode::new(Node::new(&hw, "i2c"))
                .unwrap()
                .get_slave("DAC1")
                .unwrap(),
        );
        dac.set_internal_ref(true).unwrap();
        dac.set_dac(3, 0x1234).unwrap();
        assert!(matches!(dac.set_dac(8, 0), Err(Error::DacChannel(8))));
        assert_eq!(
            target.lock().unwrap().writes(),
            &[(0x38, 0x00), (0x39, 0x01), (0x1B, 0x12), (0x1C, 0x34)]
        );
    }
}
