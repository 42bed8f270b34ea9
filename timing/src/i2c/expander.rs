//! Two-bank I2C GPIO expanders (PCA9535/TCA9535 style), used for SFP control lines and board
//! straps

use super::{
    Error,
    I2cResult,
    I2cSlave,
};
use crate::transport::Transport;

const INPUT: u8 = 0x00;
const OUTPUT: u8 = 0x02;
const INVERSION: u8 = 0x04;
const CONFIG: u8 = 0x06;

/// An expander with two 8-bit banks
#[derive(Debug)]
pub struct I2cExpander<T> {
    slave: I2cSlave<T>,
}

fn bank_offset(bank: u8) -> I2cResult<u8> {
    match bank {
        0 | 1 => Ok(bank),
        _ => Err(Error::ExpanderBank(bank)),
    }
}

impl<T> I2cExpander<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(slave: I2cSlave<T>) -> Self {
        Self { slave }
    }

    /// Set the polarity inversion mask of `bank`
    /// # Errors
    /// Returns an error on bad bank ids or bus errors
    pub fn set_inversion(&self, bank: u8, mask: u8) -> I2cResult<()> {
        self.slave.write_i2c(INVERSION + bank_offset(bank)?, mask)
    }

    /// Set the direction of the lines of `bank`, a set bit making the line an input
    /// # Errors
    /// Returns an error on bad bank ids or bus errors
    pub fn set_io(&self, bank: u8, mask: u8) -> I2cResult<()> {
        self.slave.write_i2c(CONFIG + bank_offset(bank)?, mask)
    }

    /// # Errors
    /// Returns an error on bad bank ids or bus errors
    pub fn read_inputs(&self, bank: u8) -> I2cResult<u8> {
        self.slave.read_i2c(INPUT + bank_offset(bank)?)
    }

    /// # Errors
    /// Returns an error on bad bank ids or bus errors
    pub fn set_outputs(&self, bank: u8, values: u8) -> I2cResult<()> {
        self.slave.write_i2c(OUTPUT + bank_offset(bank)?, values)
    }

    /// Read back the direction register of `bank`
    /// # Errors
    /// Returns an error on bad bank ids or bus errors
    pub fn read_outputs_config(&self, bank: u8) -> I2cResult<u8> {
        self.slave.read_i2c(CONFIG + bank_offset(bank)?)
    }

    /// Dump all eight registers
    /// # Errors
    /// Returns an error on bus errors
    pub fn debug(&self) -> I2cResult<Vec<u8>> {
        (0..8).map(|reg| self.slave.read_i2c(reg)).collect()
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
    fn test_banks() {
        let target = RegisterTarget::new().shared();
        let hw = i2c_hw(
            "i2c",
            0,
            &[("Expander", 0x21)],
            I2cCoreSim::new().with_target(0x21, target.clone()),
        );
        let expander = I2cExpander::new(
            I2cMasterNode::new(Node::new(&hw, "i2c"))
                .unwrap()
                .get_slave("Expander")
                .unwrap(),
        );
        expander.set_io(1, 0x0f).unwrap();
        expander.set_outputs(0, 0xa5).unwrap();
        expander.set_inversion(1, 0x01).unwrap();
        {
            let target = target.lock().unwrap();
            assert_eq!(target.get(0x07), Some(0x0f));
            assert_eq!(target.get(0x02), Some(0xa5));
            assert_eq!(target.get(0x05), Some(0x01));
        }
        target.lock().unwrap().set(0x01, 0x3c);
        assert_eq!(expander.read_inputs(1).unwrap(), 0x3c);
        assert_eq!(expander.read_outputs_config(1).unwrap(), 0x0f);
        assert_eq!(
            expander.debug().unwrap(),
            vec![0, 0x3c, 0xa5, 0, 0, 0x01, 0, 0x0f]
        );
        assert!(matches!(expander.set_outputs(2, 0), Err(Error::ExpanderBank(2))));
    }
}
