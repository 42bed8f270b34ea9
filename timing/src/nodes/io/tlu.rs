//! The trigger logic unit (TLU): HDMI and LEMO trigger inputs with DAC-set thresholds

use super::{
    Error,
    IoLayout,
    IoNode,
    IoResult,
    IoSettings,
    TimingIo,
};
use crate::{
    definitions::BoardRevision,
    i2c::{
        dac::Dac,
        expander::I2cExpander,
    },
    node::{
        Node,
        TimingNode,
    },
    transport::Transport,
};
use std::{
    fmt::Write,
    path::Path,
};
use tracing::info;

pub const LAYOUT: IoLayout = IoLayout {
    uid_bus: "i2c",
    uid_device: "UID_PROM",
    pll_bus: "i2c",
    pll_device: "SI5345",
    clocks: &[("PLL", 1), ("CDR", 1)],
    sfp_buses: &[],
    revision: Some(BoardRevision::TluRev1),
};

const DACS: [&str; 2] = ["DAC1", "DAC2"];

/// All eight outputs of a DAC move together
const DAC_ALL_CHANNELS: u8 = 7;

#[derive(Debug)]
pub struct TluIo<T> {
    io: IoNode<T>,
}

impl<T> TluIo<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(node: Node<T>, settings: IoSettings) -> Self {
        Self {
            io: IoNode::new(node, LAYOUT, settings),
        }
    }

    fn configure_expander(&self, name: &str, outputs: [u8; 2]) -> IoResult<()> {
        let expander = I2cExpander::new(self.io.get_i2c_slave("i2c", name)?);
        for (bank, value) in (0..).zip(outputs) {
            expander.set_inversion(bank, 0x00)?;
            expander.set_io(bank, 0x00)?;
            expander.set_outputs(bank, value)?;
        }
        Ok(())
    }

    /// Set the threshold of every input behind DAC `dac_id` (0 or 1)
    /// # Errors
    /// Returns an error on bad DAC ids or bus errors
    pub fn configure_dac(&self, dac_id: u32, value: u16, internal_ref: bool) -> IoResult<()> {
        let name = usize::try_from(dac_id)
            .ok()
            .and_then(|i| DACS.get(i))
            .ok_or(Error::InvalidDacId(dac_id))?;
        let dac = Dac::new(self.io.get_i2c_slave("i2c", name)?);
        dac.set_internal_ref(internal_ref)?;
        dac.set_dac(DAC_ALL_CHANNELS, value)?;
        info!(dac = name, value, internal_ref, "DAC configured");
        Ok(())
    }
}

impl<T> TimingIo<T> for TluIo<T>
where
    T: Transport,
{
    fn io(&self) -> &IoNode<T> {
        &self.io
    }

    fn reset(&self, config: Option<&Path>) -> IoResult<()> {
        let node = self.io.node();
        self.io.soft_reset()?;
        std::thread::sleep(self.io.settings().soft_reset_delay);

        self.io
            .pulse_resets(&["csr.ctrl.pll_rst", "csr.ctrl.rst_i2c"])?;
        self.io.enable_ax3_switch()?;
        self.io.configure_pll(config, None)?;

        node.write("csr.ctrl.hdmi_edge", 0)?;
        node.write("csr.ctrl.hdmi_inv_o", 0)?;
        node.write("csr.ctrl.hdmi_inv_i", 0)?;
        node.dispatch()?;

        // IC6 and IC7 drive the LEMO and HDMI direction lines
        self.configure_expander("Expander1", [0x00, 0x88])?;
        self.configure_expander("Expander2", [0xf0, 0xf0])?;

        // Route the HDMI clock output
        self.io
            .get_pll()?
            .write_clock_registers(0x0113, &[0x09, 0x33])?;

        info!(board = "tlu", "Reset done");
        Ok(())
    }
}

impl<T> TimingNode for TluIo<T>
where
    T: Transport,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let mut status = String::new();
        let _ = writeln!(status, "{}", self.io.get_state_table("TLU IO state")?);
        status.push_str(&self.io.get_pll_status()?);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        nodes::io::tests::{
            io_hw,
            pll,
            settings,
            write_clock_config,
            Bus,
        },
        transport::mock::i2c::{
            I2cCoreSim,
            RegisterTarget,
        },
    };

    #[test]
    fn test_reset() {
        let dir = tempfile::tempdir().unwrap();
        write_clock_config(dir.path(), BoardRevision::TluRev1);
        let pll = pll();
        let exp1 = RegisterTarget::new().shared();
        let exp2 = RegisterTarget::new().shared();
        let ax3 = RegisterTarget::new().shared();
        let hw = io_hw(
            "",
            vec![Bus {
                name: "i2c",
                base: 0x10,
                slaves: vec![
                    ("SI5345", 0x68),
                    ("AX3_Switch", 0x21),
                    ("Expander1", 0x74),
                    ("Expander2", 0x75),
                ],
                core: I2cCoreSim::new()
                    .with_target(0x68, pll.clone())
                    .with_target(0x21, ax3.clone())
                    .with_target(0x74, exp1.clone())
                    .with_target(0x75, exp2.clone()),
            }],
        );
        let tlu = TluIo::new(Node::new(&hw, "io"), settings(dir.path()));
        tlu.reset(None).unwrap();

        assert_eq!(ax3.lock().unwrap().get(0x01), Some(0x7f));
        let exp1 = exp1.lock().unwrap();
        assert_eq!(exp1.get(0x02), Some(0x00));
        assert_eq!(exp1.get(0x03), Some(0x88));
        assert_eq!(exp1.get(0x07), Some(0x00));
        assert_eq!(exp2.lock().unwrap().get(0x03), Some(0xf0));
        let pll = pll.lock().unwrap();
        assert_eq!(pll.get(0x0113), Some(0x09));
        assert_eq!(pll.get(0x0114), Some(0x33));
        // The HDMI routing lands after the configuration postamble
        let writes = pll.writes();
        assert_eq!(&writes[writes.len() - 2..], &[(0x0113, 0x09), (0x0114, 0x33)]);
    }

    #[test]
    fn test_configure_dac() {
        let dac = RegisterTarget::new().shared();
        let hw = io_hw(
            "",
            vec![Bus {
                name: "i2c",
                base: 0x10,
                slaves: vec![("DAC1", 0x13), ("DAC2", 0x1f)],
                core: I2cCoreSim::new().with_target(0x1f, dac.clone()),
            }],
        );
        let tlu = TluIo::new(Node::new(&hw, "io"), settings(Path::new("/clk")));
        tlu.configure_dac(1, 0x3456, true).unwrap();
        assert_eq!(
            dac.lock().unwrap().writes(),
            &[(0x38, 0x00), (0x39, 0x01), (0x1f, 0x34), (0x20, 0x56)]
        );
        assert!(matches!(
            tlu.configure_dac(2, 0, false),
            Err(Error::InvalidDacId(2))
        ));
        // Nothing answers at DAC1's address
        assert!(tlu.configure_dac(0, 0, false).is_err());
    }
}
