//! The FMC timing board, mounted on Enclustra AX3 or KC705 carriers

use super::{
    IoLayout,
    IoNode,
    IoResult,
    IoSettings,
    TimingIo,
};
use crate::{
    definitions::CarrierType,
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
use tracing::{
    debug,
    info,
};

pub const LAYOUT: IoLayout = IoLayout {
    uid_bus: "uid_i2c",
    uid_device: "FMC_UID_PROM",
    pll_bus: "pll_i2c",
    pll_device: "SI5344",
    clocks: &[("PLL", 1), ("CDR", 1)],
    sfp_buses: &["sfp_i2c"],
    revision: None,
};

#[derive(Debug)]
pub struct FmcIo<T> {
    io: IoNode<T>,
}

impl<T> FmcIo<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(node: Node<T>, settings: IoSettings) -> Self {
        Self {
            io: IoNode::new(node, LAYOUT, settings),
        }
    }

    /// Open the carrier's I2C switch, if it has one, so the FMC buses are reachable
    fn enable_carrier_switch(&self) -> IoResult<()> {
        let code = self.io.read_carrier_type()?;
        match CarrierType::from_code(code) {
            Some(CarrierType::EnclustraA35) => self.io.enable_ax3_switch(),
            Some(CarrierType::Kc705) => self.io.enable_kc705_switch(),
            carrier => {
                debug!(code, ?carrier, "No carrier I2C switch to enable");
                Ok(())
            }
        }
    }
}

impl<T> TimingIo<T> for FmcIo<T>
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

        self.io.pulse_resets(&["csr.ctrl.pll_rst"])?;
        self.enable_carrier_switch()?;
        self.io.configure_pll(config, None)?;

        node.write("csr.ctrl.sfp_tx_dis", 0)?;
        node.dispatch()?;
        info!("SFP enabled");

        self.io.reset_lock_monitor()?;
        info!(board = "fmc", "Reset done");
        Ok(())
    }
}

impl<T> TimingNode for FmcIo<T>
where
    T: Transport,
{
    type Error = super::Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let mut status = String::new();
        let _ = writeln!(status, "{}", self.io.get_state_table("FMC IO state")?);
        status.push_str(&self.io.get_pll_status()?);
        Ok(status)
    }
}
