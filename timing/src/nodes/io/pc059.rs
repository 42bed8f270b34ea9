//! The PC059 fanout board: one upstream SFP and eight fanout SFPs behind a signal multiplexer and
//! an I2C switch

use super::{
    Error,
    IoLayout,
    IoNode,
    IoResult,
    IoSettings,
    TimingIo,
};
use crate::{
    i2c::{
        expander::I2cExpander,
        sfp::Sfp,
        switch::I2cSwitch,
    },
    node::{
        Node,
        TimingNode,
    },
    transport::{
        Transport,
        TransportResult,
    },
};
use std::{
    fmt::Write,
    path::Path,
};
use tracing::{
    debug,
    info,
    warn,
};

pub const LAYOUT: IoLayout = IoLayout {
    uid_bus: "i2c",
    uid_device: "FMC_UID_PROM",
    pll_bus: "i2c",
    pll_device: "SI5345",
    clocks: &[("PLL", 1), ("CDR", 1)],
    sfp_buses: &["usfp_i2c", "i2c"],
    revision: None,
};

/// Number of fanout SFPs
pub const FANOUT_SFPS: u32 = 8;

#[derive(Debug)]
pub struct Pc059Io<T> {
    io: IoNode<T>,
}

impl<T> Pc059Io<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(node: Node<T>, settings: IoSettings) -> Self {
        Self {
            io: IoNode::new(node, LAYOUT, settings),
        }
    }

    /// Reset the board, programming the PLL for fanout `mode` when one is given
    /// (0: local master, 1: HDMI input, 2: SFP input)
    /// # Errors
    /// Returns an error on bus errors or bad configuration files
    pub fn reset_fanout(&self, config: Option<&Path>, fanout_mode: Option<u32>) -> IoResult<()> {
        let node = self.io.node();
        self.io.soft_reset()?;
        std::thread::sleep(self.io.settings().soft_reset_delay);

        self.io.pulse_resets_in_turn(&[
            "csr.ctrl.pll_rst",
            "csr.ctrl.rst_i2c",
            "csr.ctrl.rst_i2cmux",
        ])?;
        // Not every carrier has the switch
        if let Err(e) = self.io.enable_ax3_switch() {
            warn!("AX3 I2C switch not enabled: {e}");
        }

        self.io.configure_pll(config, fanout_mode)?;

        node.write("csr.ctrl.master_src", fanout_mode.unwrap_or(0))?;
        node.write("csr.ctrl.cdr_edge", 1)?;
        node.write("csr.ctrl.sfp_edge", 1)?;
        node.write("csr.ctrl.hdmi_edge", 0)?;
        node.write("csr.ctrl.usfp_edge", 1)?;
        node.write("csr.ctrl.mux", 0)?;
        node.dispatch()?;

        let expander = I2cExpander::new(self.io.get_i2c_slave("i2c", "SFPExpander")?);
        expander.set_inversion(0, 0x00)?;
        expander.set_inversion(1, 0x00)?;
        // Bank 0 drives the TX disables, bank 1 reads the fault lines
        expander.set_io(0, 0x00)?;
        expander.set_io(1, 0xff)?;
        expander.set_outputs(0, 0x00)?;
        info!("SFPs 0-7 enabled");

        self.io.reset_lock_monitor()?;
        info!(board = "pc059", "Reset done");
        Ok(())
    }

    /// Route fanout SFP `chan` to the CDR
    /// # Errors
    /// Returns an error on transport errors or channels that don't fit
    pub fn switch_sfp_mux_channel(&self, chan: u32) -> TransportResult<()> {
        let node = self.io.node();
        node.write("csr.ctrl.mux", chan)?;
        node.dispatch()?;
        debug!(chan, "SFP input mux switched");
        Ok(())
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_active_sfp_mux_channel(&self) -> TransportResult<u32> {
        self.io.node().read("csr.ctrl.mux")
    }

    /// Connect the I2C bus of fanout SFP `chan`
    /// # Errors
    /// Returns an error on bus errors or channels the switch doesn't have
    pub fn switch_sfp_i2c_mux_channel(&self, chan: u32) -> IoResult<()> {
        let channel = u8::try_from(chan).map_err(|_| Error::InvalidSfpId(chan.saturating_add(1)))?;
        self.io.pulse_resets(&["csr.ctrl.rst_i2cmux"])?;
        std::thread::sleep(self.io.settings().i2c_mux_settle);
        I2cSwitch::new(self.io.get_i2c_slave("i2c", "SFP_Switch")?).select_channel(channel)?;
        debug!(chan, "SFP I2C mux switched");
        Ok(())
    }
}

impl<T> TimingIo<T> for Pc059Io<T>
where
    T: Transport,
{
    fn io(&self) -> &IoNode<T> {
        &self.io
    }

    fn reset(&self, config: Option<&Path>) -> IoResult<()> {
        self.reset_fanout(config, None)
    }

    /// SFP 0 is upstream, 1 to 8 are the fanout SFPs
    fn get_sfp(&self, sfp_id: u32) -> IoResult<Sfp<T>> {
        match sfp_id {
            0 => self.io.get_sfp(0),
            1..=FANOUT_SFPS => {
                self.switch_sfp_i2c_mux_channel(sfp_id - 1)?;
                Ok(Sfp::from_master(&self.io.get_i2c_master("i2c")?))
            }
            _ => Err(Error::InvalidSfpId(sfp_id)),
        }
    }

    fn get_sfp_status(&self, sfp_id: u32) -> IoResult<String> {
        let sfp = self.get_sfp(sfp_id)?;
        let header = if sfp_id == 0 {
            "Upstream SFP:".to_owned()
        } else {
            format!("Fanout SFP {}:", sfp_id - 1)
        };
        Ok(format!("{header}\n{}", sfp.get_status()?))
    }
}

impl<T> TimingNode for Pc059Io<T>
where
    T: Transport,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let mut status = String::new();
        let _ = writeln!(status, "{}", self.io.get_state_table("PC059 IO state")?);
        let _ = writeln!(status, "Active SFP mux channel: {}", self.read_active_sfp_mux_channel()?);
        status.push_str(&self.io.get_pll_status()?);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        definitions::BoardRevision,
        nodes::io::tests::{
            io_hw,
            pll,
            settings,
            uid_prom,
            write_clock_config,
            Bus,
        },
        node::tests::with_mock,
        transport::mock::i2c::{
            I2cCoreSim,
            RegisterTarget,
            SwitchTarget,
        },
    };
    use std::sync::{
        Arc,
        Mutex,
    };

    struct Board {
        pc059: Pc059Io<crate::transport::mock::Mock>,
        hw: Arc<Mutex<crate::hw::Hw<crate::transport::mock::Mock>>>,
        pll: Arc<Mutex<RegisterTarget>>,
        expander: Arc<Mutex<RegisterTarget>>,
        switch: Arc<Mutex<SwitchTarget>>,
        _dir: tempfile::TempDir,
    }

    fn board() -> Board {
        let dir = tempfile::tempdir().unwrap();
        write_clock_config(dir.path(), BoardRevision::Pc059Rev1);
        write_clock_config(dir.path(), BoardRevision::Pc059FanoutSfp);
        let pll = pll();
        let expander = RegisterTarget::new().shared();
        let switch = SwitchTarget::new().shared();
        let hw = io_hw(
            "",
            vec![
                Bus {
                    name: "i2c",
                    base: 0x10,
                    slaves: vec![
                        ("FMC_UID_PROM", 0x53),
                        ("SI5345", 0x68),
                        ("SFPExpander", 0x21),
                        ("SFP_Switch", 0x74),
                    ],
                    core: I2cCoreSim::new()
                        .with_target(0x53, uid_prom(0xd880_39d9_80cf))
                        .with_target(0x68, pll.clone())
                        .with_target(0x21, expander.clone())
                        .with_target(0x74, switch.clone()),
                },
                Bus {
                    name: "usfp_i2c",
                    base: 0x20,
                    slaves: vec![],
                    core: I2cCoreSim::new(),
                },
            ],
        );
        let pc059 = Pc059Io::new(Node::new(&hw, "io"), settings(dir.path()));
        Board {
            pc059,
            hw,
            pll,
            expander,
            switch,
            _dir: dir,
        }
    }

    #[test]
    fn test_reset_fanout() {
        let b = board();
        // No AX3 switch on the bus, which only warns
        b.pc059.reset_fanout(None, Some(2)).unwrap();
        // Soft reset, then PLL, I2C and I2C mux resets one after another
        assert_eq!(
            with_mock(&b.hw, |m| m.writes_to(0))[..7],
            [0x1, 0x3, 0x1, 0x5, 0x1, 0x9, 0x1]
        );
        assert_eq!(b.pll.lock().unwrap().get(0x001c), Some(0x01));
        let ctrl = with_mock(&b.hw, |m| m.peek(0));
        assert_eq!(ctrl & 0x3000, 0x2000);
        assert_eq!(ctrl & 0x3_c000, 0x2_c000);
        assert_eq!(ctrl & 0xf00, 0);
        let expander = b.expander.lock().unwrap();
        assert_eq!(
            expander.writes(),
            &[(0x04, 0x00), (0x05, 0x00), (0x06, 0x00), (0x07, 0xff), (0x02, 0x00)]
        );
    }

    #[test]
    fn test_mux() {
        let b = board();
        b.pc059.switch_sfp_mux_channel(5).unwrap();
        assert_eq!(b.pc059.read_active_sfp_mux_channel().unwrap(), 5);
        assert!(b.pc059.switch_sfp_mux_channel(16).is_err());
    }

    #[test]
    fn test_sfp_i2c_mux() {
        let b = board();
        // Fanout SFP 3 sits on switch channel 2
        b.pc059.get_sfp(3).unwrap();
        assert_eq!(b.switch.lock().unwrap().writes(), &[0x04]);
        // I2C mux reset pulsed first
        assert_eq!(with_mock(&b.hw, |m| m.writes_to(0)), vec![0x8, 0x0]);
        assert!(b.pc059.get_sfp(0).is_ok());
        assert!(matches!(b.pc059.get_sfp(9), Err(Error::InvalidSfpId(9))));
    }
}
