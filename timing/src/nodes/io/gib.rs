//! The GPS interface board (GIB): GPS-disciplined clock, IRIG-B and PPS inputs, with most of its
//! I2C devices behind a seven channel switch

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
        expander::I2cExpander,
        switch::I2cSwitch,
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
use tracing::{
    debug,
    info,
};

pub const LAYOUT: IoLayout = IoLayout {
    uid_bus: "i2c",
    uid_device: "UID_PROM",
    pll_bus: "i2c",
    pll_device: "ClkGen",
    clocks: &[
        ("GPS Clock", 1),
        ("Rec Clock 0", 1),
        ("Rec Clock 1", 1),
        ("Irig-b", 64),
        ("PPS", 64),
        ("SYNC", 64),
    ],
    sfp_buses: &[],
    revision: Some(BoardRevision::GibRev1),
};

const SWITCH_CHANNELS: u8 = 7;

/// The switch channel with the PLL, expanders and temperature sensor
const MAIN_CHANNEL: u8 = 0;

/// Active-low resets of the I2C switch, I2C expanders and clock generator
const HW_RESETS: [&str; 3] = [
    "csr.ctrl.i2c_sw_rst",
    "csr.ctrl.i2c_exten_rst",
    "csr.ctrl.clk_gen_rst",
];

/// I2C general call address
const GENERAL_CALL: u8 = 0x00;

/// Temperature from an LM75-style sensor's left-justified 9 bit reading, in C
fn temperature_from_raw(bytes: [u8; 2]) -> f64 {
    f64::from(i16::from_be_bytes(bytes) >> 7) * 0.5
}

#[derive(Debug)]
pub struct GibIo<T> {
    io: IoNode<T>,
}

impl<T> GibIo<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(node: Node<T>, settings: IoSettings) -> Self {
        Self {
            io: IoNode::new(node, LAYOUT, settings),
        }
    }

    /// Connect switch channel `chan` (0 to 6) to the main I2C bus
    /// # Errors
    /// Returns an error on bus errors or channels the switch doesn't have
    pub fn select_i2c_channel(&self, chan: u8) -> IoResult<()> {
        I2cSwitch::with_channels(self.io.get_i2c_slave("i2c", "I2CSwitch")?, SWITCH_CHANNELS)
            .select_channel(chan)?;
        std::thread::sleep(self.io.settings().i2c_mux_settle);
        Ok(())
    }

    /// Board temperature in C
    /// # Errors
    /// Returns an error on bus errors
    pub fn read_temperature(&self) -> IoResult<f64> {
        self.select_i2c_channel(MAIN_CHANNEL)?;
        let sensor = self.io.get_i2c_slave("i2c", "TempSensor")?;
        sensor.write_i2c_primitive(&[0x00])?;
        let bytes = sensor.read_i2c_primitive(2)?;
        let temp = temperature_from_raw([bytes[0], bytes[1]]);
        debug!(raw = ?bytes, temp, "Board temperature");
        Ok(temp)
    }

    fn hw_reset(&self) -> IoResult<()> {
        let node = self.io.node();
        for line in HW_RESETS {
            node.write(line, 0)?;
        }
        node.dispatch()?;
        std::thread::sleep(self.io.settings().i2c_mux_settle);
        for line in HW_RESETS {
            node.write(line, 1)?;
        }
        node.dispatch()?;
        Ok(())
    }

    fn wake_i2c(&self) -> IoResult<()> {
        // Nobody has to acknowledge the general call
        if let Err(e) = self
            .io
            .get_i2c_master("i2c")?
            .write_i2c_primitive(GENERAL_CALL, &[0x00], true)
        {
            debug!("General call not acknowledged: {e}");
        }
        self.io.enable_ax3_switch()
    }

    fn setup_gps_clock(&self) -> IoResult<()> {
        let node = self.io.node();
        // Enable is active low, both filter selects low is full bandwidth
        node.write("csr.ctrl.gps_clk_en", 0)?;
        node.write("csr.ctrl.gps_clk_fltr_a", 0)?;
        node.write("csr.ctrl.gps_clk_fltr_b", 0)?;
        node.dispatch()?;
        Ok(())
    }

    fn setup_expanders(&self) -> IoResult<()> {
        let exp0 = I2cExpander::new(self.io.get_i2c_slave("i2c", "SFPExpander0")?);
        let exp1 = I2cExpander::new(self.io.get_i2c_slave("i2c", "SFPExpander1")?);
        for bank in 0..2 {
            exp0.set_inversion(bank, 0x00)?;
            exp1.set_inversion(bank, 0x00)?;
        }
        exp0.set_io(0, 0x00)?;
        exp0.set_io(1, 0x00)?;
        exp1.set_io(0, 0x00)?;
        exp1.set_io(1, 0xff)?;
        // SFP TX disables
        exp1.set_outputs(1, 0xf0)?;
        Ok(())
    }
}

impl<T> TimingIo<T> for GibIo<T>
where
    T: Transport,
{
    fn io(&self) -> &IoNode<T> {
        &self.io
    }

    fn reset(&self, config: Option<&Path>) -> IoResult<()> {
        self.io.soft_reset()?;
        std::thread::sleep(self.io.settings().soft_reset_delay);

        self.hw_reset()?;
        self.wake_i2c()?;
        self.setup_gps_clock()?;
        self.select_i2c_channel(MAIN_CHANNEL)?;
        self.setup_expanders()?;
        self.io.configure_pll(config, None)?;

        info!(board = "gib", "Reset done");
        Ok(())
    }
}

impl<T> TimingNode for GibIo<T>
where
    T: Transport,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let mut status = String::new();
        let _ = writeln!(status, "{}", self.io.get_state_table("GIB IO state")?);
        let _ = writeln!(status, "Board temperature: {:.1} C", self.read_temperature()?);
        status.push_str(&self.io.get_pll_status()?);
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        node::tests::with_mock,
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
            SwitchTarget,
        },
    };

    const EXTRA: &str = "
?register io.csr.ctrl.i2c_sw_rst 0x5 0x1 1
?register io.csr.ctrl.i2c_exten_rst 0x5 0x2 1
?register io.csr.ctrl.clk_gen_rst 0x5 0x4 1
?register io.csr.ctrl.gps_clk_en 0x5 0x8 1
?register io.csr.ctrl.gps_clk_fltr_a 0x5 0x10 1
?register io.csr.ctrl.gps_clk_fltr_b 0x5 0x20 1
";

    #[test]
    fn test_temperature_conversion() {
        assert!((temperature_from_raw([0x19, 0x80]) - 25.5).abs() < f64::EPSILON);
        assert!((temperature_from_raw([0xff, 0x80]) + 0.5).abs() < f64::EPSILON);
        assert!((temperature_from_raw([0x00, 0x00])).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reset() {
        let dir = tempfile::tempdir().unwrap();
        write_clock_config(dir.path(), BoardRevision::GibRev1);
        let pll = pll();
        let switch = SwitchTarget::new().shared();
        let exp1 = RegisterTarget::new().shared();
        let mut sensor = RegisterTarget::new();
        sensor.set(0x00, 0x19);
        sensor.set(0x01, 0x80);
        let hw = io_hw(
            EXTRA,
            vec![Bus {
                name: "i2c",
                base: 0x10,
                slaves: vec![
                    ("AX3_Switch", 0x21),
                    ("I2CSwitch", 0x70),
                    ("SFPExpander0", 0x74),
                    ("SFPExpander1", 0x75),
                    ("TempSensor", 0x48),
                    ("ClkGen", 0x68),
                ],
                core: I2cCoreSim::new()
                    .with_target(0x21, RegisterTarget::new())
                    .with_target(0x70, switch.clone())
                    .with_target(0x74, RegisterTarget::new())
                    .with_target(0x75, exp1.clone())
                    .with_target(0x48, sensor)
                    .with_target(0x68, pll.clone()),
            }],
        );
        with_mock(&hw, |m| m.poke(5, 0x38));
        let gib = GibIo::new(Node::new(&hw, "io"), settings(dir.path()));
        gib.reset(None).unwrap();

        // Resets held low then released, GPS clock enabled at full bandwidth
        assert_eq!(
            with_mock(&hw, |m| m.writes_to(5)),
            vec![0x38, 0x38, 0x38, 0x39, 0x3b, 0x3f, 0x37, 0x27, 0x07]
        );
        assert_eq!(switch.lock().unwrap().writes(), &[0x01]);
        assert_eq!(exp1.lock().unwrap().get(0x03), Some(0xf0));
        assert_eq!(exp1.lock().unwrap().get(0x07), Some(0xff));
        assert_eq!(pll.lock().unwrap().get(0x0b24), Some(0xc0));

        assert!((gib.read_temperature().unwrap() - 25.5).abs() < f64::EPSILON);
        assert!(matches!(
            gib.select_i2c_channel(7),
            Err(Error::I2c(crate::i2c::Error::SwitchChannel(7)))
        ));
    }
}
