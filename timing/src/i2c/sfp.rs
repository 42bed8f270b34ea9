//! SFP transceiver management interface (SFF-8472): the serial ID page at `0x50` and the
//! digital diagnostics page at `0x51`
use super::{
    Address,
    Error,
    I2cMasterNode,
    I2cResult,
    I2cSlave,
};
use crate::{
    format::format_reg_table,
    node::TimingNode,
    transport::{
        Deserialize,
        Serialize,
        Transport,
    },
};
use fixed::types::U8F8;
use packed_struct::prelude::*;
use timing_derive::{
    address,
    RegisterSerde,
};
use tracing::info;

pub const ID_ADDR: u8 = 0x50;
pub const DIAG_ADDR: u8 = 0x51;

const VENDOR_NAME: (u8, usize) = (20, 16);
const VENDOR_PN: (u8, usize) = (40, 16);
const VENDOR_SN: (u8, usize) = (68, 16);

const RX_POWER_COEFFS: u8 = 56;
const TX_BIAS_CAL: u8 = 76;
const TX_POWER_CAL: u8 = 80;
const TEMP_CAL: u8 = 84;
const VOLTAGE_CAL: u8 = 88;

const TEMP: u8 = 96;
const VOLTAGE: u8 = 98;
const TX_BIAS: u8 = 100;
const TX_POWER: u8 = 102;
const RX_POWER: u8 = 104;

#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
#[address(92)]
/// Which diagnostics the module implements and how they're calibrated
pub struct DiagnosticType {
    #[packed_field(bits = "6")]
    pub ddm: bool,
    #[packed_field(bits = "5")]
    pub internally_calibrated: bool,
    #[packed_field(bits = "4")]
    pub externally_calibrated: bool,
    /// Received power is average rather than OMA
    #[packed_field(bits = "3")]
    pub rx_power_average: bool,
}

#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
#[address(93)]
pub struct EnhancedOptions {
    #[packed_field(bits = "7")]
    pub alarm_warning_flags: bool,
    #[packed_field(bits = "6")]
    pub soft_tx_disable: bool,
    #[packed_field(bits = "5")]
    pub soft_tx_fault: bool,
    #[packed_field(bits = "4")]
    pub soft_rx_los: bool,
}

#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
#[address(110)]
/// Optional status/control byte of the diagnostics page
pub struct StatusControl {
    /// State of the TX_DISABLE pin
    #[packed_field(bits = "7")]
    pub tx_disable_state: bool,
    /// Software transmitter disable
    #[packed_field(bits = "6")]
    pub soft_tx_disable: bool,
    #[packed_field(bits = "5")]
    pub rs1_state: bool,
    #[packed_field(bits = "4")]
    pub rate_select_state: bool,
    #[packed_field(bits = "3")]
    pub soft_rate_select: bool,
    #[packed_field(bits = "2")]
    pub tx_fault: bool,
    #[packed_field(bits = "1")]
    pub rx_los: bool,
    /// Low once the module has valid monitoring data
    #[packed_field(bits = "0")]
    pub data_ready_bar: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Calibration {
    Internal,
    External,
}

/// An SFP module
#[derive(Debug)]
pub struct Sfp<T> {
    id: I2cSlave<T>,
    diag: I2cSlave<T>,
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_i16(bytes: &[u8]) -> i16 {
    i16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_f32(bytes: &[u8]) -> f32 {
    f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl<T> Sfp<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(id: I2cSlave<T>, diag: I2cSlave<T>) -> Self {
        Self { id, diag }
    }

    /// The module on `master` at the standard addresses
    #[must_use]
    pub fn from_master(master: &I2cMasterNode<T>) -> Self {
        Self::new(
            I2cSlave::new(master.clone(), ID_ADDR),
            I2cSlave::new(master.clone(), DIAG_ADDR),
        )
    }

    fn read_string(&self, (reg, len): (u8, usize)) -> I2cResult<String> {
        let bytes = self.id.read_i2c_array(reg, len)?;
        Ok(String::from_utf8_lossy(&bytes)
            .trim_matches(|c: char| c == '\0' || c.is_whitespace())
            .to_owned())
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn read_vendor_name(&self) -> I2cResult<String> {
        self.read_string(VENDOR_NAME)
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn read_vendor_part_number(&self) -> I2cResult<String> {
        self.read_string(VENDOR_PN)
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn read_serial_number(&self) -> I2cResult<String> {
        self.read_string(VENDOR_SN)
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn read_diagnostic_type(&self) -> I2cResult<DiagnosticType> {
        self.id.read_reg()
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn read_enhanced_options(&self) -> I2cResult<EnhancedOptions> {
        self.id.read_reg()
    }

    /// How the diagnostics are calibrated, erroring if the module has none
    /// # Errors
    /// Returns an error on bus errors or if the module doesn't implement diagnostics
    pub fn read_calibration(&self) -> I2cResult<Calibration> {
        let diag = self.read_diagnostic_type()?;
        if !diag.ddm {
            return Err(Error::SfpUnsupported("digital diagnostics"));
        }
        Ok(if diag.externally_calibrated {
            Calibration::External
        } else {
            Calibration::Internal
        })
    }

    /// Slope and offset of an externally calibrated measurement
    fn read_linear_cal(&self, reg: u8) -> I2cResult<(f64, f64)> {
        let bytes = self.diag.read_i2c_array(reg, 4)?;
        let slope = U8F8::from_be_bytes([bytes[0], bytes[1]]);
        Ok((slope.to_num(), f64::from(be_i16(&bytes[2..]))))
    }

    /// An unsigned measurement, calibrated if need be, in its raw LSB units
    fn read_measurement(&self, reg: u8, cal_reg: u8) -> I2cResult<f64> {
        let cal = self.read_calibration()?;
        let raw = f64::from(be_u16(&self.diag.read_i2c_array(reg, 2)?));
        Ok(match cal {
            Calibration::Internal => raw,
            Calibration::External => {
                let (slope, offset) = self.read_linear_cal(cal_reg)?;
                slope * raw + offset
            }
        })
    }

    /// Module temperature in °C
    /// # Errors
    /// Returns an error on bus errors or if the module doesn't implement diagnostics
    pub fn read_temp(&self) -> I2cResult<f64> {
        let cal = self.read_calibration()?;
        let raw = f64::from(be_i16(&self.diag.read_i2c_array(TEMP, 2)?));
        let temp = match cal {
            Calibration::Internal => raw,
            Calibration::External => {
                let (slope, offset) = self.read_linear_cal(TEMP_CAL)?;
                slope * raw + offset
            }
        };
        Ok(temp / 256.)
    }

    /// Supply voltage in V
    /// # Errors
    /// Returns an error on bus errors or if the module doesn't implement diagnostics
    pub fn read_supply_voltage(&self) -> I2cResult<f64> {
        Ok(self.read_measurement(VOLTAGE, VOLTAGE_CAL)? * 100e-6)
    }

    /// Laser bias current in mA
    /// # Errors
    /// Returns an error on bus errors or if the module doesn't implement diagnostics
    pub fn read_tx_bias_current(&self) -> I2cResult<f64> {
        Ok(self.read_measurement(TX_BIAS, TX_BIAS_CAL)? * 2e-3)
    }

    /// Transmitted optical power in mW
    /// # Errors
    /// Returns an error on bus errors or if the module doesn't implement diagnostics
    pub fn read_tx_power(&self) -> I2cResult<f64> {
        Ok(self.read_measurement(TX_POWER, TX_POWER_CAL)? * 1e-4)
    }

    /// Received optical power in mW
    /// # Errors
    /// Returns an error on bus errors or if the module doesn't implement diagnostics
    pub fn read_rx_power(&self) -> I2cResult<f64> {
        let cal = self.read_calibration()?;
        let raw = f64::from(be_u16(&self.diag.read_i2c_array(RX_POWER, 2)?));
        let power = match cal {
            Calibration::Internal => raw,
            Calibration::External => {
                let bytes = self.diag.read_i2c_array(RX_POWER_COEFFS, 20)?;
                // Highest order coefficient first
                bytes
                    .chunks_exact(4)
                    .map(|c| f64::from(be_f32(c)))
                    .fold(0., |acc, c| acc * raw + c)
            }
        };
        Ok(power * 1e-4)
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn read_status_control(&self) -> I2cResult<StatusControl> {
        self.diag.read_reg()
    }

    /// Set (`on`) or clear the soft TX disable bit
    /// # Errors
    /// Returns an error on bus errors or if the module has no soft TX control
    pub fn switch_soft_tx_control_bit(&self, on: bool) -> I2cResult<()> {
        if !self.read_enhanced_options()?.soft_tx_disable {
            return Err(Error::SfpUnsupported("soft TX control"));
        }
        let mut status = self.read_status_control()?;
        status.soft_tx_disable = on;
        self.diag.write_reg(&status)?;
        info!(addr = self.id.addr(), on, "SFP soft TX control bit switched");
        Ok(())
    }
}

impl<T> TimingNode for Sfp<T>
where
    T: Transport,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let mut rows = vec![
            ("Vendor", self.read_vendor_name()?),
            ("Part number", self.read_vendor_part_number()?),
            ("Serial number", self.read_serial_number()?),
        ];
        match self.read_calibration() {
            Ok(cal) => {
                rows.push(("Calibration", format!("{cal:?}")));
                rows.push(("Temperature (C)", format!("{:.3}", self.read_temp()?)));
                rows.push(("Supply voltage (V)", format!("{:.3}", self.read_supply_voltage()?)));
                rows.push(("Tx bias (mA)", format!("{:.3}", self.read_tx_bias_current()?)));
                rows.push(("Tx power (mW)", format!("{:.3}", self.read_tx_power()?)));
                rows.push(("Rx power (mW)", format!("{:.3}", self.read_rx_power()?)));
            }
            Err(Error::SfpUnsupported(_)) => rows.push(("Diagnostics", "unsupported".to_owned())),
            Err(e) => return Err(e),
        }
        if self.read_enhanced_options()?.soft_tx_disable {
            let status = self.read_status_control()?;
            rows.push(("Soft tx disable", status.soft_tx_disable.to_string()));
            rows.push(("Tx disable pin", status.tx_disable_state.to_string()));
            rows.push(("Tx fault", status.tx_fault.to_string()));
            rows.push(("Rx LOS", status.rx_los.to_string()));
        }
        Ok(format_reg_table(rows, "SFP status", None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hw::Hw,
        i2c::tests::i2c_hw,
        node::Node,
        transport::mock::{
            i2c::{
                I2cCoreSim,
                RegisterTarget,
            },
            Mock,
        },
    };
    use std::sync::{
        Arc,
        Mutex,
    };

    struct Setup {
        _hw: Arc<Mutex<Hw<Mock>>>,
        id: Arc<Mutex<RegisterTarget>>,
        diag: Arc<Mutex<RegisterTarget>>,
        sfp: Sfp<Mock>,
    }

    fn setup() -> Setup {
        let id = RegisterTarget::new().shared();
        let diag = RegisterTarget::new().shared();
        let hw = i2c_hw(
            "sfp_i2c",
            0,
            &[],
            I2cCoreSim::new()
                .with_target(ID_ADDR, id.clone())
                .with_target(DIAG_ADDR, diag.clone()),
        );
        {
            let mut id = id.lock().unwrap();
            for (i, b) in b"FINISAR CORP.   ".iter().enumerate() {
                id.set(20 + i as u16, *b);
            }
            for (i, b) in b"FTLF8519P3BNL   ".iter().enumerate() {
                id.set(40 + i as u16, *b);
            }
        }
        let sfp = Sfp::from_master(&I2cMasterNode::new(Node::new(&hw, "sfp_i2c")).unwrap());
        Setup {
            _hw: hw,
            id,
            diag,
            sfp,
        }
    }

    fn set_word(target: &Arc<Mutex<RegisterTarget>>, reg: u16, bytes: &[u8]) {
        let mut target = target.lock().unwrap();
        for (i, b) in bytes.iter().enumerate() {
            target.set(reg + i as u16, *b);
        }
    }

    #[test]
    fn test_id_strings() {
        let s = setup();
        assert_eq!(s.sfp.read_vendor_name().unwrap(), "FINISAR CORP.");
        assert_eq!(s.sfp.read_vendor_part_number().unwrap(), "FTLF8519P3BNL");
        assert_eq!(s.sfp.read_serial_number().unwrap(), "");
    }

    #[test]
    fn test_no_diagnostics() {
        let s = setup();
        assert!(matches!(
            s.sfp.read_temp(),
            Err(Error::SfpUnsupported("digital diagnostics"))
        ));
        let status = s.sfp.get_status().unwrap();
        assert!(status.contains("unsupported"));
    }

    #[test]
    fn test_internal_calibration() {
        let s = setup();
        s.id.lock().unwrap().set(92, 0b0110_0000);
        // 25.5 C, 3.3 V, 6 mA, 0.5 mW, 0.25 mW
        set_word(&s.diag, 96, &[0x19, 0x80]);
        set_word(&s.diag, 98, &33_000u16.to_be_bytes());
        set_word(&s.diag, 100, &3_000u16.to_be_bytes());
        set_word(&s.diag, 102, &5_000u16.to_be_bytes());
        set_word(&s.diag, 104, &2_500u16.to_be_bytes());
        assert_eq!(s.sfp.read_calibration().unwrap(), Calibration::Internal);
        assert!((s.sfp.read_temp().unwrap() - 25.5).abs() < 1e-9);
        assert!((s.sfp.read_supply_voltage().unwrap() - 3.3).abs() < 1e-9);
        assert!((s.sfp.read_tx_bias_current().unwrap() - 6.0).abs() < 1e-9);
        assert!((s.sfp.read_tx_power().unwrap() - 0.5).abs() < 1e-9);
        assert!((s.sfp.read_rx_power().unwrap() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_negative_temperature() {
        let s = setup();
        s.id.lock().unwrap().set(92, 0b0110_0000);
        set_word(&s.diag, 96, &(-640i16).to_be_bytes());
        assert!((s.sfp.read_temp().unwrap() + 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_external_calibration() {
        let s = setup();
        s.id.lock().unwrap().set(92, 0b0101_0000);
        // Bias: slope 2.0, offset 100
        set_word(&s.diag, 76, &[0x02, 0x00, 0x00, 100]);
        set_word(&s.diag, 100, &1_000u16.to_be_bytes());
        // Rx power: 0.5 * raw + 10
        let mut coeffs = vec![];
        for c in [0f32, 0., 0., 0.5, 10.] {
            coeffs.extend_from_slice(&c.to_be_bytes());
        }
        set_word(&s.diag, 56, &coeffs);
        set_word(&s.diag, 104, &2_000u16.to_be_bytes());
        assert_eq!(s.sfp.read_calibration().unwrap(), Calibration::External);
        assert!((s.sfp.read_tx_bias_current().unwrap() - 4.2).abs() < 1e-9);
        assert!((s.sfp.read_rx_power().unwrap() - 0.101).abs() < 1e-9);
    }

    #[test]
    fn test_soft_tx_control() {
        let s = setup();
        assert!(matches!(
            s.sfp.switch_soft_tx_control_bit(true),
            Err(Error::SfpUnsupported("soft TX control"))
        ));
        s.id.lock().unwrap().set(93, 0b0100_0000);
        s.diag.lock().unwrap().set(110, 0b0000_0010);
        s.sfp.switch_soft_tx_control_bit(true).unwrap();
        assert_eq!(s.diag.lock().unwrap().get(110), Some(0b0100_0010));
        s.sfp.switch_soft_tx_control_bit(false).unwrap();
        assert_eq!(s.diag.lock().unwrap().get(110), Some(0b0000_0010));
    }
}
