//! Silicon Labs SI5344/SI5345 jitter-attenuating PLLs
//!
//! The chips expose a 16-bit register space through 8-bit I2C register addresses: writing
//! register `0x01` on any page selects the page forming the upper byte.

use super::{
    Address,
    Error,
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
use indicatif::ProgressBar;
use packed_struct::prelude::*;
use std::{
    cell::Cell,
    path::Path,
    time::Duration,
};
use timing_derive::{
    address,
    RegisterSerde,
};
use timing_utils::clock_config::{
    read_clock_config,
    ClockConfig,
    RegisterWrite,
};
use tracing::{
    debug,
    info,
};

const PAGE_REG: u8 = 0x01;
const DEVICE_VERSION: u16 = 0x0002;
const CONFIG_ID: u16 = 0x026B;
const CONFIG_ID_LEN: usize = 8;

/// Wait between the preamble and the rest of the configuration, when the file doesn't say
pub const DEFAULT_PREAMBLE_DELAY: Duration = Duration::from_millis(300);

#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
#[address(0x000C)]
/// Live device status
pub struct InternalStatus {
    /// Device is calibrating
    #[packed_field(bits = "0")]
    pub sysincal: bool,
    /// Loss of signal on the XA/XB crystal input
    #[packed_field(bits = "1")]
    pub losxaxb: bool,
    /// No valid reference on XA/XB
    #[packed_field(bits = "3")]
    pub xaxb_err: bool,
    #[packed_field(bits = "5")]
    pub smbus_timeout: bool,
}

#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
#[address(0x000D)]
/// Loss of signal and out of frequency flags, one bit per input
pub struct LosOof {
    #[packed_field(bits = "0..=3")]
    pub los: Integer<u8, packed_bits::Bits<4>>,
    #[packed_field(bits = "4..=7")]
    pub oof: Integer<u8, packed_bits::Bits<4>>,
}

#[derive(PackedStruct, RegisterSerde, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "1")]
#[address(0x000E)]
pub struct LolHold {
    /// Loss of lock
    #[packed_field(bits = "1")]
    pub lol: bool,
    /// In holdover or free run
    #[packed_field(bits = "5")]
    pub hold: bool,
}

/// An SI534x on an I2C bus
#[derive(Debug)]
pub struct Si534x<T> {
    slave: I2cSlave<T>,
    /// Last page selected through this handle
    page: Cell<Option<u8>>,
}

impl<T> Si534x<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(slave: I2cSlave<T>) -> Self {
        Self {
            slave,
            page: Cell::new(None),
        }
    }

    #[must_use]
    pub fn slave(&self) -> &I2cSlave<T> {
        &self.slave
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn read_page(&self) -> I2cResult<u8> {
        let page = self.slave.read_i2c(PAGE_REG)?;
        self.page.set(Some(page));
        Ok(page)
    }

    /// Select `page`, skipping the bus write if it's already selected
    /// # Errors
    /// Returns an error on bus errors
    pub fn switch_page(&self, page: u8) -> I2cResult<()> {
        if self.page.get() != Some(page) {
            self.slave.write_i2c(PAGE_REG, page)?;
            self.page.set(Some(page));
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn read_clock_register(&self, addr: u16) -> I2cResult<u8> {
        let [page, offset] = addr.to_be_bytes();
        self.switch_page(page)?;
        self.slave.read_i2c(offset)
    }

    /// Read `n` consecutive registers, which must all sit on the page of `addr`
    /// # Errors
    /// Returns an error on bus errors
    pub fn read_clock_registers(&self, addr: u16, n: usize) -> I2cResult<Vec<u8>> {
        let [page, offset] = addr.to_be_bytes();
        self.switch_page(page)?;
        self.slave.read_i2c_array(offset, n)
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn write_clock_register(&self, addr: u16, data: u8) -> I2cResult<()> {
        let [page, offset] = addr.to_be_bytes();
        self.switch_page(page)?;
        self.slave.write_i2c(offset, data)
    }

    /// Write `data` into consecutive registers on the page of `addr`
    /// # Errors
    /// Returns an error on bus errors
    pub fn write_clock_registers(&self, addr: u16, data: &[u8]) -> I2cResult<()> {
        let [page, offset] = addr.to_be_bytes();
        self.switch_page(page)?;
        self.slave.write_i2c_array(offset, data)
    }

    /// Read a paged register as `R`
    /// # Errors
    /// Returns an error on bus errors or if the byte doesn't unpack
    pub fn read_reg<R>(&self) -> I2cResult<R>
    where
        R: Deserialize<Chunk = [u8; 1]> + Address,
    {
        Ok(R::deserialize([self.read_clock_register(R::addr())?])?)
    }

    /// # Errors
    /// Returns an error on bus errors or if the value doesn't pack
    pub fn write_reg<R>(&self, value: &R) -> I2cResult<()>
    where
        R: Serialize<Chunk = [u8; 1]> + Address,
    {
        let [byte] = value.serialize()?;
        self.write_clock_register(R::addr(), byte)
    }

    /// The part number, e.g. `0x5345`
    /// # Errors
    /// Returns an error on bus errors
    pub fn read_device_version(&self) -> I2cResult<u16> {
        let bytes = self.read_clock_registers(DEVICE_VERSION, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// The design ID programmed by the last configuration
    /// # Errors
    /// Returns an error on bus errors
    pub fn read_config_id(&self) -> I2cResult<String> {
        let bytes = self.read_clock_registers(CONFIG_ID, CONFIG_ID_LEN)?;
        Ok(bytes
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| char::from(*b))
            .collect())
    }

    fn write_all<'a, I>(&self, writes: I, bar: &ProgressBar) -> I2cResult<()>
    where
        I: IntoIterator<Item = &'a RegisterWrite>,
    {
        for w in writes {
            self.write_clock_register(w.addr, w.data)?;
            bar.inc(1);
        }
        Ok(())
    }

    /// Program `config`: preamble, a settling delay, the registers then the postamble.
    /// The delay comes from the file if it names one, else `default_delay`.
    /// # Errors
    /// Returns an error on bus errors
    pub fn configure(&self, config: &ClockConfig, default_delay: Duration) -> I2cResult<()> {
        let delay = config
            .delay_ms
            .map_or(default_delay, |ms| Duration::from_millis(ms.into()));
        debug!(writes = config.len(), ?delay, "Configuring PLL");
        let bar = ProgressBar::new(config.len() as u64);
        bar.set_message("Configuring PLL");
        self.write_all(&config.preamble, &bar)?;
        std::thread::sleep(delay);
        self.write_all(&config.registers, &bar)?;
        self.write_all(&config.postamble, &bar)?;
        bar.finish();
        info!(
            design_id = config.design_id.as_deref().unwrap_or("unknown"),
            "PLL configured"
        );
        Ok(())
    }

    /// Parse and program the configuration file at `path`
    /// # Errors
    /// Returns an error on bad files or bus errors
    pub fn configure_from_file<P: AsRef<Path>>(
        &self,
        path: P,
        default_delay: Duration,
    ) -> I2cResult<()> {
        info!(path = %path.as_ref().display(), "Loading PLL configuration");
        let config = read_clock_config(path)?;
        self.configure(&config, default_delay)
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn read_internal_status(&self) -> I2cResult<InternalStatus> {
        self.read_reg()
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn read_los_oof(&self) -> I2cResult<LosOof> {
        self.read_reg()
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn read_lol_hold(&self) -> I2cResult<LolHold> {
        self.read_reg()
    }
}

impl<T> TimingNode for Si534x<T>
where
    T: Transport,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let version = self.read_device_version()?;
        let config_id = self.read_config_id()?;
        let internal = self.read_internal_status()?;
        let los_oof = self.read_los_oof()?;
        let lol_hold = self.read_lol_hold()?;
        let rows = [
            ("Version", format!("{version:#x}")),
            ("Config ID", config_id),
            ("Calibrating", internal.sysincal.to_string()),
            ("XAXB LOS", internal.losxaxb.to_string()),
            ("XAXB error", internal.xaxb_err.to_string()),
            ("SMBus timeout", internal.smbus_timeout.to_string()),
            ("LOS", format!("{:#x}", u8::from(los_oof.los))),
            ("OOF", format!("{:#x}", u8::from(los_oof.oof))),
            ("LOL", lol_hold.lol.to_string()),
            ("Holdover", lol_hold.hold.to_string()),
        ];
        Ok(format_reg_table(rows, "PLL state", None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hw::Hw,
        i2c::{
            tests::i2c_hw,
            I2cMasterNode,
        },
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
    use timing_utils::clock_config::parse_clock_config;

    fn setup(target: &Arc<Mutex<RegisterTarget>>) -> (Arc<Mutex<Hw<Mock>>>, Si534x<Mock>) {
        let hw = i2c_hw(
            "pll_i2c",
            0x40,
            &[("SI5345", 0x68)],
            I2cCoreSim::new().with_target(0x68, target.clone()),
        );
        let pll = Si534x::new(
            I2cMasterNode::new(Node::new(&hw, "pll_i2c"))
                .unwrap()
                .get_slave("SI5345")
                .unwrap(),
        );
        (hw, pll)
    }

    #[test]
    fn test_paged_access() {
        let target = RegisterTarget::paged().shared();
        let (_hw, pll) = setup(&target);
        pll.write_clock_register(0x0B24, 0xC0).unwrap();
        assert_eq!(target.lock().unwrap().get(0x0B24), Some(0xC0));
        assert_eq!(pll.read_clock_register(0x0B24).unwrap(), 0xC0);
        assert_eq!(pll.read_page().unwrap(), 0x0B);
        // Same page, no page write
        pll.write_clock_register(0x0B25, 0x01).unwrap();
        let page_writes = target
            .lock()
            .unwrap()
            .writes()
            .iter()
            .filter(|(a, _)| a & 0xff == 0x01)
            .count();
        assert_eq!(page_writes, 1);
    }

    #[test]
    fn test_identity() {
        let target = RegisterTarget::paged().shared();
        {
            let mut t = target.lock().unwrap();
            t.set(0x0002, 0x45);
            t.set(0x0003, 0x53);
            for (i, b) in b"PDTS0003".iter().enumerate() {
                t.set(CONFIG_ID + i as u16, *b);
            }
        }
        let (_hw, pll) = setup(&target);
        assert_eq!(pll.read_device_version().unwrap(), 0x5345);
        assert_eq!(pll.read_config_id().unwrap(), "PDTS0003");
    }

    #[test]
    fn test_configure() {
        let target = RegisterTarget::paged().shared();
        let (_hw, pll) = setup(&target);
        let config = parse_clock_config(
            "\
# Design ID: PDTS0003
Address,Data
# Start configuration preamble
0x0B24,0xC0
# End configuration preamble
0x0006,0x00
0x0B25,0x00
# Start configuration postamble
0x001C,0x01
# End configuration postamble
",
        )
        .unwrap();
        pll.configure(&config, Duration::ZERO).unwrap();
        let data_writes: Vec<(u16, u8)> = target
            .lock()
            .unwrap()
            .writes()
            .iter()
            .copied()
            .filter(|(a, _)| a & 0xff != 0x01)
            .collect();
        assert_eq!(
            data_writes,
            vec![(0x0B24, 0xC0), (0x0006, 0x00), (0x0B25, 0x00), (0x001C, 0x01)]
        );
    }

    #[test]
    fn test_status() {
        let target = RegisterTarget::paged().shared();
        {
            let mut t = target.lock().unwrap();
            t.set(0x000C, 0b0000_0010);
            t.set(0x000D, 0x21);
            t.set(0x000E, 0b0010_0000);
        }
        let (_hw, pll) = setup(&target);
        let internal = pll.read_internal_status().unwrap();
        assert!(internal.losxaxb);
        assert!(!internal.sysincal);
        let los_oof = pll.read_los_oof().unwrap();
        assert_eq!(u8::from(los_oof.los), 0x1);
        assert_eq!(u8::from(los_oof.oof), 0x2);
        let lol_hold = pll.read_lol_hold().unwrap();
        assert!(lol_hold.hold);
        assert!(!lol_hold.lol);
        let status = pll.get_status().unwrap();
        assert!(status.contains("| Holdover      | true"));
    }
}
