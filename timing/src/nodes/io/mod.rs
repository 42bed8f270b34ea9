//! IO blocks: the board-facing part of every design, owning the clock chip, board PROM, SFPs
//! and the I2C buses they sit on.
//!
//! [`IoNode`] implements what every board shares. Each board wraps it and adds its own reset
//! sequence and peripherals behind the [`TimingIo`] trait, so designs can drive any board picked
//! at runtime with [`build_io`] or [`detect_io`].

pub mod fmc;
pub mod gib;
pub mod pc059;
pub mod tlu;

pub use fmc::FmcIo;
pub use gib::GibIo;
pub use pc059::Pc059Io;
pub use tlu::TluIo;

use super::frequency::{
    FrequencyCounter,
    DEFAULT_GATE,
};
use crate::{
    definitions::{
        BoardRevision,
        BoardType,
        CarrierType,
        DesignType,
    },
    format::{
        format_reg_table,
        format_reg_value,
    },
    i2c::{
        self,
        sfp::Sfp,
        si534x::{
            Si534x,
            DEFAULT_PREAMBLE_DELAY,
        },
        I2cMasterNode,
        I2cSlave,
    },
    node::{
        Node,
        TimingNode,
    },
    transport::{
        self,
        Transport,
        TransportResult,
    },
};
use std::{
    ffi::OsString,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};
use thiserror::Error;
use tracing::{
    debug,
    info,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error(transparent)]
    I2c(#[from] i2c::Error),
    #[error("SFP {0} doesn't exist on this board")]
    InvalidSfpId(u32),
    #[error("No board revision is registered for UID {0:#x}")]
    UnknownBoardUid(u64),
    #[error("Unknown board type {0:#x}")]
    UnknownBoardType(u32),
    #[error("Board `{0}` has no IO implementation")]
    UnsupportedBoard(BoardType),
    #[error("DAC {0} doesn't exist on this board")]
    InvalidDacId(u32),
}

pub type IoResult<T> = Result<T, Error>;

/// Where the unique ID lives in the board PROMs
const UID_ADDR: u8 = 0xfa;
const UID_LEN: usize = 6;

/// Environment variable pointing at the clock configuration directory
pub const CLOCK_CONFIG_DIR_ENV: &str = "TIMING_CLOCK_CONFIG_DIR";
const PDT_TESTS_ENV: &str = "PDT_TESTS";
const DEFAULT_CLOCK_CONFIG_DIR: &str = "etc/clock";

/// Board-level tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoSettings {
    /// Root the per-revision clock configuration paths are relative to
    pub clock_config_dir: PathBuf,
    /// Wait after the soft reset before touching the board again
    pub soft_reset_delay: Duration,
    /// Gate of the clock frequency counter
    pub frequency_gate: Duration,
    /// Wait after (re)setting an I2C multiplexer
    pub i2c_mux_settle: Duration,
    /// Wait after the PLL configuration preamble, unless the file names its own
    pub pll_preamble_delay: Duration,
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            clock_config_dir: PathBuf::from(DEFAULT_CLOCK_CONFIG_DIR),
            soft_reset_delay: Duration::from_secs(1),
            frequency_gate: DEFAULT_GATE,
            i2c_mux_settle: Duration::from_millis(100),
            pll_preamble_delay: DEFAULT_PREAMBLE_DELAY,
        }
    }
}

fn resolve_clock_config_dir(explicit: Option<OsString>, pdt_tests: Option<OsString>) -> PathBuf {
    explicit.map(PathBuf::from).unwrap_or_else(|| {
        pdt_tests.map_or_else(
            || PathBuf::from(DEFAULT_CLOCK_CONFIG_DIR),
            |root| PathBuf::from(root).join(DEFAULT_CLOCK_CONFIG_DIR),
        )
    })
}

impl IoSettings {
    /// Default settings, with the clock configuration directory taken from
    /// `TIMING_CLOCK_CONFIG_DIR`, else `$PDT_TESTS/etc/clock`, else `etc/clock`
    #[must_use]
    pub fn from_env() -> Self {
        let clock_config_dir = resolve_clock_config_dir(
            std::env::var_os(CLOCK_CONFIG_DIR_ENV),
            std::env::var_os(PDT_TESTS_ENV),
        );
        debug!(dir = %clock_config_dir.display(), "Clock configuration directory");
        Self {
            clock_config_dir,
            ..Default::default()
        }
    }
}

/// Where a board keeps its peripherals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLayout {
    pub uid_bus: &'static str,
    pub uid_device: &'static str,
    pub pll_bus: &'static str,
    pub pll_device: &'static str,
    /// Frequency counter inputs in channel order, with the divider in front of each
    pub clocks: &'static [(&'static str, u32)],
    /// Buses with an SFP on them, upstream first
    pub sfp_buses: &'static [&'static str],
    /// Revision of boards that aren't identified by their UID
    pub revision: Option<BoardRevision>,
}

/// The functionality shared by every IO block
#[derive(Debug)]
pub struct IoNode<T> {
    node: Node<T>,
    layout: IoLayout,
    settings: IoSettings,
}

impl<T> IoNode<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(node: Node<T>, layout: IoLayout, settings: IoSettings) -> Self {
        Self {
            node,
            layout,
            settings,
        }
    }

    #[must_use]
    pub fn node(&self) -> &Node<T> {
        &self.node
    }

    #[must_use]
    pub fn layout(&self) -> &IoLayout {
        &self.layout
    }

    #[must_use]
    pub fn settings(&self) -> &IoSettings {
        &self.settings
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_board_type(&self) -> TransportResult<u32> {
        self.node.read("config.board_type")
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_carrier_type(&self) -> TransportResult<u32> {
        self.node.read("config.carrier_type")
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_design_type(&self) -> TransportResult<u32> {
        self.node.read("config.design_type")
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn get_i2c_master(&self, bus: &str) -> IoResult<I2cMasterNode<T>> {
        Ok(I2cMasterNode::new(self.node.child(bus))?)
    }

    /// # Errors
    /// Returns an error on transport errors or if `bus` has no slave named `device`
    pub fn get_i2c_slave(&self, bus: &str, device: &str) -> IoResult<I2cSlave<T>> {
        Ok(self.get_i2c_master(bus)?.get_slave(device)?)
    }

    /// The unique ID burned into the board PROM
    /// # Errors
    /// Returns an error on bus errors
    pub fn read_board_uid(&self) -> IoResult<u64> {
        let bytes = self
            .get_i2c_slave(self.layout.uid_bus, self.layout.uid_device)?
            .read_i2c_array(UID_ADDR, UID_LEN)?;
        let uid = bytes
            .iter()
            .fold(0u64, |uid, b| (uid << 8) | u64::from(*b));
        debug!("Board UID {uid:#x}");
        Ok(uid)
    }

    /// # Errors
    /// Returns an error on bus errors or boards missing from the revision registry
    pub fn get_board_revision(&self) -> IoResult<BoardRevision> {
        if let Some(revision) = self.layout.revision {
            return Ok(revision);
        }
        let uid = self.read_board_uid()?;
        BoardRevision::from_uid(uid).ok_or(Error::UnknownBoardUid(uid))
    }

    /// Board, carrier and design identification, plus the board UID and revision
    /// # Errors
    /// Returns an error on bus errors
    pub fn get_hardware_info(&self) -> IoResult<String> {
        let board = self.read_board_type()?;
        let carrier = self.read_carrier_type()?;
        let design = self.read_design_type()?;
        let uid = self.read_board_uid()?;
        let revision = self
            .layout
            .revision
            .or_else(|| BoardRevision::from_uid(uid))
            .map_or_else(|| "unknown".to_owned(), |r| r.to_string());
        let name_or_code =
            |name: Option<String>, code: u32| name.unwrap_or_else(|| format_reg_value(code));
        let rows = [
            (
                "Board type",
                name_or_code(BoardType::from_code(board).map(|b| b.to_string()), board),
            ),
            (
                "Carrier type",
                name_or_code(CarrierType::from_code(carrier).map(|c| c.to_string()), carrier),
            ),
            (
                "Design type",
                name_or_code(DesignType::from_code(design).map(|d| d.to_string()), design),
            ),
            ("Board UID", format!("{uid:#x}")),
            ("Board revision", revision),
        ];
        Ok(format_reg_table(rows, "Hardware info", None))
    }

    /// The clock configuration to program: `config` if given, else the file registered for the
    /// board revision (or for the PC059 fanout `fanout_mode`) below the configuration directory
    /// # Errors
    /// Returns an error if the board revision can't be determined
    pub fn get_full_clock_config_file_path(
        &self,
        config: Option<&Path>,
        fanout_mode: Option<u32>,
    ) -> IoResult<PathBuf> {
        if let Some(path) = config {
            return Ok(path.to_path_buf());
        }
        let revision = match fanout_mode.and_then(BoardRevision::pc059_fanout) {
            Some(revision) => {
                info!(%revision, "Overriding clock configuration for fanout mode");
                revision
            }
            None => self.get_board_revision()?,
        };
        let path = self.settings.clock_config_dir.join(revision.clock_config());
        info!(%revision, path = %path.display(), "PLL configuration file");
        Ok(path)
    }

    /// # Errors
    /// Returns an error if the PLL isn't named on its bus
    pub fn get_pll(&self) -> IoResult<Si534x<T>> {
        Ok(Si534x::new(
            self.get_i2c_slave(self.layout.pll_bus, self.layout.pll_device)?,
        ))
    }

    /// Program the PLL, see [`IoNode::get_full_clock_config_file_path`] for which file is used
    /// # Errors
    /// Returns an error on bus errors or bad configuration files
    pub fn configure_pll(&self, config: Option<&Path>, fanout_mode: Option<u32>) -> IoResult<()> {
        let path = self.get_full_clock_config_file_path(config, fanout_mode)?;
        let pll = self.get_pll()?;
        let version = pll.read_device_version()?;
        info!("PLL version {version:#x}");
        pll.configure_from_file(&path, self.settings.pll_preamble_delay)?;
        let config_id = pll.read_config_id()?;
        info!(%config_id, "PLL configuration id");
        Ok(())
    }

    /// Frequencies of the board clocks in MHz, in layout order
    /// # Errors
    /// Returns an error on transport errors
    pub fn read_clock_frequencies(&self) -> TransportResult<Vec<f64>> {
        let divisors: Vec<u32> = self.layout.clocks.iter().map(|(_, d)| *d).collect();
        FrequencyCounter::with_gate(self.node.child("freq"), self.settings.frequency_gate)
            .measure_divided(&divisors)
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn get_clock_frequencies_table(&self) -> TransportResult<String> {
        let freqs = self.read_clock_frequencies()?;
        let rows = self.layout.clocks.iter().map(|(name, _)| *name).zip(freqs);
        Ok(format_reg_table(
            rows,
            "IO clock frequencies",
            Some(("Clock", "Frequency [MHz]")),
        ))
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn get_pll_status(&self) -> IoResult<String> {
        Ok(self.get_pll()?.get_status()?)
    }

    /// The SFP `sfp_id`. Only id 0, on the first SFP bus, exists unless a board says otherwise.
    /// # Errors
    /// Returns an error on SFP ids the board doesn't have
    pub fn get_sfp(&self, sfp_id: u32) -> IoResult<Sfp<T>> {
        match (sfp_id, self.layout.sfp_buses.first()) {
            (0, Some(bus)) => Ok(Sfp::from_master(&self.get_i2c_master(bus)?)),
            _ => Err(Error::InvalidSfpId(sfp_id)),
        }
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn soft_reset(&self) -> TransportResult<()> {
        self.node.write("csr.ctrl.soft_rst", 1)?;
        self.node.dispatch()?;
        info!(node = self.node.path(), "Soft reset done");
        Ok(())
    }

    /// Raise every line in `lines` together, then release them together
    /// # Errors
    /// Returns an error on transport errors
    pub fn pulse_resets(&self, lines: &[&str]) -> TransportResult<()> {
        for line in lines {
            self.node.write(line, 1)?;
        }
        self.node.dispatch()?;
        for line in lines {
            self.node.write(line, 0)?;
        }
        self.node.dispatch()
    }

    /// Pulse each line in `lines` in turn, releasing one before raising the next
    /// # Errors
    /// Returns an error on transport errors
    pub fn pulse_resets_in_turn(&self, lines: &[&str]) -> TransportResult<()> {
        for line in lines {
            self.node.pulse(line)?;
        }
        self.node.dispatch()
    }

    /// Open every downstream line of the I2C switch on Enclustra AX3 carriers
    /// # Errors
    /// Returns an error on bus errors
    pub fn enable_ax3_switch(&self) -> IoResult<()> {
        let switch = self.get_i2c_slave(self.layout.uid_bus, "AX3_Switch")?;
        switch.write_i2c(0x01, 0x7f)?;
        debug!(lines = switch.read_i2c(0x01)?, "I2C enable lines");
        Ok(())
    }

    /// Route the FMC I2C bus through the KC705's switch
    /// # Errors
    /// Returns an error on bus errors
    pub fn enable_kc705_switch(&self) -> IoResult<()> {
        self.get_i2c_slave(self.layout.uid_bus, "KC705_Switch")?
            .write_i2c_primitive(&[0x10])?;
        debug!("KC705 I2C switch enabled");
        Ok(())
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn reset_lock_monitor(&self) -> TransportResult<()> {
        self.node.pulse("csr.ctrl.rst_lock_mon")?;
        self.node.dispatch()
    }

    /// The `csr.stat` block as a table
    /// # Errors
    /// Returns an error on transport errors
    pub fn get_state_table(&self, title: &str) -> TransportResult<String> {
        Ok(format_reg_table(
            self.node.read_sub_nodes("csr.stat")?,
            title,
            None,
        ))
    }
}

/// A board's IO block
pub trait TimingIo<T>: TimingNode<Error = Error>
where
    T: Transport,
{
    fn io(&self) -> &IoNode<T>;

    /// Bring the board up from scratch: soft reset, PLL and I2C resets, PLL configuration from
    /// `config` (or the board's registered file) and board defaults
    /// # Errors
    /// Returns an error on bus errors or bad configuration files
    fn reset(&self, config: Option<&Path>) -> IoResult<()>;

    /// # Errors
    /// Returns an error on SFP ids the board doesn't have or bus errors
    fn get_sfp(&self, sfp_id: u32) -> IoResult<Sfp<T>> {
        self.io().get_sfp(sfp_id)
    }

    /// # Errors
    /// Returns an error on SFP ids the board doesn't have or bus errors
    fn get_sfp_status(&self, sfp_id: u32) -> IoResult<String> {
        Ok(self.get_sfp(sfp_id)?.get_status()?)
    }

    /// # Errors
    /// Returns an error on SFP ids the board doesn't have, bus errors or SFPs without soft TX
    /// control
    fn switch_sfp_soft_tx_control_bit(&self, sfp_id: u32, on: bool) -> IoResult<()> {
        self.get_sfp(sfp_id)?.switch_soft_tx_control_bit(on)?;
        Ok(())
    }
}

/// The IO implementation for `board`
/// # Errors
/// Returns an error on boards without one
pub fn build_io<T>(
    board: BoardType,
    node: Node<T>,
    settings: IoSettings,
) -> IoResult<Box<dyn TimingIo<T>>>
where
    T: Transport + 'static,
{
    debug!(%board, "Building IO node");
    Ok(match board {
        BoardType::Fmc => Box::new(FmcIo::new(node, settings)),
        BoardType::Pc059 => Box::new(Pc059Io::new(node, settings)),
        BoardType::Tlu => Box::new(TluIo::new(node, settings)),
        BoardType::Gib => Box::new(GibIo::new(node, settings)),
        BoardType::Sim | BoardType::Microzed => return Err(Error::UnsupportedBoard(board)),
    })
}

/// The IO implementation for whichever board the firmware reports
/// # Errors
/// Returns an error on transport errors, unknown board codes or boards without an implementation
pub fn detect_io<T>(node: Node<T>, settings: IoSettings) -> IoResult<Box<dyn TimingIo<T>>>
where
    T: Transport + 'static,
{
    let code = node.read("config.board_type")?;
    let board = BoardType::from_code(code).ok_or(Error::UnknownBoardType(code))?;
    build_io(board, node, settings)
}
