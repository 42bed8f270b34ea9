//! The timing master: timestamp source, command generators, partitions and the echo and
//! async-command blocks used to calibrate endpoint delays

use super::partition::PartitionNode;
use crate::{
    definitions::Command,
    format::{
        format_reg_table,
        format_timestamp,
        tstamp2int,
    },
    node::{
        Node,
        PollError,
        TimingNode,
    },
    transport::{
        Transport,
        TransportResult,
    },
};
use std::{
    fmt::{
        self,
        Write,
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
    Transport(#[from] crate::transport::Error),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error("Incompatible master firmware version {found}, major version {required} required")]
    IncompatibleFirmware {
        found: FirmwareVersion,
        required: u8,
    },
    #[error("Requested trigger rate {0} Hz is out of range")]
    RateOutOfRange(f64),
    #[error("Partition {id} doesn't exist, the firmware has {n_part}")]
    InvalidPartition { id: u32, n_part: u32 },
    #[error("No fake trigger generator on channel {0}")]
    InvalidChannel(u32),
    #[error("Trigger mask for partition {id} with physical mask {phys_mask:#x} doesn't fit in a word")]
    MaskOverflow { id: u32, phys_mask: u32 },
}

/// Oldest master firmware major version this library talks to
pub const MASTER_FW_MAJOR_REQUIRED: u8 = 4;

/// Clock the command generators count
pub const FAKE_TRIGGER_CLOCK_HZ: f64 = 50e6;

/// Interval between reads of the echo status while measuring a round trip
pub const ECHO_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl From<u32> for FirmwareVersion {
    fn from(word: u32) -> Self {
        let [_, major, minor, patch] = word.to_be_bytes();
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Build-time parameters of the master firmware
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MasterGenerics {
    pub n_part: u32,
    pub n_chan: u32,
}

/// Divider settings of a command generator producing a periodic trigger
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FakeTriggerSettings {
    pub requested: f64,
    /// Power of two division after the fixed /256
    pub divisor: u32,
    /// Final 1-in-n prescale
    pub prescale: u32,
    /// Rate the dividers actually give
    pub actual: f64,
}

/// Dividers that best approximate `rate` Hz: the 50 MHz clock is pre-divided by 256, then by
/// 2^`divisor` (`divisor` in 0..=15), then prescaled 1-in-`prescale` (`prescale` in 1..=256)
/// # Errors
/// Returns an error if no prescale in range gets near `rate`
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn fake_trigger_settings(rate: f64) -> Result<FakeTriggerSettings, Error> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(Error::RateOutOfRange(rate));
    }
    let divisor = (FAKE_TRIGGER_CLOCK_HZ / (rate * 256.0 * 256.0))
        .log2()
        .ceil()
        .clamp(0.0, 15.0) as u32;
    let scale = f64::from(1u32 << divisor);
    let prescale = (FAKE_TRIGGER_CLOCK_HZ / (rate * 256.0 * scale) + 0.5).floor();
    if !(1.0..=256.0).contains(&prescale) {
        return Err(Error::RateOutOfRange(rate));
    }
    let actual = FAKE_TRIGGER_CLOCK_HZ / (256.0 * prescale * scale);
    Ok(FakeTriggerSettings {
        requested: rate,
        divisor,
        prescale: prescale as u32,
        actual,
    })
}

#[derive(Debug)]
pub struct MasterNode<T> {
    node: Node<T>,
}

impl<T> MasterNode<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(node: Node<T>) -> Self {
        Self { node }
    }

    #[must_use]
    pub fn node(&self) -> &Node<T> {
        &self.node
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_firmware_version(&self) -> TransportResult<FirmwareVersion> {
        Ok(self.node.read("global.version")?.into())
    }

    /// Read the firmware version and make sure this library supports it
    /// # Errors
    /// Returns an error on transport errors or firmware older than [`MASTER_FW_MAJOR_REQUIRED`]
    pub fn check_firmware(&self) -> Result<FirmwareVersion, Error> {
        let version = self.read_firmware_version()?;
        if version.major < MASTER_FW_MAJOR_REQUIRED {
            return Err(Error::IncompatibleFirmware {
                found: version,
                required: MASTER_FW_MAJOR_REQUIRED,
            });
        }
        debug!(%version, "Master firmware");
        Ok(version)
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_generics(&self) -> TransportResult<MasterGenerics> {
        Ok(MasterGenerics {
            n_part: self.node.read("global.config.n_part")?,
            n_chan: self.node.read("global.config.n_chan")?,
        })
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_timestamp(&self) -> TransportResult<u64> {
        Ok(tstamp2int(&self.node.read_block("tstamp.ctr", 2)?))
    }

    /// The partition `id`, checked against the number of partitions the firmware was built with
    /// # Errors
    /// Returns an error on transport errors or if the partition doesn't exist
    pub fn get_partition_node(&self, id: u32) -> Result<PartitionNode<T>, Error> {
        let MasterGenerics { n_part, .. } = self.read_generics()?;
        if id >= n_part {
            return Err(Error::InvalidPartition { id, n_part });
        }
        Ok(PartitionNode::new(self.node.child(&format!("partition{id}"))))
    }

    /// Inject `cmd` into the timing stream `n` times, returning the timestamp of each injection
    /// # Errors
    /// Returns an error on transport errors
    pub fn send_command(&self, cmd: Command, n: usize) -> TransportResult<Vec<u64>> {
        self.node.reset_sub_nodes("scmd_gen.chan_ctrl", 0, true)?;
        let mut stamps = Vec::with_capacity(n);
        for _ in 0..n {
            self.node.write("scmd_gen.chan_ctrl.type", cmd.code())?;
            self.node.write("scmd_gen.chan_ctrl.force", 1)?;
            let tstamp = self.read_timestamp()?;
            self.node.write("scmd_gen.chan_ctrl.force", 0)?;
            self.node.dispatch()?;
            info!(%cmd, tstamp, "Command sent");
            stamps.push(tstamp);
        }
        Ok(stamps)
    }

    /// Start generator `chan` producing fake triggers at (close to) `rate` Hz, periodic or with
    /// poisson-distributed spacing
    /// # Errors
    /// Returns an error on transport errors, bad channels or unreachable rates
    pub fn configure_fake_trigger(
        &self,
        chan: u32,
        rate: f64,
        poisson: bool,
    ) -> Result<FakeTriggerSettings, Error> {
        let cmd = Command::fake_trigger(chan).ok_or(Error::InvalidChannel(chan))?;
        let settings = fake_trigger_settings(rate)?;
        self.node.write("scmd_gen.sel", chan)?;
        self.node.write("scmd_gen.chan_ctrl.type", cmd.code())?;
        self.node
            .write("scmd_gen.chan_ctrl.rate_div_d", settings.divisor)?;
        self.node
            .write("scmd_gen.chan_ctrl.rate_div_p", settings.prescale)?;
        self.node.write("scmd_gen.chan_ctrl.patt", poisson.into())?;
        self.node.dispatch()?;
        info!(
            %cmd,
            requested = rate,
            actual = settings.actual,
            prescale = settings.prescale,
            divisor = settings.divisor,
            poisson,
            "Fake trigger configured"
        );
        self.node.write("scmd_gen.chan_ctrl.en", 1)?;
        self.node.dispatch()?;
        Ok(settings)
    }

    /// # Errors
    /// Returns an error on transport errors or bad channels
    pub fn clear_fake_trigger(&self, chan: u32) -> Result<(), Error> {
        Command::fake_trigger(chan).ok_or(Error::InvalidChannel(chan))?;
        self.node.write("scmd_gen.sel", chan)?;
        self.node.reset_sub_nodes("scmd_gen.chan_ctrl", 0, true)?;
        info!(chan, "Fake trigger generator cleared");
        Ok(())
    }

    /// Reset partition `id` and enable it with the physical trigger mask `phys_mask`. The
    /// partition's own fake trigger is always let through.
    /// # Errors
    /// Returns an error on transport errors, bad partitions or masks that don't fit
    pub fn configure_partition(&self, id: u32, phys_mask: u32) -> Result<PartitionNode<T>, Error> {
        let partition = self.get_partition_node(id)?;
        let overflow = || Error::MaskOverflow { id, phys_mask };
        let fake_mask = 1u32.checked_shl(id).ok_or_else(overflow)?;
        let phys = phys_mask
            .checked_shl(4)
            .filter(|m| m >> 4 == phys_mask)
            .ok_or_else(overflow)?;
        let mask = phys | fake_mask;
        partition.reset()?;
        partition.write_trigger_mask(mask)?;
        partition.enable(true, true)?;
        info!(partition = id, mask, "Partition configured");
        Ok(partition)
    }

    /// Round trip time, in clock ticks, to the endpoint at `addr`
    /// # Errors
    /// Returns an error on transport errors or if the echo doesn't come back within `timeout`
    pub fn measure_endpoint_rtt(&self, addr: u32, timeout: Duration) -> Result<u64, Error> {
        // The endpoint only answers echoes with its transmitter on
        self.node.write("acmd.csr.ctrl.addr", addr)?;
        self.node.write("acmd.csr.ctrl.tx_en", 1)?;
        self.node.pulse("acmd.csr.ctrl.go")?;
        self.node.dispatch()?;

        self.node.pulse("echo.csr.ctrl.go")?;
        self.node.dispatch()?;
        self.node.poll(
            "echo.csr.stat.rx_done",
            |v| v != 0,
            timeout,
            ECHO_POLL_INTERVAL,
        )?;
        let tx = tstamp2int(&[
            self.node.read("echo.csr.tx_l")?,
            self.node.read("echo.csr.tx_h")?,
        ]);
        let rx = tstamp2int(&[
            self.node.read("echo.csr.rx_l")?,
            self.node.read("echo.csr.rx_h")?,
        ]);

        self.node.write("acmd.csr.ctrl.tx_en", 0)?;
        self.node.pulse("acmd.csr.ctrl.go")?;
        self.node.dispatch()?;

        let rtt = rx.wrapping_sub(tx);
        info!(addr, rtt, "Endpoint round trip");
        Ok(rtt)
    }

    /// Send the endpoint at `addr` its coarse, fine and phase delay settings
    /// # Errors
    /// Returns an error on transport errors or delays that don't fit their fields
    pub fn apply_endpoint_delay(
        &self,
        addr: u32,
        coarse: u32,
        fine: u32,
        phase: u32,
    ) -> TransportResult<()> {
        self.node.write("acmd.csr.ctrl.addr", addr)?;
        self.node.write("acmd.csr.ctrl.cdel", coarse)?;
        self.node.write("acmd.csr.ctrl.fdel", fine)?;
        self.node.write("acmd.csr.ctrl.pdel", phase)?;
        self.node.write("acmd.csr.ctrl.update", 1)?;
        self.node.pulse("acmd.csr.ctrl.go")?;
        self.node.write("acmd.csr.ctrl.update", 0)?;
        self.node.dispatch()?;
        info!(addr, coarse, fine, phase, "Endpoint delays applied");
        Ok(())
    }
}

impl<T> TimingNode for MasterNode<T>
where
    T: Transport,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let version = self.read_firmware_version()?;
        let generics = self.read_generics()?;
        let tstamp = self.read_timestamp()?;
        let global = self.node.read_sub_nodes("global.csr.stat")?;
        let scmd = self.node.read_sub_nodes("scmd_gen.ctrl")?;

        let summary = [
            ("Firmware version", version.to_string()),
            ("Partitions", generics.n_part.to_string()),
            ("Channels", generics.n_chan.to_string()),
            ("Timestamp", format_timestamp(tstamp)),
            ("Timestamp (hex)", format!("{tstamp:#x}")),
        ];
        let mut status = String::new();
        let _ = writeln!(status, "{}", format_reg_table(summary, "Master summary", None));
        let _ = writeln!(status, "{}", format_reg_table(global, "Global state", None));
        status.push_str(&format_reg_table(scmd, "Time sync generator", None));
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hw::Hw,
        node::tests::{
            mock_hw,
            with_mock,
        },
        transport::mock::{
            Access,
            Mock,
        },
    };
    use std::sync::{
        Arc,
        Mutex,
    };

    const TABLE: &str = "
?register master_top.master.global.version 0x0 0xffffffff 1 r
?register master_top.master.global.config.n_part 0x1 0xf 1 r
?register master_top.master.global.config.n_chan 0x1 0xf0 1 r
?register master_top.master.global.csr.stat.ts_rdy 0x2 0x1 1 r
?register master_top.master.global.csr.stat.tx_err 0x2 0x2 1 r
?register master_top.master.tstamp.ctr 0x4 0xffffffff 2 r
?register master_top.master.scmd_gen.sel 0x8 0xf 1
?register master_top.master.scmd_gen.ctrl.en 0x9 0x1 1
?register master_top.master.scmd_gen.chan_ctrl.en 0xa 0x1 1
?register master_top.master.scmd_gen.chan_ctrl.patt 0xa 0x2 1
?register master_top.master.scmd_gen.chan_ctrl.force 0xa 0x4 1
?register master_top.master.scmd_gen.chan_ctrl.type 0xa 0xf0 1
?register master_top.master.scmd_gen.chan_ctrl.rate_div_d 0xa 0xf00 1
?register master_top.master.scmd_gen.chan_ctrl.rate_div_p 0xa 0x1ff000 1
?register master_top.master.echo.csr.ctrl.go 0xc 0x1 1
?register master_top.master.echo.csr.stat.rx_done 0xd 0x1 1 r
?register master_top.master.echo.csr.tx_l 0xe 0xffffffff 1 r
?register master_top.master.echo.csr.tx_h 0xf 0xffffffff 1 r
?register master_top.master.echo.csr.rx_l 0x10 0xffffffff 1 r
?register master_top.master.echo.csr.rx_h 0x11 0xffffffff 1 r
?register master_top.master.acmd.csr.ctrl.go 0x14 0x1 1
?register master_top.master.acmd.csr.ctrl.tx_en 0x14 0x2 1
?register master_top.master.acmd.csr.ctrl.update 0x14 0x4 1
?register master_top.master.acmd.csr.ctrl.addr 0x14 0xff00 1
?register master_top.master.acmd.csr.ctrl.cdel 0x15 0x1f 1
?register master_top.master.acmd.csr.ctrl.fdel 0x15 0x1e0 1
?register master_top.master.acmd.csr.ctrl.pdel 0x15 0x3f0000 1
?register master_top.master.partition1.csr.ctrl.part_en 0x24 0x1 1
?register master_top.master.partition1.csr.ctrl.buf_en 0x24 0x2 1
?register master_top.master.partition1.csr.ctrl.trig_ctr_rst 0x24 0x40 1
?register master_top.master.partition1.csr.ctrl.trig_mask 0x24 0xff00 1
";

    fn master() -> (Arc<Mutex<Hw<Mock>>>, MasterNode<Mock>) {
        let hw = mock_hw(TABLE);
        let master = MasterNode::new(Node::new(&hw, "master_top.master"));
        (hw, master)
    }

    #[test]
    fn test_fake_trigger_settings() {
        let s = fake_trigger_settings(1.0).unwrap();
        assert_eq!((s.divisor, s.prescale), (10, 191));
        assert!((s.actual - 0.998_61).abs() < 1e-4);
        // Fast rates pin the divisor at 0
        let s = fake_trigger_settings(12_500.0).unwrap();
        assert_eq!((s.divisor, s.prescale), (0, 16));
        assert!((s.actual - 12_207.03).abs() < 1e-2);
        assert!(matches!(
            fake_trigger_settings(0.001),
            Err(Error::RateOutOfRange(_))
        ));
        assert!(matches!(
            fake_trigger_settings(-1.0),
            Err(Error::RateOutOfRange(_))
        ));
    }

    #[test]
    fn test_firmware() {
        let (hw, master) = master();
        with_mock(&hw, |m| m.poke(0, 0x0004_0201));
        let version = master.check_firmware().unwrap();
        assert_eq!(version.to_string(), "4.2.1");
        with_mock(&hw, |m| m.poke(0, 0x0003_0a00));
        assert!(matches!(
            master.check_firmware(),
            Err(Error::IncompatibleFirmware {
                found: FirmwareVersion { major: 3, .. },
                required: 4
            })
        ));
    }

    #[test]
    fn test_partitions() {
        let (hw, master) = master();
        with_mock(&hw, |m| m.poke(1, 0x42));
        assert_eq!(
            master.read_generics().unwrap(),
            MasterGenerics {
                n_part: 2,
                n_chan: 4
            }
        );
        assert!(matches!(
            master.get_partition_node(2),
            Err(Error::InvalidPartition { id: 2, n_part: 2 })
        ));
        let part = master.configure_partition(1, 0xf).unwrap();
        assert_eq!(part.node().path(), "master_top.master.partition1");
        assert_eq!(with_mock(&hw, |m| m.peek(0x24)), 0xf201);
    }

    #[test]
    fn test_partition_mask_overflow() {
        let (hw, master) = master();
        with_mock(&hw, |m| m.poke(1, 0x42));
        assert!(matches!(
            master.configure_partition(1, 0x1000_0000),
            Err(Error::MaskOverflow {
                id: 1,
                phys_mask: 0x1000_0000
            })
        ));
        let hw = mock_hw(
            "
?register master.global.config.n_part 0x1 0xff 1 r
?register master.global.config.n_chan 0x1 0xf00 1 r
",
        );
        let master = MasterNode::new(Node::new(&hw, "master"));
        with_mock(&hw, |m| m.poke(1, 40));
        assert!(matches!(
            master.configure_partition(33, 0),
            Err(Error::MaskOverflow { id: 33, .. })
        ));
        assert!(with_mock(&hw, |m| m.log().iter().all(|a| matches!(a, Access::Read(_)))));
    }

    #[test]
    fn test_send_command() {
        let (hw, master) = master();
        with_mock(&hw, |m| {
            m.poke(4, 0x10);
            m.poke(5, 0x1);
        });
        let stamps = master.send_command(Command::RunStart, 2).unwrap();
        assert_eq!(stamps, vec![0x1_0000_0010; 2]);
        let writes = with_mock(&hw, |m| m.writes_to(0xa));
        assert_eq!(
            &writes[writes.len() - 6..],
            &[0x40, 0x44, 0x40, 0x40, 0x44, 0x40]
        );
    }

    #[test]
    fn test_fake_trigger() {
        let (hw, master) = master();
        let settings = master.configure_fake_trigger(1, 1.0, true).unwrap();
        assert_eq!(settings.prescale, 191);
        assert_eq!(with_mock(&hw, |m| m.peek(8)), 1);
        assert_eq!(with_mock(&hw, |m| m.peek(0xa)), 0xb_fa93);
        master.clear_fake_trigger(1).unwrap();
        assert_eq!(with_mock(&hw, |m| m.peek(0xa)), 0);
        assert!(matches!(
            master.configure_fake_trigger(4, 1.0, false),
            Err(Error::InvalidChannel(4))
        ));
    }

    #[test]
    fn test_rtt() {
        let (hw, master) = master();
        with_mock(&hw, |m| {
            m.script(0xd, [0, 1]);
            m.poke(0xe, 100);
            m.poke(0x10, 350);
        });
        let rtt = master
            .measure_endpoint_rtt(5, Duration::from_secs(1))
            .unwrap();
        assert_eq!(rtt, 250);
        assert_eq!(with_mock(&hw, |m| m.writes_to(0xc)), vec![1, 0]);
        assert_eq!(with_mock(&hw, |m| m.peek(0x14)), 0x500);
    }

    #[test]
    fn test_rtt_timeout() {
        let (_hw, master) = master();
        assert!(matches!(
            master.measure_endpoint_rtt(5, Duration::ZERO),
            Err(Error::Poll(PollError::Timeout { .. }))
        ));
    }

    #[test]
    fn test_endpoint_delay() {
        let (hw, master) = master();
        master.apply_endpoint_delay(3, 2, 5, 7).unwrap();
        assert_eq!(with_mock(&hw, |m| m.peek(0x15)), 0x0007_00a2);
        assert_eq!(
            with_mock(&hw, |m| m.writes_to(0x14)),
            vec![0x300, 0x304, 0x305, 0x304, 0x300]
        );
    }

    #[test]
    fn test_status() {
        let (hw, master) = master();
        with_mock(&hw, |m| {
            m.poke(0, 0x0004_0201);
            m.poke(1, 0x42);
            m.poke(2, 0x1);
        });
        let status = master.get_status().unwrap();
        assert!(status.contains("| Firmware version | 4.2.1"));
        assert!(status.contains("| Partitions       | 2"));
        assert!(status.contains("| ts_rdy | 0x1"));
    }
}
