//! Timing endpoints: the receivers that lock onto the timing stream, keep a local copy of the
//! timestamp and buffer the commands addressed to their partition

use super::frequency::FrequencyCounter;
use crate::{
    definitions::{
        Command,
        EndpointState,
        COMMAND_NUMBER,
        WORDS_PER_EVENT,
    },
    format::{
        format_reg_table,
        format_reg_value,
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
    fmt::Write,
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
}

/// Interval between state reads while waiting for an endpoint to lock
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct EndpointNode<T> {
    node: Node<T>,
}

impl<T> EndpointNode<T>
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

    /// Join `partition`, taking `address` (0 keeps the address from the firmware), clear the
    /// counters and enable the endpoint and its buffer
    /// # Errors
    /// Returns an error on transport errors or out of range values
    pub fn enable(&self, partition: u32, address: u32) -> TransportResult<()> {
        self.node.write("csr.ctrl.tgrp", partition)?;
        if address == 0 {
            self.node.write("csr.ctrl.int_addr", 0)?;
        } else {
            self.node.write("csr.ctrl.int_addr", 1)?;
            self.node.write("csr.ctrl.addr", address)?;
        }
        self.node.pulse("csr.ctrl.ctr_rst")?;
        self.node.write("csr.ctrl.ep_en", 1)?;
        self.node.write("csr.ctrl.buf_en", 1)?;
        self.node.dispatch()?;
        info!(endpoint = self.node.path(), partition, address, "Endpoint enabled");
        Ok(())
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn disable(&self) -> TransportResult<()> {
        self.node.write("csr.ctrl.ep_en", 0)?;
        self.node.write("csr.ctrl.buf_en", 0)?;
        self.node.dispatch()
    }

    /// Disable then re-enable, see [`EndpointNode::enable`]
    /// # Errors
    /// Returns an error on transport errors
    pub fn reset(&self, partition: u32, address: u32) -> TransportResult<()> {
        self.node.write("csr.ctrl.ep_en", 0)?;
        self.node.write("csr.ctrl.buf_en", 0)?;
        self.enable(partition, address)
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_timestamp(&self) -> TransportResult<u64> {
        Ok(tstamp2int(&self.node.read_block("tstamp", 2)?))
    }

    /// Words waiting in the readout buffer
    /// # Errors
    /// Returns an error on transport errors
    pub fn read_buffer_count(&self) -> TransportResult<u32> {
        self.node.read("buf.count")
    }

    /// Drain the readout buffer, only whole events unless `read_all`
    /// # Errors
    /// Returns an error on transport errors or short reads
    pub fn read_data_buffer(&self, read_all: bool) -> TransportResult<Vec<u32>> {
        let count = self.read_buffer_count()? as usize;
        let events = count / WORDS_PER_EVENT;
        let words = if read_all {
            count
        } else {
            events * WORDS_PER_EVENT
        };
        info!(available = count, events, words, "Reading endpoint buffer");
        if words == 0 {
            debug!("No words to be read out");
            return Ok(vec![]);
        }
        self.node.read_block("buf.data", words)
    }

    /// The readout buffer as an indexed table
    /// # Errors
    /// Returns an error on transport errors or short reads
    pub fn get_data_buffer_table(&self, read_all: bool) -> TransportResult<String> {
        let data = self.read_data_buffer(read_all)?;
        let rows = data
            .into_iter()
            .enumerate()
            .map(|(i, w)| (format!("{i:04}"), w));
        Ok(format_reg_table(rows, "Endpoint buffer", Some(("Word", "Data"))))
    }

    /// Frequency of the recovered clock in MHz
    /// # Errors
    /// Returns an error on transport errors
    pub fn read_clock_frequency(&self, gate: Duration) -> TransportResult<f64> {
        FrequencyCounter::with_gate(self.node.child("freq"), gate).measure(0, 1)
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_version(&self) -> TransportResult<u32> {
        self.node.read("version")
    }

    /// The raw state code of the endpoint state machine
    /// # Errors
    /// Returns an error on transport errors
    pub fn read_state(&self) -> TransportResult<u32> {
        self.node.read("csr.stat.ep_stat")
    }

    /// Poll the state machine until it reports ready
    /// # Errors
    /// Returns an error on transport errors or if the endpoint isn't ready within `timeout`
    pub fn wait_for_ready(&self, timeout: Duration) -> Result<(), Error> {
        let ready = EndpointState::Ready.code();
        self.node
            .poll("csr.stat.ep_stat", |s| s == ready, timeout, READY_POLL_INTERVAL)?;
        info!(endpoint = self.node.path(), "Endpoint ready");
        Ok(())
    }

    /// Per command receive counters
    /// # Errors
    /// Returns an error on transport errors
    pub fn read_counters(&self) -> TransportResult<Vec<u32>> {
        self.node.read_block("ctrs", COMMAND_NUMBER)
    }
}

impl<T> TimingNode for EndpointNode<T>
where
    T: Transport,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let tstamp = self.read_timestamp()?;
        let event_ctr = self.node.read("evtctr")?;
        let buf_count = self.read_buffer_count()?;
        let ctrl = self.node.read_sub_nodes("csr.ctrl")?;
        let stat = self.node.read_sub_nodes("csr.stat")?;
        let counters = self.read_counters()?;

        let field = |map: &std::collections::BTreeMap<String, u32>, name: &str| {
            map.get(name).copied().unwrap_or_default()
        };
        let summary = [
            ("State", EndpointState::describe(field(&stat, "ep_stat"))),
            ("Partition", field(&ctrl, "tgrp").to_string()),
            ("Address", field(&ctrl, "addr").to_string()),
            ("Timestamp", format_timestamp(tstamp)),
            ("Timestamp (hex)", format!("{tstamp:#x}")),
            ("EventCounter", event_ctr.to_string()),
            (
                "Buffer status",
                if field(&stat, "buf_err") == 0 {
                    "OK".to_owned()
                } else {
                    "Error".to_owned()
                },
            ),
            ("Buffer occupancy", buf_count.to_string()),
        ];
        let command_counters = (0u32..).zip(&counters).map(|(i, c)| {
            let name = Command::from_code(i).map_or_else(|| format_reg_value(i), |c| c.to_string());
            (name, c.to_string())
        });

        let mut status = String::new();
        let _ = writeln!(status, "{}", format_reg_table(summary, "Endpoint summary", None));
        let _ = writeln!(status, "{}", format_reg_table(stat, "Endpoint state", None));
        status.push_str(&format_reg_table(
            command_counters,
            "Endpoint counters",
            Some(("Command", "Counter")),
        ));
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
        transport::mock::Mock,
    };
    use std::sync::{
        Arc,
        Mutex,
    };

    const TABLE: &str = "
?register endpoint0.csr.ctrl.ep_en 0x0 0x1 1
?register endpoint0.csr.ctrl.buf_en 0x0 0x2 1
?register endpoint0.csr.ctrl.ctr_rst 0x0 0x4 1
?register endpoint0.csr.ctrl.int_addr 0x0 0x8 1
?register endpoint0.csr.ctrl.tgrp 0x0 0x30 1
?register endpoint0.csr.ctrl.addr 0x0 0xff00 1
?register endpoint0.csr.stat.ep_stat 0x1 0xf 1 r
?register endpoint0.csr.stat.buf_err 0x1 0x10 1 r
?register endpoint0.tstamp 0x2 0xffffffff 2 r
?register endpoint0.evtctr 0x4 0xffffffff 1 r
?register endpoint0.buf.count 0x5 0xffff 1 r
?register endpoint0.buf.data 0x6 0xffffffff 1024 r fifo
?register endpoint0.version 0x7 0xffffffff 1 r
?register endpoint0.ctrs 0x10 0xffffffff 16 r
";

    fn endpoint() -> (Arc<Mutex<Hw<Mock>>>, EndpointNode<Mock>) {
        let hw = mock_hw(TABLE);
        let ep = EndpointNode::new(Node::new(&hw, "endpoint0"));
        (hw, ep)
    }

    #[test]
    fn test_enable() {
        let (hw, ep) = endpoint();
        ep.enable(2, 0x34).unwrap();
        assert_eq!(with_mock(&hw, |m| m.peek(0)), 0x3423 | 0x08);
        // Counters were reset then released
        let writes = with_mock(&hw, |m| m.writes_to(0));
        assert!(writes.iter().any(|w| w & 0x4 != 0));
        ep.disable().unwrap();
        assert_eq!(with_mock(&hw, |m| m.peek(0)) & 0x3, 0);
    }

    #[test]
    fn test_enable_firmware_address() {
        let (hw, ep) = endpoint();
        with_mock(&hw, |m| m.poke(0, 0x08));
        ep.reset(1, 0).unwrap();
        assert_eq!(with_mock(&hw, |m| m.peek(0)), 0x13);
    }

    #[test]
    fn test_read_data_buffer() {
        let (hw, ep) = endpoint();
        with_mock(&hw, |m| {
            m.poke(5, 14);
            m.fill_fifo(6, 0..14);
        });
        let data = ep.read_data_buffer(false).unwrap();
        assert_eq!(data, (0..12).collect::<Vec<_>>());
        assert_eq!(with_mock(&hw, |m| m.fifo_len(6)), 2);
        with_mock(&hw, |m| m.poke(5, 2));
        assert_eq!(ep.read_data_buffer(true).unwrap(), vec![12, 13]);
        with_mock(&hw, |m| m.poke(5, 0));
        assert!(ep.read_data_buffer(false).unwrap().is_empty());
    }

    #[test]
    fn test_short_buffer_read() {
        let (hw, ep) = endpoint();
        with_mock(&hw, |m| {
            m.poke(5, 6);
            m.fill_fifo(6, 0..3);
        });
        assert!(matches!(
            ep.read_data_buffer(false),
            Err(crate::transport::Error::WordCount {
                expected: 6,
                got: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_timestamp() {
        let (hw, ep) = endpoint();
        with_mock(&hw, |m| {
            m.poke(2, 0x2);
            m.poke(3, 0x1);
        });
        assert_eq!(ep.read_timestamp().unwrap(), 0x1_0000_0002);
    }

    #[test]
    fn test_wait_for_ready() {
        let (hw, ep) = endpoint();
        with_mock(&hw, |m| m.script(1, [0x2, 0x6, 0x8]));
        ep.wait_for_ready(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            ep.wait_for_ready(Duration::ZERO),
            Err(Error::Poll(PollError::Timeout { .. }))
        ));
    }

    #[test]
    fn test_status() {
        let (hw, ep) = endpoint();
        with_mock(&hw, |m| {
            m.poke(0, 0x0a13);
            m.poke(1, 0x8);
            m.poke(4, 42);
            m.write_words(0x10, &[5, 6]).unwrap();
        });
        let status = ep.get_status().unwrap();
        assert!(status.contains("Ready (0x8)"));
        assert!(status.contains("| Partition        | 1"));
        assert!(status.contains("| Address          | 10"));
        assert!(status.contains("| EventCounter     | 42"));
        assert!(status.contains("| Buffer status    | OK"));
        assert!(status.contains("| TimeSync    | 5"));
        assert!(status.contains("| Echo        | 6"));
    }
}
