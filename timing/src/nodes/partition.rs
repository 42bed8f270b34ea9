//! Partitions of the timing master: independent groups of endpoints with their own trigger mask,
//! run control and readout buffer

use crate::{
    definitions::WORDS_PER_EVENT,
    format::{
        format_counters_table,
        format_reg_table,
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
    collections::BTreeMap,
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
    #[error("Requested {requested} events but only {available} are in the buffer")]
    EventRead { requested: usize, available: usize },
    #[error("Run request not acknowledged within {0:?}")]
    RunRequestTimeout(Duration),
}

impl From<PollError> for Error {
    fn from(e: PollError) -> Self {
        match e {
            PollError::Transport(e) => Self::Transport(e),
            PollError::Timeout { timeout, .. } => Self::RunRequestTimeout(timeout),
        }
    }
}

/// Interval between `in_run` reads while waiting on a run request
pub const RUN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Accepted and rejected command counters of a partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionCounts {
    pub accepted: Vec<u32>,
    pub rejected: Vec<u32>,
}

/// Monitoring snapshot of a partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionMonitorData {
    pub enabled: bool,
    pub spill_interface_enabled: bool,
    pub trig_enabled: bool,
    pub trig_mask: u32,
    pub rate_ctrl_enabled: bool,
    pub frag_mask: u32,
    pub buffer_enabled: bool,
    pub in_run: bool,
    pub in_spill: bool,
    pub buffer_warning: bool,
    pub buffer_error: bool,
    pub buffer_occupancy: u32,
}

#[derive(Debug)]
pub struct PartitionNode<T> {
    node: Node<T>,
}

impl<T> PartitionNode<T>
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
    pub fn enable(&self, on: bool, dispatch: bool) -> TransportResult<()> {
        self.node.write("csr.ctrl.part_en", on.into())?;
        if dispatch {
            self.node.dispatch()?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error on transport errors or a mask that doesn't fit
    pub fn configure(&self, trigger_mask: u32, spill_gate: bool, rate_ctrl: bool) -> TransportResult<()> {
        self.node.write("csr.ctrl.rate_ctrl_en", rate_ctrl.into())?;
        self.node.write("csr.ctrl.trig_mask", trigger_mask)?;
        self.node.write("csr.ctrl.spill_gate_en", spill_gate.into())?;
        self.node.dispatch()
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn configure_rate_ctrl(&self, rate_ctrl: bool) -> TransportResult<()> {
        self.node.write("csr.ctrl.rate_ctrl_en", rate_ctrl.into())?;
        self.node.dispatch()
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn enable_triggers(&self, on: bool) -> TransportResult<()> {
        self.node.write("csr.ctrl.trig_en", on.into())?;
        self.node.dispatch()
    }

    /// # Errors
    /// Returns an error on transport errors or a mask that doesn't fit
    pub fn write_trigger_mask(&self, mask: u32) -> TransportResult<()> {
        self.node.write("csr.ctrl.trig_mask", mask)?;
        self.node.dispatch()
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_trigger_mask(&self) -> TransportResult<u32> {
        self.node.read("csr.ctrl.trig_mask")
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_buffer_word_count(&self) -> TransportResult<u32> {
        self.node.read("buf.count")
    }

    /// Complete events waiting in the buffer
    /// # Errors
    /// Returns an error on transport errors
    pub fn num_events_in_buffer(&self) -> TransportResult<usize> {
        Ok(self.read_buffer_word_count()? as usize / WORDS_PER_EVENT)
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_rob_warning_overflow(&self) -> TransportResult<bool> {
        Ok(self.node.read("csr.stat.buf_warn")? != 0)
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_rob_error(&self) -> TransportResult<bool> {
        Ok(self.node.read("csr.stat.buf_err")? != 0)
    }

    /// Read `n` events out of the buffer, or every complete event when `n` is 0
    /// # Errors
    /// Returns an error on transport errors, short reads or if fewer than `n` events are there
    pub fn read_events(&self, n: usize) -> Result<Vec<u32>, Error> {
        let available = self.num_events_in_buffer()?;
        let requested = if n == 0 { available } else { n };
        if available < requested {
            return Err(Error::EventRead {
                requested,
                available,
            });
        }
        let words = requested * WORDS_PER_EVENT;
        debug!(events = requested, words, "Reading partition buffer");
        if words == 0 {
            return Ok(vec![]);
        }
        Ok(self.node.read_block("buf.data", words)?)
    }

    /// Disable the partition and its buffer and clear the trigger counters
    /// # Errors
    /// Returns an error on transport errors
    pub fn reset(&self) -> TransportResult<()> {
        self.node.write("csr.ctrl.part_en", 0)?;
        self.node.write("csr.ctrl.buf_en", 0)?;
        self.node.pulse("csr.ctrl.trig_ctr_rst")?;
        self.node.dispatch()
    }

    /// Flush the buffer and request a run, waiting for the firmware to enter it
    /// # Errors
    /// Returns an error on transport errors or if the run doesn't start within `timeout`
    pub fn start(&self, timeout: Duration) -> Result<(), Error> {
        self.node.write("csr.ctrl.trig_en", 0)?;
        self.node.write("csr.ctrl.buf_en", 0)?;
        self.node.dispatch()?;
        // Re-enabling the buffer flushes it
        self.node.write("csr.ctrl.buf_en", 1)?;
        self.node.dispatch()?;
        self.node.write("csr.ctrl.run_req", 1)?;
        self.node.dispatch()?;
        self.node
            .poll("csr.stat.in_run", |v| v != 0, timeout, RUN_POLL_INTERVAL)?;
        info!(partition = self.node.id(), "Run started");
        Ok(())
    }

    /// Withdraw the run request and wait for the firmware to leave the run
    /// # Errors
    /// Returns an error on transport errors or if the run doesn't stop within `timeout`
    pub fn stop(&self, timeout: Duration) -> Result<(), Error> {
        self.node.write("csr.ctrl.run_req", 0)?;
        self.node.dispatch()?;
        self.node
            .poll("csr.stat.in_run", |v| v == 0, timeout, RUN_POLL_INTERVAL)?;
        info!(partition = self.node.id(), "Run stopped");
        Ok(())
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_command_counts(&self) -> TransportResult<PartitionCounts> {
        Ok(PartitionCounts {
            accepted: self.node.read_block_all("actrs")?,
            rejected: self.node.read_block_all("rctrs")?,
        })
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn get_info(&self) -> TransportResult<PartitionMonitorData> {
        let ctrl = self.node.read_sub_nodes("csr.ctrl")?;
        let stat = self.node.read_sub_nodes("csr.stat")?;
        let buffer_occupancy = self.read_buffer_word_count()?;
        let get = |map: &BTreeMap<String, u32>, name: &str| map.get(name).copied().unwrap_or_default();
        Ok(PartitionMonitorData {
            enabled: get(&ctrl, "part_en") != 0,
            spill_interface_enabled: get(&ctrl, "spill_gate_en") != 0,
            trig_enabled: get(&ctrl, "trig_en") != 0,
            trig_mask: get(&ctrl, "trig_mask"),
            rate_ctrl_enabled: get(&ctrl, "rate_ctrl_en") != 0,
            frag_mask: get(&ctrl, "frag_mask"),
            buffer_enabled: get(&ctrl, "buf_en") != 0,
            in_run: get(&stat, "in_run") != 0,
            in_spill: get(&stat, "in_spill") != 0,
            buffer_warning: get(&stat, "buf_warn") != 0,
            buffer_error: get(&stat, "buf_err") != 0,
            buffer_occupancy,
        })
    }
}

impl<T> TimingNode for PartitionNode<T>
where
    T: Transport,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let ctrl = self.node.read_sub_nodes("csr.ctrl")?;
        let stat = self.node.read_sub_nodes("csr.stat")?;
        let event_ctr = self.node.read("evtctr")?;
        let buf_count = self.read_buffer_word_count()?;
        let counts = self.read_command_counts()?;
        let buf_err = stat.get("buf_err").copied().unwrap_or_default();

        let id = self.node.id();
        let number = id.strip_prefix("partition").unwrap_or(id);
        let mut status = String::new();
        let _ = writeln!(status, "=> Partition {number}\n");
        let _ = writeln!(status, "{}", format_reg_table(ctrl, "Controls", None));
        let _ = writeln!(status, "{}", format_reg_table(stat, "State", None));
        let _ = writeln!(status, "Event Counter: {event_ctr}");
        let _ = writeln!(
            status,
            "Buffer status: {}",
            if buf_err == 0 { "OK" } else { "Error" }
        );
        let _ = writeln!(status, "Buffer occupancy: {buf_count}\n");
        status.push_str(&format_counters_table(
            &[counts.accepted, counts.rejected],
            &["Accept counters", "Reject counters"],
        ));
        Ok(status)
    }
}
