//! The spill interface of the master, gating triggers on the beam spill signal

use crate::{
    format::format_reg_table,
    node::{
        Node,
        TimingNode,
    },
    transport::{
        Error,
        Transport,
        TransportResult,
    },
};
use std::fmt::Write;

#[derive(Debug)]
pub struct SpillInterfaceNode<T> {
    node: Node<T>,
}

impl<T> SpillInterfaceNode<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(node: Node<T>) -> Self {
        Self { node }
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn enable(&self) -> TransportResult<()> {
        self.node.write("csr.ctrl.en", 1)?;
        self.node.dispatch()
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn disable(&self) -> TransportResult<()> {
        self.node.write("csr.ctrl.en", 0)?;
        self.node.dispatch()
    }

    /// Generate spills internally: `spill_len` long every `cycle_len`, in the firmware's units
    /// (defaults 16 and 8)
    /// # Errors
    /// Returns an error on transport errors or lengths that don't fit their fields
    pub fn enable_fake_spills(&self, cycle_len: u32, spill_len: u32) -> TransportResult<()> {
        self.node.write("csr.ctrl.fake_cyc_len", cycle_len)?;
        self.node.write("csr.ctrl.fake_spill_len", spill_len)?;
        self.node.write("csr.ctrl.en_fake", 1)?;
        self.node.dispatch()
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read_in_spill(&self) -> TransportResult<bool> {
        Ok(self.node.read("csr.stat.in_spill")? != 0)
    }
}

impl<T> TimingNode for SpillInterfaceNode<T>
where
    T: Transport,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let ctrl = self.node.read_sub_nodes("csr.ctrl")?;
        let stat = self.node.read_sub_nodes("csr.stat")?;
        let mut status = String::new();
        let _ = writeln!(status, "{}", format_reg_table(ctrl, "Spill interface controls", None));
        status.push_str(&format_reg_table(stat, "Spill interface state", None));
        Ok(status)
    }
}
