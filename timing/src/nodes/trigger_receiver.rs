//! The external trigger receiver: an endpoint listening for triggers from a trigger interface
//! board and forwarding them to the master

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
use tracing::info;

#[derive(Debug)]
pub struct TriggerReceiverNode<T> {
    node: Node<T>,
}

impl<T> TriggerReceiverNode<T>
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
        self.node.write("csr.ctrl.ep_en", 1)?;
        self.node.dispatch()
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn disable(&self) -> TransportResult<()> {
        self.node.write("csr.ctrl.ep_en", 0)?;
        self.node.dispatch()
    }

    /// Pulse the receiver's reset and re-enable its endpoint
    /// # Errors
    /// Returns an error on transport errors
    pub fn reset(&self) -> TransportResult<()> {
        self.node.write("csr.ctrl.ep_en", 0)?;
        self.node.pulse("csr.ctrl.rst")?;
        self.node.write("csr.ctrl.ep_en", 1)?;
        self.node.dispatch()?;
        info!(node = self.node.path(), "Trigger receiver reset");
        Ok(())
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn enable_triggers(&self) -> TransportResult<()> {
        self.node.write("csr.ctrl.ext_trig_en", 1)?;
        self.node.dispatch()
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn disable_triggers(&self) -> TransportResult<()> {
        self.node.write("csr.ctrl.ext_trig_en", 0)?;
        self.node.dispatch()
    }
}

impl<T> TimingNode for TriggerReceiverNode<T>
where
    T: Transport,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let ctrl = self.node.read_sub_nodes("csr.ctrl")?;
        let stat = self.node.read_sub_nodes("csr.stat")?;
        let mut status = String::new();
        let _ = writeln!(status, "{}", format_reg_table(ctrl, "Trigger receiver controls", None));
        status.push_str(&format_reg_table(stat, "Trigger receiver state", None));
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{
        mock_hw,
        with_mock,
    };

    const TABLE: &str = "
?register trig_rx.csr.ctrl.ep_en 0x0 0x1 1
?register trig_rx.csr.ctrl.ext_trig_en 0x0 0x2 1
?register trig_rx.csr.ctrl.rst 0x0 0x4 1
?register trig_rx.csr.stat.ep_stat 0x1 0xf 1 r
?register trig_rx.csr.stat.ep_rdy 0x1 0x10 1 r
";

    #[test]
    fn test_controls() {
        let hw = mock_hw(TABLE);
        let rx = TriggerReceiverNode::new(Node::new(&hw, "trig_rx"));
        rx.enable().unwrap();
        rx.enable_triggers().unwrap();
        assert_eq!(with_mock(&hw, |m| m.peek(0)), 0x3);
        rx.disable_triggers().unwrap();
        rx.disable().unwrap();
        assert_eq!(with_mock(&hw, |m| m.peek(0)), 0x0);
    }

    #[test]
    fn test_reset() {
        let hw = mock_hw(TABLE);
        let rx = TriggerReceiverNode::new(Node::new(&hw, "trig_rx"));
        with_mock(&hw, |m| m.poke(0, 0x3));
        rx.reset().unwrap();
        assert_eq!(with_mock(&hw, |m| m.writes_to(0)), vec![0x2, 0x6, 0x2, 0x3]);
    }

    #[test]
    fn test_status() {
        let hw = mock_hw(TABLE);
        let rx = TriggerReceiverNode::new(Node::new(&hw, "trig_rx"));
        with_mock(&hw, |m| m.poke(1, 0x18));
        let status = rx.get_status().unwrap();
        assert!(status.contains("| ep_rdy  | 0x1"));
        assert!(status.contains("| ep_stat | 0x8"));
    }
}
