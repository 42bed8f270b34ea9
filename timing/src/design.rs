//! Firmware designs: the top level of a device's node tree, tying the board's IO block to the
//! endpoints or master the firmware was built with

use crate::{
    hw::Hw,
    node::{
        Node,
        TimingNode,
    },
    nodes::{
        endpoint::{
            self,
            EndpointNode,
        },
        io::{
            self,
            detect_io,
            IoSettings,
            Pc059Io,
            TimingIo,
        },
        master::{
            self,
            MasterNode,
        },
        spill::SpillInterfaceNode,
        trigger_receiver::TriggerReceiverNode,
    },
    transport::{
        Transport,
        TransportResult,
    },
};
use std::{
    fmt::Write,
    path::Path,
    sync::{
        Arc,
        Mutex,
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
    Io(#[from] io::Error),
    #[error(transparent)]
    Endpoint(#[from] endpoint::Error),
    #[error(transparent)]
    Master(#[from] master::Error),
    #[error("Endpoint {id} doesn't exist, the design has {count}")]
    InvalidEndpoint { id: u32, count: u32 },
}

pub type DesignResult<T> = Result<T, Error>;

/// Path of the board IO block in every design
pub const IO_PATH: &str = "io";
pub const MASTER_PATH: &str = "master_top.master";
pub const TRIGGER_RECEIVER_PATH: &str = "master_top.trig";
pub const SPILL_PATH: &str = "master_top.spill";

/// Wait after switching the fanout input mux before the CDR status means anything
pub const DEFAULT_MUX_SETTLE: Duration = Duration::from_millis(100);

/// A design's node tree. Owns the hardware handle every node below it points into.
#[derive(Debug)]
pub struct TopDesign<T, IO: ?Sized> {
    hw: Arc<Mutex<Hw<T>>>,
    root: Node<T>,
    io: Box<IO>,
}

/// A design whose board is only known at runtime
pub type DynTopDesign<T> = TopDesign<T, dyn TimingIo<T>>;

impl<T> TopDesign<T, dyn TimingIo<T>>
where
    T: Transport + 'static,
{
    /// Pick the IO implementation from the board type the firmware reports
    /// # Errors
    /// Returns an error on transport errors or boards without an IO implementation
    pub fn detect(hw: Arc<Mutex<Hw<T>>>, settings: IoSettings) -> DesignResult<Self> {
        let io = detect_io(Node::new(&hw, IO_PATH), settings)?;
        Ok(Self::with_io(hw, io))
    }
}

impl<T, IO> TopDesign<T, IO>
where
    T: Transport,
    IO: TimingIo<T> + ?Sized,
{
    #[must_use]
    pub fn with_io(hw: Arc<Mutex<Hw<T>>>, io: Box<IO>) -> Self {
        let root = Node::new(&hw, "");
        Self { hw, root, io }
    }

    #[must_use]
    pub fn hw(&self) -> &Arc<Mutex<Hw<T>>> {
        &self.hw
    }

    /// The node `name` of this design
    #[must_use]
    pub fn node(&self, name: &str) -> Node<T> {
        self.root.child(name)
    }

    #[must_use]
    pub fn get_io_node(&self) -> &IO {
        &self.io
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn soft_reset(&self) -> TransportResult<()> {
        self.io.io().soft_reset()
    }

    /// Reset the board, see [`TimingIo::reset`]
    /// # Errors
    /// Returns an error on bus errors or bad configuration files
    pub fn reset(&self, config: Option<&Path>) -> DesignResult<()> {
        Ok(self.io.reset(config)?)
    }

    /// Number of `endpointN` nodes in the design
    #[must_use]
    pub fn get_number_of_endpoint_nodes(&self) -> u32 {
        (0u32..)
            .take_while(|i| self.root.exists(&format!("endpoint{i}")))
            .count()
            .try_into()
            .unwrap_or(u32::MAX)
    }

    /// # Errors
    /// Returns an error if the design has no endpoint `id`
    pub fn get_endpoint_node(&self, id: u32) -> DesignResult<EndpointNode<T>> {
        let count = self.get_number_of_endpoint_nodes();
        if id >= count {
            return Err(Error::InvalidEndpoint { id, count });
        }
        Ok(EndpointNode::new(self.node(&format!("endpoint{id}"))))
    }

    /// # Errors
    /// Returns an error on bus errors
    pub fn get_hardware_info(&self) -> DesignResult<String> {
        Ok(self.io.io().get_hardware_info()?)
    }
}

/// A design with one or more endpoints
#[derive(Debug)]
pub struct EndpointDesign<T, IO: ?Sized> {
    top: TopDesign<T, IO>,
}

impl<T, IO> EndpointDesign<T, IO>
where
    T: Transport,
    IO: TimingIo<T> + ?Sized,
{
    #[must_use]
    pub fn new(top: TopDesign<T, IO>) -> Self {
        Self { top }
    }

    #[must_use]
    pub fn top(&self) -> &TopDesign<T, IO> {
        &self.top
    }

    /// Enable endpoint `ept` in `partition` with `address`, see [`EndpointNode::enable`]
    /// # Errors
    /// Returns an error on transport errors or missing endpoints
    pub fn enable(&self, ept: u32, partition: u32, address: u32) -> DesignResult<()> {
        self.top
            .get_endpoint_node(ept)?
            .enable(partition, address)?;
        Ok(())
    }
}

impl<T, IO> TimingNode for EndpointDesign<T, IO>
where
    T: Transport,
    IO: TimingIo<T> + ?Sized,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let mut status = self.top.get_io_node().io().get_pll_status()?;
        status.push('\n');
        for i in 0..self.top.get_number_of_endpoint_nodes() {
            let _ = writeln!(status, "Endpoint {i}:");
            let _ = writeln!(status, "{}", self.top.get_endpoint_node(i)?.get_status()?);
        }
        Ok(status)
    }
}

/// A master design: the master itself, its external trigger receiver and spill interface
#[derive(Debug)]
pub struct MasterDesign<T, IO: ?Sized> {
    top: TopDesign<T, IO>,
}

impl<T, IO> MasterDesign<T, IO>
where
    T: Transport,
    IO: TimingIo<T> + ?Sized,
{
    #[must_use]
    pub fn new(top: TopDesign<T, IO>) -> Self {
        Self { top }
    }

    #[must_use]
    pub fn top(&self) -> &TopDesign<T, IO> {
        &self.top
    }

    #[must_use]
    pub fn get_master_node(&self) -> MasterNode<T> {
        MasterNode::new(self.top.node(MASTER_PATH))
    }

    #[must_use]
    pub fn get_external_trigger_node(&self) -> TriggerReceiverNode<T> {
        TriggerReceiverNode::new(self.top.node(TRIGGER_RECEIVER_PATH))
    }

    #[must_use]
    pub fn get_spill_interface_node(&self) -> SpillInterfaceNode<T> {
        SpillInterfaceNode::new(self.top.node(SPILL_PATH))
    }

    /// # Errors
    /// Returns an error on transport errors or if the echo doesn't come back within `timeout`
    pub fn measure_endpoint_rtt(&self, addr: u32, timeout: Duration) -> DesignResult<u64> {
        Ok(self.get_master_node().measure_endpoint_rtt(addr, timeout)?)
    }

    /// Send the endpoint at `addr` its delays, then, if `measure_rtt`, measure its round trip
    /// with them applied
    /// # Errors
    /// Returns an error on transport errors, out of range delays or echo timeouts
    pub fn apply_endpoint_delay(
        &self,
        addr: u32,
        coarse: u32,
        fine: u32,
        phase: u32,
        measure_rtt: Option<Duration>,
    ) -> DesignResult<Option<u64>> {
        let master = self.get_master_node();
        master.apply_endpoint_delay(addr, coarse, fine, phase)?;
        match measure_rtt {
            Some(timeout) => {
                let rtt = master.measure_endpoint_rtt(addr, timeout)?;
                info!(addr, rtt, "Round trip with delays applied");
                Ok(Some(rtt))
            }
            None => Ok(None),
        }
    }
}

impl<T, IO> TimingNode for MasterDesign<T, IO>
where
    T: Transport,
    IO: TimingIo<T> + ?Sized,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        let mut status = String::new();
        let _ = writeln!(status, "{}", self.top.get_io_node().io().get_pll_status()?);
        let _ = writeln!(status, "{}", self.get_master_node().get_status()?);
        let _ = writeln!(status, "{}", self.get_external_trigger_node().get_status()?);
        status.push_str(&self.get_spill_interface_node().get_status()?);
        Ok(status)
    }
}

/// A PC059 running as a fanout
#[derive(Debug)]
pub struct FanoutDesign<T> {
    top: TopDesign<T, Pc059Io<T>>,
}

impl<T> FanoutDesign<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(top: TopDesign<T, Pc059Io<T>>) -> Self {
        Self { top }
    }

    #[must_use]
    pub fn top(&self) -> &TopDesign<T, Pc059Io<T>> {
        &self.top
    }

    /// # Errors
    /// Returns an error on transport errors or channels that don't fit
    pub fn switch_sfp_mux_channel(&self, chan: u32) -> TransportResult<()> {
        self.top.get_io_node().switch_sfp_mux_channel(chan)?;
        info!(chan, "Fanout SFP mux switched");
        Ok(())
    }

    /// Fanout channels whose SFP has signal and the CDR locked onto it, waiting `settle` after
    /// each mux switch. Leaves the mux on the last channel.
    /// # Errors
    /// Returns an error on transport errors
    pub fn scan_sfp_mux(&self, settle: Duration) -> TransportResult<Vec<u32>> {
        let pc059 = self.top.get_io_node();
        let node = pc059.io().node();
        let mut locked = vec![];
        for chan in 0..io::pc059::FANOUT_SFPS {
            pc059.switch_sfp_mux_channel(chan)?;
            std::thread::sleep(settle);
            let lol = node.read("csr.stat.cdr_lol")?;
            let los = node.read("csr.stat.cdr_los")?;
            debug!(chan, lol, los, "Fanout channel CDR state");
            if lol == 0 && los == 0 {
                info!(chan, "Signal and CDR lock on fanout channel");
                locked.push(chan);
            }
        }
        Ok(locked)
    }
}

impl<T> TimingNode for FanoutDesign<T>
where
    T: Transport,
{
    type Error = Error;

    fn get_status(&self) -> Result<String, Self::Error> {
        Ok(self.top.get_io_node().get_status()?)
    }
}
