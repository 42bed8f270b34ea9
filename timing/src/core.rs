//! The core types for opening a timing device: a transport paired with the address table of the
//! firmware it runs
use crate::{
    hw::Hw,
    node::Node,
    transport::{
        local::Local,
        Transport,
        TransportResult,
    },
};
use std::{
    path::Path,
    sync::{
        Arc,
        Mutex,
    },
};
use thiserror::Error;
use timing_utils::address_table::{
    self,
    read_address_table,
    AddressTable,
};
use tracing::info;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    AddressTable(#[from] address_table::Error),
    #[error(transparent)]
    Transport(#[from] crate::transport::Error),
}

/// A connected device. Nodes handed out by it stay usable as long as the device lives.
#[derive(Debug)]
pub struct Device<T> {
    hw: Arc<Mutex<Hw<T>>>,
}

impl<T> Device<T>
where
    T: Transport,
{
    #[must_use]
    pub fn new(transport: T, table: AddressTable) -> Self {
        Self {
            hw: Hw::shared(transport, table),
        }
    }

    /// # Errors
    /// Returns an error if the address table can't be read or parsed
    pub fn from_table_file<P: AsRef<Path>>(transport: T, table: P) -> Result<Self, Error> {
        let table = read_address_table(table)?;
        info!(registers = table.registers.len(), "Address table loaded");
        Ok(Self::new(transport, table))
    }

    #[must_use]
    pub fn hw(&self) -> &Arc<Mutex<Hw<T>>> {
        &self.hw
    }

    /// The node at `path`, the root if empty
    #[must_use]
    pub fn node(&self, path: &str) -> Node<T> {
        Node::new(&self.hw, path)
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn read(&self, name: &str) -> TransportResult<u32> {
        self.node("").read(name)
    }

    /// Queue a write, see [`Hw::write`]
    /// # Errors
    /// Returns an error on unknown registers or values that don't fit
    pub fn write(&self, name: &str, value: u32) -> TransportResult<()> {
        self.node("").write(name, value)
    }

    /// # Errors
    /// Returns an error on transport errors
    pub fn dispatch(&self) -> TransportResult<()> {
        self.node("").dispatch()
    }
}

impl Device<Local> {
    /// Open the firmware mapped at the physical byte address `base_addr` through `/dev/mem`
    /// # Errors
    /// Returns an error on bad address tables or if the memory can't be mapped
    pub fn connect_local<P: AsRef<Path>>(table: P, base_addr: u64) -> Result<Self, Error> {
        let table = read_address_table(table)?;
        let local = Local::new(&table, base_addr).map_err(crate::transport::Error::from)?;
        Ok(Self::new(local, table))
    }
}

#[cfg(feature = "python")]
mod python {
    use super::Device;
    use crate::{
        node::TimingNode,
        nodes::{
            endpoint::EndpointNode,
            partition::PartitionNode,
        },
        transport::{
            local::Local,
            mock::Mock,
            Transport,
        },
    };
    use pyo3::prelude::*;
    use std::{
        path::PathBuf,
        time::Duration,
    };
    use timing_utils::address_table::read_address_table;

    type DynTransport = Box<dyn Transport + Send>;

    /// Seconds from Python as a `Duration`, rejecting negative and non-finite values
    fn seconds(s: f64) -> anyhow::Result<Duration> {
        Duration::try_from_secs_f64(s).map_err(|e| anyhow::anyhow!("Bad duration {s} s: {e}"))
    }

    #[pyclass(name = "Device")]
    struct PyDevice {
        device: Device<DynTransport>,
    }

    #[pymethods]
    impl PyDevice {
        /// Open the firmware mapped at `base_addr` through `/dev/mem`
        #[staticmethod]
        fn local(table: PathBuf, base_addr: u64) -> anyhow::Result<Self> {
            let table = read_address_table(table)?;
            let local = Local::new(&table, base_addr)?;
            Ok(Self {
                device: Device::new(Box::new(local), table),
            })
        }

        /// An in-memory device, for trying out scripts without hardware
        #[staticmethod]
        fn mock(table: PathBuf) -> anyhow::Result<Self> {
            Ok(Self {
                device: Device::from_table_file(Box::new(Mock::new()), table)?,
            })
        }

        fn read(&self, name: &str) -> anyhow::Result<u32> {
            Ok(self.device.read(name)?)
        }

        fn write(&self, name: &str, value: u32) -> anyhow::Result<()> {
            Ok(self.device.write(name, value)?)
        }

        fn dispatch(&self) -> anyhow::Result<()> {
            Ok(self.device.dispatch()?)
        }

        fn get_endpoint_node(&self, path: &str) -> PyEndpointNode {
            PyEndpointNode {
                _device: self.device.hw().clone(),
                node: EndpointNode::new(self.device.node(path)),
            }
        }

        fn get_partition_node(&self, path: &str) -> PyPartitionNode {
            PyPartitionNode {
                _device: self.device.hw().clone(),
                node: PartitionNode::new(self.device.node(path)),
            }
        }
    }

    type SharedHw = std::sync::Arc<std::sync::Mutex<crate::hw::Hw<DynTransport>>>;

    #[pyclass(name = "EndpointNode")]
    struct PyEndpointNode {
        // Keeps the hardware alive for as long as Python holds the node
        _device: SharedHw,
        node: EndpointNode<DynTransport>,
    }

    #[pymethods]
    impl PyEndpointNode {
        #[args(partition = "0", address = "0")]
        fn enable(&self, partition: u32, address: u32) -> anyhow::Result<()> {
            Ok(self.node.enable(partition, address)?)
        }

        fn disable(&self) -> anyhow::Result<()> {
            Ok(self.node.disable()?)
        }

        #[args(partition = "0", address = "0")]
        fn reset(&self, partition: u32, address: u32) -> anyhow::Result<()> {
            Ok(self.node.reset(partition, address)?)
        }

        fn read_timestamp(&self) -> anyhow::Result<u64> {
            Ok(self.node.read_timestamp()?)
        }

        fn read_buffer_count(&self) -> anyhow::Result<u32> {
            Ok(self.node.read_buffer_count()?)
        }

        #[args(read_all = "false")]
        fn read_data_buffer(&self, read_all: bool) -> anyhow::Result<Vec<u32>> {
            Ok(self.node.read_data_buffer(read_all)?)
        }

        #[args(read_all = "false")]
        fn get_data_buffer_table(&self, read_all: bool) -> anyhow::Result<String> {
            Ok(self.node.get_data_buffer_table(read_all)?)
        }

        fn read_clock_frequency(&self, gate_s: f64) -> anyhow::Result<f64> {
            Ok(self.node.read_clock_frequency(seconds(gate_s)?)?)
        }

        fn read_version(&self) -> anyhow::Result<u32> {
            Ok(self.node.read_version()?)
        }

        fn read_state(&self) -> anyhow::Result<u32> {
            Ok(self.node.read_state()?)
        }

        fn wait_for_ready(&self, timeout_s: f64) -> anyhow::Result<()> {
            Ok(self.node.wait_for_ready(seconds(timeout_s)?)?)
        }

        fn read_counters(&self) -> anyhow::Result<Vec<u32>> {
            Ok(self.node.read_counters()?)
        }

        fn get_status(&self) -> anyhow::Result<String> {
            Ok(self.node.get_status()?)
        }
    }

    #[pyclass(name = "PartitionNode")]
    struct PyPartitionNode {
        _device: SharedHw,
        node: PartitionNode<DynTransport>,
    }

    #[pymethods]
    impl PyPartitionNode {
        #[args(spill_gate = "false", rate_ctrl = "false")]
        fn configure(&self, trigger_mask: u32, spill_gate: bool, rate_ctrl: bool) -> anyhow::Result<()> {
            Ok(self.node.configure(trigger_mask, spill_gate, rate_ctrl)?)
        }

        #[args(on = "true")]
        fn enable(&self, on: bool) -> anyhow::Result<()> {
            Ok(self.node.enable(on, true)?)
        }

        fn reset(&self) -> anyhow::Result<()> {
            Ok(self.node.reset()?)
        }

        #[args(timeout_s = "5.0")]
        fn start(&self, timeout_s: f64) -> anyhow::Result<()> {
            Ok(self.node.start(seconds(timeout_s)?)?)
        }

        #[args(timeout_s = "5.0")]
        fn stop(&self, timeout_s: f64) -> anyhow::Result<()> {
            Ok(self.node.stop(seconds(timeout_s)?)?)
        }

        fn num_events_in_buffer(&self) -> anyhow::Result<usize> {
            Ok(self.node.num_events_in_buffer()?)
        }

        #[args(n = "0")]
        fn read_events(&self, n: usize) -> anyhow::Result<Vec<u32>> {
            Ok(self.node.read_events(n)?)
        }

        fn get_status(&self) -> anyhow::Result<String> {
            Ok(self.node.get_status()?)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_seconds() {
            assert_eq!(seconds(1.5).unwrap(), Duration::from_millis(1500));
            assert!(seconds(-1.0).is_err());
            assert!(seconds(f64::NAN).is_err());
            assert!(seconds(f64::INFINITY).is_err());
        }
    }

    #[pymodule]
    fn timing(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
        m.add_class::<PyDevice>()?;
        m.add_class::<PyEndpointNode>()?;
        m.add_class::<PyPartitionNode>()?;
        Ok(())
    }
}
