//! Prelude (helpful reexports) for this package

pub use crate::{
    core::Device,
    design::{
        DynTopDesign,
        EndpointDesign,
        FanoutDesign,
        MasterDesign,
        TopDesign,
    },
    hw::Hw,
    node::{
        Node,
        TimingNode,
    },
    nodes::{
        endpoint::EndpointNode,
        io::{
            detect_io,
            IoSettings,
            TimingIo,
        },
        master::MasterNode,
        partition::PartitionNode,
    },
    transport::{
        local::Local,
        mock::Mock,
        Transport,
    },
};
pub use timing_utils::address_table::read_address_table;
