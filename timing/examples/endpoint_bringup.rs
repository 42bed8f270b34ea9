//! In this example, we open an endpoint design through `/dev/mem`, reset its IO board, enable the
//! first endpoint and wait for it to lock onto the timing stream.
//!
//! Usage: `endpoint_bringup <address table> <base address> [partition] [address]`

use anyhow::Context;
use std::time::Duration;
use timing::prelude::*;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let table = args.next().context("Missing address table path")?;
    let base = args.next().context("Missing base address")?;
    let base = u64::from_str_radix(base.trim_start_matches("0x"), 16)?;
    let partition = args.next().map(|s| s.parse()).transpose()?.unwrap_or(0);
    let address = args.next().map(|s| s.parse()).transpose()?.unwrap_or(0);

    let device = Device::connect_local(table, base)?;
    let design = EndpointDesign::new(DynTopDesign::detect(
        device.hw().clone(),
        IoSettings::from_env(),
    )?);

    // Bring up the clocks, then the endpoint
    design.top().reset(None)?;
    println!("{}", design.top().get_hardware_info()?);
    design.enable(0, partition, address)?;

    let ept = design.top().get_endpoint_node(0)?;
    ept.wait_for_ready(Duration::from_secs(5))?;
    println!("{}", ept.get_status()?);
    Ok(())
}
