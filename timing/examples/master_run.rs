//! In this example, we configure partition 0 of a master design, run it for a few seconds with a
//! fake trigger and print the events it recorded.
//!
//! Usage: `master_run <address table> <base address> [trigger rate Hz]`

use anyhow::Context;
use std::time::Duration;
use timing::prelude::*;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let table = args.next().context("Missing address table path")?;
    let base = args.next().context("Missing base address")?;
    let base = u64::from_str_radix(base.trim_start_matches("0x"), 16)?;
    let rate = args.next().map(|s| s.parse()).transpose()?.unwrap_or(1.0);

    let device = Device::connect_local(table, base)?;
    let design = MasterDesign::new(DynTopDesign::detect(
        device.hw().clone(),
        IoSettings::from_env(),
    )?);
    design.top().reset(None)?;

    let master = design.get_master_node();
    master.check_firmware()?;
    let partition = master.configure_partition(0, 0)?;
    master.configure_fake_trigger(0, rate, false)?;

    partition.start(Duration::from_secs(5))?;
    std::thread::sleep(Duration::from_secs(3));
    partition.stop(Duration::from_secs(5))?;
    master.clear_fake_trigger(0)?;

    let events = partition.read_events(0)?;
    println!("Read {} words from partition 0", events.len());
    println!("{}", partition.get_status()?);
    Ok(())
}
