use std::env::args;

use anyhow::{bail, Result};

fn main() -> Result<()> {
    let Some(name) = args().nth(1) else {
        bail!("usage: pyperf-scenarios <three-frames|resample|musl|deep>");
    };
    let Some(profile) = tests::run(&name) else {
        bail!("unknown scenario {name:?}");
    };
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}
