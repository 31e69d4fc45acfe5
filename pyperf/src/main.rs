use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pyperf::args::{Commands, Opt};
use pyperf::descriptor::{self, Classifier};
use pyperf::{logging, Agent, PyperfConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();
    match opt.command {
        Commands::Offsets { version } => {
            let offsets = version
                .offsets()
                .with_context(|| format!("no known layout for Python {version}"))?;
            println!("{}", serde_json::to_string_pretty(&offsets)?);
        }
        Commands::CheckConfig { config } => {
            let config = PyperfConfig::from_path(&config)?;
            config.validate()?;
            let classifier = Classifier::new(&config.python, &config.sampling)?;
            let mut processes: Vec<_> = classifier.descriptors().collect();
            processes.sort_by_key(|(pid, _)| **pid);
            for (pid, data) in processes {
                println!(
                    "pid {pid}: Python {}, {:?}, tss_key {}",
                    data.version,
                    data.libc.pthreads_impl(),
                    data.tss_key
                );
            }
            for p in &config.python {
                for w in descriptor::warnings(p) {
                    println!("warning: {w}");
                }
            }
            if config.kernel.is_none() {
                println!("warning: no [kernel] offsets");
            }
            println!("config ok");
        }
        Commands::Run { config, pid, frequency, duration, output } => {
            let mut config = PyperfConfig::from_path(&config)?;
            if let Some(frequency) = frequency {
                config.sampling.frequency = frequency;
            }
            if let Some(duration) = duration {
                config.sampling.duration_secs = duration;
            }
            if let Some(output) = output {
                config.export.path = output;
            }
            logging::init(&config.log_level)?;

            let duration = match config.sampling.duration_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };
            let path = config.export.path.clone();
            let agent = Agent::new(config, pid)?;
            let profile = agent.run(duration).await?;
            info!(
                "{} samples in {} stacks, {} error kinds",
                profile.total,
                profile.samples.len(),
                profile.errors.len()
            );
            profile.write_to(&path)?;
            info!("profile written to {}", path.display());
        }
    }

    Ok(())
}
