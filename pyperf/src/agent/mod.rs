use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use aya::maps::{MapData, ProgramArray};
use aya::Ebpf;
use aya_log::EbpfLogger;
use nix::unistd::getuid;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::PyperfConfig;
use crate::descriptor::{self, Classifier};
use crate::export::RawProfile;

pub mod attach;
pub mod events;
pub mod load;
pub mod setup;
pub mod snapshot;

/// A loaded kernel object with its maps configured, ready to sample.
pub struct Agent {
    bpf: Ebpf,
    config: PyperfConfig,
    classifier: Arc<Classifier>,
    _progs: ProgramArray<MapData>,
}

impl Agent {
    /// `only` restricts profiling to one pid.
    pub fn new(config: PyperfConfig, only: Option<u32>) -> Result<Self> {
        ensure_root()?;
        config.validate()?;
        for p in &config.python {
            for w in descriptor::warnings(p) {
                warn!("{w}");
            }
        }
        let mut classifier = Classifier::new(&config.python, &config.sampling)?;
        if let Some(pid) = only {
            classifier = classifier.restrict_to(pid);
        }

        bump_memlock_rlimit()?;
        let path = config.bpf.object.clone().unwrap_or_else(load::default_object_path);
        let mut bpf = load::load(&path)?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("kernel logs are not forwarded: {e}");
        }
        setup::write_config(&mut bpf, &config)?;
        let progs = attach::wire_tail_calls(&mut bpf)?;

        Ok(Self {
            bpf,
            config,
            classifier: Arc::new(classifier),
            _progs: progs,
        })
    }

    /// Samples until `duration` elapses (or forever if `None`) or Ctrl-C,
    /// then snapshots the aggregation maps.
    pub async fn run(mut self, duration: Option<Duration>) -> Result<RawProfile> {
        let (stop_tx, stop_rx) = watch::channel(());
        let tasks = events::spawn(&mut self.bpf, Arc::clone(&self.classifier), stop_rx)?;
        attach::attach_lifecycle(&mut self.bpf)?;
        attach::attach_sampler(&mut self.bpf, self.config.sampling.frequency)?;

        match duration {
            Some(d) => {
                tokio::select! {
                    _ = tokio::time::sleep(d) => (),
                    r = signal::ctrl_c() => r.context("failed to listen for Ctrl-C")?,
                }
            }
            None => signal::ctrl_c().await.context("failed to listen for Ctrl-C")?,
        }

        info!("exiting");
        let _ = stop_tx.send(());
        let diagnostics = tasks.join().await?;

        let mut profile = snapshot::read_profile(&self.bpf)?;
        profile.add_diagnostics(diagnostics);
        Ok(profile)
    }
}

/// make sure we are running with root privileges
fn ensure_root() -> Result<()> {
    if !getuid().is_root() {
        bail!("pyperf must be run with root privileges");
    }
    Ok(())
}

fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: 128 << 20,
        rlim_max: 128 << 20,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!("Failed to increase rlimit");
    }

    Ok(())
}
