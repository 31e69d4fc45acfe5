use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result};
use aya::maps::{Array, HashMap, MapData};
use aya::Ebpf;
use pyperf_common::kernel::KernelOffsets;
use pyperf_common::python::state::{PidConfig, ProfilingType, PyPidData};
use pyperf_common::ConfigMapKey;
use tracing::{debug, info, warn};

use crate::config::PyperfConfig;
use crate::descriptor::{Classification, Classifier};

/// Fills `CONFIG` and `KERNEL_OFFSETS`.
pub fn write_config(bpf: &mut Ebpf, config: &PyperfConfig) -> Result<()> {
    let mut map: HashMap<_, u32, u64> =
        HashMap::try_from(bpf.map_mut("CONFIG").context("no CONFIG map")?)?;
    if config.sampling.pid_namespace {
        let stats = std::fs::metadata("/proc/self/ns/pid").context("unable to stat /proc/self/ns/pid")?;
        map.insert(ConfigMapKey::DEV as u32, stats.dev(), 0)?;
        map.insert(ConfigMapKey::INO as u32, stats.ino(), 0)?;
        debug!("pid namespace {}:{}", stats.dev(), stats.ino());
    }

    match config.kernel {
        Some(offsets) => {
            if !offsets.has_tls() {
                warn!("kernel.task_tls_base is not set, Python samples will fail");
            }
            if config.sampling.pid_namespace && !offsets.has_pid_ns() {
                warn!("pid namespace offsets are not set, samples inside containers will be dropped");
            }
            let mut array: Array<_, KernelOffsets> =
                Array::try_from(bpf.map_mut("KERNEL_OFFSETS").context("no KERNEL_OFFSETS map")?)?;
            array.set(0, offsets, 0)?;
        }
        None => warn!("no [kernel] offsets configured, Python samples will fail"),
    }
    Ok(())
}

/// Writes back the answer to a pid event. The descriptor goes in before the
/// config so a pid is never seen as Python without one.
pub fn apply(
    pids: &mut HashMap<MapData, u32, PidConfig>,
    descriptors: &mut HashMap<MapData, u32, PyPidData>,
    pid: u32,
    classification: Classification,
) -> Result<()> {
    match classification {
        Classification::Python(config, data) => {
            descriptors.insert(pid, data, 0)?;
            pids.insert(pid, config, 0)?;
            info!("pid {pid}: Python {}", data.version);
        }
        Classification::Native(config) => {
            pids.insert(pid, config, 0)?;
            debug!("pid {pid}: native");
        }
        Classification::NotProfiled => {
            pids.insert(pid, PidConfig::new(ProfilingType::Error, false, false), 0)?;
        }
        Classification::Forget => {
            // most pids never had one
            let _ = descriptors.remove(&pid);
            debug!("pid {pid}: exited");
        }
    }
    Ok(())
}

/// Classifies the configured processes up front, so their first samples
/// don't go through the request round trip.
pub fn seed(
    pids: &mut HashMap<MapData, u32, PidConfig>,
    descriptors: &mut HashMap<MapData, u32, PyPidData>,
    classifier: &Classifier,
) -> Result<()> {
    let configured: Vec<u32> = classifier.descriptors().map(|(pid, _)| *pid).collect();
    for pid in configured {
        apply(pids, descriptors, pid, classifier.classify_pid(pid))
            .with_context(|| format!("unable to seed pid {pid}"))?;
    }
    Ok(())
}
