use anyhow::{anyhow, Context, Result};
use aya::maps::{MapData, ProgramArray};
use aya::programs::perf_event::{perf_sw_ids, PerfEventScope, PerfTypeId, SamplePolicy};
use aya::programs::{PerfEvent, TracePoint};
use aya::util::online_cpus;
use aya::Ebpf;
use pyperf_common::python::walker::ProgIdx;
use tracing::info;

pub const ENTRY_PROGRAM: &str = "pyperf_collect";
pub const WALKER_PROGRAM: &str = "read_python_stack";

const LIFECYCLE: [(&str, &str); 2] = [
    ("pyperf_process_exit", "sched_process_exit"),
    ("pyperf_process_exec", "sched_process_exec"),
];

/// Loads the walker fragment and registers it in `PY_PROGS`. The returned
/// table has to outlive sampling: the kernel empties a program array once its
/// last user space handle is closed.
pub fn wire_tail_calls(bpf: &mut Ebpf) -> Result<ProgramArray<MapData>> {
    let mut progs = ProgramArray::try_from(bpf.take_map("PY_PROGS").context("no PY_PROGS map")?)?;
    let walker: &mut PerfEvent = bpf
        .program_mut(WALKER_PROGRAM)
        .with_context(|| format!("no {WALKER_PROGRAM} program"))?
        .try_into()?;
    walker.load().with_context(|| format!("unable to load {WALKER_PROGRAM}"))?;
    progs.set(ProgIdx::ReadPythonStack as u32, walker.fd()?, 0)?;
    Ok(progs)
}

/// One cpu clock event per online cpu, all processes.
pub fn attach_sampler(bpf: &mut Ebpf, frequency: u64) -> Result<usize> {
    let program: &mut PerfEvent = bpf
        .program_mut(ENTRY_PROGRAM)
        .with_context(|| format!("no {ENTRY_PROGRAM} program"))?
        .try_into()?;
    program.load().with_context(|| format!("unable to load {ENTRY_PROGRAM}"))?;

    let cpus = online_cpus().map_err(|(msg, e)| anyhow!("{msg}: {e}"))?;
    for cpu in &cpus {
        program
            .attach(
                PerfTypeId::Software,
                perf_sw_ids::PERF_COUNT_SW_CPU_CLOCK as u64,
                PerfEventScope::AllProcessesOneCpu { cpu: *cpu },
                SamplePolicy::Frequency(frequency),
                false,
            )
            .with_context(|| format!("unable to attach to cpu {cpu}"))?;
    }
    info!("sampling {} cpus at {frequency} Hz", cpus.len());
    Ok(cpus.len())
}

pub fn attach_lifecycle(bpf: &mut Ebpf) -> Result<()> {
    for (name, event) in LIFECYCLE {
        let program: &mut TracePoint = bpf
            .program_mut(name)
            .with_context(|| format!("no {name} program"))?
            .try_into()?;
        program.load().with_context(|| format!("unable to load {name}"))?;
        program
            .attach("sched", event)
            .with_context(|| format!("unable to attach to sched/{event}"))?;
    }
    Ok(())
}
