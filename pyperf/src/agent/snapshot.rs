use anyhow::{Context, Result};
use aya::maps::{HashMap, PerCpuArray};
use aya::Ebpf;
use pyperf_common::metrics::ErrorKind;
use pyperf_common::python::state::{PythonStack, PythonSymbol, SampleKey};

use crate::export::RawProfile;

/// Reads the aggregation maps into a profile.
pub fn read_profile(bpf: &Ebpf) -> Result<RawProfile> {
    let counts: HashMap<_, SampleKey, u64> =
        HashMap::try_from(bpf.map("COUNTS").context("no COUNTS map")?)?;
    let stacks: HashMap<_, u64, PythonStack> =
        HashMap::try_from(bpf.map("PY_STACKS").context("no PY_STACKS map")?)?;
    let symbols: HashMap<_, PythonSymbol, u32> =
        HashMap::try_from(bpf.map("PY_SYMBOLS").context("no PY_SYMBOLS map")?)?;
    let errors: PerCpuArray<_, u64> =
        PerCpuArray::try_from(bpf.map("ERRORS").context("no ERRORS map")?)?;

    let counts = counts.iter().collect::<Result<Vec<_>, _>>().context("reading COUNTS")?;
    let stacks = stacks.iter().collect::<Result<Vec<_>, _>>().context("reading PY_STACKS")?;
    let symbols = symbols.iter().collect::<Result<Vec<_>, _>>().context("reading PY_SYMBOLS")?;
    let errors = ErrorKind::iter()
        .into_iter()
        .filter(|kind| *kind != ErrorKind::Max)
        .map(|kind| -> Result<(ErrorKind, u64)> {
            let per_cpu = errors.get(&(kind as u32), 0)?;
            Ok((kind, per_cpu.iter().sum::<u64>()))
        })
        .collect::<Result<Vec<_>>>()
        .context("reading ERRORS")?;

    Ok(RawProfile::build(counts, stacks, symbols, errors))
}
