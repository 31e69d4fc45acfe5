use std::path::Path;

use anyhow::{Context, Result};
use fnv::FnvHashMap;
use pyperf_common::host::HostMaps;
use pyperf_common::metrics::{ErrorKind, PyError};
use pyperf_common::python::state::{PythonStack, PythonSymbol, SampleKey};
use serde::Serialize;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    /// `None` when the symbol is no longer in the symbol table
    pub symbol: Option<Symbol>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub class: String,
    pub function: String,
    pub file: String,
}

impl From<&PythonSymbol> for Symbol {
    fn from(sym: &PythonSymbol) -> Self {
        Self {
            class: sym.class_name(),
            function: sym.function_name(),
            file: sym.file_name(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub pid: u32,
    pub count: u64,
    pub python: bool,
    pub truncated: bool,
    pub kernel_stack: Option<i64>,
    /// Native samples only
    pub user_stack: Option<i64>,
    /// Innermost first. Empty for native samples.
    pub frames: Vec<Frame>,
    /// The stack table has no entry for this sample's hash
    pub stack_missing: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorCount {
    pub kind: ErrorKind,
    pub count: u64,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticCount {
    pub code: PyError,
    pub count: u64,
}

/// Snapshot of the aggregation maps with symbol ids resolved to text.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RawProfile {
    pub total: u64,
    pub samples: Vec<Sample>,
    pub errors: Vec<ErrorCount>,
    pub diagnostics: Vec<DiagnosticCount>,
}

impl RawProfile {
    pub fn build(
        counts: impl IntoIterator<Item = (SampleKey, u64)>,
        stacks: impl IntoIterator<Item = (u64, PythonStack)>,
        symbols: impl IntoIterator<Item = (PythonSymbol, u32)>,
        errors: impl IntoIterator<Item = (ErrorKind, u64)>,
    ) -> Self {
        let stacks: FnvHashMap<u64, PythonStack> = stacks.into_iter().collect();
        let symbols: FnvHashMap<u32, Symbol> = symbols
            .into_iter()
            .map(|(sym, id)| (id, Symbol::from(&sym)))
            .collect();

        let mut samples: Vec<Sample> = counts
            .into_iter()
            .map(|(key, count)| {
                let kernel_stack = (key.kern_stack >= 0).then_some(key.kern_stack);
                match key.stack_hash() {
                    Some(hash) => {
                        let stack = stacks.get(&hash);
                        let frames = stack
                            .map(|s| {
                                s.frames()
                                    .iter()
                                    .map(|id| Frame { id: *id, symbol: symbols.get(id).cloned() })
                                    .collect()
                            })
                            .unwrap_or_default();
                        Sample {
                            pid: key.pid,
                            count,
                            python: true,
                            truncated: key.is_truncated(),
                            kernel_stack,
                            user_stack: None,
                            frames,
                            stack_missing: stack.is_none(),
                        }
                    }
                    None => Sample {
                        pid: key.pid,
                        count,
                        python: false,
                        truncated: false,
                        kernel_stack,
                        user_stack: (key.user_stack >= 0).then_some(key.user_stack),
                        frames: vec![],
                        stack_missing: false,
                    },
                }
            })
            .collect();
        samples.sort_by(|a, b| b.count.cmp(&a.count).then(a.pid.cmp(&b.pid)));

        Self {
            total: samples.iter().map(|s| s.count).sum(),
            samples,
            errors: errors
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(kind, count)| ErrorCount { kind, count })
                .collect(),
            diagnostics: vec![],
        }
    }

    pub fn from_host(maps: &HostMaps) -> Self {
        let mut profile = Self::build(maps.counts(), maps.stacks(), maps.symbols(), maps.errors());
        profile.add_diagnostics(maps.take_diagnostics().iter().filter_map(|d| Some((d.error()?, 1))));
        profile
    }

    pub fn add_diagnostics(&mut self, counts: impl IntoIterator<Item = (PyError, u64)>) {
        let mut tally: FnvHashMap<PyError, u64> = FnvHashMap::default();
        for d in &self.diagnostics {
            tally.insert(d.code, d.count);
        }
        for (code, count) in counts {
            *tally.entry(code).or_default() += count;
        }
        self.diagnostics = tally
            .into_iter()
            .map(|(code, count)| DiagnosticCount { code, count })
            .collect();
        self.diagnostics.sort_by_key(|d| d.code as u32);
    }

    /// Python samples of `pid` as `file:function` lines, innermost first.
    pub fn python_stacks(&self, pid: u32) -> Vec<(Vec<String>, u64)> {
        self.samples
            .iter()
            .filter(|s| s.python && s.pid == pid)
            .map(|s| {
                let frames = s
                    .frames
                    .iter()
                    .map(|f| match &f.symbol {
                        Some(sym) => format!("{}:{}", sym.file, sym.function),
                        None => format!("<unknown {}>", f.id),
                    })
                    .collect();
                (frames, s.count)
            })
            .collect()
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("unable to write {}", path.display()))
    }
}
