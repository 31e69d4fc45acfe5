use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use aya::{Ebpf, EbpfLoader};
use object::{Object, ObjectSection, ObjectSymbol};
use pyperf_common::{ARCH_AARCH64, ARCH_SYMBOL, ARCH_X86_64, REQUIRED_MAPS};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObjectError {
    #[error("unable to parse object: {0}")]
    Parse(String),
    #[error("object lacks maps: {}", .0.join(", "))]
    MissingMaps(Vec<&'static str>),
    #[error("object has no {} symbol", ARCH_SYMBOL)]
    NoArch,
    #[error("object was built for {found}, this host is {expected}")]
    WrongArch { expected: &'static str, found: &'static str },
}

pub const fn host_arch() -> u32 {
    if cfg!(target_arch = "aarch64") {
        ARCH_AARCH64
    } else {
        ARCH_X86_64
    }
}

fn arch_name(arch: u32) -> &'static str {
    match arch {
        ARCH_X86_64 => "x86_64",
        ARCH_AARCH64 => "aarch64",
        _ => "an unknown architecture",
    }
}

/// Where `cargo xtask build-ebpf` leaves the object for this build profile.
pub fn default_object_path() -> PathBuf {
    let profile = if cfg!(debug_assertions) { "debug" } else { "release" };
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("../target/bpfel-unknown-none");
    path.push(profile);
    path.push("pyperf");
    path
}

/// Rejects objects that would load but can't work: a missing map or a
/// different target architecture (the thread pointer lives elsewhere).
pub fn verify_object(data: &[u8]) -> Result<(), ObjectError> {
    let obj = object::File::parse(data).map_err(|e| ObjectError::Parse(e.to_string()))?;

    let missing: Vec<&'static str> = REQUIRED_MAPS
        .iter()
        .copied()
        .filter(|name| !obj.symbols().any(|s| s.name().ok() == Some(*name)))
        .collect();
    if !missing.is_empty() {
        return Err(ObjectError::MissingMaps(missing));
    }

    let symbol = obj
        .symbols()
        .find(|s| s.name().ok() == Some(ARCH_SYMBOL))
        .ok_or(ObjectError::NoArch)?;
    let index = symbol.section_index().ok_or(ObjectError::NoArch)?;
    let section = obj
        .section_by_index(index)
        .map_err(|e| ObjectError::Parse(e.to_string()))?;
    let bytes = section.data().map_err(|e| ObjectError::Parse(e.to_string()))?;
    let start = symbol.address().saturating_sub(section.address()) as usize;
    let raw: [u8; 4] = bytes
        .get(start..start + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or(ObjectError::NoArch)?;

    let found = u32::from_le_bytes(raw);
    if found != host_arch() {
        return Err(ObjectError::WrongArch {
            expected: arch_name(host_arch()),
            found: arch_name(found),
        });
    }
    Ok(())
}

pub fn load(path: &Path) -> Result<Ebpf> {
    info!("loading {}", path.display());
    let data = std::fs::read(path)
        .with_context(|| format!("unable to read {}, run `cargo xtask build-ebpf` first", path.display()))?;
    verify_object(&data).with_context(|| format!("rejecting {}", path.display()))?;
    let bpf = EbpfLoader::new()
        .load(&data)
        .with_context(|| format!("unable to load {}", path.display()))?;
    Ok(bpf)
}
