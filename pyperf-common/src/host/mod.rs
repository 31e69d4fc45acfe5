//! In-process runtime for the engine: map, memory and context implementations
//! with the same semantics as their kernel counterparts, used by the tests and
//! by anything that wants to replay samples outside the kernel.

mod context;
mod driver;
mod image;
mod maps;
mod memory;
mod percpu;

pub use context::HostContext;
pub use driver::{run_sample, Profiler, MAX_TAIL_CALLS};
pub use image::FakeInterpreter;
pub use maps::{HostMaps, MapLimits};
pub use memory::SparseMemory;
pub use percpu::PerCpu;
