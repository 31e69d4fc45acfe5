#![no_std]
#![no_main]

mod context;
mod maps;

use aya_ebpf::{
    macros::{perf_event, tracepoint},
    programs::{PerfEventContext, TracePointContext},
    EbpfContext,
};
use aya_log_ebpf::{debug, error};
use pyperf_common::{
    dispatch::{on_process_exec, on_process_exit, profile_sample},
    python::{
        state::SampleState,
        walker::{self, tail_call_failed, Step},
    },
};

use crate::context::{BpfMaps, BpfSampleContext};
use crate::maps::{PY_PROGS, PY_STATE_HEAP};

/// Architecture the object was built for, checked by the agent before loading.
#[cfg(feature = "x86_64")]
#[no_mangle]
#[used]
static PYPERF_ARCH: u32 = pyperf_common::ARCH_X86_64;
#[cfg(feature = "aarch64")]
#[no_mangle]
#[used]
static PYPERF_ARCH: u32 = pyperf_common::ARCH_AARCH64;

#[inline(always)]
fn scratch() -> Option<&'static mut SampleState> {
    let ptr = PY_STATE_HEAP.get_ptr_mut(0)?;
    Some(unsafe { &mut *ptr })
}

#[inline(always)]
fn run_step<C: EbpfContext>(ctx: &C, maps: &BpfMaps<C>, state: &mut SampleState, step: Step) {
    if let Step::TailCall(idx) = step {
        // returns only on failure
        let _ = unsafe { PY_PROGS.tail_call(ctx, idx as u32) };
        error!(ctx, "tail call to {} failed", idx as u32);
        tail_call_failed(maps, state);
    }
}

/// Timer sample: classifies the pid and runs the entry fragment.
#[perf_event]
pub fn pyperf_collect(ctx: PerfEventContext) -> u32 {
    let Some(state) = scratch() else {
        return 0;
    };
    let sample = BpfSampleContext::perf_event(&ctx);
    let maps = BpfMaps::new(&ctx);
    let step = profile_sample(&sample, &maps, state);
    run_step(&ctx, &maps, state, step);
    0
}

/// Walker fragment, only entered through `PY_PROGS`.
#[perf_event]
pub fn read_python_stack(ctx: PerfEventContext) -> u32 {
    let Some(state) = scratch() else {
        return 0;
    };
    let sample = BpfSampleContext::perf_event(&ctx);
    let maps = BpfMaps::new(&ctx);
    let step = walker::read_python_stack(&sample, &maps, state);
    run_step(&ctx, &maps, state, step);
    0
}

#[tracepoint]
pub fn pyperf_process_exit(ctx: TracePointContext) -> u32 {
    on_process_exit(&BpfSampleContext::new(&ctx), &BpfMaps::new(&ctx));
    0
}

#[tracepoint]
pub fn pyperf_process_exec(ctx: TracePointContext) -> u32 {
    let sample = BpfSampleContext::new(&ctx);
    debug!(&ctx, "exec {}", ctx.tgid());
    on_process_exec(&sample, &BpfMaps::new(&ctx));
    0
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
