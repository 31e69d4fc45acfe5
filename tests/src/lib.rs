//! Synthetic Python processes and a controller stand-in, shared by the
//! integration tests and the `pyperf-scenarios` binary.

use pyperf::descriptor::{Classification, Classifier};
use pyperf::RawProfile;
use pyperf_common::host::{FakeInterpreter, HostContext, HostMaps, MapLimits, Profiler};
use pyperf_common::pidtgid::PidTgid;
use pyperf_common::python::state::{LibcDescriptor, PidConfig, ProfilingType, PyPidData};
use pyperf_common::python::PythonVersion;

pub const PID: u32 = 4242;

/// A process image and the thread pointer of its one thread.
pub struct Process {
    pub py: FakeInterpreter,
    pub tls: u64,
    pub pid_data: PyPidData,
}

impl Process {
    pub fn context(&self, cpu: u32) -> HostContext {
        HostContext::new(self.py.memory())
            .with_cpu(cpu)
            .with_pid(PidTgid::new(PID, PID))
            .with_tls(self.tls)
    }
}

pub fn interpreter(minor: u8) -> FakeInterpreter {
    match FakeInterpreter::new(PythonVersion::new(3, minor, 0)) {
        Some(py) => py,
        None => panic!("no layout for 3.{minor}"),
    }
}

/// `main.py:main` calls `Handler.handle` in `app.py`, which calls
/// `util.py:parse`. Returns the innermost frame.
pub fn three_frames(py: &mut FakeInterpreter) -> u64 {
    let handler = py.type_object("Handler");
    let this = py.instance(handler);

    let main = py.code("main", "main.py", &[]);
    let handle = py.code("handle", "app.py", &["self", "request"]);
    let parse = py.code("parse", "util.py", &["data"]);

    let outer = py.frame(main, 0, &[]);
    let middle = py.frame(handle, outer, &[this, 0]);
    py.frame(parse, middle, &[0])
}

pub fn three_frame_process(minor: u8) -> Process {
    let mut py = interpreter(minor);
    let top = three_frames(&mut py);
    let tls = py.thread(top);
    let pid_data = py.pid_data();
    Process { py, tls, pid_data }
}

/// Same stack on a musl 1.2 thread: the thread pointer is `pthread_self`,
/// keys live in a separate `tsd` array.
pub fn musl_process(minor: u8) -> Process {
    let mut py = interpreter(minor);
    let top = three_frames(&mut py);
    let tstate = py.thread_state(top);

    let mut pid_data = py.pid_data();
    pid_data.libc = LibcDescriptor::musl_1_2_x86_64();
    let tsd_at = pid_data.libc.tsd.get().unwrap_or(0);

    let tls = py.alloc(0x200);
    let tsd = py.alloc(8 * 128);
    let mem = py.memory_mut();
    mem.write_u64(tls, tls);
    mem.write_u64(tls + tsd_at, tsd);
    mem.write_u64(tsd + pid_data.tss_key as u64 * 8, tstate);
    Process { py, tls, pid_data }
}

/// A process whose stack is `depth` distinct functions deep.
pub fn deep_process(minor: u8, depth: usize) -> Process {
    let mut py = interpreter(minor);
    let codes: Vec<u64> = (0..depth)
        .map(|i| py.code(&format!("f{i}"), "deep.py", &[]))
        .collect();
    let top = py.chain(&codes);
    let tls = py.thread(top);
    let pid_data = py.pid_data();
    Process { py, tls, pid_data }
}

pub fn profiler(cpus: usize) -> Profiler {
    Profiler::new(cpus, MapLimits::default())
}

/// Classifies `pid` as Python the way the controller does.
pub fn classify(maps: &HostMaps, pid: u32, data: PyPidData) {
    maps.set_pid_data(pid, data);
    maps.set_pid_config(pid, PidConfig::new(ProfilingType::Python, true, false));
}

/// Answers every pending pid event from `classifier`. Returns how many were handled.
pub fn serve(maps: &HostMaps, classifier: &Classifier) -> usize {
    let events = maps.take_pid_events();
    for event in &events {
        match classifier.classify(event) {
            Some(Classification::Python(config, data)) => {
                maps.set_pid_data(event.pid, data);
                maps.set_pid_config(event.pid, config);
            }
            Some(Classification::Native(config)) => maps.set_pid_config(event.pid, config),
            Some(Classification::NotProfiled) => {
                maps.set_pid_config(event.pid, PidConfig::new(ProfilingType::Error, false, false))
            }
            Some(Classification::Forget) | None => {}
        }
    }
    events.len()
}

/// Runs a named scenario and returns the resulting profile.
pub fn run(name: &str) -> Option<RawProfile> {
    let p = profiler(4);
    let (process, samples) = match name {
        "three-frames" => (three_frame_process(11), 1),
        "resample" => (three_frame_process(11), 2),
        "musl" => (musl_process(12), 1),
        "deep" => (deep_process(10, 200), 1),
        _ => return None,
    };
    classify(p.maps(), PID, process.pid_data);
    for cpu in 0..samples {
        p.sample(&process.context(cpu));
    }
    Some(RawProfile::from_host(p.maps()))
}
