use std::cell::Cell;

use assert_cmd::Command;
use predicates::prelude::predicate;
use pyperf::descriptor::Classifier;
use pyperf::{PyperfConfig, RawProfile};
use pyperf_common::host::{run_sample, HostMaps, MapLimits, Profiler};
use pyperf_common::maps::{InsertError, ProfileMaps};
use pyperf_common::metrics::{Diagnostic, ErrorKind, PyError};
use pyperf_common::pidtgid::PidTgid;
use pyperf_common::python::offsets::FRAME_OWNED_BY_CSTACK;
use pyperf_common::python::state::{
    PidConfig, ProfilingType, PyPidData, PythonStack, PythonSymbol, SampleKey, SampleState,
    WalkStatus, PYTHON_FILE_NAME_LEN, PYTHON_STACK_MAX_LEN, PY_NUM_CPU,
};
use pyperf_common::tracemgmt::{PidEvent, PidOp};
use pyperf_common::ConfigMapKey;
use tests::*;

fn stacks(p: &Profiler) -> Vec<(Vec<String>, u64)> {
    RawProfile::from_host(p.maps()).python_stacks(PID)
}

fn expected_three() -> Vec<String> {
    ["util.py:parse", "app.py:handle", "main.py:main"].map(String::from).to_vec()
}

#[test]
fn first_contact_then_three_frames() {
    let p = profiler(2);
    let process = three_frame_process(11);

    // nothing known about the pid yet: ask, drop the sample
    assert_eq!(p.sample(&process.context(0)), WalkStatus::Init);
    assert_eq!(
        p.maps().take_pid_events(),
        vec![PidEvent::new(PID, PidOp::RequestUnknownProcessInfo)]
    );
    assert_eq!(p.maps().error_count(ErrorKind::ClassificationPending), 1);
    assert!(p.maps().counts().is_empty());

    // a second cpu doesn't ask again while the request is pending
    p.sample(&process.context(1));
    assert!(p.maps().take_pid_events().is_empty());
    assert_eq!(p.maps().error_count(ErrorKind::ClassificationPending), 2);

    classify(p.maps(), PID, process.pid_data);
    assert_eq!(p.sample(&process.context(0)), WalkStatus::Done);

    let profile = RawProfile::from_host(p.maps());
    assert_eq!(profile.total, 1);
    assert_eq!(profile.python_stacks(PID), vec![(expected_three(), 1)]);
    let frames = &profile.samples[0].frames;
    assert_eq!(frames[1].symbol.as_ref().unwrap().class, "Handler");
    assert_eq!(frames[0].symbol.as_ref().unwrap().class, "");
    assert!(!profile.samples[0].truncated);
    assert!(p.maps().take_diagnostics().is_empty());
}

#[test]
fn resampling_the_same_stack_adds_up() {
    let p = profiler(2);
    let process = three_frame_process(11);
    classify(p.maps(), PID, process.pid_data);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Done);
    assert_eq!(p.sample(&process.context(1)), WalkStatus::Done);

    assert_eq!(p.maps().counts().len(), 1);
    assert_eq!(p.maps().counts()[0].1, 2);
    assert_eq!(p.maps().stacks().len(), 1);
    assert_eq!(p.maps().symbols().len(), 3);
    assert_eq!(stacks(&p), vec![(expected_three(), 2)]);
}

#[test]
fn resampling_on_the_same_core_reuses_ids() {
    let p = profiler(1);
    let process = three_frame_process(12);
    classify(p.maps(), PID, process.pid_data);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Done);
    let first = p.maps().stacks()[0].1;
    assert_eq!(p.sample(&process.context(0)), WalkStatus::Done);

    let stacks = p.maps().stacks();
    assert_eq!(stacks.len(), 1);
    assert_eq!(stacks[0].1.frames(), first.frames());
    assert_eq!(first.frames().len(), 3);
    assert_eq!(p.maps().symbols().len(), 3);
    let counts = p.maps().counts();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].1, 2);
}

#[test]
fn allocation_size_is_only_checked_for_glibc() {
    // a size no chunk header would round to
    let bogus = 0x999;

    let p = profiler(1);
    let mut process = musl_process(11);
    process.pid_data.sizes.thread_state = bogus;
    classify(p.maps(), PID, process.pid_data);
    assert_eq!(p.sample(&process.context(0)), WalkStatus::Done);

    let p = profiler(1);
    let mut process = three_frame_process(11);
    process.pid_data.sizes.thread_state = bogus;
    classify(p.maps(), PID, process.pid_data);
    assert_eq!(p.sample(&process.context(0)), WalkStatus::Error);
    assert_eq!(p.maps().error_count(ErrorKind::TypeValidation), 1);
    assert_eq!(p.maps().take_diagnostics()[0].error(), Some(PyError::AllocSizeMismatch));
}

#[test]
fn every_known_version() {
    for minor in 8..=12 {
        let p = profiler(1);
        let process = three_frame_process(minor);
        classify(p.maps(), PID, process.pid_data);
        assert_eq!(p.sample(&process.context(0)), WalkStatus::Done, "3.{minor}");
        assert_eq!(stacks(&p), vec![(expected_three(), 1)], "3.{minor}");
    }
}

#[test]
fn musl_thread_state() {
    for minor in [8, 11, 12] {
        let p = profiler(1);
        let process = musl_process(minor);
        classify(p.maps(), PID, process.pid_data);
        assert_eq!(p.sample(&process.context(0)), WalkStatus::Done, "3.{minor}");
        assert_eq!(stacks(&p), vec![(expected_three(), 1)]);
    }
}

#[test]
fn read_fault_aborts_the_whole_sample() {
    let p = profiler(1);
    let mut process = three_frame_process(11);
    // the caller of the top frame points into nowhere
    let mut py = process.py.clone();
    let code = py.code("lost", "lost.py", &[]);
    let top = py.frame(code, 0xdead_0000, &[]);
    process.tls = py.thread(top);
    process.py = py;
    classify(p.maps(), PID, process.pid_data);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Error);
    assert!(p.maps().counts().is_empty());
    assert!(p.maps().stacks().is_empty());
    assert_eq!(p.maps().error_count(ErrorKind::ReadFault), 1);

    let diags = p.maps().take_diagnostics();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].pid, PID);
    assert_eq!(diags[0].error(), Some(PyError::FrameRead));
    assert!(diags[0].addr >= 0xdead_0000);
}

#[test]
fn caller_near_top_of_address_space_aborts() {
    let p = profiler(1);
    let mut process = three_frame_process(11);
    let mut py = process.py.clone();
    let code = py.code("wild", "wild.py", &[]);
    let top = py.frame(code, 0xffff_ffff_ffff_fff0, &[]);
    process.tls = py.thread(top);
    process.py = py;
    classify(p.maps(), PID, process.pid_data);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Error);
    assert_eq!(p.maps().error_count(ErrorKind::ReadFault), 1);
    assert!(p.maps().counts().is_empty());
    assert_eq!(p.maps().take_diagnostics()[0].error(), Some(PyError::FrameRead));
}

#[test]
fn unreadable_thread_state_aborts() {
    let p = profiler(1);
    let mut process = three_frame_process(11);
    process.tls = 0xbad_0000;
    classify(p.maps(), PID, process.pid_data);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Error);
    assert_eq!(p.maps().error_count(ErrorKind::ReadFault), 1);
    assert!(p.maps().counts().is_empty());
    assert_eq!(p.maps().take_diagnostics()[0].error(), Some(PyError::ThreadStateRead));
}

#[test]
fn deep_stacks_are_cut_and_flagged() {
    let p = profiler(1);
    let process = deep_process(10, 200);
    classify(p.maps(), PID, process.pid_data);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Truncated);
    assert_eq!(p.maps().error_count(ErrorKind::DepthExhausted), 1);

    let profile = RawProfile::from_host(p.maps());
    let sample = &profile.samples[0];
    assert!(sample.truncated);
    assert_eq!(sample.frames.len(), PYTHON_STACK_MAX_LEN);
    // innermost first
    let names: Vec<_> = sample.frames.iter().map(|f| f.symbol.clone().unwrap().function).collect();
    assert_eq!(names[0], "f0");
    assert_eq!(names[PYTHON_STACK_MAX_LEN - 1], format!("f{}", PYTHON_STACK_MAX_LEN - 1));
}

#[test]
fn stack_of_exactly_max_len_is_complete() {
    let p = profiler(1);
    let process = deep_process(12, PYTHON_STACK_MAX_LEN);
    classify(p.maps(), PID, process.pid_data);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Done);
    let (key, _) = p.maps().counts()[0];
    assert!(!key.is_truncated());
    assert_eq!(p.maps().stacks()[0].1.frames().len(), PYTHON_STACK_MAX_LEN);
}

#[test]
fn cstack_shims_are_not_frames() {
    let p = profiler(1);
    let mut py = interpreter(12);
    let outer = py.code("outer", "a.py", &[]);
    let shim = py.code("shim", "a.py", &[]);
    let inner = py.code("inner", "a.py", &[]);
    let f_outer = py.frame(outer, 0, &[]);
    let f_shim = py.frame(shim, f_outer, &[]);
    py.set_owner(f_shim, FRAME_OWNED_BY_CSTACK);
    let f_inner = py.frame(inner, f_shim, &[]);
    let tls = py.thread(f_inner);
    let process = Process { pid_data: py.pid_data(), py, tls };
    classify(p.maps(), PID, process.pid_data);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Done);
    assert_eq!(
        stacks(&p),
        vec![(vec!["a.py:inner".to_owned(), "a.py:outer".to_owned()], 1)]
    );
}

#[test]
fn interning_is_idempotent_across_cpus() {
    let p = profiler(4);
    let process = three_frame_process(12);
    classify(p.maps(), PID, process.pid_data);

    for cpu in [2, 0, 3, 1] {
        assert_eq!(p.sample(&process.context(cpu)), WalkStatus::Done);
    }
    let symbols = p.maps().symbols();
    assert_eq!(symbols.len(), 3);
    // minted by the first cpu that saw them
    assert!(symbols.iter().all(|(_, id)| id % PY_NUM_CPU == 2 && *id >= PY_NUM_CPU));
    assert_eq!(p.maps().counts().len(), 1);
    assert_eq!(p.maps().counts()[0].1, 4);
}

/// Lets another "cpu" win the first symbol insert.
struct RacingMaps<'a> {
    inner: &'a HostMaps,
    winner: u32,
    raced: Cell<bool>,
}

impl ProfileMaps for RacingMaps<'_> {
    fn config_value(&self, key: ConfigMapKey) -> Option<u64> {
        self.inner.config_value(key)
    }
    fn pid_config(&self, pid: u32) -> Option<PidConfig> {
        self.inner.pid_config(pid)
    }
    fn insert_pid_config(&self, pid: u32, config: &PidConfig) -> Result<(), InsertError> {
        self.inner.insert_pid_config(pid, config)
    }
    fn remove_pid_config(&self, pid: u32) -> bool {
        self.inner.remove_pid_config(pid)
    }
    fn copy_pid_data(&self, pid: u32, out: &mut PyPidData) -> bool {
        self.inner.copy_pid_data(pid, out)
    }
    fn symbol_id(&self, sym: &PythonSymbol) -> Option<u32> {
        self.inner.symbol_id(sym)
    }
    fn insert_symbol(&self, sym: &PythonSymbol, id: u32) -> Result<(), InsertError> {
        if !self.raced.replace(true) {
            self.inner.insert_symbol(sym, self.winner)?;
        }
        self.inner.insert_symbol(sym, id)
    }
    fn put_stack(&self, hash: u64, stack: &PythonStack) -> Result<(), InsertError> {
        self.inner.put_stack(hash, stack)
    }
    fn add_count(&self, key: &SampleKey) -> bool {
        self.inner.add_count(key)
    }
    fn insert_count(&self, key: &SampleKey, value: u64) -> Result<(), InsertError> {
        self.inner.insert_count(key, value)
    }
    fn increment_error(&self, kind: ErrorKind) {
        self.inner.increment_error(kind)
    }
    fn emit_pid_event(&self, event: &PidEvent) {
        self.inner.emit_pid_event(event)
    }
    fn emit_diagnostic(&self, diag: &Diagnostic) {
        self.inner.emit_diagnostic(diag)
    }
}

#[test]
fn lost_intern_race_adopts_the_winner() {
    let maps = HostMaps::default();
    let process = three_frame_process(11);
    classify(&maps, PID, process.pid_data);

    let winner = 7 * PY_NUM_CPU + 3;
    let racing = RacingMaps { inner: &maps, winner, raced: Cell::new(false) };
    let mut state = Box::new(SampleState::zeroed());
    assert_eq!(run_sample(&process.context(0), &racing, &mut state), WalkStatus::Done);

    let stack = maps.stacks()[0].1;
    // innermost frame is interned first
    assert_eq!(stack.frames()[0], winner);
    assert_eq!(stack.frames().len(), 3);
    assert_eq!(maps.symbols().len(), 3);
    assert_eq!(maps.error_count(ErrorKind::InternerExhaustion), 0);
}

#[test]
fn symbol_map_full_aborts() {
    let p = Profiler::new(1, MapLimits { symbols: 2, ..MapLimits::default() });
    let process = three_frame_process(11);
    classify(p.maps(), PID, process.pid_data);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Error);
    assert_eq!(p.maps().error_count(ErrorKind::InternerExhaustion), 1);
    assert!(p.maps().counts().is_empty());
}

#[test]
fn wrong_code_type_is_rejected() {
    let p = profiler(1);
    let mut py = interpreter(11);
    let code = py.code("f", "f.py", &[]);
    // looks like an object, but of the wrong type
    let ob_type = py.offsets().py_object.ob_type.get().unwrap();
    let dict = py.types().dict;
    py.memory_mut().write_u64(code + ob_type, dict);
    let top = py.frame(code, 0, &[]);
    let tls = py.thread(top);
    let process = Process { pid_data: py.pid_data(), py, tls };
    classify(p.maps(), PID, process.pid_data);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Error);
    assert_eq!(p.maps().error_count(ErrorKind::TypeValidation), 1);
    assert!(p.maps().counts().is_empty());
    let diags = p.maps().take_diagnostics();
    assert_eq!(diags[0].error(), Some(PyError::TypeMismatch));
    assert_eq!(diags[0].addr, code);
}

#[test]
fn strings_round_trip_and_truncate() {
    let p = profiler(1);
    let mut py = interpreter(12);
    let long_file = format!("/srv/{}.py", "x".repeat(200));
    let latin = py.code("grüße", "日本.py", &[]);
    let astral = py.code("🐍run", &long_file, &[]);
    let top = py.chain(&[latin, astral]);
    let tls = py.thread(top);
    let process = Process { pid_data: py.pid_data(), py, tls };
    classify(p.maps(), PID, process.pid_data);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Done);
    let profile = RawProfile::from_host(p.maps());
    let frames = &profile.samples[0].frames;
    let first = frames[0].symbol.as_ref().unwrap();
    assert_eq!(first.function, "grüße");
    assert_eq!(first.file, "日本.py");
    let second = frames[1].symbol.as_ref().unwrap();
    assert_eq!(second.function, "🐍run");
    assert_eq!(second.file.len(), PYTHON_FILE_NAME_LEN);
    assert!(long_file.starts_with(&second.file));
}

/// Every stack lands on the same hash.
struct CollidingMaps<'a>(&'a HostMaps);

impl ProfileMaps for CollidingMaps<'_> {
    fn config_value(&self, key: ConfigMapKey) -> Option<u64> {
        self.0.config_value(key)
    }
    fn pid_config(&self, pid: u32) -> Option<PidConfig> {
        self.0.pid_config(pid)
    }
    fn insert_pid_config(&self, pid: u32, config: &PidConfig) -> Result<(), InsertError> {
        self.0.insert_pid_config(pid, config)
    }
    fn remove_pid_config(&self, pid: u32) -> bool {
        self.0.remove_pid_config(pid)
    }
    fn copy_pid_data(&self, pid: u32, out: &mut PyPidData) -> bool {
        self.0.copy_pid_data(pid, out)
    }
    fn symbol_id(&self, sym: &PythonSymbol) -> Option<u32> {
        self.0.symbol_id(sym)
    }
    fn insert_symbol(&self, sym: &PythonSymbol, id: u32) -> Result<(), InsertError> {
        self.0.insert_symbol(sym, id)
    }
    fn put_stack(&self, _hash: u64, stack: &PythonStack) -> Result<(), InsertError> {
        self.0.put_stack(1, stack)
    }
    fn add_count(&self, key: &SampleKey) -> bool {
        self.0.add_count(&SampleKey { user_stack: 1, ..*key })
    }
    fn insert_count(&self, key: &SampleKey, value: u64) -> Result<(), InsertError> {
        self.0.insert_count(&SampleKey { user_stack: 1, ..*key }, value)
    }
    fn increment_error(&self, kind: ErrorKind) {
        self.0.increment_error(kind)
    }
    fn emit_pid_event(&self, event: &PidEvent) {
        self.0.emit_pid_event(event)
    }
    fn emit_diagnostic(&self, diag: &Diagnostic) {
        self.0.emit_diagnostic(diag)
    }
}

#[test]
fn hash_collision_last_writer_wins() {
    let maps = HostMaps::default();
    let colliding = CollidingMaps(&maps);
    let mut state = Box::new(SampleState::zeroed());

    let first = three_frame_process(11);
    classify(&maps, PID, first.pid_data);
    assert_eq!(run_sample(&first.context(0), &colliding, &mut state), WalkStatus::Done);

    let second = deep_process(11, 2);
    classify(&maps, PID, second.pid_data);
    assert_eq!(run_sample(&second.context(0), &colliding, &mut state), WalkStatus::Done);

    // both samples count against the stack written last
    let profile = RawProfile::from_host(&maps);
    assert_eq!(
        profile.python_stacks(PID),
        vec![(vec!["deep.py:f0".to_owned(), "deep.py:f1".to_owned()], 2)]
    );
}

#[test]
fn controller_classifies_from_config() {
    let p = profiler(1);
    let process = three_frame_process(11);
    let types = process.py.types();
    let config = PyperfConfig::parse(&format!(
        r#"
[[python]]
pid = {PID}
version = "3.11.0"
libc = "glibc"
tss_key = {}
types = {{ code = {}, unicode = {}, tuple = {}, type_ = {}, cell = {} }}
sizes = {{ thread_state = {} }}
"#,
        process.pid_data.tss_key,
        types.code,
        types.unicode,
        types.tuple,
        types.type_,
        types.cell,
        process.pid_data.sizes.thread_state,
    ))
    .unwrap();
    let classifier = Classifier::new(&config.python, &config.sampling).unwrap();

    let stranger = PidTgid::new(99, 99);
    p.sample(&process.context(0));
    p.sample(&process.context(0).with_pid(stranger));
    assert_eq!(serve(p.maps(), &classifier), 2);

    assert_eq!(p.sample(&process.context(0)), WalkStatus::Done);
    assert_eq!(stacks(&p), vec![(expected_three(), 1)]);

    // unconfigured processes are left alone
    p.sample(&process.context(0).with_pid(stranger));
    assert_eq!(p.maps().pid_config(99).map(|c| c.profiling_type()), Some(ProfilingType::Error));
    assert_eq!(p.maps().error_count(ErrorKind::NotProfiled), 1);

    // exit drops the pid, exec asks again
    p.process_exec(&process.context(0));
    assert_eq!(p.maps().take_pid_events(), vec![PidEvent::new(PID, PidOp::RequestExecProcessInfo)]);
    p.process_exit(&process.context(0));
    assert_eq!(p.maps().take_pid_events(), vec![PidEvent::new(PID, PidOp::Dead)]);
    assert_eq!(p.maps().pid_config(PID), None);
}

#[test]
fn scenario_binary() {
    let mut cmd = Command::cargo_bin("pyperf-scenarios").unwrap();
    cmd.arg("resample");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"total\": 2"))
        .stdout(predicate::str::contains("\"function\": \"parse\""))
        .stdout(predicate::str::contains("\"class\": \"Handler\""));

    let mut cmd = Command::cargo_bin("pyperf-scenarios").unwrap();
    cmd.arg("deep");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"truncated\": true"))
        .stdout(predicate::str::contains("DepthExhausted"));
}
