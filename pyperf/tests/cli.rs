use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn pyperf() -> Command {
    Command::cargo_bin("pyperf").unwrap()
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(contents.as_bytes()).unwrap();
    f
}

#[test]
fn prints_offsets() {
    pyperf()
        .args(["offsets", "3.11"])
        .assert()
        .success()
        .stdout(predicate::str::contains("co_localsplusnames"))
        .stdout(predicate::str::contains("current_frame"));
}

#[test]
fn unknown_version_fails_closed() {
    pyperf()
        .args(["offsets", "3.7.2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no known layout for Python 3.7.2"));
}

#[test]
fn check_config_lists_processes() {
    let f = config_file(
        r#"
[kernel]
task_tls_base = 0x1c28

[[python]]
pid = 4242
version = "3.11.4"
libc = "glibc"
tss_key = 1
types = { code = 0x1000, unicode = 0x2000 }

[[python]]
pid = 77
version = "3.9"
libc = "musl-1.2"
tss_key = 2
types = { code = 0x1000, unicode = 0x2000 }
"#,
    );
    pyperf()
        .args(["check-config", "--config"])
        .arg(f.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("pid 77: Python 3.9.0, Some(Musl), tss_key 2"))
        .stdout(predicate::str::contains("pid 4242: Python 3.11.4, Some(Glibc), tss_key 1"))
        .stdout(predicate::str::contains("config ok"));
}

#[test]
fn check_config_warns_about_missing_types() {
    let f = config_file(
        r#"
[kernel]
task_tls_base = 0x1c28

[[python]]
pid = 4242
version = "3.11.4"
libc = "glibc"
tss_key = 1
types = { code = 0x1000, unicode = 0x2000, type_ = 0x3000 }
"#,
    );
    pyperf()
        .args(["check-config", "--config"])
        .arg(f.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "warning: pid 4242: types.tuple not set, class names are not resolved",
        ))
        .stdout(predicate::str::contains("types.cell not set"))
        .stdout(predicate::str::contains("config ok"));
}

#[test]
fn check_config_rejects_bad_process() {
    let f = config_file(
        r#"
[[python]]
pid = 4242
version = "3.11.4"
libc = "glibc"
tss_key = 40
types = { code = 0x1000, unicode = 0x2000 }
"#,
    );
    pyperf()
        .args(["check-config", "-c"])
        .arg(f.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("tss_key 40 is out of range"));
}

#[test]
fn check_config_missing_file() {
    pyperf()
        .args(["check-config", "--config", "/nonexistent/Pyperf.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
