use std::process::{Command, Stdio};

/// Spawns the demo, lets it crash, and checks that a minidump landed in the
/// crash database.
///
/// Ignored by default: capturing the dump needs ptrace access to the crashed
/// process, which sandboxed CI runners commonly deny.
#[test]
#[ignore = "spawns a real crashing process and needs ptrace"]
fn demo_crash_lands_in_the_database() {
    let db = tempfile::tempdir().expect("should create temp crash db");

    let output = Command::new("cargo")
        .args(["run", "--example", "crash"])
        .env("CRASH_DB", db.path())
        .stdout(Stdio::piped())
        .spawn()
        .expect("should spawn demo app")
        .wait_with_output()
        .expect("failed to wait on demo app");

    // wait_with_output returns once the reporter process (which inherits the
    // pipe) has exited too, so the dump is fully written by now.
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Entering level_three()"));
    assert!(stdout.contains("crash report"));

    let pending = db.path().join("pending");
    let dumps: Vec<_> = std::fs::read_dir(&pending)
        .expect("pending dir should exist")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("dmp"))
        .collect();
    assert_eq!(dumps.len(), 1, "expected exactly one minidump in {pending:?}");

    // Minidump files always start with MDMP characters
    let contents = std::fs::read(&dumps[0]).expect("should read minidump");
    assert!(contents.starts_with(b"MDMP"));

    // The report record written beside the dump carries the annotation pair.
    let record = std::fs::read_to_string(dumps[0].with_extension("json")).expect("report record");
    assert!(record.contains("\"product\": \"minidumper-demo\""));
}

/// Drives `symbols` then `stackwalk` through the CLI with stub tools, end to
/// end minus the real dump_syms/minidump-stackwalk binaries.
#[cfg(unix)]
#[test]
fn cli_symbols_then_stackwalk() {
    use std::os::unix::fs::PermissionsExt as _;

    let dir = tempfile::tempdir().expect("should create temp dir");

    let write_tool = |name: &str, body: &str| {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write stub tool");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("mark stub tool executable");
        path
    };

    let dump_syms = write_tool(
        "dump_syms",
        "echo \"MODULE Linux x86_64 4C4C4465 demo\"\necho \"FUNC 1000 20 0 level_three\"\n",
    );
    let stackwalker = write_tool(
        "minidump-stackwalk",
        "echo \"Crash reason:  SIGSEGV\"\necho \" 0  demo!level_three\"\n",
    );

    let binary = dir.path().join("demo");
    std::fs::write(&binary, b"stub binary").expect("write stub binary");
    let symbols_dir = dir.path().join("symbols");

    let symbols = Command::new(env!("CARGO_BIN_EXE_minidumper-demo"))
        .arg("symbols")
        .arg(&binary)
        .arg(&symbols_dir)
        .arg("--dump-syms")
        .arg(&dump_syms)
        .output()
        .expect("should run symbols command");
    assert!(
        symbols.status.success(),
        "symbols failed: {}",
        String::from_utf8_lossy(&symbols.stderr)
    );
    assert!(symbols_dir.join("demo/4C4C4465/demo.sym").exists());

    let walk = Command::new(env!("CARGO_BIN_EXE_minidumper-demo"))
        .arg("stackwalk")
        .arg(dir.path().join("fake.dmp"))
        .arg(&symbols_dir)
        .arg("--stackwalker")
        .arg(&stackwalker)
        .output()
        .expect("should run stackwalk command");
    assert!(walk.status.success());

    let report = String::from_utf8_lossy(&walk.stdout);
    assert!(report.contains("SIGSEGV"));
    assert!(report.contains("demo!level_three"));
}
