use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_cli_scan_then_rules_cycle() -> Result<(), Box<dyn std::error::Error>> {
    let work_dir = tempdir()?;
    let input_path = work_dir.path().join("payload.sh");
    fs::write(&input_path, b"#!/bin/sh\necho hello\n")?;

    let store_path = work_dir.path().join("store");

    let mut cmd = Command::cargo_bin("triagekit")?;
    cmd.arg("scan")
        .arg(&input_path)
        .arg("--store")
        .arg(&store_path);
    cmd.assert().success();

    assert!(store_path.join("root").join("info.json").exists());
    let info_text = fs::read_to_string(store_path.join("root").join("info.json"))?;
    assert!(predicate::str::contains("script").eval(&info_text));

    let rules_dir = work_dir.path().join("rules");
    let mut cmd = Command::cargo_bin("triagekit")?;
    cmd.arg("rules")
        .arg(&store_path)
        .arg("--output")
        .arg(&rules_dir);
    cmd.assert().success();

    // The shebang script carries no elf/dex label, so no identifier rule
    // is emitted for it — only the store walk itself must succeed.
    Ok(())
}

#[test]
fn test_cli_scan_rejects_missing_input() -> Result<(), Box<dyn std::error::Error>> {
    let work_dir = tempdir()?;
    let missing = work_dir.path().join("does-not-exist.bin");

    let mut cmd = Command::cargo_bin("triagekit")?;
    cmd.arg("scan").arg(&missing).arg("--store").arg(work_dir.path().join("store"));
    cmd.assert().code(2);

    Ok(())
}
