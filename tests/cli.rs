// Copyright (c) 2024 The Regents of the University of Michigan.
// Part of gantry, released under the BSD 3-Clause License.

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use serial_test::parallel;
use std::fs;

use gantry::DATA_DIRECTORY_NAME;

/// Configure a home directory whose `localhost` storage lives in the temp dir.
fn setup_home(temp: &TempDir) -> Result<(), Box<dyn std::error::Error>> {
    let config = temp.child("home").child(".config").child("gantry");
    config.create_dir_all()?;

    config.child("resources.toml").write_str(&format!(
        r#"
[[storage_resource]]
id = "localhost"
host_name = "localhost"
file_system_root = "{}"
"#,
        temp.child("storage").path().display()
    ))?;

    config.child("engine.toml").write_str(
        r#"
monitor_interval = "00:00:01"
output_wait_backoff = "00:00:01"
verification_backoff = "00:00:01"
"#,
    )?;

    Ok(())
}

/// Write a process file that copies its input to its output on localhost.
fn setup_process(temp: &TempDir, process_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    temp.child("input.txt").write_str("hello gantry\n")?;
    temp.child(format!("{process_id}.toml")).write_str(&format!(
        r#"
process_id = "{process_id}"
experiment_id = "e1"
compute_resource = "localhost"
storage_resource = "localhost"
working_directory = "{work}"

[application]
name = "copy"
executable = "/bin/sh"
arguments = ["-c", "cat input.txt > result.txt"]

[[input]]
name = "data"
value = "{input}"
type = "URI"
is_required = true

[[output]]
name = "result"
value = "result.txt"
type = "URI"
is_required = true
"#,
        work = temp.child("work").child(process_id).path().display(),
        input = temp.child("input.txt").path().display(),
    ))?;

    Ok(())
}

fn gantry(temp: &TempDir) -> Result<Command, Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("gantry")?;
    cmd.current_dir(temp.path())
        .env("GANTRY_HOME", temp.child("home").path())
        .env_remove("GANTRY_COLOR")
        .env_remove("CLICOLOR")
        .env_remove("GANTRY_LOG")
        .arg("--no-progress");
    Ok(cmd)
}

#[test]
#[parallel]
fn requires_subcommand() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("gantry")?;

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("requires a subcommand"));

    Ok(())
}

#[test]
#[parallel]
fn help() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("gantry")?;

    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Usage: gantry"));

    Ok(())
}

#[test]
#[parallel]
fn show_resources() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    setup_home(&temp)?;

    gantry(&temp)?
        .args(["show", "resources"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[[compute_resource]]"))
        .stdout(predicate::str::contains(r#"job_manager = "fork""#))
        .stdout(predicate::str::contains(
            temp.child("storage").path().display().to_string(),
        ));

    gantry(&temp)?
        .args(["show", "resources", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[[storage_resource]]"));

    gantry(&temp)?
        .args(["show", "resources", "--resource", "elsewhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Compute resource 'elsewhere' not found",
        ));

    Ok(())
}

#[test]
#[parallel]
fn invalid_resources() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    setup_home(&temp)?;
    temp.child("home/.config/gantry/resources.toml")
        .write_str("[[compute_resource]]\nid = 3\n")?;

    gantry(&temp)?
        .args(["show", "resources"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("resources.toml"));

    Ok(())
}

#[test]
#[parallel]
fn show_script() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    setup_home(&temp)?;
    setup_process(&temp, "script")?;

    gantry(&temp)?
        .args(["show", "script", "script.toml", "--job-name", "A123456789"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("#!/bin/bash"))
        .stdout(predicate::str::contains("echo $!"))
        .stdout(predicate::str::contains("input.txt"));

    assert!(!temp.child(DATA_DIRECTORY_NAME).exists());

    Ok(())
}

#[test]
#[parallel]
fn missing_process_file() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    setup_home(&temp)?;

    gantry(&temp)?
        .args(["run", "missing.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.toml"));

    Ok(())
}

#[test]
#[parallel]
fn unknown_compute_resource() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    setup_home(&temp)?;
    setup_process(&temp, "p1")?;
    let path = temp.child("p1.toml");
    let contents = fs::read_to_string(path.path())?;
    path.write_str(&contents.replace(
        r#"compute_resource = "localhost""#,
        r#"compute_resource = "cluster""#,
    ))?;

    gantry(&temp)?
        .args(["run", "p1.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Compute resource 'cluster' not found"));

    Ok(())
}

#[test]
#[parallel]
fn unknown_process() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    setup_home(&temp)?;

    gantry(&temp)?
        .args(["cancel", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("'nope' not found in the registry"));

    gantry(&temp)?
        .args(["recover", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("'nope' not found in the registry"));

    Ok(())
}

#[test]
#[parallel]
fn empty_registry() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    setup_home(&temp)?;

    gantry(&temp)?
        .args(["show", "jobs"])
        .assert()
        .success()
        .stdout(predicate::str::is_match("(?m)^Process +Job ID")?);

    gantry(&temp)?
        .args(["show", "process", "--no-header"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    Ok(())
}

#[test]
#[parallel]
fn run_on_localhost() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    setup_home(&temp)?;
    setup_process(&temp, "copy-1")?;

    gantry(&temp)?
        .args(["run", "copy-1.toml"])
        .assert()
        .success()
        .stdout(predicate::str::is_match("(?m)^copy-1 +COMPLETED")?);

    let staged = temp.child("storage").child("copy-1").child("result.txt");
    assert_eq!(fs::read_to_string(staged.path())?, "hello gantry\n");
    assert!(temp
        .child(DATA_DIRECTORY_NAME)
        .child("registry.postcard")
        .exists());

    gantry(&temp)?
        .args(["show", "jobs"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(
            r"(?m)^copy-1 +\S+ +A\w+ +localhost +COMPLETE ",
        )?);

    gantry(&temp)?
        .args(["show", "process", "copy-1"])
        .assert()
        .success()
        .stdout(predicate::str::is_match("ENV_SETUP +COMPLETED")?)
        .stdout(predicate::str::is_match("JOB_SUBMISSION +COMPLETED")?)
        .stdout(predicate::str::is_match("DATA_STAGING +COMPLETED")?);

    gantry(&temp)?
        .args(["show", "process", "copy-1", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""process_id": "copy-1""#));

    // Recovering a finished process changes nothing.
    gantry(&temp)?
        .args(["recover", "copy-1"])
        .assert()
        .success()
        .stdout(predicate::str::is_match("(?m)^copy-1 +COMPLETED")?);

    // The process already exists.
    gantry(&temp)?
        .args(["run", "copy-1.toml"])
        .assert()
        .success()
        .stderr(predicate::str::contains("already exists"));

    Ok(())
}

#[test]
#[parallel]
fn missing_output_fails_the_process() -> Result<(), Box<dyn std::error::Error>> {
    let temp = TempDir::new()?;
    setup_home(&temp)?;
    setup_process(&temp, "fail-1")?;
    let path = temp.child("fail-1.toml");
    let contents = fs::read_to_string(path.path())?;
    path.write_str(&contents.replace("cat input.txt > result.txt", "true"))?;

    gantry(&temp)?
        .args(["run", "fail-1.toml"])
        .assert()
        .failure()
        .stdout(predicate::str::is_match("(?m)^fail-1 +FAILED")?)
        .stderr(predicate::str::contains("1 of 1 process(es) did not complete."));

    Ok(())
}
