use std::{
    path::Path,
    process::{Command, Output},
};

use tempfile::TempDir;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const LAB: &str = r#"
name: cli-lab
images:
  - name: ubuntu
    docker_image: ubuntu:22.04
networks:
  - name: lan
    subnet: 10.0.1.0/24
vms:
  - hostname: ws01
    network: lan
    ip: 10.0.1.10
    image: ubuntu
    display: SERVER
"#;

//--------------------------------------------------------------------------------------------------
// Function: Helper
//--------------------------------------------------------------------------------------------------

/// Runs the cyroid binary against a database inside `home`.
fn run_cyroid(home: &Path, args: &[&str]) -> Output {
    let db_path = home.join("cyroid.db");
    Command::new(env!("CARGO_BIN_EXE_cyroid"))
        .env("CYROID_HOME", home)
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(&db_path)
        .args(args)
        .output()
        .expect("failed to run cyroid")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test]
fn test_create_then_list_ranges() {
    let temp_dir = TempDir::new().expect("failed to create temp directory");
    let definition = temp_dir.path().join("lab.yaml");
    std::fs::write(&definition, LAB).expect("failed to write definition");

    let output = run_cyroid(
        temp_dir.path(),
        &["create", "--file", definition.to_str().expect("utf-8 path")],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 networks, 1 vms"), "unexpected output: {stdout}");
    assert!(temp_dir.path().join("cyroid.db").is_file());

    let output = run_cyroid(temp_dir.path(), &["status"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("cli-lab"));
    assert!(stdout.contains("DRAFT"));
}

#[test]
fn test_create_rejects_dangling_network() {
    let temp_dir = TempDir::new().expect("failed to create temp directory");
    let definition = temp_dir.path().join("lab.yaml");
    std::fs::write(&definition, LAB.replace("network: lan", "network: dmz"))
        .expect("failed to write definition");

    let output = run_cyroid(
        temp_dir.path(),
        &["create", "--file", definition.to_str().expect("utf-8 path")],
    );
    assert!(!output.status.success());
}

#[test]
fn test_rejects_malformed_range_id() {
    let temp_dir = TempDir::new().expect("failed to create temp directory");
    let output = run_cyroid(temp_dir.path(), &["deploy", "not-a-uuid"]);
    assert!(!output.status.success());
}
