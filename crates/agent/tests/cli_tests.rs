//! CLI integration tests

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use mockito::{Matcher, ServerGuard};
use std::io::Cursor;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Binary run from an empty directory with no inherited agent settings
fn agent(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_forest-agent"));
    cmd.current_dir(dir)
        .env_remove("FOREST_API_KEY")
        .env_remove("FOREST_DB")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1");
    cmd
}

fn run(cmd: &mut Command) -> Output {
    cmd.output().expect("Failed to execute forest-agent")
}

fn forest_tile() -> Vec<u8> {
    let img = RgbImage::from_fn(64, 64, |x, y| Rgb([40 + (x % 16) as u8, 150, 30 + (y % 16) as u8]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

fn mock_tile(server: &mut ServerGuard) {
    let pointer = format!(r#"{{"date": "2024-01-01", "url": "{}/tiles/site.png"}}"#, server.url());
    server
        .mock("GET", "/planetary/earth/assets")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(pointer)
        .create();
    server
        .mock("GET", "/tiles/site.png")
        .with_status(200)
        .with_header("content-type", "image/png")
        .with_body(forest_tile())
        .create();
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let dir = TempDir::new().unwrap();
    let output = run(agent(dir.path()).arg("--help"));
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    for command in ["run", "monitor", "show", "history"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let dir = TempDir::new().unwrap();
    let output = run(agent(dir.path()).arg("--version"));
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("forest-agent"), "Should show binary name");
}

#[test]
fn test_monitor_help_lists_schedule_options() {
    let dir = TempDir::new().unwrap();
    let output = run(agent(dir.path()).args(["monitor", "--help"]));
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--site"));
    assert!(stdout.contains("--at"));
    assert!(stdout.contains("--api-key"));
}

#[test]
fn test_run_without_api_key_fails() {
    let dir = TempDir::new().unwrap();
    let output = run(agent(dir.path()).args(["run", "--lat", "48.8566", "--lon", "2.3522"]));

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--api-key"));
}

#[test]
fn test_show_missing_observation_fails() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("results.db");
    let output = run(agent(dir.path()).args([
        "show", "--lat", "48.8566", "--lon", "2.3522", "--date", "2024-01-01", "--db",
    ])
    .arg(&db));

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no observation stored"));
}

#[test]
fn test_history_on_empty_store() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("results.db");
    let output = run(agent(dir.path())
        .args(["history", "--lat", "48.8566", "--lon", "2.3522", "--db"])
        .arg(&db));

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No observations found"));
}

#[test]
fn test_run_without_imagery_reports_acquisition_stage() {
    let mut server = mockito::Server::new();
    server
        .mock("GET", "/planetary/earth/assets")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"msg": "No imagery for specified date."}"#)
        .create();

    let dir = TempDir::new().unwrap();
    let output = run(agent(dir.path())
        .env("FOREST__PROVIDER__BASE_URL", format!("{}/planetary/earth/assets", server.url()))
        .env("FOREST_API_KEY", "DEMO_KEY")
        .args(["run", "--lat", "48.8566", "--lon", "2.3522", "--date", "2024-01-01", "--db"])
        .arg(dir.path().join("results.db")));

    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("stage=acquisition"));
}

#[test]
fn test_run_then_history_round_trip() {
    let mut server = mockito::Server::new();
    mock_tile(&mut server);

    let dir = TempDir::new().unwrap();
    let db = dir.path().join("results.db");
    let image_path = dir.path().join("site.png");

    let output = run(agent(dir.path())
        .env("FOREST__PROVIDER__BASE_URL", format!("{}/planetary/earth/assets", server.url()))
        .args([
            "run", "--lat", "-3.4653", "--lon", "-62.2159", "--date", "2024-01-01",
            "--api-key", "DEMO_KEY", "--save-image",
        ])
        .arg(&image_path)
        .arg("--db")
        .arg(&db));
    assert!(
        output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(image::open(&image_path).unwrap().width(), 64);

    let output = run(agent(dir.path())
        .args(["history", "--lat", "-3.4653", "--lon", "-62.2159", "--format", "json", "--db"])
        .arg(&db));
    assert!(output.status.success());

    let records: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["result"]["date"], "2024-01-01");
}

#[test]
fn test_rerun_with_reject_policy_reports_persistence_stage() {
    let mut server = mockito::Server::new();
    mock_tile(&mut server);

    let dir = TempDir::new().unwrap();
    let db = dir.path().join("results.db");
    let rerun = || {
        run(agent(dir.path())
            .env("FOREST__PROVIDER__BASE_URL", format!("{}/planetary/earth/assets", server.url()))
            .env("FOREST_API_KEY", "DEMO_KEY")
            .args([
                "run", "--lat", "48.8566", "--lon", "2.3522", "--date", "2024-01-01",
                "--conflict-policy", "reject", "--db",
            ])
            .arg(&db))
    };

    assert!(rerun().status.success());

    let second = rerun();
    assert_eq!(second.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&second.stderr).contains("stage=persistence"));
}
