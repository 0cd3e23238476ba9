/// Integration tests for loading files and running the simulator
use anyhow::Result;
use ostinato::{config::Config, job::Job, sim::simulate};
use std::{fs, process::Command};

const COREXY_CONFIG: &str = r#"
[kinematics]
type = "corexy"

[planner]
acceleration = 2000.0
travel_acceleration = 2000.0

[stepper]
idle_timeout_ms = 0

[shaping.x]
type = "zv"
frequency = 60.0
"#;

const JOB: &str = r#"{
    "moves": [
        { "x": 10.0, "f": 6000.0 },
        { "y": 10.0 },
        { "x": 0.0 },
        { "y": 0.0 }
    ]
}"#;

#[test]
fn test_simulate_from_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("machine.toml");
    let job_path = dir.path().join("job.json");
    fs::write(&config_path, COREXY_CONFIG)?;
    fs::write(&job_path, JOB)?;

    let config = Config::from_file(&config_path)?;
    let job = Job::from_file(&job_path)?;
    let report = simulate(&config, &job)?;

    assert_eq!(report.kinematics, "corexy");
    assert_eq!(report.blocks, 4);
    // every leg moves both motors by 10 mm at 80 steps/mm
    assert_eq!(report.channels["a"].pulses, 3_200);
    assert_eq!(report.channels["b"].pulses, 3_200);
    assert_eq!(report.channels["a"].position, 0);
    assert_eq!(report.channels["b"].position, 0);
    assert_eq!(report.shaper_overflows, 0);
    assert!(report.drivers_enabled);

    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("machine.toml");
    fs::write(&config_path, "[planner]\nacceleration = -5.0\n")?;

    let config = Config::from_file(&config_path)?;
    assert!(config.validate().is_err());
    assert!(simulate(&config, &Job::default()).is_err());

    Ok(())
}

#[test]
fn test_cli_check_and_simulate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("machine.toml");
    let job_path = dir.path().join("job.json");
    fs::write(&config_path, COREXY_CONFIG)?;
    fs::write(&job_path, JOB)?;

    let output = Command::new(env!("CARGO_BIN_EXE_ostinato"))
        .arg("check")
        .arg(&config_path)
        .output()?;
    assert!(output.status.success());
    assert!(String::from_utf8(output.stdout)?.contains("corexy"));

    let output = Command::new(env!("CARGO_BIN_EXE_ostinato"))
        .arg("simulate")
        .arg(&config_path)
        .arg(&job_path)
        .arg("--json")
        .output()?;
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report["blocks"], 4);
    assert_eq!(report["channels"]["a"]["position"], 0);

    Ok(())
}
