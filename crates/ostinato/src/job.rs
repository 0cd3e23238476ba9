use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Feedrate used until a move sets one, in units/min.
pub const DEFAULT_FEEDRATE: f32 = 3_000.0;

/// A list of moves to run through the planner
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub moves: Vec<Move>,
}

/// One linear move in absolute coordinates. Omitted axes keep their
/// previous value, and the feedrate is modal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Move {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub z: Option<f32>,
    pub e: Option<f32>,
    /// units/min
    #[serde(alias = "f")]
    pub feedrate: Option<f32>,
    #[serde(default)]
    pub extruder: u8,
}

impl Job {
    /// Load a job from a file, auto-detecting TOML or JSON format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read job file {}", path.display()))?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content).or_else(|_| Self::from_json(&content)),
        }
    }

    /// Parse a job from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse job as TOML")
    }

    /// Parse a job from JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse job as JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[[moves]]
x = 10.0
y = 5.0
f = 6000.0

[[moves]]
e = 1.5
extruder = 1
"#;
        let job = Job::from_toml(toml).unwrap();
        assert_eq!(job.moves.len(), 2);
        assert_eq!(job.moves[0].feedrate, Some(6000.0));
        assert_eq!(job.moves[0].z, None);
        assert_eq!(job.moves[1].e, Some(1.5));
        assert_eq!(job.moves[1].extruder, 1);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"moves": [{"x": 1.0}, {"y": 2.0, "feedrate": 1200.0}]}"#;
        let job = Job::from_json(json).unwrap();
        assert_eq!(job.moves[1].feedrate, Some(1200.0));
        assert_eq!(job.moves[1].extruder, 0);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        assert!(Job::from_json(r#"{"moves": [{"w": 1.0}]}"#).is_err());
    }
}
