use anyhow::{Context, Result};
use ostinato_core::{
    Channel, MachineKinematics, PlannerSettings, PulseTiming,
    planner::DEFAULT_IDLE_TIMEOUT_MS,
    shaper::{Impulses, ShaperConfig},
};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Machine configuration for the simulator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Kinematics of the machine
    #[serde(default)]
    pub kinematics: MachineKinematics,

    /// Planner settings blob
    #[serde(default)]
    pub planner: PlannerSettings,

    /// Stepper driver configuration
    #[serde(default)]
    pub stepper: StepperConfig,

    /// Input shaping per motion channel
    #[serde(default)]
    pub shaping: ShapingConfig,
}

/// Stepper driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepperConfig {
    /// Pulse and direction timing
    #[serde(flatten)]
    pub timing: PulseTiming,

    /// Disable drivers after this long without motion; 0 keeps them on
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u32,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            timing: PulseTiming::default(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

fn default_idle_timeout_ms() -> u32 {
    DEFAULT_IDLE_TIMEOUT_MS
}

/// Input shapers, keyed by the axis whose motor channel they shape
/// (A, B and C on kinematic machines).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapingConfig {
    pub x: Option<ShaperConfig>,
    pub y: Option<ShaperConfig>,
    pub z: Option<ShaperConfig>,
}

impl ShapingConfig {
    /// Configured shapers with the channel each applies to.
    pub fn channels(&self) -> impl Iterator<Item = (Channel, &ShaperConfig)> {
        [
            (Channel::A, self.x.as_ref()),
            (Channel::B, self.y.as_ref()),
            (Channel::C, self.z.as_ref()),
        ]
        .into_iter()
        .filter_map(|(channel, config)| Some((channel, config?)))
    }
}

impl Config {
    /// Load configuration from a file, auto-detecting TOML or JSON format
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content).or_else(|_| Self::from_json(&content)),
        }
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse config as TOML")
    }

    /// Parse configuration from JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("failed to parse config as JSON")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.planner.validate().context("invalid [planner] settings")?;

        if let MachineKinematics::Delta(delta) = &self.kinematics {
            let geometry = delta.geometry();
            if !(geometry.diagonal_rod > geometry.radius && geometry.radius > 0.0) {
                anyhow::bail!("kinematics.diagonal_rod must be longer than kinematics.radius");
            }
            if !(geometry.printable_radius > 0.0 && geometry.printable_radius < geometry.radius) {
                anyhow::bail!("kinematics.printable_radius must be inside the tower radius");
            }
        }

        for (channel, shaper) in self.shaping.channels() {
            Impulses::new(shaper).with_context(|| format!("invalid shaper on {channel:?}"))?;
        }

        if self.stepper.timing.min_pulse_width_ns == 0 {
            anyhow::bail!("stepper.min_pulse_width_ns cannot be zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ostinato_core::{Axis, shaper::ShaperType};

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[kinematics]
type = "corexy"

[planner]
steps_per_unit = [100.0, 100.0, 400.0, 420.0]
acceleration = 1500.0
junction_deviation = 0.02

[stepper]
min_pulse_width_ns = 1000
dir_setup_ns = 200
idle_timeout_ms = 30000

[shaping.x]
type = "mzv"
frequency = 42.0
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.kinematics, MachineKinematics::CoreXY);
        assert_eq!(config.planner.steps_per_unit(Axis::E), 420.0);
        assert_eq!(config.planner.acceleration(), 1500.0);
        assert_eq!(config.stepper.timing.min_pulse_width_ns, 1000);
        assert_eq!(config.stepper.timing.dir_hold_ns, 650);
        assert_eq!(config.stepper.idle_timeout_ms, 30_000);
        let shaper = config.shaping.x.unwrap();
        assert_eq!(shaper.shaper, ShaperType::Mzv);
        assert_eq!(shaper.damping_ratio, 0.1);
        assert!(config.shaping.y.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "kinematics": {
                "type": "delta",
                "diagonal_rod": 250.0,
                "radius": 120.0,
                "printable_radius": 100.0
            },
            "planner": { "linear_advance_k": 0.05 }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(config.kinematics.name(), "delta");
        assert_eq!(config.planner.linear_advance_k(), 0.05);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.kinematics, MachineKinematics::Cartesian);
        assert_eq!(config.stepper.idle_timeout_ms, DEFAULT_IDLE_TIMEOUT_MS);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = Config::from_toml("[planner]\njunction_deviation = 3.0\n").unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_toml("[shaping.y]\ntype = \"zv\"\nfrequency = 0.0\n").unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_toml(
            "[kinematics]\ntype = \"delta\"\ndiagonal_rod = 100.0\nradius = 120.0\nprintable_radius = 90.0\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
