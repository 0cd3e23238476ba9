//! Planner settings.
//!
//! Values are read when a block is planned, so a change only affects moves
//! queued afterwards. Every setter validates its input and keeps the prior
//! value when the new one is rejected. The struct is serde-serializable so
//! it can live in an externally owned settings blob; [`PlannerSettings::validate`]
//! checks a blob before it is applied.

use crate::kinematics::{Axis, MAX_EXTRUDERS, NUM_AXES};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SettingsError {
    #[error("{setting} must be a finite number, got {value}")]
    NonFinite { setting: &'static str, value: f32 },
    #[error("{setting}={value} is outside {min}..={max}")]
    OutOfRange {
        setting: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },
}

pub type Result<T, E = SettingsError> = core::result::Result<T, E>;

const STEPS_PER_UNIT: (f32, f32) = (0.001, 100_000.0);
const FEEDRATE: (f32, f32) = (0.001, 10_000.0);
const ACCELERATION: (f32, f32) = (1.0, 1_000_000.0);
const JUNCTION_DEVIATION: (f32, f32) = (0.001, 0.5);
const JERK: (f32, f32) = (0.0, 1_000.0);
const MIN_FEEDRATE: (f32, f32) = (0.0, 1_000.0);
const LINEAR_ADVANCE_K: (f32, f32) = (0.0, 10.0);
const EXTRUDE_LENGTH: (f32, f32) = (1.0, 10_000.0);
const MIN_SEGMENT_TIME_US: u32 = 1_000_000;

fn check(setting: &'static str, value: f32, (min, max): (f32, f32)) -> Result<f32> {
    let result = if !value.is_finite() {
        Err(SettingsError::NonFinite { setting, value })
    } else if value < min || value > max {
        Err(SettingsError::OutOfRange {
            setting,
            value,
            min,
            max,
        })
    } else {
        Ok(value)
    };
    if let Err(err) = &result {
        tracing::warn!(%err, "rejected planner setting");
    }
    result
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    steps_per_unit: [f32; NUM_AXES],
    max_feedrate: [f32; NUM_AXES],
    max_acceleration: [f32; NUM_AXES],
    acceleration: f32,
    retract_acceleration: f32,
    travel_acceleration: f32,
    junction_deviation: f32,
    max_jerk: [f32; NUM_AXES],
    min_segment_time_us: u32,
    min_feedrate: f32,
    min_travel_feedrate: f32,
    linear_advance_k: f32,
    max_extrude_length: f32,
    extruders: u8,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            steps_per_unit: [80.0, 80.0, 400.0, 500.0],
            max_feedrate: [300.0, 300.0, 5.0, 25.0],
            max_acceleration: [3000.0, 3000.0, 100.0, 10_000.0],
            acceleration: 3000.0,
            retract_acceleration: 3000.0,
            travel_acceleration: 3000.0,
            junction_deviation: 0.013,
            max_jerk: [10.0, 10.0, 0.3, 5.0],
            min_segment_time_us: 20_000,
            min_feedrate: 0.0,
            min_travel_feedrate: 0.0,
            linear_advance_k: 0.0,
            max_extrude_length: 200.0,
            extruders: 1,
        }
    }
}

impl PlannerSettings {
    /// Check every value of a settings blob against the setter ranges.
    pub fn validate(&self) -> Result<()> {
        let mut scratch = PlannerSettings::default();
        for axis in Axis::ALL {
            let i = axis.index();
            scratch.set_steps_per_unit(axis, self.steps_per_unit[i])?;
            scratch.set_max_feedrate(axis, self.max_feedrate[i])?;
            scratch.set_max_acceleration(axis, self.max_acceleration[i])?;
            scratch.set_max_jerk(axis, self.max_jerk[i])?;
        }
        scratch.set_acceleration(self.acceleration)?;
        scratch.set_retract_acceleration(self.retract_acceleration)?;
        scratch.set_travel_acceleration(self.travel_acceleration)?;
        scratch.set_junction_deviation(self.junction_deviation)?;
        scratch.set_min_segment_time_us(self.min_segment_time_us)?;
        scratch.set_min_feedrate(self.min_feedrate)?;
        scratch.set_min_travel_feedrate(self.min_travel_feedrate)?;
        scratch.set_linear_advance_k(self.linear_advance_k)?;
        scratch.set_max_extrude_length(self.max_extrude_length)?;
        scratch.set_extruders(self.extruders)?;
        Ok(())
    }

    pub fn steps_per_unit(&self, axis: Axis) -> f32 {
        self.steps_per_unit[axis.index()]
    }

    pub fn set_steps_per_unit(&mut self, axis: Axis, value: f32) -> Result<()> {
        self.steps_per_unit[axis.index()] = check("steps_per_unit", value, STEPS_PER_UNIT)?;
        Ok(())
    }

    /// Maximum speed of a channel in units/s
    pub fn max_feedrate(&self, axis: Axis) -> f32 {
        self.max_feedrate[axis.index()]
    }

    pub fn set_max_feedrate(&mut self, axis: Axis, value: f32) -> Result<()> {
        self.max_feedrate[axis.index()] = check("max_feedrate", value, FEEDRATE)?;
        Ok(())
    }

    /// Maximum acceleration of a channel in units/s²
    pub fn max_acceleration(&self, axis: Axis) -> f32 {
        self.max_acceleration[axis.index()]
    }

    pub fn set_max_acceleration(&mut self, axis: Axis, value: f32) -> Result<()> {
        self.max_acceleration[axis.index()] = check("max_acceleration", value, ACCELERATION)?;
        Ok(())
    }

    /// Maximum acceleration of a channel in steps/s²
    pub fn max_acceleration_steps(&self, axis: Axis) -> f32 {
        self.max_acceleration(axis) * self.steps_per_unit(axis)
    }

    /// Acceleration for moves that extrude
    pub fn acceleration(&self) -> f32 {
        self.acceleration
    }

    pub fn set_acceleration(&mut self, value: f32) -> Result<()> {
        self.acceleration = check("acceleration", value, ACCELERATION)?;
        Ok(())
    }

    /// Acceleration for extruder-only moves
    pub fn retract_acceleration(&self) -> f32 {
        self.retract_acceleration
    }

    pub fn set_retract_acceleration(&mut self, value: f32) -> Result<()> {
        self.retract_acceleration = check("retract_acceleration", value, ACCELERATION)?;
        Ok(())
    }

    /// Acceleration for moves without extrusion
    pub fn travel_acceleration(&self) -> f32 {
        self.travel_acceleration
    }

    pub fn set_travel_acceleration(&mut self, value: f32) -> Result<()> {
        self.travel_acceleration = check("travel_acceleration", value, ACCELERATION)?;
        Ok(())
    }

    pub fn junction_deviation(&self) -> f32 {
        self.junction_deviation
    }

    pub fn set_junction_deviation(&mut self, value: f32) -> Result<()> {
        self.junction_deviation = check("junction_deviation", value, JUNCTION_DEVIATION)?;
        Ok(())
    }

    pub fn max_jerk(&self, axis: Axis) -> f32 {
        self.max_jerk[axis.index()]
    }

    pub fn set_max_jerk(&mut self, axis: Axis, value: f32) -> Result<()> {
        self.max_jerk[axis.index()] = check("max_jerk", value, JERK)?;
        Ok(())
    }

    pub fn min_segment_time_us(&self) -> u32 {
        self.min_segment_time_us
    }

    pub fn set_min_segment_time_us(&mut self, value: u32) -> Result<()> {
        if value > MIN_SEGMENT_TIME_US {
            let err = SettingsError::OutOfRange {
                setting: "min_segment_time_us",
                value: value as f32,
                min: 0.0,
                max: MIN_SEGMENT_TIME_US as f32,
            };
            tracing::warn!(%err, "rejected planner setting");
            return Err(err);
        }
        self.min_segment_time_us = value;
        Ok(())
    }

    pub fn min_feedrate(&self) -> f32 {
        self.min_feedrate
    }

    pub fn set_min_feedrate(&mut self, value: f32) -> Result<()> {
        self.min_feedrate = check("min_feedrate", value, MIN_FEEDRATE)?;
        Ok(())
    }

    pub fn min_travel_feedrate(&self) -> f32 {
        self.min_travel_feedrate
    }

    pub fn set_min_travel_feedrate(&mut self, value: f32) -> Result<()> {
        self.min_travel_feedrate = check("min_travel_feedrate", value, MIN_FEEDRATE)?;
        Ok(())
    }

    /// Linear advance factor in mm of filament per mm/s of extrusion speed.
    /// Zero disables linear advance.
    pub fn linear_advance_k(&self) -> f32 {
        self.linear_advance_k
    }

    pub fn set_linear_advance_k(&mut self, value: f32) -> Result<()> {
        self.linear_advance_k = check("linear_advance_k", value, LINEAR_ADVANCE_K)?;
        Ok(())
    }

    pub fn max_extrude_length(&self) -> f32 {
        self.max_extrude_length
    }

    pub fn set_max_extrude_length(&mut self, value: f32) -> Result<()> {
        self.max_extrude_length = check("max_extrude_length", value, EXTRUDE_LENGTH)?;
        Ok(())
    }

    pub fn extruders(&self) -> u8 {
        self.extruders
    }

    pub fn set_extruders(&mut self, value: u8) -> Result<()> {
        let range = (1.0, MAX_EXTRUDERS as f32);
        self.extruders = check("extruders", value as f32, range)? as u8;
        Ok(())
    }
}
