//! Motion planning and stepper pulse generation for 3D printer firmware.
//!
//! This crate avoids any board-specific dependencies: pins are driven
//! through [`stepper::StepperHal`] and the main loop yields through
//! [`planner::Idle`]. Nothing allocates.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod block;
pub mod block_buffer;
pub mod kinematics;
pub mod linear_advance;
pub mod motion;
pub mod planner;
pub mod settings;
pub mod shaper;
pub mod stepper;

#[cfg(test)]
mod testing;

pub use kinematics::{Axis, Channel, Kinematics, MachineKinematics, Position};
pub use motion::{MachineState, Motion, StepperStatus};
pub use planner::{Idle, Planner, PlannerError};
pub use settings::{PlannerSettings, SettingsError};
pub use stepper::{PulseTiming, Stepper, StepperHal};
