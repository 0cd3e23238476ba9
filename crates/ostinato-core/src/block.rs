//! Planned motion segments.
//!
//! A block is kept in two halves. [`PlanState`] is planner bookkeeping used
//! by the look-ahead passes and is never seen by the stepper engine.
//! [`BlockProfile`] is everything the engine needs to execute the block; the
//! planner may rewrite it until the engine marks the block busy, after
//! which the engine runs from its own copy.

use crate::kinematics::{Axis, NUM_AXES};

/// Planner-side block flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags(u8);

impl BlockFlags {
    const RECALCULATE: u8 = 1 << 0;
    const NOMINAL_LENGTH: u8 = 1 << 1;

    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn with_recalculate(mut self) -> Self {
        self.0 |= Self::RECALCULATE;
        self
    }

    pub const fn with_nominal_length(mut self) -> Self {
        self.0 |= Self::NOMINAL_LENGTH;
        self
    }

    /// Trapezoid must be recomputed.
    pub const fn recalculate(&self) -> bool {
        self.0 & Self::RECALCULATE != 0
    }

    /// The block is long enough to reach nominal speed from a stop.
    pub const fn nominal_length(&self) -> bool {
        self.0 & Self::NOMINAL_LENGTH != 0
    }

    pub fn set_recalculate(&mut self, on: bool) {
        if on {
            self.0 |= Self::RECALCULATE;
        } else {
            self.0 &= !Self::RECALCULATE;
        }
    }
}

/// Speeds and limits used by the look-ahead passes. Speeds are in units/s.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlanState {
    pub nominal_speed: f32,
    pub entry_speed: f32,
    pub max_entry_speed: f32,
    pub millimeters: f32,
    /// units/s²
    pub acceleration: f32,
    pub flags: BlockFlags,
}

impl PlanState {
    pub const EMPTY: Self = Self {
        nominal_speed: 0.0,
        entry_speed: 0.0,
        max_entry_speed: 0.0,
        millimeters: 0.0,
        acceleration: 0.0,
        flags: BlockFlags::new(),
    };
}

/// One bit per axis, set when that axis steps in the negative direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionBits(u8);

impl DirectionBits {
    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn with_reverse(mut self, axis: usize) -> Self {
        self.0 |= 1 << axis;
        self
    }

    pub const fn is_reverse(&self, axis: usize) -> bool {
        self.0 & (1 << axis) != 0
    }

    pub const fn is_forward(&self, axis: usize) -> bool {
        !self.is_reverse(axis)
    }
}

/// Execution parameters of a block, in step units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockProfile {
    /// Absolute step count per axis index (A, B, C, E).
    pub steps: [u32; NUM_AXES],
    pub direction: DirectionBits,
    pub extruder: u8,
    /// Steps of the dominant channel; one Bresenham event each.
    pub step_event_count: u32,
    /// steps/s
    pub nominal_rate: u32,
    pub initial_rate: u32,
    pub final_rate: u32,
    /// steps/s²
    pub acceleration_steps_per_s2: u32,
    /// Rate increase per timer tick, `<< 24` fixed point.
    pub acceleration_rate: u32,
    pub accelerate_until: u32,
    pub decelerate_after: u32,
    /// units/s
    pub entry_speed: f32,
    pub exit_speed: f32,
    /// Extra extruder steps per step/s of rate, `<< 24` fixed point. Zero
    /// when linear advance does not apply to this block.
    pub advance_scale: u32,
}

impl BlockProfile {
    pub const EMPTY: Self = Self {
        steps: [0; NUM_AXES],
        direction: DirectionBits::new(),
        extruder: 0,
        step_event_count: 0,
        nominal_rate: 0,
        initial_rate: 0,
        final_rate: 0,
        acceleration_steps_per_s2: 0,
        acceleration_rate: 0,
        accelerate_until: 0,
        decelerate_after: 0,
        entry_speed: 0.0,
        exit_speed: 0.0,
        advance_scale: 0,
    };

    pub fn steps_on(&self, axis: Axis) -> u32 {
        self.steps[axis.index()]
    }

    pub fn accelerate_steps(&self) -> u32 {
        self.accelerate_until
    }

    pub fn cruise_steps(&self) -> u32 {
        self.decelerate_after - self.accelerate_until
    }

    pub fn decelerate_steps(&self) -> u32 {
        self.step_event_count - self.decelerate_after
    }

    pub fn uses_advance(&self) -> bool {
        self.advance_scale != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recalculate_flag_toggles_without_touching_nominal_length() {
        let mut flags = BlockFlags::new().with_nominal_length();
        flags.set_recalculate(true);
        assert!(flags.recalculate());
        assert!(flags.nominal_length());
        flags.set_recalculate(false);
        assert!(!flags.recalculate());
        assert!(flags.nominal_length());
    }

    #[test]
    fn direction_bits_per_axis() {
        let dir = DirectionBits::new().with_reverse(1).with_reverse(3);
        assert!(dir.is_forward(0));
        assert!(dir.is_reverse(1));
        assert!(dir.is_forward(2));
        assert!(dir.is_reverse(3));
    }

    #[test]
    fn phase_lengths_cover_the_block() {
        let profile = BlockProfile {
            step_event_count: 100,
            accelerate_until: 20,
            decelerate_after: 70,
            ..BlockProfile::EMPTY
        };
        assert_eq!(
            profile.accelerate_steps() + profile.cruise_steps() + profile.decelerate_steps(),
            100
        );
    }
}
