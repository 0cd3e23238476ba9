//! Trapezoid velocity profile for one block, in step units.
//!
//! Everything here runs once per block when its entry or exit speed
//! changes, never per step.

use crate::{block::BlockProfile, stepper::MINIMAL_STEP_RATE};
#[allow(unused_imports)]
use num_traits::float::Float;

/// Distance (steps) needed to go from `initial_rate` to `target_rate` at
/// `accel` steps/s².
fn estimate_acceleration_distance(initial_rate: f32, target_rate: f32, accel: f32) -> f32 {
    if accel == 0.0 {
        return 0.0;
    }
    (target_rate * target_rate - initial_rate * initial_rate) / (accel * 2.0)
}

/// Step at which to stop accelerating and start braking so a block of
/// `distance` steps ends exactly at `final_rate`.
fn intersection_distance(initial_rate: f32, final_rate: f32, accel: f32, distance: f32) -> f32 {
    if accel == 0.0 {
        return 0.0;
    }
    (accel * 2.0 * distance - initial_rate * initial_rate + final_rate * final_rate) / (accel * 4.0)
}

/// Fills in the rates and phase boundaries of `profile` for the given
/// entry and exit speeds (units/s) of a block whose nominal speed is
/// `nominal_speed`.
pub fn calculate_trapezoid(
    profile: &mut BlockProfile,
    nominal_speed: f32,
    entry_speed: f32,
    exit_speed: f32,
) {
    let (entry_factor, exit_factor) = if nominal_speed > 0.0 {
        (entry_speed / nominal_speed, exit_speed / nominal_speed)
    } else {
        (0.0, 0.0)
    };
    let nominal_rate = profile.nominal_rate as f32;
    let initial_rate = ((nominal_rate * entry_factor).ceil() as u32).max(MINIMAL_STEP_RATE);
    let final_rate = ((nominal_rate * exit_factor).ceil() as u32).max(MINIMAL_STEP_RATE);

    let accel = profile.acceleration_steps_per_s2 as f32;
    let total = profile.step_event_count as i64;

    let mut accelerate_steps =
        estimate_acceleration_distance(initial_rate as f32, nominal_rate, accel).ceil() as i64;
    let decelerate_steps =
        estimate_acceleration_distance(nominal_rate, final_rate as f32, -accel).floor() as i64;
    let mut plateau_steps = total - accelerate_steps.max(0) - decelerate_steps.max(0);

    if plateau_steps < 0 {
        // nominal rate is never reached
        accelerate_steps = intersection_distance(
            initial_rate as f32,
            final_rate as f32,
            accel,
            total as f32,
        )
        .ceil() as i64;
        accelerate_steps = accelerate_steps.clamp(0, total);
        plateau_steps = 0;
    } else {
        accelerate_steps = accelerate_steps.max(0);
    }

    profile.initial_rate = initial_rate;
    profile.final_rate = final_rate;
    profile.accelerate_until = accelerate_steps as u32;
    profile.decelerate_after = (accelerate_steps + plateau_steps) as u32;
    profile.entry_speed = entry_speed;
    profile.exit_speed = exit_speed;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(step_event_count: u32, nominal_rate: u32, accel: u32) -> BlockProfile {
        BlockProfile {
            steps: [step_event_count, 0, 0, 0],
            step_event_count,
            nominal_rate,
            acceleration_steps_per_s2: accel,
            ..BlockProfile::EMPTY
        }
    }

    #[test]
    fn isolated_block_phases_sum_to_total() {
        // 100 mm at 80 steps/mm, 50 mm/s, 500 mm/s²
        let mut p = profile(8000, 4000, 40_000);
        calculate_trapezoid(&mut p, 50.0, 0.0, 0.0);
        assert_eq!(
            p.accelerate_steps() + p.cruise_steps() + p.decelerate_steps(),
            8000
        );
        // v²/2a = 2.5 mm = 200 steps each way, less the minimal start rate
        assert!(p.accelerate_steps() > 190 && p.accelerate_steps() <= 200);
        assert!(p.decelerate_steps() > 190 && p.decelerate_steps() <= 200);
        assert_eq!(p.initial_rate, MINIMAL_STEP_RATE);
        assert_eq!(p.final_rate, MINIMAL_STEP_RATE);
    }

    #[test]
    fn short_block_is_a_triangle() {
        let mut p = profile(100, 4000, 40_000);
        calculate_trapezoid(&mut p, 50.0, 0.0, 0.0);
        assert_eq!(p.cruise_steps(), 0);
        assert_eq!(p.accelerate_until, p.decelerate_after);
        assert!(p.accelerate_steps().abs_diff(50) <= 1);
        assert_eq!(p.accelerate_steps() + p.decelerate_steps(), 100);
    }

    #[test]
    fn asymmetric_triangle_favors_the_slow_end() {
        // Enter fast, leave at rest: most of the block brakes.
        let mut p = profile(100, 4000, 40_000);
        calculate_trapezoid(&mut p, 50.0, 30.0, 0.0);
        assert!(p.decelerate_steps() > p.accelerate_steps());
        assert_eq!(p.accelerate_steps() + p.cruise_steps() + p.decelerate_steps(), 100);
    }

    #[test]
    fn entering_at_nominal_skips_acceleration() {
        let mut p = profile(8000, 4000, 40_000);
        calculate_trapezoid(&mut p, 50.0, 50.0, 50.0);
        assert_eq!(p.accelerate_steps(), 0);
        assert_eq!(p.decelerate_steps(), 0);
        assert_eq!(p.cruise_steps(), 8000);
        assert_eq!(p.initial_rate, 4000);
    }

    #[test]
    fn unreachable_exit_speed_clamps_to_block() {
        // Asked to leave far faster than the block can accelerate to.
        let mut p = profile(10, 4000, 1_000);
        calculate_trapezoid(&mut p, 50.0, 0.0, 50.0);
        assert_eq!(p.accelerate_steps(), 10);
        assert_eq!(p.decelerate_steps(), 0);
    }
}
