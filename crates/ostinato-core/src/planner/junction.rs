//! Cornering speed between two consecutive blocks.
//!
//! The default policy is junction deviation: the corner is treated as an
//! arc that stays within `junction_deviation` of the sharp corner, and the
//! speed is the one whose centripetal acceleration equals the block's
//! acceleration. With the `classic-jerk` feature the per-axis velocity
//! change across the junction is capped by `max_jerk` instead.

use crate::{kinematics::NUM_AXES, settings::PlannerSettings};
#[allow(unused_imports)]
use num_traits::float::Float;

/// Direction and speed of a planned move, kept for the next junction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveVector {
    /// XYZ unit vector of the move.
    pub unit: [f32; 3],
    /// Signed per-axis speeds (units/s) at nominal speed.
    pub speed: [f32; NUM_AXES],
    pub nominal_speed: f32,
    /// Highest speed at which this move could start or stop abruptly.
    pub safe_speed: f32,
}

impl MoveVector {
    pub fn new(
        delta: [f32; NUM_AXES],
        millimeters: f32,
        nominal_speed: f32,
        settings: &PlannerSettings,
    ) -> Self {
        let inverse = if millimeters > 0.0 {
            1.0 / millimeters
        } else {
            0.0
        };
        let unit = [delta[0] * inverse, delta[1] * inverse, delta[2] * inverse];
        let speed = delta.map(|d| d * inverse * nominal_speed);
        let safe_speed = safe_speed(&speed, nominal_speed, settings);
        Self {
            unit,
            speed,
            nominal_speed,
            safe_speed,
        }
    }
}

/// Largest nominal-direction speed at which no axis exceeds its jerk.
fn safe_speed(speed: &[f32; NUM_AXES], nominal_speed: f32, settings: &PlannerSettings) -> f32 {
    let mut safe = nominal_speed;
    let mut limited = false;
    for (axis, v) in crate::kinematics::Axis::ALL.into_iter().zip(speed) {
        let jerk = v.abs();
        let max = settings.max_jerk(axis);
        if jerk > max {
            if limited {
                let mjerk = max * nominal_speed;
                if jerk * safe > mjerk {
                    safe = mjerk / jerk;
                }
            } else {
                limited = true;
                safe = max;
            }
        }
    }
    safe
}

/// Maximum speed at the junction into `current`. `previous` is `None` when
/// the machine is at rest.
#[cfg(not(feature = "classic-jerk"))]
pub fn max_junction_speed(
    previous: Option<&MoveVector>,
    current: &MoveVector,
    acceleration: f32,
    settings: &PlannerSettings,
) -> f32 {
    let Some(previous) = previous else {
        return 0.0;
    };
    if previous.nominal_speed <= f32::EPSILON {
        return 0.0;
    }

    // previous unit vector is negated, so a straight line gives -1
    let cos_theta: f32 = -previous
        .unit
        .iter()
        .zip(&current.unit)
        .map(|(a, b)| a * b)
        .sum::<f32>();

    // near full reversal
    if cos_theta >= 0.95 {
        return 0.0;
    }

    let mut vmax = previous.nominal_speed.min(current.nominal_speed);
    // straight enough that the deviation term would divide by ~zero
    if cos_theta > -0.95 {
        let sin_theta_d2 = (0.5 * (1.0 - cos_theta)).sqrt();
        let deviation = settings.junction_deviation();
        let limit = (acceleration * deviation * sin_theta_d2 / (1.0 - sin_theta_d2)).sqrt();
        vmax = vmax.min(limit);
    }
    vmax
}

/// Maximum speed at the junction into `current`. `previous` is `None` when
/// the machine is at rest.
#[cfg(feature = "classic-jerk")]
pub fn max_junction_speed(
    previous: Option<&MoveVector>,
    current: &MoveVector,
    _acceleration: f32,
    settings: &PlannerSettings,
) -> f32 {
    let Some(previous) = previous else {
        return current.safe_speed;
    };
    if previous.nominal_speed <= f32::EPSILON {
        return current.safe_speed;
    }

    let mut vmax = current.nominal_speed.min(previous.nominal_speed);
    let mut v_factor = 1.0f32;
    let mut limited = false;
    let smaller_speed_factor = vmax / previous.nominal_speed;

    for axis in crate::kinematics::Axis::ALL {
        let i = axis.index();
        let mut v_exit = previous.speed[i] * smaller_speed_factor;
        let mut v_entry = current.speed[i];
        if limited {
            v_exit *= v_factor;
            v_entry *= v_factor;
        }

        // coasting in one direction versus reversing the axis
        let jerk = if v_exit > v_entry {
            if v_entry > 0.0 || v_exit < 0.0 {
                v_exit - v_entry
            } else {
                v_exit.max(-v_entry)
            }
        } else if v_entry < 0.0 || v_exit > 0.0 {
            v_entry - v_exit
        } else {
            (-v_exit).max(v_entry)
        };

        let max = settings.max_jerk(axis);
        if jerk > max {
            v_factor *= max / jerk;
            limited = true;
        }
    }
    if limited {
        vmax *= v_factor;
    }

    let threshold = vmax * 0.99;
    if previous.safe_speed > threshold && current.safe_speed > threshold {
        vmax = current.safe_speed;
    }
    vmax
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(dx: f32, dy: f32, speed: f32, settings: &PlannerSettings) -> MoveVector {
        let mm = (dx * dx + dy * dy).sqrt();
        MoveVector::new([dx, dy, 0.0, 0.0], mm, speed, settings)
    }

    #[test]
    fn safe_speed_is_bounded_by_the_worst_axis() {
        let settings = PlannerSettings::default();
        let v = vector(10.0, 0.0, 100.0, &settings);
        assert_eq!(v.safe_speed, settings.max_jerk(crate::kinematics::Axis::X));
        let slow = vector(10.0, 0.0, 5.0, &settings);
        assert_eq!(slow.safe_speed, 5.0);
    }

    #[cfg(not(feature = "classic-jerk"))]
    mod junction_deviation {
        use super::*;

        #[test]
        fn from_rest_is_zero() {
            let settings = PlannerSettings::default();
            let v = vector(10.0, 0.0, 50.0, &settings);
            assert_eq!(max_junction_speed(None, &v, 500.0, &settings), 0.0);
        }

        #[test]
        fn collinear_keeps_the_lower_nominal_speed() {
            let settings = PlannerSettings::default();
            let a = vector(10.0, 0.0, 50.0, &settings);
            let b = vector(20.0, 0.0, 40.0, &settings);
            assert_eq!(max_junction_speed(Some(&a), &b, 500.0, &settings), 40.0);
        }

        #[test]
        fn right_angle_is_limited_by_deviation() {
            let mut settings = PlannerSettings::default();
            settings.set_junction_deviation(0.01).unwrap();
            let a = vector(10.0, 0.0, 200.0, &settings);
            let b = vector(0.0, 10.0, 200.0, &settings);
            let v = max_junction_speed(Some(&a), &b, 3000.0, &settings);
            // sqrt(3000 * 0.01 * 0.7071 / 0.2929)
            assert!((v - 8.51).abs() < 0.05, "{v}");
        }

        #[test]
        fn reversal_stops() {
            let settings = PlannerSettings::default();
            let a = vector(10.0, 0.0, 50.0, &settings);
            let b = vector(-10.0, 0.0, 50.0, &settings);
            assert_eq!(max_junction_speed(Some(&a), &b, 500.0, &settings), 0.0);
        }

        #[test]
        fn wider_deviation_corners_faster() {
            let mut tight = PlannerSettings::default();
            tight.set_junction_deviation(0.005).unwrap();
            let mut loose = PlannerSettings::default();
            loose.set_junction_deviation(0.1).unwrap();
            let a = vector(10.0, 0.0, 200.0, &tight);
            let b = vector(5.0, 5.0, 200.0, &tight);
            let slow = max_junction_speed(Some(&a), &b, 3000.0, &tight);
            let fast = max_junction_speed(Some(&a), &b, 3000.0, &loose);
            assert!(fast > slow);
        }
    }

    #[cfg(feature = "classic-jerk")]
    mod classic_jerk {
        use super::*;

        #[test]
        fn collinear_keeps_the_lower_nominal_speed() {
            let settings = PlannerSettings::default();
            let a = vector(10.0, 0.0, 50.0, &settings);
            let b = vector(20.0, 0.0, 40.0, &settings);
            assert_eq!(max_junction_speed(Some(&a), &b, 500.0, &settings), 40.0);
        }

        #[test]
        fn right_angle_is_limited_by_jerk() {
            let settings = PlannerSettings::default();
            let a = vector(10.0, 0.0, 200.0, &settings);
            let b = vector(0.0, 10.0, 200.0, &settings);
            let v = max_junction_speed(Some(&a), &b, 3000.0, &settings);
            assert!(v <= settings.max_jerk(crate::kinematics::Axis::X) + 1e-3, "{v}");
        }
    }
}
