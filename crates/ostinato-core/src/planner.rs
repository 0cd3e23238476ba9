//! Look-ahead motion planner.
//!
//! [`Planner::buffer_line`] turns a move into a block and queues it. After
//! every enqueue the planner re-runs the look-ahead over every block the
//! engine has not started yet:
//!
//! 1. a reverse pass, newest to oldest, raises each entry speed as far as
//!    the block can still brake to the next entry speed (the newest block
//!    exits at rest);
//! 2. a forward pass, oldest to newest, caps each entry speed at what the
//!    previous block can accelerate to;
//! 3. trapezoids are recomputed for blocks whose speeds changed.
//!
//! The oldest block the planner may touch keeps its entry speed: it is the
//! exit speed the block before it has already committed to.

mod junction;
mod trapezoid;

pub use junction::{MoveVector, max_junction_speed};
pub use trapezoid::calculate_trapezoid;

use crate::{
    block::{BlockFlags, BlockProfile, DirectionBits, PlanState},
    block_buffer::{BLOCK_BUFFER_SIZE, BlockBuffer, BufferStatus, Producer},
    kinematics::{
        Axis, Channel, Coord, Kinematics, KinematicsError, MAX_EXTRUDERS, NUM_AXES, Position,
    },
    linear_advance::{self, AdvanceInput},
    motion::StepperStatus,
    settings::{PlannerSettings, SettingsError},
    stepper::{MINIMAL_STEP_RATE, STEPPER_TIMER_RATE},
};
#[allow(unused_imports)]
use num_traits::float::Float;
use thiserror::Error;

/// Moves with fewer steps than this on every motion channel are sized by
/// their extrusion length.
pub const MIN_STEPS_PER_SEGMENT: u32 = 6;

/// Default driver idle timeout.
pub const DEFAULT_IDLE_TIMEOUT_MS: u32 = 120_000;

/// Poll point for the main loop while the planner waits on the engine.
pub trait Idle {
    fn idle(&mut self);
}

impl<F: FnMut()> Idle for F {
    fn idle(&mut self) {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum PlannerError {
    #[error(transparent)]
    Kinematics(#[from] KinematicsError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("extruder {0} is not configured")]
    InvalidExtruder(u8),
    #[error("feedrate {0} must be a positive number")]
    InvalidFeedrate(f32),
    #[error("target position is not finite")]
    NonFiniteTarget,
    #[error("motion is halted by an emergency stop")]
    Halted,
}

pub type Result<T, E = PlannerError> = core::result::Result<T, E>;

/// Snapshot of a queued block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueuedBlock {
    pub plan: PlanState,
    pub profile: BlockProfile,
    pub busy: bool,
}

/// Highest speed from which `distance` can be covered while changing speed
/// by at most `acceleration` to end at `target`.
fn max_allowable_speed(acceleration: f32, target: f32, distance: f32) -> f32 {
    (target * target + 2.0 * acceleration * distance).sqrt()
}

/// Main-loop handle of a [`crate::motion::Motion`].
pub struct Planner<'a, K, const N: usize = BLOCK_BUFFER_SIZE> {
    producer: Producer<'a, N>,
    status: &'a StepperStatus,
    kinematics: K,
    settings: PlannerSettings,
    /// Logical position at the end of the last queued move.
    position: Position,
    /// Absolute step targets at the end of the last queued move.
    steps: [i32; NUM_AXES],
    previous: Option<MoveVector>,
    idle_timeout_ms: u32,
    last_active_ms: Option<u32>,
}

fn check_blob(settings: &PlannerSettings) -> Result<(), SettingsError> {
    settings.validate().inspect_err(|err| {
        tracing::warn!(%err, "rejected planner settings blob");
    })
}

impl<'a, K: Kinematics, const N: usize> Planner<'a, K, N> {
    /// Fails if the settings blob does not validate, e.g. one deserialized
    /// without going through the setters.
    pub fn new(
        producer: Producer<'a, N>,
        status: &'a StepperStatus,
        kinematics: K,
        settings: PlannerSettings,
    ) -> Result<Self, SettingsError> {
        check_blob(&settings)?;
        Ok(Self {
            producer,
            status,
            kinematics,
            settings,
            position: Position::default(),
            steps: [0; NUM_AXES],
            previous: None,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            last_active_ms: None,
        })
    }

    pub fn kinematics(&self) -> &K {
        &self.kinematics
    }

    pub fn settings(&self) -> &PlannerSettings {
        &self.settings
    }

    /// Settings changes only apply to blocks planned afterwards.
    pub fn settings_mut(&mut self) -> &mut PlannerSettings {
        &mut self.settings
    }

    /// Replaces all settings with an externally stored blob. The current
    /// settings are kept if the blob does not validate.
    pub fn load_settings(&mut self, settings: PlannerSettings) -> Result<(), SettingsError> {
        check_blob(&settings)?;
        self.settings = settings;
        Ok(())
    }

    /// Driver idle timeout; zero keeps the drivers on.
    pub fn set_idle_timeout_ms(&mut self, timeout_ms: u32) {
        self.idle_timeout_ms = timeout_ms;
    }

    pub fn buffer_status(&self) -> BufferStatus {
        self.producer.buffer().status()
    }

    pub fn is_full(&self) -> bool {
        self.producer.is_full()
    }

    pub fn is_halted(&self) -> bool {
        self.producer.is_halted()
    }

    /// Logical position at the end of the last queued move.
    pub fn position(&self) -> Position {
        self.position
    }

    /// Steps the engine has actually emitted on a channel.
    pub fn stepper_position(&self, channel: Channel) -> i32 {
        self.status.position(channel)
    }

    pub fn status(&self) -> &StepperStatus {
        self.status
    }

    /// Queued block `offset` places after the oldest one.
    pub fn peek(&self, offset: usize) -> Option<QueuedBlock> {
        let buffer = self.producer.buffer();
        if offset >= buffer.len() {
            return None;
        }
        let index = buffer.tail().wrapping_add(offset);
        Some(QueuedBlock {
            plan: *self.producer.plan(index),
            profile: self.producer.profile(index),
            busy: self.producer.is_busy(index),
        })
    }

    fn step_targets(&self, channels: Coord, e: f32) -> [i32; NUM_AXES] {
        let s = &self.settings;
        [
            (channels.x * s.steps_per_unit(Axis::X)).round() as i32,
            (channels.y * s.steps_per_unit(Axis::Y)).round() as i32,
            (channels.z * s.steps_per_unit(Axis::Z)).round() as i32,
            (e * s.steps_per_unit(Axis::E)).round() as i32,
        ]
    }

    fn wait_for_space<I: Idle + ?Sized>(&mut self, idle: &mut I) -> Result<()> {
        while self.producer.is_full() {
            idle.idle();
            if self.producer.is_halted() {
                return Err(PlannerError::Halted);
            }
        }
        Ok(())
    }

    /// Queues a straight move to `target` at `feedrate` (units/s).
    ///
    /// Blocks, calling `idle` in a loop, while the queue is full. Moves too
    /// short to produce a step are dropped; their distance carries into
    /// the next move.
    pub fn buffer_line<I: Idle + ?Sized>(
        &mut self,
        target: Position,
        feedrate: f32,
        extruder: u8,
        idle: &mut I,
    ) -> Result<()> {
        if self.producer.is_halted() {
            return Err(PlannerError::Halted);
        }
        if extruder >= self.settings.extruders() || extruder as usize >= MAX_EXTRUDERS {
            return Err(PlannerError::InvalidExtruder(extruder));
        }
        if !(feedrate.is_finite() && feedrate > 0.0) {
            return Err(PlannerError::InvalidFeedrate(feedrate));
        }
        if !target.is_finite() {
            return Err(PlannerError::NonFiniteTarget);
        }

        let channels = self.kinematics.inverse(target.xyz()).inspect_err(|err| {
            tracing::warn!(%err, "move rejected");
        })?;
        let target_steps = self.step_targets(channels, target.e);

        let mut delta_steps = [0i32; NUM_AXES];
        for (delta, (target, current)) in delta_steps
            .iter_mut()
            .zip(target_steps.iter().zip(&self.steps))
        {
            *delta = target.wrapping_sub(*current);
        }

        let mut de = target.e - self.position.e;
        let skip_extrusion = de.abs() > self.settings.max_extrude_length();
        if skip_extrusion {
            tracing::warn!(
                length = de.abs(),
                max = self.settings.max_extrude_length(),
                "extrusion too long, skipping it"
            );
            delta_steps[Axis::E.index()] = 0;
            de = 0.0;
        }

        let step_counts = delta_steps.map(i32::unsigned_abs);
        let step_event_count = step_counts.iter().copied().max().unwrap_or(0);
        if step_event_count == 0 {
            if skip_extrusion {
                // the skipped extrusion still counts as done
                self.steps[Axis::E.index()] = target_steps[Axis::E.index()];
                self.position.e = target.e;
            }
            return Ok(());
        }

        self.wait_for_space(idle)?;

        let settings = &self.settings;
        let deltas = [
            target.x - self.position.x,
            target.y - self.position.y,
            target.z - self.position.z,
            de,
        ];
        let travel = (deltas[0] * deltas[0] + deltas[1] * deltas[1] + deltas[2] * deltas[2]).sqrt();
        let small_motion = step_counts[..3].iter().all(|&s| s < MIN_STEPS_PER_SEGMENT);
        let mut millimeters = if small_motion && de != 0.0 {
            de.abs()
        } else {
            travel
        };
        if millimeters <= f32::EPSILON {
            // motion in step space only, e.g. rounding on a delta tower
            millimeters = Axis::ALL
                .into_iter()
                .map(|axis| {
                    let d = step_counts[axis.index()] as f32 / settings.steps_per_unit(axis);
                    d * d
                })
                .sum::<f32>()
                .sqrt();
        }
        let inverse_millimeters = 1.0 / millimeters;

        let e_steps = step_counts[Axis::E.index()];
        let extruder_only = step_counts[..3].iter().all(|&s| s == 0);
        let floor = if e_steps > 0 {
            settings.min_feedrate()
        } else {
            settings.min_travel_feedrate()
        };
        let feedrate = feedrate.max(floor);

        let mut inverse_secs = feedrate * inverse_millimeters;
        let queued = self.producer.len();
        if queued > 1 && queued < N / 2 {
            let segment_time_us = (1_000_000.0 / inverse_secs).round() as u32;
            let min_segment_time_us = settings.min_segment_time_us();
            if segment_time_us < min_segment_time_us {
                let slowed = segment_time_us
                    + (2 * (min_segment_time_us - segment_time_us)) / queued as u32;
                inverse_secs = 1_000_000.0 / slowed as f32;
            }
        }

        let mut nominal_speed = millimeters * inverse_secs;
        let mut nominal_rate = (step_event_count as f32 * inverse_secs).ceil();

        let mut speed_factor = 1.0f32;
        for axis in Axis::ALL {
            let speed = (deltas[axis.index()] * inverse_secs).abs();
            let max = settings.max_feedrate(axis);
            if speed > max {
                speed_factor = speed_factor.min(max / speed);
            }
        }
        if speed_factor < 1.0 {
            nominal_speed *= speed_factor;
            nominal_rate *= speed_factor;
        }
        let nominal_rate = (nominal_rate as u32).max(MINIMAL_STEP_RATE);

        let steps_per_mm = step_event_count as f32 * inverse_millimeters;
        let acceleration = if extruder_only {
            settings.retract_acceleration()
        } else if e_steps == 0 {
            settings.travel_acceleration()
        } else {
            settings.acceleration()
        };
        let mut accel_steps = (acceleration * steps_per_mm).ceil();

        let advance = if extruder_only {
            None
        } else {
            linear_advance::plan(AdvanceInput {
                k: settings.linear_advance_k(),
                e_steps,
                step_event_count,
                de,
                travel,
                steps_per_mm,
                max_jerk_e: settings.max_jerk(Axis::E),
            })
        };
        if let Some(advance) = &advance {
            accel_steps = accel_steps.min(advance.max_acceleration_steps);
        }

        for axis in Axis::ALL {
            let steps = step_counts[axis.index()] as f32;
            if steps == 0.0 {
                continue;
            }
            let max = settings.max_acceleration_steps(axis);
            if accel_steps * steps > max * step_event_count as f32 {
                accel_steps = max * step_event_count as f32 / steps;
            }
        }
        let accel_steps = (accel_steps as u32).max(1);
        let acceleration = accel_steps as f32 / steps_per_mm;
        let acceleration_rate = (((accel_steps as u64) << 24) / STEPPER_TIMER_RATE as u64) as u32;

        let mut direction = DirectionBits::new();
        for (axis, delta) in delta_steps.iter().enumerate() {
            if *delta < 0 {
                direction = direction.with_reverse(axis);
            }
        }

        let vector = MoveVector::new(deltas, millimeters, nominal_speed, settings);
        let at_rest = self.producer.is_empty();
        let previous = if at_rest {
            None
        } else {
            self.previous.as_ref()
        };
        let max_entry_speed = max_junction_speed(previous, &vector, acceleration, settings);
        let v_allowable = max_allowable_speed(acceleration, 0.0, millimeters);
        // a block queued behind others starts from the exit its
        // predecessor has committed to; look-ahead raises it later
        let entry_speed = if at_rest {
            max_entry_speed.min(v_allowable)
        } else {
            0.0
        };

        let mut flags = BlockFlags::new().with_recalculate();
        if nominal_speed <= v_allowable {
            flags = flags.with_nominal_length();
        }
        let plan = PlanState {
            nominal_speed,
            entry_speed,
            max_entry_speed,
            millimeters,
            acceleration,
            flags,
        };
        let mut profile = BlockProfile {
            steps: step_counts,
            direction,
            extruder,
            step_event_count,
            nominal_rate,
            acceleration_steps_per_s2: accel_steps,
            acceleration_rate,
            advance_scale: advance.map_or(0, |advance| advance.scale),
            ..BlockProfile::EMPTY
        };
        calculate_trapezoid(&mut profile, nominal_speed, entry_speed, 0.0);

        let mut block = (plan, profile);
        while let Err(rejected) = self.producer.push(block.0, block.1) {
            block = rejected;
            self.wait_for_space(idle)?;
        }

        tracing::debug!(
            steps = step_event_count,
            millimeters,
            nominal_speed,
            max_entry_speed,
            "queued block"
        );

        self.previous = Some(vector);
        self.steps = target_steps;
        self.position = target;
        self.status.request_drivers(true);
        self.recalculate();
        Ok(())
    }

    /// Re-runs the look-ahead over every block the engine has not started.
    pub fn recalculate(&mut self) {
        let window = self.producer.claim_window();
        if window.is_empty() {
            return;
        }
        let first = window.first;
        let head = window.head;

        // reverse pass
        let mut next_entry = 0.0f32;
        let mut index = BlockBuffer::<N>::prev_index(head);
        while index != first {
            let plan = self.producer.plan_mut(index);
            let entry = if plan.flags.nominal_length() {
                plan.max_entry_speed
            } else {
                plan.max_entry_speed.min(max_allowable_speed(
                    plan.acceleration,
                    next_entry,
                    plan.millimeters,
                ))
            };
            if plan.entry_speed != entry {
                plan.entry_speed = entry;
                plan.flags.set_recalculate(true);
            }
            next_entry = entry;
            index = BlockBuffer::<N>::prev_index(index);
        }

        // forward pass
        let mut previous = *self.producer.plan(first);
        let mut index = BlockBuffer::<N>::next_index(first);
        while index != head {
            let plan = self.producer.plan_mut(index);
            if !previous.flags.nominal_length() && previous.entry_speed < plan.entry_speed {
                let reachable = max_allowable_speed(
                    previous.acceleration,
                    previous.entry_speed,
                    previous.millimeters,
                );
                if reachable < plan.entry_speed {
                    plan.entry_speed = reachable;
                    plan.flags.set_recalculate(true);
                }
            }
            previous = *plan;
            index = BlockBuffer::<N>::next_index(index);
        }

        // trapezoids, releasing each block as soon as it is final
        let mut index = first;
        while index != head {
            let next = BlockBuffer::<N>::next_index(index);
            let (exit_speed, next_changed) = if next == head {
                (0.0, true)
            } else {
                let next = self.producer.plan(next);
                (next.entry_speed, next.flags.recalculate())
            };
            let plan = *self.producer.plan(index);
            if plan.flags.recalculate() || next_changed {
                let mut profile = self.producer.profile(index);
                calculate_trapezoid(&mut profile, plan.nominal_speed, plan.entry_speed, exit_speed);
                self.producer.plan_mut(index).flags.set_recalculate(false);
                self.producer.write_profile(index, Some(&profile));
            } else {
                self.producer.write_profile(index, None);
            }
            index = next;
        }
    }

    /// Waits until every queued block has been executed.
    pub fn synchronize<I: Idle + ?Sized>(&mut self, idle: &mut I) {
        while !(self.producer.is_empty() && self.status.is_idle()) {
            if self.producer.is_halted() {
                break;
            }
            idle.idle();
        }
    }

    /// Declares the current logical position, e.g. after homing. Call with
    /// the queue drained; the next move starts from rest.
    pub fn set_position(&mut self, position: Position) -> Result<()> {
        if !position.is_finite() {
            return Err(PlannerError::NonFiniteTarget);
        }
        let channels = self.kinematics.inverse(position.xyz())?;
        let steps = self.step_targets(channels, position.e);
        let extruders = self.settings.extruders();
        let status = self.status;
        critical_section::with(|_| {
            for (axis, &steps) in steps.iter().enumerate().take(3) {
                status.set_position(Channel::for_axis(axis, 0), steps);
            }
            for extruder in 0..extruders {
                status.set_position(Channel::E(extruder), steps[Axis::E.index()]);
            }
        });
        self.steps = steps;
        self.position = position;
        self.previous = None;
        Ok(())
    }

    /// Drops every queued block and halts the engine until
    /// [`Planner::power_on`]. The logical position is left at the last
    /// queued target; re-home and [`Planner::set_position`] before moving.
    pub fn emergency_stop(&mut self) {
        self.producer.reset();
        self.status.request_drivers(false);
        self.previous = None;
        tracing::warn!("emergency stop, motion queue flushed");
    }

    /// Leaves the emergency-stopped state with an empty queue.
    pub fn power_on(&mut self) {
        if self.producer.is_halted() {
            // a halt from the engine side leaves its blocks queued
            self.producer.reset();
            self.previous = None;
            self.producer.resume();
            tracing::info!("motion powered on");
        }
    }

    /// Releases the drivers once nothing has moved for the idle timeout.
    pub fn manage_inactivity(&mut self, now_ms: u32) {
        let busy = !self.producer.is_empty() || !self.status.is_idle();
        let last_active = *self.last_active_ms.get_or_insert(now_ms);
        if busy {
            self.last_active_ms = Some(now_ms);
            return;
        }
        if self.idle_timeout_ms == 0 || !self.status.drivers_enabled() {
            return;
        }
        if now_ms.wrapping_sub(last_active) >= self.idle_timeout_ms {
            self.status.request_drivers(false);
            tracing::info!(idle_ms = now_ms.wrapping_sub(last_active), "drivers disabled");
        }
    }
}
