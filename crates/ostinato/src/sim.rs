//! Deterministic host-side run of the planner and stepper engine.
//!
//! The planner runs on the calling thread. Whenever it has to wait, its
//! idle hook fires the stepper interrupt once and advances a virtual clock
//! by the interval the interrupt asked for, so a job runs exactly as it
//! would against a hardware timer, only faster.

use crate::{
    config::Config,
    job::{DEFAULT_FEEDRATE, Job},
};
use anyhow::{Context, Result};
use ostinato_core::{
    Channel, Idle, Motion, PlannerError, Position, Stepper, StepperHal,
    block_buffer::BLOCK_BUFFER_SIZE,
    kinematics::NUM_CHANNELS,
    stepper::STEPPER_TIMER_RATE,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// Step/dir sink that counts pulses per channel.
#[derive(Debug)]
pub struct CountingHal {
    forward: [bool; NUM_CHANNELS],
    pulses: [u64; NUM_CHANNELS],
    positions: [i64; NUM_CHANNELS],
    direction_changes: [u64; NUM_CHANNELS],
    enabled: bool,
    pulse_ns: u64,
}

impl Default for CountingHal {
    fn default() -> Self {
        Self {
            forward: [true; NUM_CHANNELS],
            pulses: [0; NUM_CHANNELS],
            positions: [0; NUM_CHANNELS],
            direction_changes: [0; NUM_CHANNELS],
            enabled: false,
            pulse_ns: 0,
        }
    }
}

impl StepperHal for CountingHal {
    fn set_direction(&mut self, channel: Channel, forward: bool) {
        let i = channel.index();
        if self.forward[i] != forward {
            self.direction_changes[i] += 1;
        }
        self.forward[i] = forward;
    }

    fn step_high(&mut self, _channel: Channel) {}

    fn step_low(&mut self, channel: Channel) {
        let i = channel.index();
        self.pulses[i] += 1;
        self.positions[i] += if self.forward[i] { 1 } else { -1 };
    }

    fn delay_ns(&mut self, ns: u32) {
        self.pulse_ns += ns as u64;
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// Fires the stepper interrupt whenever the planner waits.
struct VirtualTimer<'s, 'a> {
    stepper: &'s mut Stepper<'a, CountingHal, BLOCK_BUFFER_SIZE>,
    ticks: u64,
    interrupts: u64,
}

impl Idle for VirtualTimer<'_, '_> {
    fn idle(&mut self) {
        self.ticks += self.stepper.isr() as u64;
        self.interrupts += 1;
    }
}

impl VirtualTimer<'_, '_> {
    fn millis(&self) -> u32 {
        (self.ticks * 1_000 / STEPPER_TIMER_RATE as u64) as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReport {
    pub pulses: u64,
    pub position: i64,
    pub direction_changes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    pub kinematics: &'static str,
    pub moves: usize,
    /// Moves rejected by the kinematics.
    pub rejected: usize,
    pub blocks: u32,
    pub duration_s: f64,
    pub interrupts: u64,
    pub final_position: Position,
    pub channels: BTreeMap<String, ChannelReport>,
    pub shaper_overflows: u32,
    pub drivers_enabled: bool,
}

fn channel_name(channel: Channel) -> String {
    match channel {
        Channel::A => "a".to_string(),
        Channel::B => "b".to_string(),
        Channel::C => "c".to_string(),
        Channel::E(n) => format!("e{n}"),
    }
}

/// Runs a job to completion and reports what the engine emitted.
pub fn simulate(config: &Config, job: &Job) -> Result<SimulationReport> {
    config.validate()?;

    let mut motion = Motion::<BLOCK_BUFFER_SIZE>::new();
    let (mut planner, mut stepper) = motion
        .split(
            config.kinematics,
            config.planner.clone(),
            CountingHal::default(),
            config.stepper.timing,
        )
        .context("invalid planner settings")?;
    planner.set_idle_timeout_ms(config.stepper.idle_timeout_ms);
    // jobs start homed at the origin
    planner
        .set_position(Position::default())
        .context("origin is not reachable")?;
    for (channel, shaper) in config.shaping.channels() {
        stepper
            .set_shaper(channel, Some(shaper))
            .with_context(|| format!("failed to install shaper on {channel:?}"))?;
    }

    let mut timer = VirtualTimer {
        stepper: &mut stepper,
        ticks: 0,
        interrupts: 0,
    };

    let mut target = planner.position();
    let mut feedrate = DEFAULT_FEEDRATE;
    let mut rejected = 0;
    for (index, step) in job.moves.iter().enumerate() {
        let previous = target;
        target.x = step.x.unwrap_or(target.x);
        target.y = step.y.unwrap_or(target.y);
        target.z = step.z.unwrap_or(target.z);
        target.e = step.e.unwrap_or(target.e);
        feedrate = step.feedrate.unwrap_or(feedrate);

        match planner.buffer_line(target, feedrate / 60.0, step.extruder, &mut timer) {
            Ok(()) => {}
            Err(PlannerError::Kinematics(err)) => {
                tracing::warn!(index, %err, "skipping unreachable move");
                target = previous;
                rejected += 1;
            }
            Err(err) => return Err(err).with_context(|| format!("move {index} failed")),
        }
        planner.manage_inactivity(timer.millis());
    }

    planner.synchronize(&mut timer);
    planner.manage_inactivity(timer.millis());
    // let the engine apply the final driver request
    timer.idle();

    let ticks = timer.ticks;
    let interrupts = timer.interrupts;
    let hal = stepper.hal();
    let extruders = config.planner.extruders();
    let channels = [Channel::A, Channel::B, Channel::C]
        .into_iter()
        .chain((0..extruders).map(Channel::E))
        .map(|channel| {
            let i = channel.index();
            let report = ChannelReport {
                pulses: hal.pulses[i],
                position: hal.positions[i],
                direction_changes: hal.direction_changes[i],
            };
            (channel_name(channel), report)
        })
        .collect();

    let report = SimulationReport {
        kinematics: config.kinematics.name(),
        moves: job.moves.len(),
        rejected,
        blocks: planner.status().blocks_executed(),
        duration_s: ticks as f64 / STEPPER_TIMER_RATE as f64,
        interrupts,
        final_position: planner.position(),
        channels,
        shaper_overflows: stepper.shaper_overflows(),
        drivers_enabled: hal.enabled,
    };
    tracing::info!(
        blocks = report.blocks,
        duration_s = report.duration_s,
        "simulation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Move;

    fn line(x: f32, y: f32) -> Move {
        Move {
            x: Some(x),
            y: Some(y),
            ..Move::default()
        }
    }

    #[test]
    fn test_square_returns_home() {
        let job = Job {
            moves: vec![line(20.0, 0.0), line(20.0, 20.0), line(0.0, 20.0), line(0.0, 0.0)],
        };
        let report = simulate(&Config::default(), &job).unwrap();
        assert_eq!(report.blocks, 4);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.channels["a"].position, 0);
        assert_eq!(report.channels["a"].pulses, 3_200);
        assert_eq!(report.channels["b"].pulses, 3_200);
        assert!(report.duration_s > 1.6);
    }

    #[test]
    fn test_unreachable_moves_are_skipped() {
        let config = Config::from_toml(
            "[kinematics]\ntype = \"delta\"\ndiagonal_rod = 250.0\nradius = 120.0\nprintable_radius = 100.0\n",
        )
        .unwrap();
        let job = Job {
            moves: vec![line(10.0, 0.0), line(200.0, 0.0), line(0.0, 10.0)],
        };
        let report = simulate(&config, &job).unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.blocks, 2);
        assert_eq!(report.final_position, Position::new(0.0, 10.0, 0.0, 0.0));
    }

    #[test]
    fn test_idle_timeout_releases_drivers() {
        let mut config = Config::default();
        config.stepper.idle_timeout_ms = 1;
        let job = Job {
            moves: vec![line(1.0, 0.0)],
        };
        let report = simulate(&config, &job).unwrap();
        assert!(!report.drivers_enabled);

        config.stepper.idle_timeout_ms = 0;
        let report = simulate(&config, &job).unwrap();
        assert!(report.drivers_enabled);
    }
}
