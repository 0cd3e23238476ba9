//! Stepper execution engine.
//!
//! [`Stepper::isr`] is the body of a variable-frequency timer interrupt.
//! Each call executes whatever is due (a Bresenham step event of the
//! current block, delayed input-shaping impulses, pending linear-advance
//! steps) and returns the number of timer ticks until it must run again.
//! Everything here is integer arithmetic on a private copy of the block
//! profile; the planner is never waited on.

use crate::{
    block::BlockProfile,
    block_buffer::{BLOCK_BUFFER_SIZE, Consumer, Fetch},
    kinematics::{Channel, NUM_AXES, NUM_CHANNELS},
    linear_advance::{self, Advance},
    motion::StepperStatus,
    shaper::{ShapedChannel, ShaperConfig, ShaperError},
};
use serde::{Deserialize, Serialize};

/// Frequency of the step timer, in Hz.
pub const STEPPER_TIMER_RATE: u32 = 2_000_000;

/// Slowest rate a block ever runs at, in steps/s.
pub const MINIMAL_STEP_RATE: u32 = 120;

/// Above this step rate two step events run per interrupt.
pub const MAX_STEP_ISR_FREQUENCY_1X: u32 = 40_000;
/// Above this step rate four step events run per interrupt.
pub const MAX_STEP_ISR_FREQUENCY_2X: u32 = 80_000;

/// Poll interval while the queue is empty (1 kHz).
pub const IDLE_INTERVAL: u32 = STEPPER_TIMER_RATE / 1_000;
/// Poll interval while the next block is being replanned (50 µs).
pub const RETRY_INTERVAL: u32 = STEPPER_TIMER_RATE / 20_000;
/// Pacing of extruder catch-up steps between step events.
pub const DRAIN_INTERVAL: u32 = STEPPER_TIMER_RATE / 20_000;
/// Shortest interval the engine ever asks for.
pub const MIN_ISR_INTERVAL: u32 = STEPPER_TIMER_RATE / MAX_STEP_ISR_FREQUENCY_2X;

/// Number of motion channels that can be shaped (A, B, C).
const SHAPED_CHANNELS: usize = 3;

/// Execution phase of the current block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle,
    Accelerating,
    Cruising,
    Decelerating,
    Finished,
}

impl Phase {
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Accelerating,
            2 => Phase::Cruising,
            3 => Phase::Decelerating,
            4 => Phase::Finished,
            _ => Phase::Idle,
        }
    }
}

/// Driver timing requirements, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseTiming {
    pub min_pulse_width_ns: u32,
    /// Settle time after a direction change before the next step edge.
    pub dir_setup_ns: u32,
    /// Hold time after the last step edge before a direction change.
    pub dir_hold_ns: u32,
}

impl Default for PulseTiming {
    fn default() -> Self {
        Self {
            min_pulse_width_ns: 2_000,
            dir_setup_ns: 650,
            dir_hold_ns: 650,
        }
    }
}

/// Step/direction outputs of the board.
pub trait StepperHal {
    fn set_direction(&mut self, channel: Channel, forward: bool);
    fn step_high(&mut self, channel: Channel);
    fn step_low(&mut self, channel: Channel);
    /// Busy-waits for at least `ns` nanoseconds.
    fn delay_ns(&mut self, ns: u32);
    fn set_enabled(&mut self, enabled: bool);
}

impl<H: StepperHal + ?Sized> StepperHal for &mut H {
    fn set_direction(&mut self, channel: Channel, forward: bool) {
        (**self).set_direction(channel, forward)
    }

    fn step_high(&mut self, channel: Channel) {
        (**self).step_high(channel)
    }

    fn step_low(&mut self, channel: Channel) {
        (**self).step_low(channel)
    }

    fn delay_ns(&mut self, ns: u32) {
        (**self).delay_ns(ns)
    }

    fn set_enabled(&mut self, enabled: bool) {
        (**self).set_enabled(enabled)
    }
}

/// Timer interval and step events per interrupt for a step rate.
pub fn calc_timer_interval(rate: u32) -> (u32, u32) {
    let (rate, loops) = if rate > MAX_STEP_ISR_FREQUENCY_2X {
        (rate >> 2, 4)
    } else if rate > MAX_STEP_ISR_FREQUENCY_1X {
        (rate >> 1, 2)
    } else {
        (rate, 1)
    };
    (STEPPER_TIMER_RATE / rate.max(MINIMAL_STEP_RATE), loops)
}

/// Pulses raised together in one step/dir cycle; at most one per channel.
struct Pulses {
    pulses: [(Channel, bool); NUM_CHANNELS],
    len: usize,
}

impl Pulses {
    const fn new() -> Self {
        Self {
            pulses: [(Channel::A, true); NUM_CHANNELS],
            len: 0,
        }
    }

    fn push(&mut self, channel: Channel, forward: bool) {
        debug_assert!(self.len < NUM_CHANNELS);
        self.pulses[self.len] = (channel, forward);
        self.len += 1;
    }

    fn as_slice(&self) -> &[(Channel, bool)] {
        &self.pulses[..self.len]
    }
}

/// Runtime state of the block being executed.
#[derive(Debug, Clone, Copy)]
struct ActiveBlock {
    profile: BlockProfile,
    counters: [i32; NUM_AXES],
    completed: u32,
    acceleration_time: u32,
    deceleration_time: u32,
    acc_step_rate: u32,
    step_loops: u32,
}

impl ActiveBlock {
    fn new(profile: BlockProfile) -> Self {
        let start = -((profile.step_event_count >> 1) as i32);
        Self {
            profile,
            counters: [start; NUM_AXES],
            completed: 0,
            acceleration_time: 0,
            deceleration_time: 0,
            acc_step_rate: profile.initial_rate,
            step_loops: 1,
        }
    }

    fn is_exhausted(&self) -> bool {
        self.completed >= self.profile.step_event_count
    }

    /// Rate for the step events to come, and the phase it belongs to.
    fn step_rate(&mut self) -> (Phase, u32) {
        let p = &self.profile;
        if self.completed <= p.accelerate_until {
            let gain = mul_rate(self.acceleration_time, p.acceleration_rate);
            let rate = p.initial_rate.saturating_add(gain).min(p.nominal_rate);
            self.acc_step_rate = rate;
            (Phase::Accelerating, rate)
        } else if self.completed > p.decelerate_after {
            let loss = mul_rate(self.deceleration_time, p.acceleration_rate);
            let rate = if loss < self.acc_step_rate {
                (self.acc_step_rate - loss).max(p.final_rate)
            } else {
                p.final_rate
            };
            (Phase::Decelerating, rate)
        } else {
            self.acc_step_rate = p.nominal_rate;
            (Phase::Cruising, p.nominal_rate)
        }
    }
}

/// `(ticks · rate) >> 24` with a 64-bit intermediate.
fn mul_rate(ticks: u32, rate: u32) -> u32 {
    let product = (ticks as u64 * rate as u64) >> 24;
    product.min(u32::MAX as u64) as u32
}

enum Load {
    Loaded,
    Pending,
    Empty,
}

/// Interrupt-side handle of a [`crate::motion::Motion`].
pub struct Stepper<'a, H, const N: usize = BLOCK_BUFFER_SIZE> {
    consumer: Consumer<'a, N>,
    status: &'a StepperStatus,
    hal: H,
    timing: PulseTiming,
    /// Timer ticks since the engine started, wrapping.
    now: u32,
    last_interval: u32,
    /// Ticks until the next step event; negative when late.
    countdown: i32,
    block: Option<ActiveBlock>,
    shapers: [Option<ShapedChannel>; SHAPED_CHANNELS],
    advance: Advance,
    directions: [Option<bool>; NUM_CHANNELS],
    drivers_enabled: bool,
}

impl<'a, H: StepperHal, const N: usize> Stepper<'a, H, N> {
    pub fn new(
        consumer: Consumer<'a, N>,
        status: &'a StepperStatus,
        hal: H,
        timing: PulseTiming,
    ) -> Self {
        Self {
            consumer,
            status,
            hal,
            timing,
            now: 0,
            last_interval: 0,
            countdown: 0,
            block: None,
            shapers: [const { None }; SHAPED_CHANNELS],
            advance: Advance::new(),
            directions: [None; NUM_CHANNELS],
            drivers_enabled: false,
        }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn timing(&self) -> PulseTiming {
        self.timing
    }

    /// Timer ticks elapsed up to the current interrupt.
    pub fn elapsed_ticks(&self) -> u32 {
        self.now
    }

    pub fn phase(&self) -> Phase {
        self.status.phase()
    }

    /// Nothing queued, executing or still owed on any channel.
    pub fn is_idle(&self) -> bool {
        self.status.is_idle() && self.consumer.is_empty()
    }

    /// Shaper echoes that had to be applied early.
    pub fn shaper_overflows(&self) -> u32 {
        self.shapers.iter().flatten().map(ShapedChannel::overflows).sum()
    }

    /// Installs or removes the input shaper of a motion channel. Only
    /// allowed while the engine is idle so no delayed impulse is dropped.
    pub fn set_shaper(
        &mut self,
        channel: Channel,
        config: Option<&ShaperConfig>,
    ) -> Result<(), ShaperError> {
        let index = channel.index();
        if index >= SHAPED_CHANNELS {
            return Err(ShaperError::ExtruderChannel);
        }
        if !self.status.is_idle() {
            return Err(ShaperError::Busy);
        }
        self.shapers[index] = match config {
            Some(config) => Some(ShapedChannel::new(config, STEPPER_TIMER_RATE)?),
            None => None,
        };
        Ok(())
    }

    /// Stops all motion from interrupt context, e.g. on a kill pin or an
    /// unexpected endstop hit. The planner sees the machine as
    /// emergency-stopped and flushes the queue on [`Planner::power_on`].
    ///
    /// [`Planner::power_on`]: crate::planner::Planner::power_on
    pub fn emergency_stop(&mut self) {
        self.consumer.halt();
        self.status.request_drivers(false);
        self.abort();
        self.apply_driver_request();
    }

    /// Interrupt body. Returns the ticks until the next call.
    pub fn isr(&mut self) -> u32 {
        let elapsed = self.last_interval;
        self.now = self.now.wrapping_add(elapsed);
        self.apply_driver_request();

        if self.consumer.is_halted() || self.consumer.is_stale() {
            self.abort();
            self.last_interval = IDLE_INTERVAL;
            return IDLE_INTERVAL;
        }

        self.countdown = self.countdown.saturating_sub(elapsed as i32);
        let mut next = None;
        if self.countdown <= 0 {
            let load = match self.block {
                Some(_) => Load::Loaded,
                None => self.load(),
            };
            match load {
                Load::Loaded => {
                    let interval = self.step_event();
                    self.countdown = (self.countdown + interval as i32).max(0);
                }
                Load::Pending => {
                    self.countdown = 0;
                    next = Some(RETRY_INTERVAL);
                }
                Load::Empty => {
                    self.countdown = 0;
                    self.advance.retarget(0, 0);
                    next = Some(IDLE_INTERVAL);
                    self.status.set_phase(Phase::Idle);
                }
            }
        }

        self.service_shapers();
        self.drain_advance();

        let mut next = match next {
            Some(next) => next,
            None if self.countdown > 0 => self.countdown as u32,
            None => MIN_ISR_INTERVAL,
        };
        for shaper in self.shapers.iter().flatten() {
            if let Some(due) = shaper.next_due(self.now) {
                next = next.min(due);
            }
        }
        if self.advance.pending() != 0 {
            next = next.min(DRAIN_INTERVAL);
        }

        let idle = self.block.is_none()
            && self.countdown == 0
            && self.advance.is_settled()
            && self.shapers.iter().flatten().all(ShapedChannel::is_idle);
        self.status.set_idle(idle);

        let next = next.max(MIN_ISR_INTERVAL);
        self.last_interval = next;
        next
    }

    fn apply_driver_request(&mut self) {
        let requested = self.status.drivers_enabled();
        if requested != self.drivers_enabled {
            self.hal.set_enabled(requested);
            self.drivers_enabled = requested;
        }
    }

    /// Drops everything in flight after an emergency reset.
    fn abort(&mut self) {
        self.block = None;
        self.consumer.abandon();
        for shaper in self.shapers.iter_mut().flatten() {
            shaper.clear();
        }
        self.advance.clear();
        self.countdown = 0;
        self.status.set_phase(Phase::Idle);
        self.status.set_idle(true);
    }

    fn load(&mut self) -> Load {
        match self.consumer.begin() {
            Fetch::Block(profile) => {
                self.block = Some(ActiveBlock::new(profile));
                self.status.set_idle(false);
                Load::Loaded
            }
            Fetch::Pending => Load::Pending,
            Fetch::Empty => Load::Empty,
        }
    }

    /// Runs the due step events of the current block and returns the
    /// interval until the next ones.
    fn step_event(&mut self) -> u32 {
        let Some(mut active) = self.block.take() else {
            return IDLE_INTERVAL;
        };
        let profile = active.profile;
        let direct_e = !profile.uses_advance() && self.advance.is_settled();

        for _ in 0..active.step_loops {
            if active.is_exhausted() {
                break;
            }
            let mut pulses = Pulses::new();
            for axis in 0..NUM_AXES {
                let counter = &mut active.counters[axis];
                *counter += profile.steps[axis] as i32;
                if *counter <= 0 {
                    continue;
                }
                *counter -= profile.step_event_count as i32;

                let forward = profile.direction.is_forward(axis);
                let channel = Channel::for_axis(axis, profile.extruder);
                if let Some(shaper) = self.shapers.get_mut(axis).and_then(Option::as_mut) {
                    shaper.push(self.now, forward);
                } else if axis == NUM_AXES - 1 && !direct_e {
                    self.advance.push_step(forward, profile.extruder);
                } else {
                    pulses.push(channel, forward);
                }
            }
            self.emit(pulses.as_slice());
            active.completed += 1;
        }

        if active.is_exhausted() {
            self.consumer.finish();
            self.status.block_executed();
            self.status.set_phase(Phase::Finished);
            return calc_timer_interval(profile.final_rate).0;
        }

        let (phase, rate) = active.step_rate();
        let (interval, loops) = calc_timer_interval(rate);
        active.step_loops = loops;
        match phase {
            Phase::Accelerating => {
                active.acceleration_time = active.acceleration_time.saturating_add(interval)
            }
            Phase::Decelerating => {
                active.deceleration_time = active.deceleration_time.saturating_add(interval)
            }
            _ => {}
        }
        self.advance.retarget(rate, profile.advance_scale);
        self.status.set_phase(phase);
        self.block = Some(active);
        interval
    }

    /// Applies due echoes and emits the steps they produce.
    fn service_shapers(&mut self) {
        let now = self.now;
        for shaper in self.shapers.iter_mut().flatten() {
            shaper.service(now);
        }
        loop {
            let mut pulses = Pulses::new();
            for (axis, shaper) in self.shapers.iter_mut().enumerate() {
                if let Some(forward) = shaper.as_mut().and_then(ShapedChannel::take_step) {
                    pulses.push(Channel::for_axis(axis, 0), forward);
                }
            }
            if pulses.len == 0 {
                break;
            }
            self.emit(pulses.as_slice());
        }
    }

    fn drain_advance(&mut self) {
        for _ in 0..linear_advance::MAX_STEPS_PER_TICK {
            let Some((extruder, forward)) = self.advance.take() else {
                break;
            };
            let mut pulses = Pulses::new();
            pulses.push(Channel::E(extruder), forward);
            self.emit(pulses.as_slice());
        }
    }

    /// One step/dir cycle for a set of channels.
    fn emit(&mut self, pulses: &[(Channel, bool)]) {
        if pulses.is_empty() {
            return;
        }
        let turning = pulses
            .iter()
            .any(|&(channel, forward)| self.directions[channel.index()] != Some(forward));
        if turning {
            self.hal.delay_ns(self.timing.dir_hold_ns);
            for &(channel, forward) in pulses {
                let current = &mut self.directions[channel.index()];
                if *current != Some(forward) {
                    self.hal.set_direction(channel, forward);
                    *current = Some(forward);
                }
            }
            self.hal.delay_ns(self.timing.dir_setup_ns);
        }
        for &(channel, _) in pulses {
            self.hal.step_high(channel);
        }
        self.hal.delay_ns(self.timing.min_pulse_width_ns);
        for &(channel, forward) in pulses {
            self.hal.step_low(channel);
            self.status.step(channel, forward);
        }
    }
}
