//! Input shaping on a stepper channel.
//!
//! A shaper replaces every planned step with a short train of impulses
//! whose amplitudes sum to one and whose spacing cancels a resonance at
//! the configured frequency. The first impulse is applied immediately and
//! the rest are parked in fixed-capacity delay rings until they fall due.
//! Echoes falling into the same slice of a ring's delay (1/126th of it) are
//! merged into one entry, so a ring covers its whole delay at any step rate.
//! A physical pulse is emitted whenever the shaped position drifts half a
//! step away from the emitted position, so steps are only ever shifted in
//! time, never gained or lost.

#[allow(unused_imports)]
use num_traits::float::Float;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_IMPULSES: usize = 3;

/// Delayed impulses that can be outstanding per impulse index.
pub const ECHO_CAPACITY: usize = 128;

/// Narrowest echo slice, in timer ticks.
const MIN_SLICE_TICKS: u32 = 16;

const ONE: i32 = 1 << 16;
const HALF: i32 = ONE / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaperType {
    Zv,
    Zvd,
    Mzv,
    Ei,
}

fn default_damping_ratio() -> f32 {
    0.1
}

fn default_vibration_tolerance() -> f32 {
    0.05
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShaperConfig {
    #[serde(rename = "type")]
    pub shaper: ShaperType,
    /// Resonant frequency to cancel, in Hz.
    pub frequency: f32,
    #[serde(default = "default_damping_ratio")]
    pub damping_ratio: f32,
    /// Residual vibration accepted by the EI shaper.
    #[serde(default = "default_vibration_tolerance")]
    pub vibration_tolerance: f32,
}

impl ShaperConfig {
    pub fn new(shaper: ShaperType, frequency: f32) -> Self {
        Self {
            shaper,
            frequency,
            damping_ratio: default_damping_ratio(),
            vibration_tolerance: default_vibration_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ShaperError {
    #[error("shaper frequency {0} Hz is outside 1..=500")]
    Frequency(f32),
    #[error("damping ratio {0} is outside 0..1")]
    DampingRatio(f32),
    #[error("vibration tolerance {0} is outside 0..1")]
    VibrationTolerance(f32),
    #[error("input shaping is only available on motion channels")]
    ExtruderChannel,
    #[error("shapers can only be changed while the engine is idle")]
    Busy,
}

/// Impulse train of a shaper: amplitudes (summing to one) and delays in
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Impulses {
    pub amplitudes: [f32; MAX_IMPULSES],
    pub delays: [f32; MAX_IMPULSES],
    pub len: usize,
}

impl Impulses {
    pub fn new(config: &ShaperConfig) -> Result<Self, ShaperError> {
        let ShaperConfig {
            shaper,
            frequency: f,
            damping_ratio: zeta,
            vibration_tolerance: vtol,
        } = *config;
        if !(1.0..=500.0).contains(&f) {
            return Err(ShaperError::Frequency(f));
        }
        if !(0.0..1.0).contains(&zeta) {
            return Err(ShaperError::DampingRatio(zeta));
        }
        if !(0.0..1.0).contains(&vtol) {
            return Err(ShaperError::VibrationTolerance(vtol));
        }

        let df = (1.0 - zeta * zeta).sqrt();
        let k = (-zeta * core::f32::consts::PI / df).exp();
        let k2 = k * k;
        let period = 1.0 / f / df;

        let (amplitudes, delays, len) = match shaper {
            ShaperType::Zv => ([1.0, k, 0.0], [0.0, 0.5 * period, 0.0], 2),
            ShaperType::Zvd => ([1.0, 2.0 * k, k2], [0.0, 0.5 * period, period], 3),
            ShaperType::Mzv => {
                let b = core::f32::consts::SQRT_2 * k;
                ([1.0, b, k2], [0.0, 0.375 * period, 0.75 * period], 3)
            }
            ShaperType::Ei => {
                let a0 = 0.25 * (1.0 + vtol);
                (
                    [a0, 0.5 * (1.0 - vtol) * k, a0 * k2],
                    [0.0, 0.5 * period, period],
                    3,
                )
            }
        };

        let sum: f32 = amplitudes.iter().sum();
        Ok(Self {
            amplitudes: amplitudes.map(|a| a / sum),
            delays,
            len,
        })
    }
}

/// Net steps whose delayed impulse falls due at `due`.
#[derive(Debug, Clone, Copy)]
struct Echo {
    due: u32,
    steps: i32,
}

/// FIFO of delayed impulses for one impulse index. Pushes happen in time
/// order and all share one delay, so due times are monotonic. A push within
/// `slice` ticks of the newest entry joins it, which bounds the ring by
/// the delay instead of the step rate.
#[derive(Debug, Clone)]
struct EchoRing {
    echoes: [Echo; ECHO_CAPACITY],
    head: usize,
    len: usize,
    slice: u32,
}

impl EchoRing {
    fn new(delay: u32) -> Self {
        // two spare entries cover echoes not yet serviced since the last
        // interrupt
        let slices = ECHO_CAPACITY as u32 - 2;
        Self {
            echoes: [Echo { due: 0, steps: 0 }; ECHO_CAPACITY],
            head: 0,
            len: 0,
            slice: delay.div_ceil(slices).max(MIN_SLICE_TICKS),
        }
    }

    fn push(&mut self, due: u32, steps: i32) -> bool {
        if let Some(last) = self.len.checked_sub(1) {
            let newest = &mut self.echoes[(self.head + last) % ECHO_CAPACITY];
            if due.wrapping_sub(newest.due) < self.slice {
                newest.steps += steps;
                return true;
            }
        }
        if self.len == ECHO_CAPACITY {
            return false;
        }
        self.echoes[(self.head + self.len) % ECHO_CAPACITY] = Echo { due, steps };
        self.len += 1;
        true
    }

    fn front(&self) -> Option<&Echo> {
        (self.len > 0).then(|| &self.echoes[self.head])
    }

    fn pop_due(&mut self, now: u32) -> Option<i32> {
        let echo = self.front()?;
        if !is_due(echo.due, now) {
            return None;
        }
        let steps = echo.steps;
        self.head = (self.head + 1) % ECHO_CAPACITY;
        self.len -= 1;
        Some(steps)
    }

    fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }
}

/// Wrapping tick comparison: `due` is at or before `now`.
fn is_due(due: u32, now: u32) -> bool {
    (due.wrapping_sub(now) as i32) <= 0
}

/// Shaping state of one stepper channel.
#[derive(Debug, Clone)]
pub struct ShapedChannel {
    amplitudes: [i32; MAX_IMPULSES],
    delays: [u32; MAX_IMPULSES],
    len: usize,
    echoes: [EchoRing; MAX_IMPULSES - 1],
    /// Shaped position minus emitted position, in 1/65536 steps.
    offset: i32,
    overflows: u32,
}

impl ShapedChannel {
    /// Builds a channel shaper for a timer running at `timer_rate` Hz.
    pub fn new(config: &ShaperConfig, timer_rate: u32) -> Result<Self, ShaperError> {
        let impulses = Impulses::new(config)?;
        let mut amplitudes = [0i32; MAX_IMPULSES];
        let mut delays = [0u32; MAX_IMPULSES];
        for i in 1..impulses.len {
            amplitudes[i] = (impulses.amplitudes[i] * ONE as f32).round() as i32;
            delays[i] = (impulses.delays[i] * timer_rate as f32).round() as u32;
        }
        // the leading impulse absorbs rounding so the total is exactly one
        amplitudes[0] = ONE - amplitudes[1..].iter().sum::<i32>();
        Ok(Self {
            amplitudes,
            delays,
            len: impulses.len,
            echoes: core::array::from_fn(|i| EchoRing::new(delays[i + 1])),
            offset: 0,
            overflows: 0,
        })
    }

    /// Feeds one planned step taken at tick `now`.
    pub fn push(&mut self, now: u32, forward: bool) {
        let sign = if forward { 1 } else { -1 };
        self.offset += sign * self.amplitudes[0];
        for i in 1..self.len {
            let due = now.wrapping_add(self.delays[i]);
            if !self.echoes[i - 1].push(due, sign) {
                // out of room: apply now rather than lose the step
                self.offset += sign * self.amplitudes[i];
                self.overflows = self.overflows.wrapping_add(1);
            }
        }
    }

    /// Applies every impulse that has fallen due by `now`.
    pub fn service(&mut self, now: u32) {
        for i in 1..self.len {
            while let Some(steps) = self.echoes[i - 1].pop_due(now) {
                self.offset += steps * self.amplitudes[i];
            }
        }
    }

    /// Next physical step to emit, if the shaped position has moved half a
    /// step past the emitted one. Returns the direction.
    pub fn take_step(&mut self) -> Option<bool> {
        if self.offset >= HALF {
            self.offset -= ONE;
            Some(true)
        } else if self.offset <= -HALF {
            self.offset += ONE;
            Some(false)
        } else {
            None
        }
    }

    /// Ticks from `now` until the earliest outstanding impulse.
    pub fn next_due(&self, now: u32) -> Option<u32> {
        self.echoes
            .iter()
            .filter_map(EchoRing::front)
            .map(|echo| {
                if is_due(echo.due, now) {
                    0
                } else {
                    echo.due.wrapping_sub(now)
                }
            })
            .min()
    }

    /// Nothing outstanding and no step owed.
    pub fn is_idle(&self) -> bool {
        self.echoes.iter().all(|ring| ring.len == 0) && self.offset.abs() < HALF
    }

    /// Impulses applied early because a delay ring was full. Only a timer
    /// that runs backwards can fill a ring.
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    pub fn clear(&mut self) {
        for ring in &mut self.echoes {
            ring.clear();
        }
        self.offset = 0;
    }
}
