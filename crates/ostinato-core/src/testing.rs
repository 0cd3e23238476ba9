use crate::{
    kinematics::{Channel, NUM_CHANNELS},
    stepper::{Stepper, StepperHal},
};
use std::vec::Vec;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HalEvent {
    Direction(Channel, bool),
    StepHigh(Channel),
    StepLow(Channel),
    Delay(u32),
    Enable(bool),
}

/// Records every pin transition and keeps a step count per channel.
#[derive(Debug)]
pub struct RecordingHal {
    pub events: Vec<HalEvent>,
    pub enabled: bool,
    forward: [bool; NUM_CHANNELS],
    high: [bool; NUM_CHANNELS],
    pulses: [u32; NUM_CHANNELS],
    positions: [i32; NUM_CHANNELS],
}

impl Default for RecordingHal {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            enabled: false,
            forward: [true; NUM_CHANNELS],
            high: [false; NUM_CHANNELS],
            pulses: [0; NUM_CHANNELS],
            positions: [0; NUM_CHANNELS],
        }
    }
}

impl RecordingHal {
    pub fn pulse_count(&self, channel: Channel) -> u32 {
        self.pulses[channel.index()]
    }

    pub fn position(&self, channel: Channel) -> i32 {
        self.positions[channel.index()]
    }
}

impl StepperHal for RecordingHal {
    fn set_direction(&mut self, channel: Channel, forward: bool) {
        self.forward[channel.index()] = forward;
        self.events.push(HalEvent::Direction(channel, forward));
    }

    fn step_high(&mut self, channel: Channel) {
        let i = channel.index();
        assert!(!self.high[i], "{channel:?} raised twice");
        self.high[i] = true;
        self.events.push(HalEvent::StepHigh(channel));
    }

    fn step_low(&mut self, channel: Channel) {
        let i = channel.index();
        assert!(self.high[i], "{channel:?} lowered while low");
        self.high[i] = false;
        self.pulses[i] += 1;
        self.positions[i] += if self.forward[i] { 1 } else { -1 };
        self.events.push(HalEvent::StepLow(channel));
    }

    fn delay_ns(&mut self, ns: u32) {
        self.events.push(HalEvent::Delay(ns));
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.events.push(HalEvent::Enable(enabled));
    }
}

/// Runs the interrupt until the engine reports idle, returning the number
/// of calls.
pub fn run_until_idle<H: StepperHal, const N: usize>(
    stepper: &mut Stepper<'_, H, N>,
    max_calls: usize,
) -> usize {
    for calls in 1..=max_calls {
        stepper.isr();
        if stepper.is_idle() {
            return calls;
        }
    }
    panic!("engine still busy after {max_calls} interrupts");
}
