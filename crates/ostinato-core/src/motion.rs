//! Motion context.
//!
//! [`Motion`] owns everything the main loop and the stepper interrupt
//! share: the block ring and a handful of atomics the engine publishes.
//! It is split once into a [`Planner`] for the main loop and a [`Stepper`]
//! for the interrupt. The lifecycle is tracked by the ring itself: an
//! emergency stop halts it, and [`Planner::power_on`] resumes it.

use crate::{
    block_buffer::{BLOCK_BUFFER_SIZE, BlockBuffer, BufferStatus},
    kinematics::{Channel, Kinematics, NUM_CHANNELS},
    planner::Planner,
    settings::{PlannerSettings, SettingsError},
    stepper::{Phase, PulseTiming, Stepper, StepperHal},
};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    PoweredOn,
    EmergencyStopped,
}

/// State published by the stepper engine and read by the main loop.
pub struct StepperStatus {
    positions: [AtomicI32; NUM_CHANNELS],
    drivers_enabled: AtomicBool,
    idle: AtomicBool,
    phase: AtomicU8,
    blocks_executed: AtomicU32,
}

impl Default for StepperStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl StepperStatus {
    pub const fn new() -> Self {
        Self {
            positions: [const { AtomicI32::new(0) }; NUM_CHANNELS],
            drivers_enabled: AtomicBool::new(false),
            idle: AtomicBool::new(true),
            phase: AtomicU8::new(Phase::Idle as u8),
            blocks_executed: AtomicU32::new(0),
        }
    }

    /// Physical step position of a channel.
    pub fn position(&self, channel: Channel) -> i32 {
        self.positions[channel.index()].load(Ordering::Acquire)
    }

    /// Only the stepper interrupt moves positions; a load/store pair is
    /// enough and avoids needing atomic read-modify-write on the target.
    pub(crate) fn step(&self, channel: Channel, forward: bool) {
        let position = &self.positions[channel.index()];
        let current = position.load(Ordering::Relaxed);
        let next = if forward { current + 1 } else { current - 1 };
        position.store(next, Ordering::Release);
    }

    pub(crate) fn set_position(&self, channel: Channel, steps: i32) {
        self.positions[channel.index()].store(steps, Ordering::Release);
    }

    /// Whether the main loop wants the drivers energized.
    pub fn drivers_enabled(&self) -> bool {
        self.drivers_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn request_drivers(&self, enabled: bool) {
        self.drivers_enabled.store(enabled, Ordering::Release);
    }

    /// No block is executing and no delayed pulses are outstanding.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub(crate) fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Release);
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn blocks_executed(&self) -> u32 {
        self.blocks_executed.load(Ordering::Acquire)
    }

    pub(crate) fn block_executed(&self) {
        let count = self.blocks_executed.load(Ordering::Relaxed);
        self.blocks_executed
            .store(count.wrapping_add(1), Ordering::Release);
    }
}

pub struct Motion<const N: usize = BLOCK_BUFFER_SIZE> {
    buffer: BlockBuffer<N>,
    status: StepperStatus,
}

impl<const N: usize> Default for Motion<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Motion<N> {
    pub const fn new() -> Self {
        Self {
            buffer: BlockBuffer::new(),
            status: StepperStatus::new(),
        }
    }

    pub fn state(&self) -> MachineState {
        if self.buffer.is_halted() {
            MachineState::EmergencyStopped
        } else {
            MachineState::PoweredOn
        }
    }

    pub fn status(&self) -> &StepperStatus {
        &self.status
    }

    pub fn buffer_status(&self) -> BufferStatus {
        self.buffer.status()
    }

    /// Creates the main-loop and interrupt handles. The settings are
    /// validated first, since the engine trusts every block it is given.
    pub fn split<K, H>(
        &mut self,
        kinematics: K,
        settings: PlannerSettings,
        hal: H,
        timing: PulseTiming,
    ) -> Result<(Planner<'_, K, N>, Stepper<'_, H, N>), SettingsError>
    where
        K: Kinematics,
        H: StepperHal,
    {
        let status = &self.status;
        let (producer, consumer) = self.buffer.split();
        let planner = Planner::new(producer, status, kinematics, settings)?;
        Ok((planner, Stepper::new(consumer, status, hal, timing)))
    }
}
