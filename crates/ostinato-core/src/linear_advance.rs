//! Linear advance (extruder pressure compensation).
//!
//! Melt pressure in the nozzle lags the extruder, so the extruder is run
//! ahead of its planned position by `K · v_e`, where `v_e` is the current
//! extrusion speed. While the head accelerates the offset grows and extra
//! forward steps are emitted; while it brakes the offset shrinks and steps
//! are taken back. Once motion stops the offset decays to zero, so the
//! extruder always ends at its planned position.

/// Moves with more filament per unit of travel than this are retract or
/// prime moves merged into a print move; they never get advance.
pub const MAX_E_D_RATIO: f32 = 3.0;

/// Extruder steps the interrupt emits per tick while catching up.
pub const MAX_STEPS_PER_TICK: u32 = 4;

const SCALE_ONE: f32 = (1u32 << 24) as f32;

/// Advance parameters of one block, decided by the planner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdvancePlan {
    /// Filament length per unit of head travel.
    pub e_d_ratio: f32,
    /// Advance steps per step/s of block rate, `<< 24` fixed point.
    pub scale: u32,
    /// Acceleration cap (steps/s² of the dominant channel) that keeps the
    /// extruder's velocity jump within its jerk limit.
    pub max_acceleration_steps: f32,
}

/// Inputs the planner already has when it sizes a block.
#[derive(Debug, Clone, Copy)]
pub struct AdvanceInput {
    pub k: f32,
    pub e_steps: u32,
    pub step_event_count: u32,
    /// Signed extrusion length of the move.
    pub de: f32,
    /// XYZ length of the move; zero for extruder-only moves.
    pub travel: f32,
    /// Step events per unit of block length.
    pub steps_per_mm: f32,
    pub max_jerk_e: f32,
}

/// Decides whether a block gets linear advance.
pub fn plan(input: AdvanceInput) -> Option<AdvancePlan> {
    if input.k <= 0.0
        || input.e_steps == 0
        || input.de <= 0.0
        || input.travel <= 0.0
        || input.step_event_count == 0
    {
        return None;
    }
    let e_d_ratio = input.de / input.travel;
    if e_d_ratio > MAX_E_D_RATIO {
        return None;
    }
    let per_rate = input.k * input.e_steps as f32 / input.step_event_count as f32;
    let scale = (per_rate * SCALE_ONE) as u32;
    if scale == 0 {
        return None;
    }
    Some(AdvancePlan {
        e_d_ratio,
        scale,
        max_acceleration_steps: input.max_jerk_e / (input.k * e_d_ratio) * input.steps_per_mm,
    })
}

/// Interrupt-side extruder state: the advance offset currently applied and
/// the extruder steps still to be emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Advance {
    offset: i32,
    pending: i32,
    extruder: u8,
}

impl Advance {
    pub const fn new() -> Self {
        Self {
            offset: 0,
            pending: 0,
            extruder: 0,
        }
    }

    /// Sets the advance offset for the current block rate.
    pub fn retarget(&mut self, rate: u32, scale: u32) {
        let target = ((rate as u64 * scale as u64) >> 24) as i32;
        self.pending += target - self.offset;
        self.offset = target;
    }

    /// Queues one planned extruder step.
    pub fn push_step(&mut self, forward: bool, extruder: u8) {
        self.extruder = extruder;
        self.pending += if forward { 1 } else { -1 };
    }

    /// Next extruder step to emit, as `(extruder, forward)`.
    pub fn take(&mut self) -> Option<(u8, bool)> {
        match self.pending {
            0 => None,
            p if p > 0 => {
                self.pending -= 1;
                Some((self.extruder, true))
            }
            _ => {
                self.pending += 1;
                Some((self.extruder, false))
            }
        }
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn pending(&self) -> i32 {
        self.pending
    }

    /// No offset applied and nothing left to emit.
    pub fn is_settled(&self) -> bool {
        self.offset == 0 && self.pending == 0
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
