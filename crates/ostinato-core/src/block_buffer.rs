//! Lock-free single-producer/single-consumer ring of planned blocks.
//!
//! The planner owns `head` and the stepper engine owns `tail`. Each side
//! publishes its own index with release ordering and reads the other's with
//! acquire ordering, so a stale read only ever under-reports progress.
//!
//! Planner bookkeeping lives in the [`Producer`] and never crosses sides.
//! Profiles cross between the two sides only inside a critical section:
//! the planner rewrites a profile only if the block is not busy, and the
//! engine sets `busy` and copies the profile in one step. A block can also
//! be marked dirty while the planner is rewriting it; the engine will not
//! start a block while it or its successor is dirty, so it never runs a
//! block whose exit speed disagrees with the next block's entry speed.

use crate::block::{BlockProfile, PlanState};
use core::{
    cell::Cell,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};
use critical_section::Mutex;

/// Default number of slots. One slot is always left free.
pub const BLOCK_BUFFER_SIZE: usize = 16;

struct Slot {
    busy: AtomicBool,
    dirty: AtomicBool,
    profile: Mutex<Cell<BlockProfile>>,
}

impl Slot {
    const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            profile: Mutex::new(Cell::new(BlockProfile::EMPTY)),
        }
    }
}

pub struct BlockBuffer<const N: usize = BLOCK_BUFFER_SIZE> {
    slots: [Slot; N],
    head: AtomicUsize,
    tail: AtomicUsize,
    epoch: AtomicU32,
    halted: AtomicBool,
}

impl<const N: usize> Default for BlockBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> BlockBuffer<N> {
    const MASK: usize = {
        assert!(
            N.is_power_of_two() && N >= 2,
            "block buffer size must be a power of two"
        );
        N - 1
    };

    pub const fn new() -> Self {
        let _ = Self::MASK;
        Self {
            slots: [const { Slot::new() }; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            epoch: AtomicU32::new(0),
            halted: AtomicBool::new(false),
        }
    }

    /// Number of blocks that can be queued at once.
    pub const fn capacity(&self) -> usize {
        N - 1
    }

    pub const fn next_index(index: usize) -> usize {
        (index + 1) & Self::MASK
    }

    pub const fn prev_index(index: usize) -> usize {
        index.wrapping_sub(1) & Self::MASK
    }

    pub fn head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    pub fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.head().wrapping_sub(self.tail()) & Self::MASK
    }

    pub fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn status(&self) -> BufferStatus {
        let head = self.head();
        let tail = self.tail();
        BufferStatus {
            head,
            tail,
            occupancy: head.wrapping_sub(tail) & Self::MASK,
            capacity: self.capacity(),
        }
    }

    /// Hands out the two halves of the ring. Only one of each may exist.
    pub fn split(&mut self) -> (Producer<'_, N>, Consumer<'_, N>) {
        let buffer = &*self;
        (
            Producer {
                buffer,
                plans: [PlanState::EMPTY; N],
            },
            Consumer {
                buffer,
                epoch: buffer.epoch(),
                active: None,
            },
        )
    }
}

/// Snapshot of the ring indices for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatus {
    pub head: usize,
    pub tail: usize,
    pub occupancy: usize,
    pub capacity: usize,
}

/// Indices of the blocks the planner may still change, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub first: usize,
    pub head: usize,
}

impl Window {
    pub fn is_empty(&self) -> bool {
        self.first == self.head
    }
}

/// Planner side of the ring
pub struct Producer<'a, const N: usize = BLOCK_BUFFER_SIZE> {
    buffer: &'a BlockBuffer<N>,
    plans: [PlanState; N],
}

impl<'a, const N: usize> Producer<'a, N> {
    fn slot(&self, index: usize) -> &'a Slot {
        &self.buffer.slots[index & BlockBuffer::<N>::MASK]
    }

    pub fn buffer(&self) -> &'a BlockBuffer<N> {
        self.buffer
    }

    pub fn is_full(&self) -> bool {
        let head = self.buffer.head.load(Ordering::Relaxed);
        BlockBuffer::<N>::next_index(head) == self.buffer.tail()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_halted(&self) -> bool {
        self.buffer.is_halted()
    }

    pub fn is_busy(&self, index: usize) -> bool {
        self.slot(index).busy.load(Ordering::Acquire)
    }

    pub fn plan(&self, index: usize) -> &PlanState {
        &self.plans[index & BlockBuffer::<N>::MASK]
    }

    pub fn plan_mut(&mut self, index: usize) -> &mut PlanState {
        &mut self.plans[index & BlockBuffer::<N>::MASK]
    }

    /// Copy of a queued profile.
    pub fn profile(&self, index: usize) -> BlockProfile {
        let slot = self.slot(index);
        critical_section::with(|cs| slot.profile.borrow(cs).get())
    }

    /// Appends a block, or hands it back if the ring is full.
    pub fn push(
        &mut self,
        plan: PlanState,
        profile: BlockProfile,
    ) -> Result<usize, (PlanState, BlockProfile)> {
        if self.is_full() {
            return Err((plan, profile));
        }
        let head = self.buffer.head.load(Ordering::Relaxed);
        let slot = self.slot(head);
        debug_assert!(!slot.busy.load(Ordering::Acquire));
        self.plans[head] = plan;
        critical_section::with(|cs| slot.profile.borrow(cs).set(profile));
        slot.dirty.store(false, Ordering::Relaxed);
        self.buffer
            .head
            .store(BlockBuffer::<N>::next_index(head), Ordering::Release);
        Ok(head)
    }

    /// Marks every block that is not yet busy as dirty and returns them.
    ///
    /// At most the tail block can be busy, so the window is the queue minus
    /// possibly its oldest entry. Blocks in the window cannot become busy
    /// until [`Producer::write_profile`] clears them.
    pub fn claim_window(&mut self) -> Window {
        critical_section::with(|_| {
            let head = self.buffer.head.load(Ordering::Relaxed);
            let mut first = self.buffer.tail.load(Ordering::Acquire);
            if first != head && self.slot(first).busy.load(Ordering::Acquire) {
                first = BlockBuffer::<N>::next_index(first);
            }
            let mut index = first;
            while index != head {
                self.slot(index).dirty.store(true, Ordering::Release);
                index = BlockBuffer::<N>::next_index(index);
            }
            Window { first, head }
        })
    }

    /// Replaces the profile of a claimed block (if given) and clears its
    /// dirty mark.
    pub fn write_profile(&mut self, index: usize, profile: Option<&BlockProfile>) {
        let slot = self.slot(index);
        critical_section::with(|cs| {
            if let Some(profile) = profile
                && !slot.busy.load(Ordering::Acquire)
            {
                slot.profile.borrow(cs).set(*profile);
            }
            slot.dirty.store(false, Ordering::Release);
        });
    }

    /// Emergency reset: empties the ring and halts the consumer.
    pub fn reset(&mut self) {
        critical_section::with(|_| {
            for slot in &self.buffer.slots {
                slot.busy.store(false, Ordering::Relaxed);
                slot.dirty.store(false, Ordering::Relaxed);
            }
            self.buffer.head.store(0, Ordering::Release);
            self.buffer.tail.store(0, Ordering::Release);
            self.buffer.epoch.fetch_add(1, Ordering::AcqRel);
            self.buffer.halted.store(true, Ordering::Release);
        });
    }

    /// Lets the consumer take blocks again after [`Producer::reset`].
    pub fn resume(&mut self) {
        self.buffer.halted.store(false, Ordering::Release);
    }
}

/// Outcome of asking the ring for the next block
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fetch {
    Block(BlockProfile),
    /// The next block is being replanned; ask again shortly.
    Pending,
    Empty,
}

/// Stepper engine side of the ring
pub struct Consumer<'a, const N: usize = BLOCK_BUFFER_SIZE> {
    buffer: &'a BlockBuffer<N>,
    epoch: u32,
    active: Option<usize>,
}

impl<'a, const N: usize> Consumer<'a, N> {
    pub fn is_halted(&self) -> bool {
        self.buffer.is_halted()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// The block being executed was discarded by an emergency reset.
    pub fn is_stale(&self) -> bool {
        self.active.is_some() && self.buffer.epoch() != self.epoch
    }

    /// Marks the tail block busy and returns a copy of its profile.
    pub fn begin(&mut self) -> Fetch {
        let buffer = self.buffer;
        critical_section::with(|cs| {
            if buffer.is_halted() {
                return Fetch::Empty;
            }
            let tail = buffer.tail.load(Ordering::Relaxed);
            let head = buffer.head.load(Ordering::Acquire);
            if tail == head {
                return Fetch::Empty;
            }
            let slot = &buffer.slots[tail];
            let next = BlockBuffer::<N>::next_index(tail);
            if slot.dirty.load(Ordering::Acquire)
                || (next != head && buffer.slots[next].dirty.load(Ordering::Acquire))
            {
                return Fetch::Pending;
            }
            slot.busy.store(true, Ordering::Release);
            self.epoch = buffer.epoch();
            self.active = Some(tail);
            Fetch::Block(slot.profile.borrow(cs).get())
        })
    }

    /// Retires the active block and advances `tail`.
    pub fn finish(&mut self) {
        let Some(index) = self.active.take() else {
            return;
        };
        let buffer = self.buffer;
        let epoch = self.epoch;
        critical_section::with(|_| {
            if buffer.epoch() != epoch {
                return;
            }
            buffer.slots[index].busy.store(false, Ordering::Release);
            buffer
                .tail
                .store(BlockBuffer::<N>::next_index(index), Ordering::Release);
        });
    }

    /// Halts the ring from the interrupt side. Queued blocks stay in place
    /// until the producer flushes them with [`Producer::reset`].
    pub fn halt(&mut self) {
        let buffer = self.buffer;
        critical_section::with(|_| {
            buffer.epoch.fetch_add(1, Ordering::AcqRel);
            buffer.halted.store(true, Ordering::Release);
        });
    }

    /// Forgets the active block without touching the ring.
    pub fn abandon(&mut self) {
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(steps: u32) -> BlockProfile {
        BlockProfile {
            steps: [steps, 0, 0, 0],
            step_event_count: steps,
            ..BlockProfile::EMPTY
        }
    }

    #[test]
    fn push_until_full_then_hand_back() {
        let mut buffer = BlockBuffer::<4>::new();
        let (mut producer, _consumer) = buffer.split();
        for i in 0..3 {
            assert!(producer.push(PlanState::EMPTY, profile(i + 1)).is_ok());
        }
        assert!(producer.is_full());
        let rejected = producer.push(PlanState::EMPTY, profile(99));
        assert_eq!(rejected.unwrap_err().1.step_event_count, 99);
        assert_eq!(producer.len(), 3);
    }

    #[test]
    fn consumer_takes_blocks_in_order() {
        let mut buffer = BlockBuffer::<4>::new();
        let (mut producer, mut consumer) = buffer.split();
        producer.push(PlanState::EMPTY, profile(1)).unwrap();
        producer.push(PlanState::EMPTY, profile(2)).unwrap();

        let Fetch::Block(first) = consumer.begin() else {
            panic!("expected a block");
        };
        assert_eq!(first.step_event_count, 1);
        assert!(producer.is_busy(0));
        consumer.finish();
        assert!(!producer.is_busy(0));

        let Fetch::Block(second) = consumer.begin() else {
            panic!("expected a block");
        };
        assert_eq!(second.step_event_count, 2);
        consumer.finish();
        assert_eq!(consumer.begin(), Fetch::Empty);
    }

    #[test]
    fn tail_never_passes_head() {
        let mut buffer = BlockBuffer::<4>::new();
        let (mut producer, mut consumer) = buffer.split();
        consumer.finish();
        assert_eq!(consumer.begin(), Fetch::Empty);
        producer.push(PlanState::EMPTY, profile(1)).unwrap();
        assert!(matches!(consumer.begin(), Fetch::Block(_)));
        consumer.finish();
        consumer.finish();
        assert_eq!(producer.buffer().status().occupancy, 0);
        assert_eq!(producer.buffer().tail(), producer.buffer().head());
    }

    #[test]
    fn head_wraps_without_touching_a_busy_slot() {
        let mut buffer = BlockBuffer::<4>::new();
        let (mut producer, mut consumer) = buffer.split();
        for i in 0..3 {
            producer.push(PlanState::EMPTY, profile(i + 1)).unwrap();
        }
        // slot 0 is now executing; the ring is still full
        assert!(matches!(consumer.begin(), Fetch::Block(_)));
        assert!(producer.push(PlanState::EMPTY, profile(4)).is_err());
        consumer.finish();
        // slot 3 is free, slot 0 is retired and reusable only after that
        assert_eq!(producer.push(PlanState::EMPTY, profile(4)), Ok(3));
        assert!(producer.is_full());
        assert!(!producer.is_busy(0));
    }

    #[test]
    fn dirty_blocks_are_not_started() {
        let mut buffer = BlockBuffer::<4>::new();
        let (mut producer, mut consumer) = buffer.split();
        producer.push(PlanState::EMPTY, profile(1)).unwrap();
        producer.push(PlanState::EMPTY, profile(2)).unwrap();

        let window = producer.claim_window();
        assert_eq!(window, Window { first: 0, head: 2 });
        assert_eq!(consumer.begin(), Fetch::Pending);

        producer.write_profile(0, Some(&profile(10)));
        // the successor is still dirty
        assert_eq!(consumer.begin(), Fetch::Pending);
        producer.write_profile(1, None);

        let Fetch::Block(block) = consumer.begin() else {
            panic!("expected a block");
        };
        assert_eq!(block.step_event_count, 10);
    }

    #[test]
    fn busy_profiles_are_not_rewritten() {
        let mut buffer = BlockBuffer::<4>::new();
        let (mut producer, mut consumer) = buffer.split();
        producer.push(PlanState::EMPTY, profile(1)).unwrap();
        producer.push(PlanState::EMPTY, profile(2)).unwrap();
        assert!(matches!(consumer.begin(), Fetch::Block(_)));

        let window = producer.claim_window();
        assert_eq!(window.first, 1);
        producer.write_profile(0, Some(&profile(50)));
        assert_eq!(producer.profile(0).step_event_count, 1);
    }

    #[test]
    fn ring_is_shareable_with_the_interrupt() {
        fn assert_sync<T: Sync>() {}
        assert_sync::<BlockBuffer<16>>();
    }

    #[test]
    fn plans_follow_their_slot_across_wraps() {
        let mut buffer = BlockBuffer::<4>::new();
        let (mut producer, mut consumer) = buffer.split();
        let plan = |speed| PlanState {
            nominal_speed: speed,
            ..PlanState::EMPTY
        };
        for i in 0..6u32 {
            let index = producer.push(plan(i as f32), profile(i + 1)).unwrap();
            assert_eq!(index, i as usize & 3);
            assert!(matches!(consumer.begin(), Fetch::Block(_)));
            consumer.finish();
            assert_eq!(producer.plan(index).nominal_speed, i as f32);
        }
        producer.plan_mut(1).entry_speed = 7.0;
        assert_eq!(producer.plan(5).entry_speed, 7.0);
    }

    #[test]
    fn reset_empties_and_halts() {
        let mut buffer = BlockBuffer::<4>::new();
        let (mut producer, mut consumer) = buffer.split();
        producer.push(PlanState::EMPTY, profile(1)).unwrap();
        producer.push(PlanState::EMPTY, profile(2)).unwrap();
        assert!(matches!(consumer.begin(), Fetch::Block(_)));

        producer.reset();
        assert!(consumer.is_stale());
        assert!(producer.is_empty());
        assert_eq!(consumer.begin(), Fetch::Empty);

        // a late finish from the discarded block must not move tail
        consumer.finish();
        assert_eq!(producer.buffer().status().tail, 0);

        producer.resume();
        producer.push(PlanState::EMPTY, profile(3)).unwrap();
        let Fetch::Block(block) = consumer.begin() else {
            panic!("expected a block");
        };
        assert_eq!(block.step_event_count, 3);
        assert!(!consumer.is_stale());
    }
}
