use crate::arena::{Arena, NIL};
use crate::level::{Level, SlotPos};
use crate::{Tick, Timer, TimerId, MASK, NUM_LEVELS, NUM_SLOTS, WIDTH_BITS};

/// Hierarchical timer wheel.
///
/// Eight levels of 256 slots each cover the full 64-bit tick range: level 0
/// resolves single ticks, each coarser level resolves 256x the previous.
/// A timer lives in the coarsest level whose resolution its remaining delay
/// requires, and migrates inward (never outward) as slot-0 boundaries
/// cascade it toward level 0, where it fires.
///
/// # Cost model
///
/// `schedule`, `cancel`, and rescheduling an active timer are O(1) and
/// never walk a list. `advance` is O(delta) plus O(1) amortized per fired
/// timer. `ticks_to_next_event` is O(occupied slots scanned), bitmap
/// accelerated.
///
/// # Access model
///
/// Single-threaded by construction (`&mut self` everywhere); callbacks run
/// synchronously inside [`advance`](Self::advance) and may reenter every
/// operation except `advance` itself.
pub struct TimerWheel<T> {
    levels: [Level; NUM_LEVELS],
    arena: Arena<T>,
    now: Tick,
    /// Ticks still owed to the clock, counting the tick currently being
    /// drained. Nonzero between a budget-exhausted return and the call
    /// that finishes the tick.
    pending_ticks: Tick,
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        Self::with_now(0)
    }

    /// A wheel whose clock starts at `now` instead of zero.
    pub fn with_now(now: Tick) -> Self {
        Self {
            levels: std::array::from_fn(|_| Level::new()),
            arena: Arena::new(),
            now,
            pending_ticks: 0,
        }
    }

    /// Current logical tick.
    ///
    /// During a callback this is the tick the firing timer was scheduled
    /// for, not the tick the surrounding `advance` will end on.
    #[inline(always)]
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Number of registered timers, scheduled or not.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.arena.len() == 0
    }

    /// Add a timer in the unscheduled state. Storage is reclaimed by
    /// [`deregister`](Self::deregister).
    pub fn register(&mut self, timer: T) -> TimerId {
        self.arena.insert(timer)
    }

    /// Cancel and remove a timer, returning its payload.
    ///
    /// `None` for a stale id, or when the timer removes itself from inside
    /// its own callback (the payload is on loan to the callback frame and
    /// is dropped when it returns).
    pub fn deregister(&mut self, id: TimerId) -> Option<T> {
        let index = self.arena.index_of(id)?;
        self.unlink(index);
        self.arena.vacate(index)
    }

    /// Borrow a registered timer's payload.
    #[inline(always)]
    pub fn timer(&self, id: TimerId) -> Option<&T> {
        self.arena.get(id)?.timer.as_ref()
    }

    #[inline(always)]
    pub fn timer_mut(&mut self, id: TimerId) -> Option<&mut T> {
        self.arena.get_mut(id)?.timer.as_mut()
    }

    /// Whether the timer currently sits in a slot awaiting its tick.
    ///
    /// False for stale ids, and false for a timer while its own callback
    /// runs (it is detached before execution).
    #[inline(always)]
    pub fn active(&self, id: TimerId) -> bool {
        self.arena.get(id).is_some_and(|node| node.pos.is_some())
    }

    /// Absolute tick the timer is (or was last) scheduled to fire at.
    ///
    /// Meaningful while the timer is active and, transiently, inside its
    /// own callback. `None` for stale ids; garbage (zero) for a timer that
    /// was registered but never scheduled.
    #[inline(always)]
    pub fn scheduled_at(&self, id: TimerId) -> Option<Tick> {
        self.arena.get(id).map(|node| node.scheduled_at)
    }

    /// Schedule the timer `delta` ticks from now, replacing any existing
    /// schedule. One O(1) operation either way; no separate cancel needed.
    ///
    /// # Panics
    ///
    /// Panics if `delta == 0` or if `id` is stale.
    pub fn schedule(&mut self, id: TimerId, delta: Tick) {
        assert!(delta > 0, "schedule: delta must be positive");
        let index = self
            .arena
            .index_of(id)
            .expect("schedule: unknown or deregistered timer id");
        self.arena.node_mut(index).scheduled_at = self.now.wrapping_add(delta);
        self.place(index, delta);
    }

    /// Schedule anywhere in the window `[start, end]` ticks from now,
    /// preferring expiries aligned on coarse slot boundaries.
    ///
    /// If the timer is already scheduled inside the window it is left
    /// untouched, which makes the repeated idle-timeout-bump pattern
    /// nearly free. Otherwise the latest tick in the window whose low bits
    /// are zero at the coarsest possible level is chosen: an aligned
    /// expiry lands in a coarser slot, maximizing the chance the timer is
    /// cancelled or rescheduled before it ever cascades to level 0.
    ///
    /// # Panics
    ///
    /// Panics if `start == 0` or `start >= end`, or if `id` is stale.
    pub fn schedule_in_range(&mut self, id: TimerId, start: Tick, end: Tick) {
        assert!(
            start > 0 && start < end,
            "schedule_in_range: need 0 < start < end"
        );
        let index = self
            .arena
            .index_of(id)
            .expect("schedule_in_range: unknown or deregistered timer id");

        let node = self.arena.node(index);
        if node.pos.is_some() {
            let current = node.scheduled_at.wrapping_sub(self.now);
            if current >= start && current <= end {
                return;
            }
        }

        // Widen the alignment mask until start and end share a prefix; the
        // last mask step is then the coarsest granularity that still has a
        // boundary inside the window, and `end` rounded down to it is the
        // latest aligned tick in range.
        let mut mask: Tick = !0;
        while (start & mask) != (end & mask) {
            mask <<= WIDTH_BITS;
        }
        let mut delta = end & (mask >> WIDTH_BITS);
        if delta < start {
            // The bounds disagree in the top level's bits, so the mask
            // collapsed and the rounded tick fell below the window. No
            // aligned candidate exists; take the endpoint.
            delta = end;
        }

        self.schedule(id, delta);
    }

    /// Detach the timer from its slot, if any. Idempotent; a stale id or
    /// an unscheduled timer is a no-op.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(index) = self.arena.index_of(id) {
            self.unlink(index);
        }
    }

    /// Ticks until the earliest scheduled expiry, clamped to `max`.
    ///
    /// Returns `max` for an empty wheel and 0 while a partially drained
    /// tick is outstanding (there is due work right now).
    pub fn ticks_to_next_event(&self, max: Tick) -> Tick {
        if self.pending_ticks > 0 {
            return 0;
        }

        for level in 0..NUM_LEVELS {
            let level_now = self.level_now(level);
            let start = ((level_now.wrapping_add(1)) & MASK) as usize;
            let Some(slot) = self.levels[level].next_occupied_from(start) else {
                continue;
            };

            let mut min = Tick::MAX;

            // The scan passing slot 0 stands in for a coarser-level
            // advance, so the slot about to cascade from the next level up
            // competes with this level's find. Exception: events already
            // in level 0's slot 0 fire exactly at the boundary, which
            // nothing cascading through that boundary can beat.
            let crosses_zero = slot < start || start == 0;
            let skip_up = level == 0 && slot == 0;
            if crosses_zero && !skip_up && level + 1 < NUM_LEVELS {
                let up_slot = ((self.level_now(level + 1).wrapping_add(1)) & MASK) as usize;
                min = min.min(self.min_expiry_in(level + 1, up_slot));
            }

            min = min.min(self.min_expiry_in(level, slot));
            return (min - self.now).min(max);
        }

        max
    }

    /// Advance the clock by `delta` ticks, firing every timer that comes
    /// due, in tick order.
    ///
    /// # Panics
    ///
    /// Panics if `delta == 0` and no partially drained tick is
    /// outstanding. Callback panics propagate unchanged; the wheel stays
    /// consistent (the firing timer was already detached) but its payload
    /// is lost to the unwind.
    pub fn advance(&mut self, delta: Tick, ctx: &mut T::Context)
    where
        T: Timer,
    {
        self.advance_bounded(delta, usize::MAX, ctx);
    }

    /// Advance by `delta` ticks, firing at most `max_execute` callbacks.
    ///
    /// Returns true when every tick owed so far has fully drained. When
    /// the budget runs out mid-tick this returns false with the clock
    /// already on the unfinished tick; call again with `delta = 0` to keep
    /// draining it (each continuation gets a fresh budget). A `delta > 0`
    /// continuation first finishes the outstanding tick, then advances
    /// `delta` further ticks.
    ///
    /// Timers scheduled by callbacks take effect immediately, including
    /// for ticks this very call has yet to reach.
    ///
    /// # Panics
    ///
    /// Panics if `max_execute == 0`, or if `delta == 0` with no
    /// outstanding partial tick.
    pub fn advance_bounded(&mut self, delta: Tick, max_execute: usize, ctx: &mut T::Context) -> bool
    where
        T: Timer,
    {
        assert!(
            delta > 0 || self.pending_ticks > 0,
            "advance: delta must be positive unless finishing a partial tick"
        );
        assert!(max_execute > 0, "advance: max_execute must be positive");

        let mut budget = max_execute;

        if self.pending_ticks > 0 {
            // Resume the interrupted tick; the clock already points at it.
            self.pending_ticks = self.pending_ticks.wrapping_add(delta);
            if !self.drain_tick(&mut budget, ctx) {
                return false;
            }
            self.pending_ticks -= 1;
        } else {
            self.pending_ticks = delta;
        }

        while self.pending_ticks > 0 {
            self.now = self.now.wrapping_add(1);
            if !self.drain_tick(&mut budget, ctx) {
                return false;
            }
            self.pending_ticks -= 1;
        }
        true
    }

    // ==================== Internals ====================

    #[inline(always)]
    fn level_now(&self, level: usize) -> Tick {
        self.now >> (WIDTH_BITS * level as u32)
    }

    /// Smallest absolute expiry among the events linked in one slot.
    fn min_expiry_in(&self, level: usize, slot: usize) -> Tick {
        let mut min = Tick::MAX;
        let mut cur = self.levels[level].head(slot);
        while cur != NIL {
            let node = self.arena.node(cur);
            min = min.min(node.scheduled_at);
            cur = node.next;
        }
        min
    }

    /// Link the entry into the slot owning `delta` ticks from now.
    ///
    /// Walks outward while the delay exceeds the level's reach. The
    /// `level_now & MASK` correction folds in how far the finer level has
    /// progressed through the coarser slot's span; without it a delay
    /// near a span boundary lands one coarse slot early.
    fn place(&mut self, index: u32, delta: Tick) {
        debug_assert!(delta > 0);

        let mut delta = delta;
        let mut level_now = self.now;
        let mut level = 0usize;
        while delta >= NUM_SLOTS as Tick && level + 1 < NUM_LEVELS {
            delta = delta.wrapping_add(level_now & MASK) >> WIDTH_BITS;
            level_now >>= WIDTH_BITS;
            level += 1;
        }

        let slot = ((level_now.wrapping_add(delta)) & MASK) as usize;
        self.relink(
            index,
            Some(SlotPos {
                level: level as u8,
                slot: slot as u8,
            }),
        );
    }

    /// Move the entry to `new_pos` (or detach it for `None`). No-op when
    /// it is already there, which is what makes rescheduling to the same
    /// slot free.
    fn relink(&mut self, index: u32, new_pos: Option<SlotPos>) {
        if self.arena.node(index).pos == new_pos {
            return;
        }
        self.unlink(index);
        if let Some(pos) = new_pos {
            self.link(index, pos);
        }
    }

    fn link(&mut self, index: u32, pos: SlotPos) {
        let head = self.levels[pos.level as usize].head(pos.slot as usize);
        {
            let node = self.arena.node_mut(index);
            debug_assert!(node.pos.is_none(), "linking an already linked entry");
            node.pos = Some(pos);
            node.prev = NIL;
            node.next = head;
        }
        if head != NIL {
            self.arena.node_mut(head).prev = index;
        }
        self.levels[pos.level as usize].set_head(pos.slot as usize, index);
    }

    fn unlink(&mut self, index: u32) {
        let node = self.arena.node_mut(index);
        let Some(pos) = node.pos.take() else {
            return;
        };
        let prev = node.prev;
        let next = node.next;
        node.prev = NIL;
        node.next = NIL;

        if next != NIL {
            self.arena.node_mut(next).prev = prev;
        }
        if prev != NIL {
            self.arena.node_mut(prev).next = next;
        } else {
            self.levels[pos.level as usize].set_head(pos.slot as usize, next);
        }
    }

    /// Detach and return the head entry of a slot.
    fn pop_head(&mut self, level: usize, slot: usize) -> Option<u32> {
        let head = self.levels[level].head(slot);
        if head == NIL {
            return None;
        }
        let node = self.arena.node_mut(head);
        let next = node.next;
        node.pos = None;
        node.prev = NIL;
        node.next = NIL;
        if next != NIL {
            self.arena.node_mut(next).prev = NIL;
        }
        self.levels[level].set_head(slot, next);
        Some(head)
    }

    #[inline(always)]
    fn drain_tick(&mut self, budget: &mut usize, ctx: &mut T::Context) -> bool
    where
        T: Timer,
    {
        self.drain_level(0, budget, ctx)
    }

    /// Drain one level's current slot, cascading the coarser level first
    /// whenever this level has wrapped to slot 0. Returns false when the
    /// budget ran out; the slot keeps whatever was not yet popped.
    fn drain_level(&mut self, level: usize, budget: &mut usize, ctx: &mut T::Context) -> bool
    where
        T: Timer,
    {
        debug_assert!(
            level == 0 || (self.now & ((1 << (WIDTH_BITS * level as u32)) - 1)) == 0,
            "cascading a level off its span boundary"
        );

        let slot = (self.level_now(level) & MASK) as usize;
        if slot == 0 && level + 1 < NUM_LEVELS {
            if !self.drain_level(level + 1, budget, ctx) {
                return false;
            }
        }

        while let Some(index) = self.pop_head(level, slot) {
            if level == 0 {
                if !self.execute(index, budget, ctx) {
                    return false;
                }
            } else {
                let at = self.arena.node(index).scheduled_at;
                if self.now >= at {
                    // Expiry right on the cascade boundary: fire, don't hop.
                    if !self.execute(index, budget, ctx) {
                        return false;
                    }
                } else {
                    self.place(index, at - self.now);
                }
            }
        }
        true
    }

    /// Run one callback. Returns false when this fire spent the budget.
    fn execute(&mut self, index: u32, budget: &mut usize, ctx: &mut T::Context) -> bool
    where
        T: Timer,
    {
        let id = self.arena.id_at(index);
        let Some(mut timer) = self.arena.begin_fire(index) else {
            // Husk left by a panicked callback; drains as a no-op.
            return true;
        };
        debug_assert_eq!(self.arena.node(index).scheduled_at, self.now);

        timer.fire(self, id, ctx);
        self.arena.finish_fire(id, timer);

        *budget -= 1;
        *budget != 0
    }
}
