//! Virtual-time timer queue.
//!
//! Timers fire in expiry order; timers sharing an expiry fire in allocation order, which keeps
//! every run reproducible. The scheduler never calls devices itself: [`Scheduler::pop_due`]
//! hands the next due timer to the machine, which routes it to its owner with no scheduler
//! borrow held.

use std::cell::RefCell;
use std::rc::Rc;

use crate::context::SharedContext;
use crate::timing::Time;

/// Shared handle to the scheduler.
pub type SharedScheduler = Rc<RefCell<Scheduler>>;

/// Handle of one allocated timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct TimerId(u32);

impl TimerId {
    /// Allocation index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone)]
struct TimerSlot {
    name: String,
    enabled: bool,
    start: Time,
    expiry: Time,
    period: Time,
    param: u32,
}

/// Timer allocation and ordering.
#[derive(Debug)]
pub struct Scheduler {
    ctx: SharedContext,
    timers: Vec<TimerSlot>,
}

impl Scheduler {
    /// Creates an empty scheduler reading time from `ctx`.
    #[must_use]
    pub const fn new(ctx: SharedContext) -> Self {
        Self {
            ctx,
            timers: Vec::new(),
        }
    }

    /// Creates a shared scheduler.
    #[must_use]
    pub fn shared(ctx: SharedContext) -> SharedScheduler {
        Rc::new(RefCell::new(Self::new(ctx)))
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.ctx.now()
    }

    /// Machine context.
    #[must_use]
    pub const fn context(&self) -> &SharedContext {
        &self.ctx
    }

    /// Allocates a disabled timer.
    pub fn allocate(&mut self, name: &str) -> TimerId {
        #[allow(clippy::cast_possible_truncation)]
        let id = TimerId(self.timers.len() as u32);
        self.timers.push(TimerSlot {
            name: name.to_owned(),
            enabled: false,
            start: Time::ZERO,
            expiry: Time::NEVER,
            period: Time::NEVER,
            param: 0,
        });
        id
    }

    /// Arms `id` to fire `delay` from now with `param`, then every `period` unless `period` is
    /// [`Time::NEVER`] or zero.
    ///
    /// Arming a timer earlier than the end of the running timeslice asks the executing device
    /// to yield so the timer fires on time.
    pub fn adjust(&mut self, id: TimerId, delay: Time, param: u32, period: Time) {
        let now = self.ctx.now();
        let Some(slot) = self.timers.get_mut(id.0 as usize) else {
            return;
        };
        let expiry = now.saturating_add(delay);
        slot.enabled = !expiry.is_never();
        slot.start = now;
        slot.expiry = expiry;
        slot.period = if period == Time::ZERO { Time::NEVER } else { period };
        slot.param = param;
        log::trace!(
            target: "emu_core::scheduler",
            "timer '{}' armed for {} ps (param {param})",
            slot.name,
            expiry.as_picos()
        );
        if slot.enabled && expiry < self.ctx.slice_end() {
            self.ctx.request_abort();
        }
    }

    /// Disarms a timer. Cancelling a disarmed timer does nothing.
    pub fn cancel(&mut self, id: TimerId) {
        if let Some(slot) = self.timers.get_mut(id.0 as usize) {
            slot.enabled = false;
            slot.expiry = Time::NEVER;
        }
    }

    /// Whether the timer is armed.
    #[must_use]
    pub fn enabled(&self, id: TimerId) -> bool {
        self.timers.get(id.0 as usize).is_some_and(|slot| slot.enabled)
    }

    /// Time until the timer fires, or [`Time::NEVER`] when disarmed.
    #[must_use]
    pub fn remaining(&self, id: TimerId) -> Time {
        match self.timers.get(id.0 as usize) {
            Some(slot) if slot.enabled => slot.expiry.saturating_sub(self.ctx.now()),
            _ => Time::NEVER,
        }
    }

    /// Time since the timer was last armed or fired.
    #[must_use]
    pub fn elapsed(&self, id: TimerId) -> Time {
        self.timers
            .get(id.0 as usize)
            .map_or(Time::ZERO, |slot| self.ctx.now().saturating_sub(slot.start))
    }

    /// Parameter the timer will fire with.
    #[must_use]
    pub fn param(&self, id: TimerId) -> u32 {
        self.timers.get(id.0 as usize).map_or(0, |slot| slot.param)
    }

    /// Name given at allocation.
    #[must_use]
    pub fn name(&self, id: TimerId) -> Option<&str> {
        self.timers.get(id.0 as usize).map(|slot| slot.name.as_str())
    }

    /// Earliest armed expiry, or [`Time::NEVER`].
    #[must_use]
    pub fn next_expiry(&self) -> Time {
        self.timers
            .iter()
            .filter(|slot| slot.enabled)
            .map(|slot| slot.expiry)
            .min()
            .unwrap_or(Time::NEVER)
    }

    /// Removes the earliest timer due at or before `limit`, advancing machine time to its
    /// expiry. Periodic timers are re-armed; one-shot timers are disarmed.
    pub fn pop_due(&mut self, limit: Time) -> Option<(TimerId, u32)> {
        let (index, slot) = self
            .timers
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| slot.enabled && slot.expiry <= limit)
            .min_by_key(|(index, slot)| (slot.expiry, *index))?;
        let fired = slot.expiry;
        let param = slot.param;
        slot.start = fired;
        if slot.period.is_never() {
            slot.enabled = false;
            slot.expiry = Time::NEVER;
        } else {
            slot.expiry = fired.saturating_add(slot.period);
        }
        if fired > self.ctx.now() {
            self.ctx.set_base_time(fired);
        }
        #[allow(clippy::cast_possible_truncation)]
        Some((TimerId(index as u32), param))
    }
}
