//! Timer queue: one-shot and periodic callbacks ordered by due time.
//!
//! Pure bookkeeping; the event loop supplies `now` and invokes callbacks. A
//! callback is taken out of the queue while it runs so it may schedule or cancel
//! other timers (including itself) without aliasing the queue.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

/// Timer callback. For periodic timers, returning `false` stops the timer.
pub type TimerCallback = Box<dyn FnMut() -> bool>;

const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TimerId(u64);

struct Timer {
    due: Instant,
    period: Option<Duration>,
    /// `None` while the callback is running.
    callback: Option<TimerCallback>,
}

#[derive(Default)]
pub struct Scheduler {
    timers: HashMap<TimerId, Timer>,
    queue: BTreeSet<(Instant, TimerId)>,
    next_id: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a timer due `delay` after `now`. Periodic timers repeat every `delay`.
    pub fn schedule(
        &mut self,
        now: Instant,
        delay: Duration,
        periodic: bool,
        callback: TimerCallback,
    ) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let due = now + delay;
        self.timers.insert(
            id,
            Timer {
                due,
                period: periodic.then_some(delay),
                callback: Some(callback),
            },
        );
        self.queue.insert((due, id));
        id
    }

    /// Remove a timer. Returns false if it already fired (one-shot) or never existed.
    /// Cancelling a timer from inside its own callback works: `finish` drops it.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(t) => {
                self.queue.remove(&(t.due, id));
                true
            }
            None => false,
        }
    }

    /// Earliest due time of any queued timer.
    pub fn next_due(&self) -> Option<Instant> {
        self.queue.first().map(|(due, _)| *due)
    }

    /// Pop the earliest timer due at or before `now`, handing out its callback.
    /// The caller must give it back through `finish`.
    pub fn take_due(&mut self, now: Instant) -> Option<(TimerId, TimerCallback)> {
        let &(due, id) = self.queue.first()?;
        if due > now {
            return None;
        }
        self.queue.remove(&(due, id));
        let callback = self.timers.get_mut(&id)?.callback.take()?;
        Some((id, callback))
    }

    /// Return a callback after it ran. One-shot timers, timers cancelled while
    /// running and periodic timers whose callback returned `false` are dropped;
    /// other periodic timers are requeued on their original phase.
    pub fn finish(&mut self, id: TimerId, callback: TimerCallback, keep: bool, now: Instant) {
        let Some(timer) = self.timers.get_mut(&id) else {
            return;
        };
        match timer.period {
            Some(period) if keep && !period.is_zero() => {
                let late = now.saturating_duration_since(timer.due);
                let skip = Duration::from_nanos((late.as_nanos() % period.as_nanos()) as u64);
                timer.due = now + period - skip;
                timer.callback = Some(callback);
                self.queue.insert((timer.due, id));
            }
            Some(_) if keep => {
                // Zero period: run again on the next loop pass, not in this one.
                timer.due = now + MIN_PERIOD;
                timer.callback = Some(callback);
                self.queue.insert((timer.due, id));
            }
            _ => {
                self.timers.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }
}
