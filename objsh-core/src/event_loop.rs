//! Cooperative event loop: flush, poll, dispatch, timers.
//!
//! There is one loop per `Sharer` and all state it touches lives on one thread.
//! A synchronous call is "run the loop until my reply is in"; while any such wait
//! is outstanding, inbound signals are deferred by the dispatcher and replayed in
//! small batches once the last wait ends.

use std::cell::{Cell, RefCell};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use crate::scheduler::{Scheduler, TimerId};
use crate::transport::{ConnectionId, Transport, TransportEvent};

/// Longest single poll; bounds how stale the stop flag and deferred work can get.
const MAX_POLL: Duration = Duration::from_millis(50);
/// Poll interval while bytes are still queued for a busy socket.
const WRITE_RETRY: Duration = Duration::from_millis(1);

/// Receives what the loop reads off the transport.
pub trait Dispatch {
    fn connection_opened(&self, conn: ConnectionId);
    /// One complete message. `waiting` is true while a synchronous call is
    /// outstanding; signal deliveries must then be deferred.
    fn process_message(&self, conn: ConnectionId, parts: Vec<Bytes>, waiting: bool);
    fn connection_lost(&self, conn: ConnectionId);
    /// Deliver up to `max` deferred signals.
    fn flush_deferred(&self, max: usize);
    fn has_deferred(&self) -> bool;
}

/// Condition a blocking `run` waits for.
pub trait WaitFor {
    fn is_satisfied(&self) -> bool;
}

impl<F: Fn() -> bool> WaitFor for F {
    fn is_satisfied(&self) -> bool {
        self()
    }
}

pub struct EventLoop {
    transport: Transport,
    scheduler: RefCell<Scheduler>,
    sync_waits: Cell<usize>,
    stop_generation: Cell<u64>,
    signal_batch: usize,
}

impl EventLoop {
    pub fn new(signal_batch: usize) -> Self {
        Self {
            transport: Transport::new(),
            scheduler: RefCell::new(Scheduler::new()),
            sync_waits: Cell::new(0),
            stop_generation: Cell::new(0),
            signal_batch: signal_batch.max(1),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Whether some caller is blocked in `run` waiting for a result.
    pub fn is_waiting(&self) -> bool {
        self.sync_waits.get() > 0
    }

    pub fn schedule(
        &self,
        delay: Duration,
        periodic: bool,
        callback: impl FnMut() -> bool + 'static,
    ) -> TimerId {
        self.scheduler
            .borrow_mut()
            .schedule(Instant::now(), delay, periodic, Box::new(callback))
    }

    pub fn cancel(&self, id: TimerId) -> bool {
        self.scheduler.borrow_mut().cancel(id)
    }

    /// Make every `run` currently in progress return at its next iteration.
    pub fn stop(&self) {
        self.stop_generation.set(self.stop_generation.get() + 1);
    }

    /// Drive the loop. With a non-empty `wait_for`, returns `true` as soon as every
    /// condition holds. Otherwise, or if the conditions never hold, runs until
    /// `timeout` (forever if `None`) or `stop` and returns `false`.
    pub async fn run<D: Dispatch + ?Sized>(
        &self,
        handler: &D,
        timeout: Option<Duration>,
        wait_for: &[&dyn WaitFor],
    ) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let generation = self.stop_generation.get();
        let _guard = (!wait_for.is_empty()).then(|| WaitGuard::enter(&self.sync_waits));
        let satisfied = || !wait_for.is_empty() && wait_for.iter().all(|w| w.is_satisfied());

        if satisfied() {
            self.transport.flush();
            return true;
        }
        loop {
            self.transport.flush();

            // Older deferred signals go before anything read in this pass.
            if !self.is_waiting() && handler.has_deferred() {
                handler.flush_deferred(self.signal_batch);
            }

            let events = self.transport.poll(self.poll_budget(handler, deadline)).await;
            for event in events {
                match event {
                    TransportEvent::Connected(conn) => handler.connection_opened(conn),
                    TransportEvent::Message(conn, parts) => {
                        handler.process_message(conn, parts, self.is_waiting())
                    }
                    TransportEvent::Closed(conn) => handler.connection_lost(conn),
                }
            }

            self.run_timers();

            if satisfied() {
                self.transport.flush();
                return true;
            }
            if self.stop_generation.get() != generation
                || deadline.is_some_and(|d| Instant::now() >= d)
            {
                self.transport.flush();
                return false;
            }
        }
    }

    /// How long the next poll may block: until the deadline or the next timer,
    /// never longer than `MAX_POLL`, and not at all if there is deferred work.
    fn poll_budget<D: Dispatch + ?Sized>(&self, handler: &D, deadline: Option<Instant>) -> Duration {
        let now = Instant::now();
        let mut budget = MAX_POLL;
        if let Some(d) = deadline {
            budget = budget.min(d.saturating_duration_since(now));
        }
        if let Some(due) = self.scheduler.borrow().next_due() {
            budget = budget.min(due.saturating_duration_since(now));
        }
        if self.transport.has_pending_writes() {
            budget = budget.min(WRITE_RETRY);
        }
        if !self.is_waiting() && handler.has_deferred() {
            budget = Duration::ZERO;
        }
        budget
    }

    fn run_timers(&self) {
        let now = Instant::now();
        loop {
            let Some((id, mut callback)) = self.scheduler.borrow_mut().take_due(now) else {
                break;
            };
            trace!(?id, "timer fired");
            let keep = callback();
            self.scheduler
                .borrow_mut()
                .finish(id, callback, keep, Instant::now());
        }
    }
}

/// Counts a blocking wait for as long as it lives, even if the waiting future is
/// dropped early.
struct WaitGuard<'a> {
    count: &'a Cell<usize>,
}

impl<'a> WaitGuard<'a> {
    fn enter(count: &'a Cell<usize>) -> Self {
        count.set(count.get() + 1);
        Self { count }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.count.set(self.count.get().saturating_sub(1));
    }
}
