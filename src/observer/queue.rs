// src/observer/queue.rs

//! The observer's event queue.
//!
//! A plain FIFO behind one mutex, paired with a condvar used as a pulse
//! notifier: producers push and pulse, the single consumer waits with a
//! bound. The pending-items check runs under the same lock as the wait,
//! so a pulse arriving between two waits is never lost. The queue is
//! unbounded; producers pace themselves.

use crate::banstore::BanStore;
use crate::failmanager::FailManager;
use crate::jail::Jail;
use crate::ticket::{FailTicket, SharedTicket};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// One queued observer event.
pub enum Event {
    /// A filter saw a failure for an ip; check the ban history and
    /// possibly inflate the retry count.
    FailureFound {
        manager: Arc<dyn FailManager>,
        jail: Arc<dyn Jail>,
        ticket: FailTicket,
    },
    /// A ban was enforced; escalate the ban time and persist it.
    BanFound {
        ticket: SharedTicket,
        jail: Arc<dyn Jail>,
        ban_time: i64,
    },
    /// Generic callable, used by tests and timers.
    Call(Box<dyn FnOnce() + Send>),
    /// Install the ban store handle.
    DbSet(Arc<BanStore>),
    /// Purge expired history and re-arm the purge timer.
    DbPurge,
    /// Self-check noise.
    IsAlive,
    IsActive,
    /// Drain marker pushed by `stop()`.
    Shutdown,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::FailureFound { .. } => "failureFound",
            Event::BanFound { .. } => "banFound",
            Event::Call(_) => "call",
            Event::DbSet(_) => "db_set",
            Event::DbPurge => "db_purge",
            Event::IsAlive => "is_alive",
            Event::IsActive => "is_active",
            Event::Shutdown => "shutdown",
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// FIFO of observer events with a pulse notifier.
pub struct EventQueue {
    inner: Mutex<VecDeque<Event>>,
    notify: Condvar,
    /// Cleared on stop; late pulses become no-ops instead of waking a
    /// worker that no longer exists.
    armed: AtomicBool,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Condvar::new(),
            armed: AtomicBool::new(true),
        }
    }

    /// Append an event and pulse the notifier. Never blocks on the
    /// consumer.
    pub fn push(&self, event: Event) {
        self.inner.lock().unwrap().push_back(event);
        self.pulse();
    }

    /// Pop the head event without waiting.
    pub fn pop(&self) -> Option<Event> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Pop the head event, waiting up to `timeout` for one to arrive.
    pub fn pop_or_wait(&self, timeout: Duration) -> Option<Event> {
        let mut queue = self.inner.lock().unwrap();
        if let Some(event) = queue.pop_front() {
            return Some(event);
        }
        let (mut queue, _) = self.notify.wait_timeout(queue, timeout).unwrap();
        queue.pop_front()
    }

    /// Block up to `timeout` until the queue is non-empty. Returns whether
    /// events are pending. Used by the observer loop, which must not pop
    /// while paused.
    pub fn wait(&self, timeout: Duration) -> bool {
        let queue = self.inner.lock().unwrap();
        if !queue.is_empty() {
            return true;
        }
        let (queue, _) = self.notify.wait_timeout(queue, timeout).unwrap();
        !queue.is_empty()
    }

    /// Wake the consumer.
    pub fn pulse(&self) {
        if self.armed.load(Ordering::Acquire) {
            self.notify.notify_all();
        }
    }

    /// Disable future pulses (idempotent). Events may still be pushed and
    /// popped.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Re-enable pulses for a restarted consumer.
    pub fn rearm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
