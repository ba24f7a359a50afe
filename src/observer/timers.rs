// src/observer/timers.rs

//! Named, cancellable one-shot timers feeding the event queue.
//!
//! Each timer is a sleeper thread holding a cancel flag. Re-adding a name
//! swaps the flag in the registry and trips the old one, so at most one
//! timer per name can ever deliver. Cancellation is best-effort: a timer
//! that already pushed its event cannot be recalled. Precision is bounded
//! by the scheduler; nothing here compensates for drift.

use super::queue::{Event, EventQueue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::error;

/// One-shot timers that push events onto an [`EventQueue`].
pub struct TimerSet {
    queue: Arc<EventQueue>,
    named: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl TimerSet {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            named: Mutex::new(HashMap::new()),
        }
    }

    /// Start a timer under `name`, cancelling any previous timer with the
    /// same name. After `delay` the `event` is pushed onto the queue.
    pub fn add_named(&self, name: &str, delay: Duration, event: Event) {
        let cancelled = Arc::new(AtomicBool::new(false));
        if let Some(old) = self
            .named
            .lock()
            .unwrap()
            .insert(name.to_string(), cancelled.clone())
        {
            old.store(true, Ordering::Release);
        }
        self.spawn(name, delay, event, cancelled);
    }

    /// Anonymous one-shot timer; cannot be cancelled.
    pub fn add_once(&self, delay: Duration, event: Event) {
        self.spawn("anon", delay, event, Arc::new(AtomicBool::new(false)));
    }

    fn spawn(&self, name: &str, delay: Duration, event: Event, cancelled: Arc<AtomicBool>) {
        let queue = self.queue.clone();
        let spawned = thread::Builder::new()
            .name(format!("timer-{}", name))
            .spawn(move || {
                thread::sleep(delay);
                if !cancelled.load(Ordering::Acquire) {
                    queue.push(event);
                }
            });
        if let Err(e) = spawned {
            error!("failed to spawn timer thread: {}", e);
        }
    }

    /// Number of names currently registered (fired timers stay registered
    /// until superseded).
    pub fn named_len(&self) -> usize {
        self.named.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_marker(seen: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Event {
        let seen = seen.clone();
        Event::Call(Box::new(move || {
            seen.lock().unwrap().push(tag);
        }))
    }

    #[test]
    fn test_timer_fires_event() {
        let queue = Arc::new(EventQueue::new());
        let timers = TimerSet::new(queue.clone());
        timers.add_once(Duration::from_millis(20), Event::IsAlive);
        let popped = queue.pop_or_wait(Duration::from_secs(5));
        assert_eq!(popped.map(|e| e.kind()), Some("is_alive"));
    }

    #[test]
    fn test_named_timer_supersession() {
        let queue = Arc::new(EventQueue::new());
        let timers = TimerSet::new(queue.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        timers.add_named("X", Duration::from_millis(60), call_marker(&seen, "first"));
        timers.add_named("X", Duration::from_millis(60), call_marker(&seen, "second"));
        assert_eq!(timers.named_len(), 1);

        // wait long enough for both sleepers to have run their course
        thread::sleep(Duration::from_millis(200));
        while let Some(event) = queue.pop() {
            if let Event::Call(f) = event {
                f();
            }
        }
        assert_eq!(*seen.lock().unwrap(), ["second"]);
    }

    #[test]
    fn test_distinct_names_both_fire() {
        let queue = Arc::new(EventQueue::new());
        let timers = TimerSet::new(queue.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        timers.add_named("A", Duration::from_millis(20), call_marker(&seen, "a"));
        timers.add_named("B", Duration::from_millis(20), call_marker(&seen, "b"));
        thread::sleep(Duration::from_millis(150));
        while let Some(event) = queue.pop() {
            if let Event::Call(f) = event {
                f();
            }
        }
        let mut fired = seen.lock().unwrap().clone();
        fired.sort();
        assert_eq!(fired, ["a", "b"]);
    }
}
