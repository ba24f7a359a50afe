// src/failmanager.rs

//! Per-jail failure accounting.
//!
//! A fail manager accumulates repeated failures per ip inside a sliding
//! find window and hands out ban-ready tickets once the retry threshold is
//! crossed. The observer only sees the [`FailManager`] trait; the concrete
//! [`SlidingFailManager`] is owned by the jail.

use crate::ticket::FailTicket;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

/// The observer's view of a jail's failure accumulator.
pub trait FailManager: Send + Sync {
    /// Failures required before an ip is banned.
    fn max_retry(&self) -> u32;

    /// Record `count` additional failures carried by `ticket`. With
    /// `force` the count is applied even when the previous failures for
    /// this ip have slipped out of the find window. Returns the retry
    /// count after the update.
    fn add_failure(&self, ticket: FailTicket, count: u32, force: bool) -> u32;

    /// Pop a ban-ready ticket for `ip`, or `None` when there is nothing
    /// (more) to ban for it.
    fn to_ban(&self, ip: &str) -> Option<FailTicket>;

    /// Drop accounting for ips whose last failure is older than the find
    /// window at `now`.
    fn cleanup(&self, now: i64);
}

#[derive(Debug)]
struct FailEntry {
    retries: u32,
    last_time: i64,
    ticket: FailTicket,
}

/// Sliding-window failure counter.
#[derive(Debug)]
pub struct SlidingFailManager {
    max_retry: AtomicU32,
    find_time: AtomicI64,
    entries: Mutex<HashMap<String, FailEntry>>,
}

impl SlidingFailManager {
    pub fn new(max_retry: u32, find_time: i64) -> Self {
        Self {
            max_retry: AtomicU32::new(max_retry),
            find_time: AtomicI64::new(find_time),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_max_retry(&self, max_retry: u32) {
        self.max_retry.store(max_retry, Ordering::Relaxed);
    }

    pub fn find_time(&self) -> i64 {
        self.find_time.load(Ordering::Relaxed)
    }

    pub fn set_find_time(&self, find_time: i64) {
        self.find_time.store(find_time, Ordering::Relaxed);
    }

    /// Current retry count for `ip` (0 when unknown).
    pub fn fail_count(&self, ip: &str) -> u32 {
        self.entries
            .lock()
            .unwrap()
            .get(ip)
            .map_or(0, |e| e.retries)
    }

    /// Number of ips currently tracked.
    pub fn size(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl FailManager for SlidingFailManager {
    fn max_retry(&self) -> u32 {
        self.max_retry.load(Ordering::Relaxed)
    }

    fn add_failure(&self, ticket: FailTicket, count: u32, force: bool) -> u32 {
        let find_time = self.find_time();
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(ticket.ip().to_string())
            .or_insert_with(|| FailEntry {
                retries: 0,
                last_time: ticket.time(),
                ticket: ticket.clone(),
            });
        // outside the find window the old count is stale unless forced
        if !force && entry.last_time + find_time < ticket.time() {
            entry.retries = 0;
        }
        entry.retries += count;
        if ticket.time() >= entry.last_time {
            entry.last_time = ticket.time();
            entry.ticket = ticket;
        }
        entry.retries
    }

    fn to_ban(&self, ip: &str) -> Option<FailTicket> {
        let max_retry = self.max_retry();
        let mut entries = self.entries.lock().unwrap();
        let ready = entries.get(ip).is_some_and(|e| e.retries >= max_retry);
        if !ready {
            return None;
        }
        let entry = entries.remove(ip)?;
        let mut ticket = entry.ticket;
        ticket.set_time(entry.last_time);
        Some(ticket)
    }

    fn cleanup(&self, now: i64) {
        let find_time = self.find_time();
        self.entries
            .lock()
            .unwrap()
            .retain(|_, e| e.last_time + find_time >= now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(ip: &str, time: i64) -> FailTicket {
        FailTicket::new(ip, time)
    }

    #[test]
    fn test_threshold_reached_by_repeats() {
        let fm = SlidingFailManager::new(3, 600);
        assert_eq!(fm.add_failure(ticket("10.0.0.1", 100), 1, false), 1);
        assert_eq!(fm.add_failure(ticket("10.0.0.1", 110), 1, false), 2);
        assert!(fm.to_ban("10.0.0.1").is_none());
        assert_eq!(fm.add_failure(ticket("10.0.0.1", 120), 1, false), 3);

        let banned = fm.to_ban("10.0.0.1").unwrap();
        assert_eq!(banned.ip(), "10.0.0.1");
        assert_eq!(banned.time(), 120);
        // drained
        assert!(fm.to_ban("10.0.0.1").is_none());
        assert_eq!(fm.fail_count("10.0.0.1"), 0);
    }

    #[test]
    fn test_window_resets_unforced_counts() {
        let fm = SlidingFailManager::new(3, 600);
        fm.add_failure(ticket("10.0.0.2", 100), 2, false);
        // next failure arrives long after the window; count restarts at 1
        assert_eq!(fm.add_failure(ticket("10.0.0.2", 2000), 1, false), 1);
        // forced increments ignore the window (observer escalation path)
        assert_eq!(fm.add_failure(ticket("10.0.0.2", 9000), 4, true), 5);
        assert!(fm.to_ban("10.0.0.2").is_some());
    }

    #[test]
    fn test_cleanup_drops_stale_entries() {
        let fm = SlidingFailManager::new(5, 600);
        fm.add_failure(ticket("10.0.0.3", 100), 1, false);
        fm.add_failure(ticket("10.0.0.4", 900), 1, false);
        assert_eq!(fm.size(), 2);
        fm.cleanup(1000);
        assert_eq!(fm.size(), 1);
        assert_eq!(fm.fail_count("10.0.0.4"), 1);
    }
}
