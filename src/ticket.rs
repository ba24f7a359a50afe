// src/ticket.rs

//! Fail tickets: one detected offence or ban, tied to a single ip.

use std::fmt;
use std::sync::{Arc, Mutex};

/// A ban time of `-1` marks a permanent ban.
pub const PERMANENT: i64 = -1;

/// One detected failure or ban for a single ip.
///
/// Tickets are created by filters when a log line matches, copied into the
/// ban store when a ban is enforced, and reconstructed from the store when
/// a jail restarts. The observer treats `ip` and `matches` as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailTicket {
    ip: String,
    time: i64,
    ban_time: Option<i64>,
    ban_count: u32,
    matches: Vec<String>,
    restored: bool,
}

/// A ticket shared between its producer and the observer thread.
pub type SharedTicket = Arc<Mutex<FailTicket>>;

impl FailTicket {
    /// Create a fresh ticket for `ip` observed at `time`.
    pub fn new(ip: impl Into<String>, time: i64) -> Self {
        Self {
            ip: ip.into(),
            time,
            ban_time: None,
            ban_count: 0,
            matches: Vec::new(),
            restored: false,
        }
    }

    /// Wrap this ticket for cross-thread sharing.
    pub fn into_shared(self) -> SharedTicket {
        Arc::new(Mutex::new(self))
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Seconds since epoch of the triggering event.
    pub fn time(&self) -> i64 {
        self.time
    }

    pub fn set_time(&mut self, time: i64) {
        self.time = time;
    }

    /// Explicit ban time in seconds; `None` means "jail default",
    /// [`PERMANENT`] means forever.
    pub fn ban_time(&self) -> Option<i64> {
        self.ban_time
    }

    pub fn set_ban_time(&mut self, ban_time: Option<i64>) {
        self.ban_time = ban_time;
    }

    /// How many times this ip has been banned before.
    pub fn ban_count(&self) -> u32 {
        self.ban_count
    }

    pub fn set_ban_count(&mut self, count: u32) {
        self.ban_count = count;
    }

    pub fn matches(&self) -> &[String] {
        &self.matches
    }

    pub fn set_matches(&mut self, matches: Vec<String>) {
        self.matches = matches;
    }

    /// Drop the matched log lines to save memory before the ticket is
    /// re-injected into a fail manager.
    pub fn clear_matches(&mut self) {
        self.matches.clear();
    }

    /// True when the ticket was materialised from the ban store rather
    /// than freshly observed.
    pub fn restored(&self) -> bool {
        self.restored
    }

    pub fn set_restored(&mut self, restored: bool) {
        self.restored = restored;
    }

    /// Whether a ban starting at this ticket's time has expired at `now`.
    /// `default_ban_time` applies when the ticket carries none.
    pub fn is_timed_out(&self, now: i64, default_ban_time: i64) -> bool {
        let ban_time = self.ban_time.unwrap_or(default_ban_time);
        if ban_time == PERMANENT {
            return false;
        }
        self.time + ban_time <= now
    }
}

impl fmt::Display for FailTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FailTicket: ip={} time={} bantime={} bancount={} matches={}",
            self.ip,
            self.time,
            self.ban_time.map_or("-".to_string(), |t| t.to_string()),
            self.ban_count,
            self.matches.len()
        )
    }
}
