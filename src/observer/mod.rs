// src/observer/mod.rs

//! The observer: a single-threaded event engine that reacts to failure
//! and ban notifications from many concurrent jails, escalates repeat
//! offenders against the persistent ban history, and purges that history
//! on a schedule.
//!
//! Producers (filters, actions, timers, the control server) push events
//! onto the queue from any thread; exactly one worker drains it, so no
//! handler is ever re-entered. Handler failures are logged and swallowed:
//! a malformed ticket must never take the daemon down.

pub mod queue;
pub mod timers;

pub use queue::{Event, EventQueue};
pub use timers::TimerSet;

use crate::banstore::BanStore;
use crate::bantime::BanTimeIncr;
use crate::clock;
use crate::error::Result;
use crate::failmanager::FailManager;
use crate::jail::Jail;
use crate::ticket::{FailTicket, SharedTicket, PERMANENT};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Name of the recurring history-purge timer.
const DB_PURGE_TIMER: &str = "DB_PURGE";

/// Default purge cadence in seconds.
const DB_PURGE_INTERVAL: i64 = 60 * 60;

/// Upper bound on one notifier wait; service work could piggyback on this
/// tick without needing the queue.
const SLEEP_TIME: Duration = Duration::from_secs(60);

/// Poll step for the test-support waits.
const POLL_STEP: Duration = Duration::from_millis(100);

/// Single-threaded ban escalation engine.
pub struct Observer {
    queue: Arc<EventQueue>,
    timers: TimerSet,
    active: AtomicBool,
    started: AtomicBool,
    paused: AtomicBool,
    idle: AtomicBool,
    db: Mutex<Option<Arc<BanStore>>>,
    db_purge_interval: AtomicI64,
    me: Weak<Observer>,
}

impl Observer {
    pub fn new() -> Arc<Self> {
        let queue = Arc::new(EventQueue::new());
        Arc::new_cyclic(|me| Self {
            timers: TimerSet::new(queue.clone()),
            queue,
            active: AtomicBool::new(false),
            started: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            idle: AtomicBool::new(false),
            db: Mutex::new(None),
            db_purge_interval: AtomicI64::new(DB_PURGE_INTERVAL),
            me: me.clone(),
        })
    }

    // -----------------------------------------------------------------
    // Event API
    // -----------------------------------------------------------------

    /// Enqueue an event for the worker.
    pub fn add(&self, event: Event) {
        self.queue.push(event);
    }

    /// Schedule `event` in `delay`, superseding any timer with the same
    /// name.
    pub fn add_named_timer(&self, name: &str, delay: Duration, event: Event) {
        self.timers.add_named(name, delay, event);
    }

    /// Schedule `event` in `delay` anonymously.
    pub fn add_timer(&self, delay: Duration, event: Event) {
        self.timers.add_once(delay, event);
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Spawn the worker. Idempotent; a second call while active is a
    /// no-op.
    pub fn start(&self) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(observer) = self.me.upgrade() else {
            return;
        };
        self.queue.rearm();
        self.started.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("observer".to_string())
            .spawn(move || observer.run());
        if let Err(e) = spawned {
            error!("failed to spawn observer worker: {}", e);
            self.active.store(false, Ordering::SeqCst);
        }
    }

    /// Ask the worker to drain and exit; waits up to 5 s for the queue to
    /// empty.
    pub fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        info!("Observer stop ...");
        self.active.store(false, Ordering::SeqCst);
        // a shutdown marker makes the drain observable via wait_empty
        self.queue.push(Event::Shutdown);
        self.queue.pulse();
        self.queue.disarm();
        self.wait_empty(Duration::from_secs(5));
    }

    /// While paused the worker stays alive but processes nothing; timers
    /// keep firing and events accumulate. Unpausing pulses the notifier.
    pub fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::SeqCst) == paused {
            return;
        }
        if !paused {
            self.queue.pulse();
        }
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        true
    }

    /// Whether events are pending on the queue.
    pub fn is_full(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Poll until the queue is empty or `timeout` elapses. Returns whether
    /// it emptied.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_full() {
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL_STEP);
        }
        !self.is_full()
    }

    /// Poll until the worker reports idle or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        thread::sleep(Duration::from_millis(1));
        if self.idle.load(Ordering::SeqCst) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        while !self.idle.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(POLL_STEP);
        }
        self.idle.load(Ordering::SeqCst)
    }

    /// Purge cadence for the recurring history sweep.
    pub fn set_db_purge_interval(&self, seconds: i64) {
        self.db_purge_interval.store(seconds, Ordering::Relaxed);
    }

    fn purge_delay(&self) -> Duration {
        Duration::from_secs(self.db_purge_interval.load(Ordering::Relaxed).max(1) as u64)
    }

    // -----------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------

    fn run(self: Arc<Self>) {
        info!("Observer start...");
        self.timers
            .add_named(DB_PURGE_TIMER, self.purge_delay(), Event::DbPurge);
        // self-check: the first event through proves the loop is live
        self.queue.push(Event::IsAlive);
        while self.active.load(Ordering::SeqCst) {
            self.idle.store(true, Ordering::SeqCst);
            self.queue.wait(SLEEP_TIME);
            if self.paused.load(Ordering::SeqCst) {
                continue;
            }
            self.idle.store(false, Ordering::SeqCst);
            while !self.paused.load(Ordering::SeqCst) {
                let Some(event) = self.queue.pop() else {
                    break;
                };
                let kind = event.kind();
                let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(event)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Observer: {} handler failed: {}", kind, e),
                    Err(panic) => {
                        error!("Observer: {} handler panicked: {:?}", kind, panic)
                    }
                }
            }
        }
        info!("Observer stopped, {} events remaining.", self.queue.len());
        self.idle.store(true, Ordering::SeqCst);
    }

    fn dispatch(&self, event: Event) -> Result<()> {
        match event {
            Event::FailureFound {
                manager,
                jail,
                ticket,
            } => self.failure_found(&*manager, &*jail, ticket),
            Event::BanFound {
                ticket,
                jail,
                ban_time,
            } => self.ban_found(&ticket, &*jail, ban_time),
            Event::Call(f) => {
                f();
                Ok(())
            }
            Event::DbSet(db) => {
                self.db_set(db);
                Ok(())
            }
            Event::DbPurge => {
                self.db_purge();
                Ok(())
            }
            Event::IsAlive => {
                debug!("Observer alive...");
                Ok(())
            }
            Event::IsActive => {
                debug!(
                    "Observer {}",
                    if self.is_active() { "active" } else { "inactive" }
                );
                Ok(())
            }
            Event::Shutdown => Ok(()),
        }
    }

    // -----------------------------------------------------------------
    // Database service events
    // -----------------------------------------------------------------

    /// Install the ban store handle used by all subsequent handlers.
    pub fn db_set(&self, db: Arc<BanStore>) {
        *self.db.lock().unwrap() = Some(db);
    }

    fn db(&self) -> Option<Arc<BanStore>> {
        self.db.lock().unwrap().clone()
    }

    fn db_purge(&self) {
        info!("Purge database event occurred");
        if let Some(db) = self.db() {
            if let Err(e) = db.purge() {
                error!("Observer: database purge failed: {}", e);
            }
        }
        // the timer is re-armed even when the purge failed
        self.timers
            .add_named(DB_PURGE_TIMER, self.purge_delay(), Event::DbPurge);
    }

    // -----------------------------------------------------------------
    // Ban time increment
    // -----------------------------------------------------------------

    /// Hypothetical retry count for an ip with `ban_count` prior bans:
    /// one failure from a known offender counts as 2, 3, 5, 9, ...
    /// attempts. The integer division keeps `ban_count == 0` at 1.
    fn retry_count_for(ban_count: u32) -> u32 {
        ((1u64 << ban_count.min(20)) / 2 + 1) as u32
    }

    /// A failure for `ticket.ip()` was seen in `jail`. If the ip has ban
    /// history, inflate the fail manager's retry count so a single knock
    /// from a known offender re-bans it almost immediately.
    pub fn failure_found(
        &self,
        manager: &dyn FailManager,
        jail: &dyn Jail,
        mut ticket: FailTicket,
    ) -> Result<()> {
        if !jail.is_alive() {
            return Ok(());
        }
        let ip = ticket.ip().to_string();
        let unix_time = ticket.time();
        info!("[{}] Observer: failure found {}", jail.name(), ip);

        let mut ban_count = 0;
        let mut retry_count = 1;
        if let Some(db) = self.db() {
            let mut time_of_ban = None;
            if let Some(record) = db.get_ban(&ip, Some(jail.name()), None, false)?.first() {
                ban_count = record.ban_count;
                time_of_ban = Some(record.time_of_ban);
                retry_count = Self::retry_count_for(ban_count);
            }
            retry_count = retry_count.min(manager.max_retry());
            // already processed: the same line will be restored from the
            // database after a restart
            if let Some(time_of_ban) = time_of_ban {
                if unix_time <= time_of_ban {
                    info!(
                        "[{}] Ignore failure {} before last ban {} < {}, restored",
                        jail.name(),
                        ip,
                        unix_time,
                        time_of_ban
                    );
                    return Ok(());
                }
            }
        }
        // not increased: the filter already counted this failure itself
        if retry_count <= 1 {
            return Ok(());
        }
        info!(
            "[{}] Found {}, bad - {}, {} # -> {}, ban",
            jail.name(),
            ip,
            fmt_time(unix_time),
            ban_count,
            retry_count
        );
        // the filter already holds the matches for this ticket
        ticket.clear_matches();
        // retry_count - 1: the filter already incremented once
        manager.add_failure(ticket, retry_count - 1, true);

        if retry_count >= manager.max_retry() {
            // ban the ip now (again)
            loop {
                match manager.to_ban(&ip) {
                    Some(ban_ticket) => jail.put_fail_ticket(ban_ticket),
                    None => {
                        manager.cleanup(clock::now());
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Evaluate the jail's escalation formula for a hypothetical ban.
    pub fn calc_ban_time(&self, jail: &dyn Jail, ban_time: i64, ban_count: u32) -> f64 {
        jail.ban_time_extra().ev_formula(BanTimeIncr {
            time: ban_time as f64,
            count: ban_count,
        })
    }

    /// Check the ban history for `ticket.ip()` and escalate `ban_time`
    /// when the ip was banned before. Writes the looked-up ban count (and
    /// the computed time) back onto the ticket; a ticket at or before the
    /// recorded time of ban is marked restored instead.
    pub fn incr_ban_time(&self, jail: &dyn Jail, ban_time: i64, ticket: &mut FailTicket) -> i64 {
        if !jail.is_alive() {
            return ban_time;
        }
        let extra = jail.ban_time_extra();
        let org_ban_time = ban_time;
        let mut ban_time = ban_time;
        if ban_time > 0 && extra.increment {
            if let Some(db) = self.db() {
                let lookup = db.get_ban(
                    ticket.ip(),
                    Some(jail.name()),
                    None,
                    extra.overall_jails,
                );
                match lookup {
                    Ok(records) => {
                        if let Some(record) = records.first() {
                            debug!(
                                "IP {} was already banned: {} #, {}",
                                ticket.ip(),
                                record.ban_count,
                                record.time_of_ban
                            );
                            ticket.set_ban_count(record.ban_count);
                            if record.ban_count > 0 {
                                ban_time = extra.ev_formula(BanTimeIncr {
                                    time: ban_time as f64,
                                    count: record.ban_count,
                                }) as i64;
                            }
                            ticket.set_ban_time(Some(ban_time));
                            // a ticket at or before the recorded ban was
                            // read twice (log replay after restart)
                            if ticket.time() > record.time_of_ban {
                                info!(
                                    "[{}] IP {} is bad: {} # last {} - incr {} to {}",
                                    jail.name(),
                                    ticket.ip(),
                                    record.ban_count,
                                    fmt_time(record.time_of_ban),
                                    fmt_duration(org_ban_time),
                                    fmt_duration(ban_time)
                                );
                            } else {
                                ticket.set_restored(true);
                            }
                        }
                    }
                    Err(e) => {
                        error!("[{}] Observer: {}", jail.name(), e);
                    }
                }
            }
        }
        ban_time
    }

    /// A ban was enforced for `ticket`. Escalate its duration if the ip
    /// has history, drop stale bans from log replays, and persist the
    /// result. On return the ticket carries the authoritative ban time
    /// the caller should enforce; triggering the firewall stays with the
    /// caller.
    pub fn ban_found(&self, ticket: &SharedTicket, jail: &dyn Jail, ban_time: i64) -> Result<()> {
        let mut ticket = ticket.lock().unwrap();
        let org_ban_time = ban_time;
        let mut ban_time = ban_time;
        info!(
            "[{}] Observer: ban found {}, {}",
            jail.name(),
            ticket.ip(),
            ban_time
        );
        // not permanent, not restored, duration still open: escalate
        if ban_time != PERMANENT && !ticket.restored() && ticket.ban_time().is_none() {
            ban_time = self.incr_ban_time(jail, ban_time, &mut ticket);
            if ban_time == PERMANENT || ban_time > org_ban_time {
                ticket.set_ban_time(Some(ban_time));
            }
        }
        let logtime = if ban_time != PERMANENT {
            let ban_end = ticket.time() + ban_time;
            if ban_end < clock::now() {
                info!("Ignore old bantime {}", fmt_time(ban_end));
                return Ok(());
            }
            (fmt_duration(ban_time), fmt_time(ban_end))
        } else {
            ("permanent".to_string(), "infinite".to_string())
        };
        if ban_time != org_ban_time {
            info!(
                "[{}] Increase Ban {} ({} # {} -> {})",
                jail.name(),
                ticket.ip(),
                ticket.ban_count() + 1,
                logtime.0,
                logtime.1
            );
        }
        // persist, but never a restored ticket: it came out of the store
        if let Some(db) = self.db() {
            if !ticket.restored() {
                if ticket.ban_time().is_none() {
                    ticket.set_ban_time(Some(ban_time));
                }
                db.add_ban(jail.name(), &ticket)?;
            }
        }
        Ok(())
    }
}

fn fmt_time(seconds: i64) -> String {
    chrono::DateTime::from_timestamp(seconds, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| seconds.to_string())
}

fn fmt_duration(seconds: i64) -> String {
    let days = seconds / 86_400;
    let rem = seconds % 86_400;
    let (h, m, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    if days > 0 {
        format!("{} days, {}:{:02}:{:02}", days, h, m, s)
    } else {
        format!("{}:{:02}:{:02}", h, m, s)
    }
}
