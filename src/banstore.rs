// src/banstore.rs

//! Persistent ban history.
//!
//! One SQLite file holds everything the escalation logic needs to
//! recognise repeat offenders across daemon restarts: a `jails` table and
//! a `bips` ("bad ips") table keyed by `(jail, ip)` carrying the
//! cumulative ban count, the latest time of ban and the latest ban
//! duration. The store owns its own locking; the observer and the control
//! server share it behind an `Arc`.

use crate::error::Result;
use crate::ticket::{FailTicket, PERMANENT};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// Schema revision this build writes and expects.
pub const SCHEMA_VERSION: i64 = 1;

/// Default age in seconds after which expired bans are purged.
pub const DEFAULT_PURGE_AGE: i64 = 24 * 60 * 60;

/// One row of ban history for an ip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanRecord {
    /// Cumulative number of bans.
    pub ban_count: u32,
    /// Seconds since epoch of the most recent ban.
    pub time_of_ban: i64,
    /// Duration of the most recent ban; [`PERMANENT`] means forever.
    pub last_ban_time: i64,
}

/// SQLite-backed ban history, safe to share across threads.
pub struct BanStore {
    conn: Mutex<Connection>,
    purge_age: AtomicI64,
}

impl BanStore {
    /// Open (creating and migrating if necessary) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Self::upgrade_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            purge_age: AtomicI64::new(DEFAULT_PURGE_AGE),
        })
    }

    pub fn purge_age(&self) -> i64 {
        self.purge_age.load(Ordering::Relaxed)
    }

    pub fn set_purge_age(&self, age: i64) {
        self.purge_age.store(age, Ordering::Relaxed);
    }

    /// Register a jail, re-enabling it if it was previously disabled.
    pub fn add_jail(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jails (name, enabled) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET enabled = 1",
            params![name],
        )?;
        Ok(())
    }

    /// Mark a jail disabled. Its history is kept until a purge finds it
    /// without remaining bans.
    pub fn disable_jail(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jails SET enabled = 0 WHERE name = ?1",
            params![name],
        )?;
        Ok(())
    }

    /// Record a ban of `ticket` in `jail`.
    ///
    /// The stored ban count is `ticket.ban_count() + 1`: the ticket
    /// carries the count of prior bans, and this ban is one more. Callers
    /// resolve the ticket's ban time before persisting.
    pub fn add_ban(&self, jail: &str, ticket: &FailTicket) -> Result<()> {
        let matches = serde_json::to_string(ticket.matches())
            .unwrap_or_else(|_| "[]".to_string());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO bips (jail, ip, timeofban, bantime, bancount, matches)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(jail, ip) DO UPDATE SET
                 timeofban = excluded.timeofban,
                 bantime = excluded.bantime,
                 bancount = excluded.bancount,
                 matches = excluded.matches",
            params![
                jail,
                ticket.ip(),
                ticket.time(),
                ticket.ban_time().unwrap_or(0),
                ticket.ban_count() as i64 + 1,
                matches,
            ],
        )?;
        Ok(())
    }

    /// Ban history for `ip`, most recent first.
    ///
    /// With a jail the result is that jail's record alone. With
    /// `overall_jails` the per-jail records are folded into a single
    /// aggregate: summed counts and durations, latest time of ban.
    pub fn get_ban(
        &self,
        ip: &str,
        jail: Option<&str>,
        from_time: Option<i64>,
        overall_jails: bool,
    ) -> Result<Vec<BanRecord>> {
        let conn = self.conn.lock().unwrap();
        let from_time = from_time.unwrap_or(i64::MIN);

        if overall_jails {
            let record = conn
                .query_row(
                    "SELECT SUM(bancount), MAX(timeofban), SUM(bantime)
                     FROM bips WHERE ip = ?1 AND timeofban >= ?2
                     GROUP BY ip",
                    params![ip, from_time],
                    |row| {
                        Ok(BanRecord {
                            ban_count: row.get::<_, i64>(0)? as u32,
                            time_of_ban: row.get(1)?,
                            last_ban_time: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            return Ok(record.into_iter().collect());
        }

        let (sql, jail_filter) = match jail {
            Some(j) => (
                "SELECT bancount, timeofban, bantime FROM bips
                 WHERE ip = ?1 AND timeofban >= ?2 AND jail = ?3
                 ORDER BY timeofban DESC",
                j,
            ),
            None => (
                "SELECT bancount, timeofban, bantime FROM bips
                 WHERE ip = ?1 AND timeofban >= ?2 AND jail != ?3
                 ORDER BY timeofban DESC",
                "",
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let records = stmt
            .query_map(params![ip, from_time, jail_filter], |row| {
                Ok(BanRecord {
                    ban_count: row.get::<_, i64>(0)? as u32,
                    time_of_ban: row.get(1)?,
                    last_ban_time: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Tickets for bans that are still in force at `from_time`.
    ///
    /// Permanent bans always qualify. When `for_ban_time` is given, the
    /// window becomes "banned within the last `for_ban_time` seconds"
    /// instead (with `-1` disabling the filter entirely).
    pub fn get_current_bans(
        &self,
        jail: Option<&str>,
        from_time: i64,
        for_ban_time: Option<i64>,
    ) -> Result<Vec<FailTicket>> {
        let conn = self.conn.lock().unwrap();
        let time_cond = match for_ban_time {
            Some(PERMANENT) => "1".to_string(),
            Some(window) => format!("timeofban > {}", from_time - window),
            None => format!(
                "(bantime = {} OR timeofban + bantime > {})",
                PERMANENT, from_time
            ),
        };
        let sql = match jail {
            Some(_) => format!(
                "SELECT ip, timeofban, bantime, bancount, matches FROM bips
                 WHERE jail = ?1 AND {} ORDER BY ip",
                time_cond
            ),
            None => format!(
                "SELECT ip, timeofban, bantime, bancount, matches FROM bips
                 WHERE jail != ?1 AND {} ORDER BY ip",
                time_cond
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let tickets = stmt
            .query_map(params![jail.unwrap_or("")], |row| {
                let ip: String = row.get(0)?;
                let time_of_ban: i64 = row.get(1)?;
                let ban_time: i64 = row.get(2)?;
                let ban_count: i64 = row.get(3)?;
                let matches: String = row.get(4)?;
                let mut ticket = FailTicket::new(ip, time_of_ban);
                ticket.set_ban_time(Some(ban_time));
                ticket.set_ban_count(ban_count as u32);
                ticket.set_matches(serde_json::from_str(&matches).unwrap_or_default());
                Ok(ticket)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tickets)
    }

    /// Drop history whose ban expired more than `purge_age` seconds ago
    /// and prune disabled jails left without any bans. Returns the number
    /// of ban rows removed.
    pub fn purge(&self) -> Result<usize> {
        let cutoff = crate::clock::now() - self.purge_age();
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM bips WHERE bantime != ?1 AND timeofban + bantime < ?2",
            params![PERMANENT, cutoff],
        )?;
        conn.execute(
            "DELETE FROM jails WHERE enabled = 0
             AND name NOT IN (SELECT DISTINCT jail FROM bips)",
            [],
        )?;
        debug!("purged {} expired ban rows", removed);
        Ok(removed)
    }
}

/// First schema revision: the jails registry and the bad-ip history.
const SCHEMA_BIPS: &str = "
    CREATE TABLE jails (
        name TEXT PRIMARY KEY,
        enabled INTEGER NOT NULL DEFAULT 1
    );

    -- Bad ips: one row per (jail, ip) with cumulative ban history
    CREATE TABLE bips (
        jail TEXT NOT NULL,
        ip TEXT NOT NULL,
        timeofban INTEGER NOT NULL,
        bantime INTEGER NOT NULL,
        bancount INTEGER NOT NULL DEFAULT 0,
        matches TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (jail, ip),
        FOREIGN KEY (jail) REFERENCES jails(name)
    );

    CREATE INDEX idx_bips_ip ON bips(ip);
    CREATE INDEX idx_bips_timeofban ON bips(timeofban);
";

impl BanStore {
    /// Revision of the database file, tracked in SQLite's `user_version`
    /// pragma. A fresh file reports 0 and gets every revision applied in
    /// order; an up-to-date file is left untouched.
    fn schema_revision(conn: &Connection) -> Result<i64> {
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Bring the file up to [`SCHEMA_VERSION`].
    fn upgrade_schema(conn: &Connection) -> Result<()> {
        let mut revision = Self::schema_revision(conn)?;
        while revision < SCHEMA_VERSION {
            revision += 1;
            info!("ban store schema upgrade to revision {}", revision);
            let sql = match revision {
                1 => SCHEMA_BIPS,
                _ => unreachable!("no upgrade path to revision {}", revision),
            };
            conn.execute_batch(sql)?;
            conn.pragma_update(None, "user_version", revision)?;
        }
        Ok(())
    }
}
