// src/server/mod.rs

//! Control-channel server.
//!
//! Listens on a Unix domain socket and serves framed commands
//! sequentially: one connection at a time, one command per frame. This is
//! the boundary through which the daemon is configured; the client plays
//! a command stream at it on start and reload. The server owns the
//! observer for the daemon's lifetime and the map of jails.
//!
//! Firewall enforcement is out of scope: a banned ip lands on the jail's
//! ban list and in the ban store, nothing else.

use crate::banstore::BanStore;
use crate::bantime::BanTimeExtra;
use crate::clock;
use crate::error::{Error, Result};
use crate::failmanager::{FailManager, SlidingFailManager};
use crate::jail::Jail;
use crate::observer::{Event, Observer};
use crate::protocol::{self, Response};
use crate::ticket::{FailTicket, SharedTicket};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, error, info, warn};

/// Socket file permissions: owner and group only.
const SOCKET_MODE: u32 = 0o660;

/// Default per-jail ban duration in seconds.
const DEFAULT_BAN_TIME: i64 = 600;

/// Default per-jail find window in seconds.
const DEFAULT_FIND_TIME: i64 = 600;

/// Default per-jail retry threshold.
const DEFAULT_MAX_RETRY: u32 = 5;

/// A jail as the control server sees it: a failure counter, ban-time
/// settings and the list of currently enforced bans.
pub struct ServerJail {
    name: String,
    alive: AtomicBool,
    ban_time: AtomicI64,
    extra: RwLock<BanTimeExtra>,
    manager: Arc<SlidingFailManager>,
    observer: Weak<Observer>,
    banned: Mutex<Vec<SharedTicket>>,
    me: Weak<ServerJail>,
}

impl ServerJail {
    pub fn new(name: &str, observer: &Arc<Observer>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            alive: AtomicBool::new(false),
            ban_time: AtomicI64::new(DEFAULT_BAN_TIME),
            extra: RwLock::new(BanTimeExtra::default()),
            manager: Arc::new(SlidingFailManager::new(DEFAULT_MAX_RETRY, DEFAULT_FIND_TIME)),
            observer: Arc::downgrade(observer),
            banned: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    /// Bring the jail up and re-enforce still-active bans from the store.
    pub fn start(&self, store: Option<&Arc<BanStore>>) -> Result<()> {
        if self.alive.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("[{}] jail started", self.name);
        if let Some(store) = store {
            store.add_jail(&self.name)?;
            let restored = store.get_current_bans(Some(&self.name), clock::now(), None)?;
            if !restored.is_empty() {
                info!("[{}] restoring {} active bans", self.name, restored.len());
            }
            for mut ticket in restored {
                ticket.set_restored(true);
                self.put_fail_ticket(ticket);
            }
        }
        Ok(())
    }

    pub fn stop(&self, store: Option<&Arc<BanStore>>) -> Result<()> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("[{}] jail stopped", self.name);
        if let Some(store) = store {
            store.disable_jail(&self.name)?;
        }
        Ok(())
    }

    /// Register one observed failure for `ip`, ban on threshold, and let
    /// the observer inflate the count from ban history. Returns the
    /// retry count as of this call.
    pub fn attempt(&self, ip: &str, matches: Vec<String>) -> u32 {
        let mut ticket = FailTicket::new(ip, clock::now());
        ticket.set_matches(matches);
        let count = self.manager.add_failure(ticket.clone(), 1, false);
        if count >= self.manager.max_retry() {
            while let Some(ban_ticket) = self.manager.to_ban(ip) {
                self.put_fail_ticket(ban_ticket);
            }
        }
        if let (Some(observer), Some(me)) = (self.observer.upgrade(), self.me.upgrade()) {
            observer.add(Event::FailureFound {
                manager: self.manager.clone(),
                jail: me,
                ticket,
            });
        }
        count
    }

    /// Ban `ip` immediately, bypassing the failure counter.
    pub fn ban_ip(&self, ip: &str) {
        self.put_fail_ticket(FailTicket::new(ip, clock::now()));
    }

    /// Lift the ban on `ip`. Returns whether anything was removed.
    pub fn unban_ip(&self, ip: &str) -> bool {
        let mut banned = self.banned.lock().unwrap();
        let before = banned.len();
        banned.retain(|t| t.lock().unwrap().ip() != ip);
        before != banned.len()
    }

    /// Currently banned ips, pruning bans that have run out.
    pub fn banned_ips(&self) -> Vec<String> {
        let default_ban_time = self.ban_time.load(Ordering::Relaxed);
        let now = clock::now();
        let mut banned = self.banned.lock().unwrap();
        banned.retain(|t| !t.lock().unwrap().is_timed_out(now, default_ban_time));
        let mut ips: Vec<String> = banned
            .iter()
            .map(|t| t.lock().unwrap().ip().to_string())
            .collect();
        ips.dedup();
        ips
    }

    pub fn ban_time(&self) -> i64 {
        self.ban_time.load(Ordering::Relaxed)
    }

    pub fn set_ban_time(&self, seconds: i64) {
        self.ban_time.store(seconds, Ordering::Relaxed);
    }

    pub fn manager(&self) -> &Arc<SlidingFailManager> {
        &self.manager
    }

    fn set_extra_option(&self, key: &str, value: &str) -> Result<()> {
        self.extra.write().unwrap().set_option(key, value)
    }

    fn get_extra_option(&self, key: &str) -> Result<String> {
        self.extra.read().unwrap().get_option(key)
    }
}

impl Jail for ServerJail {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn ban_time_extra(&self) -> BanTimeExtra {
        self.extra.read().unwrap().clone()
    }

    fn put_fail_ticket(&self, ticket: FailTicket) {
        let ban_time = ticket.ban_time().unwrap_or_else(|| self.ban_time());
        let shared = ticket.into_shared();
        self.banned.lock().unwrap().push(shared.clone());
        if let (Some(observer), Some(me)) = (self.observer.upgrade(), self.me.upgrade()) {
            observer.add(Event::BanFound {
                ticket: shared,
                jail: me,
                ban_time,
            });
        }
    }
}

/// The daemon: socket listener, command dispatch, observer and jails.
pub struct ControlServer {
    socket_path: PathBuf,
    force: bool,
    observer: Arc<Observer>,
    jails: Mutex<HashMap<String, Arc<ServerJail>>>,
    store: Mutex<Option<Arc<BanStore>>>,
    running: AtomicBool,
}

impl ControlServer {
    /// `force` removes a stale socket file instead of refusing to start.
    pub fn new<P: AsRef<Path>>(socket_path: P, force: bool) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            force,
            observer: Observer::new(),
            jails: Mutex::new(HashMap::new()),
            store: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn observer(&self) -> &Arc<Observer> {
        &self.observer
    }

    /// Bind, start the observer and serve until a `stop` command arrives.
    pub fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.observer.start();
        self.running.store(true, Ordering::SeqCst);
        info!("bastilled ready on {}", self.socket_path.display());
        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = self.handle_connection(stream) {
                        warn!("connection failed: {}", e);
                    }
                }
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    error!("accept failed: {}", e);
                }
            }
        }
        self.observer.stop();
        self.cleanup();
        info!("bastilled stopped");
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            if !self.force {
                return Err(Error::SocketUnavailable(format!(
                    "socket {} already exists; is bastilled running? (-x removes a stale socket)",
                    self.socket_path.display()
                )));
            }
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            Error::SocketUnavailable(format!(
                "failed to bind {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        std::fs::set_permissions(
            &self.socket_path,
            std::fs::Permissions::from_mode(SOCKET_MODE),
        )?;
        info!(
            "listening on Unix socket: {} (mode: {:o})",
            self.socket_path.display(),
            SOCKET_MODE
        );
        Ok(listener)
    }

    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!("failed to remove socket file: {}", e);
            }
        }
    }

    /// One connection may carry many commands; the config stream arrives
    /// this way.
    fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        loop {
            let Some(command) = protocol::read_command(&mut stream)? else {
                return Ok(());
            };
            debug!("command: {:?}", command);
            let (response, shutdown) = match self.dispatch(&command) {
                Ok((payload, shutdown)) => (Response::ok(payload), shutdown),
                Err(e) => {
                    warn!("command {:?} failed: {}", command, e);
                    (Response::error(e.kind(), &e.to_string()), false)
                }
            };
            protocol::write_response(&mut stream, &response)?;
            if shutdown {
                self.running.store(false, Ordering::SeqCst);
                return Ok(());
            }
        }
    }

    fn store(&self) -> Option<Arc<BanStore>> {
        self.store.lock().unwrap().clone()
    }

    fn jail(&self, name: &str) -> Result<Arc<ServerJail>> {
        self.jails
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Command(format!("no such jail: {}", name)))
    }

    /// Execute one command. Returns the reply payload and whether the
    /// daemon should shut down afterwards.
    pub fn dispatch(&self, command: &[String]) -> Result<(Vec<String>, bool)> {
        let verb = command
            .first()
            .ok_or_else(|| Error::Command("empty command".into()))?;
        match (verb.as_str(), command.len()) {
            ("ping", 1) => Ok((vec!["pong".into()], false)),
            ("echo", _) => Ok((command[1..].to_vec(), false)),
            ("stop", 1) => {
                info!("shutdown requested");
                let store = self.store();
                for jail in self.jails.lock().unwrap().values() {
                    jail.stop(store.as_ref())?;
                }
                Ok((vec!["Shutdown successful".into()], true))
            }
            ("stop", 2) => self.stop_jails(&command[1]).map(|p| (p, false)),
            ("start", 2) => {
                let jail = self.jail(&command[1])?;
                jail.start(self.store().as_ref())?;
                self.observer.set_paused(false);
                Ok((vec![command[1].clone()], false))
            }
            ("add", 2) => self.add_jail(&command[1]).map(|p| (p, false)),
            ("status", 1) => Ok((self.status(), false)),
            ("status", 2) => self.jail_status(&command[1]).map(|p| (p, false)),
            ("set", n) if n >= 3 => self.cmd_set(&command[1..]).map(|p| (p, false)),
            ("get", n) if n >= 2 => self.cmd_get(&command[1..]).map(|p| (p, false)),
            _ => Err(Error::Command(format!(
                "unknown command: {}",
                command.join(" ")
            ))),
        }
    }

    fn add_jail(&self, name: &str) -> Result<Vec<String>> {
        let mut jails = self.jails.lock().unwrap();
        if jails.contains_key(name) {
            return Ok(vec![name.to_string()]);
        }
        jails.insert(name.to_string(), ServerJail::new(name, &self.observer));
        info!("[{}] jail added", name);
        Ok(vec![name.to_string()])
    }

    fn stop_jails(&self, which: &str) -> Result<Vec<String>> {
        // the observer pauses while jails are torn down; the stream that
        // follows a reload starts them (and it) again
        self.observer.set_paused(true);
        let store = self.store();
        let jails = self.jails.lock().unwrap();
        if which == "all" {
            for jail in jails.values() {
                jail.stop(store.as_ref())?;
            }
            Ok(vec!["all".to_string()])
        } else {
            let jail = jails
                .get(which)
                .ok_or_else(|| Error::Command(format!("no such jail: {}", which)))?;
            jail.stop(store.as_ref())?;
            Ok(vec![which.to_string()])
        }
    }

    fn status(&self) -> Vec<String> {
        let jails = self.jails.lock().unwrap();
        let mut names: Vec<&str> = jails.keys().map(String::as_str).collect();
        names.sort_unstable();
        vec![
            format!("Number of jails: {}", names.len()),
            format!("Jail list: {}", names.join(", ")),
        ]
    }

    fn jail_status(&self, name: &str) -> Result<Vec<String>> {
        let jail = self.jail(name)?;
        let banned = jail.banned_ips();
        Ok(vec![
            format!("Status for the jail: {}", name),
            format!("|- Alive: {}", jail.is_alive()),
            format!("|- Currently failed: {}", jail.manager().size()),
            format!("|- Currently banned: {}", banned.len()),
            format!("`- Banned IP list: {}", banned.join(" ")),
        ])
    }

    fn cmd_set(&self, args: &[String]) -> Result<Vec<String>> {
        match args[0].as_str() {
            "dbfile" => {
                let path = &args[1];
                let store = Arc::new(BanStore::open(path)?);
                // alive jails registered before the store arrived
                for jail in self.jails.lock().unwrap().values() {
                    if jail.is_alive() {
                        store.add_jail(jail.name())?;
                    }
                }
                *self.store.lock().unwrap() = Some(store.clone());
                self.observer.add(Event::DbSet(store));
                info!("ban database set to {}", path);
                Ok(vec![path.clone()])
            }
            "dbpurgeage" => {
                let age = crate::config::parse_seconds(&args[1])?;
                let store = self
                    .store()
                    .ok_or_else(|| Error::Command("no database configured".into()))?;
                store.set_purge_age(age);
                Ok(vec![age.to_string()])
            }
            jail_name => {
                if args.len() < 3 {
                    return Err(Error::Command(format!(
                        "set {} needs a key and value",
                        jail_name
                    )));
                }
                let jail = self.jail(jail_name)?;
                let key = args[1].as_str();
                let value = args[2..].join(" ");
                match key {
                    "bantime" => {
                        jail.set_ban_time(crate::config::parse_seconds(&value)?);
                    }
                    "findtime" => {
                        jail.manager()
                            .set_find_time(crate::config::parse_seconds(&value)?);
                    }
                    "maxretry" => {
                        let retries: u32 = value
                            .parse()
                            .map_err(|_| Error::Command(format!("invalid maxretry: {}", value)))?;
                        jail.manager().set_max_retry(retries);
                    }
                    "banip" => {
                        for ip in &args[2..] {
                            jail.ban_ip(ip);
                        }
                    }
                    "unbanip" => {
                        for ip in &args[2..] {
                            if !jail.unban_ip(ip) {
                                return Err(Error::Command(format!("{} is not banned", ip)));
                            }
                        }
                    }
                    "attempt" => {
                        let count = jail.attempt(&args[2], args[3..].to_vec());
                        return Ok(vec![count.to_string()]);
                    }
                    _ => match key.strip_prefix("bantime.") {
                        Some(option) => jail.set_extra_option(option, &value)?,
                        None => {
                            return Err(Error::Command(format!("unknown setting: {}", key)));
                        }
                    },
                }
                Ok(vec![value])
            }
        }
    }

    fn cmd_get(&self, args: &[String]) -> Result<Vec<String>> {
        match args[0].as_str() {
            "dbpurgeage" => {
                let store = self
                    .store()
                    .ok_or_else(|| Error::Command("no database configured".into()))?;
                Ok(vec![store.purge_age().to_string()])
            }
            jail_name => {
                if args.len() < 2 {
                    return Err(Error::Command(format!("get {} needs a key", jail_name)));
                }
                let jail = self.jail(jail_name)?;
                let value = match args[1].as_str() {
                    "bantime" => jail.ban_time().to_string(),
                    "findtime" => jail.manager().find_time().to_string(),
                    "maxretry" => jail.manager().max_retry().to_string(),
                    "banned" => return Ok(jail.banned_ips()),
                    "failed" => jail.manager().size().to_string(),
                    key => match key.strip_prefix("bantime.") {
                        Some(option) => jail.get_extra_option(option)?,
                        None => {
                            return Err(Error::Command(format!("unknown setting: {}", key)));
                        }
                    },
                };
                Ok(vec![value])
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cmd(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    fn server() -> ControlServer {
        ControlServer::new("/tmp/unused.sock", false)
    }

    #[test]
    fn test_ping_and_echo() {
        let server = server();
        assert_eq!(
            server.dispatch(&cmd(&["ping"])).unwrap(),
            (vec!["pong".to_string()], false)
        );
        assert_eq!(
            server.dispatch(&cmd(&["echo", "Server", "ready"])).unwrap(),
            (cmd(&["Server", "ready"]), false)
        );
    }

    #[test]
    fn test_unknown_command_is_error() {
        let server = server();
        let err = server.dispatch(&cmd(&["frobnicate"])).unwrap_err();
        assert_eq!(err.kind(), "command");
    }

    #[test]
    fn test_add_set_get_roundtrip() {
        let server = server();
        server.dispatch(&cmd(&["add", "sshd"])).unwrap();
        server
            .dispatch(&cmd(&["set", "sshd", "bantime", "10m"]))
            .unwrap();
        server
            .dispatch(&cmd(&["set", "sshd", "maxretry", "3"]))
            .unwrap();
        server
            .dispatch(&cmd(&["set", "sshd", "bantime.increment", "true"]))
            .unwrap();
        server
            .dispatch(&cmd(&["set", "sshd", "bantime.maxtime", "24h"]))
            .unwrap();

        let (bantime, _) = server.dispatch(&cmd(&["get", "sshd", "bantime"])).unwrap();
        assert_eq!(bantime, ["600"]);
        let (maxretry, _) = server.dispatch(&cmd(&["get", "sshd", "maxretry"])).unwrap();
        assert_eq!(maxretry, ["3"]);
        let (incr, _) = server
            .dispatch(&cmd(&["get", "sshd", "bantime.increment"]))
            .unwrap();
        assert_eq!(incr, ["true"]);

        // unknown jail and unknown key
        assert!(server.dispatch(&cmd(&["get", "nosuch", "bantime"])).is_err());
        assert!(server.dispatch(&cmd(&["get", "sshd", "nosuch"])).is_err());
    }

    #[test]
    fn test_attempts_reach_threshold_and_ban() {
        let server = server();
        server.dispatch(&cmd(&["add", "sshd"])).unwrap();
        server
            .dispatch(&cmd(&["set", "sshd", "maxretry", "3"]))
            .unwrap();
        server.dispatch(&cmd(&["start", "sshd"])).unwrap();

        for _ in 0..2 {
            server
                .dispatch(&cmd(&["set", "sshd", "attempt", "192.0.2.1"]))
                .unwrap();
        }
        let (banned, _) = server.dispatch(&cmd(&["get", "sshd", "banned"])).unwrap();
        assert!(banned.is_empty());

        server
            .dispatch(&cmd(&["set", "sshd", "attempt", "192.0.2.1"]))
            .unwrap();
        let (banned, _) = server.dispatch(&cmd(&["get", "sshd", "banned"])).unwrap();
        assert_eq!(banned, ["192.0.2.1"]);
    }

    #[test]
    fn test_banip_unbanip() {
        let server = server();
        server.dispatch(&cmd(&["add", "sshd"])).unwrap();
        server.dispatch(&cmd(&["start", "sshd"])).unwrap();
        server
            .dispatch(&cmd(&["set", "sshd", "banip", "192.0.2.7", "192.0.2.8"]))
            .unwrap();
        let (banned, _) = server.dispatch(&cmd(&["get", "sshd", "banned"])).unwrap();
        assert_eq!(banned, ["192.0.2.7", "192.0.2.8"]);

        server
            .dispatch(&cmd(&["set", "sshd", "unbanip", "192.0.2.7"]))
            .unwrap();
        let (banned, _) = server.dispatch(&cmd(&["get", "sshd", "banned"])).unwrap();
        assert_eq!(banned, ["192.0.2.8"]);

        assert!(server
            .dispatch(&cmd(&["set", "sshd", "unbanip", "192.0.2.9"]))
            .is_err());
    }

    #[test]
    fn test_status_output() {
        let server = server();
        server.dispatch(&cmd(&["add", "sshd"])).unwrap();
        server.dispatch(&cmd(&["add", "nginx"])).unwrap();
        let (status, _) = server.dispatch(&cmd(&["status"])).unwrap();
        assert_eq!(status[0], "Number of jails: 2");
        assert_eq!(status[1], "Jail list: nginx, sshd");

        server.dispatch(&cmd(&["start", "sshd"])).unwrap();
        server
            .dispatch(&cmd(&["set", "sshd", "banip", "192.0.2.7"]))
            .unwrap();
        let (status, _) = server.dispatch(&cmd(&["status", "sshd"])).unwrap();
        assert_eq!(status[0], "Status for the jail: sshd");
        assert!(status.iter().any(|l| l == "|- Currently banned: 1"));
        assert!(status.iter().any(|l| l == "`- Banned IP list: 192.0.2.7"));
    }

    #[test]
    fn test_stop_jail_pauses_observer_start_resumes() {
        let server = server();
        server.dispatch(&cmd(&["add", "sshd"])).unwrap();
        server.dispatch(&cmd(&["start", "sshd"])).unwrap();
        assert!(!server.observer().paused());

        server.dispatch(&cmd(&["stop", "sshd"])).unwrap();
        assert!(server.observer().paused());
        assert!(!server.jail("sshd").unwrap().is_alive());

        server.dispatch(&cmd(&["start", "sshd"])).unwrap();
        assert!(!server.observer().paused());
        assert!(server.jail("sshd").unwrap().is_alive());
    }

    #[test]
    fn test_stop_requests_shutdown() {
        let server = server();
        server.dispatch(&cmd(&["add", "sshd"])).unwrap();
        server.dispatch(&cmd(&["start", "sshd"])).unwrap();
        let (_, shutdown) = server.dispatch(&cmd(&["stop"])).unwrap();
        assert!(shutdown);
        assert!(!server.jail("sshd").unwrap().is_alive());
    }

    #[test]
    fn test_dbfile_enables_persistence_and_restore() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("bastille.db");
        let db_path = db_path.to_str().unwrap();

        let server = server();
        server.dispatch(&cmd(&["add", "sshd"])).unwrap();
        server.dispatch(&cmd(&["set", "dbfile", db_path])).unwrap();
        server.dispatch(&cmd(&["set", "dbpurgeage", "2d"])).unwrap();
        let (age, _) = server.dispatch(&cmd(&["get", "dbpurgeage"])).unwrap();
        assert_eq!(age, ["172800"]);

        // persist a ban directly, as the observer would
        let store = server.store().unwrap();
        store.add_jail("sshd").unwrap();
        let mut ticket = FailTicket::new("192.0.2.1", clock::now() - 60);
        ticket.set_ban_time(Some(3600));
        store.add_ban("sshd", &ticket).unwrap();

        // starting the jail re-enforces the stored ban
        server.dispatch(&cmd(&["start", "sshd"])).unwrap();
        let (banned, _) = server.dispatch(&cmd(&["get", "sshd", "banned"])).unwrap();
        assert_eq!(banned, ["192.0.2.1"]);
    }

    #[test]
    fn test_bind_refuses_existing_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bastille.sock");
        std::fs::write(&path, b"stale").unwrap();

        let server = ControlServer::new(&path, false);
        assert!(matches!(server.bind(), Err(Error::SocketUnavailable(_))));

        // force mode clears the stale file and binds
        let server = ControlServer::new(&path, true);
        let listener = server.bind().unwrap();
        drop(listener);
        assert!(path.exists());
    }
}
