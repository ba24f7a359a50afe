// src/lib.rs

//! Bastille: host intrusion-prevention daemon.
//!
//! Log-watching filters and firewall actions live at the edges; this
//! crate is the middle of the system:
//!
//! - The observer, a single-threaded event engine that serialises
//!   failure/ban notifications from all jails, escalates repeat offenders
//!   against a persistent ban history and purges that history on a
//!   schedule.
//! - The ban store, a SQLite file keyed by `(jail, ip)`.
//! - The control channel, a Unix socket carrying length-framed command
//!   arrays between the `bastille` client and the `bastilled` daemon.

pub mod banstore;
pub mod bantime;
pub mod client;
pub mod clock;
pub mod config;
mod error;
pub mod failmanager;
pub mod jail;
pub mod observer;
pub mod protocol;
pub mod server;
pub mod ticket;

pub use banstore::{BanRecord, BanStore};
pub use bantime::{BanTimeExtra, BanTimeIncr, Formula};
pub use client::{Client, ClientOptions, ControlSocket};
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use failmanager::{FailManager, SlidingFailManager};
pub use jail::Jail;
pub use observer::{Event, EventQueue, Observer, TimerSet};
pub use server::{ControlServer, ServerJail};
pub use ticket::{FailTicket, SharedTicket, PERMANENT};
