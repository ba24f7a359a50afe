// src/jail.rs

//! The observer's view of a jail.
//!
//! The observer never owns jail internals; it holds an opaque capability
//! handle good for exactly the calls the escalation logic needs. The
//! concrete jail lives in the control server (`server::ServerJail`); tests
//! supply their own lightweight implementations.

use crate::bantime::BanTimeExtra;
use crate::ticket::FailTicket;

/// Capability interface handed to the observer.
pub trait Jail: Send + Sync {
    /// Jail name, used as the key into the ban store and in log prefixes.
    fn name(&self) -> &str;

    /// Whether the jail is still running. Handlers return silently for
    /// dead jails.
    fn is_alive(&self) -> bool;

    /// Snapshot of the jail's ban-time escalation settings.
    fn ban_time_extra(&self) -> BanTimeExtra;

    /// Hand a ban-ready ticket back to the jail for enforcement.
    fn put_fail_ticket(&self, ticket: FailTicket);
}
