// src/config.rs

//! Server configuration.
//!
//! The daemon itself is configured entirely over the control channel; the
//! client reads this TOML file and translates it into the command stream
//! it plays at the server on `start` and `reload`. Durations accept bare
//! seconds or an `s`/`m`/`h`/`d`/`w` suffix.

use crate::bantime::{BanTimeExtra, Formula};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default control socket location.
pub const DEFAULT_SOCKET: &str = "/var/run/bastille/bastille.sock";

/// Default configuration file location.
pub const DEFAULT_CONFIG: &str = "/etc/bastille/bastille.toml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    /// Jail definitions, keyed by jail name. BTreeMap keeps the stream
    /// order stable.
    #[serde(default)]
    pub jails: BTreeMap<String, JailConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
    /// Ban database; unset disables persistence (and with it escalation).
    #[serde(default)]
    pub dbfile: Option<PathBuf>,
    #[serde(default = "default_purge_age")]
    pub dbpurgeage: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            dbfile: None,
            dbpurgeage: default_purge_age(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bantime")]
    pub bantime: String,
    #[serde(default = "default_findtime")]
    pub findtime: String,
    #[serde(default = "default_maxretry")]
    pub maxretry: u32,
    /// Ban-time escalation; absent means plain fixed-length bans.
    #[serde(default)]
    pub increment: Option<IncrementSection>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct IncrementSection {
    #[serde(default)]
    pub enabled: bool,
    pub maxtime: Option<String>,
    pub factor: Option<f64>,
    pub multipliers: Option<String>,
    pub rndtime: Option<String>,
    #[serde(default)]
    pub overalljails: bool,
    pub formula: Option<String>,
}

fn default_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET)
}

fn default_purge_age() -> String {
    "1d".to_string()
}

fn default_true() -> bool {
    true
}

fn default_bantime() -> String {
    "10m".to_string()
}

fn default_findtime() -> String {
    "10m".to_string()
}

fn default_maxretry() -> u32 {
    5
}

impl ServerConfig {
    /// Read and validate a configuration file. A configuration that fails
    /// validation aborts `start`/`reload` before anything reaches the
    /// server.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::parse(&text)
    }

    /// Parse and validate configuration text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: ServerConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        parse_seconds(&self.server.dbpurgeage)?;
        for (name, jail) in &self.jails {
            let context = |e: Error| Error::Config(format!("jail {}: {}", name, e));
            parse_seconds(&jail.bantime).map_err(context)?;
            parse_seconds(&jail.findtime).map_err(context)?;
            if jail.maxretry == 0 {
                return Err(Error::Config(format!("jail {}: maxretry must be > 0", name)));
            }
            if let Some(inc) = &jail.increment {
                if let Some(maxtime) = &inc.maxtime {
                    parse_seconds(maxtime).map_err(context)?;
                }
                if let Some(rndtime) = &inc.rndtime {
                    parse_seconds(rndtime).map_err(context)?;
                }
                if let Some(multipliers) = &inc.multipliers {
                    BanTimeExtra::parse_multipliers(multipliers).map_err(context)?;
                }
                if let Some(formula) = &inc.formula {
                    Formula::parse(formula).map_err(context)?;
                }
            }
        }
        Ok(())
    }

    /// The command stream the client sends to configure a freshly started
    /// server, or one jail of a running server on reload.
    pub fn command_stream(&self, only_jail: Option<&str>) -> Vec<Vec<String>> {
        let mut stream = Vec::new();
        let cmd = |tokens: &[&str]| tokens.iter().map(|t| t.to_string()).collect::<Vec<_>>();

        if only_jail.is_none() {
            if let Some(dbfile) = &self.server.dbfile {
                stream.push(cmd(&["set", "dbfile", &dbfile.display().to_string()]));
            }
            if let Ok(age) = parse_seconds(&self.server.dbpurgeage) {
                stream.push(cmd(&["set", "dbpurgeage", &age.to_string()]));
            }
        }

        for (name, jail) in &self.jails {
            if !jail.enabled {
                continue;
            }
            if let Some(only) = only_jail {
                if only != "all" && only != name {
                    continue;
                }
            }
            stream.push(cmd(&["add", name]));
            if let Ok(bantime) = parse_seconds(&jail.bantime) {
                stream.push(cmd(&["set", name, "bantime", &bantime.to_string()]));
            }
            if let Ok(findtime) = parse_seconds(&jail.findtime) {
                stream.push(cmd(&["set", name, "findtime", &findtime.to_string()]));
            }
            stream.push(cmd(&["set", name, "maxretry", &jail.maxretry.to_string()]));
            if let Some(inc) = &jail.increment {
                stream.push(cmd(&[
                    "set",
                    name,
                    "bantime.increment",
                    if inc.enabled { "true" } else { "false" },
                ]));
                if let Some(maxtime) = &inc.maxtime {
                    if let Ok(secs) = parse_seconds(maxtime) {
                        stream.push(cmd(&["set", name, "bantime.maxtime", &secs.to_string()]));
                    }
                }
                if let Some(factor) = inc.factor {
                    stream.push(cmd(&["set", name, "bantime.factor", &factor.to_string()]));
                }
                if let Some(multipliers) = &inc.multipliers {
                    stream.push(cmd(&["set", name, "bantime.multipliers", multipliers]));
                }
                if let Some(rndtime) = &inc.rndtime {
                    if let Ok(secs) = parse_seconds(rndtime) {
                        stream.push(cmd(&["set", name, "bantime.rndtime", &secs.to_string()]));
                    }
                }
                if inc.overalljails {
                    stream.push(cmd(&["set", name, "bantime.overalljails", "true"]));
                }
                if let Some(formula) = &inc.formula {
                    stream.push(cmd(&["set", name, "bantime.formula", formula]));
                }
            }
            stream.push(cmd(&["start", name]));
        }
        stream
    }
}

/// Parse a duration: bare seconds or a number with an `s`, `m`, `h`, `d`
/// or `w` suffix. A leading `-` is accepted (used by tests and purge-age
/// tuning).
pub fn parse_seconds(s: &str) -> Result<i64> {
    let s = s.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if s.is_empty() {
        return Err(Error::Config("empty duration".into()));
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    let value: i64 = digits
        .parse()
        .map_err(|_| Error::Config(format!("invalid duration: {}", s)))?;
    let unit = match suffix {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        _ => {
            return Err(Error::Config(format!("invalid duration suffix: {}", s)));
        }
    };
    let seconds = value
        .checked_mul(unit)
        .ok_or_else(|| Error::Config(format!("duration overflow: {}", s)))?;
    Ok(if negative { -seconds } else { seconds })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("600").unwrap(), 600);
        assert_eq!(parse_seconds("600s").unwrap(), 600);
        assert_eq!(parse_seconds("10m").unwrap(), 600);
        assert_eq!(parse_seconds("24h").unwrap(), 86400);
        assert_eq!(parse_seconds("30d").unwrap(), 2_592_000);
        assert_eq!(parse_seconds("1w").unwrap(), 604_800);
        assert_eq!(parse_seconds("-48h").unwrap(), -172_800);
        assert_eq!(parse_seconds(" 5m ").unwrap(), 300);
        assert!(parse_seconds("").is_err());
        assert!(parse_seconds("10x").is_err());
        assert!(parse_seconds("m").is_err());
    }

    #[test]
    fn test_defaults_from_empty_config() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.server.socket, PathBuf::from(DEFAULT_SOCKET));
        assert!(config.server.dbfile.is_none());
        assert!(config.jails.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let config = ServerConfig::parse(
            r#"
            [server]
            socket = "/tmp/test/bastille.sock"
            dbfile = "/tmp/test/bastille.db"
            dbpurgeage = "2d"

            [jails.sshd]
            bantime = "10m"
            findtime = "10m"
            maxretry = 5

            [jails.sshd.increment]
            enabled = true
            maxtime = "24h"
            multipliers = "1 2 4 8 16 32 64 128 256"
            rndtime = "5m"

            [jails.nginx]
            enabled = false
            bantime = "1h"
            "#,
        )
        .unwrap();
        assert_eq!(config.jails.len(), 2);
        let sshd = &config.jails["sshd"];
        assert!(sshd.enabled);
        assert_eq!(sshd.maxretry, 5);
        assert!(sshd.increment.as_ref().unwrap().enabled);
        assert!(!config.jails["nginx"].enabled);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(ServerConfig::parse("[jails.a]\nbantime = \"10x\"").is_err());
        assert!(ServerConfig::parse("[jails.a]\nmaxretry = 0").is_err());
        assert!(ServerConfig::parse(
            "[jails.a.increment]\nmultipliers = \"1 two\""
        )
        .is_err());
        assert!(ServerConfig::parse(
            "[jails.a.increment]\nformula = \"ban.Time *\""
        )
        .is_err());
        assert!(ServerConfig::parse("[server]\nnosuch = 1").is_err());
    }

    #[test]
    fn test_command_stream_order() {
        let config = ServerConfig::parse(
            r#"
            [server]
            dbfile = "/tmp/bastille.db"
            dbpurgeage = "1d"

            [jails.sshd]
            bantime = "10m"
            maxretry = 3

            [jails.sshd.increment]
            enabled = true
            maxtime = "24h"

            [jails.web]
            enabled = false
            "#,
        )
        .unwrap();
        let stream = config.command_stream(None);
        let flat: Vec<String> = stream.iter().map(|c| c.join(" ")).collect();
        assert_eq!(
            flat,
            [
                "set dbfile /tmp/bastille.db",
                "set dbpurgeage 86400",
                "add sshd",
                "set sshd bantime 600",
                "set sshd findtime 600",
                "set sshd maxretry 3",
                "set sshd bantime.increment true",
                "set sshd bantime.maxtime 86400",
                "start sshd",
            ]
        );
        // disabled jails never appear
        assert!(!flat.iter().any(|c| c.contains("web")));
    }

    #[test]
    fn test_command_stream_single_jail() {
        let config = ServerConfig::parse(
            r#"
            [server]
            dbfile = "/tmp/bastille.db"

            [jails.sshd]
            [jails.postfix]
            "#,
        )
        .unwrap();
        let stream = config.command_stream(Some("postfix"));
        let flat: Vec<String> = stream.iter().map(|c| c.join(" ")).collect();
        // no server-level commands, no other jails
        assert!(flat.iter().all(|c| c.contains("postfix")));
        assert_eq!(flat.first().unwrap(), "add postfix");
        assert_eq!(flat.last().unwrap(), "start postfix");

        // "all" behaves like a full-jail reload
        let stream = config.command_stream(Some("all"));
        let flat: Vec<String> = stream.iter().map(|c| c.join(" ")).collect();
        assert!(flat.iter().any(|c| c.contains("sshd")));
        assert!(flat.iter().any(|c| c.contains("postfix")));
    }
}
