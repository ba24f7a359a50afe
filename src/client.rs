// src/client.rs

//! Control-channel client.
//!
//! Forwards single commands to a running daemon and orchestrates the
//! multi-step operations: `start` (spawn the daemon, wait for the socket,
//! play the config stream), `restart` and `reload`. Also hosts the
//! interactive prompt.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::protocol::{self, Response};
use crate::server::ControlServer;
use std::io::{BufRead, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Interactive prompt.
const PROMPT: &str = "bastille> ";

/// Wait-loop backoff bounds.
const WAIT_SLEEP_MIN: Duration = Duration::from_micros(6_250);
const WAIT_SLEEP_MAX: Duration = Duration::from_millis(500);

/// One connection to the daemon carrying framed commands.
#[derive(Debug)]
pub struct ControlSocket {
    stream: UnixStream,
}

impl ControlSocket {
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match UnixStream::connect(path) {
            Ok(stream) => Ok(Self { stream }),
            Err(e) => Err(diagnose_socket_error(path, &e)),
        }
    }

    /// Send one command and read its reply.
    pub fn send(&mut self, command: &[String]) -> Result<Response> {
        protocol::write_command(&mut self.stream, command)?;
        protocol::read_response(&mut self.stream)
    }
}

/// Turn a connect failure into something actionable: missing daemon,
/// bad permissions, or a missing socket path.
fn diagnose_socket_error(path: &Path, err: &std::io::Error) -> Error {
    if path.exists() {
        let writable = nix::unistd::access(path, nix::unistd::AccessFlags::W_OK).is_ok();
        if writable {
            Error::SocketUnavailable(format!(
                "unable to contact server at {}; is it running? ({})",
                path.display(),
                err
            ))
        } else {
            Error::SocketUnavailable(format!(
                "permission denied to socket: {} (you must be root)",
                path.display()
            ))
        }
    } else {
        Error::SocketUnavailable(format!(
            "failed to access socket path: {}; is bastilled running?",
            path.display()
        ))
    }
}

/// Everything the client needs to know, resolved from the command line
/// and the config file.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub socket: PathBuf,
    pub config: PathBuf,
    pub timeout: Duration,
    pub verbose: u8,
    pub force: bool,
    pub background: bool,
}

pub struct Client {
    opts: ClientOptions,
}

impl Client {
    pub fn new(opts: ClientOptions) -> Self {
        Self { opts }
    }

    /// Process one command line. `start`, `restart` and `reload` are
    /// orchestrated locally; anything else is forwarded verbatim.
    pub fn run_command(&self, command: &[String]) -> Result<()> {
        match command.first().map(String::as_str) {
            Some("start") if command.len() == 1 => self.start_server(),
            Some("restart") if command.len() == 1 => self.restart_server(),
            Some("reload") => self.reload(command.get(1).map(String::as_str)),
            Some(_) => self.process_cmds(&[command.to_vec()], true),
            None => Err(Error::Command("empty command".into())),
        }
    }

    /// Whether a daemon answers on the socket.
    pub fn ping(&self) -> bool {
        let mut socket = match ControlSocket::connect(&self.opts.socket) {
            Ok(socket) => socket,
            Err(e) => {
                debug!("ping failed: {}", e);
                return false;
            }
        };
        matches!(socket.send(&[String::from("ping")]), Ok(r) if r.is_ok())
    }

    /// Send a batch of commands over one connection. With `show` the
    /// replies are printed; `echo` replies always are.
    fn process_cmds(&self, commands: &[Vec<String>], show: bool) -> Result<()> {
        let mut socket = ControlSocket::connect(&self.opts.socket)?;
        let mut failed = None;
        for command in commands {
            let response = socket.send(command)?;
            if response.is_ok() {
                debug!("OK: {:?}", response.payload);
                if show || command.first().map(String::as_str) == Some("echo") {
                    for line in &response.payload {
                        println!("{}", line);
                    }
                }
            } else {
                let (kind, message) = match response.payload.as_slice() {
                    [kind, message, ..] => (kind.clone(), message.clone()),
                    _ => ("unknown".to_string(), "command failed".to_string()),
                };
                error!("NOK: {} ({})", message, kind);
                if failed.is_none() {
                    failed = Some(Error::Command(message));
                }
            }
        }
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Validate the environment and produce the config stream for a
    /// server start.
    fn prepare_start(&self) -> Result<Vec<Vec<String>>> {
        if self.ping() {
            return Err(Error::Command("server already running".into()));
        }
        let config = ServerConfig::load(&self.opts.config)?;

        let socket_dir = self.opts.socket.parent().unwrap_or(Path::new("/"));
        if !socket_dir.exists() {
            return Err(Error::SocketUnavailable(format!(
                "there is no directory {} to contain the socket file {}",
                socket_dir.display(),
                self.opts.socket.display()
            )));
        }
        if nix::unistd::access(
            socket_dir,
            nix::unistd::AccessFlags::W_OK | nix::unistd::AccessFlags::X_OK,
        )
        .is_err()
        {
            return Err(Error::SocketUnavailable(format!(
                "directory {} exists but is not writable",
                socket_dir.display()
            )));
        }
        if !self.opts.force && self.opts.socket.exists() {
            return Err(Error::SocketUnavailable(
                "bastille seems to be in an unexpected state (not running but the socket exists); \
                 use -x to start anyway"
                    .into(),
            ));
        }

        let mut stream = config.command_stream(None);
        stream.push(vec!["echo".into(), "Server ready".into()]);
        Ok(stream)
    }

    fn start_server(&self) -> Result<()> {
        let stream = self.prepare_start()?;
        if self.opts.background {
            self.spawn_daemon()?;
            self.wait_on_server(true)?;
            self.process_cmds(&stream, false)
        } else {
            // foreground: serve here, configure from a helper thread
            let server = ControlServer::new(&self.opts.socket, self.opts.force);
            let configurator = Client::new(self.opts.clone());
            let handle = std::thread::Builder::new()
                .name("configure".to_string())
                .spawn(move || {
                    if let Err(e) = configurator
                        .wait_on_server(true)
                        .and_then(|_| configurator.process_cmds(&stream, false))
                    {
                        error!("failed to configure server: {}", e);
                    }
                })
                .map_err(Error::Io)?;
            let result = server.run();
            let _ = handle.join();
            result
        }
    }

    fn restart_server(&self) -> Result<()> {
        // a stop against a dead server is not an error worth aborting for
        if let Err(e) = self.process_cmds(&[vec!["stop".into()]], false) {
            debug!("stop before restart: {}", e);
        }
        self.wait_on_server(false)?;
        self.start_server()
    }

    fn reload(&self, jail: Option<&str>) -> Result<()> {
        if !self.ping() {
            return Err(Error::SocketUnavailable(
                "could not find server to reload".into(),
            ));
        }
        let config = ServerConfig::load(&self.opts.config)?;
        let jail = jail.unwrap_or("all");
        self.process_cmds(&[vec!["stop".into(), jail.into()]], false)?;
        self.process_cmds(&config.command_stream(Some(jail)), true)
    }

    /// Poll until the server's aliveness matches `alive`, with
    /// exponential backoff from 6.25 ms doubling to a 500 ms cap.
    pub fn wait_on_server(&self, alive: bool) -> Result<()> {
        debug!("waiting on server: alive={}", alive);
        let started = Instant::now();
        let mut sleep = WAIT_SLEEP_MIN;
        let mut progress = VisualWait::new(self.opts.verbose);
        loop {
            let up = self.opts.socket.exists() && self.ping();
            if up == alive {
                return Ok(());
            }
            if started.elapsed() > Duration::from_secs(1) {
                progress.heartbeat();
            }
            if started.elapsed() >= self.opts.timeout {
                return Err(Error::StartTimeout(format!(
                    "server still {} after {:?}",
                    if alive { "unreachable" } else { "running" },
                    self.opts.timeout
                )));
            }
            std::thread::sleep(sleep);
            sleep = (sleep * 2).min(WAIT_SLEEP_MAX);
        }
    }

    fn spawn_daemon(&self) -> Result<()> {
        let mut command = std::process::Command::new(daemon_binary());
        command.arg("-s").arg(&self.opts.socket);
        if self.opts.force {
            command.arg("-x");
        }
        let child = command
            .stdin(std::process::Stdio::null())
            .spawn()
            .map_err(|e| Error::Command(format!("failed to spawn bastilled: {}", e)))?;
        debug!("spawned bastilled (pid {})", child.id());
        Ok(())
    }

    /// Interactive prompt; `help`, `exit` and `quit` are local, anything
    /// else goes through [`Client::run_command`].
    pub fn interactive(&self) -> Result<()> {
        println!("Bastille reads log-derived failure reports and bans the");
        println!("offending hosts with exponentially growing ban times.");
        println!();
        let stdin = std::io::stdin();
        let mut lines = stdin.lock().lines();
        loop {
            print!("{}", PROMPT);
            std::io::stdout().flush()?;
            let line = match lines.next() {
                Some(line) => line?,
                None => return Ok(()),
            };
            let line = line.trim();
            match line {
                "" => continue,
                "exit" | "quit" => return Ok(()),
                "help" => print_usage(),
                _ => {
                    let command = split_command_line(line);
                    if let Err(e) = self.run_command(&command) {
                        error!("{}", e);
                    }
                }
            }
        }
    }
}

/// Command summary for the prompt and `--help` epilogue.
pub fn print_usage() {
    println!("Commands:");
    println!("  start                     start the server and load configuration");
    println!("  restart                   stop and start the server");
    println!("  reload [jail]             reload configuration (optionally one jail)");
    println!("  stop                      shut the server down");
    println!("  ping                      check the server is answering");
    println!("  status [jail]             server or jail status");
    println!("  add <jail>                define a jail");
    println!("  set <jail> <key> <value>  change a jail setting");
    println!("  get <jail> <key>          read a jail setting");
    println!("  echo <text>               round-trip text through the server");
    println!("  help                      this list");
    println!("  exit, quit                leave the prompt");
}

/// Split an interactive line into command tokens. Double and single
/// quotes group words; backslash escapes the next character outside
/// single quotes.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some('"') => match c {
                '"' => quote = None,
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                _ => current.push(c),
            },
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        in_token = true;
                    }
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
            Some(_) => unreachable!("quote is only ever set to '\\'' or '\"'"),
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

fn daemon_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("bastilled");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("bastilled")
}

/// Progress indication while waiting on the server, shown only when the
/// client is chatty (verbosity above 1). A `#` walks back and forth in a
/// fixed-width bar using cursor moves; dropping the guard erases it.
struct VisualWait {
    enabled: bool,
    pos: i32,
    delta: i32,
    maxpos: i32,
}

impl VisualWait {
    fn new(verbose: u8) -> Self {
        Self {
            enabled: verbose > 1,
            pos: 0,
            delta: 1,
            maxpos: 10,
        }
    }

    fn heartbeat(&mut self) {
        if !self.enabled {
            return;
        }
        let mut out = std::io::stdout();
        if self.pos == 0 {
            let _ = write!(
                out,
                "\nINFO   [#{}] Waiting on the server...\r\x1b[8C",
                " ".repeat(self.maxpos as usize)
            );
        }
        self.pos += self.delta;
        let step = if self.delta > 0 {
            if self.pos > 1 {
                " #\x1b[1D"
            } else {
                "# \x1b[2D"
            }
        } else {
            "\x1b[1D# \x1b[2D"
        };
        let _ = write!(out, "{}", step);
        let _ = out.flush();
        if self.pos > self.maxpos {
            self.delta = -1;
        } else if self.pos < 2 {
            self.delta = 1;
        }
    }
}

impl Drop for VisualWait {
    fn drop(&mut self) {
        if self.enabled && self.pos > 0 {
            let mut out = std::io::stdout();
            let _ = write!(out, "\r{}\r", " ".repeat(35 + self.maxpos as usize));
            let _ = out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_words() {
        assert_eq!(
            split_command_line("set sshd bantime 600"),
            ["set", "sshd", "bantime", "600"]
        );
        assert_eq!(split_command_line("  ping  "), ["ping"]);
        assert!(split_command_line("").is_empty());
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn test_split_quoted_tokens() {
        assert_eq!(
            split_command_line(r#"set sshd bantime.formula "ban.Time * 2""#),
            ["set", "sshd", "bantime.formula", "ban.Time * 2"]
        );
        assert_eq!(
            split_command_line("echo 'a b' c"),
            ["echo", "a b", "c"]
        );
        // empty quoted string is a real token
        assert_eq!(split_command_line("echo ''"), ["echo", ""]);
    }

    #[test]
    fn test_split_escapes() {
        assert_eq!(split_command_line(r"echo a\ b"), ["echo", "a b"]);
        assert_eq!(split_command_line(r#"echo "a \"b\"""#), ["echo", "a \"b\""]);
        // backslash is literal inside single quotes
        assert_eq!(split_command_line(r"echo 'a\b'"), ["echo", r"a\b"]);
    }

    #[test]
    fn test_connect_diagnosis_for_missing_socket() {
        let err = ControlSocket::connect("/nonexistent/bastille.sock").unwrap_err();
        match err {
            Error::SocketUnavailable(message) => {
                assert!(message.contains("failed to access socket path"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_ping_false_without_server() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = Client::new(ClientOptions {
            socket: dir.path().join("none.sock"),
            config: dir.path().join("none.toml"),
            timeout: Duration::from_secs(1),
            verbose: 0,
            force: false,
            background: true,
        });
        assert!(!client.ping());
    }

    #[test]
    fn test_wait_on_server_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let client = Client::new(ClientOptions {
            socket: dir.path().join("none.sock"),
            config: dir.path().join("none.toml"),
            timeout: Duration::from_millis(200),
            verbose: 0,
            force: false,
            background: true,
        });
        let started = Instant::now();
        let err = client.wait_on_server(true).unwrap_err();
        assert!(matches!(err, Error::StartTimeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        // waiting for "not alive" succeeds immediately
        client.wait_on_server(false).unwrap();
    }
}
