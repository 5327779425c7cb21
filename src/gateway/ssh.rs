//! SSH transport with an interactive shell channel.
//!
//! The router refuses concurrent exec channels, so commands are typed into a
//! single shell and the output is read back until the prompt reappears.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use ssh2::{Channel, ErrorCode, Session};

use super::{Transport, TransportError};
use crate::config::SshConfig;

/// Blocking read slice; reads loop until the overall deadline.
const READ_SLICE_MS: u32 = 250;

/// libssh2's LIBSSH2_ERROR_TIMEOUT.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

const MORE_MARKER: &str = "---- More ----";

pub struct SshTransport {
    config: SshConfig,
    session: Option<Session>,
    channel: Option<Channel>,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            session: None,
            channel: None,
        }
    }
}

impl Transport for SshTransport {
    fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.disconnect();

        tracing::info!("Connecting to device at {}:{}", self.config.host, self.config.port);

        let addr = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Connection(format!("failed to resolve {}: {}", self.config.host, e)))?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("no address for {}", self.config.host)))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| TransportError::Connection(format!("failed to connect: {}", e)))?;

        let mut session = Session::new().map_err(|e| ssh_error("session setup", e, timeout))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session.handshake().map_err(|e| ssh_error("handshake", e, timeout))?;
        session
            .userauth_password(&self.config.username, &self.config.password)
            .map_err(|e| ssh_error("authentication", e, timeout))?;
        if !session.authenticated() {
            return Err(TransportError::Connection("authentication rejected".to_string()));
        }

        let mut channel = session
            .channel_session()
            .map_err(|e| ssh_error("open channel", e, timeout))?;
        channel
            .request_pty("vt100", None, Some((512, 48, 0, 0)))
            .map_err(|e| ssh_error("request pty", e, timeout))?;
        channel.shell().map_err(|e| ssh_error("start shell", e, timeout))?;

        session.set_timeout(READ_SLICE_MS);

        // Banner and first prompt.
        read_until_prompt(&mut channel, timeout)?;

        self.session = Some(session);
        self.channel = Some(channel);
        tracing::info!("Device session established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.channel.as_ref().map_or(false, |c| !c.eof())
    }

    fn run(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| TransportError::Connection("not connected".to_string()))?;

        drain(channel);

        channel
            .write_all(format!("{}\n", command).as_bytes())
            .and_then(|_| channel.flush())
            .map_err(|e| TransportError::Connection(format!("failed to send command: {}", e)))?;

        let raw = read_until_prompt(channel, timeout)?;
        Ok(clean_output(&raw))
    }

    fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.close();
        }
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "peerwatch closing session", None);
        }
    }
}

fn ssh_error(stage: &str, e: ssh2::Error, timeout: Duration) -> TransportError {
    if matches!(e.code(), ErrorCode::Session(code) if code == LIBSSH2_ERROR_TIMEOUT) {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Connection(format!("{} failed: {}", stage, e))
    }
}

/// Discard anything the device printed since the last prompt.
fn drain(channel: &mut Channel) {
    let mut chunk = [0u8; 4096];
    loop {
        match channel.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}

fn read_until_prompt(channel: &mut Channel, timeout: Duration) -> Result<String, TransportError> {
    let deadline = Instant::now() + timeout;
    let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);
    let mut chunk = [0u8; 8192];

    loop {
        if Instant::now() >= deadline {
            return Err(TransportError::Timeout(timeout));
        }

        match channel.read(&mut chunk) {
            Ok(0) => {
                if channel.eof() {
                    return Err(TransportError::Connection("channel closed by device".to_string()));
                }
            }
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);

                if String::from_utf8_lossy(&chunk[..n]).contains(MORE_MARKER) {
                    channel
                        .write_all(b" ")
                        .map_err(|e| TransportError::Connection(format!("failed to page output: {}", e)))?;
                    continue;
                }

                if ends_with_prompt(&text) {
                    return Ok(text.into_owned());
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(TransportError::Connection(format!("read failed: {}", e))),
        }
    }
}

fn prompt_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(<[^<>\s][^<>]*>|\[[^\[\]\s][^\[\]]*\])$").unwrap())
}

fn ends_with_prompt(text: &str) -> bool {
    text.trim_end()
        .lines()
        .last()
        .map_or(false, |line| prompt_regex().is_match(line.trim()))
}

/// Strip terminal control sequences, pager markers, the echoed command line
/// and the trailing prompt.
pub fn clean_output(raw: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let ansi = ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());

    let text = raw.replace(MORE_MARKER, "").replace('\r', "");
    let text = ansi.replace_all(&text, "");

    let mut lines: Vec<&str> = text.lines().collect();
    if lines.last().map_or(false, |l| prompt_regex().is_match(l.trim())) {
        lines.pop();
    }
    if !lines.is_empty() {
        lines.remove(0);
    }

    lines
        .into_iter()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}
