//! Per-connection session state machine.
//!
//! ```text
//! Connecting -> AwaitingName -> AwaitingAge -> Active -> Closed
//!                                 ^      |       ^  |
//!                                 +------+       +--+
//!                          age not an integer   one command per line
//! ```
//!
//! A session leaves `Active` on `/exit`, end of input, a read error, an
//! oversized line, the idle deadline, or the server's close signal. The
//! close signal ends a pending read or write at once and stops multi-attempt
//! scans between attempts; a single ping or connect in flight still finishes.

mod table;

pub use table::{CloseSignal, SessionTable};

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::probes::{EchoProber, PortProber};
use crate::protocol::{
    parse_age, Command, Limits, Parser, Response, AGE_PROMPT, AGE_REPROMPT, MAX_LINE_LEN,
    NAME_PROMPT,
};
use crate::registry::Registry;

/// Everything a session's commands may touch, shared by all sessions.
pub struct Services {
    pub registry: Arc<Registry>,
    pub echo: EchoProber,
    pub ports: PortProber,
    pub parser: Parser,
    pub idle_timeout: Option<Duration>,
}

impl Services {
    pub fn new(config: &Config, registry: Arc<Registry>) -> Self {
        Self {
            registry,
            echo: EchoProber::new(config.ping_timeout()),
            ports: PortProber::new(config.port_timeout(), config.attempt_pause()),
            parser: Parser::new(Limits {
                max_scan_ports: config.max_scan_ports,
                max_attempts: config.max_attempts,
            }),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Protocol state of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingName,
    AwaitingAge { name: String },
    Active,
    Closed,
}

enum Input {
    Line(String),
    Eof,
    Idle,
    TooLong,
    CloseRequested,
}

/// One client connection and its protocol state.
pub struct Session<S> {
    id: usize,
    stream: BufReader<S>,
    state: SessionState,
    user_key: Option<String>,
    close: CloseSignal,
    services: Arc<Services>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(id: usize, stream: S, close: CloseSignal, services: Arc<Services>) -> Self {
        Self {
            id,
            stream: BufReader::new(stream),
            state: SessionState::Connecting,
            user_key: None,
            close,
            services,
        }
    }

    /// Drive the session until it closes, then release its registry entry
    /// and connection.
    pub async fn run(mut self) -> io::Result<()> {
        let result = self.drive().await;
        self.finish().await;
        result
    }

    async fn drive(&mut self) -> io::Result<()> {
        loop {
            let state = std::mem::replace(&mut self.state, SessionState::Closed);
            trace!(session = self.id, ?state, "Session step");

            self.state = match state {
                SessionState::Connecting => {
                    self.send_raw(NAME_PROMPT).await?;
                    SessionState::AwaitingName
                }

                SessionState::AwaitingName => match self.next_input().await? {
                    Input::Line(name) => {
                        self.send_raw(AGE_PROMPT).await?;
                        SessionState::AwaitingAge { name }
                    }
                    _ => SessionState::Closed,
                },

                SessionState::AwaitingAge { name } => match self.next_input().await? {
                    Input::Line(line) => match parse_age(&line) {
                        Some(age) => self.activate(name, age).await?,
                        None => {
                            self.send_raw(AGE_REPROMPT).await?;
                            SessionState::AwaitingAge { name }
                        }
                    },
                    _ => SessionState::Closed,
                },

                SessionState::Active => match self.next_input().await? {
                    Input::Line(line) => self.dispatch(&line).await?,
                    _ => SessionState::Closed,
                },

                SessionState::Closed => return Ok(()),
            };
        }
    }

    /// Wait for the next line, the idle deadline or the close signal.
    async fn next_input(&mut self) -> io::Result<Input> {
        let read = read_input(&mut self.stream, self.services.idle_timeout);

        let input = tokio::select! {
            biased;
            _ = self.close.cancelled() => Input::CloseRequested,
            read = read => read?,
        };

        match input {
            Input::Eof => trace!(session = self.id, "Connection closed by client"),
            Input::Idle => {
                debug!(session = self.id, "Idle timeout");
                // best effort, the session is closing either way
                let _ = self.send_line(Response::idle_timeout()).await;
            }
            Input::TooLong => {
                debug!(session = self.id, limit = MAX_LINE_LEN, "Line too long");
                let _ = self.send_line(&Response::line_too_long()).await;
            }
            Input::CloseRequested => debug!(session = self.id, "Close requested by server"),
            Input::Line(_) => {}
        }
        Ok(input)
    }

    /// Register the user and enter the command loop.
    async fn activate(&mut self, name: String, age: i64) -> io::Result<SessionState> {
        let key = self.services.registry.post(&name, age);
        info!(session = self.id, name = %name, key = %key, "User connected");

        let welcome = Response::welcome(&name, &key);
        self.user_key = Some(key);
        self.send_raw(&welcome).await?;
        Ok(SessionState::Active)
    }

    async fn dispatch(&mut self, line: &str) -> io::Result<SessionState> {
        let command = match self.services.parser.parse(line) {
            Ok(command) => command,
            Err(e) => {
                debug!(session = self.id, error = %e, "Malformed command");
                self.send_line(&Response::bad_request(&e)).await?;
                return Ok(SessionState::Active);
            }
        };

        trace!(session = self.id, ?command, "Processing command");
        if command == Command::Exit {
            self.send_line(Response::goodbye()).await?;
            return Ok(SessionState::Closed);
        }

        let response = execute_command(command, &self.services, &self.close).await;
        self.send_line(&response).await?;
        Ok(SessionState::Active)
    }

    async fn send_raw(&mut self, text: &str) -> io::Result<()> {
        self.write_parts(&[text.as_bytes()]).await
    }

    async fn send_line(&mut self, text: &str) -> io::Result<()> {
        self.write_parts(&[text.as_bytes(), &b"\n"[..]]).await
    }

    /// Write and flush `parts`, giving up if the server closes the session
    /// while the client is not reading.
    async fn write_parts(&mut self, parts: &[&[u8]]) -> io::Result<()> {
        let stream = &mut self.stream;
        let write = async move {
            for part in parts {
                stream.write_all(part).await?;
            }
            stream.flush().await
        };

        tokio::select! {
            biased;
            _ = self.close.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session closed by server",
            )),
            written = write => written,
        }
    }

    async fn finish(&mut self) {
        self.state = SessionState::Closed;
        if let Some(key) = self.user_key.take() {
            self.services.registry.delete(&key);
            info!(session = self.id, key = %key, "User disconnected");
        }
        if let Err(e) = self.stream.shutdown().await {
            trace!(session = self.id, error = %e, "Shutdown after close failed");
        }
    }
}

/// Read one line of at most `MAX_LINE_LEN` bytes, stripped of its terminator.
async fn read_input<R>(reader: &mut R, idle_timeout: Option<Duration>) -> io::Result<Input>
where
    R: AsyncBufRead + Unpin,
{
    // room for the longest line plus "\r\n"
    let limit = MAX_LINE_LEN as u64 + 2;
    let mut buf = Vec::new();
    let mut limited = (&mut *reader).take(limit);

    let n = match idle_timeout {
        Some(idle) => match tokio::time::timeout(idle, limited.read_until(b'\n', &mut buf)).await {
            Ok(read) => read?,
            Err(_) => return Ok(Input::Idle),
        },
        None => limited.read_until(b'\n', &mut buf).await?,
    };
    if n == 0 {
        return Ok(Input::Eof);
    }

    let terminated = buf.last() == Some(&b'\n');
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    if end > MAX_LINE_LEN || (!terminated && n as u64 == limit) {
        return Ok(Input::TooLong);
    }
    Ok(Input::Line(String::from_utf8_lossy(&buf[..end]).into_owned()))
}

/// Execute a command other than `/exit`, returning the response text.
///
/// Port scans stop between attempts once `close` is cancelled.
async fn execute_command(command: Command, services: &Services, close: &CloseSignal) -> String {
    match command {
        Command::Ping { host } => match services.echo.probe(&host).await {
            Ok(result) => {
                debug!(host = %host, timed_out = result.timed_out(), "Ping finished");
                Response::ping(&host, &result)
            }
            Err(e) => {
                warn!(host = %host, error = %e, "Ping failed");
                Response::probe_error(&host, &e)
            }
        },

        Command::Port {
            host,
            start,
            end,
            attempts,
        } => {
            let summaries = services
                .ports
                .stopping_on(close.clone())
                .probe_range(&host, start, end, attempts)
                .await;
            Response::port_range(&summaries)
        }

        Command::ResTime {
            host,
            port,
            attempts,
        } => {
            let summary = services
                .ports
                .stopping_on(close.clone())
                .probe_repeated(&host, port, attempts)
                .await;
            Response::port_summary(&summary)
        }

        Command::Get { key } => match services.registry.get(&key) {
            Some(record) => Response::user(&key, &record),
            None => Response::not_found().to_string(),
        },

        Command::Post { name, age } => {
            let key = services.registry.post(&name, age);
            Response::created(&key)
        }

        Command::Help | Command::Exit => Response::help().to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Client-side helpers for driving a session in tests.

    use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

    /// Last line of the help text, which ends the welcome message.
    pub const HELP_END: &str = "--------------------------------------";

    /// Read lines until one contains `needle`; returns everything read.
    pub async fn read_until<R: AsyncBufRead + Unpin>(reader: &mut R, needle: &str) -> String {
        let mut seen = String::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed before {needle:?}; got {seen:?}");
            seen.push_str(&line);
            if line.contains(needle) {
                return seen;
            }
        }
    }

    pub async fn send<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) {
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();
        writer.flush().await.unwrap();
    }

    /// Complete the handshake and consume the welcome text.
    pub async fn handshake<R, W>(reader: &mut R, writer: &mut W, name: &str, age: &str) -> String
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        read_until(reader, "username?").await;
        send(writer, name).await;
        read_until(reader, "How old").await;
        send(writer, age).await;
        read_until(reader, HELP_END).await
    }
}
