//! Line protocol parser and response generator.
//!
//! After the handshake every request is one newline-terminated line:
//! a case-insensitive verb followed by whitespace-separated parameters.
//! - Probes: /ping, /port, /res_time
//! - Registry: /get, /post
//! - Other: /help, /exit
//!
//! Unknown verbs are not errors; they are answered with the help text.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::probes::{EchoResult, PortProbeResult, PortStatus, PortSummary, ProbeError};
use crate::registry::UserRecord;

/// Sent on connect, asks for the display name
pub const NAME_PROMPT: &str = "Welcome\nWhat is your username?\n";
/// Asks for the age
pub const AGE_PROMPT: &str = "How old are you?\n";
/// Asks again after an age that is not an integer
pub const AGE_REPROMPT: &str = "How old are you?!!\n";

/// Longest accepted request line, terminator excluded
pub const MAX_LINE_LEN: usize = 4096;

pub const HELP_TEXT: &str = "\n---------Command lines----------\n\
/help\n\
/ping <hostname/IP>\n\
/port <hostname/IP> <start_port> <end_port> <#num_requests>\n\
/res_time <hostname/IP> <port> <#num_requests>\n\
/get <user_ID>\n\
/post <user_name> <user_age>\n\
/exit\n\
'#' means you can send nothing:)\n\
--------------------------------------\n";

/// Parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ICMP echo probe of one host
    Ping { host: String },

    /// Scan `start..=end`, `attempts` connects per port
    Port {
        host: String,
        start: u16,
        end: u16,
        attempts: u32,
    },

    /// Repeated connect timing of one port
    ResTime {
        host: String,
        port: u16,
        attempts: u32,
    },

    /// Look up a user record
    Get { key: String },

    /// Create a new user record
    Post { name: String, age: i64 },

    /// Show the command list
    Help,

    /// Close the session
    Exit,
}

/// Bounds on the work a single command may request
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_scan_ports: u32,
    pub max_attempts: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_scan_ports: 1024,
            max_attempts: 100,
        }
    }
}

/// Malformed command errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Wrong number of parameters
    Usage(&'static str),
    /// A numeric parameter did not parse
    InvalidNumber { field: &'static str, value: String },
    /// Start port above end port
    InvalidRange { start: u16, end: u16 },
    /// Request exceeds a configured limit
    LimitExceeded { what: &'static str, max: u32 },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Usage(usage) => write!(f, "Usage: {}", usage),
            ParseError::InvalidNumber { field, value } => {
                write!(f, "Invalid {}: '{}' is not a valid number", field, value)
            }
            ParseError::InvalidRange { start, end } => {
                write!(f, "Invalid port range: {} is greater than {}", start, end)
            }
            ParseError::LimitExceeded { what, max } => {
                write!(f, "Too many {}: at most {} allowed", what, max)
            }
        }
    }
}

impl std::error::Error for ParseError {}

const PING_USAGE: &str = "/ping <hostname/IP>";
const PORT_USAGE: &str = "/port <hostname/IP> <start_port> <end_port> [num_requests]";
const RES_TIME_USAGE: &str = "/res_time <hostname/IP> <port> [num_requests]";
const GET_USAGE: &str = "/get <user_ID>";
const POST_USAGE: &str = "/post <user_name> <user_age>";
const EXIT_USAGE: &str = "/exit";

/// Parser for the session line protocol
pub struct Parser {
    limits: Limits,
}

impl Parser {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    /// Parse one request line (without its line terminator).
    pub fn parse(&self, line: &str) -> Result<Command, ParseError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((verb, params)) = parts.split_first() else {
            return Ok(Command::Help);
        };

        match verb.to_lowercase().as_str() {
            "/ping" => Self::parse_ping(params),
            "/port" => self.parse_port(params),
            "/res_time" => self.parse_res_time(params),
            "/get" => Self::parse_get(params),
            "/post" => Self::parse_post(params),
            "/exit" if params.is_empty() => Ok(Command::Exit),
            "/exit" => Err(ParseError::Usage(EXIT_USAGE)),
            _ => Ok(Command::Help),
        }
    }

    fn parse_ping(params: &[&str]) -> Result<Command, ParseError> {
        match params {
            [host] => Ok(Command::Ping {
                host: host.to_string(),
            }),
            _ => Err(ParseError::Usage(PING_USAGE)),
        }
    }

    /// Format: /port <host> <start> <end> [attempts]
    fn parse_port(&self, params: &[&str]) -> Result<Command, ParseError> {
        let (host, start, end, attempts) = match params {
            [host, start, end] => (host, start, end, None),
            [host, start, end, attempts] => (host, start, end, Some(attempts)),
            _ => return Err(ParseError::Usage(PORT_USAGE)),
        };

        let start = parse_port_number("start port", start)?;
        let end = parse_port_number("end port", end)?;
        if start > end {
            return Err(ParseError::InvalidRange { start, end });
        }
        let width = u32::from(end - start) + 1;
        if width > self.limits.max_scan_ports {
            return Err(ParseError::LimitExceeded {
                what: "ports",
                max: self.limits.max_scan_ports,
            });
        }

        Ok(Command::Port {
            host: host.to_string(),
            start,
            end,
            attempts: self.parse_attempts(attempts.copied())?,
        })
    }

    /// Format: /res_time <host> <port> [attempts]
    fn parse_res_time(&self, params: &[&str]) -> Result<Command, ParseError> {
        let (host, port, attempts) = match params {
            [host, port] => (host, port, None),
            [host, port, attempts] => (host, port, Some(attempts)),
            _ => return Err(ParseError::Usage(RES_TIME_USAGE)),
        };

        Ok(Command::ResTime {
            host: host.to_string(),
            port: parse_port_number("port", port)?,
            attempts: self.parse_attempts(attempts.copied())?,
        })
    }

    fn parse_get(params: &[&str]) -> Result<Command, ParseError> {
        match params {
            [key] => Ok(Command::Get {
                key: key.to_string(),
            }),
            _ => Err(ParseError::Usage(GET_USAGE)),
        }
    }

    fn parse_post(params: &[&str]) -> Result<Command, ParseError> {
        match params {
            [name, age] => Ok(Command::Post {
                name: name.to_string(),
                age: parse_age(age).ok_or_else(|| ParseError::InvalidNumber {
                    field: "age",
                    value: age.to_string(),
                })?,
            }),
            _ => Err(ParseError::Usage(POST_USAGE)),
        }
    }

    /// Number of requests, 1 when omitted
    fn parse_attempts(&self, value: Option<&str>) -> Result<u32, ParseError> {
        let Some(value) = value else {
            return Ok(1);
        };
        let attempts = match value.parse::<u32>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(ParseError::InvalidNumber {
                    field: "number of requests",
                    value: value.to_string(),
                })
            }
        };
        if attempts > self.limits.max_attempts {
            return Err(ParseError::LimitExceeded {
                what: "requests",
                max: self.limits.max_attempts,
            });
        }
        Ok(attempts)
    }
}

fn parse_port_number(field: &'static str, value: &str) -> Result<u16, ParseError> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ParseError::InvalidNumber {
            field,
            value: value.to_string(),
        }),
    }
}

/// Parse an age given as an integer literal (surrounding whitespace allowed)
pub fn parse_age(value: &str) -> Option<i64> {
    value.trim().parse().ok()
}

/// Body of a `/get` reply
#[derive(Debug, Serialize)]
struct UserView<'a> {
    id: &'a str,
    name: &'a str,
    age: i64,
    registered: String,
}

/// Response generator
pub struct Response;

impl Response {
    /// Command list
    pub fn help() -> &'static str {
        HELP_TEXT
    }

    /// Greeting sent once the handshake completes
    pub fn welcome(name: &str, key: &str) -> String {
        format!("\nHi {}:)\nYour user ID is {}\n{}", name, key, HELP_TEXT)
    }

    pub fn ping(host: &str, result: &EchoResult) -> String {
        match result.round_trip() {
            Some(rtt) => format!("{} is online.    Response time: {}", host, format_latency(rtt)),
            None => format!("{} is offline.", host),
        }
    }

    pub fn probe_error(host: &str, error: &ProbeError) -> String {
        format!("500 Internal Error\n\nCould not probe {}: {}", host, error)
    }

    pub fn port_summary(summary: &PortSummary) -> String {
        let mut out = String::new();
        for attempt in &summary.attempts {
            out.push_str(&Self::port_attempt(attempt));
            out.push('\n');
        }
        if let (Some(mean), true) = (summary.mean_latency, summary.attempts.len() > 1) {
            out.push_str(&format!(
                "Average response time for {} requests: {}\n",
                summary.attempts.len(),
                format_latency(mean)
            ));
        }
        out
    }

    pub fn port_range(summaries: &[PortSummary]) -> String {
        summaries
            .iter()
            .map(Self::port_summary)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn port_attempt(result: &PortProbeResult) -> String {
        match (result.status, result.latency) {
            (PortStatus::Open, Some(latency)) => format!(
                "Port {} on {} is open.    Response time: {}",
                result.port,
                result.host,
                format_latency(latency)
            ),
            (status, _) => format!("Port {} on {} is {}.", result.port, result.host, status),
        }
    }

    pub fn user(key: &str, record: &UserRecord) -> String {
        let view = UserView {
            id: key,
            name: &record.name,
            age: record.age,
            registered: record.registered_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        match serde_json::to_string(&view) {
            Ok(body) => format!("200 OK\n\n{}", body),
            Err(e) => format!("500 Internal Error\n\nCould not encode user {}: {}", key, e),
        }
    }

    pub fn not_found() -> &'static str {
        "404 Not Found\n\nUser not found"
    }

    /// `/post` always creates a separate record; the reply says so.
    pub fn created(key: &str) -> String {
        format!(
            "201 Created\n\nNew user stored under ID {} (your own session record is unchanged)",
            key
        )
    }

    pub fn bad_request(error: &ParseError) -> String {
        format!("400 Bad Request\n\n{}", error)
    }

    pub fn line_too_long() -> String {
        format!(
            "400 Bad Request\n\nLine too long (limit {} bytes), closing connection",
            MAX_LINE_LEN
        )
    }

    pub fn goodbye() -> &'static str {
        "Goodbye"
    }

    pub fn idle_timeout() -> &'static str {
        "Idle timeout, closing connection"
    }
}

fn format_latency(latency: Duration) -> String {
    format!("{:.3} ms", latency.as_secs_f64() * 1000.0)
}
