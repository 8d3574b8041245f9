//! Network probes.
//!
//! - `icmp`: ICMP echo ("ping") over a raw socket
//! - `tcp`: TCP connect probing, repeated sampling and range scans
//!
//! Timeouts and unresolvable targets are ordinary results. Only failures
//! the caller can act on surface as [`ProbeError`].

pub mod icmp;
pub mod tcp;

pub use icmp::{EchoProber, EchoResult};
pub use tcp::{PortProber, PortProbeResult, PortStatus, PortSummary};

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Probe errors that are not a normal negative outcome
#[derive(Debug)]
pub enum ProbeError {
    /// Raw socket creation was refused by the OS
    PermissionDenied(io::Error),
    /// Any other socket failure
    Io(io::Error),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::PermissionDenied(e) => write!(
                f,
                "{}: ICMP messages can only be sent by processes running as root \
                 (or with CAP_NET_RAW), or with administrator rights on Windows",
                e
            ),
            ProbeError::Io(e) => write!(f, "socket error: {}", e),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::PermissionDenied(e) | ProbeError::Io(e) => Some(e),
        }
    }
}

impl From<io::Error> for ProbeError {
    fn from(e: io::Error) -> Self {
        ProbeError::Io(e)
    }
}

/// Resolve `host` to its first IPv4 address.
///
/// Returns `None` when the name does not resolve, has no IPv4 address, or
/// resolution takes longer than `timeout`.
pub(crate) async fn resolve_ipv4(host: &str, timeout: Duration) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_ipv4().then_some(ip);
    }

    let lookup = tokio::net::lookup_host((host, 0));
    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(mut addrs)) => addrs.find(SocketAddr::is_ipv4).map(|addr| addr.ip()),
        Ok(Err(_)) | Err(_) => None,
    }
}
