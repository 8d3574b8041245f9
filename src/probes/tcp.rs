//! TCP connect probing.
//!
//! Every attempt resolves the host and opens a fresh connection with the
//! timeout applied to the connect only, then closes it immediately.
//! Repeated attempts against one port are spaced by a fixed pause so a scan
//! never floods the target. A stop token ends repeated and range probes
//! between attempts; the connect in flight always completes.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::resolve_ipv4;

/// Reachability of one port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Open,
    /// Connection refused or reset
    Closed,
    /// Timed out, did not resolve, or failed otherwise
    Unreachable,
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortStatus::Open => write!(f, "open"),
            PortStatus::Closed => write!(f, "closed"),
            PortStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Result of a single connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProbeResult {
    pub host: String,
    pub port: u16,
    pub status: PortStatus,
    /// Connect latency, present iff the port is open
    pub latency: Option<Duration>,
}

impl PortProbeResult {
    fn open(host: &str, port: u16, latency: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            status: PortStatus::Open,
            latency: Some(latency),
        }
    }

    fn not_open(host: &str, port: u16, status: PortStatus) -> Self {
        Self {
            host: host.to_string(),
            port,
            status,
            latency: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PortStatus::Open
    }
}

/// All attempts against one port, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSummary {
    pub host: String,
    pub port: u16,
    pub attempts: Vec<PortProbeResult>,
    /// Mean latency over the successful attempts, if any succeeded
    pub mean_latency: Option<Duration>,
}

impl PortSummary {
    fn new(host: &str, port: u16, attempts: Vec<PortProbeResult>) -> Self {
        let mean_latency = mean_latency(&attempts);
        Self {
            host: host.to_string(),
            port,
            attempts,
            mean_latency,
        }
    }

    pub fn any_open(&self) -> bool {
        self.attempts.iter().any(PortProbeResult::is_open)
    }
}

/// Mean of the latencies of the open attempts
fn mean_latency(attempts: &[PortProbeResult]) -> Option<Duration> {
    let latencies: Vec<Duration> = attempts.iter().filter_map(|a| a.latency).collect();
    if latencies.is_empty() {
        return None;
    }
    Some(latencies.iter().sum::<Duration>() / latencies.len() as u32)
}

/// Connect-based port prober
#[derive(Debug, Clone)]
pub struct PortProber {
    timeout: Duration,
    pause: Duration,
    stop: CancellationToken,
}

impl PortProber {
    /// `timeout` bounds each connect; `pause` separates repeated attempts
    /// against the same port.
    pub fn new(timeout: Duration, pause: Duration) -> Self {
        Self {
            timeout,
            pause,
            stop: CancellationToken::new(),
        }
    }

    /// A copy of this prober whose repeated and range probes end early once
    /// `stop` is cancelled. Results gathered so far are still returned.
    pub fn stopping_on(&self, stop: CancellationToken) -> Self {
        Self {
            stop,
            ..self.clone()
        }
    }

    /// Probe `host:port` once.
    pub async fn probe_one(&self, host: &str, port: u16) -> PortProbeResult {
        let ip = resolve_ipv4(host, self.timeout).await;
        self.attempt(host, ip, port).await
    }

    /// Probe `host:port` `attempts` times, pausing between attempts.
    pub async fn probe_repeated(&self, host: &str, port: u16, attempts: u32) -> PortSummary {
        let mut results = Vec::with_capacity(attempts as usize);

        for n in 0..attempts {
            if self.stop.is_cancelled() {
                debug!(host, port, done = n, attempts, "Repeated probe stopped");
                break;
            }
            if n > 0 {
                tokio::select! {
                    biased;
                    _ = self.stop.cancelled() => continue,
                    _ = tokio::time::sleep(self.pause) => {}
                }
            }
            results.push(self.probe_one(host, port).await);
        }

        PortSummary::new(host, port, results)
    }

    /// Probe every port in `start..=end` in ascending order.
    pub async fn probe_range(
        &self,
        host: &str,
        start: u16,
        end: u16,
        attempts: u32,
    ) -> Vec<PortSummary> {
        let mut summaries = Vec::with_capacity((start..=end).len());

        for port in start..=end {
            if self.stop.is_cancelled() {
                debug!(host, port, "Range scan stopped");
                break;
            }
            summaries.push(self.probe_repeated(host, port, attempts).await);
        }

        debug!(
            host,
            start,
            end,
            open = summaries.iter().filter(|s| s.any_open()).count(),
            "Port range scan finished"
        );
        summaries
    }

    async fn attempt(&self, host: &str, ip: Option<IpAddr>, port: u16) -> PortProbeResult {
        let Some(ip) = ip else {
            return PortProbeResult::not_open(host, port, PortStatus::Unreachable);
        };
        let addr = SocketAddr::new(ip, port);

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let latency = started.elapsed();
                drop(stream);
                PortProbeResult::open(host, port, latency)
            }
            Ok(Err(e)) => PortProbeResult::not_open(host, port, classify_connect_error(&e)),
            Err(_) => PortProbeResult::not_open(host, port, PortStatus::Unreachable),
        };

        trace!(%addr, status = %result.status, latency = ?result.latency, "Connect attempt");
        result
    }
}

fn classify_connect_error(e: &io::Error) -> PortStatus {
    match e.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => PortStatus::Closed,
        _ => PortStatus::Unreachable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn prober() -> PortProber {
        PortProber::new(Duration::from_millis(500), Duration::from_millis(50))
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_closed_port() {
        let port = closed_port().await;
        let result = prober().probe_one("127.0.0.1", port).await;
        assert_eq!(result.status, PortStatus::Closed);
        assert_eq!(result.port, port);
        assert!(result.latency.is_none());
    }

    #[tokio::test]
    async fn test_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = prober().probe_one("127.0.0.1", port).await;
        assert!(result.is_open());
        assert!(result.latency.is_some());
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let result = prober().probe_one("no-such-host.invalid", 80).await;
        assert_eq!(result.status, PortStatus::Unreachable);
        assert!(result.latency.is_none());
    }

    #[tokio::test]
    async fn test_repeated_attempts_are_paced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let started = Instant::now();
        let summary = prober().probe_repeated("127.0.0.1", port, 3).await;

        assert_eq!(summary.attempts.len(), 3);
        assert!(summary.attempts.iter().all(PortProbeResult::is_open));
        assert!(summary.mean_latency.is_some());
        // two pauses between three attempts
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_repeated_closed_has_no_mean() {
        let port = closed_port().await;
        let summary = prober().probe_repeated("127.0.0.1", port, 2).await;
        assert_eq!(summary.attempts.len(), 2);
        assert!(summary.mean_latency.is_none());
        assert!(!summary.any_open());
    }

    /// Listen on a port whose two neighbours were free a moment ago.
    async fn listener_between_closed_ports() -> (TcpListener, u16) {
        for _ in 0..50 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            if port <= 1 || port == u16::MAX {
                continue;
            }
            let below = TcpListener::bind(("127.0.0.1", port - 1)).await;
            let above = TcpListener::bind(("127.0.0.1", port + 1)).await;
            if below.is_ok() && above.is_ok() {
                return (listener, port);
            }
        }
        panic!("no free port window found");
    }

    #[tokio::test]
    async fn test_range_scan_order() {
        let (_listener, open) = listener_between_closed_ports().await;
        let start = open - 1;
        let end = open + 1;

        let summaries = prober().probe_range("127.0.0.1", start, end, 1).await;

        let ports: Vec<u16> = summaries.iter().map(|s| s.port).collect();
        assert_eq!(ports, vec![start, open, end]);
        assert!(!summaries[0].any_open());
        assert!(summaries[1].any_open());
        assert!(!summaries[2].any_open());
        assert!(summaries.iter().all(|s| s.attempts.len() == 1));
    }

    #[tokio::test]
    async fn test_stop_token_ends_repeated_attempts() {
        let port = closed_port().await;
        let stop = CancellationToken::new();
        let prober = prober().stopping_on(stop.clone());

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            stop.cancel();
        });

        let started = Instant::now();
        let summary = prober.probe_repeated("127.0.0.1", port, 100).await;
        cancel.await.unwrap();

        assert!(!summary.attempts.is_empty());
        assert!(summary.attempts.len() < 100);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_stopped_range_scan_returns_early() {
        let stop = CancellationToken::new();
        stop.cancel();
        let base = prober();
        let summaries = base
            .stopping_on(stop)
            .probe_range("127.0.0.1", 1, 1024, 100)
            .await;
        assert!(summaries.is_empty());

        // the prober it was derived from keeps running to completion
        let port = closed_port().await;
        assert_eq!(base.probe_repeated("127.0.0.1", port, 2).await.attempts.len(), 2);
    }

    #[test]
    fn test_mean_latency_ignores_failures() {
        let attempts = vec![
            PortProbeResult::open("h", 1, Duration::from_millis(10)),
            PortProbeResult::not_open("h", 1, PortStatus::Closed),
            PortProbeResult::open("h", 1, Duration::from_millis(30)),
        ];
        assert_eq!(mean_latency(&attempts), Some(Duration::from_millis(20)));
        assert_eq!(mean_latency(&attempts[1..2]), None);
    }

    #[test]
    fn test_classify_connect_error() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(classify_connect_error(&refused), PortStatus::Closed);
        assert_eq!(classify_connect_error(&timed_out), PortStatus::Unreachable);
    }
}
