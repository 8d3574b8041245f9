//! ICMP echo prober over a raw IPv4 socket.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tracing::{debug, trace};

use super::packet;
use crate::probes::{resolve_ipv4, ProbeError};

/// Receive buffer size (IP header + ICMP header + payload fits easily)
const RECV_BUFFER_LEN: usize = 1024;

static IDENTIFIER_BASE: OnceLock<u16> = OnceLock::new();
static IDENTIFIER_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Next echo identifier.
///
/// A process-wide counter offset by the process id, so concurrent probes
/// from this process never share an identifier until the counter wraps.
fn next_identifier() -> u16 {
    let base = *IDENTIFIER_BASE.get_or_init(|| std::process::id() as u16);
    base.wrapping_add(IDENTIFIER_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Outcome of one echo probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoResult {
    /// A matching reply arrived after `round_trip`
    Reply { round_trip: Duration },
    /// No matching reply within the timeout, or the target did not resolve
    NoReply,
}

impl EchoResult {
    pub fn round_trip(&self) -> Option<Duration> {
        match self {
            EchoResult::Reply { round_trip } => Some(*round_trip),
            EchoResult::NoReply => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, EchoResult::NoReply)
    }
}

/// Sends single ICMP echo requests and waits for the matching reply.
#[derive(Debug, Clone)]
pub struct EchoProber {
    timeout: Duration,
}

impl EchoProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Probe `target` with the configured timeout.
    pub async fn probe(&self, target: &str) -> Result<EchoResult, ProbeError> {
        self.probe_within(target, self.timeout).await
    }

    /// Probe `target` (hostname or IPv4 literal), waiting at most `timeout`
    /// for the reply.
    pub async fn probe_within(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<EchoResult, ProbeError> {
        let Some(ip) = resolve_ipv4(target, timeout).await else {
            debug!(target, "Target did not resolve to an IPv4 address");
            return Ok(EchoResult::NoReply);
        };

        let mut socket = RawIcmpSocket::open()?;

        let identifier = next_identifier();
        let request = packet::echo_request(identifier);
        socket.send_all(&request, ip).await?;
        let sent_at = Instant::now();
        trace!(target, %ip, identifier, "Echo request sent");

        let result = match await_reply(&mut socket, identifier, sent_at, timeout).await? {
            Some(round_trip) => EchoResult::Reply { round_trip },
            None => EchoResult::NoReply,
        };
        debug!(target, %ip, identifier, ?result, "Echo probe finished");
        Ok(result)
    }
}

/// Source of raw packets for the reply wait loop.
pub(crate) trait ReplySource {
    /// Read one packet into `buf`, returning its length.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Wait for the echo reply carrying `identifier`.
///
/// Unrelated packets (other processes' replies, our own looped-back
/// request) are skipped. The wait is bounded by `sent_at + timeout`
/// however many packets are skipped. `Ok(None)` means no reply in time.
pub(crate) async fn await_reply<R: ReplySource>(
    source: &mut R,
    identifier: u16,
    sent_at: Instant,
    timeout: Duration,
) -> io::Result<Option<Duration>> {
    let deadline = sent_at + timeout;
    let mut buf = [0u8; RECV_BUFFER_LEN];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }

        let n = match tokio::time::timeout(remaining, source.recv(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => return Ok(None),
        };
        let received_at = Instant::now();

        match packet::parse_reply(&buf[..n]) {
            Some(reply) if reply.answers(identifier) => {
                return Ok(Some(received_at.duration_since(sent_at)));
            }
            other => trace!(identifier, reply = ?other, "Skipping unrelated ICMP packet"),
        }
    }
}

/// Non-blocking raw ICMP socket registered with the tokio reactor.
struct RawIcmpSocket {
    fd: AsyncFd<Socket>,
}

impl RawIcmpSocket {
    fn open() -> Result<Self, ProbeError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(classify_open_error)?;
        socket.set_nonblocking(true)?;
        // SAFETY: the socket owns its descriptor and keeps it open until the
        // AsyncFd that owns the socket is dropped.
        let fd = unsafe { AsyncFd::register(socket) }.map_err(|e| e.into_parts().1)?;
        Ok(Self { fd })
    }

    /// Send the whole packet, retrying partial writes.
    async fn send_all(&self, packet: &[u8], ip: IpAddr) -> io::Result<()> {
        let dest = SockAddr::from(SocketAddr::new(ip, 0));
        let mut sent = 0;

        while sent < packet.len() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(&packet[sent..], &dest)) {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "raw socket accepted no bytes",
                    ))
                }
                Ok(Ok(n)) => sent += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

impl ReplySource for RawIcmpSocket {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn classify_open_error(e: io::Error) -> ProbeError {
    match e.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) => ProbeError::PermissionDenied(e),
        _ if e.kind() == io::ErrorKind::PermissionDenied => ProbeError::PermissionDenied(e),
        _ => ProbeError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out queued packets, then never yields again.
    struct ScriptedSource {
        packets: VecDeque<Vec<u8>>,
    }

    impl ScriptedSource {
        fn new(packets: Vec<Vec<u8>>) -> Self {
            Self {
                packets: packets.into(),
            }
        }
    }

    impl ReplySource for ScriptedSource {
        async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.packets.pop_front() {
                Some(packet) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(packet.len())
                }
                None => std::future::pending().await,
            }
        }
    }

    fn raw_packet(icmp_type: u8, identifier: u16) -> Vec<u8> {
        let mut raw = vec![0u8; 20];
        raw[0] = 0x45;
        let mut icmp = packet::echo_request(identifier).to_vec();
        icmp[0] = icmp_type;
        raw.extend_from_slice(&icmp);
        raw
    }

    #[test]
    fn test_identifiers_are_unique() {
        let a = next_identifier();
        let b = next_identifier();
        let c = next_identifier();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_matching_reply() {
        let mut source = ScriptedSource::new(vec![raw_packet(packet::ICMP_ECHO_REPLY, 9)]);
        let rtt = await_reply(&mut source, 9, Instant::now(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(rtt.is_some());
    }

    #[tokio::test]
    async fn test_mismatched_replies_skipped() {
        let mut source = ScriptedSource::new(vec![
            raw_packet(packet::ICMP_ECHO_REPLY, 1),
            raw_packet(packet::ICMP_ECHO_REQUEST, 2),
            raw_packet(packet::ICMP_ECHO_REPLY, 2),
        ]);
        let rtt = await_reply(&mut source, 2, Instant::now(), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(rtt >= Duration::from_millis(60));
        assert!(rtt < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_mismatches_do_not_extend_timeout() {
        let timeout = Duration::from_millis(300);
        let mut source = ScriptedSource::new(vec![
            raw_packet(packet::ICMP_ECHO_REPLY, 100),
            raw_packet(packet::ICMP_ECHO_REPLY, 101),
            raw_packet(packet::ICMP_ECHO_REPLY, 102),
        ]);

        let started = Instant::now();
        let rtt = await_reply(&mut source, 7, started, timeout).await.unwrap();
        let waited = started.elapsed();

        assert!(rtt.is_none());
        assert!(waited >= timeout);
        assert!(waited < timeout + Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_unresolvable_target_is_no_reply() {
        let prober = EchoProber::new(Duration::from_millis(500));
        let started = Instant::now();
        let result = prober.probe("no-such-host.invalid").await.unwrap();
        assert!(result.timed_out());
        assert!(result.round_trip().is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_loopback_probe() {
        let prober = EchoProber::new(Duration::from_secs(1));
        match prober.probe("127.0.0.1").await {
            Ok(EchoResult::Reply { round_trip }) => assert!(round_trip <= Duration::from_secs(1)),
            Ok(EchoResult::NoReply) => {}
            // unprivileged test runs cannot open raw sockets
            Err(ProbeError::PermissionDenied(_)) => {}
            Err(e) => panic!("unexpected probe error: {e}"),
        }
    }
}
