//! ICMP echo ("ping") probing.
//!
//! One probe sends a single echo request over a raw IPv4 socket and waits
//! for the reply carrying the same identifier:
//!
//! ```text
//! Request:  type=8 code=0 checksum identifier sequence=1 payload(192 x 'Q')
//! Reply:    [IPv4 header] type=0 code=0 checksum identifier sequence payload
//! ```
//!
//! Raw sockets need root or `CAP_NET_RAW`; without them the probe fails
//! with [`ProbeError::PermissionDenied`](crate::probes::ProbeError).

pub mod packet;
mod prober;

pub use prober::{EchoProber, EchoResult};
