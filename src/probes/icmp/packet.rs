//! ICMP echo packet layout.
//!
//! ```text
//! type(1) code(1) checksum(2) identifier(2) sequence(2) payload(N)
//! ```
//!
//! The checksum is written in network byte order. Identifier and sequence
//! are written host-endian, the usual convention for raw ICMP, and the peer
//! echoes them back byte for byte.

use bytes::{BufMut, BytesMut};

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// Size of the ICMP header
pub const HEADER_LEN: usize = 8;

/// Sequence number carried by every request
pub const ECHO_SEQUENCE: u16 = 1;

/// Filler payload appended to every request
pub const PAYLOAD_LEN: usize = 192;
const PAYLOAD_FILL: u8 = b'Q';

/// Internet checksum of `data`.
///
/// Sums the buffer as little-endian 16-bit words (an odd trailing byte is
/// a final partial word), folds the carries back in, takes the one's
/// complement and swaps the bytes. The returned value goes on the wire
/// big-endian. A buffer that already carries a valid checksum yields 0.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum = sum.wrapping_add(u16::from_le_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add(*last as u32);
    }

    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xffff);
    }

    (!(sum as u16)).swap_bytes()
}

/// Build an echo request carrying `identifier`.
pub fn echo_request(identifier: u16) -> BytesMut {
    let mut packet = BytesMut::with_capacity(HEADER_LEN + PAYLOAD_LEN);
    packet.put_u8(ICMP_ECHO_REQUEST);
    packet.put_u8(0);
    packet.put_u16(0); // checksum placeholder
    packet.put_u16_ne(identifier);
    packet.put_u16_ne(ECHO_SEQUENCE);
    packet.put_bytes(PAYLOAD_FILL, PAYLOAD_LEN);

    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

/// ICMP header fields of a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub icmp_type: u8,
    pub identifier: u16,
    pub sequence: u16,
}

impl ReplyHeader {
    /// True if this is the echo reply to the request sent with `identifier`.
    pub fn answers(&self, identifier: u16) -> bool {
        self.icmp_type == ICMP_ECHO_REPLY
            && self.identifier == identifier
            && self.sequence == ECHO_SEQUENCE
    }
}

/// Extract the ICMP header from a packet read off a raw socket.
///
/// Raw IPv4 sockets deliver the IP header first; its length comes from the
/// IHL field. Packets without an IPv4 header are read from offset 0.
pub fn parse_reply(packet: &[u8]) -> Option<ReplyHeader> {
    let first = *packet.first()?;
    let offset = if first >> 4 == 4 {
        let ihl = (first & 0x0f) as usize * 4;
        if ihl < 20 {
            return None;
        }
        ihl
    } else {
        0
    };

    let icmp = packet.get(offset..offset + HEADER_LEN)?;
    Some(ReplyHeader {
        icmp_type: icmp[0],
        identifier: u16::from_ne_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_ne_bytes([icmp[6], icmp[7]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_vector() {
        let packet = [0x08, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b'Q', b'Q', b'Q', b'Q'];
        // 0x0800 + 0x0001 + 0x0001 + 0x5151 + 0x5151 = 0xaaa4, complement 0x555b
        assert_eq!(checksum(&packet), 0x555b);
    }

    #[test]
    fn test_checksum_verifies_to_zero() {
        let mut packet = [0x08, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b'Q', b'Q', b'Q', b'Q'];
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(&packet[2..4], &[0x55, 0x5b]);
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        // 0x0102 + 0x0300 = 0x0402, complement 0xfbfd
        assert_eq!(checksum(&[0x01, 0x02, 0x03]), 0xfbfd);
    }

    #[test]
    fn test_checksum_folds_carry() {
        // 0xffff + 0x0001 = 0x10000, folds to 0x0001, complement 0xfffe
        assert_eq!(checksum(&[0xff, 0xff, 0x00, 0x01]), 0xfffe);
    }

    #[test]
    fn test_echo_request_layout() {
        let packet = echo_request(0x1234);
        assert_eq!(packet.len(), HEADER_LEN + PAYLOAD_LEN);
        assert_eq!(packet[0], ICMP_ECHO_REQUEST);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[4..6], &0x1234u16.to_ne_bytes());
        assert_eq!(&packet[6..8], &ECHO_SEQUENCE.to_ne_bytes());
        assert!(packet[HEADER_LEN..].iter().all(|&b| b == b'Q'));
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn test_parse_reply_skips_ip_header() {
        let mut raw = vec![0u8; 20];
        raw[0] = 0x45;
        let mut icmp = echo_request(77).to_vec();
        icmp[0] = ICMP_ECHO_REPLY;
        raw.extend_from_slice(&icmp);

        let header = parse_reply(&raw).unwrap();
        assert_eq!(header.icmp_type, ICMP_ECHO_REPLY);
        assert_eq!(header.identifier, 77);
        assert_eq!(header.sequence, ECHO_SEQUENCE);
        assert!(header.answers(77));
        assert!(!header.answers(78));
    }

    #[test]
    fn test_parse_reply_with_ip_options() {
        let mut raw = vec![0u8; 24];
        raw[0] = 0x46;
        raw.extend_from_slice(&echo_request(5)[..HEADER_LEN]);

        let header = parse_reply(&raw).unwrap();
        assert_eq!(header.icmp_type, ICMP_ECHO_REQUEST);
        assert_eq!(header.identifier, 5);
        // our own request looped back is not a reply
        assert!(!header.answers(5));
    }

    #[test]
    fn test_parse_reply_truncated() {
        assert!(parse_reply(&[]).is_none());
        assert!(parse_reply(&[0x45, 0, 0, 0]).is_none());
        assert!(parse_reply(&[0x41, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }
}
