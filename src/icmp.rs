//! ICMP / ICMPv6 echo codec.
//!
//! Encoding produces a complete echo request. Decoding works on the ICMP
//! message only; raw IPv4 sockets hand back the IP header as well, see
//! [`strip_ipv4_header`].

use std::fmt;
use std::net::IpAddr;

use crate::error::DecodeError;

/// ICMP header size (type, code, checksum, identifier, sequence)
pub const ICMP_HEADER_LEN: usize = 8;
/// Echo payload size, the classic ping default
pub const PAYLOAD_LEN: usize = 56;

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;

/// Address family of a probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    fn echo_request_type(self) -> u8 {
        match self {
            Family::V4 => 8,
            Family::V6 => 128,
        }
    }

    fn classify(self, icmp_type: u8) -> MessageKind {
        match (self, icmp_type) {
            (Family::V4, 0) | (Family::V6, 129) => MessageKind::EchoReply,
            (Family::V4, 8) | (Family::V6, 128) => MessageKind::EchoRequest,
            (Family::V4, 3) | (Family::V6, 1) => MessageKind::DestinationUnreachable,
            (Family::V4, 11) | (Family::V6, 3) => MessageKind::TimeExceeded,
            (Family::V6, 133) => MessageKind::Discovery(Discovery::RouterSolicitation),
            (Family::V6, 134) => MessageKind::Discovery(Discovery::RouterAdvertisement),
            (Family::V6, 135) => MessageKind::Discovery(Discovery::NeighborSolicitation),
            (Family::V6, 136) => MessageKind::Discovery(Discovery::NeighborAdvertisement),
            _ => MessageKind::Other,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

/// IPv6 neighbor / router discovery messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    RouterSolicitation,
    RouterAdvertisement,
    NeighborSolicitation,
    NeighborAdvertisement,
}

impl fmt::Display for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Discovery::RouterSolicitation => "router solicitation",
            Discovery::RouterAdvertisement => "router advertisement",
            Discovery::NeighborSolicitation => "neighbor solicitation",
            Discovery::NeighborAdvertisement => "neighbor advertisement",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    EchoRequest,
    EchoReply,
    DestinationUnreachable,
    TimeExceeded,
    Discovery(Discovery),
    Other,
}

/// Identifier and sequence of an echo message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Echo {
    pub identifier: u16,
    pub sequence: u16,
}

/// A decoded inbound ICMP message.
///
/// For echo messages `echo` holds the header fields. For error messages it
/// holds the fields of the quoted echo request, when the quote is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub icmp_type: u8,
    pub code: u8,
    pub echo: Option<Echo>,
    pub len: usize,
}

impl Message {
    /// `None` when the message carries no echo fields to compare.
    pub fn matches(&self, identifier: u16, sequence: u16) -> Option<bool> {
        self.echo
            .map(|echo| echo.identifier == identifier && echo.sequence == sequence)
    }
}

/// An echo request ready to be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoRequest {
    pub identifier: u16,
    pub sequence: u16,
}

impl EchoRequest {
    pub fn new(identifier: u16, sequence: u16) -> Self {
        Self {
            identifier,
            sequence,
        }
    }

    /// Builds the wire form of the request.
    ///
    /// ICMPv6 checksums cover a pseudo-header only the kernel knows, so the
    /// field is left zero for IPv6 and filled in by the raw socket.
    pub fn encode(&self, family: Family) -> Vec<u8> {
        let mut pkt = Vec::with_capacity(ICMP_HEADER_LEN + PAYLOAD_LEN);

        pkt.extend_from_slice(&[family.echo_request_type(), 0, 0, 0]);
        pkt.extend_from_slice(&self.identifier.to_be_bytes());
        pkt.extend_from_slice(&self.sequence.to_be_bytes());
        pkt.extend((0..PAYLOAD_LEN).map(|i| (i & 0xFF) as u8));

        if family == Family::V4 {
            let csum = checksum(&pkt);
            pkt[2..4].copy_from_slice(&csum.to_be_bytes());
        }

        pkt
    }
}

/// Computes the Internet checksum (RFC 792 / RFC 1071).
pub fn checksum(mut data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    while data.len() >= 2 {
        sum = sum.wrapping_add(u16::from_be_bytes([data[0], data[1]]) as u32);
        data = &data[2..];
    }
    if !data.is_empty() {
        sum = sum.wrapping_add((data[0] as u32) << 8);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Skips a leading IPv4 header, if one is present.
pub fn strip_ipv4_header(packet: &[u8]) -> &[u8] {
    if packet.len() >= IPV4_MIN_HEADER_LEN && (packet[0] >> 4) == 4 {
        let ihl = (packet[0] & 0x0F) as usize * 4;
        if ihl >= IPV4_MIN_HEADER_LEN && packet.len() >= ihl {
            return &packet[ihl..];
        }
    }
    packet
}

/// Parses an ICMP (`Family::V4`) or ICMPv6 (`Family::V6`) message.
pub fn decode(family: Family, bytes: &[u8]) -> Result<Message, DecodeError> {
    if bytes.len() < 4 {
        return Err(DecodeError::TooShort {
            expected: 4,
            actual: bytes.len(),
        });
    }

    if family == Family::V4 {
        let carried = u16::from_be_bytes([bytes[2], bytes[3]]);
        let mut zeroed = bytes.to_vec();
        zeroed[2] = 0;
        zeroed[3] = 0;
        let computed = checksum(&zeroed);
        if carried != computed {
            return Err(DecodeError::BadChecksum { carried, computed });
        }
    }

    let icmp_type = bytes[0];
    let kind = family.classify(icmp_type);
    let echo = match kind {
        MessageKind::EchoRequest | MessageKind::EchoReply => {
            if bytes.len() < ICMP_HEADER_LEN {
                return Err(DecodeError::TruncatedEcho {
                    expected: ICMP_HEADER_LEN,
                    actual: bytes.len(),
                });
            }
            Some(read_echo(&bytes[4..]))
        }
        MessageKind::DestinationUnreachable | MessageKind::TimeExceeded => {
            quoted_echo(family, bytes.get(ICMP_HEADER_LEN..).unwrap_or_default())
        }
        MessageKind::Discovery(_) | MessageKind::Other => None,
    };

    Ok(Message {
        kind,
        icmp_type,
        code: bytes[1],
        echo,
        len: bytes.len(),
    })
}

fn read_echo(fields: &[u8]) -> Echo {
    Echo {
        identifier: u16::from_be_bytes([fields[0], fields[1]]),
        sequence: u16::from_be_bytes([fields[2], fields[3]]),
    }
}

/// Recovers the echo request quoted inside an error message.
fn quoted_echo(family: Family, quote: &[u8]) -> Option<Echo> {
    let (header_len, protocol) = match family {
        Family::V4 => {
            if quote.len() < IPV4_MIN_HEADER_LEN || (quote[0] >> 4) != 4 {
                return None;
            }
            ((quote[0] & 0x0F) as usize * 4, quote[9])
        }
        Family::V6 => {
            if quote.len() < IPV6_HEADER_LEN || (quote[0] >> 4) != 6 {
                return None;
            }
            (IPV6_HEADER_LEN, quote[6])
        }
    };
    let expected_protocol = match family {
        Family::V4 => IPPROTO_ICMP,
        Family::V6 => IPPROTO_ICMPV6,
    };
    if protocol != expected_protocol {
        return None;
    }

    let inner = quote.get(header_len..header_len + ICMP_HEADER_LEN)?;
    if inner[0] != family.echo_request_type() {
        return None;
    }
    Some(read_echo(&inner[4..]))
}
