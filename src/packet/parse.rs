//! L3 adapter: locate the transport header
//!
//! Walks the IPv4 header or the IPv6 header chain and reports where the
//! transport header starts, which protocol it is and where the datagram
//! ends (trailing link padding excluded).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::PacketError;
use crate::tuple::L3Proto;

/// Minimum IPv4 header length
const IPV4_MIN_HEADER: usize = 20;
/// Fixed IPv6 header length
const IPV6_HEADER: usize = 40;
/// IPv4 fragment offset mask
const IPV4_OFFSET_MASK: u16 = 0x1fff;

/// IPv6 extension header numbers
const NEXTHDR_HOP: u8 = 0;
const NEXTHDR_ROUTING: u8 = 43;
const NEXTHDR_FRAGMENT: u8 = 44;
const NEXTHDR_AUTH: u8 = 51;
const NEXTHDR_NONE: u8 = 59;
const NEXTHDR_DEST: u8 = 60;
const NEXTHDR_MOBILITY: u8 = 135;

/// Network header summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L4Header {
    pub l3: L3Proto,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protonum: u8,
    /// Offset of the transport header
    pub offset: usize,
    /// End of the datagram as declared by the IP header
    pub end: usize,
}

impl L4Header {
    /// Transport header and payload
    #[inline]
    #[must_use]
    pub fn transport<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset..self.end]
    }

    /// Length of transport header and payload
    #[inline]
    #[must_use]
    pub const fn transport_len(&self) -> usize {
        self.end - self.offset
    }
}

/// Find the transport header of an `l3` datagram
///
/// # Errors
///
/// Returns `PacketError::UnsupportedVersion` when the version nibble does not
/// match `l3`, `PacketError::Fragment` for non-first fragments and
/// `PacketError::Truncated`/`Malformed` for inconsistent headers.
pub fn l4_offset_and_proto(data: &[u8], l3: L3Proto) -> Result<L4Header, PacketError> {
    let Some(first) = data.first() else {
        return Err(PacketError::truncated("IP", 1, 0));
    };

    let version = first >> 4;
    match (l3, version) {
        (L3Proto::Ipv4, 4) => parse_ipv4(data, false),
        (L3Proto::Ipv6, 6) => parse_ipv6(data, false),
        (_, v) => Err(PacketError::UnsupportedVersion(v)),
    }
}

/// Find the transport header of a datagram quoted inside an ICMP error
///
/// Quotes are cut short by the sender, so the declared length may run past
/// the captured bytes; `end` is clamped to what is present.
///
/// # Errors
///
/// Same as [`l4_offset_and_proto`], minus the length check.
pub fn l4_offset_and_proto_quoted(data: &[u8], l3: L3Proto) -> Result<L4Header, PacketError> {
    let Some(first) = data.first() else {
        return Err(PacketError::truncated("quoted IP", 1, 0));
    };

    match (l3, first >> 4) {
        (L3Proto::Ipv4, 4) => parse_ipv4(data, true),
        (L3Proto::Ipv6, 6) => parse_ipv6(data, true),
        (_, v) => Err(PacketError::UnsupportedVersion(v)),
    }
}

fn parse_ipv4(data: &[u8], quoted: bool) -> Result<L4Header, PacketError> {
    if data.len() < IPV4_MIN_HEADER {
        return Err(PacketError::truncated("IPv4", IPV4_MIN_HEADER, data.len()));
    }

    let ihl = usize::from(data[0] & 0x0f) * 4;
    if ihl < IPV4_MIN_HEADER {
        return Err(PacketError::Malformed("IPv4 header length below minimum"));
    }

    let total_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if total_len < ihl {
        return Err(PacketError::Malformed("IPv4 total length below header length"));
    }
    let end = if quoted {
        total_len.min(data.len())
    } else if data.len() < total_len {
        return Err(PacketError::truncated("IPv4", total_len, data.len()));
    } else {
        total_len
    };
    if end < ihl {
        return Err(PacketError::truncated("IPv4 options", ihl, end));
    }

    let frag = u16::from_be_bytes([data[6], data[7]]);
    if frag & IPV4_OFFSET_MASK != 0 {
        return Err(PacketError::Fragment);
    }

    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    Ok(L4Header {
        l3: L3Proto::Ipv4,
        src: IpAddr::V4(src),
        dst: IpAddr::V4(dst),
        protonum: data[9],
        offset: ihl,
        end,
    })
}

/// Skips extension headers to reach the upper-layer protocol. Supported:
/// hop-by-hop (0), routing (43), fragment (44), AH (51), destination
/// options (60) and mobility (135).
fn parse_ipv6(data: &[u8], quoted: bool) -> Result<L4Header, PacketError> {
    if data.len() < IPV6_HEADER {
        return Err(PacketError::truncated("IPv6", IPV6_HEADER, data.len()));
    }

    let payload_len = usize::from(u16::from_be_bytes([data[4], data[5]]));
    let mut end = IPV6_HEADER + payload_len;
    if quoted {
        end = end.min(data.len());
    } else if data.len() < end {
        return Err(PacketError::truncated("IPv6", end, data.len()));
    }

    let mut src_octets = [0u8; 16];
    let mut dst_octets = [0u8; 16];
    src_octets.copy_from_slice(&data[8..24]);
    dst_octets.copy_from_slice(&data[24..40]);

    let mut next_header = data[6];
    let mut offset = IPV6_HEADER;

    loop {
        match next_header {
            NEXTHDR_HOP | NEXTHDR_ROUTING | NEXTHDR_DEST | NEXTHDR_MOBILITY => {
                if end < offset + 2 {
                    return Err(PacketError::truncated("IPv6 extension", offset + 2, end));
                }
                next_header = data[offset];
                offset += (usize::from(data[offset + 1]) + 1) * 8;
            }
            NEXTHDR_FRAGMENT => {
                if end < offset + 8 {
                    return Err(PacketError::truncated("IPv6 fragment", offset + 8, end));
                }
                let frag_off = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) >> 3;
                if frag_off != 0 {
                    return Err(PacketError::Fragment);
                }
                next_header = data[offset];
                offset += 8;
            }
            NEXTHDR_AUTH => {
                if end < offset + 2 {
                    return Err(PacketError::truncated("IPv6 AH", offset + 2, end));
                }
                next_header = data[offset];
                offset += (usize::from(data[offset + 1]) + 2) * 4;
            }
            _ => break,
        }

        if offset > end {
            return Err(PacketError::Malformed("IPv6 extension header past end of packet"));
        }
    }

    if next_header == NEXTHDR_NONE {
        return Err(PacketError::Malformed("IPv6 packet without upper-layer header"));
    }

    Ok(L4Header {
        l3: L3Proto::Ipv6,
        src: IpAddr::V6(Ipv6Addr::from(src_octets)),
        dst: IpAddr::V6(Ipv6Addr::from(dst_octets)),
        protonum: next_header,
        offset,
        end,
    })
}

/// Read the leading port pair of a TCP/UDP header
pub(crate) fn read_ports(transport: &[u8]) -> Option<(u16, u16)> {
    if transport.len() < 4 {
        return None;
    }
    Some((
        u16::from_be_bytes([transport[0], transport[1]]),
        u16::from_be_bytes([transport[2], transport[3]]),
    ))
}
