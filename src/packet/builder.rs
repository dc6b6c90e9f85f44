//! Packet assembly
//!
//! Builders for well-formed TCP, UDP and ICMP datagrams with correct
//! lengths and checksums. Used by tests, benchmarks and the synthetic
//! workload driver.

use std::net::{IpAddr, SocketAddr};
use std::ops::BitOr;

use super::checksum::{plain_checksum, transport_checksum};
use super::Packet;
use crate::tuple::{IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

/// TCP control bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: Self = Self(0x01);
    pub const SYN: Self = Self(0x02);
    pub const RST: Self = Self(0x04);
    pub const PSH: Self = Self(0x08);
    pub const ACK: Self = Self(0x10);
    pub const URG: Self = Self(0x20);
    pub const ECE: Self = Self(0x40);
    pub const CWR: Self = Self(0x80);

    /// Raw flag byte
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check if every bit of `other` is set
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TcpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Prepend an IP header for `protonum` to `transport`
#[allow(clippy::cast_possible_truncation)]
fn ip_wrap(src: IpAddr, dst: IpAddr, protonum: u8, transport: &[u8]) -> Vec<u8> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total = 20 + transport.len();
            let mut out = Vec::with_capacity(total);
            out.extend_from_slice(&[0x45, 0x00]);
            out.extend_from_slice(&(total as u16).to_be_bytes());
            out.extend_from_slice(&[0x00, 0x00, 0x40, 0x00, 64, protonum, 0x00, 0x00]);
            out.extend_from_slice(&s.octets());
            out.extend_from_slice(&d.octets());
            let csum = plain_checksum(&out[..20]);
            out[10..12].copy_from_slice(&csum.to_be_bytes());
            out.extend_from_slice(transport);
            out
        }
        _ => {
            let (s, d) = (as_v6(src), as_v6(dst));
            let mut out = Vec::with_capacity(40 + transport.len());
            out.extend_from_slice(&[0x60, 0x00, 0x00, 0x00]);
            out.extend_from_slice(&(transport.len() as u16).to_be_bytes());
            out.extend_from_slice(&[protonum, 64]);
            out.extend_from_slice(&s.octets());
            out.extend_from_slice(&d.octets());
            out.extend_from_slice(transport);
            out
        }
    }
}

fn as_v6(addr: IpAddr) -> std::net::Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Endpoint addresses as the IP header will carry them
fn wire_addrs(src: IpAddr, dst: IpAddr) -> (IpAddr, IpAddr) {
    match (src, dst) {
        (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => (src, dst),
        _ => (IpAddr::V6(as_v6(src)), IpAddr::V6(as_v6(dst))),
    }
}

/// TCP segment builder
#[derive(Debug, Clone)]
pub struct TcpSegment {
    src: SocketAddr,
    dst: SocketAddr,
    seq: u32,
    ack: u32,
    window: u16,
    flags: TcpFlags,
    options: Vec<u8>,
    payload: Vec<u8>,
    bad_checksum: bool,
}

impl TcpSegment {
    /// Start a segment with no flags, zero sequence numbers and a 64 KiB window
    #[must_use]
    pub const fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            src,
            dst,
            seq: 0,
            ack: 0,
            window: 65535,
            flags: TcpFlags(0),
            options: Vec::new(),
            payload: Vec::new(),
            bad_checksum: false,
        }
    }

    #[must_use]
    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    /// Set the acknowledgment number and the ACK flag
    #[must_use]
    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self.flags = TcpFlags(self.flags.0 | TcpFlags::ACK.0);
        self
    }

    #[must_use]
    pub fn window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn syn(mut self) -> Self {
        self.flags = TcpFlags(self.flags.0 | TcpFlags::SYN.0);
        self
    }

    #[must_use]
    pub fn fin(mut self) -> Self {
        self.flags = TcpFlags(self.flags.0 | TcpFlags::FIN.0);
        self
    }

    #[must_use]
    pub fn rst(mut self) -> Self {
        self.flags = TcpFlags(self.flags.0 | TcpFlags::RST.0);
        self
    }

    #[must_use]
    pub fn psh(mut self) -> Self {
        self.flags = TcpFlags(self.flags.0 | TcpFlags::PSH.0);
        self
    }

    /// Replace the flag byte
    #[must_use]
    pub fn flags(mut self, flags: TcpFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Window scale option
    #[must_use]
    pub fn wscale(mut self, shift: u8) -> Self {
        self.options.extend_from_slice(&[3, 3, shift]);
        self
    }

    /// SACK-permitted option
    #[must_use]
    pub fn sack_perm(mut self) -> Self {
        self.options.extend_from_slice(&[4, 2]);
        self
    }

    /// SACK option with one block
    #[must_use]
    pub fn sack(mut self, left: u32, right: u32) -> Self {
        self.options.extend_from_slice(&[5, 10]);
        self.options.extend_from_slice(&left.to_be_bytes());
        self.options.extend_from_slice(&right.to_be_bytes());
        self
    }

    /// Maximum segment size option
    #[must_use]
    pub fn mss(mut self, mss: u16) -> Self {
        self.options.extend_from_slice(&[2, 4]);
        self.options.extend_from_slice(&mss.to_be_bytes());
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Emit a wrong checksum
    #[must_use]
    pub fn bad_checksum(mut self) -> Self {
        self.bad_checksum = true;
        self
    }

    /// Raw TCP header plus payload with a valid checksum
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn segment(&self) -> Vec<u8> {
        let mut options = self.options.clone();
        while options.len() % 4 != 0 {
            options.push(0);
        }
        let header_len = 20 + options.len();

        let mut seg = Vec::with_capacity(header_len + self.payload.len());
        seg.extend_from_slice(&self.src.port().to_be_bytes());
        seg.extend_from_slice(&self.dst.port().to_be_bytes());
        seg.extend_from_slice(&self.seq.to_be_bytes());
        seg.extend_from_slice(&self.ack.to_be_bytes());
        seg.push(((header_len / 4) as u8) << 4);
        seg.push(self.flags.bits());
        seg.extend_from_slice(&self.window.to_be_bytes());
        seg.extend_from_slice(&[0, 0, 0, 0]);
        seg.extend_from_slice(&options);
        seg.extend_from_slice(&self.payload);

        let (src, dst) = wire_addrs(self.src.ip(), self.dst.ip());
        let mut csum = transport_checksum(src, dst, IPPROTO_TCP, &seg);
        if self.bad_checksum {
            csum ^= 0x00ff;
        }
        seg[16..18].copy_from_slice(&csum.to_be_bytes());
        seg
    }

    /// Assemble the IP datagram
    #[must_use]
    pub fn build(&self) -> Packet {
        Packet::new(ip_wrap(self.src.ip(), self.dst.ip(), IPPROTO_TCP, &self.segment()))
    }
}

/// UDP datagram builder
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    src: SocketAddr,
    dst: SocketAddr,
    payload: Vec<u8>,
    bad_checksum: bool,
}

impl UdpDatagram {
    #[must_use]
    pub const fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            src,
            dst,
            payload: Vec::new(),
            bad_checksum: false,
        }
    }

    #[must_use]
    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Emit a wrong, non-zero checksum
    #[must_use]
    pub fn bad_checksum(mut self) -> Self {
        self.bad_checksum = true;
        self
    }

    /// Raw UDP header plus payload
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn segment(&self) -> Vec<u8> {
        let len = 8 + self.payload.len();
        let mut seg = Vec::with_capacity(len);
        seg.extend_from_slice(&self.src.port().to_be_bytes());
        seg.extend_from_slice(&self.dst.port().to_be_bytes());
        seg.extend_from_slice(&(len as u16).to_be_bytes());
        seg.extend_from_slice(&[0, 0]);
        seg.extend_from_slice(&self.payload);

        let (src, dst) = wire_addrs(self.src.ip(), self.dst.ip());
        let mut csum = transport_checksum(src, dst, IPPROTO_UDP, &seg);
        if csum == 0 {
            csum = 0xffff;
        }
        if self.bad_checksum {
            csum ^= 0x00ff;
            if csum == 0 {
                csum = 0x1234;
            }
        }
        seg[6..8].copy_from_slice(&csum.to_be_bytes());
        seg
    }

    #[must_use]
    pub fn build(&self) -> Packet {
        Packet::new(ip_wrap(self.src.ip(), self.dst.ip(), IPPROTO_UDP, &self.segment()))
    }
}

/// ICMP / ICMPv6 message builder
#[derive(Debug, Clone)]
pub struct IcmpMessage {
    src: IpAddr,
    dst: IpAddr,
    icmp_type: u8,
    code: u8,
    rest: [u8; 4],
    body: Vec<u8>,
    bad_checksum: bool,
}

impl IcmpMessage {
    /// ICMP echo request; ICMPv6 when the addresses are IPv6
    #[must_use]
    pub fn echo_request(src: IpAddr, dst: IpAddr, id: u16, seq: u16) -> Self {
        let icmp_type = if src.is_ipv6() { 128 } else { 8 };
        Self::echo(src, dst, icmp_type, id, seq)
    }

    /// ICMP echo reply; ICMPv6 when the addresses are IPv6
    #[must_use]
    pub fn echo_reply(src: IpAddr, dst: IpAddr, id: u16, seq: u16) -> Self {
        let icmp_type = if src.is_ipv6() { 129 } else { 0 };
        Self::echo(src, dst, icmp_type, id, seq)
    }

    fn echo(src: IpAddr, dst: IpAddr, icmp_type: u8, id: u16, seq: u16) -> Self {
        let mut rest = [0u8; 4];
        rest[..2].copy_from_slice(&id.to_be_bytes());
        rest[2..].copy_from_slice(&seq.to_be_bytes());
        Self {
            src,
            dst,
            icmp_type,
            code: 0,
            rest,
            body: Vec::new(),
            bad_checksum: false,
        }
    }

    /// Error message quoting `inner`, the offending datagram
    ///
    /// Quotes the inner IP header plus the first 8 bytes beyond it, as
    /// routers do.
    #[must_use]
    pub fn error(src: IpAddr, dst: IpAddr, icmp_type: u8, code: u8, inner: &Packet) -> Self {
        let data = inner.data();
        let ip_len = if data.first().is_some_and(|b| b >> 4 == 6) {
            40
        } else {
            data.first().map_or(20, |b| usize::from(b & 0x0f) * 4)
        };
        let quoted = data.len().min(ip_len + 8);
        Self {
            src,
            dst,
            icmp_type,
            code,
            rest: [0; 4],
            body: data[..quoted].to_vec(),
            bad_checksum: false,
        }
    }

    #[must_use]
    pub fn bad_checksum(mut self) -> Self {
        self.bad_checksum = true;
        self
    }

    #[must_use]
    pub fn build(&self) -> Packet {
        let mut msg = Vec::with_capacity(8 + self.body.len());
        msg.extend_from_slice(&[self.icmp_type, self.code, 0, 0]);
        msg.extend_from_slice(&self.rest);
        msg.extend_from_slice(&self.body);

        let v6 = self.src.is_ipv6() || self.dst.is_ipv6();
        let protonum = if v6 { IPPROTO_ICMPV6 } else { IPPROTO_ICMP };
        let mut csum = if v6 {
            let (src, dst) = wire_addrs(self.src, self.dst);
            transport_checksum(src, dst, IPPROTO_ICMPV6, &msg)
        } else {
            plain_checksum(&msg)
        };
        if self.bad_checksum {
            csum ^= 0x00ff;
        }
        msg[2..4].copy_from_slice(&csum.to_be_bytes());

        Packet::new(ip_wrap(self.src, self.dst, protonum, &msg))
    }
}
