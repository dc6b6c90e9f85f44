//! Flow identity
//!
//! A [`Tuple`] identifies one direction of a flow: addresses, transport
//! protocol and the protocol's port-equivalent pair. Every connection owns
//! two of them, the original and its inverse (the reply).
//!
//! Direction is carried on the tuple but is not part of its identity:
//! equality and hashing ignore it, so a reply-direction node in the table
//! matches a freshly parsed packet tuple.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// ICMP protocol number
pub const IPPROTO_ICMP: u8 = 1;
/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;
/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;
/// ICMPv6 protocol number
pub const IPPROTO_ICMPV6: u8 = 58;

/// Network layer protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L3Proto {
    Ipv4,
    Ipv6,
}

impl L3Proto {
    /// Protocol family of an address
    #[must_use]
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

/// Which side of a connection a tuple describes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Original = 0,
    Reply = 1,
}

impl Direction {
    /// Both directions, original first
    pub const BOTH: [Self; 2] = [Self::Original, Self::Reply];

    /// Array index for per-direction state
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The other direction
    #[inline]
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::Original => Self::Reply,
            Self::Reply => Self::Original,
        }
    }
}

/// Which directions a zone applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneDir {
    Original,
    Reply,
    #[default]
    Both,
}

/// NAT partition letting otherwise identical tuples coexist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Zone {
    pub id: u16,
    pub dir: ZoneDir,
}

impl Zone {
    /// Zone 0 in both directions
    pub const DEFAULT: Self = Self {
        id: 0,
        dir: ZoneDir::Both,
    };

    /// Zone covering both directions
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self {
            id,
            dir: ZoneDir::Both,
        }
    }

    /// Zone covering a single direction
    #[must_use]
    pub const fn directional(id: u16, dir: ZoneDir) -> Self {
        Self { id, dir }
    }

    /// Zone id in effect for `dir`; directions outside the zone use zone 0
    #[must_use]
    pub const fn id_for(&self, dir: Direction) -> u16 {
        match (self.dir, dir) {
            (ZoneDir::Both, _)
            | (ZoneDir::Original, Direction::Original)
            | (ZoneDir::Reply, Direction::Reply) => self.id,
            _ => 0,
        }
    }

    /// Zones agree for the given direction
    #[must_use]
    pub const fn equal_for(&self, other: &Self, dir: Direction) -> bool {
        self.id_for(dir) == other.id_for(dir)
    }
}

/// One direction of a flow
///
/// For TCP and UDP the port pair is the transport ports. For ICMP the
/// source "port" is the echo identifier and the destination "port" packs
/// `type << 8 | code`. Protocols without ports use zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tuple {
    pub l3: L3Proto,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protonum: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub dir: Direction,
}

impl Tuple {
    /// Create an original-direction tuple
    #[must_use]
    pub const fn new(src: IpAddr, dst: IpAddr, protonum: u8, src_port: u16, dst_port: u16) -> Self {
        Self {
            l3: L3Proto::of(&src),
            src,
            dst,
            protonum,
            src_port,
            dst_port,
            dir: Direction::Original,
        }
    }

    /// Create a TCP tuple
    #[must_use]
    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(src.ip(), dst.ip(), IPPROTO_TCP, src.port(), dst.port())
    }

    /// Create a UDP tuple
    #[must_use]
    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(src.ip(), dst.ip(), IPPROTO_UDP, src.port(), dst.port())
    }

    /// Swap endpoints and ports and flip the direction
    ///
    /// This is the port-symmetric inversion used by TCP, UDP and the generic
    /// tracker. Protocols with asymmetric identity (ICMP) invert through their
    /// tracker instead.
    #[must_use]
    pub const fn swapped(&self) -> Self {
        Self {
            l3: self.l3,
            src: self.dst,
            dst: self.src,
            protonum: self.protonum,
            src_port: self.dst_port,
            dst_port: self.src_port,
            dir: self.dir.reverse(),
        }
    }

    /// Copy with a different direction
    #[must_use]
    pub const fn with_dir(mut self, dir: Direction) -> Self {
        self.dir = dir;
        self
    }

    /// ICMP type packed in the destination port
    #[inline]
    #[must_use]
    pub const fn icmp_type(&self) -> u8 {
        (self.dst_port >> 8) as u8
    }

    /// ICMP code packed in the destination port
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn icmp_code(&self) -> u8 {
        self.dst_port as u8
    }

    /// Check if this is a TCP flow
    #[inline]
    #[must_use]
    pub const fn is_tcp(&self) -> bool {
        self.protonum == IPPROTO_TCP
    }

    /// Check if this is a UDP flow
    #[inline]
    #[must_use]
    pub const fn is_udp(&self) -> bool {
        self.protonum == IPPROTO_UDP
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.l3 == other.l3
            && self.src == other.src
            && self.dst == other.dst
            && self.protonum == other.protonum
            && self.src_port == other.src_port
            && self.dst_port == other.dst_port
    }
}

impl Eq for Tuple {}

impl Hash for Tuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.l3.hash(state);
        self.src.hash(state);
        self.dst.hash(state);
        self.protonum.hash(state);
        self.src_port.hash(state);
        self.dst_port.hash(state);
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protonum {
            IPPROTO_TCP => "tcp",
            IPPROTO_UDP => "udp",
            IPPROTO_ICMP => "icmp",
            IPPROTO_ICMPV6 => "icmpv6",
            n => return write!(f, "proto={n} {} -> {}", self.src, self.dst),
        };
        match self.protonum {
            IPPROTO_ICMP | IPPROTO_ICMPV6 => write!(
                f,
                "{proto} {} -> {} id={} type={} code={}",
                self.src,
                self.dst,
                self.src_port,
                self.icmp_type(),
                self.icmp_code()
            ),
            _ => write!(
                f,
                "{proto} {} -> {}",
                SocketAddr::new(self.src, self.src_port),
                SocketAddr::new(self.dst, self.dst_port)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_tuple(src_port: u16, dst_port: u16) -> Tuple {
        Tuple::tcp(
            format!("192.168.1.100:{src_port}").parse().unwrap(),
            format!("10.0.0.1:{dst_port}").parse().unwrap(),
        )
    }

    #[test]
    fn test_swapped_is_involution() {
        let t = make_test_tuple(40000, 443);
        let back = t.swapped().swapped();
        assert_eq!(t, back);
        assert_eq!(back.dir, Direction::Original);
    }

    #[test]
    fn test_swapped_fields() {
        let t = make_test_tuple(40000, 443);
        let r = t.swapped();
        assert_eq!(r.src, t.dst);
        assert_eq!(r.dst, t.src);
        assert_eq!(r.src_port, 443);
        assert_eq!(r.dst_port, 40000);
        assert_eq!(r.dir, Direction::Reply);
        assert_ne!(r, t);
    }

    #[test]
    fn test_equality_ignores_direction() {
        let t = make_test_tuple(1, 2);
        assert_eq!(t, t.with_dir(Direction::Reply));
    }

    #[test]
    fn test_zone_id_for_direction() {
        let both = Zone::new(7);
        assert_eq!(both.id_for(Direction::Original), 7);
        assert_eq!(both.id_for(Direction::Reply), 7);

        let orig = Zone::directional(7, ZoneDir::Original);
        assert_eq!(orig.id_for(Direction::Original), 7);
        assert_eq!(orig.id_for(Direction::Reply), 0);
        assert!(orig.equal_for(&Zone::DEFAULT, Direction::Reply));
        assert!(!orig.equal_for(&Zone::DEFAULT, Direction::Original));
    }

    #[test]
    fn test_display() {
        let t = make_test_tuple(40000, 443);
        assert_eq!(t.to_string(), "tcp 192.168.1.100:40000 -> 10.0.0.1:443");

        let icmp = Tuple::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            IPPROTO_ICMP,
            77,
            8 << 8,
        );
        assert_eq!(icmp.icmp_type(), 8);
        assert_eq!(icmp.icmp_code(), 0);
        assert!(icmp.to_string().contains("id=77"));
    }

    #[test]
    fn test_l3_of_ipv6() {
        let t = Tuple::udp("[2001:db8::1]:53".parse().unwrap(), "[2001:db8::2]:5353".parse().unwrap());
        assert_eq!(t.l3, L3Proto::Ipv6);
        assert!(t.is_udp());
    }
}
