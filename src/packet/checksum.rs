//! Internet checksums (RFC 1071)

use std::net::IpAddr;

use super::parse::L4Header;

/// Add `data` to a running one's-complement sum
#[must_use]
pub fn sum_bytes(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([chunk[0], chunk[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold carries into 16 bits
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Pseudo-header sum for TCP/UDP/ICMPv6
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn pseudo_header(src: IpAddr, dst: IpAddr, protonum: u8, len: usize) -> u32 {
    let mut sum = 0u32;
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum = sum_bytes(&s.octets(), sum);
            sum = sum_bytes(&d.octets(), sum);
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            sum = sum_bytes(&s.octets(), sum);
            sum = sum_bytes(&d.octets(), sum);
        }
        (s, d) => {
            sum = sum_bytes(&to_v6(s).octets(), sum);
            sum = sum_bytes(&to_v6(d).octets(), sum);
        }
    }
    let len = len as u32;
    sum = sum.wrapping_add(len >> 16).wrapping_add(len & 0xffff);
    sum.wrapping_add(u32::from(protonum))
}

fn to_v6(addr: IpAddr) -> std::net::Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Checksum a segment (its checksum field zeroed) with a pseudo-header
#[must_use]
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protonum: u8, segment: &[u8]) -> u16 {
    let sum = sum_bytes(segment, pseudo_header(src, dst, protonum, segment.len()));
    !fold(sum)
}

/// Checksum data without a pseudo-header (IPv4 header, ICMPv4)
#[must_use]
pub fn plain_checksum(data: &[u8]) -> u16 {
    !fold(sum_bytes(data, 0))
}

/// Verify a transport segment that is covered by the pseudo-header
#[must_use]
pub fn verify_transport(data: &[u8], hdr: &L4Header) -> bool {
    let segment = hdr.transport(data);
    let sum = sum_bytes(segment, pseudo_header(hdr.src, hdr.dst, hdr.protonum, segment.len()));
    fold(sum) == 0xffff
}

/// Verify data whose checksum covers only itself
#[must_use]
pub fn verify_plain(data: &[u8]) -> bool {
    fold(sum_bytes(data, 0)) == 0xffff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1071_example() {
        // Example from RFC 1071 section 3
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(fold(sum_bytes(&data, 0)), 0xddf2);
    }

    #[test]
    fn test_odd_length() {
        assert_eq!(sum_bytes(&[0x12], 0), 0x1200);
    }

    #[test]
    fn test_plain_round_trip() {
        let mut data = vec![0x08, 0x00, 0x00, 0x00, 0x12, 0x34, 0x00, 0x01, b'h', b'i'];
        let csum = plain_checksum(&data);
        data[2..4].copy_from_slice(&csum.to_be_bytes());
        assert!(verify_plain(&data));
        data[9] ^= 0xff;
        assert!(!verify_plain(&data));
    }
}
