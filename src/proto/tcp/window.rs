//! Sequence-space window tracking
//!
//! Each direction keeps the highest sequence end it sent (`td_end`), the
//! highest end the peer's window allows (`td_maxend`), the largest window
//! it advertised (`td_maxwin`) and its window scale. A segment is in window
//! when its sequence range overlaps what the receiver can accept and its
//! acknowledgment covers data the receiver actually sent.

use super::state::{flags, FlagClass, TcpState};
use super::TcpConn;
use crate::error::PacketError;
use crate::tuple::Direction;

/// Per-direction window flags
pub mod dir_flags {
    /// Window scale option seen on the SYN
    pub const WINDOW_SCALE: u8 = 0x01;
    /// SACK permitted option seen on the SYN
    pub const SACK_PERM: u8 = 0x02;
    /// This side sent the first FIN
    pub const CLOSE_INIT: u8 = 0x04;
    /// Window checks always pass for this side
    pub const BE_LIBERAL: u8 = 0x08;
    /// Sent data not yet acknowledged
    pub const DATA_UNACKNOWLEDGED: u8 = 0x10;
    /// `td_maxack` holds a real value
    pub const MAXACK_SET: u8 = 0x20;
    /// A challenge ACK may follow an ignored SYN
    pub const EXP_CHALLENGE_ACK: u8 = 0x40;
    /// Simultaneous open in progress
    pub const SIMOPEN: u8 = 0x80;
}

/// Largest window scale shift accepted
const MAX_WSCALE: u8 = 14;
/// Floor for the acknowledgment window
const MAXACKWINCONST: u32 = 66_000;

const TCPOPT_EOL: u8 = 0;
const TCPOPT_NOP: u8 = 1;
const TCPOPT_WINDOW: u8 = 3;
const TCPOPT_SACK_PERM: u8 = 4;
const TCPOPT_SACK: u8 = 5;
const TCPOLEN_WINDOW: usize = 3;
const TCPOLEN_SACK_PERM: usize = 2;
const TCPOLEN_SACK_BASE: usize = 2;
const TCPOLEN_SACK_PERBLOCK: usize = 8;

/// Window state of one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpDirState {
    pub td_end: u32,
    pub td_maxend: u32,
    pub td_maxwin: u32,
    pub td_maxack: u32,
    pub td_scale: u8,
    pub flags: u8,
}

/// `a` comes before `b` in sequence space
#[inline]
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a` comes after `b` in sequence space
#[inline]
#[must_use]
pub const fn after(a: u32, b: u32) -> bool {
    before(b, a)
}

/// The fields of a TCP header the tracker reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub flags: u8,
    pub options: &'a [u8],
    pub payload_len: usize,
}

impl<'a> Segment<'a> {
    /// Parse a TCP header from the start of `transport`
    ///
    /// # Errors
    ///
    /// Returns `PacketError::Truncated` when the fixed header or the
    /// declared header length does not fit.
    pub fn parse(transport: &'a [u8]) -> Result<Self, PacketError> {
        if transport.len() < 20 {
            return Err(PacketError::truncated("TCP", 20, transport.len()));
        }
        let doff = usize::from(transport[12] >> 4) * 4;
        if doff < 20 {
            return Err(PacketError::Malformed("TCP data offset below header size"));
        }
        if transport.len() < doff {
            return Err(PacketError::truncated("TCP", doff, transport.len()));
        }
        let be32 = |at: usize| {
            u32::from_be_bytes([transport[at], transport[at + 1], transport[at + 2], transport[at + 3]])
        };
        Ok(Self {
            src_port: u16::from_be_bytes([transport[0], transport[1]]),
            dst_port: u16::from_be_bytes([transport[2], transport[3]]),
            seq: be32(4),
            ack: be32(8),
            window: u16::from_be_bytes([transport[14], transport[15]]),
            flags: transport[13],
            options: &transport[20..doff],
            payload_len: transport.len() - doff,
        })
    }

    #[inline]
    #[must_use]
    pub const fn has(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    #[inline]
    #[must_use]
    pub const fn class(&self) -> FlagClass {
        FlagClass::of(self.flags)
    }

    /// Sequence number just past this segment; SYN and FIN count as one
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn end(&self) -> u32 {
        self.seq
            .wrapping_add(self.payload_len as u32)
            .wrapping_add(u32::from(self.has(flags::SYN)))
            .wrapping_add(u32::from(self.has(flags::FIN)))
    }

    /// Iterate `(kind, body)` over well-formed options
    fn each_option(&self, mut f: impl FnMut(u8, &[u8])) {
        let mut opts = self.options;
        while let Some((&kind, rest)) = opts.split_first() {
            match kind {
                TCPOPT_EOL => return,
                TCPOPT_NOP => opts = rest,
                _ => {
                    let Some(&size) = rest.first() else { return };
                    let size = usize::from(size);
                    if size < 2 || size > opts.len() {
                        return;
                    }
                    f(kind, &opts[..size]);
                    opts = &opts[size..];
                }
            }
        }
    }

    /// Read window scale and SACK permitted into `state`, resetting both first
    pub fn read_options(&self, state: &mut TcpDirState) {
        state.td_scale = 0;
        state.flags &= dir_flags::BE_LIBERAL;
        self.each_option(|kind, opt| match kind {
            TCPOPT_SACK_PERM if opt.len() == TCPOLEN_SACK_PERM => {
                state.flags |= dir_flags::SACK_PERM;
            }
            TCPOPT_WINDOW if opt.len() == TCPOLEN_WINDOW => {
                state.td_scale = opt[2].min(MAX_WSCALE);
                state.flags |= dir_flags::WINDOW_SCALE;
            }
            _ => {}
        });
    }

    /// Highest right edge across SACK blocks, or `ack` when none is higher
    #[must_use]
    pub fn highest_sack(&self, ack: u32) -> u32 {
        let mut sack = ack;
        self.each_option(|kind, opt| {
            if kind != TCPOPT_SACK
                || opt.len() < TCPOLEN_SACK_BASE + TCPOLEN_SACK_PERBLOCK
                || (opt.len() - TCPOLEN_SACK_BASE) % TCPOLEN_SACK_PERBLOCK != 0
            {
                return;
            }
            for block in opt[TCPOLEN_SACK_BASE..].chunks_exact(TCPOLEN_SACK_PERBLOCK) {
                let right = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
                if after(right, sack) {
                    sack = right;
                }
            }
        });
        sack
    }
}

/// Acknowledgment window for a sender
const fn max_ack_window(sender: &TcpDirState) -> u32 {
    if sender.td_maxwin > MAXACKWINCONST {
        sender.td_maxwin
    } else {
        MAXACKWINCONST
    }
}

/// Check a segment against both directions' windows and update them
///
/// # Errors
///
/// Returns a short reason naming the first failed check when the segment
/// is out of window and neither side is liberal.
pub fn in_window(
    conn: &mut TcpConn,
    dir: Direction,
    class: FlagClass,
    seg: &Segment<'_>,
    be_liberal: bool,
) -> Result<(), &'static str> {
    let state = conn.state;
    let [orig, reply] = &mut conn.seen;
    let (sender, receiver) = match dir {
        Direction::Original => (orig, reply),
        Direction::Reply => (reply, orig),
    };

    let mut seq = seg.seq;
    let mut ack = seg.ack;
    let mut sack = seg.ack;
    let mut win = u32::from(seg.window);
    let mut end = seg.end();

    if receiver.flags & dir_flags::SACK_PERM != 0 {
        sack = seg.highest_sack(sack);
    }

    if sender.td_maxwin == 0 {
        if seg.has(flags::SYN) {
            // SYN/ACK answering a SYN, or a SYN from the reply side
            sender.td_end = end;
            sender.td_maxend = end;
            sender.td_maxwin = win.max(1);
            seg.read_options(sender);
            if sender.flags & receiver.flags & dir_flags::WINDOW_SCALE == 0 {
                sender.td_scale = 0;
                receiver.td_scale = 0;
            }
            if !seg.has(flags::ACK) {
                return Ok(());
            }
        } else {
            // Picked up mid-stream
            sender.td_end = end;
            let swin = win << sender.td_scale;
            sender.td_maxwin = swin.max(1);
            sender.td_maxend = end.wrapping_add(sender.td_maxwin);
            if receiver.td_maxwin == 0 {
                receiver.td_end = sack;
                receiver.td_maxend = sack;
            } else if sack == receiver.td_end.wrapping_add(1) {
                // Reply to a keepalive
                receiver.td_end = receiver.td_end.wrapping_add(1);
            }
        }
    } else if ((state == TcpState::SynSent && dir == Direction::Original)
        || (state == TcpState::SynRecv && dir == Direction::Reply))
        && after(end, sender.td_end)
    {
        // Reinitialized with a higher initial sequence number
        sender.td_end = end;
        sender.td_maxend = end;
        sender.td_maxwin = win.max(1);
        seg.read_options(sender);
    }

    if !seg.has(flags::ACK)
        || (seg.flags & (flags::ACK | flags::RST) == flags::ACK | flags::RST && ack == 0)
    {
        // No usable ACK: pretend it acknowledged everything
        ack = receiver.td_end;
        sack = receiver.td_end;
    }

    if seg.has(flags::RST) && seq == 0 && state == TcpState::SynSent {
        // RST answering a SYN
        seq = sender.td_end;
        end = sender.td_end;
    }

    let in_recv_win = receiver.td_maxwin == 0
        || after(end, sender.td_end.wrapping_sub(receiver.td_maxwin).wrapping_sub(1));

    let checks = [
        (before(seq, sender.td_maxend.wrapping_add(1)), "SEQ is over the upper bound (over the window of the receiver)"),
        (in_recv_win, "SEQ is under the lower bound (already ACKed data retransmitted)"),
        (before(sack, receiver.td_end.wrapping_add(1)), "ACK is over the upper bound (ACKed data not seen yet)"),
        (
            after(sack, receiver.td_end.wrapping_sub(max_ack_window(sender)).wrapping_sub(1)),
            "ACK is under the lower bound (possible overly delayed ACK)",
        ),
    ];

    if let Some((_, reason)) = checks.iter().find(|(ok, _)| !ok) {
        if sender.flags & dir_flags::BE_LIBERAL != 0 || be_liberal {
            return Ok(());
        }
        return Err(*reason);
    }

    if !seg.has(flags::SYN) {
        win <<= sender.td_scale;
    }

    let swin = win.wrapping_add(sack.wrapping_sub(ack));
    if sender.td_maxwin < swin {
        sender.td_maxwin = swin;
    }
    if after(end, sender.td_end) {
        sender.td_end = end;
        sender.flags |= dir_flags::DATA_UNACKNOWLEDGED;
    }
    if seg.has(flags::ACK) {
        if sender.flags & dir_flags::MAXACK_SET == 0 {
            sender.td_maxack = ack;
            sender.flags |= dir_flags::MAXACK_SET;
        } else if after(ack, sender.td_maxack) {
            sender.td_maxack = ack;
        }
    }

    if receiver.td_maxwin != 0 && after(end, sender.td_maxend) {
        receiver.td_maxwin = receiver
            .td_maxwin
            .wrapping_add(end.wrapping_sub(sender.td_maxend));
    }
    if after(sack.wrapping_add(win), receiver.td_maxend.wrapping_sub(1)) {
        receiver.td_maxend = sack.wrapping_add(win);
        if win == 0 {
            receiver.td_maxend = receiver.td_maxend.wrapping_add(1);
        }
    }
    if ack == receiver.td_end {
        receiver.flags &= !dir_flags::DATA_UNACKNOWLEDGED;
    }

    if class == FlagClass::Ack {
        let window = u16::try_from(win).unwrap_or(u16::MAX);
        if conn.last_dir == dir
            && conn.last_seq == seq
            && conn.last_ack == ack
            && conn.last_end == end
            && conn.last_win == window
        {
            conn.retrans = conn.retrans.saturating_add(1);
        } else {
            conn.last_dir = dir;
            conn.last_seq = seq;
            conn.last_ack = ack;
            conn.last_end = end;
            conn.last_win = window;
            conn.retrans = 0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TcpSegment;

    fn segment_bytes(builder: TcpSegment) -> Vec<u8> {
        builder.segment()
    }

    fn builder() -> TcpSegment {
        TcpSegment::new("10.0.0.1:40000".parse().unwrap(), "10.0.0.2:80".parse().unwrap())
    }

    #[test]
    fn test_sequence_comparison_wraps() {
        assert!(before(1, 2));
        assert!(after(2, 1));
        assert!(before(u32::MAX, 0));
        assert!(after(5, u32::MAX - 5));
        assert!(!before(7, 7));
    }

    #[test]
    fn test_parse_segment() {
        let bytes = segment_bytes(builder().seq(1000).ack(7).window(512).syn().payload(b"abc"));
        let seg = Segment::parse(&bytes).unwrap();
        assert_eq!(seg.src_port, 40000);
        assert_eq!(seg.dst_port, 80);
        assert_eq!(seg.seq, 1000);
        assert_eq!(seg.window, 512);
        assert_eq!(seg.payload_len, 3);
        assert_eq!(seg.class(), FlagClass::Syn);
        assert_eq!(seg.end(), 1004);
    }

    #[test]
    fn test_parse_rejects_short_header() {
        let bytes = segment_bytes(builder().syn());
        assert!(matches!(
            Segment::parse(&bytes[..12]),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn test_options_window_scale_and_sack_perm() {
        let bytes = segment_bytes(builder().syn().mss(1460).wscale(20).sack_perm());
        let seg = Segment::parse(&bytes).unwrap();
        let mut state = TcpDirState {
            flags: dir_flags::BE_LIBERAL | dir_flags::CLOSE_INIT,
            ..TcpDirState::default()
        };
        seg.read_options(&mut state);
        assert_eq!(state.td_scale, MAX_WSCALE);
        assert_eq!(
            state.flags,
            dir_flags::BE_LIBERAL | dir_flags::WINDOW_SCALE | dir_flags::SACK_PERM
        );
    }

    #[test]
    fn test_highest_sack_block() {
        let bytes = segment_bytes(builder().ack(100).sack(200, 300).sack(150, 250));
        let seg = Segment::parse(&bytes).unwrap();
        assert_eq!(seg.highest_sack(100), 300);
        assert_eq!(seg.highest_sack(400), 400);
    }

    fn handshake() -> TcpConn {
        // SYN seen by tcp_new: td_end = isn + 1
        let mut conn = TcpConn::default();
        conn.seen[0].td_end = 1001;
        conn.seen[0].td_maxend = 1001;
        conn.seen[0].td_maxwin = 65535;
        conn.state = TcpState::SynSent;

        let synack = segment_bytes(builder().seq(5000).ack(1001).window(65535).syn());
        let seg = Segment::parse(&synack).unwrap();
        in_window(&mut conn, Direction::Reply, FlagClass::SynAck, &seg, false).unwrap();
        conn.state = TcpState::SynRecv;
        conn
    }

    #[test]
    fn test_in_window_accepts_handshake() {
        let mut conn = handshake();
        assert_eq!(conn.seen[1].td_end, 5001);

        let ack = segment_bytes(builder().seq(1001).ack(5001).window(65535));
        let seg = Segment::parse(&ack).unwrap();
        assert!(in_window(&mut conn, Direction::Original, FlagClass::Ack, &seg, false).is_ok());
        assert_eq!(conn.seen[0].td_maxack, 5001);
    }

    #[test]
    fn test_in_window_rejects_ack_of_unseen_data() {
        let mut conn = handshake();
        let ack = segment_bytes(builder().seq(1001).ack(900_000).window(65535));
        let seg = Segment::parse(&ack).unwrap();
        let err = in_window(&mut conn, Direction::Original, FlagClass::Ack, &seg, false).unwrap_err();
        assert!(err.starts_with("ACK is over"));

        // Liberal tracking lets it through
        assert!(in_window(&mut conn, Direction::Original, FlagClass::Ack, &seg, true).is_ok());
    }

    #[test]
    fn test_ack_lower_bound_follows_sender_window() {
        let stale = segment_bytes(builder().seq(1001).ack(5001u32.wrapping_sub(100_000)).window(65535));
        let seg = Segment::parse(&stale).unwrap();

        let mut conn = handshake();
        let err = in_window(&mut conn, Direction::Original, FlagClass::Ack, &seg, false).unwrap_err();
        assert!(err.starts_with("ACK is under"));

        // A sender with a larger window may acknowledge further back
        let mut conn = handshake();
        conn.seen[0].td_maxwin = 200_000;
        assert!(conn.seen[1].td_maxwin < 100_000);
        assert!(in_window(&mut conn, Direction::Original, FlagClass::Ack, &seg, false).is_ok());
    }

    #[test]
    fn test_retransmission_counted() {
        let mut conn = handshake();
        let ack = segment_bytes(builder().seq(1001).ack(5001).window(1000).payload(b"data"));
        let seg = Segment::parse(&ack).unwrap();
        for _ in 0..3 {
            in_window(&mut conn, Direction::Original, FlagClass::Ack, &seg, false).unwrap();
        }
        assert_eq!(conn.retrans, 2);
    }
}
