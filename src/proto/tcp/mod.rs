//! TCP tracker
//!
//! Follows the handshake and teardown through [`state::transition`] and
//! checks every segment against the sequence windows both ends advertised
//! ([`window::in_window`]). Segments the table cannot judge are let through
//! without touching state, and the details are remembered so that a later
//! SYN/ACK can resynchronize the tracker with the endpoints.

pub mod state;
pub mod window;

use tracing::debug;

use crate::config::TcpTimeoutConfig;
use crate::conn::{Connection, Status};
use crate::error::PacketError;
use crate::netns::TrackerSettings;
use crate::packet::checksum::verify_transport;
use crate::packet::Hook;
use crate::tuple::{Direction, IPPROTO_TCP};

use super::{ErrorCheck, ErrorCtx, L4Tracker, PacketCtx, PacketView, ProtoState, Timeouts, TrackAction};

pub use state::{flags, valid_flags, FlagClass, TcpState, Transition};
pub use window::{dir_flags, in_window, Segment, TcpDirState};

/// Per-state timeouts in milliseconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpTimeouts {
    states: [u64; 10],
    retrans: u64,
    unack: u64,
}

impl TcpTimeouts {
    #[must_use]
    pub fn from_config(config: &TcpTimeoutConfig) -> Self {
        let ms = |secs: u64| secs.saturating_mul(1000);
        Self {
            states: [
                ms(config.close),
                ms(config.syn_sent),
                ms(config.syn_recv),
                ms(config.established),
                ms(config.fin_wait),
                ms(config.close_wait),
                ms(config.last_ack),
                ms(config.time_wait),
                ms(config.close),
                ms(config.syn_sent2),
            ],
            retrans: ms(config.retrans),
            unack: ms(config.unack),
        }
    }

    #[inline]
    #[must_use]
    pub const fn for_state(&self, state: TcpState) -> u64 {
        self.states[state.index()]
    }

    /// Applied after too many retransmissions or to a zero window
    #[inline]
    #[must_use]
    pub const fn retrans(&self) -> u64 {
        self.retrans
    }

    /// Applied while sent data is unacknowledged
    #[inline]
    #[must_use]
    pub const fn unack(&self) -> u64 {
        self.unack
    }
}

impl Default for TcpTimeouts {
    fn default() -> Self {
        Self::from_config(&TcpTimeoutConfig::default())
    }
}

/// TCP sub-state of a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpConn {
    /// Window state, original then reply
    pub seen: [TcpDirState; 2],
    pub state: TcpState,
    /// Direction of the last in-window or ignored segment
    pub last_dir: Direction,
    pub last_index: FlagClass,
    pub last_seq: u32,
    pub last_ack: u32,
    pub last_end: u32,
    pub last_win: u16,
    /// Window scale and option flags of the last ignored SYN
    pub last_wscale: u8,
    pub last_flags: u8,
    /// Identical ACKs seen in a row
    pub retrans: u8,
}

impl TcpConn {
    /// Either side has data in flight
    #[must_use]
    pub const fn data_unacknowledged(&self) -> bool {
        (self.seen[0].flags | self.seen[1].flags) & dir_flags::DATA_UNACKNOWLEDGED != 0
    }

    /// Either side sent the first FIN
    #[must_use]
    pub const fn close_initiated(&self) -> bool {
        (self.seen[0].flags | self.seen[1].flags) & dir_flags::CLOSE_INIT != 0
    }
}

/// The TCP tracker
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTracker;

impl TcpTracker {
    fn segment<'a>(view: &PacketView<'a>) -> Option<Segment<'a>> {
        Segment::parse(view.transport()).ok()
    }

    /// Resynchronize from an ignored SYN that this SYN/ACK acknowledges
    fn resync(tcp: &mut TcpConn, dir: Direction) {
        let last = tcp.last_dir.index();
        let end = tcp.last_end;
        let seen = &mut tcp.seen[last];
        seen.td_end = end;
        seen.td_maxend = end;
        seen.td_maxwin = u32::from(tcp.last_win).max(1);
        seen.td_scale = tcp.last_wscale;
        tcp.last_flags &= !dir_flags::EXP_CHALLENGE_ACK;
        seen.flags = tcp.last_flags;
        tcp.seen[dir.index()] = TcpDirState::default();
    }

    /// Remember a segment the state table could not judge
    fn note_ignored(tcp: &mut TcpConn, dir: Direction, class: FlagClass, seg: &Segment<'_>, old: TcpState) {
        tcp.last_index = class;
        tcp.last_dir = dir;
        tcp.last_seq = seg.seq;
        tcp.last_end = seg.end();
        tcp.last_win = seg.window;

        if class == FlagClass::Syn && dir == Direction::Original {
            let mut seen = TcpDirState::default();
            tcp.last_flags = 0;
            tcp.last_wscale = 0;
            seg.read_options(&mut seen);
            if seen.flags & dir_flags::WINDOW_SCALE != 0 {
                tcp.last_flags |= dir_flags::WINDOW_SCALE;
                tcp.last_wscale = seen.td_scale;
            }
            if seen.flags & dir_flags::SACK_PERM != 0 {
                tcp.last_flags |= dir_flags::SACK_PERM;
            }
            if old == TcpState::LastAck {
                tcp.last_flags |= dir_flags::EXP_CHALLENGE_ACK;
            }
        }
    }
}

impl L4Tracker for TcpTracker {
    fn protonum(&self) -> u8 {
        IPPROTO_TCP
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn error(&self, view: &PacketView<'_>, ctx: &ErrorCtx<'_>) -> ErrorCheck {
        let seg = match Segment::parse(view.transport()) {
            Ok(seg) => seg,
            Err(e) => return ErrorCheck::Invalid(e),
        };
        if ctx.settings.checksum
            && view.hook == Hook::PreRouting
            && !verify_transport(view.data, &view.hdr)
        {
            return ErrorCheck::Invalid(PacketError::BadChecksum { protocol: "TCP" });
        }
        if !valid_flags(seg.flags) {
            return ErrorCheck::Invalid(PacketError::InvalidFlags(seg.flags));
        }
        ErrorCheck::Track
    }

    fn new_conn(&self, conn: &Connection, view: &PacketView<'_>, settings: &TrackerSettings) -> bool {
        let Some(seg) = Self::segment(view) else {
            return false;
        };
        let mut tcp = TcpConn::default();
        let first = &mut tcp.seen[0];

        match state::initial(seg.class()) {
            Transition::To(TcpState::SynSent) => {
                first.td_end = seg.end();
                first.td_maxwin = u32::from(seg.window).max(1);
                first.td_maxend = first.td_end;
                seg.read_options(first);
            }
            Transition::To(_) if settings.tcp_loose => {
                // Picked up mid-stream: assume SACK and liberal windows
                first.td_end = seg.end();
                first.td_maxwin = u32::from(seg.window).max(1);
                first.td_maxend = first.td_end.wrapping_add(first.td_maxwin);
                tcp.seen[0].flags = dir_flags::SACK_PERM | dir_flags::BE_LIBERAL;
                tcp.seen[1].flags = dir_flags::SACK_PERM | dir_flags::BE_LIBERAL;
            }
            Transition::To(_) => {
                debug!(conn_id = conn.id(), "refusing mid-stream pickup");
                return false;
            }
            Transition::Ignore | Transition::Invalid => {
                debug!(conn_id = conn.id(), flags = seg.flags, "invalid first segment");
                return false;
            }
        }

        tcp.last_index = FlagClass::None;
        *conn.proto() = ProtoState::Tcp(tcp);
        true
    }

    #[allow(clippy::too_many_lines)]
    fn packet(&self, conn: &Connection, view: &PacketView<'_>, ctx: &PacketCtx<'_>) -> TrackAction {
        let Some(seg) = Self::segment(view) else {
            return TrackAction::Drop;
        };
        let settings = ctx.settings;
        let dir = ctx.ctinfo.direction();
        let class = seg.class();

        let mut guard = conn.proto();
        let ProtoState::Tcp(tcp) = &mut *guard else {
            return TrackAction::Drop;
        };

        let mut old = tcp.state;
        let mut next = state::transition(dir, class, old);

        if next == Transition::To(TcpState::SynSent) && old >= TcpState::TimeWait {
            let aborted = tcp.last_dir == dir && tcp.last_index == FlagClass::Rst;
            if tcp.close_initiated() || aborted {
                debug!(conn_id = conn.id(), state = %old, "reopening closed connection");
                return TrackAction::Repeat;
            }
            next = Transition::Ignore;
        }

        match next {
            Transition::Ignore => {
                if class == FlagClass::SynAck
                    && tcp.last_index == FlagClass::Syn
                    && tcp.last_dir != dir
                    && seg.ack == tcp.last_end
                {
                    // Both ends are in sync, only the tracker was not
                    old = TcpState::SynSent;
                    next = Transition::To(TcpState::SynRecv);
                    Self::resync(tcp, dir);
                } else {
                    Self::note_ignored(tcp, dir, class, &seg, old);
                    debug!(conn_id = conn.id(), state = %old, "invalid packet ignored");
                    return TrackAction::Accept;
                }
            }
            Transition::Invalid => {
                debug!(conn_id = conn.id(), state = %old, flags = seg.flags, "invalid state");
                return TrackAction::Drop;
            }
            Transition::To(TcpState::TimeWait) => {
                if old == TcpState::LastAck
                    && class == FlagClass::Ack
                    && tcp.last_dir != dir
                    && tcp.last_index == FlagClass::Syn
                    && tcp.last_flags & dir_flags::EXP_CHALLENGE_ACK != 0
                {
                    tcp.last_flags &= !dir_flags::EXP_CHALLENGE_ACK;
                    debug!(conn_id = conn.id(), "challenge ACK ignored");
                    return TrackAction::Accept;
                }
            }
            Transition::To(TcpState::SynSent2) => {
                tcp.last_flags |= dir_flags::SIMOPEN;
            }
            Transition::To(TcpState::SynRecv) => {
                if dir == Direction::Reply
                    && class == FlagClass::Ack
                    && tcp.last_flags & dir_flags::SIMOPEN != 0
                {
                    next = Transition::To(TcpState::Established);
                }
            }
            Transition::To(TcpState::Close) if class == FlagClass::Rst => {
                let peer = tcp.seen[dir.reverse().index()];
                if peer.flags & dir_flags::MAXACK_SET != 0 {
                    if window::before(seg.seq, peer.td_maxack) {
                        debug!(conn_id = conn.id(), "invalid RST");
                        return TrackAction::Drop;
                    }
                    let established = conn.test(Status::ASSURED) && old == TcpState::Established;
                    let in_train = tcp.last_index == FlagClass::Ack
                        && tcp.last_dir == dir
                        && seg.seq == tcp.last_end;
                    if established && seg.seq != peer.td_maxack && !in_train {
                        // Inexact RST: stay put so a challenge ACK can pass
                        next = Transition::To(old);
                    }
                }
                let answered_probe = (conn.test(Status::SEEN_REPLY)
                    && tcp.last_index == FlagClass::Syn)
                    || (!conn.is_assured() && tcp.last_index == FlagClass::Ack);
                if answered_probe && seg.ack == tcp.last_end {
                    // RST answering a segment we let through while out of sync
                    return TrackAction::Kill;
                }
            }
            Transition::To(_) => {}
        }

        let Transition::To(new_state) = next else {
            return TrackAction::Drop;
        };

        if let Err(reason) = in_window(tcp, dir, class, &seg, settings.tcp_be_liberal) {
            debug!(conn_id = conn.id(), state = %old, reason, "segment out of window");
            return TrackAction::Drop;
        }

        tcp.last_index = class;
        tcp.last_dir = dir;
        tcp.state = new_state;
        if old != new_state {
            tcp.retrans = 0;
            if new_state == TcpState::FinWait {
                tcp.seen[dir.index()].flags |= dir_flags::CLOSE_INIT;
            }
        }

        let timeouts = &settings.tcp_timeouts;
        let state_timeout = timeouts.for_state(new_state);
        let mut timeout = if tcp.retrans >= settings.tcp_max_retrans
            && state_timeout > timeouts.retrans()
        {
            timeouts.retrans()
        } else if class == FlagClass::Rst {
            timeouts.for_state(TcpState::Close)
        } else if tcp.data_unacknowledged() && state_timeout > timeouts.unack() {
            timeouts.unack()
        } else if tcp.last_win == 0 && state_timeout > timeouts.retrans() {
            timeouts.retrans()
        } else {
            state_timeout
        };
        drop(guard);

        if old != new_state {
            debug!(conn_id = conn.id(), from = %old, to = %new_state, "tcp state change");
        }

        if !conn.test(Status::SEEN_REPLY) {
            if seg.has(flags::RST) {
                // The only answer was a reset
                return TrackAction::Kill;
            }
            if new_state == TcpState::Established && timeout > timeouts.unack() {
                timeout = timeouts.unack();
            }
        } else if !conn.is_assured()
            && matches!(old, TcpState::SynRecv | TcpState::Established)
            && new_state == TcpState::Established
        {
            conn.set_status(Status::ASSURED);
        }

        conn.refresh(ctx.now_ms, timeout);
        TrackAction::Accept
    }

    fn timeouts(&self, settings: &TrackerSettings) -> Timeouts {
        Timeouts::Tcp(settings.tcp_timeouts.clone())
    }

    fn can_early_drop(&self, conn: &Connection) -> bool {
        conn.tcp_state().is_some_and(TcpState::is_closing)
    }
}
