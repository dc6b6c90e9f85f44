//! TCP connection states and the transition table

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tuple::Direction;

/// TCP control bits
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;
}

/// Tracked TCP state, ordered as the timeout table is indexed
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum TcpState {
    #[default]
    None = 0,
    SynSent,
    SynRecv,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    TimeWait,
    Close,
    /// Simultaneous open: SYN seen from both ends
    SynSent2,
}

impl TcpState {
    pub const ALL: [Self; 10] = [
        Self::None,
        Self::SynSent,
        Self::SynRecv,
        Self::Established,
        Self::FinWait,
        Self::CloseWait,
        Self::LastAck,
        Self::TimeWait,
        Self::Close,
        Self::SynSent2,
    ];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::SynSent => "SYN_SENT",
            Self::SynRecv => "SYN_RECV",
            Self::Established => "ESTABLISHED",
            Self::FinWait => "FIN_WAIT",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
            Self::Close => "CLOSE",
            Self::SynSent2 => "SYN_SENT2",
        }
    }

    /// Closing states; flows here may be evicted even when assured
    #[must_use]
    pub const fn is_closing(self) -> bool {
        matches!(
            self,
            Self::FinWait | Self::CloseWait | Self::LastAck | Self::TimeWait | Self::Close
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a table lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    To(TcpState),
    /// Cannot judge from this packet alone
    Ignore,
    Invalid,
}

/// Control-bit class a segment falls into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FlagClass {
    Syn = 0,
    SynAck,
    Fin,
    Ack,
    Rst,
    #[default]
    None,
}

impl FlagClass {
    /// Classify a segment's control bits; RST wins, then SYN, FIN, ACK
    #[must_use]
    pub const fn of(bits: u8) -> Self {
        if bits & flags::RST != 0 {
            Self::Rst
        } else if bits & flags::SYN != 0 {
            if bits & flags::ACK != 0 {
                Self::SynAck
            } else {
                Self::Syn
            }
        } else if bits & flags::FIN != 0 {
            Self::Fin
        } else if bits & flags::ACK != 0 {
            Self::Ack
        } else {
            Self::None
        }
    }
}

/// Control-bit combinations that can appear on the wire
///
/// ECE, CWR and PSH are ignored.
#[must_use]
pub const fn valid_flags(bits: u8) -> bool {
    use flags::{ACK, FIN, RST, SYN, URG};
    let x = bits & !(flags::ECE | flags::CWR | flags::PSH);
    x == SYN
        || x == SYN | URG
        || x == SYN | ACK
        || x == RST
        || x == RST | ACK
        || x == FIN | ACK
        || x == FIN | ACK | URG
        || x == ACK
        || x == ACK | URG
}

const S_SS: Transition = Transition::To(TcpState::SynSent);
const S_SR: Transition = Transition::To(TcpState::SynRecv);
const S_ES: Transition = Transition::To(TcpState::Established);
const S_FW: Transition = Transition::To(TcpState::FinWait);
const S_CW: Transition = Transition::To(TcpState::CloseWait);
const S_LA: Transition = Transition::To(TcpState::LastAck);
const S_TW: Transition = Transition::To(TcpState::TimeWait);
const S_CL: Transition = Transition::To(TcpState::Close);
const S_S2: Transition = Transition::To(TcpState::SynSent2);
const S_IV: Transition = Transition::Invalid;
const S_IG: Transition = Transition::Ignore;

// Rows: SYN, SYN/ACK, FIN, ACK, RST, none.
// Columns: NONE, SYN_SENT, SYN_RECV, ESTABLISHED, FIN_WAIT, CLOSE_WAIT,
//          LAST_ACK, TIME_WAIT, CLOSE, SYN_SENT2.
const TRANSITIONS: [[[Transition; 10]; 6]; 2] = [
    // Original
    [
        [S_SS, S_SS, S_IG, S_IG, S_IG, S_IG, S_IG, S_SS, S_SS, S_S2],
        [S_IV, S_IV, S_SR, S_IV, S_IV, S_IV, S_IV, S_IV, S_IV, S_SR],
        [S_IV, S_IV, S_FW, S_FW, S_LA, S_LA, S_LA, S_TW, S_CL, S_IV],
        [S_ES, S_IV, S_ES, S_ES, S_CW, S_CW, S_TW, S_TW, S_CL, S_IV],
        [S_IV, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL],
        [S_IV; 10],
    ],
    // Reply
    [
        [S_IV, S_S2, S_IV, S_IV, S_IV, S_IV, S_IV, S_SS, S_IV, S_S2],
        [S_IV, S_SR, S_IG, S_IG, S_IG, S_IG, S_IG, S_IG, S_IG, S_SR],
        [S_IV, S_IV, S_FW, S_FW, S_LA, S_LA, S_LA, S_TW, S_CL, S_IV],
        [S_IV, S_IG, S_SR, S_ES, S_CW, S_CW, S_TW, S_TW, S_CL, S_IG],
        [S_IV, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL, S_CL],
        [S_IV; 10],
    ],
];

/// Next state for a segment of `class` travelling in `dir` from `state`
#[inline]
#[must_use]
pub const fn transition(dir: Direction, class: FlagClass, state: TcpState) -> Transition {
    TRANSITIONS[dir.index()][class as usize][state.index()]
}

/// State a fresh connection starts in, given its first segment
#[must_use]
pub const fn initial(class: FlagClass) -> Transition {
    transition(Direction::Original, class, TcpState::None)
}
