//! Collaborators the engine calls out to
//!
//! Neither trait is implemented inside the crate. A security module that
//! labels flows plugs in through [`SecurityLabel`]; an inline forwarder that
//! takes over offloaded flows plugs in through [`FastPath`].

use std::fmt;
use std::sync::Arc;

use crate::conn::Connection;
use crate::packet::Packet;

/// What the security collaborator wants done with a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelDecision {
    #[default]
    Keep,
    /// Exempt the connection from further labelling
    Skip,
}

/// Labels connections at confirm time and on locally generated output
pub trait SecurityLabel: Send + Sync + fmt::Debug {
    /// `is_input` is true for packets delivered to the local host
    fn label(&self, packet: &Packet, conn: &Connection, is_input: bool) -> LabelDecision;
}

/// Takes ownership of packets belonging to offloaded connections
pub trait FastPath: Send + Sync + fmt::Debug {
    /// The engine has already associated `packet` with `conn`
    fn forward(&self, packet: Packet, conn: &Arc<Connection>);
}
