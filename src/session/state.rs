//! Session migration state machine.
//!
//! The state is a pure value; [`Session`](super::Session) owns the only
//! mutable copy and calls [`check_transition`] before every change.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::protocol::opcode::MessageKind;

/// Migration state of one client session.
///
/// Variants are declared in lifecycle order; the derived `Ord` reflects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrateState {
    Unidentified,
    WaitHandoffIn,
    WaitAuthorityConfirmed,
    Active,
    WaitAuthorityReleased,
    WaitHandoffOut,
    Terminal,
}

impl MigrateState {
    pub const ALL: [MigrateState; 7] = [
        MigrateState::Unidentified,
        MigrateState::WaitHandoffIn,
        MigrateState::WaitAuthorityConfirmed,
        MigrateState::Active,
        MigrateState::WaitAuthorityReleased,
        MigrateState::WaitHandoffOut,
        MigrateState::Terminal,
    ];

    /// Which deadline governs this state.
    pub fn timer(self) -> TimerKind {
        match self {
            MigrateState::Unidentified
            | MigrateState::WaitHandoffIn
            | MigrateState::WaitAuthorityConfirmed
            | MigrateState::Active => TimerKind::Idle,
            MigrateState::WaitAuthorityReleased | MigrateState::WaitHandoffOut => {
                TimerKind::Migration
            }
            MigrateState::Terminal => TimerKind::None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == MigrateState::Terminal
    }
}

/// Deadline family a state is subject to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Measured from the last inbound activity.
    Idle,
    /// Measured from the start of an outbound migration.
    Migration,
    None,
}

/// Which kind of server role a session lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Login,
    Channel,
    Shop,
}

impl RoleKind {
    /// Roles that only ever receive sessions through a hand-off.
    pub fn accepts_handoff(self) -> bool {
        matches!(self, RoleKind::Channel | RoleKind::Shop)
    }
}

/// Gate table: may a message of `kind` be processed in `state` on a `role` session?
pub fn allows(role: RoleKind, state: MigrateState, kind: MessageKind) -> bool {
    use MessageKind::*;
    use MigrateState::*;

    match (state, kind) {
        (Terminal, _) => false,
        (_, Keepalive) => true,

        (Unidentified, MigrateIn) => role.accepts_handoff(),
        (WaitHandoffIn, MigrateIn) => true,
        (_, MigrateIn) => false,

        (Unidentified, Business) => role == RoleKind::Login,
        (Active, Business) => true,
        (WaitAuthorityReleased | WaitHandoffOut, Business) => role.accepts_handoff(),
        (WaitHandoffIn | WaitAuthorityConfirmed, Business) => false,
    }
}

/// Validate a state change for a `role` session.
pub fn check_transition(role: RoleKind, from: MigrateState, to: MigrateState) -> Result<()> {
    use MigrateState::*;

    let legal = match (from, to) {
        (Terminal, _) => false,
        (_, Terminal) => true,
        (Unidentified, WaitHandoffIn) => role.accepts_handoff(),
        (Unidentified | WaitHandoffIn, WaitAuthorityConfirmed) => role.accepts_handoff(),
        (Unidentified, Active) => role == RoleKind::Login,
        (WaitAuthorityConfirmed, Active) => true,
        (Active, WaitAuthorityReleased) => true,
        (WaitAuthorityReleased, WaitHandoffOut) => true,
        // Directory miss: the hop was declined and the session stays put.
        (WaitAuthorityReleased, Active) => true,
        _ => false,
    };

    if legal {
        Ok(())
    } else {
        Err(ProtocolError::IllegalTransition { from, to })
    }
}
