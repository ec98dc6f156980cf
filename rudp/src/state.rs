//! Connection finite-state machine (FSM) types.
//!
//! This module defines every status a [`crate::connection::Connection`] can
//! occupy and the role it plays.  Transitions are driven by
//! [`crate::connection`]; this module only guarantees that each transition is
//! applied atomically and at most once.
//!
//! ```text
//!  CONNECTING ──ConnAck / Conn──▶ OPEN ──Close() / peer Fin──▶ CLOSING ──▶ CLOSED
//!       │                          │                              │
//!       └──────────── unrecoverable socket error ─────────────────┴──▶ FAILED
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Handshake in progress.
    #[default]
    Connecting,
    /// Handshake complete; data transfer in progress.
    Open,
    /// A Fin has been sent or received; teardown pending.
    Closing,
    /// Teardown complete.
    Closed,
    /// An unrecoverable I/O error stopped every loop.
    Failed,
}

impl ConnectionState {
    /// `true` for the two states no connection ever leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
            Self::Failed => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            3 => Self::Closed,
            _ => Self::Failed,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Which side of the handshake a connection played.  Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed out and sent the `Conn` segment.
    Client,
    /// Created by the listener on an inbound `Conn`.
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Lock-free holder for the single authoritative [`ConnectionState`].
///
/// Writers go through [`StateCell::transition`], so two loops racing on the
/// same transition cannot both win.
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`.  Returns `false` (and changes nothing) when
    /// the current state is not `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter a terminal state from whatever non-terminal state is current.
    ///
    /// Returns the state that was left, or `None` if the cell was already
    /// terminal.
    pub fn finish(&self, to: ConnectionState) -> Option<ConnectionState> {
        debug_assert!(to.is_terminal());
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let state = ConnectionState::from_u8(current);
            if state.is_terminal() {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                to.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(state),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_connecting() {
        assert_eq!(StateCell::default().get(), ConnectionState::Connecting);
    }

    #[test]
    fn transition_requires_expected_state() {
        let cell = StateCell::new(ConnectionState::Connecting);
        assert!(!cell.transition(ConnectionState::Open, ConnectionState::Closing));
        assert!(cell.transition(ConnectionState::Connecting, ConnectionState::Open));
        assert_eq!(cell.get(), ConnectionState::Open);
    }

    #[test]
    fn finish_happens_once() {
        let cell = StateCell::new(ConnectionState::Closing);
        assert_eq!(
            cell.finish(ConnectionState::Closed),
            Some(ConnectionState::Closing)
        );
        assert_eq!(cell.finish(ConnectionState::Failed), None);
        assert_eq!(cell.get(), ConnectionState::Closed);
    }
}
