use std::sync::atomic::{AtomicU8, Ordering};

/// Per-connection lifecycle state (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
    Reconnecting = 4,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            3 => ConnectionState::Disconnected,
            4 => ConnectionState::Reconnecting,
            _ => unreachable!("invalid encoded connection state"),
        }
    }

    /// Whether `self -> next` is an allowed transition per the state table
    /// in spec §4.1.
    fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Reconnecting)
                | (Disconnecting, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid state transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Atomic holder for a connection's FSM state. Transitions are a single
/// compare-and-swap, so concurrent callers never observe a torn state and at
/// most one caller wins a racing transition.
pub struct StateCell {
    raw: AtomicU8,
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> Self {
        Self {
            raw: AtomicU8::new(initial as u8),
        }
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.raw.load(Ordering::SeqCst))
    }

    /// Attempt `current -> next`. On success returns the prior state so
    /// callers can fire "left state X" observers; on failure the state is
    /// left untouched and `InvalidTransition` is returned.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        loop {
            let current_raw = self.raw.load(Ordering::SeqCst);
            let current = ConnectionState::from_u8(current_raw);
            if !current.can_transition_to(next) {
                return Err(InvalidTransition { from: current, to: next });
            }
            if self
                .raw
                .compare_exchange(
                    current_raw,
                    next as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return Ok(current);
            }
            // Lost the race — retry against the freshly observed state.
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ConnectionState::Connecting)
    }
}
