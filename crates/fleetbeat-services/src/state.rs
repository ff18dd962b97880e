//! Session lifecycle states, shared by both ends of a link.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Handshaking = 2,
    Connected = 3,
    Reconnecting = 4,
    /// Reconnect attempts exhausted or shut down. Never left.
    Terminated = 5,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Handshaking,
            3 => Self::Connected,
            4 => Self::Reconnecting,
            5 => Self::Terminated,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free cell holding a [`SessionState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `state` unless the cell is already terminal. Returns whether the
    /// store happened.
    pub fn set(&self, state: SessionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur != SessionState::Terminated as u8).then_some(state as u8)
            })
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(SessionState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_is_sticky() {
        let cell = StateCell::default();
        assert!(cell.set(SessionState::Connected));
        assert!(cell.set(SessionState::Terminated));
        assert!(!cell.set(SessionState::Connecting));
        assert_eq!(cell.get(), SessionState::Terminated);
    }

    #[test]
    fn state_names_are_snake_case() {
        assert_eq!(SessionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_string(&SessionState::Handshaking).unwrap(),
            "\"handshaking\""
        );
    }
}
