//! L8 Connection State Machine (§3, §4.8).
//!
//! The top-level lifecycle transitions are grounded on the `select_biased!`
//! actor loop in
//! `ethers_providers::rpc::transports::ws::manager::RequestManager::spawn`,
//! which is the single place that owns backend swap-on-reconnect and
//! instruction handling — generalized here into an explicit state enum plus
//! transition function, instead of being implicit in the control flow, so
//! invariant I6 ("after `Closed` no state transition is possible") and P3
//! ("the Connection SM never transitions out of `Closed`") are checkable
//! in one place.

use std::fmt;

/// The connection's lifecycle state (§3).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { client_id: String, ttl: Option<u64> },
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected { client_id, .. } => write!(f, "connected(client_id={client_id})"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// A requested transition, validated against the current state before
/// being applied (I6, P3).
#[derive(Debug)]
pub enum Transition {
    StartConnecting,
    ConnectSucceeded { client_id: String, ttl: Option<u64> },
    Disconnect,
    Close,
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("client is closed")]
    Closed,
    #[error("cannot apply {transition:?} from state {from}")]
    Invalid { transition: String, from: ConnectionState },
}

/// Applies `transition` to `state` in place, enforcing I6/P3: `Closed` is
/// absorbing and no transition escapes it.
pub fn apply(state: &mut ConnectionState, transition: Transition) -> Result<(), TransitionError> {
    if state.is_closed() {
        return Err(TransitionError::Closed);
    }

    let next = match (&*state, &transition) {
        (ConnectionState::Disconnected, Transition::StartConnecting) => ConnectionState::Connecting,
        (ConnectionState::Connecting, Transition::ConnectSucceeded { client_id, ttl }) => {
            ConnectionState::Connected { client_id: client_id.clone(), ttl: *ttl }
        }
        (ConnectionState::Connecting, Transition::Disconnect) => ConnectionState::Disconnected,
        (ConnectionState::Connected { .. }, Transition::Disconnect) => ConnectionState::Disconnected,
        (_, Transition::Close) => ConnectionState::Closed,
        (from, transition) => {
            return Err(TransitionError::Invalid { transition: format!("{transition:?}"), from: from.clone() })
        }
    };

    *state = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_terminal() {
        let mut state = ConnectionState::Disconnected;
        apply(&mut state, Transition::Close).unwrap();
        assert!(state.is_closed());
        assert!(matches!(apply(&mut state, Transition::StartConnecting), Err(TransitionError::Closed)));
    }

    #[test]
    fn happy_path_lifecycle() {
        let mut state = ConnectionState::Disconnected;
        apply(&mut state, Transition::StartConnecting).unwrap();
        assert_eq!(state, ConnectionState::Connecting);
        apply(&mut state, Transition::ConnectSucceeded { client_id: "c1".into(), ttl: Some(60) }).unwrap();
        assert!(state.is_connected());
        apply(&mut state, Transition::Disconnect).unwrap();
        assert_eq!(state, ConnectionState::Disconnected);
        apply(&mut state, Transition::Close).unwrap();
        assert!(state.is_closed());
    }

    #[test]
    fn rejects_invalid_transition() {
        let mut state = ConnectionState::Disconnected;
        let err = apply(&mut state, Transition::ConnectSucceeded { client_id: "c1".into(), ttl: None }).unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { .. }));
    }
}
