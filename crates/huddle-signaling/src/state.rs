//! Negotiation states and the transition table that guards them.

use std::fmt;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Requesting,
    Creating,
    Offering,
    Answering,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Requesting => "requesting",
            ConnectionState::Creating => "creating",
            ConnectionState::Offering => "offering",
            ConnectionState::Answering => "answering",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// States a record passes through before media can flow.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            ConnectionState::Idle
                | ConnectionState::Requesting
                | ConnectionState::Creating
                | ConnectionState::Offering
                | ConnectionState::Answering
        )
    }

    pub fn allows(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Requesting | Creating | Offering | Answering)
                | (Requesting, Offering | Failed | Closed)
                | (Creating, Offering | Answering | Failed | Closed)
                | (Offering, Connected | Failed | Closed)
                | (Answering, Connected | Failed | Closed)
                | (Connected, Closed | Failed)
                | (Failed, Idle | Closed)
                | (Closed, Idle)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Already in the requested state; duplicate notifications land here.
    Unchanged(ConnectionState),
    Rejected {
        from: ConnectionState,
        to: ConnectionState,
    },
}

impl Transition {
    pub fn succeeded(self) -> bool {
        !matches!(self, Transition::Rejected { .. })
    }
}

/// Per-record state with its activity clock.
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ConnectionState,
    transitions: u32,
    last_activity: Instant,
}

impl StateMachine {
    pub fn new(now: Instant) -> Self {
        Self {
            state: ConnectionState::Idle,
            transitions: 0,
            last_activity: now,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transitions(&self) -> u32 {
        self.transitions
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Applies `to` if the table allows it. Returning to `idle` is reserved for
    /// full record removal and is never applied in place.
    pub fn apply(&mut self, to: ConnectionState, now: Instant) -> Transition {
        let from = self.state;
        if from == to {
            self.last_activity = now;
            return Transition::Unchanged(from);
        }
        if to == ConnectionState::Idle || !from.allows(to) {
            debug!(from = %from, to = %to, "rejected state transition");
            return Transition::Rejected { from, to };
        }
        self.state = to;
        self.transitions = self.transitions.saturating_add(1);
        self.last_activity = now;
        Transition::Applied { from, to }
    }
}
