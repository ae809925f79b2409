//! Election and failover state machine
//!
//! ```text
//! NoLocalDb -> (bootstrap) -> Primary | Standby
//! Primary   -> (restart, marker elsewhere) -> DeposedRejoining -> Standby
//! Standby   -> (restart, marker changed)   -> FollowingNewPrimary -> Standby
//! any       -> (promote callback) -> Primary
//! ```

pub mod bootstrap;
pub mod reconcile;

use crate::error::{ClusterError, Result};
use crate::log::log_state_transition;
use std::fmt;

pub use self::bootstrap::{BootstrapOutcome, NodeBootstrap};
pub use self::reconcile::Reconciler;

/// Role of the local node as far as this process knows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    NoLocalDb,
    Primary,
    Standby,
    DeposedRejoining,
    FollowingNewPrimary,
}

/// Things that move a node between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// Fresh cluster created because this node is primary
    CreatedAsPrimary,
    /// Fresh data directory cloned from the primary
    ClonedAsStandby,
    /// Restarted with an existing database and the marker on this node
    RestartedAsPrimary,
    /// Restarted after losing the primary role
    Deposed,
    /// Restarted as a standby that must follow the current primary
    RestartedAsStandby,
    /// `node rejoin` completed
    Rejoined,
    /// `standby follow` completed
    Followed,
    /// repmgrd invoked the promote callback
    Promoted,
    /// repmgrd invoked the follow callback
    FollowCallback,
}

impl NodeState {
    /// State a restarting node starts from, given its standby marker
    pub fn from_standby_marker(has_marker: bool) -> Self {
        if has_marker {
            Self::Standby
        } else {
            Self::Primary
        }
    }

    /// Apply `event`, rejecting transitions the machine does not allow
    pub fn on(self, event: NodeEvent) -> Result<Self> {
        use NodeEvent::*;
        use NodeState::*;

        let next = match (self, event) {
            (NoLocalDb, CreatedAsPrimary) => Primary,
            (NoLocalDb, ClonedAsStandby) => Standby,
            (Primary, RestartedAsPrimary) => Primary,
            (Primary, Deposed) => DeposedRejoining,
            (DeposedRejoining, Rejoined) => Standby,
            (Standby, RestartedAsStandby) => FollowingNewPrimary,
            (FollowingNewPrimary, Followed) => Standby,
            (Standby, FollowCallback) => Standby,
            (_, Promoted) => Primary,
            (from, event) => {
                return Err(ClusterError::IllegalTransition {
                    from: from.to_string(),
                    event: format!("{:?}", event),
                })
            }
        };
        Ok(next)
    }

    /// Apply `event` and log the transition
    pub fn transition(self, node: &str, event: NodeEvent) -> Result<Self> {
        let next = self.on(event)?;
        log_state_transition(node, &self.to_string(), &next.to_string(), &format!("{:?}", event));
        Ok(next)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoLocalDb => "NO_LOCAL_DB",
            Self::Primary => "PRIMARY",
            Self::Standby => "STANDBY",
            Self::DeposedRejoining => "DEPOSED_REJOINING",
            Self::FollowingNewPrimary => "FOLLOWING_NEW_PRIMARY",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_transitions() {
        assert_eq!(NodeState::NoLocalDb.on(NodeEvent::CreatedAsPrimary).unwrap(), NodeState::Primary);
        assert_eq!(NodeState::NoLocalDb.on(NodeEvent::ClonedAsStandby).unwrap(), NodeState::Standby);
    }

    #[test]
    fn test_deposed_primary_rejoins() {
        let state = NodeState::Primary.on(NodeEvent::Deposed).unwrap();
        assert_eq!(state, NodeState::DeposedRejoining);
        assert_eq!(state.on(NodeEvent::Rejoined).unwrap(), NodeState::Standby);
    }

    #[test]
    fn test_standby_follows_new_primary() {
        let state = NodeState::Standby.on(NodeEvent::RestartedAsStandby).unwrap();
        assert_eq!(state, NodeState::FollowingNewPrimary);
        assert_eq!(state.on(NodeEvent::Followed).unwrap(), NodeState::Standby);
    }

    #[test]
    fn test_promote_from_any_state() {
        for state in [
            NodeState::NoLocalDb,
            NodeState::Primary,
            NodeState::Standby,
            NodeState::DeposedRejoining,
            NodeState::FollowingNewPrimary,
        ] {
            assert_eq!(state.on(NodeEvent::Promoted).unwrap(), NodeState::Primary);
        }
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        // A standby never rejoins and a primary never follows
        assert!(NodeState::Standby.on(NodeEvent::Rejoined).is_err());
        assert!(NodeState::Standby.on(NodeEvent::RestartedAsPrimary).is_err());
        assert!(NodeState::Primary.on(NodeEvent::Followed).is_err());
        let err = NodeState::NoLocalDb.on(NodeEvent::Deposed).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("NO_LOCAL_DB"));
    }

    #[test]
    fn test_state_from_marker() {
        assert_eq!(NodeState::from_standby_marker(true), NodeState::Standby);
        assert_eq!(NodeState::from_standby_marker(false), NodeState::Primary);
    }
}
