//! The two-node high-availability finite state machine.
//!
//! A deterministic pure function over {PRIMARY, BACKUP, ACTIVE, PASSIVE}:
//! events are the peer's state as observed in heartbeats, plus a local
//! client-request tick that triggers failover once the peer has expired.
//! Misconfiguration (both sides active, both passive, duplicate roles) is a
//! fatal error the replicator answers by reverting to its configured role.

use lattice_primitives::wire::{HaFsm, HaState};

pub type Result<T, E = FsmError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FsmError {
    #[error("fatal: both controllers are ACTIVE (dual-active)")]
    DualActive,
    #[error("fatal: both controllers are PASSIVE (dual-passive)")]
    DualPassive,
    #[error("fatal: both controllers claim the {0} role")]
    DuplicateRole(&'static str),
    #[error("fsm not initialized")]
    NotInitialized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsmEvent {
    PeerPrimary,
    PeerBackup,
    PeerActive,
    PeerPassive,
    /// Local demand for service; drives failover when the peer is expired.
    ClientRequest,
}

impl FsmEvent {
    pub fn from_peer_state(state: HaState) -> Option<Self> {
        match state {
            HaState::Primary => Some(Self::PeerPrimary),
            HaState::Backup => Some(Self::PeerBackup),
            HaState::Active => Some(Self::PeerActive),
            HaState::Passive => Some(Self::PeerPassive),
            HaState::Start => None,
        }
    }
}

/// Apply one event. `now_ms` is compared against the FSM's peer expiry for
/// the client-request transitions.
pub fn process_event(fsm: HaFsm, event: FsmEvent, now_ms: i64) -> Result<HaFsm> {
    let peer_dead = fsm.peer_expiry_ms > 0 && now_ms >= fsm.peer_expiry_ms;
    let next = match (fsm.state, event) {
        (HaState::Start, _) => return Err(FsmError::NotInitialized),

        // Startup roles converge on who serves.
        (HaState::Primary, FsmEvent::PeerBackup) => HaState::Active,
        (HaState::Primary, FsmEvent::PeerActive) => return Err(FsmError::DualActive),
        (HaState::Primary, FsmEvent::PeerPrimary) => {
            return Err(FsmError::DuplicateRole("PRIMARY"));
        }
        (HaState::Primary, FsmEvent::PeerPassive) => HaState::Active,
        (HaState::Primary, FsmEvent::ClientRequest) => {
            if peer_dead {
                HaState::Active
            } else {
                HaState::Primary
            }
        }

        (HaState::Backup, FsmEvent::PeerPrimary) => HaState::Passive,
        (HaState::Backup, FsmEvent::PeerActive) => HaState::Passive,
        (HaState::Backup, FsmEvent::PeerBackup) => {
            return Err(FsmError::DuplicateRole("BACKUP"));
        }
        (HaState::Backup, FsmEvent::PeerPassive) => HaState::Backup,
        (HaState::Backup, FsmEvent::ClientRequest) => {
            if peer_dead {
                HaState::Active
            } else {
                HaState::Backup
            }
        }

        // Steady states.
        (HaState::Active, FsmEvent::PeerActive) => return Err(FsmError::DualActive),
        (HaState::Active, _) => HaState::Active,

        (HaState::Passive, FsmEvent::PeerPassive) => return Err(FsmError::DualPassive),
        // A restarting peer reports its configured role; it will see our
        // ACTIVE and settle as PASSIVE.
        (HaState::Passive, FsmEvent::PeerPrimary) => HaState::Active,
        (HaState::Passive, FsmEvent::PeerBackup) => HaState::Active,
        (HaState::Passive, FsmEvent::PeerActive) => HaState::Passive,
        (HaState::Passive, FsmEvent::ClientRequest) => {
            if peer_dead {
                HaState::Active
            } else {
                HaState::Passive
            }
        }
    };
    Ok(HaFsm {
        state: next,
        peer_expiry_ms: fsm.peer_expiry_ms,
    })
}
