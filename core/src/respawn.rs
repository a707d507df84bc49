//! What to do with a session whose current process exited on its own.

use ptyhub_protocol::SpawnKind;

use crate::owner::OwnerRef;

#[derive(Debug, Clone)]
pub enum RespawnDecision {
    /// Start a login shell under the same id and tell `owner` it is ready.
    Respawn { owner: OwnerRef, cwd: String },
    /// Tear the session down.
    Cleanup(CleanupReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// Only direct CLI sessions are continued in a shell.
    NotDirect,
    NoOwner,
}

/// Direct CLI sessions with a live owner continue in a shell; everything
/// else is cleaned up.
pub fn plan_respawn(kind: SpawnKind, owner: Option<&OwnerRef>, cwd: &str) -> RespawnDecision {
    if kind != SpawnKind::DirectCli {
        return RespawnDecision::Cleanup(CleanupReason::NotDirect);
    }
    match owner.filter(|owner| owner.is_alive()) {
        Some(owner) => RespawnDecision::Respawn {
            owner: owner.clone(),
            cwd: cwd.to_string(),
        },
        None => RespawnDecision::Cleanup(CleanupReason::NoOwner),
    }
}
