//! Session id → process handle bookkeeping.
//!
//! Every spawned process gets a fresh [`HandleId`]. Anything that happens
//! asynchronously to a process (output, exit, timers) is tagged with the
//! handle it was armed for and checked with [`SessionRegistry::is_current`]
//! before it may touch the registry, so a late signal from a superseded
//! process can never disturb its replacement.

use std::collections::HashMap;
use std::fmt;

use ptyhub_protocol::SessionState;
use ptyhub_protocol::SessionSummary;
use ptyhub_protocol::SpawnKind;
use ptyhub_protocol::TerminalSize;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::PtyHubError;
use crate::error::Result;
use crate::factory::ProcessEvent;
use crate::factory::PtyProcess;
use crate::factory::SpawnedProcess;
use crate::owner::OwnerId;
use crate::owner::OwnerRef;

/// Opaque session id, conventionally `<provider>:<context>:<task>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIdParts<'a> {
    pub provider: &'a str,
    pub context: &'a str,
    pub task: &'a str,
}

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the id into its three parts. The task part may itself contain
    /// colons.
    pub fn parts(&self) -> Option<SessionIdParts<'_>> {
        let mut split = self.0.splitn(3, ':');
        let provider = split.next().filter(|part| !part.is_empty())?;
        let context = split.next()?;
        let task = split.next().filter(|part| !part.is_empty())?;
        Some(SessionIdParts {
            provider,
            context,
            task,
        })
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    pub handle: HandleId,
    pub reused: bool,
}

struct SessionEntry {
    kind: SpawnKind,
    state: SessionState,
    handle: HandleId,
    process: Option<Box<dyn PtyProcess>>,
    events: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
    owner: Option<OwnerRef>,
    listeners_attached: bool,
    cwd: String,
    size: TerminalSize,
}

/// What [`SessionRegistry::remove`] hands back for the caller to tear down.
pub struct RemovedSession {
    pub handle: HandleId,
    pub kind: SpawnKind,
    pub process: Option<Box<dyn PtyProcess>>,
    pub owner: Option<OwnerRef>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, SessionEntry>,
    last_handle: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_handle(&mut self) -> HandleId {
        self.last_handle += 1;
        HandleId(self.last_handle)
    }

    /// Reserves `id` for a new process, or reports the live one as reused.
    pub fn begin_start(
        &mut self,
        id: &SessionId,
        kind: SpawnKind,
        cwd: &str,
        size: TerminalSize,
    ) -> StartOutcome {
        if let Some(entry) = self.sessions.get(id) {
            return StartOutcome {
                handle: entry.handle,
                reused: true,
            };
        }
        let handle = self.next_handle();
        self.sessions.insert(
            id.clone(),
            SessionEntry {
                kind,
                state: SessionState::Starting,
                handle,
                process: None,
                events: None,
                owner: None,
                listeners_attached: false,
                cwd: cwd.to_string(),
                size,
            },
        );
        StartOutcome {
            handle,
            reused: false,
        }
    }

    /// Stores the spawned process for a reservation, recording the kind it
    /// was actually started as. Hands the process back when the reservation
    /// is gone so the caller can kill it.
    pub fn activate(
        &mut self,
        id: &SessionId,
        handle: HandleId,
        kind: SpawnKind,
        spawned: SpawnedProcess,
    ) -> std::result::Result<(), SpawnedProcess> {
        match self.sessions.get_mut(id) {
            Some(entry) if entry.handle == handle && entry.state == SessionState::Starting => {
                entry.kind = kind;
                entry.process = Some(spawned.process);
                entry.events = Some(spawned.events);
                entry.state = SessionState::Active;
                Ok(())
            }
            _ => Err(spawned),
        }
    }

    pub fn abort_start(&mut self, id: &SessionId, handle: HandleId) -> bool {
        let reserved = self
            .sessions
            .get(id)
            .is_some_and(|entry| entry.handle == handle && entry.state == SessionState::Starting);
        if reserved {
            self.sessions.remove(id);
        }
        reserved
    }

    /// Replaces any previous owner binding.
    pub fn bind_owner(&mut self, id: &SessionId, owner: OwnerRef) -> Result<()> {
        let entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| PtyHubError::unknown_session(id.as_str()))?;
        entry.owner = Some(owner);
        Ok(())
    }

    pub fn owner(&self, id: &SessionId) -> Option<&OwnerRef> {
        self.sessions.get(id).and_then(|entry| entry.owner.as_ref())
    }

    /// Hands out the current handle's event stream the first time it is
    /// asked for, and `None` on every later call until the next `replace`.
    pub fn attach_listeners_once(
        &mut self,
        id: &SessionId,
    ) -> Option<(HandleId, mpsc::UnboundedReceiver<ProcessEvent>)> {
        let entry = self.sessions.get_mut(id)?;
        if entry.listeners_attached {
            return None;
        }
        let events = entry.events.take()?;
        entry.listeners_attached = true;
        Some((entry.handle, events))
    }

    #[cfg(test)]
    fn listeners_attached(&self, id: &SessionId) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|entry| entry.listeners_attached)
    }

    /// Swaps in a replacement process under the same id in one step and
    /// returns the new handle together with the superseded process.
    pub fn replace(
        &mut self,
        id: &SessionId,
        kind: SpawnKind,
        spawned: SpawnedProcess,
    ) -> Option<(HandleId, Option<Box<dyn PtyProcess>>)> {
        if !self.sessions.contains_key(id) {
            return None;
        }
        let handle = self.next_handle();
        let entry = self.sessions.get_mut(id)?;
        let previous = entry.process.replace(spawned.process);
        entry.events = Some(spawned.events);
        entry.handle = handle;
        entry.kind = kind;
        entry.state = SessionState::Active;
        entry.listeners_attached = false;
        Some((handle, previous))
    }

    pub fn is_current(&self, id: &SessionId, handle: HandleId) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|entry| entry.handle == handle)
    }

    /// Marks the current process as exiting. False for a stale handle.
    pub fn begin_exit(&mut self, id: &SessionId, handle: HandleId) -> bool {
        match self.sessions.get_mut(id) {
            Some(entry) if entry.handle == handle => {
                entry.state = SessionState::Exiting;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<RemovedSession> {
        self.sessions.remove(id).map(|entry| RemovedSession {
            handle: entry.handle,
            kind: entry.kind,
            process: entry.process,
            owner: entry.owner,
        })
    }

    pub fn process_mut(&mut self, id: &SessionId) -> Result<&mut Box<dyn PtyProcess>> {
        self.sessions
            .get_mut(id)
            .and_then(|entry| entry.process.as_mut())
            .ok_or_else(|| PtyHubError::unknown_session(id.as_str()))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn kind(&self, id: &SessionId) -> Option<SpawnKind> {
        self.sessions.get(id).map(|entry| entry.kind)
    }

    #[cfg(test)]
    fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.get(id).map(|entry| entry.state)
    }

    pub fn cwd(&self, id: &SessionId) -> Option<&str> {
        self.sessions.get(id).map(|entry| entry.cwd.as_str())
    }

    pub fn size(&self, id: &SessionId) -> Option<TerminalSize> {
        self.sessions.get(id).map(|entry| entry.size)
    }

    pub fn set_size(&mut self, id: &SessionId, size: TerminalSize) {
        if let Some(entry) = self.sessions.get_mut(id) {
            entry.size = size;
        }
    }

    pub fn owned_by(&self, owner: OwnerId) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.owner.as_ref().is_some_and(|o| o.id() == owner))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|(id, entry)| SessionSummary {
                session_id: id.to_string(),
                kind: entry.kind,
                state: entry.state,
                handle: entry.handle.0,
                has_owner: entry.owner.as_ref().is_some_and(OwnerRef::is_alive),
                cwd: entry.cwd.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }
}
