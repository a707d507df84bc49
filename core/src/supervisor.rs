//! The session supervisor.
//!
//! One task owns every piece of mutable session state: the registry, the
//! run tracker, the output coalescer, snapshots and processes that are being
//! killed. Requests from the UI, process output and exits, and timer fires
//! all arrive as [`Command`]s on a single channel and are handled one at a
//! time, so a handler never observes another handler's half-finished work.
//! What it can observe is a command that was queued for a process which has
//! since been replaced or removed; every such command carries the
//! [`HandleId`] it was issued for and is dropped when that handle is no
//! longer current.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use ptyhub_protocol::BroadcastEvent;
use ptyhub_protocol::RemoteTarget;
use ptyhub_protocol::Request;
use ptyhub_protocol::Response;
use ptyhub_protocol::SessionEvent;
use ptyhub_protocol::SessionSummary;
use ptyhub_protocol::SpawnKind;
use ptyhub_protocol::StartDirectSessionParams;
use ptyhub_protocol::StartLocalSessionParams;
use ptyhub_protocol::TerminalSize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::coalescer::OutputCoalescer;
use crate::config::SupervisorConfig;
use crate::error::PtyHubError;
use crate::error::Result;
use crate::factory::ExitInfo;
use crate::factory::ProcessEvent;
use crate::factory::ProcessFactory;
use crate::factory::PtyProcess;
use crate::factory::SpawnedProcess;
use crate::launcher;
use crate::launcher::LocalLaunch;
use crate::notifier::CompletionNotifier;
use crate::owner::OwnerChannel;
use crate::owner::OwnerId;
use crate::owner::OwnerRef;
use crate::provider::InvocationOptions;
use crate::provider::ProviderInvocation;
use crate::provider::ResolvedProvider;
use crate::provider::build_invocation_args;
use crate::provider::find_provider;
use crate::provider::resolve_provider;
use crate::provider::resolve_provider_overrides;
use crate::registry::HandleId;
use crate::registry::SessionId;
use crate::registry::SessionRegistry;
use crate::registry::StartOutcome;
use crate::respawn::RespawnDecision;
use crate::respawn::plan_respawn;
use crate::run_tracker::FinishCause;
use crate::run_tracker::RunKey;
use crate::run_tracker::RunTracker;
use crate::spawn_config::SpawnContext;
use crate::ssh::SshRoute;
use crate::ssh::remote_bootstrap_script;
use crate::ssh::resolve_ssh_route;

const BROADCAST_CAPACITY: usize = 256;

enum Command {
    StartLocal {
        params: StartLocalSessionParams,
        owner: OwnerRef,
        reply: oneshot::Sender<Result<StartOutcome>>,
    },
    StartDirect {
        params: StartDirectSessionParams,
        owner: OwnerRef,
        reply: oneshot::Sender<Result<StartOutcome>>,
    },
    WriteInput {
        session_id: SessionId,
        data: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Resize {
        session_id: SessionId,
        size: TerminalSize,
        reply: oneshot::Sender<Result<()>>,
    },
    Kill {
        session_id: SessionId,
        reply: oneshot::Sender<Result<()>>,
    },
    GetSnapshot {
        session_id: SessionId,
        reply: oneshot::Sender<Option<String>>,
    },
    SaveSnapshot {
        session_id: SessionId,
        snapshot: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearSnapshot {
        session_id: SessionId,
        reply: oneshot::Sender<()>,
    },
    ReleaseOwner {
        owner: OwnerId,
        reply: oneshot::Sender<usize>,
    },
    ListSessions {
        reply: oneshot::Sender<Vec<SessionSummary>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Process {
        session_id: SessionId,
        handle: HandleId,
        event: ProcessEvent,
    },
    FlushDue {
        session_id: SessionId,
        generation: u64,
    },
    EscalateKill {
        handle: HandleId,
    },
    InjectPrompt {
        session_id: SessionId,
        handle: HandleId,
        text: String,
    },
}

pub struct Supervisor;

impl Supervisor {
    /// Starts the supervisor task on the current tokio runtime.
    pub fn spawn(
        config: SupervisorConfig,
        factory: Arc<dyn ProcessFactory>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> SupervisorHandle {
        let ctx = SpawnContext::detect(config.shell.as_deref(), config.shell_setup.as_deref());
        Self::spawn_with_context(config, ctx, factory, notifier)
    }

    pub fn spawn_with_context(
        config: SupervisorConfig,
        ctx: SpawnContext,
        factory: Arc<dyn ProcessFactory>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> SupervisorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let actor = SupervisorActor::new(
            config,
            ctx,
            factory,
            notifier,
            tx.downgrade(),
            broadcast_tx.clone(),
        );
        tokio::spawn(actor.run(rx));
        SupervisorHandle {
            tx,
            broadcast: broadcast_tx,
        }
    }
}

/// Cloneable front door to the supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Command>,
    broadcast: broadcast::Sender<BroadcastEvent>,
}

impl SupervisorHandle {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .map_err(|_| PtyHubError::SupervisorGone)?;
        reply_rx.await.map_err(|_| PtyHubError::SupervisorGone)
    }

    /// Starts a login shell, or reports the running session as reused.
    /// Either way `owner` becomes the session's owner.
    pub async fn start_local(
        &self,
        params: StartLocalSessionParams,
        owner: &Arc<OwnerChannel>,
    ) -> Result<StartOutcome> {
        let owner = owner.downgrade();
        self.call(|reply| Command::StartLocal {
            params,
            owner,
            reply,
        })
        .await?
    }

    /// Starts a provider CLI, locally or over SSH when `params.remote` is set.
    pub async fn start_direct(
        &self,
        params: StartDirectSessionParams,
        owner: &Arc<OwnerChannel>,
    ) -> Result<StartOutcome> {
        let owner = owner.downgrade();
        self.call(|reply| Command::StartDirect {
            params,
            owner,
            reply,
        })
        .await?
    }

    pub async fn write_input(&self, session_id: &str, data: &str) -> Result<()> {
        let session_id = SessionId::from(session_id);
        let data = data.to_string();
        self.call(|reply| Command::WriteInput {
            session_id,
            data,
            reply,
        })
        .await?
    }

    pub async fn resize(&self, session_id: &str, size: TerminalSize) -> Result<()> {
        let session_id = SessionId::from(session_id);
        self.call(|reply| Command::Resize {
            session_id,
            size,
            reply,
        })
        .await?
    }

    pub async fn kill(&self, session_id: &str) -> Result<()> {
        let session_id = SessionId::from(session_id);
        self.call(|reply| Command::Kill { session_id, reply })
            .await?
    }

    pub async fn get_snapshot(&self, session_id: &str) -> Result<Option<String>> {
        let session_id = SessionId::from(session_id);
        self.call(|reply| Command::GetSnapshot { session_id, reply })
            .await
    }

    pub async fn save_snapshot(&self, session_id: &str, snapshot: String) -> Result<()> {
        let session_id = SessionId::from(session_id);
        self.call(|reply| Command::SaveSnapshot {
            session_id,
            snapshot,
            reply,
        })
        .await?
    }

    pub async fn clear_snapshot(&self, session_id: &str) -> Result<()> {
        let session_id = SessionId::from(session_id);
        self.call(|reply| Command::ClearSnapshot { session_id, reply })
            .await
    }

    /// Kills every session bound to `owner`. Returns how many there were.
    pub async fn release_owner(&self, owner: OwnerId) -> Result<usize> {
        self.call(|reply| Command::ReleaseOwner { owner, reply })
            .await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        self.call(|reply| Command::ListSessions { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.broadcast.subscribe()
    }

    /// Kills every session, waits for the processes to go away and stops
    /// the supervisor.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    /// Serves one request from the UI on behalf of `owner`.
    pub async fn handle_request(&self, request: Request, owner: &Arc<OwnerChannel>) -> Response {
        match request {
            Request::StartLocalSession(params) => Response::from(
                self.start_local(params, owner)
                    .await
                    .map(|outcome| Response::ok().with_reused(outcome.reused)),
            ),
            Request::StartDirectSession(params) => Response::from(
                self.start_direct(params, owner)
                    .await
                    .map(|outcome| Response::ok().with_reused(outcome.reused)),
            ),
            Request::WriteInput { session_id, data } => Response::from(
                self.write_input(&session_id, &data)
                    .await
                    .map(|()| Response::ok()),
            ),
            Request::Resize {
                session_id,
                cols,
                rows,
            } => Response::from(
                self.resize(&session_id, TerminalSize { cols, rows })
                    .await
                    .map(|()| Response::ok()),
            ),
            Request::Kill { session_id } => {
                Response::from(self.kill(&session_id).await.map(|()| Response::ok()))
            }
            Request::GetSnapshot { session_id } => Response::from(
                self.get_snapshot(&session_id)
                    .await
                    .map(|snapshot| Response::ok().with_snapshot(snapshot)),
            ),
            Request::SaveSnapshot {
                session_id,
                snapshot,
            } => Response::from(
                self.save_snapshot(&session_id, snapshot)
                    .await
                    .map(|()| Response::ok()),
            ),
            Request::ClearSnapshot { session_id } => Response::from(
                self.clear_snapshot(&session_id)
                    .await
                    .map(|()| Response::ok()),
            ),
            Request::ListSessions => Response::from(
                self.list_sessions()
                    .await
                    .map(|sessions| Response::ok().with_sessions(sessions)),
            ),
        }
    }
}

struct DyingProcess {
    session_id: SessionId,
    process: Box<dyn PtyProcess>,
}

struct SupervisorActor {
    config: SupervisorConfig,
    ctx: SpawnContext,
    factory: Arc<dyn ProcessFactory>,
    notifier: Arc<dyn CompletionNotifier>,
    registry: SessionRegistry,
    coalescer: OutputCoalescer,
    runs: RunTracker,
    snapshots: HashMap<SessionId, String>,
    /// Terminated processes waiting for their exit or for escalation.
    dying: HashMap<HandleId, DyingProcess>,
    shutting_down: bool,
    shutdown_replies: Vec<oneshot::Sender<()>>,
    self_tx: mpsc::WeakUnboundedSender<Command>,
    broadcast: broadcast::Sender<BroadcastEvent>,
}

impl SupervisorActor {
    fn new(
        config: SupervisorConfig,
        ctx: SpawnContext,
        factory: Arc<dyn ProcessFactory>,
        notifier: Arc<dyn CompletionNotifier>,
        self_tx: mpsc::WeakUnboundedSender<Command>,
        broadcast: broadcast::Sender<BroadcastEvent>,
    ) -> Self {
        Self {
            config: config.normalized(),
            ctx,
            factory,
            notifier,
            registry: SessionRegistry::new(),
            coalescer: OutputCoalescer::new(),
            runs: RunTracker::new(),
            snapshots: HashMap::new(),
            dying: HashMap::new(),
            shutting_down: false,
            shutdown_replies: Vec::new(),
            self_tx,
            broadcast,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            let handled = std::panic::catch_unwind(AssertUnwindSafe(|| self.handle(command)));
            if let Err(panic) = handled {
                error!(
                    panic = panic_message(panic.as_ref()),
                    "supervisor handler panicked"
                );
            }
            if self.finish_shutdown_if_idle() {
                break;
            }
        }
        self.abandon_remaining();
        debug!("supervisor stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::StartLocal {
                params,
                owner,
                reply,
            } => {
                let _ = reply.send(self.start_local(params, owner));
            }
            Command::StartDirect {
                params,
                owner,
                reply,
            } => {
                let _ = reply.send(self.start_direct(params, owner));
            }
            Command::WriteInput {
                session_id,
                data,
                reply,
            } => {
                let _ = reply.send(self.write_input(&session_id, &data));
            }
            Command::Resize {
                session_id,
                size,
                reply,
            } => {
                let _ = reply.send(self.resize(&session_id, size));
            }
            Command::Kill { session_id, reply } => {
                let _ = reply.send(self.kill(&session_id));
            }
            Command::GetSnapshot { session_id, reply } => {
                let _ = reply.send(self.snapshots.get(&session_id).cloned());
            }
            Command::SaveSnapshot {
                session_id,
                snapshot,
                reply,
            } => {
                let _ = reply.send(self.save_snapshot(session_id, snapshot));
            }
            Command::ClearSnapshot { session_id, reply } => {
                self.snapshots.remove(&session_id);
                let _ = reply.send(());
            }
            Command::ReleaseOwner { owner, reply } => {
                let _ = reply.send(self.release_owner(owner));
            }
            Command::ListSessions { reply } => {
                let _ = reply.send(self.registry.list());
            }
            Command::Shutdown { reply } => self.begin_shutdown(reply),
            Command::Process {
                session_id,
                handle,
                event,
            } => self.on_process_event(session_id, handle, event),
            Command::FlushDue {
                session_id,
                generation,
            } => {
                if let Some(data) = self.coalescer.take_due(&session_id, generation) {
                    self.deliver_output(&session_id, data);
                }
            }
            Command::EscalateKill { handle } => self.escalate_kill(handle),
            Command::InjectPrompt {
                session_id,
                handle,
                text,
            } => self.inject_prompt(&session_id, handle, &text),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down {
            Err(PtyHubError::SupervisorGone)
        } else {
            Ok(())
        }
    }

    fn start_local(
        &mut self,
        params: StartLocalSessionParams,
        owner: OwnerRef,
    ) -> Result<StartOutcome> {
        self.ensure_running()?;
        let id = SessionId::new(params.session_id);
        let size = params.size.unwrap_or_else(|| self.config.default_size());
        let outcome = self
            .registry
            .begin_start(&id, SpawnKind::LocalShell, &params.cwd, size);
        if outcome.reused {
            return self.reuse(&id, outcome, owner);
        }

        let hint = params
            .provider
            .as_deref()
            .and_then(|provider_id| self.hint_invocation(provider_id));
        let timed = self.begin_run(&id, hint.is_some());
        let spawned = launcher::start_local(
            self.factory.as_ref(),
            &self.ctx,
            &id,
            LocalLaunch {
                cwd: &params.cwd,
                shell: params.shell.as_deref(),
                env: &params.env,
                size,
                provider_hint: hint.as_ref(),
            },
        );
        self.complete_start(&id, outcome, SpawnKind::LocalShell, spawned, owner, timed)
    }

    fn start_direct(
        &mut self,
        params: StartDirectSessionParams,
        owner: OwnerRef,
    ) -> Result<StartOutcome> {
        self.ensure_running()?;
        let provider = resolve_provider(
            &params.provider,
            self.config.provider_overrides(&params.provider),
        )?;
        let invocation = build_invocation_args(
            &provider,
            &InvocationOptions {
                resume: params.resume,
                auto_approve: params.auto_approve,
                initial_prompt: params.initial_prompt.clone(),
            },
        );
        if let Some(remote) = params.remote.clone() {
            return self.start_remote(&params, remote, &provider, &invocation, owner);
        }

        let id = SessionId::new(params.session_id.as_str());
        let size = params.size.unwrap_or_else(|| self.config.default_size());
        let outcome = self
            .registry
            .begin_start(&id, SpawnKind::DirectCli, &params.cwd, size);
        if outcome.reused {
            return self.reuse(&id, outcome, owner);
        }

        let timed = self.begin_run(&id, true);
        let (kind, spawned) = match launcher::start_direct(
            self.factory.as_ref(),
            &self.ctx,
            &id,
            &params.cwd,
            &invocation,
            &params.env,
            size,
        ) {
            Ok(Some(spawned)) => (SpawnKind::DirectCli, Ok(spawned)),
            Ok(None) => (
                SpawnKind::LocalShell,
                launcher::start_local(
                    self.factory.as_ref(),
                    &self.ctx,
                    &id,
                    LocalLaunch {
                        cwd: &params.cwd,
                        shell: None,
                        env: &params.env,
                        size,
                        provider_hint: Some(&invocation),
                    },
                ),
            ),
            Err(err) => (SpawnKind::DirectCli, Err(err)),
        };
        let outcome = self.complete_start(&id, outcome, kind, spawned, owner, timed)?;
        self.schedule_keystroke_prompt(&id, outcome.handle, &provider, &params);
        Ok(outcome)
    }

    fn start_remote(
        &mut self,
        params: &StartDirectSessionParams,
        remote: RemoteTarget,
        provider: &ResolvedProvider,
        invocation: &ProviderInvocation,
        owner: OwnerRef,
    ) -> Result<StartOutcome> {
        let target = resolve_ssh_route(&SshRoute::from(remote), &self.config.ssh_connections)?;
        let id = SessionId::new(params.session_id.as_str());
        let size = params.size.unwrap_or_else(|| self.config.default_size());
        let outcome = self
            .registry
            .begin_start(&id, SpawnKind::Ssh, &params.cwd, size);
        if outcome.reused {
            return self.reuse(&id, outcome, owner);
        }

        let timed = self.begin_run(&id, true);
        let spawned = launcher::start_ssh(
            self.factory.as_ref(),
            &id,
            &target,
            &params.env,
            size,
        );
        let outcome = self.complete_start(&id, outcome, SpawnKind::Ssh, spawned, owner, timed)?;

        let script = remote_bootstrap_script(&params.cwd, invocation, &provider.install_hint);
        if let Err(err) = self.write_input(&id, &script) {
            warn!(session_id = %id, error = %err, "failed to write remote bootstrap");
        }
        self.schedule_keystroke_prompt(&id, outcome.handle, provider, params);
        Ok(outcome)
    }

    fn hint_invocation(&self, provider_id: &str) -> Option<ProviderInvocation> {
        let Some(definition) = find_provider(provider_id) else {
            debug!(provider = provider_id, "ignoring unknown provider hint");
            return None;
        };
        let resolved =
            resolve_provider_overrides(definition, self.config.provider_overrides(provider_id));
        Some(build_invocation_args(
            &resolved,
            &InvocationOptions::default(),
        ))
    }

    /// A fresh start frees the id for finalizing again and, for agent
    /// sessions, starts the run timer. Returns the key when a timer was
    /// created by this start.
    fn begin_run(&mut self, id: &SessionId, timed: bool) -> Option<RunKey> {
        self.runs.reset_session(id);
        if !timed {
            return None;
        }
        let key = RunKey::for_session(id)?;
        self.runs.mark_start(key.clone()).then_some(key)
    }

    fn reuse(
        &mut self,
        id: &SessionId,
        outcome: StartOutcome,
        owner: OwnerRef,
    ) -> Result<StartOutcome> {
        debug!(session_id = %id, handle = %outcome.handle, owner = %owner.id(), "session reused");
        self.registry.bind_owner(id, owner)?;
        self.attach_listeners(id);
        Ok(outcome)
    }

    fn complete_start(
        &mut self,
        id: &SessionId,
        outcome: StartOutcome,
        kind: SpawnKind,
        spawned: Result<SpawnedProcess>,
        owner: OwnerRef,
        timed: Option<RunKey>,
    ) -> Result<StartOutcome> {
        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(err) => {
                self.registry.abort_start(id, outcome.handle);
                if let Some(key) = timed {
                    self.runs.abandon(&key);
                }
                warn!(session_id = %id, error = %err, "session failed to start");
                return Err(err);
            }
        };
        if let Err(mut orphan) = self.registry.activate(id, outcome.handle, kind, spawned) {
            if let Err(err) = orphan.process.force_kill() {
                warn!(session_id = %id, error = %err, "failed to kill orphaned process");
            }
            return Err(PtyHubError::unknown_session(id.as_str()));
        }
        self.registry.bind_owner(id, owner)?;
        self.attach_listeners(id);
        debug!(session_id = %id, handle = %outcome.handle, kind = %kind, "session started");
        self.broadcast(BroadcastEvent::Started {
            session_id: id.to_string(),
            kind,
            respawned: false,
        });
        Ok(outcome)
    }

    fn attach_listeners(&mut self, id: &SessionId) {
        let Some((handle, mut events)) = self.registry.attach_listeners_once(id) else {
            return;
        };
        let tx = self.self_tx.clone();
        let session_id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(tx) = tx.upgrade() else {
                    break;
                };
                let command = Command::Process {
                    session_id: session_id.clone(),
                    handle,
                    event,
                };
                if tx.send(command).is_err() {
                    break;
                }
            }
        });
    }

    fn schedule(&self, delay: Duration, command: Command) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(command);
            }
        });
    }

    fn schedule_keystroke_prompt(
        &self,
        id: &SessionId,
        handle: HandleId,
        provider: &ResolvedProvider,
        params: &StartDirectSessionParams,
    ) {
        if !provider.uses_keystroke_prompt() {
            return;
        }
        let Some(prompt) = params
            .initial_prompt
            .as_deref()
            .filter(|prompt| !prompt.trim().is_empty())
        else {
            return;
        };
        self.schedule(
            self.config.keystroke_prompt_delay(),
            Command::InjectPrompt {
                session_id: id.clone(),
                handle,
                text: prompt.to_string(),
            },
        );
    }

    fn inject_prompt(&mut self, id: &SessionId, handle: HandleId, text: &str) {
        if !self.registry.is_current(id, handle) {
            debug!(session_id = %id, handle = %handle, "prompt injection skipped for stale handle");
            return;
        }
        if let Err(err) = self.write_input(id, &format!("{text}\r")) {
            warn!(session_id = %id, error = %err, "prompt injection failed");
        }
    }

    fn write_input(&mut self, id: &SessionId, data: &str) -> Result<()> {
        let process = self.registry.process_mut(id)?;
        process.write(data.as_bytes()).map_err(|err| {
            warn!(session_id = %id, error = %err, "write to session failed");
            PtyHubError::WriteInput {
                session_id: id.to_string(),
            }
        })
    }

    fn resize(&mut self, id: &SessionId, size: TerminalSize) -> Result<()> {
        let process = self.registry.process_mut(id)?;
        process
            .resize(size)
            .map_err(|source| PtyHubError::Resize {
                session_id: id.to_string(),
                source,
            })?;
        self.registry.set_size(id, size);
        Ok(())
    }

    fn kill(&mut self, id: &SessionId) -> Result<()> {
        if !self.kill_session(id, FinishCause::ManualKill) {
            return Err(PtyHubError::unknown_session(id.as_str()));
        }
        Ok(())
    }

    fn save_snapshot(&mut self, id: SessionId, snapshot: String) -> Result<()> {
        if !self.registry.contains(&id) {
            return Err(PtyHubError::unknown_session(id.as_str()));
        }
        if snapshot.len() > self.config.snapshot_max_bytes {
            return Err(PtyHubError::SnapshotTooLarge {
                session_id: id.to_string(),
                limit: self.config.snapshot_max_bytes,
            });
        }
        self.snapshots.insert(id, snapshot);
        Ok(())
    }

    fn release_owner(&mut self, owner: OwnerId) -> usize {
        let ids = self.registry.owned_by(owner);
        debug!(owner = %owner, sessions = ids.len(), "releasing owner");
        ids.iter()
            .filter(|id| self.kill_session(id, FinishCause::OwnerTeardown))
            .count()
    }

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        if !self.shutting_down {
            self.shutting_down = true;
            let ids = self.registry.session_ids();
            info!(sessions = ids.len(), "supervisor shutting down");
            for id in ids {
                self.kill_session(&id, FinishCause::AppShutdown);
            }
        }
        self.shutdown_replies.push(reply);
    }

    fn finish_shutdown_if_idle(&mut self) -> bool {
        if !self.shutting_down || !self.dying.is_empty() {
            return false;
        }
        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
        true
    }

    /// Kills and forgets `id`, finalizing it with `cause`. False when the id
    /// was not registered.
    fn kill_session(&mut self, id: &SessionId, cause: FinishCause) -> bool {
        if !self.registry.contains(id) {
            return false;
        }
        if cause == FinishCause::OwnerTeardown {
            self.coalescer.cancel(id);
        } else {
            self.flush_output(id);
        }
        let Some(removed) = self.registry.remove(id) else {
            return false;
        };
        self.finalize(id, &ExitInfo::unknown(), cause);
        self.runs.reset_session(id);
        self.snapshots.remove(id);
        if let Some(owner) = &removed.owner {
            owner.send(SessionEvent::Exit {
                session_id: id.to_string(),
                exit_code: None,
                signal: None,
            });
        }
        self.broadcast(BroadcastEvent::Exited {
            session_id: id.to_string(),
            exit_code: None,
            signal: None,
        });
        info!(session_id = %id, handle = %removed.handle, cause = %cause, "session killed");

        if let Some(process) = removed.process {
            self.terminate(id, removed.handle, process);
        }
        true
    }

    fn terminate(&mut self, id: &SessionId, handle: HandleId, mut process: Box<dyn PtyProcess>) {
        if let Err(err) = process.terminate() {
            warn!(session_id = %id, handle = %handle, error = %err, "terminate failed");
        }
        self.dying.insert(
            handle,
            DyingProcess {
                session_id: id.clone(),
                process,
            },
        );
        debug!(session_id = %id, handle = %handle, grace_ms = self.config.kill_grace_ms, "kill escalation armed");
        self.schedule(self.config.kill_grace(), Command::EscalateKill { handle });
    }

    fn escalate_kill(&mut self, handle: HandleId) {
        let Some(mut dying) = self.dying.remove(&handle) else {
            return;
        };
        warn!(session_id = %dying.session_id, handle = %handle, "process outlived grace period, force killing");
        if let Err(err) = dying.process.force_kill() {
            warn!(session_id = %dying.session_id, handle = %handle, error = %err, "force kill failed");
        }
    }

    fn on_process_event(&mut self, id: SessionId, handle: HandleId, event: ProcessEvent) {
        match event {
            ProcessEvent::Data(text) => {
                if !self.registry.is_current(&id, handle) {
                    return;
                }
                if let Some(generation) = self.coalescer.push(&id, &text) {
                    self.schedule(
                        self.config.flush_interval(),
                        Command::FlushDue {
                            session_id: id,
                            generation,
                        },
                    );
                }
            }
            ProcessEvent::Error(message) => {
                if !self.registry.is_current(&id, handle) {
                    debug!(session_id = %id, handle = %handle, error = %message, "error from stale handle");
                    return;
                }
                warn!(session_id = %id, handle = %handle, error = %message, "session process failed");
                self.kill_session(&id, FinishCause::ProcessError);
            }
            ProcessEvent::Exit(exit) => {
                if self.dying.remove(&handle).is_some() {
                    debug!(session_id = %id, handle = %handle, exit = %exit, "killed process exited");
                    return;
                }
                if !self.registry.is_current(&id, handle) {
                    debug!(session_id = %id, handle = %handle, exit = %exit, "exit from stale handle ignored");
                    return;
                }
                self.on_exit(&id, handle, exit);
            }
        }
    }

    fn on_exit(&mut self, id: &SessionId, handle: HandleId, exit: ExitInfo) {
        let Some(kind) = self.registry.kind(id) else {
            return;
        };
        self.registry.begin_exit(id, handle);
        self.flush_output(id);
        self.finalize(id, &exit, FinishCause::NaturalExit);
        debug!(session_id = %id, handle = %handle, exit = %exit, "session process exited");

        let cwd = self.registry.cwd(id).unwrap_or_default().to_string();
        match plan_respawn(kind, self.registry.owner(id), &cwd) {
            RespawnDecision::Respawn { owner, cwd } => match self.respawn_shell(id, &cwd) {
                Ok(new_handle) => {
                    debug!(session_id = %id, old = %handle, new = %new_handle, "respawned shell");
                    owner.send(SessionEvent::Ready {
                        session_id: id.to_string(),
                    });
                    self.broadcast(BroadcastEvent::Started {
                        session_id: id.to_string(),
                        kind: SpawnKind::LocalShell,
                        respawned: true,
                    });
                }
                Err(err) => {
                    warn!(session_id = %id, error = %err, "respawn failed, cleaning up");
                    self.remove_exited(id, &exit);
                }
            },
            RespawnDecision::Cleanup(reason) => {
                debug!(session_id = %id, reason = ?reason, "no respawn");
                self.remove_exited(id, &exit);
            }
        }
    }

    fn respawn_shell(&mut self, id: &SessionId, cwd: &str) -> Result<HandleId> {
        let size = self
            .registry
            .size(id)
            .unwrap_or_else(|| self.config.default_size());
        let env = HashMap::new();
        let spawned = launcher::start_local(
            self.factory.as_ref(),
            &self.ctx,
            id,
            LocalLaunch {
                cwd,
                shell: None,
                env: &env,
                size,
                provider_hint: None,
            },
        )?;
        let (handle, _exited) = self
            .registry
            .replace(id, SpawnKind::LocalShell, spawned)
            .ok_or_else(|| PtyHubError::unknown_session(id.as_str()))?;
        self.attach_listeners(id);
        Ok(handle)
    }

    /// Drops a session whose process already exited. The caller has
    /// already finalized it.
    fn remove_exited(&mut self, id: &SessionId, exit: &ExitInfo) {
        let Some(removed) = self.registry.remove(id) else {
            return;
        };
        self.runs.reset_session(id);
        self.coalescer.cancel(id);
        self.snapshots.remove(id);
        if let Some(owner) = &removed.owner {
            owner.send(SessionEvent::Exit {
                session_id: id.to_string(),
                exit_code: exit.exit_code,
                signal: exit.signal.clone(),
            });
        }
        self.broadcast(BroadcastEvent::Exited {
            session_id: id.to_string(),
            exit_code: exit.exit_code,
            signal: exit.signal.clone(),
        });
    }

    fn finalize(&mut self, id: &SessionId, exit: &ExitInfo, cause: FinishCause) {
        let Some(outcome) = self.runs.mark_finish(id, exit, cause) else {
            return;
        };
        if let Some(record) = &outcome.record {
            self.broadcast(BroadcastEvent::RunFinished {
                key: record.key.to_string(),
                outcome: record.outcome,
                duration_ms: record.duration.as_millis() as u64,
            });
        }
        if outcome.notify {
            self.notifier.run_completed(id, outcome.record.as_ref());
        }
    }

    fn flush_output(&mut self, id: &SessionId) {
        if let Some(data) = self.coalescer.flush_now(id) {
            self.deliver_output(id, data);
        }
    }

    /// Sends output to whoever owns `id` right now. Output for a session
    /// without a live owner is dropped.
    fn deliver_output(&self, id: &SessionId, data: String) {
        let bytes = data.len();
        let delivered = self.registry.owner(id).is_some_and(|owner| {
            owner.send(SessionEvent::Data {
                session_id: id.to_string(),
                data,
            })
        });
        if !delivered {
            debug!(session_id = %id, bytes, "output dropped without owner");
        }
    }

    fn broadcast(&self, event: BroadcastEvent) {
        let _ = self.broadcast.send(event);
    }

    /// Force-kills whatever is left once the supervisor stops.
    fn abandon_remaining(&mut self) {
        for id in self.registry.session_ids() {
            if let Some(removed) = self.registry.remove(&id)
                && let Some(mut process) = removed.process
                && let Err(err) = process.force_kill()
            {
                warn!(session_id = %id, error = %err, "force kill on stop failed");
            }
        }
        for (handle, mut dying) in self.dying.drain() {
            if let Err(err) = dying.process.force_kill() {
                warn!(session_id = %dying.session_id, handle = %handle, error = %err, "force kill on stop failed");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::SpawnRequest;
    use crate::notifier::LogNotifier;
    use crate::spawn_config::HostPlatform;
    use pretty_assertions::assert_eq;

    struct IdleProcess;

    impl PtyProcess for IdleProcess {
        fn write(&mut self, _data: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }

        fn resize(&mut self, _size: TerminalSize) -> anyhow::Result<()> {
            Ok(())
        }

        fn terminate(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn force_kill(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn process_id(&self) -> Option<u32> {
            None
        }
    }

    struct IdleFactory;

    impl ProcessFactory for IdleFactory {
        fn spawn(&self, _request: SpawnRequest) -> anyhow::Result<SpawnedProcess> {
            let (_tx, events) = mpsc::unbounded_channel();
            Ok(SpawnedProcess {
                process: Box::new(IdleProcess),
                events,
            })
        }
    }

    fn actor() -> SupervisorActor {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        let ctx = SpawnContext {
            platform: HostPlatform::Unix,
            shell: "/bin/bash".to_string(),
            shell_setup: None,
        };
        SupervisorActor::new(
            SupervisorConfig::default(),
            ctx,
            Arc::new(IdleFactory),
            Arc::new(LogNotifier),
            tx.downgrade(),
            broadcast,
        )
    }

    fn agent_shell(session_id: &SessionId) -> StartLocalSessionParams {
        StartLocalSessionParams {
            session_id: session_id.to_string(),
            cwd: "/repo".to_string(),
            provider: Some("claude".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn killed_sessions_leave_no_finalize_marks() -> anyhow::Result<()> {
        let mut actor = actor();
        let (owner, _events) = OwnerChannel::new();
        let ids: Vec<SessionId> = (0..200)
            .map(|i| SessionId::new(format!("claude:main:task-{i}")))
            .collect();

        for id in &ids {
            actor.start_local(agent_shell(id), owner.downgrade())?;
            actor.kill(id)?;
        }

        assert!(actor.registry.session_ids().is_empty());
        assert!(ids.iter().all(|id| !actor.runs.is_finalized(id)));
        Ok(())
    }

    #[tokio::test]
    async fn exited_sessions_leave_no_finalize_marks() -> anyhow::Result<()> {
        let mut actor = actor();
        let (owner, _events) = OwnerChannel::new();
        let id = SessionId::new("claude:main:task-1");
        let outcome = actor.start_local(agent_shell(&id), owner.downgrade())?;

        actor.on_process_event(id.clone(), outcome.handle, ProcessEvent::Exit(ExitInfo::code(0)));

        assert!(!actor.registry.contains(&id));
        assert!(!actor.runs.is_finalized(&id));
        Ok(())
    }

    #[tokio::test]
    async fn respawned_session_stays_finalized() -> anyhow::Result<()> {
        let mut actor = actor();
        let (owner, _events) = OwnerChannel::new();
        let id = SessionId::new("claude:main:task-1");
        let params = StartDirectSessionParams {
            session_id: id.to_string(),
            provider: "claude".to_string(),
            cwd: "/repo".to_string(),
            ..Default::default()
        };
        let outcome = actor.start_direct(params, owner.downgrade())?;

        actor.on_process_event(id.clone(), outcome.handle, ProcessEvent::Exit(ExitInfo::code(0)));

        assert_eq!(actor.registry.kind(&id), Some(SpawnKind::LocalShell));
        assert!(actor.runs.is_finalized(&id));

        actor.kill(&id)?;
        assert!(!actor.runs.is_finalized(&id));
        Ok(())
    }
}
