use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::Context;
use anyhow::anyhow;
use ptyhub_core::CompletionNotifier;
use ptyhub_core::ExitInfo;
use ptyhub_core::ProcessEvent;
use ptyhub_core::ProcessFactory;
use ptyhub_core::PtyProcess;
use ptyhub_core::RunRecord;
use ptyhub_core::SessionId;
use ptyhub_core::SpawnContext;
use ptyhub_core::SpawnRequest;
use ptyhub_core::SpawnedProcess;
use ptyhub_core::Supervisor;
use ptyhub_core::SupervisorConfig;
use ptyhub_core::SupervisorHandle;
use ptyhub_core::spawn_config::HostPlatform;
use ptyhub_protocol::BroadcastEvent;
use ptyhub_protocol::SessionEvent;
use ptyhub_protocol::StartDirectSessionParams;
use ptyhub_protocol::StartLocalSessionParams;
use ptyhub_protocol::TerminalSize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a [`FakeProcess`] was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessLog {
    pub writes: Vec<String>,
    pub resizes: Vec<TerminalSize>,
    pub terminate_calls: usize,
    pub force_kill_calls: usize,
}

struct FakeProcess {
    log: Arc<Mutex<ProcessLog>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    ignore_terminate: bool,
    exited: bool,
}

impl FakeProcess {
    fn exit_with(&mut self, exit: ExitInfo) {
        if !self.exited {
            self.exited = true;
            let _ = self.events.send(ProcessEvent::Exit(exit));
        }
    }
}

impl PtyProcess for FakeProcess {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if self.exited {
            return Err(anyhow!("process exited"));
        }
        lock(&self.log)
            .writes
            .push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    fn resize(&mut self, size: TerminalSize) -> anyhow::Result<()> {
        lock(&self.log).resizes.push(size);
        Ok(())
    }

    fn terminate(&mut self) -> anyhow::Result<()> {
        lock(&self.log).terminate_calls += 1;
        if !self.ignore_terminate {
            self.exit_with(ExitInfo::signaled("SIGHUP"));
        }
        Ok(())
    }

    fn force_kill(&mut self) -> anyhow::Result<()> {
        lock(&self.log).force_kill_calls += 1;
        self.exit_with(ExitInfo::signaled("SIGKILL"));
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        None
    }
}

/// Test-side view of one spawned [`FakeProcess`].
#[derive(Debug, Clone)]
pub struct FakeSpawn {
    pub request: SpawnRequest,
    events: mpsc::UnboundedSender<ProcessEvent>,
    log: Arc<Mutex<ProcessLog>>,
}

impl FakeSpawn {
    /// Output as if the program had printed `text`.
    pub fn emit(&self, text: &str) {
        let _ = self.events.send(ProcessEvent::Data(text.to_string()));
    }

    /// Reports an exit. Has no effect on the fake's own bookkeeping, so it
    /// can also stand in for a late exit from a killed process.
    pub fn exit(&self, exit: ExitInfo) {
        let _ = self.events.send(ProcessEvent::Exit(exit));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.events.send(ProcessEvent::Error(message.to_string()));
    }

    pub fn log(&self) -> ProcessLog {
        lock(&self.log).clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.log().writes
    }
}

#[derive(Default)]
struct FactoryState {
    spawns: Vec<FakeSpawn>,
    /// Outcomes for upcoming spawns; `false` fails the spawn.
    script: VecDeque<bool>,
    ignore_terminate: bool,
}

/// Records every spawn request and hands back scriptable processes.
#[derive(Clone, Default)]
pub struct FakeFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the spawn after `successes` more successful ones.
    pub fn fail_after(&self, successes: usize) {
        let mut state = lock(&self.state);
        state.script.extend(std::iter::repeat_n(true, successes));
        state.script.push_back(false);
    }

    /// Processes spawned from now on ignore polite termination.
    pub fn ignore_terminate(&self, ignore: bool) {
        lock(&self.state).ignore_terminate = ignore;
    }

    pub fn spawn_count(&self) -> usize {
        lock(&self.state).spawns.len()
    }

    pub fn spawned(&self, index: usize) -> anyhow::Result<FakeSpawn> {
        lock(&self.state)
            .spawns
            .get(index)
            .cloned()
            .with_context(|| format!("no spawn #{index}"))
    }

    pub fn last_spawn(&self) -> anyhow::Result<FakeSpawn> {
        lock(&self.state)
            .spawns
            .last()
            .cloned()
            .context("nothing spawned")
    }
}

impl ProcessFactory for FakeFactory {
    fn spawn(&self, request: SpawnRequest) -> anyhow::Result<SpawnedProcess> {
        let mut state = lock(&self.state);
        if state.script.pop_front() == Some(false) {
            return Err(anyhow!("scripted spawn failure for {}", request.config.program));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(ProcessLog::default()));
        state.spawns.push(FakeSpawn {
            request,
            events: events_tx.clone(),
            log: Arc::clone(&log),
        });
        Ok(SpawnedProcess {
            process: Box::new(FakeProcess {
                log,
                events: events_tx,
                ignore_terminate: state.ignore_terminate,
                exited: false,
            }),
            events: events_rx,
        })
    }
}

/// Collects completion notifications.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    completions: Arc<Mutex<Vec<(String, Option<RunRecord>)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_ids(&self) -> Vec<String> {
        lock(&self.completions)
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn records(&self) -> Vec<Option<RunRecord>> {
        lock(&self.completions)
            .iter()
            .map(|(_, record)| record.clone())
            .collect()
    }
}

impl CompletionNotifier for RecordingNotifier {
    fn run_completed(&self, session_id: &SessionId, record: Option<&RunRecord>) {
        lock(&self.completions).push((session_id.to_string(), record.cloned()));
    }
}

pub fn unix_context() -> SpawnContext {
    SpawnContext {
        platform: HostPlatform::Unix,
        shell: "/bin/bash".to_string(),
        shell_setup: None,
    }
}

pub struct TestSupervisor {
    pub handle: SupervisorHandle,
    pub factory: FakeFactory,
    pub notifier: RecordingNotifier,
}

pub fn start_supervisor(config: SupervisorConfig) -> TestSupervisor {
    let factory = FakeFactory::new();
    let notifier = RecordingNotifier::new();
    let handle = Supervisor::spawn_with_context(
        config,
        unix_context(),
        Arc::new(factory.clone()),
        Arc::new(notifier.clone()),
    );
    TestSupervisor {
        handle,
        factory,
        notifier,
    }
}

pub async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> anyhow::Result<SessionEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .context("timed out waiting for a session event")?
        .context("owner channel closed")
}

pub async fn next_broadcast(
    rx: &mut broadcast::Receiver<BroadcastEvent>,
) -> anyhow::Result<BroadcastEvent> {
    Ok(tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .context("timed out waiting for a broadcast")??)
}

/// Skips data events until the session reports an exit or a respawn.
pub async fn next_lifecycle_event(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> anyhow::Result<SessionEvent> {
    loop {
        match next_event(rx).await? {
            SessionEvent::Data { .. } => continue,
            event => return Ok(event),
        }
    }
}

pub fn local_params(session_id: &str) -> StartLocalSessionParams {
    StartLocalSessionParams {
        session_id: session_id.to_string(),
        cwd: "/repo".to_string(),
        ..Default::default()
    }
}

pub fn direct_params(session_id: &str, provider: &str) -> StartDirectSessionParams {
    StartDirectSessionParams {
        session_id: session_id.to_string(),
        provider: provider.to_string(),
        cwd: "/repo".to_string(),
        ..Default::default()
    }
}

/// Lets every queued event and command run. Only meaningful under a paused
/// clock, where the sleep completes once the runtime is otherwise idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
