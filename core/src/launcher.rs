//! The three ways a session process gets started. Each resolves a fresh
//! [`SpawnConfig`] and hands it to the process factory.

use std::collections::HashMap;

use ptyhub_protocol::TerminalSize;
use tracing::debug;

use crate::error::PtyHubError;
use crate::error::Result;
use crate::factory::ProcessFactory;
use crate::factory::SpawnRequest;
use crate::factory::SpawnedProcess;
use crate::provider::ProviderInvocation;
use crate::registry::SessionId;
use crate::spawn_config::SpawnConfig;
use crate::spawn_config::SpawnContext;
use crate::spawn_config::resolve_direct_spawn_config;
use crate::spawn_config::resolve_spawn_config;
use crate::ssh::SshTarget;

pub struct LocalLaunch<'a> {
    pub cwd: &'a str,
    /// Per-session shell override.
    pub shell: Option<&'a str>,
    pub env: &'a HashMap<String, String>,
    pub size: TerminalSize,
    pub provider_hint: Option<&'a ProviderInvocation>,
}

fn spawn(
    factory: &dyn ProcessFactory,
    session_id: &SessionId,
    config: SpawnConfig,
    size: TerminalSize,
) -> Result<SpawnedProcess> {
    debug!(
        session_id = %session_id,
        program = %config.program,
        args = ?config.args,
        cwd = ?config.cwd,
        "spawning pty"
    );
    factory
        .spawn(SpawnRequest {
            session_id: session_id.to_string(),
            config,
            size,
        })
        .map_err(|err| PtyHubError::spawn(session_id.as_str(), err))
}

/// Starts a login shell, optionally running a provider CLI inside it.
pub fn start_local(
    factory: &dyn ProcessFactory,
    ctx: &SpawnContext,
    session_id: &SessionId,
    launch: LocalLaunch<'_>,
) -> Result<SpawnedProcess> {
    let config = match launch.shell.map(str::trim).filter(|shell| !shell.is_empty()) {
        Some(shell) => {
            let ctx = SpawnContext {
                shell: shell.to_string(),
                ..ctx.clone()
            };
            resolve_spawn_config(&ctx, launch.cwd, launch.provider_hint)
        }
        None => resolve_spawn_config(ctx, launch.cwd, launch.provider_hint),
    };
    spawn(factory, session_id, config.with_env(launch.env), launch.size)
}

/// Runs the provider CLI without a shell. `Ok(None)` means this target
/// needs a shell wrapper and the caller should use [`start_local`].
pub fn start_direct(
    factory: &dyn ProcessFactory,
    ctx: &SpawnContext,
    session_id: &SessionId,
    cwd: &str,
    invocation: &ProviderInvocation,
    env: &HashMap<String, String>,
    size: TerminalSize,
) -> Result<Option<SpawnedProcess>> {
    let config = match resolve_direct_spawn_config(ctx, cwd, invocation) {
        Ok(config) => config,
        Err(PtyHubError::UnsupportedForDirectSpawn { reason }) => {
            debug!(session_id = %session_id, reason = %reason, "direct spawn unsupported");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };
    spawn(factory, session_id, config.with_env(env), size).map(Some)
}

/// Opens an SSH session to `target`. The remote side is bootstrapped by
/// writing to the session's input once it is registered.
pub fn start_ssh(
    factory: &dyn ProcessFactory,
    session_id: &SessionId,
    target: &SshTarget,
    env: &HashMap<String, String>,
    size: TerminalSize,
) -> Result<SpawnedProcess> {
    spawn(factory, session_id, target.spawn_config().with_env(env), size)
}
