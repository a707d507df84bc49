//! SSH-backed sessions: connection resolution and the bootstrap line typed
//! into the remote shell once it is up.

use ptyhub_protocol::RemoteTarget;
use ptyhub_protocol::SshConnection;
use ptyhub_utils_string::quote_if_needed;
use ptyhub_utils_string::shell_quote;
use serde::Serialize;

use crate::error::PtyHubError;
use crate::error::Result;
use crate::provider::ProviderInvocation;
use crate::spawn_config::SpawnConfig;
use crate::spawn_config::base_env;

const SSH_PROGRAM: &str = "ssh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshRoute {
    Saved(String),
    Inline(SshConnection),
}

impl From<RemoteTarget> for SshRoute {
    fn from(target: RemoteTarget) -> Self {
        match target {
            RemoteTarget::Saved { connection_id } => SshRoute::Saved(connection_id),
            RemoteTarget::Inline { connection } => SshRoute::Inline(connection),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshTarget {
    /// `user@host`, or just `host`.
    pub destination: String,
    /// Options placed before the destination.
    pub args: Vec<String>,
}

impl SshTarget {
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.push(self.destination.clone());
        argv
    }

    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            program: SSH_PROGRAM.to_string(),
            args: self.argv(),
            cwd: None,
            env: base_env(),
            shell_wrapped: true,
        }
    }
}

pub fn resolve_ssh_route(route: &SshRoute, saved: &[SshConnection]) -> Result<SshTarget> {
    let connection = match route {
        SshRoute::Saved(id) => saved
            .iter()
            .find(|connection| &connection.id == id)
            .ok_or_else(|| PtyHubError::UnknownSshConnection { id: id.clone() })?,
        SshRoute::Inline(connection) => connection,
    };
    build_target(connection)
}

fn build_target(connection: &SshConnection) -> Result<SshTarget> {
    let host = connection.host.trim();
    validate_word("host", host)?;
    let destination = match connection.user.as_deref().map(str::trim) {
        Some(user) if !user.is_empty() => {
            validate_word("user", user)?;
            format!("{user}@{host}")
        }
        _ => host.to_string(),
    };

    // Force a tty so the remote login shell is interactive.
    let mut args = vec!["-tt".to_string()];
    if let Some(port) = connection.port {
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }
        args.push("-p".to_string());
        args.push(port.to_string());
    }
    if let Some(identity) = connection
        .identity_file
        .as_deref()
        .map(str::trim)
        .filter(|identity| !identity.is_empty())
    {
        args.push("-i".to_string());
        args.push(identity.to_string());
    }
    args.extend(connection.extra_args.iter().cloned());

    Ok(SshTarget { destination, args })
}

fn validate_word(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(invalid(&format!("{field} is empty")));
    }
    if value.starts_with('-') {
        return Err(invalid(&format!("{field} must not start with '-'")));
    }
    if value.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
        return Err(invalid(&format!("{field} contains whitespace")));
    }
    Ok(())
}

fn invalid(reason: &str) -> PtyHubError {
    PtyHubError::InvalidSshConfig {
        reason: reason.to_string(),
    }
}

/// The line written to a fresh SSH session's input: change into
/// `remote_dir`, then exec the provider CLI if the remote PATH has it or
/// print `install_hint` otherwise.
pub fn remote_bootstrap_script(
    remote_dir: &str,
    invocation: &ProviderInvocation,
    install_hint: &str,
) -> String {
    let cli = quote_if_needed(&invocation.cli);
    let missing = if install_hint.is_empty() {
        format!("{} not found on remote host", invocation.cli)
    } else {
        format!(
            "{} not found on remote host. Install with: {install_hint}",
            invocation.cli
        )
    };
    let guarded = format!(
        "if command -v {cli} >/dev/null 2>&1; then exec {}; else echo {}; fi",
        invocation.command_line(),
        shell_quote(&missing),
    );
    format!("cd {} && sh -c {}\n", remote_dir_word(remote_dir), shell_quote(&guarded))
}

/// Quotes a remote directory while keeping a leading `~` expandable.
fn remote_dir_word(dir: &str) -> String {
    let dir = dir.trim();
    if dir.is_empty() || dir == "~" {
        return "\"$HOME\"".to_string();
    }
    match dir.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", shell_quote(rest)),
        None => shell_quote(dir),
    }
}
