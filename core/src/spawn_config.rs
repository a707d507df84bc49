//! Turns a working directory (and optionally a provider invocation) into the
//! program, arguments and environment a pty should be spawned with.
//!
//! Windows hosts can point at a directory inside a WSL distro through a UNC
//! path (`\\wsl$\Ubuntu\home\me` or `\\wsl.localhost\Ubuntu\home\me`). Such a
//! directory cannot be a host process's working directory, so the session is
//! launched through `wsl.exe` with `--cd` and the CLI is looked up inside the
//! guest instead.

use std::collections::BTreeMap;
use std::collections::HashMap;

use ptyhub_utils_string::quote_if_needed;
use serde::Serialize;

use crate::error::PtyHubError;
use crate::error::Result;
use crate::provider::ProviderInvocation;

const WSL_LAUNCHER: &str = "wsl.exe";
const WSL_GUEST_SHELL: &str = "bash";
const WSL_UNC_PREFIXES: [&str; 2] = ["\\\\wsl$\\", "\\\\wsl.localhost\\"];
const DEFAULT_UNIX_SHELL: &str = "/bin/bash";
const DEFAULT_WINDOWS_SHELL: &str = "powershell.exe";
const EXECUTABLE_EXTENSIONS: [&str; 4] = [".exe", ".cmd", ".bat", ".ps1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPlatform {
    Unix,
    Windows,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostPlatform::Windows
        } else {
            HostPlatform::Unix
        }
    }
}

/// Host facts the resolver depends on, made explicit so Windows behavior can
/// be exercised from any host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnContext {
    pub platform: HostPlatform,
    pub shell: String,
    pub shell_setup: Option<String>,
}

impl SpawnContext {
    pub fn detect(shell_override: Option<&str>, shell_setup: Option<&str>) -> Self {
        let platform = HostPlatform::current();
        let shell = shell_override
            .map(str::trim)
            .filter(|shell| !shell.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_host_shell(platform));
        Self {
            platform,
            shell,
            shell_setup: shell_setup
                .map(str::trim)
                .filter(|setup| !setup.is_empty())
                .map(str::to_string),
        }
    }
}

fn default_host_shell(platform: HostPlatform) -> String {
    match platform {
        HostPlatform::Windows => DEFAULT_WINDOWS_SHELL.to_string(),
        HostPlatform::Unix => std::env::var("SHELL")
            .ok()
            .map(|shell| shell.trim().to_string())
            .filter(|shell| !shell.is_empty())
            .unwrap_or_else(|| DEFAULT_UNIX_SHELL.to_string()),
    }
}

/// Everything needed to spawn one pty process. Built fresh per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnConfig {
    pub program: String,
    pub args: Vec<String>,
    /// `None` leaves the working directory to the launcher (WSL `--cd`).
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub shell_wrapped: bool,
}

impl SpawnConfig {
    pub fn with_env(mut self, overlay: &HashMap<String, String>) -> Self {
        for (key, value) in overlay {
            self.env.insert(key.clone(), value.clone());
        }
        self
    }
}

pub(crate) fn base_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WslPath {
    pub distro: String,
    pub posix_path: String,
}

/// Recognizes `\\wsl$\<distro>\...` and `\\wsl.localhost\<distro>\...` in
/// either slash direction with a case-insensitive prefix.
pub fn parse_wsl_path(path: &str) -> Option<WslPath> {
    let normalized = path.replace('/', "\\");
    let lowered = normalized.to_ascii_lowercase();
    let rest = WSL_UNC_PREFIXES
        .iter()
        .find(|prefix| lowered.starts_with(*prefix))
        .map(|prefix| &normalized[prefix.len()..])?;

    let mut segments = rest.split('\\').filter(|segment| !segment.is_empty());
    let distro = segments.next()?.to_string();
    let posix_path = format!("/{}", segments.collect::<Vec<_>>().join("/"));
    Some(WslPath { distro, posix_path })
}

/// Builds the canonical host UNC path for `posix_path` inside `distro`.
pub fn wsl_unc_path(distro: &str, posix_path: &str) -> String {
    let tail = posix_path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("\\");
    if tail.is_empty() {
        format!("\\\\wsl.localhost\\{distro}")
    } else {
        format!("\\\\wsl.localhost\\{distro}\\{tail}")
    }
}

/// Strips any host directory and executable extension from `cli` so the
/// guest shell resolves it through its own PATH.
pub fn bare_cli_name(cli: &str) -> String {
    let name = cli.rsplit(['/', '\\']).next().unwrap_or(cli);
    let lowered = name.to_ascii_lowercase();
    EXECUTABLE_EXTENSIONS
        .iter()
        .find(|ext| lowered.ends_with(*ext) && name.len() > ext.len())
        .map(|ext| name[..name.len() - ext.len()].to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Shell-wrapped spawn configuration for `working_dir`. With a provider
/// hint the shell starts the CLI and falls back into an interactive shell
/// once it exits.
pub fn resolve_spawn_config(
    ctx: &SpawnContext,
    working_dir: &str,
    provider_hint: Option<&ProviderInvocation>,
) -> SpawnConfig {
    if ctx.platform == HostPlatform::Windows
        && let Some(wsl) = parse_wsl_path(working_dir)
    {
        return wsl_spawn_config(ctx, &wsl, provider_hint);
    }

    match ctx.platform {
        HostPlatform::Unix => unix_shell_config(ctx, working_dir, provider_hint),
        HostPlatform::Windows => windows_shell_config(ctx, working_dir, provider_hint),
    }
}

/// Spawn configuration that runs the CLI directly, without a shell.
///
/// WSL directories and configured shell-setup scripts both need a shell
/// wrapper; callers fall back to [`resolve_spawn_config`] on
/// [`PtyHubError::UnsupportedForDirectSpawn`].
pub fn resolve_direct_spawn_config(
    ctx: &SpawnContext,
    working_dir: &str,
    invocation: &ProviderInvocation,
) -> Result<SpawnConfig> {
    if ctx.platform == HostPlatform::Windows && parse_wsl_path(working_dir).is_some() {
        return Err(PtyHubError::UnsupportedForDirectSpawn {
            reason: format!("{working_dir} is inside WSL"),
        });
    }
    if ctx.shell_setup.is_some() {
        return Err(PtyHubError::UnsupportedForDirectSpawn {
            reason: "a shell setup script is configured".to_string(),
        });
    }
    Ok(SpawnConfig {
        program: invocation.cli.clone(),
        args: invocation.argv.clone(),
        cwd: Some(working_dir.to_string()),
        env: base_env(),
        shell_wrapped: false,
    })
}

fn startup_command(setup: Option<&str>, command: Option<String>, fallback: String) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(setup) = setup {
        parts.push(setup.to_string());
    }
    if let Some(command) = command {
        parts.push(command);
    }
    parts.push(fallback);
    parts.join("; ")
}

fn unix_shell_config(
    ctx: &SpawnContext,
    working_dir: &str,
    provider_hint: Option<&ProviderInvocation>,
) -> SpawnConfig {
    let args = if provider_hint.is_none() && ctx.shell_setup.is_none() {
        vec!["-l".to_string()]
    } else {
        let fallback = format!("exec {} -l", quote_if_needed(&ctx.shell));
        let command = startup_command(
            ctx.shell_setup.as_deref(),
            provider_hint.map(ProviderInvocation::command_line),
            fallback,
        );
        vec![
            "-l".to_string(),
            "-i".to_string(),
            "-c".to_string(),
            command,
        ]
    };
    SpawnConfig {
        program: ctx.shell.clone(),
        args,
        cwd: Some(working_dir.to_string()),
        env: base_env(),
        shell_wrapped: true,
    }
}

fn windows_shell_config(
    ctx: &SpawnContext,
    working_dir: &str,
    provider_hint: Option<&ProviderInvocation>,
) -> SpawnConfig {
    let mut args = vec!["-NoLogo".to_string()];
    if provider_hint.is_some() || ctx.shell_setup.is_some() {
        let mut parts: Vec<String> = Vec::new();
        if let Some(setup) = ctx.shell_setup.as_deref() {
            parts.push(setup.to_string());
        }
        if let Some(invocation) = provider_hint {
            parts.push(invocation.powershell_command_line());
        }
        args.push("-NoExit".to_string());
        args.push("-Command".to_string());
        args.push(parts.join("; "));
    }
    SpawnConfig {
        program: ctx.shell.clone(),
        args,
        cwd: Some(working_dir.to_string()),
        env: base_env(),
        shell_wrapped: true,
    }
}

fn wsl_spawn_config(
    ctx: &SpawnContext,
    wsl: &WslPath,
    provider_hint: Option<&ProviderInvocation>,
) -> SpawnConfig {
    let mut args = vec![
        "-d".to_string(),
        wsl.distro.clone(),
        "--cd".to_string(),
        wsl.posix_path.clone(),
        "--".to_string(),
        WSL_GUEST_SHELL.to_string(),
    ];
    if provider_hint.is_none() && ctx.shell_setup.is_none() {
        args.push("-li".to_string());
    } else {
        let command = provider_hint
            .map(|invocation| invocation.command_line_with_cli(&bare_cli_name(&invocation.cli)));
        args.push("-lic".to_string());
        args.push(startup_command(
            ctx.shell_setup.as_deref(),
            command,
            format!("exec {WSL_GUEST_SHELL} -li"),
        ));
    }
    SpawnConfig {
        program: WSL_LAUNCHER.to_string(),
        args,
        cwd: None,
        env: base_env(),
        shell_wrapped: true,
    }
}
