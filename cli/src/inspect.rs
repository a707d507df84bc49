//! Subcommands that print what the resolvers would do, without spawning.

use anyhow::Context;
use clap::Args;
use ptyhub_core::SpawnContext;
use ptyhub_core::SupervisorConfig;
use ptyhub_core::provider::InvocationOptions;
use ptyhub_core::provider::build_invocation_args;
use ptyhub_core::provider::resolve_provider;
use ptyhub_core::spawn_config::resolve_spawn_config;
use ptyhub_core::ssh::SshRoute;
use ptyhub_core::ssh::resolve_ssh_route;
use ptyhub_protocol::SshConnection;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Working directory of the session.
    #[arg(value_name = "DIR")]
    dir: String,

    /// Provider whose CLI the shell should start.
    #[arg(long = "provider", value_name = "ID")]
    provider: Option<String>,
}

#[derive(Debug, Args)]
pub struct InvocationArgs {
    #[arg(value_name = "PROVIDER")]
    provider: String,

    #[arg(long = "resume", default_value_t = false)]
    resume: bool,

    #[arg(long = "auto-approve", default_value_t = false)]
    auto_approve: bool,

    #[arg(long = "prompt", value_name = "TEXT")]
    prompt: Option<String>,
}

#[derive(Debug, Args)]
pub struct SshRouteArgs {
    /// Saved connection id from the config file.
    #[arg(
        long = "connection",
        value_name = "ID",
        conflicts_with = "host",
        required_unless_present = "host"
    )]
    connection: Option<String>,

    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    #[arg(long = "user", value_name = "USER", requires = "host")]
    user: Option<String>,

    #[arg(long = "port", value_name = "PORT", requires = "host")]
    port: Option<u16>,

    #[arg(long = "identity", value_name = "FILE", requires = "host")]
    identity: Option<String>,
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

pub fn resolve(config: &SupervisorConfig, args: ResolveArgs) -> anyhow::Result<()> {
    let ctx = SpawnContext::detect(config.shell.as_deref(), config.shell_setup.as_deref());
    let invocation = match args.provider.as_deref() {
        Some(provider_id) => {
            let provider = resolve_provider(provider_id, config.provider_overrides(provider_id))?;
            Some(build_invocation_args(&provider, &InvocationOptions::default()))
        }
        None => None,
    };
    print_json(&resolve_spawn_config(&ctx, &args.dir, invocation.as_ref()))
}

pub fn invocation(config: &SupervisorConfig, args: InvocationArgs) -> anyhow::Result<()> {
    let provider = resolve_provider(&args.provider, config.provider_overrides(&args.provider))?;
    let invocation = build_invocation_args(
        &provider,
        &InvocationOptions {
            resume: args.resume,
            auto_approve: args.auto_approve,
            initial_prompt: args.prompt,
        },
    );
    print_json(&json!({
        "cli": invocation.cli,
        "args": invocation.argv,
        "command_line": invocation.command_line(),
        "keystroke_prompt": provider.uses_keystroke_prompt(),
    }))
}

pub fn ssh_route(config: &SupervisorConfig, args: SshRouteArgs) -> anyhow::Result<()> {
    let route = match (args.connection, args.host) {
        (Some(id), _) => SshRoute::Saved(id),
        (None, Some(host)) => SshRoute::Inline(SshConnection {
            host,
            user: args.user,
            port: args.port,
            identity_file: args.identity,
            ..SshConnection::default()
        }),
        (None, None) => anyhow::bail!("either --connection or --host is required"),
    };
    let target = resolve_ssh_route(&route, &config.ssh_connections)?;
    print_json(&json!({
        "destination": target.destination,
        "argv": target.argv(),
    }))
}
