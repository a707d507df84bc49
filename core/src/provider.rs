//! Provider catalog and CLI invocation building.
//!
//! A provider is an agent CLI (`claude`, `codex`, ...). Building an
//! invocation merges the built-in definition with the user's overrides and
//! lays the tokens out in a fixed order:
//!
//! 1. resume flag (when resuming and the provider supports it)
//! 2. default args
//! 3. auto-approve flag (when requested and supported)
//! 4. initial-prompt flag and the prompt text (argument delivery only)
//!
//! Tokens are kept twice: raw for argv-style spawning and shell-quoted for
//! command lines that a shell will parse.

use ptyhub_utils_string::powershell_quote_if_needed;
use ptyhub_utils_string::quote_if_needed;
use ptyhub_utils_string::shell_quote;
use serde::Deserialize;
use serde::Serialize;

use crate::error::PtyHubError;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptDelivery {
    /// The prompt is passed on the command line.
    Argument,
    /// The prompt is typed into the terminal once the CLI is up.
    Keystrokes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub cli: &'static str,
    pub resume_flag: Option<&'static str>,
    pub default_args: &'static [&'static str],
    pub auto_approve_flag: Option<&'static str>,
    pub initial_prompt_flag: Option<&'static str>,
    pub prompt_delivery: PromptDelivery,
    pub install_hint: &'static str,
}

const PROVIDERS: &[ProviderDefinition] = &[
    ProviderDefinition {
        id: "claude",
        name: "Claude Code",
        cli: "claude",
        resume_flag: Some("--continue"),
        default_args: &[],
        auto_approve_flag: Some("--dangerously-skip-permissions"),
        initial_prompt_flag: None,
        prompt_delivery: PromptDelivery::Argument,
        install_hint: "npm install -g @anthropic-ai/claude-code",
    },
    ProviderDefinition {
        id: "codex",
        name: "Codex",
        cli: "codex",
        resume_flag: Some("resume --last"),
        default_args: &[],
        auto_approve_flag: Some("--full-auto"),
        initial_prompt_flag: None,
        prompt_delivery: PromptDelivery::Argument,
        install_hint: "npm install -g @openai/codex",
    },
    ProviderDefinition {
        id: "gemini",
        name: "Gemini CLI",
        cli: "gemini",
        resume_flag: None,
        default_args: &[],
        auto_approve_flag: Some("--yolo"),
        initial_prompt_flag: Some("-i"),
        prompt_delivery: PromptDelivery::Argument,
        install_hint: "npm install -g @google/gemini-cli",
    },
    ProviderDefinition {
        id: "qwen",
        name: "Qwen Code",
        cli: "qwen",
        resume_flag: None,
        default_args: &[],
        auto_approve_flag: Some("--yolo"),
        initial_prompt_flag: Some("-i"),
        prompt_delivery: PromptDelivery::Argument,
        install_hint: "npm install -g @qwen-code/qwen-code",
    },
    ProviderDefinition {
        id: "amp",
        name: "Amp",
        cli: "amp",
        resume_flag: None,
        default_args: &[],
        auto_approve_flag: Some("--dangerously-allow-all"),
        initial_prompt_flag: None,
        prompt_delivery: PromptDelivery::Keystrokes,
        install_hint: "npm install -g @sourcegraph/amp",
    },
    ProviderDefinition {
        id: "opencode",
        name: "OpenCode",
        cli: "opencode",
        resume_flag: Some("--continue"),
        default_args: &[],
        auto_approve_flag: None,
        initial_prompt_flag: Some("--prompt"),
        prompt_delivery: PromptDelivery::Argument,
        install_hint: "npm install -g opencode-ai",
    },
    ProviderDefinition {
        id: "cursor",
        name: "Cursor Agent",
        cli: "cursor-agent",
        resume_flag: Some("--resume"),
        default_args: &[],
        auto_approve_flag: Some("--force"),
        initial_prompt_flag: None,
        prompt_delivery: PromptDelivery::Keystrokes,
        install_hint: "curl https://cursor.com/install -fsS | bash",
    },
    ProviderDefinition {
        id: "copilot",
        name: "GitHub Copilot CLI",
        cli: "copilot",
        resume_flag: Some("--continue"),
        default_args: &[],
        auto_approve_flag: Some("--allow-all-tools"),
        initial_prompt_flag: Some("-i"),
        prompt_delivery: PromptDelivery::Argument,
        install_hint: "npm install -g @github/copilot",
    },
    ProviderDefinition {
        id: "aider",
        name: "Aider",
        cli: "aider",
        resume_flag: Some("--restore-chat-history"),
        default_args: &[],
        auto_approve_flag: Some("--yes-always"),
        initial_prompt_flag: None,
        prompt_delivery: PromptDelivery::Keystrokes,
        install_hint: "python -m pip install aider-install && aider-install",
    },
    ProviderDefinition {
        id: "goose",
        name: "Goose",
        cli: "goose",
        resume_flag: None,
        default_args: &["session"],
        auto_approve_flag: None,
        initial_prompt_flag: None,
        prompt_delivery: PromptDelivery::Keystrokes,
        install_hint: "curl -fsSL https://github.com/block/goose/releases/download/stable/download_cli.sh | bash",
    },
];

pub fn find_provider(id: &str) -> Option<&'static ProviderDefinition> {
    PROVIDERS.iter().find(|provider| provider.id == id)
}

/// User-level overrides. Every field is optional; blank strings count as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderOverrides {
    pub cli: Option<String>,
    pub resume_flag: Option<String>,
    pub default_args: Option<String>,
    pub auto_approve_flag: Option<String>,
    pub initial_prompt_flag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProvider {
    pub id: String,
    pub cli: String,
    pub resume_flag: Option<String>,
    pub default_args: Vec<String>,
    pub auto_approve_flag: Option<String>,
    pub initial_prompt_flag: Option<String>,
    pub prompt_delivery: PromptDelivery,
    pub install_hint: String,
}

impl ResolvedProvider {
    pub fn uses_keystroke_prompt(&self) -> bool {
        self.prompt_delivery == PromptDelivery::Keystrokes
    }
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn pick(override_value: Option<&String>, default: Option<&str>) -> Option<String> {
    non_blank(override_value).or(default).map(str::to_string)
}

/// Merges `overrides` onto `definition` field by field.
pub fn resolve_provider_overrides(
    definition: &ProviderDefinition,
    overrides: Option<&ProviderOverrides>,
) -> ResolvedProvider {
    let default_args = match overrides.and_then(|o| non_blank(o.default_args.as_ref())) {
        Some(custom) => split_flag_tokens(custom),
        None => definition
            .default_args
            .iter()
            .map(|arg| (*arg).to_string())
            .collect(),
    };

    ResolvedProvider {
        id: definition.id.to_string(),
        cli: pick(overrides.and_then(|o| o.cli.as_ref()), Some(definition.cli))
            .unwrap_or_default(),
        resume_flag: pick(
            overrides.and_then(|o| o.resume_flag.as_ref()),
            definition.resume_flag,
        ),
        default_args,
        auto_approve_flag: pick(
            overrides.and_then(|o| o.auto_approve_flag.as_ref()),
            definition.auto_approve_flag,
        ),
        initial_prompt_flag: pick(
            overrides.and_then(|o| o.initial_prompt_flag.as_ref()),
            definition.initial_prompt_flag,
        ),
        prompt_delivery: definition.prompt_delivery,
        install_hint: definition.install_hint.to_string(),
    }
}

/// Looks up `provider_id` and applies `overrides`.
pub fn resolve_provider(
    provider_id: &str,
    overrides: Option<&ProviderOverrides>,
) -> Result<ResolvedProvider> {
    let definition = find_provider(provider_id).ok_or_else(|| PtyHubError::UnknownProvider {
        provider: provider_id.to_string(),
    })?;
    Ok(resolve_provider_overrides(definition, overrides))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationOptions {
    pub resume: bool,
    pub auto_approve: bool,
    pub initial_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInvocation {
    pub cli: String,
    /// Raw tokens, for spawning the CLI without a shell.
    pub argv: Vec<String>,
    /// The same tokens quoted for a POSIX shell command line.
    pub args: Vec<String>,
}

impl ProviderInvocation {
    fn new(cli: String) -> Self {
        Self {
            cli,
            argv: Vec::new(),
            args: Vec::new(),
        }
    }

    fn push_flag(&mut self, token: String) {
        self.args.push(quote_if_needed(&token).into_owned());
        self.argv.push(token);
    }

    fn push_text(&mut self, text: &str) {
        self.args.push(shell_quote(text));
        self.argv.push(text.to_string());
    }

    /// `cli` followed by the quoted args, ready for `sh -c` or a shell prompt.
    pub fn command_line(&self) -> String {
        self.command_line_with_cli(&self.cli)
    }

    pub(crate) fn command_line_with_cli(&self, cli: &str) -> String {
        let mut line = quote_if_needed(cli).into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// The invocation rendered for PowerShell, built from the raw tokens.
    pub fn powershell_command_line(&self) -> String {
        let mut line = format!("& {}", powershell_quote_if_needed(&self.cli));
        for arg in &self.argv {
            line.push(' ');
            line.push_str(&powershell_quote_if_needed(arg));
        }
        line
    }
}

pub fn build_invocation_args(
    provider: &ResolvedProvider,
    options: &InvocationOptions,
) -> ProviderInvocation {
    let mut invocation = ProviderInvocation::new(provider.cli.clone());

    if options.resume
        && let Some(flag) = provider.resume_flag.as_deref()
    {
        for token in split_flag_tokens(flag) {
            invocation.push_flag(token);
        }
    }

    for arg in &provider.default_args {
        invocation.push_flag(arg.clone());
    }

    if options.auto_approve
        && let Some(flag) = provider.auto_approve_flag.as_deref()
    {
        for token in split_flag_tokens(flag) {
            invocation.push_flag(token);
        }
    }

    let prompt = options
        .initial_prompt
        .as_deref()
        .filter(|prompt| !prompt.trim().is_empty());
    if let Some(prompt) = prompt
        && !provider.uses_keystroke_prompt()
    {
        if let Some(flag) = provider.initial_prompt_flag.as_deref() {
            for token in split_flag_tokens(flag) {
                invocation.push_flag(token);
            }
        }
        invocation.push_text(prompt);
    }

    invocation
}

/// Splits a flag string the way a shell would, falling back to whitespace
/// splitting when the quoting is unbalanced.
fn split_flag_tokens(flags: &str) -> Vec<String> {
    shlex::split(flags).unwrap_or_else(|| flags.split_whitespace().map(str::to_string).collect())
}
