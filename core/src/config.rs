use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use ptyhub_protocol::SshConnection;
use ptyhub_protocol::TerminalSize;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::PtyHubError;
use crate::error::Result;
use crate::provider::ProviderOverrides;

pub const CONFIG_TOML_FILE: &str = "config.toml";
const CONFIG_DIR_NAME: &str = "ptyhub";

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 16;
const MIN_FLUSH_INTERVAL_MS: u64 = 4;
const MAX_FLUSH_INTERVAL_MS: u64 = 250;
const DEFAULT_KILL_GRACE_MS: u64 = 2_000;
const MIN_KILL_GRACE_MS: u64 = 100;
const MAX_KILL_GRACE_MS: u64 = 30_000;
const DEFAULT_KEYSTROKE_PROMPT_DELAY_MS: u64 = 1_200;
const DEFAULT_SNAPSHOT_MAX_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub flush_interval_ms: u64,
    pub kill_grace_ms: u64,
    pub default_cols: u16,
    pub default_rows: u16,
    /// Host shell override; falls back to `$SHELL` or the platform default.
    pub shell: Option<String>,
    /// Script run before the session's command. Forces shell-wrapped spawn.
    pub shell_setup: Option<String>,
    pub keystroke_prompt_delay_ms: u64,
    pub snapshot_max_bytes: usize,
    pub providers: BTreeMap<String, ProviderOverrides>,
    pub ssh_connections: Vec<SshConnection>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let size = TerminalSize::default();
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            default_cols: size.cols,
            default_rows: size.rows,
            shell: None,
            shell_setup: None,
            keystroke_prompt_delay_ms: DEFAULT_KEYSTROKE_PROMPT_DELAY_MS,
            snapshot_max_bytes: DEFAULT_SNAPSHOT_MAX_BYTES,
            providers: BTreeMap::new(),
            ssh_connections: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    /// `<config dir>/ptyhub/config.toml`, when the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_TOML_FILE))
    }

    /// Loads `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(PtyHubError::config(err)),
        };
        Self::from_toml(&contents)
    }

    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).map_err(PtyHubError::config)?;
        Ok(config.normalized())
    }

    /// Clamps timings into their supported ranges.
    pub fn normalized(mut self) -> Self {
        self.flush_interval_ms = self
            .flush_interval_ms
            .clamp(MIN_FLUSH_INTERVAL_MS, MAX_FLUSH_INTERVAL_MS);
        self.kill_grace_ms = self.kill_grace_ms.clamp(MIN_KILL_GRACE_MS, MAX_KILL_GRACE_MS);
        if self.default_cols == 0 || self.default_rows == 0 {
            let size = TerminalSize::default();
            self.default_cols = size.cols;
            self.default_rows = size.rows;
        }
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn keystroke_prompt_delay(&self) -> Duration {
        Duration::from_millis(self.keystroke_prompt_delay_ms)
    }

    pub fn default_size(&self) -> TerminalSize {
        TerminalSize {
            cols: self.default_cols,
            rows: self.default_rows,
        }
    }

    pub fn provider_overrides(&self, provider_id: &str) -> Option<&ProviderOverrides> {
        self.providers.get(provider_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let config = SupervisorConfig::load(&tmp.path().join(CONFIG_TOML_FILE))?;
        assert_eq!(config, SupervisorConfig::default());
        Ok(())
    }

    #[test]
    fn partial_file_keeps_other_defaults() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join(CONFIG_TOML_FILE);
        std::fs::write(
            &path,
            r#"
flush_interval_ms = 1
kill_grace_ms = 500
shell = "/bin/zsh"

[providers.codex]
cli = "/opt/codex/bin/codex"
default_args = "--model o3"

[[ssh_connections]]
id = "build-box"
host = "build.internal"
port = 2222
"#,
        )?;

        let config = SupervisorConfig::load(&path)?;
        assert_eq!(config.flush_interval_ms, MIN_FLUSH_INTERVAL_MS);
        assert_eq!(config.kill_grace(), Duration::from_millis(500));
        assert_eq!(config.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.default_size(), TerminalSize::default());
        assert_eq!(
            config
                .provider_overrides("codex")
                .and_then(|o| o.cli.as_deref()),
            Some("/opt/codex/bin/codex")
        );
        assert_eq!(config.ssh_connections.len(), 1);
        assert_eq!(config.ssh_connections[0].port, Some(2222));
        assert!(config.ssh_connections[0].extra_args.is_empty());
        Ok(())
    }

    #[test]
    fn malformed_file_is_a_config_error() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join(CONFIG_TOML_FILE);
        std::fs::write(&path, "flush_interval_ms = \"soon\"")?;
        let err = SupervisorConfig::load(&path).expect_err("malformed");
        assert!(matches!(err, PtyHubError::Config { .. }));
        Ok(())
    }
}
