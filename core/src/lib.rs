//! Root of the `ptyhub-core` library.
//!
//! Supervises pseudo-terminal sessions that run AI coding-agent CLIs and
//! login shells on behalf of a host UI.

mod coalescer;
pub mod config;
pub mod error;
pub mod factory;
mod launcher;
pub mod notifier;
pub mod owner;
pub mod provider;
pub mod pty;
pub mod registry;
pub mod respawn;
pub mod run_tracker;
pub mod spawn_config;
pub mod ssh;
mod supervisor;

pub use config::SupervisorConfig;
pub use error::PtyHubError;
pub use error::Result;
pub use factory::ExitInfo;
pub use factory::ProcessEvent;
pub use factory::ProcessFactory;
pub use factory::PtyProcess;
pub use factory::SpawnRequest;
pub use factory::SpawnedProcess;
pub use notifier::CompletionNotifier;
pub use notifier::LogNotifier;
pub use owner::OwnerChannel;
pub use owner::OwnerId;
pub use pty::NativePtyFactory;
pub use registry::HandleId;
pub use registry::SessionId;
pub use registry::StartOutcome;
pub use run_tracker::RunKey;
pub use run_tracker::RunRecord;
pub use spawn_config::SpawnConfig;
pub use spawn_config::SpawnContext;
pub use supervisor::Supervisor;
pub use supervisor::SupervisorHandle;
