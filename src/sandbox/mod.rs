pub mod backends;
pub mod error;
pub mod local_host;
pub mod plugin;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod script;
pub mod selector;
pub mod types;
pub mod verify;

#[cfg(test)]
pub mod testing;

pub use error::{CandidateFailure, SandboxError};
pub use plugin::Plugin;
pub use pool::{PoolConfig, PoolStats, PooledSandbox, SandboxPool};
pub use provider::SandboxProvider;
pub use registry::ProviderRegistry;
pub use runtime::{ProviderStatus, RuntimeConfig, SandboxRuntime};
pub use selector::{SelectedProvider, SelectionPolicy, SelectionResult};
pub use types::*;
