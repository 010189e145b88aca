pub mod docker;
pub mod native;

use super::plugin::Plugin;

/// Plugins registered by `SandboxRuntime::with_builtins`.
pub fn builtin_plugins() -> Vec<Plugin> {
    vec![native::plugin(), docker::plugin()]
}
