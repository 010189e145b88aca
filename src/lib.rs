//! Pluggable sandbox execution: a provider contract, a plugin registry, a
//! bounded instance pool, and strongest-isolation-first selection with
//! graceful fallback.

pub mod config;
pub mod sandbox;
