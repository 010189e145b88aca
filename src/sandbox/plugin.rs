//! Plugin definitions: metadata paired with a factory.
//!
//! A plugin is the unit of extensibility. Its identity is
//! `metadata.provider_type`; registering a second plugin with the same type
//! replaces the first.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use super::error::SandboxError;
use super::provider::SandboxProvider;
use super::types::{ProviderConfig, ProviderMetadata, ProviderType};

/// Builds a fresh, uninitialized provider instance from its config.
pub type ProviderFactory =
    Arc<dyn Fn(ProviderConfig) -> Result<Arc<dyn SandboxProvider>, SandboxError> + Send + Sync>;

/// Process-wide hook run when the plugin set is activated or torn down.
pub type PluginHook = Arc<dyn Fn() -> BoxFuture<'static, Result<(), SandboxError>> + Send + Sync>;

#[derive(Clone)]
pub struct Plugin {
    pub metadata: ProviderMetadata,
    pub factory: ProviderFactory,
    pub on_init: Option<PluginHook>,
    pub on_destroy: Option<PluginHook>,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("metadata", &self.metadata)
            .field("on_init", &self.on_init.is_some())
            .field("on_destroy", &self.on_destroy.is_some())
            .finish_non_exhaustive()
    }
}

impl Plugin {
    pub fn new<F>(metadata: ProviderMetadata, factory: F) -> Self
    where
        F: Fn(ProviderConfig) -> Result<Arc<dyn SandboxProvider>, SandboxError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            metadata,
            factory: Arc::new(factory),
            on_init: None,
            on_destroy: None,
        }
    }

    pub fn with_on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<(), SandboxError>> + Send + Sync + 'static,
    {
        self.on_init = Some(Arc::new(hook));
        self
    }

    pub fn with_on_destroy<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<(), SandboxError>> + Send + Sync + 'static,
    {
        self.on_destroy = Some(Arc::new(hook));
        self
    }

    pub fn provider_type(&self) -> &ProviderType {
        &self.metadata.provider_type
    }

    /// Fail fast on a malformed definition. The factory is callable by
    /// construction, so only the metadata needs checking.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.metadata.provider_type.as_str().trim().is_empty() {
            return Err(SandboxError::Configuration(
                "plugin type must not be empty".into(),
            ));
        }
        if self.metadata.name.trim().is_empty() {
            return Err(SandboxError::Configuration(format!(
                "plugin {} must have a name",
                self.metadata.provider_type
            )));
        }
        if let Some(schema) = &self.metadata.config_schema {
            if !schema.is_object() {
                return Err(SandboxError::Configuration(format!(
                    "plugin {} config schema must be an object",
                    self.metadata.provider_type
                )));
            }
        }
        Ok(())
    }

    /// Check `config` against the declared schema, if any.
    pub fn validate_config(&self, config: &ProviderConfig) -> Result<(), SandboxError> {
        match &self.metadata.config_schema {
            Some(schema) => validate_against_schema(&self.metadata.provider_type, schema, config),
            None => Ok(()),
        }
    }

    /// Build an instance, validating the config first.
    pub fn instantiate(&self, config: ProviderConfig) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
        self.validate_config(&config)?;
        (self.factory)(config)
    }
}

/// Minimal JSON-schema subset: `properties.<name>.type`, `required`, and
/// `additionalProperties: false`.
pub fn validate_against_schema(
    provider: &ProviderType,
    schema: &Value,
    config: &ProviderConfig,
) -> Result<(), SandboxError> {
    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !config.contains_key(key) {
                return Err(SandboxError::Configuration(format!(
                    "{provider}: missing required config key '{key}'"
                )));
            }
        }
    }

    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (key, value) in config {
        let Some(prop) = properties.and_then(|p| p.get(key)) else {
            if closed {
                return Err(SandboxError::Configuration(format!(
                    "{provider}: unknown config key '{key}'"
                )));
            }
            continue;
        };
        if let Some(expected) = prop.get("type").and_then(Value::as_str) {
            if !type_matches(expected, value) {
                return Err(SandboxError::Configuration(format!(
                    "{provider}: config key '{key}' must be of type {expected}"
                )));
            }
        }
        if let Some(options) = prop.get("enum").and_then(Value::as_array) {
            if !options.contains(value) {
                return Err(SandboxError::Configuration(format!(
                    "{provider}: config key '{key}' must be one of {}",
                    Value::Array(options.clone())
                )));
            }
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}
