//! Versioned, immutable schema registry.
//!
//! Each `(module, version)` pair maps to exactly one validator, registered at
//! startup and frozen thereafter. Any payload stored under a given
//! `schema_version` can be re-validated later with exactly that definition,
//! independent of subsequent schema evolution. Unknown keys fail with a
//! distinct error rather than falling back silently.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::PolicywatchError;
use crate::schema::summary::{Judgement, Summary, SummaryV0};

/// Validates one part of a producer payload against a business schema.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, value: &Value) -> Result<(), PolicywatchError>;
}

/// Adapts any deserializable type into a validator. The target type is
/// resolved statically at the registration site.
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> SchemaValidator for TypedSchema<T> {
    fn validate(&self, value: &Value) -> Result<(), PolicywatchError> {
        serde_json::from_value::<T>(value.clone())
            .map(|_| ())
            .map_err(|e| PolicywatchError::Validation(e.to_string()))
    }
}

/// Registry keyed by `(module, version)`, populated at startup.
pub struct SchemaRegistry {
    entries: HashMap<(String, String), Arc<dyn SchemaValidator>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// The schema set this pipeline ships with.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        // Registration of the built-in set cannot collide.
        let _ = registry.register("summary", "v0", Arc::new(TypedSchema::<SummaryV0>::new()));
        let _ = registry.register("summary", "v1", Arc::new(TypedSchema::<Summary>::new()));
        let _ = registry.register("judge", "v1", Arc::new(TypedSchema::<Judgement>::new()));
        registry
    }

    /// Register a schema version. A `(module, version)` pair may be bound
    /// exactly once; re-registration is an error, never a replacement.
    pub fn register(
        &mut self,
        module: &str,
        version: &str,
        validator: Arc<dyn SchemaValidator>,
    ) -> Result<(), PolicywatchError> {
        let key = (module.to_string(), version.to_string());
        if self.entries.contains_key(&key) {
            return Err(PolicywatchError::SchemaRedefinition {
                module: module.to_string(),
                version: version.to_string(),
            });
        }
        self.entries.insert(key, validator);
        Ok(())
    }

    pub fn get(&self, module: &str, version: &str) -> Result<&Arc<dyn SchemaValidator>, PolicywatchError> {
        self.entries
            .get(&(module.to_string(), version.to_string()))
            .ok_or_else(|| PolicywatchError::UnregisteredSchema {
                module: module.to_string(),
                version: version.to_string(),
            })
    }

    /// Validate every part independently against the registered schema.
    pub fn validate_parts(
        &self,
        module: &str,
        version: &str,
        parts: &[Value],
    ) -> Result<(), PolicywatchError> {
        let validator = self.get(module, version)?;
        for (i, part) in parts.iter().enumerate() {
            validator
                .validate(part)
                .map_err(|e| PolicywatchError::Validation(format!("part {i}: {e}")))?;
        }
        Ok(())
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
