//! Static `(service, method) -> MethodPolicy` lookup table.
//!
//! Populated once from a service schema (YAML or JSON) and never mutated
//! afterwards. Unknown methods resolve to [`MethodPolicy::conservative`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PolicyError, PolicyResult};
use crate::policy::{InvalidationTarget, IoFlag, MethodPolicy};

/// Schema bundled with the crate.
pub const DEFAULT_SCHEMA_YAML: &str = include_str!("../schemas/default.yaml");

/// On-disk schema document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySchema {
    #[serde(default)]
    pub services: BTreeMap<String, BTreeMap<String, MethodSpec>>,
}

/// Declared I/O facts for one method.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodSpec {
    #[serde(default)]
    pub flags: Vec<IoFlag>,

    #[serde(default)]
    pub invalidation_scope: Vec<InvalidationTarget>,
}

/// Policy lookup table.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    services: HashMap<String, HashMap<String, MethodPolicy>>,
    conservative: MethodPolicy,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

impl PolicyRegistry {
    /// Registry with no methods; every lookup is conservative.
    pub fn empty() -> Self {
        Self {
            services: HashMap::new(),
            conservative: MethodPolicy::conservative(),
        }
    }

    /// Registry built from the bundled schema.
    pub fn bundled() -> PolicyResult<Self> {
        Self::from_yaml_str(DEFAULT_SCHEMA_YAML)
    }

    pub fn from_yaml_str(text: &str) -> PolicyResult<Self> {
        let schema: PolicySchema = serde_yaml::from_str(text)?;
        Self::from_schema(schema)
    }

    pub fn from_json_str(text: &str) -> PolicyResult<Self> {
        let schema: PolicySchema = serde_json::from_str(text)?;
        Self::from_schema(schema)
    }

    /// Load a schema file. `.json` is parsed as JSON, anything else as YAML.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy schema {}", path.display()))?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let registry = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        };
        registry.with_context(|| format!("invalid policy schema {}", path.display()))
    }

    /// Validate and index a parsed schema.
    pub fn from_schema(schema: PolicySchema) -> PolicyResult<Self> {
        let mut registry = Self::empty();
        for (service, methods) in schema.services {
            if service.trim().is_empty() {
                return Err(PolicyError::EmptyName { what: "service" });
            }
            for (method, spec) in methods {
                if method.trim().is_empty() {
                    return Err(PolicyError::EmptyName { what: "method" });
                }
                validate_spec(&service, &method, &spec)?;
                let policy = MethodPolicy::from_flags(&spec.flags)
                    .with_invalidation_scope(spec.invalidation_scope);
                registry.insert(service.clone(), method, policy);
            }
        }
        debug!(methods = registry.len(), "policy registry loaded");
        Ok(registry)
    }

    /// Add or replace one method's policy.
    pub fn insert(
        &mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        policy: MethodPolicy,
    ) {
        self.services
            .entry(service.into())
            .or_default()
            .insert(method.into(), policy);
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with_method(
        mut self,
        service: impl Into<String>,
        method: impl Into<String>,
        policy: MethodPolicy,
    ) -> Self {
        self.insert(service, method, policy);
        self
    }

    pub fn lookup(&self, service: &str, method: &str) -> Option<&MethodPolicy> {
        self.services.get(service)?.get(method)
    }

    /// Like [`lookup`](Self::lookup) but falls back to the conservative policy.
    pub fn lookup_or_conservative(&self, service: &str, method: &str) -> &MethodPolicy {
        self.lookup(service, method).unwrap_or(&self.conservative)
    }

    pub fn contains(&self, service: &str, method: &str) -> bool {
        self.lookup(service, method).is_some()
    }

    /// Number of methods with a declared policy.
    pub fn len(&self) -> usize {
        self.services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_spec(service: &str, method: &str, spec: &MethodSpec) -> PolicyResult<()> {
    let has = |flag: IoFlag| spec.flags.contains(&flag);
    let conflict = |reason: &str| PolicyError::ConflictingFlags {
        service: service.to_string(),
        method: method.to_string(),
        reason: reason.to_string(),
    };

    if has(IoFlag::Cache) && has(IoFlag::ReadNoCache) {
        return Err(conflict("both cache and read_no_cache"));
    }
    if has(IoFlag::Buffer) && has(IoFlag::WriteNoBuffer) {
        return Err(conflict("both buffer and write_no_buffer"));
    }
    if has(IoFlag::Cache) && has(IoFlag::Buffer) {
        return Err(conflict("a method cannot be both cached and buffered"));
    }

    for target in &spec.invalidation_scope {
        if target.service_and_method().is_none() {
            return Err(PolicyError::InvalidScope {
                service: service.to_string(),
                method: method.to_string(),
                reason: format!("accessor '{}' is not service/method", target.accessor),
            });
        }
        if target.scope.trim().is_empty() {
            return Err(PolicyError::InvalidScope {
                service: service.to_string(),
                method: method.to_string(),
                reason: "empty scope".to_string(),
            });
        }
    }
    Ok(())
}
