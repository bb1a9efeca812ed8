//! Configuration for a store.
//!
//! # Example
//!
//! ```
//! use playervault::StoreConfig;
//! use serde_json::json;
//!
//! // Minimal config (uses defaults)
//! let config = StoreConfig::new("players");
//! assert_eq!(config.tunables.max_doc_bytes, 3_900_000);
//!
//! // Full config
//! let config = StoreConfig::new("players")
//!     .template(json!({"coins": 0}))
//!     .schema(|data| {
//!         data["coins"]
//!             .as_i64()
//!             .map(|_| ())
//!             .ok_or_else(|| "coins must be a number".to_string())
//!     });
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::events::ChangeObserver;
use crate::migration::MigrationStep;
use crate::resilience::RetryPolicy;

/// Schema predicate, called at every durable boundary. `Err` carries the
/// rejection reason surfaced in `SchemaFailed`.
pub type SchemaFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Legacy-import hook, called exactly once on first load of an absent key.
/// `Ok(None)` falls back to the template.
pub type ImportFn = Arc<dyn Fn(&str) -> Result<Option<Value>, String> + Send + Sync>;

/// Numeric tunables, all with sensible defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Tunables {
    /// Size budget per DocStore document; records whose inline encoding
    /// exceeds it are sharded (default: 3.9 MB).
    #[serde(default = "default_max_doc_bytes")]
    pub max_doc_bytes: usize,

    /// Lease TTL, and also the acquire deadline (default: 60 s).
    #[serde(default = "default_lock_duration_secs")]
    pub lock_duration_secs: u64,

    /// Lease refresh cadence; `None` means a third of the duration.
    #[serde(default)]
    pub lock_refresh_secs: Option<u64>,

    /// Autosave cadence for dirty sessions (default: 30 s).
    #[serde(default = "default_autosave_secs")]
    pub autosave_secs: u64,

    /// Orphan sweep cadence while the store is open (default: 120 s).
    #[serde(default = "default_orphan_sweep_secs")]
    pub orphan_sweep_secs: u64,

    /// Wall-clock budget for synchronous update/tx transforms; exceeding
    /// it fails the operation with `UpdateYielded` (default: 100 ms).
    #[serde(default = "default_transform_budget_ms")]
    pub transform_budget_ms: u64,
}

fn default_max_doc_bytes() -> usize { 3_900_000 }
fn default_lock_duration_secs() -> u64 { 60 }
fn default_autosave_secs() -> u64 { 30 }
fn default_orphan_sweep_secs() -> u64 { 120 }
fn default_transform_budget_ms() -> u64 { 100 }

impl Default for Tunables {
    fn default() -> Self {
        Self {
            max_doc_bytes: default_max_doc_bytes(),
            lock_duration_secs: default_lock_duration_secs(),
            lock_refresh_secs: None,
            autosave_secs: default_autosave_secs(),
            orphan_sweep_secs: default_orphan_sweep_secs(),
            transform_budget_ms: default_transform_budget_ms(),
        }
    }
}

impl Tunables {
    #[must_use]
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    /// Refresh interval, defaulting to a third of the lock duration.
    #[must_use]
    pub fn lock_refresh_interval(&self) -> Duration {
        match self.lock_refresh_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.lock_duration() / 3,
        }
    }

    #[must_use]
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_secs)
    }

    #[must_use]
    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_secs)
    }

    #[must_use]
    pub fn transform_budget(&self) -> Duration {
        Duration::from_millis(self.transform_budget_ms)
    }
}

/// Configuration for one store.
///
/// Built in code by the host; the hooks are plain closures. `name` is the
/// namespace prefix for every document and lease the store touches, so
/// stores with distinct names can safely share backends.
#[derive(Clone)]
pub struct StoreConfig {
    /// Store namespace prefix.
    pub name: String,
    /// Default `data` for a freshly-created record.
    pub template: Value,
    /// Schema predicate; `None` accepts everything.
    pub schema: Option<SchemaFn>,
    /// Ordered, named migration steps.
    pub migration_steps: Vec<MigrationStep>,
    /// Hook for importing data the engine has never seen.
    pub import_legacy_data: Option<ImportFn>,
    /// Change observers, invoked after every committed mutation.
    pub changed_callbacks: Vec<ChangeObserver>,
    /// Skip the pre-transform deep copy on the update fast path. A
    /// transform that mutates and then returns `false` will leave its
    /// mutation in place; only enable for trusted transforms.
    pub disable_reference_protection: bool,
    pub tunables: Tunables,
    pub retry: RetryPolicy,
}

impl StoreConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: Value::Object(serde_json::Map::new()),
            schema: None,
            migration_steps: Vec::new(),
            import_legacy_data: None,
            changed_callbacks: Vec::new(),
            disable_reference_protection: false,
            tunables: Tunables::default(),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn template(mut self, template: Value) -> Self {
        self.template = template;
        self
    }

    #[must_use]
    pub fn schema(
        mut self,
        schema: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    #[must_use]
    pub fn migration_steps(mut self, steps: Vec<MigrationStep>) -> Self {
        self.migration_steps = steps;
        self
    }

    #[must_use]
    pub fn import_legacy_data(
        mut self,
        import: impl Fn(&str) -> Result<Option<Value>, String> + Send + Sync + 'static,
    ) -> Self {
        self.import_legacy_data = Some(Arc::new(import));
        self
    }

    #[must_use]
    pub fn changed_callback(mut self, observer: ChangeObserver) -> Self {
        self.changed_callbacks.push(observer);
        self
    }

    #[must_use]
    pub fn disable_reference_protection(mut self, disable: bool) -> Self {
        self.disable_reference_protection = disable;
        self
    }

    #[must_use]
    pub fn tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate the data against the schema predicate, if any.
    pub(crate) fn check_schema(&self, data: &Value) -> Result<(), crate::error::StoreError> {
        match &self.schema {
            Some(schema) => {
                schema(data).map_err(|reason| crate::error::StoreError::SchemaFailed { reason })
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("name", &self.name)
            .field("migration_steps", &self.migration_steps.len())
            .field("changed_callbacks", &self.changed_callbacks.len())
            .field("disable_reference_protection", &self.disable_reference_protection)
            .field("tunables", &self.tunables)
            .finish_non_exhaustive()
    }
}
