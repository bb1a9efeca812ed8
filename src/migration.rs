// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Migration runner: ordered, named, exactly-once transforms applied to a
//! record at load time.
//!
//! A record remembers the step names it has applied; the runner executes
//! the configured suffix it has not. A record that has applied a step the
//! store does not know (or in an order the store does not recognise) is
//! refused with `UnknownMigration`. Persistence is the caller's job: the
//! migrated record is flushed with the first post-load save, so a crash
//! in between simply reapplies on the next load.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::StoreError;

/// A migration transform. Receives a deep copy of the record's data and
/// returns the migrated value, or an error message to abort the load.
pub type MigrationFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// One named, ordered migration step.
#[derive(Clone)]
pub struct MigrationStep {
    pub name: String,
    pub transform: MigrationFn,
}

impl MigrationStep {
    pub fn new(
        name: impl Into<String>,
        transform: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), transform: Arc::new(transform) }
    }
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Applies the configured step list to loaded records.
pub(crate) struct MigrationRunner<'a> {
    steps: &'a [MigrationStep],
}

impl<'a> MigrationRunner<'a> {
    pub fn new(steps: &'a [MigrationStep]) -> Self {
        Self { steps }
    }

    /// Check that `applied` is a prefix of the configured step names.
    pub fn validate_applied(&self, applied: &[String]) -> Result<(), StoreError> {
        if applied.len() > self.steps.len() {
            let unknown = &applied[self.steps.len()];
            return Err(StoreError::UnknownMigration(unknown.clone()));
        }
        for (step, name) in self.steps.iter().zip(applied) {
            if &step.name != name {
                return Err(StoreError::UnknownMigration(name.clone()));
            }
        }
        Ok(())
    }

    /// Run every pending step. On success `data` holds the migrated value
    /// and `applied` the full step-name list; returns whether anything ran.
    pub fn run(&self, data: &mut Value, applied: &mut Vec<String>) -> Result<bool, StoreError> {
        self.validate_applied(applied)?;
        let pending = &self.steps[applied.len()..];
        if pending.is_empty() {
            return Ok(false);
        }

        for step in pending {
            debug!(step = %step.name, "applying migration");
            let input = data.clone();
            let transform = step.transform.clone();
            // A panicking step aborts the whole migration, like an Err.
            let outcome = catch_unwind(AssertUnwindSafe(move || transform(input)))
                .map_err(|_| StoreError::MigrationFailed {
                    step: step.name.clone(),
                    detail: "step panicked".into(),
                })?;
            *data = outcome.map_err(|detail| StoreError::MigrationFailed {
                step: step.name.clone(),
                detail,
            })?;
            applied.push(step.name.clone());
        }
        info!(steps = pending.len(), "migrations applied");
        Ok(true)
    }

    /// The full configured step-name list, stamped on records born current.
    pub fn all_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }
}
