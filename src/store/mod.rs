// src/store/mod.rs

//! Workflow persistence.
//!
//! The persisted graph is what makes resume possible: starting a workflow
//! that already exists keeps its successful tasks and drops the rest so
//! expansion can regenerate them.
//!
//! - [`JsonFileStore`] keeps one JSON document per workflow.
//! - [`MemoryStore`] is used in tests and for dry runs.

pub mod json;

pub use json::JsonFileStore;

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::info;

use crate::errors::{FlowError, Result};
use crate::model::{Workflow, WorkflowSettings};

/// Storage for workflow graphs, keyed by workflow name.
pub trait WorkflowStore: Send + Sync {
    fn load(&self, name: &str) -> Result<Option<Workflow>>;

    fn save(&self, wf: &Workflow) -> Result<()>;

    /// Returns whether anything was deleted.
    fn delete(&self, name: &str) -> Result<bool>;

    /// Open a workflow for a new run.
    ///
    /// - `restart`: the prior graph is deleted and a fresh workflow created
    /// - otherwise an existing graph is resumed: non-successful tasks and
    ///   stages left without tasks are dropped
    ///
    /// `settings` always replace the persisted ones.
    fn start(&self, name: &str, settings: WorkflowSettings, restart: bool) -> Result<Workflow> {
        if restart {
            if self.delete(name)? {
                info!(workflow = %name, "restart: deleted prior workflow graph");
            }
            return Ok(Workflow::new(name, settings));
        }

        match self.load(name)? {
            Some(mut wf) => {
                info!(workflow = %name, "resuming existing workflow");
                wf.settings = settings;
                wf.prepare_resume();
                Ok(wf)
            }
            None => {
                info!(workflow = %name, "creating new workflow");
                Ok(Workflow::new(name, settings))
            }
        }
    }
}

/// In-process store. Workflows are kept serialized so that a load always
/// goes through the same round trip as the file store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn docs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.docs
            .lock()
            .map_err(|_| FlowError::Store("memory store lock poisoned".into()))
    }
}

impl WorkflowStore for MemoryStore {
    fn load(&self, name: &str) -> Result<Option<Workflow>> {
        match self.docs()?.get(name) {
            Some(doc) => Ok(Some(serde_json::from_str(doc)?)),
            None => Ok(None),
        }
    }

    fn save(&self, wf: &Workflow) -> Result<()> {
        let doc = serde_json::to_string(wf)?;
        self.docs()?.insert(wf.name.clone(), doc);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.docs()?.remove(name).is_some())
    }
}
