// src/model/stage.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::{StageId, TaskId};
use crate::types::StageStatus;

/// A named group of tasks produced by one relationship-pattern application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    /// Position in the stage DAG's topological order, recomputed each run.
    pub number: u32,
    pub status: StageStatus,
    pub parents: Vec<StageId>,
    pub children: Vec<StageId>,
    pub tasks: Vec<TaskId>,
    pub started_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

impl Stage {
    pub fn new(id: StageId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            number: 0,
            status: StageStatus::NoAttempt,
            parents: Vec::new(),
            children: Vec::new(),
            tasks: Vec::new(),
            started_on: None,
            finished_on: None,
        }
    }
}
