// src/model/mod.rs

//! Workflow data model.
//!
//! - [`workflow`] is the arena owning stages and tasks.
//! - [`stage`] and [`task`] are the records stored in it.
//! - [`ids`] holds the integer handles used for every cross-reference.

pub mod ids;
pub mod stage;
pub mod task;
pub mod workflow;

pub use ids::{StageId, TaskId};
pub use stage::Stage;
pub use task::{Resources, Task, TaskSpec};
pub use workflow::{ResumeSummary, Workflow, WorkflowSettings};
