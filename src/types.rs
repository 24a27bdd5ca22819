// src/types.rs

//! Shared vocabulary: status enums and tag values.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a single task.
///
/// `Successful` and `Killed` are always terminal. `Failed` is terminal only
/// once the attempt budget is exhausted; otherwise the task loops back to
/// `NoAttempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NoAttempt,
    Waiting,
    Submitted,
    Successful,
    Failed,
    Killed,
}

impl TaskStatus {
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Waiting | TaskStatus::Submitted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::NoAttempt => "no_attempt",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Successful => "successful",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a stage, derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    NoAttempt,
    Running,
    RunningButFailed,
    Successful,
    Failed,
    Killed,
}

impl StageStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            StageStatus::Successful | StageStatus::Failed | StageStatus::Killed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::NoAttempt => "no_attempt",
            StageStatus::Running => "running",
            StageStatus::RunningButFailed => "running_but_failed",
            StageStatus::Successful => "successful",
            StageStatus::Failed => "failed",
            StageStatus::Killed => "killed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall workflow status. Only the runner changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    NoAttempt,
    Running,
    Successful,
    Failed,
    FailedButRunning,
    Killed,
}

impl WorkflowStatus {
    /// Running or still draining independent subtrees after a failure.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Running | WorkflowStatus::FailedButRunning
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::NoAttempt => "no_attempt",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Successful => "successful",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::FailedButRunning => "failed_but_running",
            WorkflowStatus::Killed => "killed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relationship pattern kind as written in workflow files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    #[default]
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

impl FromStr for PatternKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "one_to_one" => Ok(PatternKind::OneToOne),
            "many_to_one" => Ok(PatternKind::ManyToOne),
            "one_to_many" => Ok(PatternKind::OneToMany),
            "many_to_many" => Ok(PatternKind::ManyToMany),
            other => Err(format!(
                "invalid relationship pattern: {other} (expected one_to_one, many_to_one, one_to_many or many_to_many)"
            )),
        }
    }
}

/// A scalar tag value.
///
/// Floats are compared with `total_cmp` so that tag sets have a total order
/// and can be used as grouping keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl TagValue {
    fn rank(&self) -> u8 {
        match self {
            TagValue::Bool(_) => 0,
            TagValue::Int(_) => 1,
            TagValue::Float(_) => 2,
            TagValue::Str(_) => 3,
        }
    }
}

impl Ord for TagValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (TagValue::Bool(a), TagValue::Bool(b)) => a.cmp(b),
            (TagValue::Int(a), TagValue::Int(b)) => a.cmp(b),
            (TagValue::Float(a), TagValue::Float(b)) => a.total_cmp(b),
            (TagValue::Str(a), TagValue::Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for TagValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TagValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TagValue {}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Bool(b) => write!(f, "{b}"),
            TagValue::Int(i) => write!(f, "{i}"),
            TagValue::Float(x) => write!(f, "{x}"),
            TagValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self {
        TagValue::Str(s.to_string())
    }
}

impl From<String> for TagValue {
    fn from(s: String) -> Self {
        TagValue::Str(s)
    }
}

impl From<i64> for TagValue {
    fn from(i: i64) -> Self {
        TagValue::Int(i)
    }
}

impl From<i32> for TagValue {
    fn from(i: i32) -> Self {
        TagValue::Int(i64::from(i))
    }
}

impl From<f64> for TagValue {
    fn from(x: f64) -> Self {
        TagValue::Float(x)
    }
}

impl From<bool> for TagValue {
    fn from(b: bool) -> Self {
        TagValue::Bool(b)
    }
}

/// Tag set of a task. Keys are kept sorted, so the map itself is the sorted
/// tag-item tuple that identifies a task within its stage.
pub type Tags = BTreeMap<String, TagValue>;

/// Build a tag set from `(key, value)` pairs.
pub fn tags<K, V, I>(items: I) -> Tags
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<TagValue>,
{
    items
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Merge `overlay` on top of `base`; later keys win.
pub fn merge_tags(base: &Tags, overlay: &Tags) -> Tags {
    let mut merged = base.clone();
    for (k, v) in overlay {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Stable task key derived from its tags (`k=v` pairs joined by `__`).
///
/// An empty tag set maps to `"default"`.
pub fn tags_uid(tags: &Tags) -> String {
    if tags.is_empty() {
        return "default".to_string();
    }
    tags.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("__")
}

/// Human readable rendering used in errors and logs.
pub fn format_tags(tags: &Tags) -> String {
    let items: Vec<String> = tags.iter().map(|(k, v)| format!("{k}: {v}")).collect();
    format!("{{{}}}", items.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_values_compare_across_variants() {
        assert_eq!(TagValue::from(1), TagValue::Int(1));
        assert_ne!(TagValue::from(1), TagValue::from("1"));
        assert!(TagValue::from(1.5) < TagValue::from("a"));
        assert_eq!(TagValue::Float(f64::NAN), TagValue::Float(f64::NAN));
    }

    #[test]
    fn uid_is_sorted_and_stable() {
        let t = tags([("sample", TagValue::from("a")), ("lane", TagValue::from(2))]);
        assert_eq!(tags_uid(&t), "lane=2__sample=a");
        assert_eq!(tags_uid(&Tags::new()), "default");
    }

    #[test]
    fn merge_prefers_overlay() {
        let base = tags([("a", 1), ("b", 2)]);
        let overlay = tags([("b", 3)]);
        let merged = merge_tags(&base, &overlay);
        assert_eq!(merged.get("b"), Some(&TagValue::Int(3)));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn untagged_values_deserialize_in_order() {
        let v: Tags = toml::from_str("a = 1\nb = \"x\"\nc = true\nd = 0.5").unwrap();
        assert_eq!(v["a"], TagValue::Int(1));
        assert_eq!(v["b"], TagValue::from("x"));
        assert_eq!(v["c"], TagValue::Bool(true));
        assert_eq!(v["d"], TagValue::Float(0.5));
    }

    #[test]
    fn pattern_kind_parses_dashes() {
        assert_eq!(
            "many-to-one".parse::<PatternKind>().unwrap(),
            PatternKind::ManyToOne
        );
        assert!("fan_out".parse::<PatternKind>().is_err());
    }
}
