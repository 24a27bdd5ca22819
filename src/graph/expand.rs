// src/graph/expand.rs

//! Pure expansion of a relationship pattern over parent tasks.

use tracing::debug;

use crate::errors::{FlowError, Result};
use crate::graph::pattern::{RelationshipPattern, SplitSpace};
use crate::model::TaskId;
use crate::types::{Tags, format_tags, merge_tags};

/// A child task to create: its tags and the parent tasks it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSpec {
    pub tags: Tags,
    pub parents: Vec<TaskId>,
}

/// A reduced group: the shared `reduce_by` values and its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub tags: Tags,
    pub members: Vec<TaskId>,
}

/// Expand `pattern` over `parents` (in stage, then task, order).
///
/// `extra` tags are merged last and win over inherited ones.
pub fn expand(
    parents: &[(TaskId, &Tags)],
    pattern: &RelationshipPattern,
    extra: &Tags,
    stage: &str,
) -> Result<Vec<ChildSpec>> {
    let children = match pattern {
        RelationshipPattern::OneToOne => parents
            .iter()
            .map(|(id, tags)| ChildSpec {
                tags: merge_tags(tags, extra),
                parents: vec![*id],
            })
            .collect(),

        RelationshipPattern::ManyToOne { reduce_by } => reduce(parents, reduce_by, stage)?
            .into_iter()
            .map(|g| ChildSpec {
                tags: merge_tags(&g.tags, extra),
                parents: g.members,
            })
            .collect(),

        RelationshipPattern::OneToMany { split_by } => {
            let mut out = Vec::new();
            for (id, tags) in parents {
                out.extend(split(tags, split_by, extra, &[*id]));
            }
            out
        }

        RelationshipPattern::ManyToMany { reduce_by, split_by } => {
            let mut out = Vec::new();
            for group in reduce(parents, reduce_by, stage)? {
                out.extend(split(&group.tags, split_by, extra, &group.members));
            }
            out
        }
    };

    debug!(
        stage,
        pattern = ?pattern.kind(),
        parents = parents.len(),
        children = children.len(),
        "expanded relationship pattern"
    );
    Ok(children)
}

fn split(base: &Tags, space: &SplitSpace, extra: &Tags, parents: &[TaskId]) -> Vec<ChildSpec> {
    space
        .combinations(base)
        .into_iter()
        .map(|combo| ChildSpec {
            tags: merge_tags(&merge_tags(base, &combo), extra),
            parents: parents.to_vec(),
        })
        .collect()
}

/// Group parents by their `reduce_by` values.
///
/// Parents carrying every key define the groups, in order of first
/// appearance. A parent missing some keys is a wildcard: it joins every
/// group whose values it does not contradict on the keys it does have.
/// Members keep their input order.
pub fn reduce(parents: &[(TaskId, &Tags)], reduce_by: &[String], stage: &str) -> Result<Vec<Group>> {
    let mut groups: Vec<(Tags, Vec<usize>)> = Vec::new();
    let mut wildcards: Vec<usize> = Vec::new();

    for (idx, (_, tags)) in parents.iter().enumerate() {
        let key: Option<Tags> = reduce_by
            .iter()
            .map(|k| tags.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        match key {
            Some(key) => match groups.iter_mut().find(|(g, _)| *g == key) {
                Some((_, members)) => members.push(idx),
                None => groups.push((key, vec![idx])),
            },
            None => wildcards.push(idx),
        }
    }

    if groups.is_empty() {
        return Err(FlowError::Relationship {
            stage: stage.to_string(),
            message: format!(
                "no parent task has all of the reduce_by keys [{}]",
                reduce_by.join(", ")
            ),
        });
    }

    for idx in wildcards {
        let tags = parents[idx].1;
        let mut attached = false;
        for (key, members) in groups.iter_mut() {
            let compatible = tags
                .iter()
                .filter(|(k, _)| key.contains_key(*k))
                .all(|(k, v)| key.get(k) == Some(v));
            if compatible {
                members.push(idx);
                attached = true;
            }
        }
        if !attached {
            debug!(stage, tags = %format_tags(tags), "wildcard parent matches no group");
        }
    }

    Ok(groups
        .into_iter()
        .map(|(tags, mut members)| {
            members.sort_unstable();
            Group {
                tags,
                members: members.into_iter().map(|i| parents[i].0).collect(),
            }
        })
        .collect())
}
