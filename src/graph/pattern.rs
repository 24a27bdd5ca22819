// src/graph/pattern.rs

//! Relationship patterns between a stage and its parent stages.

use std::fmt;
use std::sync::Arc;

use crate::types::{PatternKind, TagValue, Tags};

/// Caller-supplied split generator: parent (or group) tags → split tag sets.
pub type SplitFn = Arc<dyn Fn(&Tags) -> Vec<Tags> + Send + Sync>;

/// The space a one-to-many split enumerates.
#[derive(Clone)]
pub enum SplitSpace {
    /// Cartesian product of `key → values`, in declared key order.
    Product(Vec<(String, Vec<TagValue>)>),
    Generator(SplitFn),
}

impl fmt::Debug for SplitSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitSpace::Product(dims) => f.debug_tuple("Product").field(dims).finish(),
            SplitSpace::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

impl SplitSpace {
    pub fn product<K, I>(dims: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Vec<TagValue>)>,
    {
        SplitSpace::Product(dims.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn generator<F>(f: F) -> Self
    where
        F: Fn(&Tags) -> Vec<Tags> + Send + Sync + 'static,
    {
        SplitSpace::Generator(Arc::new(f))
    }

    /// Enumerate split combinations for one parent or reduced group.
    ///
    /// The first declared key varies slowest.
    pub fn combinations(&self, base: &Tags) -> Vec<Tags> {
        match self {
            SplitSpace::Generator(f) => f(base),
            SplitSpace::Product(dims) => {
                let mut result = vec![Tags::new()];
                for (key, values) in dims {
                    let mut next = Vec::with_capacity(result.len() * values.len());
                    for combo in &result {
                        for value in values {
                            let mut c = combo.clone();
                            c.insert(key.clone(), value.clone());
                            next.push(c);
                        }
                    }
                    result = next;
                }
                result
            }
        }
    }
}

/// How a stage's tasks derive from its parent stages' tasks.
#[derive(Debug, Clone)]
pub enum RelationshipPattern {
    /// One child per parent task.
    OneToOne,
    /// One child per group of parents sharing `reduce_by` values.
    ManyToOne { reduce_by: Vec<String> },
    /// One child per (parent task × split combination).
    OneToMany { split_by: SplitSpace },
    /// Reduce, then split each group.
    ManyToMany {
        reduce_by: Vec<String>,
        split_by: SplitSpace,
    },
}

impl RelationshipPattern {
    pub fn kind(&self) -> PatternKind {
        match self {
            RelationshipPattern::OneToOne => PatternKind::OneToOne,
            RelationshipPattern::ManyToOne { .. } => PatternKind::ManyToOne,
            RelationshipPattern::OneToMany { .. } => PatternKind::OneToMany,
            RelationshipPattern::ManyToMany { .. } => PatternKind::ManyToMany,
        }
    }

    pub fn many_to_one<K: Into<String>>(keys: impl IntoIterator<Item = K>) -> Self {
        RelationshipPattern::ManyToOne {
            reduce_by: keys.into_iter().map(Into::into).collect(),
        }
    }

    pub fn one_to_many(split_by: SplitSpace) -> Self {
        RelationshipPattern::OneToMany { split_by }
    }

    pub fn many_to_many<K: Into<String>>(keys: impl IntoIterator<Item = K>, split_by: SplitSpace) -> Self {
        RelationshipPattern::ManyToMany {
            reduce_by: keys.into_iter().map(Into::into).collect(),
            split_by,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tags;

    #[test]
    fn product_varies_first_key_slowest() {
        let space = SplitSpace::product([
            ("chrom", vec![TagValue::from("1"), TagValue::from("2")]),
            ("shard", vec![TagValue::from(1), TagValue::from(2), TagValue::from(3)]),
        ]);
        let combos = space.combinations(&Tags::new());
        assert_eq!(combos.len(), 6);
        assert_eq!(combos[0], tags([("chrom", TagValue::from("1")), ("shard", TagValue::from(1))]));
        assert_eq!(combos[3], tags([("chrom", TagValue::from("2")), ("shard", TagValue::from(1))]));
    }

    #[test]
    fn empty_product_yields_one_empty_combination() {
        assert_eq!(SplitSpace::Product(vec![]).combinations(&Tags::new()), vec![Tags::new()]);
    }

    #[test]
    fn generator_sees_parent_tags() {
        let space = SplitSpace::generator(|base| {
            let n = match base.get("n") {
                Some(TagValue::Int(n)) => *n,
                _ => 0,
            };
            (0..n).map(|i| tags([("i", i)])).collect()
        });
        assert_eq!(space.combinations(&tags([("n", 3)])).len(), 3);
        assert_eq!(format!("{space:?}"), "Generator(..)");
    }
}
