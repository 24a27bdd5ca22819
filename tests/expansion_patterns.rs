// tests/expansion_patterns.rs

use drmflow::errors::FlowError;
use drmflow::graph::{RelationshipPattern, SplitSpace, StageTemplate};
use drmflow::model::{Workflow, WorkflowSettings};
use drmflow::types::{TagValue, Tags, tags};
use proptest::prelude::*;

fn wf() -> Workflow {
    Workflow::new("expand", WorkflowSettings::default())
}

fn uids(wf: &Workflow, stage: &str) -> Vec<String> {
    let id = wf.stage_id(stage).unwrap();
    wf.stage_tasks(id).iter().map(|t| t.uid.clone()).collect()
}

fn parent_uids(wf: &Workflow, stage: &str, uid: &str) -> Vec<String> {
    let task = wf.task_by_uid(stage, uid).unwrap();
    task.parents
        .iter()
        .map(|p| wf.task(*p).unwrap().uid.clone())
        .collect()
}

#[test]
fn reduce_groups_parents_sharing_the_keys() {
    let mut w = wf();
    let src = w
        .add_stage_with_tasks(
            "src",
            &[],
            &[
                tags([("a", 1), ("b", 2), ("c", 5)]),
                tags([("a", 1), ("b", 2), ("c", 6)]),
                tags([("a", 1), ("b", 2)]),
            ],
            &Tags::new(),
            &StageTemplate::command("make {a}"),
        )
        .unwrap();

    w.add_stage_from_pattern(
        "merged",
        &[src],
        &RelationshipPattern::many_to_one(["a", "b"]),
        &Tags::new(),
        &StageTemplate::command("merge {a} {b}"),
    )
    .unwrap();

    assert_eq!(uids(&w, "merged"), ["a=1__b=2"]);
    assert_eq!(parent_uids(&w, "merged", "a=1__b=2").len(), 3);
    assert_eq!(
        w.task_by_uid("merged", "a=1__b=2").unwrap().command.as_deref(),
        Some("merge 1 2")
    );
}

#[test]
fn parent_missing_a_reduce_key_joins_every_compatible_group() {
    let mut w = wf();
    let src = w
        .add_stage_with_tasks(
            "src",
            &[],
            &[
                tags([("a", 1), ("b", 1)]),
                tags([("a", 1), ("b", 2)]),
                tags([("a", 2), ("b", 1)]),
                tags([("a", 1)]),
            ],
            &Tags::new(),
            &StageTemplate::default(),
        )
        .unwrap();

    w.add_stage_from_pattern(
        "merged",
        &[src],
        &RelationshipPattern::many_to_one(["a", "b"]),
        &Tags::new(),
        &StageTemplate::default(),
    )
    .unwrap();

    assert_eq!(uids(&w, "merged"), ["a=1__b=1", "a=1__b=2", "a=2__b=1"]);
    assert_eq!(parent_uids(&w, "merged", "a=1__b=1"), ["a=1__b=1", "a=1"]);
    assert_eq!(parent_uids(&w, "merged", "a=1__b=2"), ["a=1__b=2", "a=1"]);
    assert_eq!(parent_uids(&w, "merged", "a=2__b=1"), ["a=2__b=1"]);
}

#[test]
fn many_to_many_splits_each_group() {
    let mut w = wf();
    let src = w
        .add_stage_with_tasks(
            "src",
            &[],
            &[
                tags([("sample", TagValue::from("x")), ("lane", TagValue::from(1))]),
                tags([("sample", TagValue::from("x")), ("lane", TagValue::from(2))]),
                tags([("sample", TagValue::from("y")), ("lane", TagValue::from(1))]),
            ],
            &Tags::new(),
            &StageTemplate::default(),
        )
        .unwrap();

    let split = SplitSpace::product([("chrom", vec![TagValue::from("1"), TagValue::from("2")])]);
    w.add_stage_from_pattern(
        "call",
        &[src],
        &RelationshipPattern::many_to_many(["sample"], split),
        &tags([("tool", "gatk")]),
        &StageTemplate::command("call {sample} {chrom}"),
    )
    .unwrap();

    assert_eq!(
        uids(&w, "call"),
        [
            "chrom=1__sample=x__tool=gatk",
            "chrom=2__sample=x__tool=gatk",
            "chrom=1__sample=y__tool=gatk",
            "chrom=2__sample=y__tool=gatk",
        ]
    );
    assert_eq!(parent_uids(&w, "call", "chrom=2__sample=x__tool=gatk").len(), 2);
    assert_eq!(parent_uids(&w, "call", "chrom=1__sample=y__tool=gatk").len(), 1);
}

#[test]
fn one_to_many_generator_sees_parent_tags() {
    let mut w = wf();
    let src = w
        .add_stage_with_tasks(
            "src",
            &[],
            &[tags([("n", 2)]), tags([("n", 3)])],
            &Tags::new(),
            &StageTemplate::default(),
        )
        .unwrap();

    let split = SplitSpace::generator(|parent: &Tags| {
        let n = match parent.get("n") {
            Some(TagValue::Int(n)) => *n,
            _ => 0,
        };
        (0..n).map(|i| tags([("part", i)])).collect()
    });
    w.add_stage_from_pattern(
        "parts",
        &[src],
        &RelationshipPattern::one_to_many(split),
        &Tags::new(),
        &StageTemplate::default(),
    )
    .unwrap();

    assert_eq!(uids(&w, "parts").len(), 5);
    assert_eq!(parent_uids(&w, "parts", "n=3__part=2"), ["n=3"]);
}

#[test]
fn reduce_without_any_full_key_is_a_relationship_error() {
    let mut w = wf();
    let src = w
        .add_stage_with_tasks(
            "src",
            &[],
            &[tags([("a", 1)])],
            &Tags::new(),
            &StageTemplate::default(),
        )
        .unwrap();

    let err = w
        .add_stage_from_pattern(
            "merged",
            &[src],
            &RelationshipPattern::many_to_one(["missing"]),
            &Tags::new(),
            &StageTemplate::default(),
        )
        .unwrap_err();
    assert!(matches!(err, FlowError::Relationship { stage, .. } if stage == "merged"));
}

#[test]
fn extra_tags_collapsing_children_are_duplicates() {
    let mut w = wf();
    let src = w
        .add_stage_with_tasks(
            "src",
            &[],
            &[tags([("x", 1)]), tags([("x", 2)])],
            &Tags::new(),
            &StageTemplate::default(),
        )
        .unwrap();

    let err = w
        .add_stage_from_pattern(
            "flat",
            &[src],
            &RelationshipPattern::OneToOne,
            &tags([("x", 0)]),
            &StageTemplate::default(),
        )
        .unwrap_err();
    assert!(matches!(err, FlowError::DuplicateTags { stage, .. } if stage == "flat"));
}

#[test]
fn unknown_template_tag_is_rejected() {
    let mut w = wf();
    let err = w
        .add_stage_with_tasks(
            "src",
            &[],
            &[tags([("x", 1)])],
            &Tags::new(),
            &StageTemplate::command("run {y}"),
        )
        .unwrap_err();
    assert!(matches!(err, FlowError::ConfigError(ref m) if m.contains("'y'")), "got {err:?}");
}

fn tag_set() -> impl Strategy<Value = Tags> {
    prop::collection::btree_map(
        prop::sample::select(vec!["a", "b", "c"]).prop_map(str::to_string),
        (0i64..3).prop_map(TagValue::from),
        0..3,
    )
}

proptest! {
    #[test]
    fn tag_sets_stay_unique_within_a_stage(parents in prop::collection::vec(tag_set(), 1..8)) {
        let mut unique: Vec<Tags> = Vec::new();
        for t in parents {
            if !unique.contains(&t) {
                unique.push(t);
            }
        }

        let mut w = wf();
        let src = w
            .add_stage_with_tasks("src", &[], &unique, &Tags::new(), &StageTemplate::default())
            .unwrap();

        let outcome = w.add_stage_from_pattern(
            "merged",
            &[src],
            &RelationshipPattern::many_to_one(["a"]),
            &Tags::new(),
            &StageTemplate::default(),
        );

        match outcome {
            Ok(stage) => {
                let tasks = w.stage_tasks(stage);
                for (i, t) in tasks.iter().enumerate() {
                    prop_assert!(!tasks[i + 1..].iter().any(|o| o.tags == t.tags));
                    prop_assert!(!t.parents.is_empty());
                }
            }
            Err(e) => {
                let is_relationship = matches!(e, FlowError::Relationship { .. });
                prop_assert!(is_relationship);
                prop_assert!(unique.iter().all(|t| !t.contains_key("a")));
            }
        }
    }
}
