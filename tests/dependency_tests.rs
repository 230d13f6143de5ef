//! # Dependency Scheduler Tests
//!
//! Covers eligibility and cycle behavior of the dependency graph: Ready at
//! the current generation is the only thing that unblocks a dependent, and
//! cycle members are flagged via back-edge detection during index
//! maintenance.

use kustomize_controller::controller::reconciler::deps::{
    is_ready_at_current_generation, DependencyIndex, NamespacedName,
};
use kustomize_controller::crd::{Condition, Kustomization, KustomizationStatus};

fn kustomization(namespace: &str, name: &str, deps: &[(&str, &str)]) -> Kustomization {
    let depends_on: String = deps
        .iter()
        .map(|(ns, n)| format!("    - name: {n}\n      namespace: {ns}\n"))
        .collect();
    let deps_block = if deps.is_empty() {
        String::new()
    } else {
        format!("  dependsOn:\n{depends_on}")
    };
    serde_yaml::from_str(&format!(
        r#"
apiVersion: kustomize.toolkit.fluxcd.io/v1beta1
kind: Kustomization
metadata:
  name: {name}
  namespace: {namespace}
spec:
  sourceRef:
    name: webapp
  interval: 5m
{deps_block}
"#
    ))
    .unwrap()
}

fn ready_status(observed_generation: i64) -> KustomizationStatus {
    KustomizationStatus {
        observed_generation: Some(observed_generation),
        conditions: vec![Condition {
            r#type: "Ready".to_string(),
            status: "True".to_string(),
            last_transition_time: None,
            reason: Some("ReconciliationSucceeded".to_string()),
            message: None,
        }],
        ..Default::default()
    }
}

#[test]
fn test_dependents_enqueued_from_reverse_index() {
    let mut index = DependencyIndex::default();
    index.update(&kustomization("dev", "backend", &[("dev", "common")]));
    index.update(&kustomization("dev", "frontend", &[("dev", "common")]));
    index.update(&kustomization("prod", "unrelated", &[]));

    let dependents = index.dependents_of(&NamespacedName::new("dev", "common"));
    assert_eq!(
        dependents,
        vec![
            NamespacedName::new("dev", "backend"),
            NamespacedName::new("dev", "frontend"),
        ]
    );
}

#[test]
fn test_two_member_cycle_is_detected_on_the_closing_edge() {
    let mut index = DependencyIndex::default();
    assert!(index
        .update(&kustomization("dev", "a", &[("dev", "b")]))
        .is_empty());

    let back_edges = index.update(&kustomization("dev", "b", &[("dev", "a")]));
    assert_eq!(back_edges, vec![NamespacedName::new("dev", "a")]);
}

#[test]
fn test_cycle_broken_by_spec_edit() {
    let mut index = DependencyIndex::default();
    index.update(&kustomization("dev", "a", &[("dev", "b")]));
    let back_edges = index.update(&kustomization("dev", "b", &[("dev", "a")]));
    assert!(!back_edges.is_empty());

    // User removes b's dependency; re-indexing a reports no back-edge.
    index.update(&kustomization("dev", "b", &[]));
    assert!(index
        .update(&kustomization("dev", "a", &[("dev", "b")]))
        .is_empty());
}

#[test]
fn test_diamond_is_not_a_cycle() {
    let mut index = DependencyIndex::default();
    assert!(index
        .update(&kustomization("dev", "b", &[("dev", "d")]))
        .is_empty());
    assert!(index
        .update(&kustomization("dev", "c", &[("dev", "d")]))
        .is_empty());
    assert!(index
        .update(&kustomization("dev", "a", &[("dev", "b"), ("dev", "c")]))
        .is_empty());
}

#[test]
fn test_dependency_without_status_is_not_ready() {
    let common = kustomization("dev", "common", &[]);
    assert!(!is_ready_at_current_generation(&common));
}

#[test]
fn test_dependency_ready_at_current_generation() {
    let mut common = kustomization("dev", "common", &[]);
    common.metadata.generation = Some(3);
    common.status = Some(ready_status(3));
    assert!(is_ready_at_current_generation(&common));
}

#[test]
fn test_stale_ready_does_not_unblock() {
    // A spec edit bumped the generation; the old Ready no longer counts.
    let mut common = kustomization("dev", "common", &[]);
    common.metadata.generation = Some(4);
    common.status = Some(ready_status(3));
    assert!(!is_ready_at_current_generation(&common));
}

#[test]
fn test_ready_false_does_not_unblock() {
    let mut common = kustomization("dev", "common", &[]);
    common.metadata.generation = Some(1);
    let mut status = ready_status(1);
    status.conditions[0].status = "False".to_string();
    common.status = Some(status);
    assert!(!is_ready_at_current_generation(&common));
}
