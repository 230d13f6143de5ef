//! # Dependency Scheduling
//!
//! Gates reconciliations on cross-namespace readiness of other
//! Kustomizations and triggers dependents on completion. The graph is held
//! as two indexes (forward: K → deps, reverse: dep → dependents) and is
//! never walked recursively at reconcile time — the readiness check is a
//! single-hop query per direct dependency, which bottoms out along the DAG
//! as each layer completes.

use crate::crd::Kustomization;
use anyhow::Result;
use kube::api::Api;
use kube::Client;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Key of a Kustomization in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn of(ks: &Kustomization) -> Self {
        Self {
            namespace: ks
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            name: ks.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Forward and reverse dependency indexes. Process-wide, guarded by the
/// reconciler context's mutex.
#[derive(Debug, Default)]
pub struct DependencyIndex {
    forward: HashMap<NamespacedName, Vec<NamespacedName>>,
    reverse: HashMap<NamespacedName, HashSet<NamespacedName>>,
}

impl DependencyIndex {
    /// Record the dependencies of one Kustomization, replacing any previous
    /// edges. Returns the back-edges found, if the new edges close a cycle —
    /// callers SHOULD surface those as warning events; cycle members simply
    /// never become eligible.
    pub fn update(&mut self, ks: &Kustomization) -> Vec<NamespacedName> {
        let key = NamespacedName::of(ks);
        let deps: Vec<NamespacedName> = ks
            .spec
            .depends_on
            .iter()
            .map(|dep| NamespacedName {
                namespace: dep
                    .namespace
                    .clone()
                    .unwrap_or_else(|| key.namespace.clone()),
                name: dep.name.clone(),
            })
            .collect();

        self.remove(&key);
        for dep in &deps {
            self.reverse.entry(dep.clone()).or_default().insert(key.clone());
        }
        self.forward.insert(key.clone(), deps.clone());

        // A dependency that can transitively reach us back makes the new
        // edge a back-edge.
        deps.into_iter()
            .filter(|dep| self.reaches(dep, &key))
            .collect()
    }

    /// Drop a Kustomization from both indexes.
    pub fn remove(&mut self, key: &NamespacedName) {
        if let Some(old_deps) = self.forward.remove(key) {
            for dep in old_deps {
                if let Some(dependents) = self.reverse.get_mut(&dep) {
                    dependents.remove(key);
                    if dependents.is_empty() {
                        self.reverse.remove(&dep);
                    }
                }
            }
        }
    }

    /// All direct dependents of a Kustomization, sorted for deterministic
    /// enqueue order.
    pub fn dependents_of(&self, key: &NamespacedName) -> Vec<NamespacedName> {
        let mut dependents: Vec<NamespacedName> = self
            .reverse
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        dependents.sort();
        dependents
    }

    /// Whether `to` is reachable from `from` along forward edges.
    fn reaches(&self, from: &NamespacedName, to: &NamespacedName) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(current) = queue.pop_front() {
            if &current == to {
                return true;
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(next) = self.forward.get(&current) {
                queue.extend(next.iter().cloned());
            }
        }
        false
    }
}

/// Why a Kustomization is not eligible to reconcile yet.
#[derive(Debug)]
pub struct DependencyNotReady {
    pub dependency: NamespacedName,
    pub reason: String,
}

impl fmt::Display for DependencyNotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency '{}' {}", self.dependency, self.reason)
    }
}

/// Single-hop eligibility check: every dependency must exist and be Ready
/// at its current generation. Returns the first blocker.
pub async fn check_dependencies(
    client: &Client,
    ks: &Kustomization,
) -> Result<(), DependencyNotReady> {
    let own_namespace = ks
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());

    for dep in &ks.spec.depends_on {
        let key = NamespacedName {
            namespace: dep.namespace.clone().unwrap_or_else(|| own_namespace.clone()),
            name: dep.name.clone(),
        };

        let api: Api<Kustomization> = Api::namespaced(client.clone(), &key.namespace);
        let target = match api.get_opt(&key.name).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                return Err(DependencyNotReady {
                    dependency: key,
                    reason: "does not exist".to_string(),
                });
            }
            Err(e) => {
                return Err(DependencyNotReady {
                    dependency: key,
                    reason: format!("lookup failed: {e}"),
                });
            }
        };

        if !is_ready_at_current_generation(&target) {
            return Err(DependencyNotReady {
                dependency: key,
                reason: "is not ready".to_string(),
            });
        }
    }

    Ok(())
}

/// Ready means the Ready condition is True AND the observed generation is
/// the object's current generation — a stale Ready from before a spec edit
/// does not count.
pub fn is_ready_at_current_generation(ks: &Kustomization) -> bool {
    let Some(status) = &ks.status else {
        return false;
    };
    if status.observed_generation != ks.metadata.generation {
        return false;
    }
    status
        .conditions
        .iter()
        .any(|c| c.r#type == "Ready" && c.status == "True")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Condition, KustomizationStatus};

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

    #[test]
    fn test_update_builds_reverse_index() {
        let mut index = DependencyIndex::default();
        let backend = kustomization("dev", "backend", &[("dev", "common")]);
        assert!(index.update(&backend).is_empty());

        let common_key = NamespacedName::new("dev", "common");
        assert_eq!(
            index.dependents_of(&common_key),
            vec![NamespacedName::new("dev", "backend")]
        );
    }

    #[test]
    fn test_update_replaces_previous_edges() {
        let mut index = DependencyIndex::default();
        index.update(&kustomization("dev", "backend", &[("dev", "common")]));
        index.update(&kustomization("dev", "backend", &[("dev", "infra")]));

        assert!(index
            .dependents_of(&NamespacedName::new("dev", "common"))
            .is_empty());
        assert_eq!(
            index.dependents_of(&NamespacedName::new("dev", "infra")),
            vec![NamespacedName::new("dev", "backend")]
        );
    }

    #[test]
    fn test_cycle_is_reported_as_back_edge() {
        let mut index = DependencyIndex::default();
        assert!(index
            .update(&kustomization("dev", "a", &[("dev", "b")]))
            .is_empty());
        assert!(index
            .update(&kustomization("dev", "b", &[("dev", "c")]))
            .is_empty());

        let back_edges = index.update(&kustomization("dev", "c", &[("dev", "a")]));
        assert_eq!(back_edges, vec![NamespacedName::new("dev", "a")]);
    }

    #[test]
    fn test_self_dependency_is_a_back_edge() {
        let mut index = DependencyIndex::default();
        let back_edges = index.update(&kustomization("dev", "a", &[("dev", "a")]));
        assert_eq!(back_edges, vec![NamespacedName::new("dev", "a")]);
    }

    #[test]
    fn test_remove_clears_dependents() {
        let mut index = DependencyIndex::default();
        index.update(&kustomization("dev", "backend", &[("dev", "common")]));
        index.remove(&NamespacedName::new("dev", "backend"));
        assert!(index
            .dependents_of(&NamespacedName::new("dev", "common"))
            .is_empty());
    }

    #[test]
    fn test_ready_requires_current_generation() {
        let mut ks = kustomization("dev", "common", &[]);
        ks.metadata.generation = Some(2);
        ks.status = Some(KustomizationStatus {
            observed_generation: Some(1),
            conditions: vec![Condition {
                r#type: "Ready".to_string(),
                status: "True".to_string(),
                last_transition_time: None,
                reason: None,
                message: None,
            }],
            ..Default::default()
        });
        assert!(!is_ready_at_current_generation(&ks));

        ks.status.as_mut().unwrap().observed_generation = Some(2);
        assert!(is_ready_at_current_generation(&ks));
    }

    #[test]
    fn test_not_ready_without_status() {
        let ks = kustomization("dev", "common", &[]);
        assert!(!is_ready_at_current_generation(&ks));
    }
}
