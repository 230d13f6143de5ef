//! # Event Publishing
//!
//! Emits Kubernetes Events on Kustomization objects. Events are
//! fire-and-forget: a failed publish is logged as a warning and never
//! breaks reconciliation. The event reason always matches the condition
//! reason written for the same outcome.

use crate::crd::Kustomization;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

pub struct EventPublisher {
    recorder: Recorder,
}

impl EventPublisher {
    /// The controller name appears as the reporting component on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn publish_normal(&self, ks: &Kustomization, reason: &str, note: String) {
        self.publish(ks, EventType::Normal, reason, note).await;
    }

    pub async fn publish_warning(&self, ks: &Kustomization, reason: &str, note: String) {
        self.publish(ks, EventType::Warning, reason, note).await;
    }

    async fn publish(&self, ks: &Kustomization, type_: EventType, reason: &str, note: String) {
        let reference = ks.object_ref(&());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(reason, error = %e, "failed to publish Kubernetes event");
        }
    }
}
