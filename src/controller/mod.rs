//! # Controller
//!
//! Reconciliation logic and event publishing for Kustomization resources.

pub mod events;
pub mod reconciler;
