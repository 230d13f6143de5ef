//! # Kustomize Controller
//!
//! A declarative continuous-delivery reconciler for Kubernetes. Users
//! declare `Kustomization` objects describing where a bundle of manifests
//! lives (a source artifact), how to render it, where to apply it, and how
//! to verify it; the controller continually drives the cluster toward that
//! state:
//!
//! 1. **Fetch** — download and verify the source artifact tarball
//! 2. **Decrypt** — rewrite SOPS envelopes in the scratch tree
//! 3. **Build** — render the kustomize overlay into an object stream
//! 4. **Validate** — structural checks or a server-side dry-run
//! 5. **Apply** — server-side apply with a stable field manager
//! 6. **Prune** — garbage-collect orphans against the inventory snapshot
//! 7. **Health check** — wait for declared objects to report ready
//!
//! Cross-namespace `dependsOn` references gate scheduling; remote clusters
//! and service-account impersonation select the execution context.

pub mod cli;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod runtime;

pub use crd::{Kustomization, KustomizationSpec, KustomizationStatus, ObjectIdentity, Snapshot};
