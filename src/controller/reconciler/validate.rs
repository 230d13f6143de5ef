//! # Validation
//!
//! Spec admission checks for Kustomization resources, Kubernetes duration
//! parsing, and validation of the built manifest stream (client-side
//! structural checks or a server-side dry-run).

use crate::constants;
use crate::controller::reconciler::apply;
use crate::controller::reconciler::cluster::TargetCluster;
use crate::crd::Kustomization;
use anyhow::{Context, Result};
use kube::api::{Patch, PatchParams};
use kube::core::DynamicObject;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static DURATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$").expect("duration regex is valid")
});

/// Parse a Kubernetes duration string into std::time::Duration.
/// Supports formats: "30s", "1m", "5m", "1h", "1d".
pub fn parse_kubernetes_duration(duration_str: &str) -> Result<Duration> {
    let trimmed = duration_str.trim();

    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("duration string cannot be empty"));
    }

    let lower = trimmed.to_lowercase();
    let captures = DURATION_REGEX.captures(&lower).ok_or_else(|| {
        anyhow::anyhow!(
            "invalid duration format '{trimmed}'. Expected <number><unit> (e.g., '1m', '5m', '1h')"
        )
    })?;

    let number: u64 = captures["number"]
        .parse()
        .with_context(|| format!("invalid duration number in '{trimmed}'"))?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "duration must be greater than 0, got '{trimmed}'"
        ));
    }

    let seconds = match &captures["unit"] {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        "d" => number * 86400,
        unit => {
            return Err(anyhow::anyhow!(
                "invalid unit '{unit}' in duration '{trimmed}'. Expected: s, m, h, or d"
            ));
        }
    };

    Ok(Duration::from_secs(seconds))
}

/// Admission checks on the Kustomization spec. Failures here are permanent:
/// the object is rejected until the user edits the spec.
pub fn validate_spec(ks: &Kustomization) -> Result<()> {
    if ks.spec.source_ref.name.is_empty() {
        return Err(anyhow::anyhow!("sourceRef.name is required but is empty"));
    }

    if !ks.spec.path.starts_with("./") {
        return Err(anyhow::anyhow!(
            "path '{}' must be relative and begin with './'",
            ks.spec.path
        ));
    }
    if ks.spec.path.split('/').any(|seg| seg == "..") {
        return Err(anyhow::anyhow!(
            "path '{}' must not traverse outside the artifact",
            ks.spec.path
        ));
    }

    let interval = parse_kubernetes_duration(&ks.spec.interval)
        .with_context(|| format!("invalid interval '{}'", ks.spec.interval))?;
    if interval.as_secs() < constants::MIN_INTERVAL_SECS {
        return Err(anyhow::anyhow!(
            "interval must be at least 60 seconds, got '{}' ({}s)",
            ks.spec.interval,
            interval.as_secs()
        ));
    }

    if let Some(timeout) = &ks.spec.timeout {
        parse_kubernetes_duration(timeout).with_context(|| format!("invalid timeout '{timeout}'"))?;
    }

    match ks.spec.validation.as_str() {
        "none" | "client" | "server" => {}
        other => {
            return Err(anyhow::anyhow!(
                "validation mode '{other}' is not supported; expected none, client or server"
            ));
        }
    }

    if let Some(decryption) = &ks.spec.decryption {
        if decryption.provider != "sops" {
            return Err(anyhow::anyhow!(
                "decryption provider '{}' is not supported; only sops",
                decryption.provider
            ));
        }
    }

    for dep in &ks.spec.depends_on {
        if dep.name.is_empty() {
            return Err(anyhow::anyhow!("dependsOn entries must name a Kustomization"));
        }
    }

    Ok(())
}

/// Structural client-side validation of the built stream. Catches objects
/// the API server would reject before any network round-trip is spent.
pub fn validate_client(objects: &[serde_json::Value]) -> Result<()> {
    for obj in objects {
        let map = obj
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("manifest document is not an object"))?;

        let api_version = map
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("object is missing apiVersion"))?;

        let kind = map
            .get("kind")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("object with apiVersion {api_version} is missing kind")
            })?;

        let name = obj
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("{kind} object is missing metadata.name"))?;

        if name.len() > 253 {
            return Err(anyhow::anyhow!(
                "The {kind} '{name}' is invalid: metadata.name: must be no more than 253 characters"
            ));
        }

        if let Some(labels) = obj.pointer("/metadata/labels").and_then(|v| v.as_object()) {
            for (key, value) in labels {
                let value = value.as_str().ok_or_else(|| {
                    anyhow::anyhow!(
                        "The {kind} '{name}' is invalid: metadata.labels.{key}: must be a string"
                    )
                })?;
                if value.len() > 63 {
                    return Err(anyhow::anyhow!(
                        "The {kind} '{name}' is invalid: metadata.labels.{key}: must be no more than 63 characters"
                    ));
                }
            }
        }
    }

    Ok(())
}

/// Server-side validation: submit every object with `dryRun=All` against the
/// target API server. Aborts on the first rejection, naming the offending
/// object and the API server's message.
pub async fn validate_server(
    target: &TargetCluster,
    ks: &Kustomization,
    objects: &[serde_json::Value],
) -> Result<()> {
    let mut params = PatchParams::apply(&apply::field_manager(ks)).force();
    params.dry_run = true;

    for obj in objects {
        let (api, name, display) = apply::dynamic_api_for(target, ks, obj)?;
        let dynamic: DynamicObject = serde_json::from_value(obj.clone())
            .with_context(|| format!("failed to convert {display} for dry-run"))?;

        api.patch(&name, &params, &Patch::Apply(&dynamic))
            .await
            .map_err(|e| anyhow::anyhow!("dry-run rejected {display}: {e}"))?;
    }

    Ok(())
}
