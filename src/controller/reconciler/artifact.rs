//! # Artifact Fetching
//!
//! Resolves the source object referenced by `spec.sourceRef`, downloads the
//! tarball it advertises, verifies the checksum byte-exactly, and unpacks it
//! into a per-reconcile scratch directory.

use crate::constants;
use crate::crd::Kustomization;
use anyhow::{Context, Result};
use futures::StreamExt;
use kube::api::ApiResource;
use kube::core::{DynamicObject, GroupVersionKind};
use kube::Client;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Descriptor of a source artifact as advertised on the source object's
/// status sub-resource.
#[derive(Debug, Clone)]
pub struct SourceArtifact {
    /// HTTP(S) endpoint serving the tarball.
    pub url: String,
    /// Revision identifier, e.g. `main/abc123` or `main@sha1:abc123`.
    pub revision: String,
    /// Expected digest of the tarball, `sha256:<hex>` when present.
    pub digest: Option<String>,
}

/// Per-reconcile scratch directory with guaranteed removal on all exit
/// paths: the directory is deleted when the guard drops, including on panic
/// at the worker boundary.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create a fresh scratch directory under the controller scratch root,
    /// keyed by the Kustomization identity. A leftover tree from a crashed
    /// run is removed first.
    pub async fn create(namespace: &str, name: &str) -> Result<Self> {
        let path = PathBuf::from(constants::SCRATCH_BASE_PATH)
            .join(sanitize_path_component(namespace))
            .join(sanitize_path_component(name));

        if path.exists() {
            tokio::fs::remove_dir_all(&path)
                .await
                .with_context(|| format!("failed to clear stale scratch dir {}", path.display()))?;
        }
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("failed to create scratch dir {}", path.display()))?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "failed to remove scratch dir {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// Replace characters that are unsafe in a path component.
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Look up the source object referenced by `spec.sourceRef` and read its
/// artifact descriptor. The source must exist and carry a true Ready
/// condition; anything else is an artifact failure.
pub async fn read_source_artifact(client: &Client, ks: &Kustomization) -> Result<SourceArtifact> {
    let source_ref = &ks.spec.source_ref;
    let namespace = ks.source_namespace();

    let ar = ApiResource::from_gvk(&GroupVersionKind {
        group: constants::SOURCE_GROUP.to_string(),
        version: constants::SOURCE_VERSION.to_string(),
        kind: source_ref.kind.clone(),
    });
    let api: kube::Api<DynamicObject> = kube::Api::namespaced_with(client.clone(), &namespace, &ar);

    let source = api.get(&source_ref.name).await.with_context(|| {
        format!(
            "failed to get source {} {}/{}",
            source_ref.kind, namespace, source_ref.name
        )
    })?;

    let status = source
        .data
        .get("status")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    let ready = status
        .get("conditions")
        .and_then(|c| c.as_array())
        .and_then(|conds| {
            conds
                .iter()
                .find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Ready"))
        })
        .and_then(|c| c.get("status").and_then(|s| s.as_str()))
        .unwrap_or("Unknown");
    if ready != "True" {
        return Err(anyhow::anyhow!(
            "source {} {}/{} is not ready (Ready={})",
            source_ref.kind,
            namespace,
            source_ref.name,
            ready
        ));
    }

    let artifact = status.get("artifact").with_context(|| {
        format!(
            "source {} {}/{} has no artifact in status",
            source_ref.kind, namespace, source_ref.name
        )
    })?;

    let url = artifact
        .get("url")
        .and_then(|u| u.as_str())
        .context("source artifact has no url")?
        .to_string();
    let revision = artifact
        .get("revision")
        .and_then(|r| r.as_str())
        .context("source artifact has no revision")?
        .to_string();
    // Newer source controllers advertise `digest`, older ones `checksum`.
    let digest = artifact
        .get("digest")
        .or_else(|| artifact.get("checksum"))
        .and_then(|d| d.as_str())
        .map(str::to_string);

    Ok(SourceArtifact {
        url,
        revision,
        digest,
    })
}

/// Download the artifact tarball, verify its checksum byte-exactly, and
/// unpack it into the scratch directory.
pub async fn fetch_artifact(artifact: &SourceArtifact, scratch: &Path) -> Result<()> {
    let temp_tar = scratch.join("artifact.tar.gz");

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .context("failed to create HTTP client")?;

    info!(
        "downloading artifact from {} (revision: {})",
        artifact.url, artifact.revision
    );

    let response = client
        .get(&artifact.url)
        .send()
        .await
        .with_context(|| format!("failed to download artifact from {}", artifact.url))?;

    if !response.status().is_success() {
        let status = response.status();
        return Err(anyhow::anyhow!(
            "artifact download returned HTTP {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        ));
    }

    // Stream to disk so large artifacts never live in memory, and so a
    // short read is detectable against Content-Length.
    let expected_size = response.content_length();
    let mut file = tokio::fs::File::create(&temp_tar)
        .await
        .with_context(|| format!("failed to create {}", temp_tar.display()))?;

    let mut hasher = Sha256::new();
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("failed to read chunk from download stream")?;
        downloaded += chunk.len() as u64;
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .context("failed to write chunk to file")?;
    }
    file.flush().await?;
    drop(file);

    if let Some(expected) = expected_size {
        if downloaded != expected {
            return Err(anyhow::anyhow!(
                "partial download: expected {expected} bytes, got {downloaded}"
            ));
        }
    }
    if downloaded == 0 {
        return Err(anyhow::anyhow!("downloaded artifact is empty"));
    }

    // Byte-exact checksum verification before unpacking anything.
    if let Some(expected_digest) = &artifact.digest {
        let computed = format!("sha256:{:x}", hasher.finalize());
        let expected = if expected_digest.contains(':') {
            expected_digest.clone()
        } else {
            format!("sha256:{expected_digest}")
        };
        if expected != computed {
            return Err(anyhow::anyhow!(
                "artifact checksum mismatch: expected {expected}, got {computed}"
            ));
        }
        debug!("artifact checksum verified: {computed}");
    }

    verify_gzip_magic(&temp_tar).await?;

    let unpack_dir = unpack_path(scratch);
    tokio::fs::create_dir_all(&unpack_dir)
        .await
        .context("failed to create unpack directory")?;

    let output = tokio::process::Command::new("tar")
        .arg("-xzf")
        .arg(&temp_tar)
        .arg("-C")
        .arg(&unpack_dir)
        .arg("--warning=no-unknown-keyword")
        .output()
        .await
        .context("failed to execute tar")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!(
            "failed to extract artifact (corrupt or invalid tar.gz): {stderr}"
        ));
    }

    tokio::fs::remove_file(&temp_tar)
        .await
        .context("failed to remove downloaded tarball")?;

    let mut entries = tokio::fs::read_dir(&unpack_dir)
        .await
        .context("failed to read unpacked directory")?;
    if entries.next_entry().await?.is_none() {
        return Err(anyhow::anyhow!("artifact extraction produced an empty tree"));
    }

    Ok(())
}

/// Directory within the scratch dir holding the unpacked tree. Kept apart
/// from the tarball so `spec.path` cannot collide with the download.
pub fn unpack_path(scratch: &Path) -> PathBuf {
    scratch.join("source")
}

/// tar.gz files start with the gzip magic bytes 1f 8b; rejecting anything
/// else avoids feeding arbitrary payloads to tar.
async fn verify_gzip_magic(path: &Path) -> Result<()> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut magic = [0u8; 2];
    file.read_exact(&mut magic)
        .await
        .context("artifact is too short to be a tar.gz")?;
    if magic != [0x1f, 0x8b] {
        return Err(anyhow::anyhow!(
            "invalid artifact format: expected gzip, got magic bytes {:02x}{:02x}",
            magic[0],
            magic[1]
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("dev"), "dev");
        assert_eq!(sanitize_path_component("a/b:c"), "a_b_c");
        assert_eq!(sanitize_path_component("feature/x y"), "feature_x_y");
    }

    #[tokio::test]
    async fn test_scratch_dir_removed_on_drop() {
        let scratch = ScratchDir::create("test-ns", "test-name").await.unwrap();
        let path = scratch.path().to_path_buf();
        assert!(path.exists());
        drop(scratch);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_scratch_dir_clears_stale_tree() {
        let scratch = ScratchDir::create("test-ns", "stale").await.unwrap();
        tokio::fs::write(scratch.path().join("leftover"), b"x")
            .await
            .unwrap();
        let path = scratch.path().to_path_buf();
        std::mem::forget(scratch);

        let fresh = ScratchDir::create("test-ns", "stale").await.unwrap();
        assert!(!path.join("leftover").exists());
        drop(fresh);
    }
}
