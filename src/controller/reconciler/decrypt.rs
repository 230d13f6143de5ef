//! # Decryption
//!
//! Walks the scratch tree and decrypts SOPS envelopes in place before the
//! build runs. Key material comes from the secret named by
//! `spec.decryption.secretRef`; every data value is a candidate private key.
//! Plaintext never leaves the scratch directory.

use crate::crd::Kustomization;
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Private keys extracted from the decryption secret.
#[derive(Debug, Default)]
pub struct DecryptionKeys {
    /// age identities (`AGE-SECRET-KEY-...`), passed via `SOPS_AGE_KEY`.
    pub age_keys: Vec<String>,
    /// ASCII-armored PGP private key blocks, imported into a scratch
    /// keyring.
    pub pgp_keys: Vec<String>,
}

impl DecryptionKeys {
    pub fn is_empty(&self) -> bool {
        self.age_keys.is_empty() && self.pgp_keys.is_empty()
    }
}

/// Check if content is a SOPS envelope by looking for the SOPS metadata
/// block: a `sops:` key in YAML, a `"sops"` key in JSON, or `ENC[AES256_GCM`
/// value markers in dotenv-style files.
pub fn is_sops_encrypted(content: &str) -> bool {
    if let Ok(yaml) = serde_yaml::from_str::<serde_yaml::Value>(content) {
        if yaml
            .as_mapping()
            .and_then(|m| m.get(serde_yaml::Value::String("sops".to_string())))
            .is_some()
        {
            return true;
        }
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(content) {
        if json.get("sops").is_some() {
            return true;
        }
    }

    if content.contains("ENC[") && content.contains("AES256_GCM") {
        return true;
    }

    false
}

/// Load candidate private keys from the decryption secret in the
/// Kustomization's namespace. A missing secretRef yields empty keys; a
/// missing secret is a hard failure.
pub async fn load_decryption_keys(client: &Client, ks: &Kustomization) -> Result<DecryptionKeys> {
    let Some(decryption) = &ks.spec.decryption else {
        return Ok(DecryptionKeys::default());
    };
    let Some(secret_ref) = &decryption.secret_ref else {
        return Ok(DecryptionKeys::default());
    };

    let namespace = ks
        .metadata
        .namespace
        .as_deref()
        .unwrap_or("default")
        .to_string();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);

    let secret = secrets.get(&secret_ref.name).await.with_context(|| {
        format!(
            "failed to get decryption secret {}/{}",
            namespace, secret_ref.name
        )
    })?;

    let mut keys = DecryptionKeys::default();
    if let Some(data) = &secret.data {
        for (key_name, value) in data {
            let Ok(text) = String::from_utf8(value.0.clone()) else {
                debug!("decryption secret key {key_name} is not UTF-8, skipping");
                continue;
            };
            if text.contains("AGE-SECRET-KEY-") {
                keys.age_keys.push(text.trim().to_string());
            } else if text.contains("BEGIN PGP PRIVATE KEY BLOCK") {
                keys.pgp_keys.push(text);
            } else {
                debug!("decryption secret key {key_name} is not a recognized private key, skipping");
            }
        }
    }

    if keys.is_empty() {
        return Err(anyhow::anyhow!(
            "decryption secret {}/{} contains no usable private keys",
            namespace,
            secret_ref.name
        ));
    }

    Ok(keys)
}

/// Walk the tree rooted at `root` and decrypt every SOPS envelope in place.
/// Non-envelope files are untouched. Returns the number of files decrypted.
/// An envelope whose key is not present fails the whole stage.
pub async fn decrypt_tree(keys: &DecryptionKeys, root: &Path) -> Result<usize> {
    let gnupg_home = if keys.pgp_keys.is_empty() {
        None
    } else {
        Some(import_pgp_keys(keys, root).await?)
    };
    let age_env = keys.age_keys.join("\n");

    let mut decrypted = 0usize;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to read directory {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() || !is_candidate_file(&path) {
                continue;
            }

            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                // Binary files cannot be SOPS envelopes.
                Err(_) => continue,
            };
            if !is_sops_encrypted(&content) {
                continue;
            }

            decrypt_file(&path, &age_env, gnupg_home.as_deref()).await?;
            decrypted += 1;
        }
    }

    if decrypted > 0 {
        info!("decrypted {decrypted} SOPS envelope(s)");
    }
    Ok(decrypted)
}

/// Only structured formats SOPS encrypts whole-file are considered.
fn is_candidate_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json") | Some("env")
    )
}

/// Import PGP private keys into a scratch keyring under the tree root, so
/// key material is deleted together with the scratch directory.
async fn import_pgp_keys(keys: &DecryptionKeys, root: &Path) -> Result<PathBuf> {
    let gnupg_home = root.join(".gnupg");
    tokio::fs::create_dir_all(&gnupg_home)
        .await
        .context("failed to create scratch keyring directory")?;

    for key in &keys.pgp_keys {
        let mut child = tokio::process::Command::new("gpg")
            .env("GNUPGHOME", &gnupg_home)
            .arg("--batch")
            .arg("--import")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .context("failed to spawn gpg")?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(key.as_bytes())
                .await
                .context("failed to feed key to gpg")?;
        }
        let output = child
            .wait_with_output()
            .await
            .context("failed to wait for gpg")?;
        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "gpg key import failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
    }

    Ok(gnupg_home)
}

/// Run `sops --decrypt` on a single envelope and rewrite it in place.
async fn decrypt_file(path: &Path, age_env: &str, gnupg_home: Option<&Path>) -> Result<()> {
    let mut cmd = tokio::process::Command::new("sops");
    cmd.arg("--decrypt").arg(path);
    if !age_env.is_empty() {
        cmd.env("SOPS_AGE_KEY", age_env);
    }
    if let Some(home) = gnupg_home {
        cmd.env("GNUPGHOME", home);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("failed to execute sops on {}", path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // SOPS exit code 3 means no decryption key was available; the
        // envelope names a key the secret does not hold.
        if output.status.code() == Some(3) || stderr.contains("no decryption key") {
            return Err(anyhow::anyhow!(
                "no matching private key for envelope {}: {}",
                path.display(),
                stderr.trim()
            ));
        }
        return Err(anyhow::anyhow!(
            "sops failed to decrypt {}: {}",
            path.display(),
            stderr.trim()
        ));
    }

    tokio::fs::write(path, &output.stdout)
        .await
        .with_context(|| format!("failed to rewrite decrypted file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_yaml_envelope() {
        let content = r#"
apiVersion: v1
kind: Secret
data:
  password: ENC[AES256_GCM,data:xxxx,iv:yyyy,tag:zzzz,type:str]
sops:
  age:
    - recipient: age1example
  version: 3.8.1
"#;
        assert!(is_sops_encrypted(content));
    }

    #[test]
    fn test_detects_json_envelope() {
        let content = r#"{"data": "ENC[...]", "sops": {"version": "3.8.1"}}"#;
        assert!(is_sops_encrypted(content));
    }

    #[test]
    fn test_detects_dotenv_markers() {
        let content = "DB_PASSWORD=ENC[AES256_GCM,data:abc,iv:def,tag:ghi,type:str]\n";
        assert!(is_sops_encrypted(content));
    }

    #[test]
    fn test_plain_manifest_is_not_envelope() {
        let content = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: backend
"#;
        assert!(!is_sops_encrypted(content));
    }

    #[test]
    fn test_plain_manifest_mentioning_sops_in_string_is_not_envelope() {
        let content = "message: this deployment was encrypted with sops once\n";
        assert!(!is_sops_encrypted(content));
    }

    #[test]
    fn test_candidate_file_extensions() {
        assert!(is_candidate_file(Path::new("a/secret.yaml")));
        assert!(is_candidate_file(Path::new("a/secret.env")));
        assert!(!is_candidate_file(Path::new("a/README.md")));
        assert!(!is_candidate_file(Path::new("a/binary")));
    }
}
