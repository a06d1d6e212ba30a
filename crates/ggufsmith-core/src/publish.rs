//! Artifact publishing to the HuggingFace Hub.
//!
//! The registry is driven through the [`RegistryApi`] trait so the upload
//! policy (retry-once, continue-on-failure) can be exercised without
//! network access. [`HubClient`] is the real implementation: idempotent
//! repository creation and per-file NDJSON commits.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::{NetworkConfig, PipelineConfig};
use crate::error::{Error, Result};
use crate::layout::{self, DirectoryHandle};
use crate::stage::StageStatus;

/// HuggingFace Hub base URL.
const HUB_BASE: &str = "https://huggingface.co";

/// HuggingFace API base URL.
const HUB_API_BASE: &str = "https://huggingface.co/api";

// ---------------------------------------------------------------------------
// Registry seam
// ---------------------------------------------------------------------------

/// Operations the publisher needs from a model registry.
#[async_trait::async_trait]
pub trait RegistryApi: Send + Sync {
    /// Create the repository if absent. Must be idempotent.
    async fn ensure_repo(&self, repo_id: &str, private: bool) -> Result<()>;

    /// Upload one local file to `remote_path` inside the repository.
    async fn upload_file(&self, local: &Path, remote_path: &str, repo_id: &str) -> Result<()>;
}

/// HuggingFace Hub client.
pub struct HubClient {
    client: reqwest::Client,
    token: String,
}

impl HubClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(NetworkConfig::UPLOAD_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| Error::Network {
                message: format!("Failed to create HTTP client: {e}"),
                cause: None,
            })?;

        Ok(Self {
            client,
            token: token.into(),
        })
    }
}

#[async_trait::async_trait]
impl RegistryApi for HubClient {
    async fn ensure_repo(&self, repo_id: &str, private: bool) -> Result<()> {
        let (organization, name) = split_repo_id(repo_id);
        let mut payload = serde_json::json!({
            "type": "model",
            "name": name,
            "private": private,
        });
        if let Some(org) = organization {
            payload["organization"] = serde_json::json!(org);
        }

        let url = format!("{HUB_API_BASE}/repos/create");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        // 409 means the repository already exists, so create is idempotent.
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Network {
            message: format!("create repo '{repo_id}' returned {status}: {body}"),
            cause: None,
        })
    }

    async fn upload_file(&self, local: &Path, remote_path: &str, repo_id: &str) -> Result<()> {
        let bytes = tokio::fs::read(local).await.map_err(|e| Error::Publish {
            path: local.to_path_buf(),
            message: format!("reading file: {e}"),
        })?;

        // NDJSON commit payload: a header line followed by one file line.
        let header = serde_json::json!({
            "key": "header",
            "value": { "summary": format!("Upload {remote_path}") },
        });
        let file = serde_json::json!({
            "key": "file",
            "value": {
                "path": remote_path,
                "content": BASE64.encode(&bytes),
                "encoding": "base64",
            },
        });
        let body = format!("{header}\n{file}");

        let url = format!("{HUB_BASE}/api/models/{repo_id}/commit/main");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Publish {
            path: local.to_path_buf(),
            message: format!("upload of '{remote_path}' returned {status}: {body}"),
        })
    }
}

/// Split `owner/name` into an optional organization and the repo name.
fn split_repo_id(repo_id: &str) -> (Option<&str>, &str) {
    match repo_id.split_once('/') {
        Some((org, name)) => (Some(org), name),
        None => (None, repo_id),
    }
}

// ---------------------------------------------------------------------------
// Artifact enumeration
// ---------------------------------------------------------------------------

/// One file selected for publishing.
#[derive(Debug, Clone)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub remote_path: String,
    /// Logical role ("full-precision" or "quantized").
    pub role: &'static str,
    /// Quantization kind code for quantized artifacts.
    pub quant: Option<String>,
    pub size_bytes: u64,
}

/// Enumerate publishable GGUF artifacts under the layout's gguf directory.
///
/// Fails fast with a clear message when no artifacts exist: the publish
/// entry point must not silently create an empty release.
pub fn collect_artifacts(layout: &DirectoryHandle) -> Result<Vec<ArtifactFile>> {
    let gguf_dir = layout.gguf_dir();
    let full_precision_name = format!("{}.gguf", layout.model_name());
    let quant_prefix = format!("{}-", layout.model_name());

    let mut paths: Vec<PathBuf> = std::fs::read_dir(&gguf_dir)
        .map_err(|e| Error::io("reading gguf dir", &gguf_dir, e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("gguf"))
        .collect();
    paths.sort();

    let mut artifacts = Vec::new();
    for path in paths {
        if !layout::non_empty_file(&path) {
            warn!("Skipping empty artifact {}", path.display());
            continue;
        }
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let (role, quant) = if file_name == full_precision_name {
            ("full-precision", None)
        } else if let Some(rest) = file_name
            .strip_prefix(&quant_prefix)
            .and_then(|r| r.strip_suffix(".gguf"))
        {
            ("quantized", Some(rest.to_string()))
        } else {
            // A gguf file we did not produce; publish it as-is.
            ("quantized", None)
        };

        artifacts.push(ArtifactFile {
            remote_path: file_name,
            path,
            role,
            quant,
            size_bytes,
        });
    }

    if artifacts.is_empty() {
        return Err(Error::Config {
            message: format!(
                "No GGUF artifacts found in {} — run the full pipeline first",
                gguf_dir.display()
            ),
        });
    }

    Ok(artifacts)
}

// ---------------------------------------------------------------------------
// Manifest and model card
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct Manifest {
    pub model_name: String,
    pub base_model: String,
    pub adapter: String,
    pub generated_at: String,
    pub artifacts: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize)]
pub struct ManifestEntry {
    pub file: String,
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quant: Option<String>,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Build the manifest describing the produced artifacts.
pub fn build_manifest(config: &PipelineConfig, artifacts: &[ArtifactFile]) -> Result<Manifest> {
    let mut entries = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        entries.push(ManifestEntry {
            file: artifact.remote_path.clone(),
            role: artifact.role,
            quant: artifact.quant.clone(),
            size_bytes: artifact.size_bytes,
            sha256: sha256_file(&artifact.path)?,
        });
    }

    Ok(Manifest {
        model_name: config.model_name.clone(),
        base_model: config.base_model_id.clone(),
        adapter: config.adapter_id.clone(),
        generated_at: chrono::Utc::now().to_rfc3339(),
        artifacts: entries,
    })
}

/// Render the model card uploaded as `README.md`.
pub fn build_model_card(config: &PipelineConfig, artifacts: &[ArtifactFile]) -> String {
    let mut card = format!(
        "---\n\
         license: apache-2.0\n\
         base_model: {base}\n\
         tags:\n\
         - gguf\n\
         - quantized\n\
         - llama.cpp\n\
         pipeline_tag: text-generation\n\
         ---\n\n\
         # {name} — GGUF\n\n\
         GGUF builds of `{adapter}` merged into `{base}`, quantized with\n\
         llama.cpp for on-device inference.\n\n\
         ## Files\n\n\
         | File | Quantization | Size |\n\
         |------|--------------|------|\n",
        base = config.base_model_id,
        name = config.model_name,
        adapter = config.adapter_id,
    );

    for artifact in artifacts {
        let quant_label = artifact
            .quant
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| "F16".to_string());
        card.push_str(&format!(
            "| `{}` | {} | {} |\n",
            artifact.remote_path,
            quant_label,
            format_size(artifact.size_bytes)
        ));
    }

    card.push_str(&format!(
        "\n## Usage\n\n\
         ```bash\n\
         llama-cli -m {name}-q4_k_m.gguf -p \"...\" -n 512\n\
         ```\n\n\
         Smaller quantizations (q4_0, q4_k_m) suit mobile and edge devices;\n\
         q8_0 and the F16 file trade size for fidelity.\n",
        name = config.model_name,
    ));

    card
}

fn format_size(bytes: u64) -> String {
    let mib = bytes as f64 / (1024.0 * 1024.0);
    if mib >= 1024.0 {
        format!("{:.2} GiB", mib / 1024.0)
    } else {
        format!("{mib:.1} MiB")
    }
}

/// Streaming SHA-256 of a file.
fn sha256_file(path: &Path) -> Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path).map_err(|e| Error::io("opening artifact", path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io("reading artifact", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Outcome for one uploaded file.
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub remote_path: String,
    pub size_bytes: u64,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Report of one publish run.
#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub repo_id: String,
    pub files: Vec<FileOutcome>,
}

impl PublishReport {
    pub fn succeeded_count(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.status == StageStatus::Succeeded)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.status == StageStatus::Failed)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_count() == 0
    }
}

/// Uploads produced artifacts plus generated description documents.
pub struct Publisher<'a> {
    config: &'a PipelineConfig,
    registry: &'a dyn RegistryApi,
}

impl<'a> Publisher<'a> {
    pub fn new(config: &'a PipelineConfig, registry: &'a dyn RegistryApi) -> Self {
        Self { config, registry }
    }

    /// Publish every artifact under the layout to the destination repo.
    ///
    /// Repository creation failure is fatal (nothing can be uploaded).
    /// Per-file upload failures are retried once, then recorded; remaining
    /// files still attempt upload so a flaky network yields the largest
    /// possible partial release.
    pub async fn publish(&self, layout: &DirectoryHandle) -> Result<PublishReport> {
        let artifacts = collect_artifacts(layout)?;
        info!(
            "Publishing {} artifact(s) to {}",
            artifacts.len(),
            self.config.repo_id
        );

        self.registry
            .ensure_repo(&self.config.repo_id, self.config.private)
            .await?;

        // Write the description documents next to the artifacts so a run
        // can be inspected (and re-published) from disk alone.
        let card = build_model_card(self.config, &artifacts);
        let card_path = layout.gguf_dir().join("README.md");
        std::fs::write(&card_path, &card).map_err(|e| Error::io("writing model card", &card_path, e))?;

        let manifest = build_manifest(self.config, &artifacts)?;
        let manifest_path = layout.gguf_dir().join("manifest.json");
        let manifest_json = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(&manifest_path, &manifest_json)
            .map_err(|e| Error::io("writing manifest", &manifest_path, e))?;

        let mut report = PublishReport {
            repo_id: self.config.repo_id.clone(),
            files: Vec::new(),
        };

        let mut uploads: Vec<(PathBuf, String, u64)> = vec![
            (card_path, "README.md".to_string(), card.len() as u64),
            (
                manifest_path,
                "manifest.json".to_string(),
                manifest_json.len() as u64,
            ),
        ];
        uploads.extend(
            artifacts
                .iter()
                .map(|a| (a.path.clone(), a.remote_path.clone(), a.size_bytes)),
        );

        for (local, remote, size_bytes) in uploads {
            let outcome = self.upload_with_retry(&local, &remote).await;
            report.files.push(FileOutcome {
                remote_path: remote,
                size_bytes,
                status: if outcome.is_ok() {
                    StageStatus::Succeeded
                } else {
                    StageStatus::Failed
                },
                message: outcome.err().map(|e| e.to_string()),
            });
        }

        info!(
            "Publish finished: {} uploaded, {} failed",
            report.succeeded_count(),
            report.failed_count()
        );
        Ok(report)
    }

    async fn upload_with_retry(&self, local: &Path, remote: &str) -> Result<()> {
        info!("Uploading {} ({})", remote, format_size(file_size(local)));
        let mut last_err = match self
            .registry
            .upload_file(local, remote, &self.config.repo_id)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        for _ in 0..NetworkConfig::UPLOAD_RETRIES {
            if !last_err.is_retryable() {
                break;
            }
            warn!("Upload of {} failed, retrying once: {}", remote, last_err);
            match self
                .registry
                .upload_file(local, remote, &self.config.repo_id)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => last_err = e,
            }
        }

        warn!("Upload of {} failed: {}", remote, last_err);
        Err(last_err)
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
