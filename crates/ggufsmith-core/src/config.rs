//! Pipeline configuration.
//!
//! All configuration is carried in explicit structs threaded through each
//! component; there is no ambient global state. Defaults are baked in so
//! the CLI can run end-to-end with no flags.

use std::path::PathBuf;
use std::time::Duration;

/// Full configuration for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the artifact directory tree. All pipeline state lives here;
    /// resumability is derived purely from what exists under this root.
    pub root: PathBuf,
    /// Base model repository id on the Hub.
    pub base_model_id: String,
    /// Adapter (LoRA) repository id or local path.
    pub adapter_id: String,
    /// Base name for produced GGUF files.
    pub model_name: String,
    /// Destination repository id for publishing (`owner/name`).
    pub repo_id: String,
    /// Whether the destination repository is private.
    pub private: bool,
    /// Quantization kind codes to produce, as accepted by `llama-quantize`.
    pub quant_kinds: Vec<String>,
    /// Worker bound for the quantization fan-out.
    pub quantize_workers: usize,
    /// Wall-clock bound for a single external stage invocation.
    pub stage_timeout: Duration,
    /// Hub API token. `None` means publishing will fail with a clear message.
    pub hub_token: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("model-work"),
            base_model_id: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string(),
            adapter_id: "tinyllama-lora-adapter".to_string(),
            model_name: "tinyllama-chat-merged".to_string(),
            repo_id: "tinyllama-chat-merged-gguf".to_string(),
            private: false,
            quant_kinds: crate::quantize::default_quant_kinds()
                .iter()
                .map(|k| k.name.clone())
                .collect(),
            quantize_workers: 1,
            stage_timeout: StageTimeouts::EXTERNAL_STAGE,
            hub_token: None,
        }
    }
}

/// Timeouts for external subprocess invocations.
pub struct StageTimeouts;

impl StageTimeouts {
    /// Merging, converting, and quantizing multi-GB weight sets is slow.
    pub const EXTERNAL_STAGE: Duration = Duration::from_secs(2 * 60 * 60);
    pub const VENV_CREATION: Duration = Duration::from_secs(120);
    pub const PIP_INSTALL: Duration = Duration::from_secs(900);
    pub const GIT_CLONE: Duration = Duration::from_secs(600);
    pub const TOOLCHAIN_BUILD: Duration = Duration::from_secs(1800);
}

/// Network-related configuration for the publisher.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// Uploading multi-GB artifacts over a slow uplink takes a while.
    pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(3600);
    /// Per-file upload retries after the initial attempt.
    pub const UPLOAD_RETRIES: u32 = 1;
    pub const USER_AGENT: &'static str = "ggufsmith/0.1";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let config = PipelineConfig::default();
        assert!(!config.base_model_id.is_empty());
        assert!(!config.quant_kinds.is_empty());
        assert!(config.quantize_workers >= 1);
        assert_eq!(config.quant_kinds.len(), 4);
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(StageTimeouts::EXTERNAL_STAGE > StageTimeouts::PIP_INSTALL);
        assert!(NetworkConfig::UPLOAD_TIMEOUT > NetworkConfig::REQUEST_TIMEOUT);
    }
}
