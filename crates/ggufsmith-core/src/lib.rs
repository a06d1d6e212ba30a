//! ggufsmith: turn a fine-tuned adapter into a published GGUF release.
//!
//! The crate drives a multi-stage pipeline of external collaborators:
//! a Python merge script (transformers + peft), llama.cpp's GGUF
//! converter and quantizer, and the HuggingFace Hub API. All state lives
//! in the artifact directory tree, so an interrupted run resumes from
//! whatever artifacts already exist.
//!
//! # Example
//!
//! ```rust,ignore
//! use ggufsmith::{run_pipeline, HubClient, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> ggufsmith::Result<()> {
//!     let config = PipelineConfig {
//!         adapter_id: "acme/tinyllama-support-lora".into(),
//!         repo_id: "acme/tinyllama-support-gguf".into(),
//!         hub_token: std::env::var("HF_TOKEN").ok(),
//!         ..PipelineConfig::default()
//!     };
//!     let registry = HubClient::new(config.hub_token.clone().unwrap_or_default())?;
//!     let report = run_pipeline(&config, &registry).await?;
//!     println!("{}", report.render());
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod config;
pub mod error;
pub mod layout;
pub mod pipeline;
pub mod provision;
pub mod publish;
pub mod quantize;
pub mod scripts;
pub mod stage;
pub mod toolchain;

// Re-export commonly used types
pub use config::{NetworkConfig, PipelineConfig, StageTimeouts};
pub use error::{Error, Result};
pub use layout::{ArtifactRole, DirectoryHandle};
pub use pipeline::{run_pipeline, run_stages, PipelineOutcome, PipelineReport};
pub use provision::{EnvironmentHandle, Provisioner};
pub use publish::{HubClient, PublishReport, Publisher, RegistryApi};
pub use quantize::{default_quant_kinds, quant_catalog, QuantKind, QuantVariant};
pub use stage::{OutputCheck, StageResult, StageRunner, StageSpec, StageStatus};
pub use toolchain::Toolchain;
