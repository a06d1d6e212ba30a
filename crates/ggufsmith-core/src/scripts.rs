//! Embedded Python merge script and deployment utilities.
//!
//! The script is stored as a string constant and written to disk on first
//! use or when the embedded version changes (detected via hash comparison).

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Error, Result};

/// Python requirements for the merge/conversion virtual environment.
///
/// Ordered, unpinned package names; the provisioner installs them as-is.
pub const REQUIREMENTS: &str = "\
transformers
torch
peft
huggingface-hub
sentencepiece
protobuf
accelerate
safetensors
mistral-common
gguf
";

/// Python script that merges a LoRA adapter into its base model.
pub const MERGE_SCRIPT: &str = r#"#!/usr/bin/env python3
"""Merge a LoRA adapter into its base model.

Loads the base model in float16, applies the adapter, merges the weights,
and saves a self-contained checkpoint (weights + tokenizer files) to the
output directory. Reports progress as JSON lines on stdout.
"""
import argparse
import json
import sys

def progress(stage, **kwargs):
    """Emit a JSON progress line to stdout."""
    print(json.dumps({"stage": stage, **kwargs}), flush=True)

def main():
    parser = argparse.ArgumentParser(description="Merge a LoRA adapter into a base model")
    parser.add_argument("--base-model", required=True, help="Base model repo id or local path")
    parser.add_argument("--adapter", required=True, help="Adapter repo id or local path")
    parser.add_argument("--output-dir", required=True, help="Output directory for the merged model")
    args = parser.parse_args()

    try:
        import torch
        from transformers import AutoModelForCausalLM, AutoTokenizer
        from peft import PeftModel
    except ImportError as e:
        progress("error", message=f"Missing required package: {e}")
        sys.exit(1)

    progress("loading_base", message=f"Loading base model {args.base_model}")
    base_model = AutoModelForCausalLM.from_pretrained(
        args.base_model,
        torch_dtype=torch.float16,
        device_map="auto",
    )

    progress("loading_adapter", message=f"Loading adapter {args.adapter}")
    model = PeftModel.from_pretrained(base_model, args.adapter)

    progress("merging", message="Merging adapter weights into base weights")
    merged = model.merge_and_unload()

    progress("loading_tokenizer", message="Loading tokenizer")
    tokenizer = AutoTokenizer.from_pretrained(args.adapter)

    progress("writing", message=f"Saving merged model to {args.output_dir}")
    merged.save_pretrained(args.output_dir, safe_serialization=True)
    tokenizer.save_pretrained(args.output_dir)

    progress("complete", output_path=args.output_dir)

if __name__ == "__main__":
    main()
"#;

/// Filename the merge script is deployed under.
pub const MERGE_SCRIPT_NAME: &str = "merge_lora.py";

/// Filename the requirements are deployed under.
pub const REQUIREMENTS_NAME: &str = "requirements.txt";

/// Compute a short hash of a string for staleness checking.
fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = hasher.finalize();
    hex::encode(&hash[..8])
}

/// Get the path to the deployed scripts directory.
pub fn scripts_dir(root: &Path) -> PathBuf {
    root.join("scripts")
}

/// Get the path to the deployed merge script.
pub fn merge_script_path(root: &Path) -> PathBuf {
    scripts_dir(root).join(MERGE_SCRIPT_NAME)
}

/// Get the path to the deployed requirements file.
pub fn requirements_path(root: &Path) -> PathBuf {
    scripts_dir(root).join(REQUIREMENTS_NAME)
}

/// Deploy embedded scripts to disk if missing or outdated.
///
/// Uses a `.hash` sidecar file to detect when the embedded content has
/// changed and needs to be rewritten.
pub fn ensure_scripts_deployed(root: &Path) -> Result<()> {
    let dir = scripts_dir(root);
    std::fs::create_dir_all(&dir).map_err(|e| Error::io("creating scripts dir", &dir, e))?;

    deploy_script(&dir, MERGE_SCRIPT_NAME, MERGE_SCRIPT)?;
    deploy_script(&dir, REQUIREMENTS_NAME, REQUIREMENTS)?;

    info!("Merge scripts deployed to {}", dir.display());
    Ok(())
}

fn deploy_script(dir: &Path, filename: &str, content: &str) -> Result<()> {
    let script_path = dir.join(filename);
    let hash_path = dir.join(format!("{}.hash", filename));
    let current_hash = content_hash(content);

    // Check if script is already up to date
    if script_path.exists() {
        if let Ok(stored_hash) = std::fs::read_to_string(&hash_path) {
            if stored_hash.trim() == current_hash {
                return Ok(());
            }
        }
    }

    std::fs::write(&script_path, content).map_err(|e| Error::io("writing script", &script_path, e))?;
    std::fs::write(&hash_path, &current_hash).map_err(|e| Error::io("writing script hash", &hash_path, e))?;
    Ok(())
}
