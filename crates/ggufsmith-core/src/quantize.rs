//! Quantization fan-out.
//!
//! Runs `llama-quantize` once per configured variant against the single
//! full-precision source artifact. Variants are isolated: a failure
//! quantizing one kind is recorded but never aborts the siblings, and the
//! result map is keyed by kind so reported ordering is stable regardless
//! of completion order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use crate::layout::DirectoryHandle;
use crate::stage::{OutputCheck, ProgressStyle, StageResult, StageRunner, StageSpec};

/// A supported quantization kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantKind {
    /// Kind code as passed to `llama-quantize` (e.g. "q4_k_m").
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Approximate bits per weight.
    pub bits_per_weight: f32,
    /// Whether this is a recommended default option.
    pub recommended: bool,
}

/// Catalog of supported quantization kinds.
pub fn quant_catalog() -> Vec<QuantKind> {
    vec![
        QuantKind { name: "q2_k".into(), description: "2-bit K-quant (smallest, lowest quality)".into(), bits_per_weight: 3.35, recommended: false },
        QuantKind { name: "q3_k_m".into(), description: "3-bit K-quant medium".into(), bits_per_weight: 3.91, recommended: false },
        QuantKind { name: "q4_0".into(), description: "4-bit legacy quant (widest compatibility)".into(), bits_per_weight: 4.55, recommended: true },
        QuantKind { name: "q4_k_m".into(), description: "4-bit K-quant medium — best balance of size and quality".into(), bits_per_weight: 4.85, recommended: true },
        QuantKind { name: "q5_k_m".into(), description: "5-bit K-quant medium".into(), bits_per_weight: 5.69, recommended: true },
        QuantKind { name: "q6_k".into(), description: "6-bit K-quant (high quality, larger)".into(), bits_per_weight: 6.56, recommended: false },
        QuantKind { name: "q8_0".into(), description: "8-bit (near-lossless)".into(), bits_per_weight: 8.50, recommended: true },
    ]
}

/// The default set of kinds produced by a release run.
pub fn default_quant_kinds() -> Vec<QuantKind> {
    quant_catalog()
        .into_iter()
        .filter(|k| k.recommended)
        .collect()
}

/// Look up a kind by its code, case-insensitively.
pub fn lookup_kind(name: &str) -> Option<QuantKind> {
    let lower = name.to_lowercase();
    quant_catalog().into_iter().find(|k| k.name == lower)
}

/// One planned quantization: a kind code and its output path.
#[derive(Debug, Clone)]
pub struct QuantVariant {
    pub kind: String,
    pub output: PathBuf,
}

/// Resolve configured kind codes into variants with canonical output paths.
pub fn plan_variants(layout: &DirectoryHandle, kinds: &[String]) -> Vec<QuantVariant> {
    kinds
        .iter()
        .map(|kind| QuantVariant {
            kind: kind.to_lowercase(),
            output: layout.quantized_path(kind),
        })
        .collect()
}

/// Build the stage spec for one variant.
fn quantize_stage(quantizer: &Path, source: &Path, variant: &QuantVariant) -> StageSpec {
    StageSpec::new(format!("quantize-{}", variant.kind), quantizer)
        .arg(source)
        .arg(&variant.output)
        .arg(&variant.kind)
        .output(OutputCheck::File(variant.output.clone()))
        .skip_if_done()
        .progress(ProgressStyle::TensorLines)
}

/// Quantize the source artifact into every requested variant.
///
/// Execution is bounded by `workers`; results are collected into a
/// `BTreeMap` keyed by kind so callers always see a deterministic,
/// name-sorted report. Partial success is a valid outcome: callers
/// inspect the map rather than receiving an error.
pub async fn quantize_all(
    runner: &StageRunner,
    quantizer: &Path,
    source: &Path,
    variants: &[QuantVariant],
    workers: usize,
) -> BTreeMap<String, StageResult> {
    let results: Vec<(String, StageResult)> = stream::iter(variants.iter().map(|variant| {
        let spec = quantize_stage(quantizer, source, variant);
        let kind = variant.kind.clone();
        async move { (kind, runner.run(&spec).await) }
    }))
    .buffer_unordered(workers.max(1))
    .collect()
    .await;

    results.into_iter().collect()
}
