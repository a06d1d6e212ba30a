//! Artifact directory layout.
//!
//! Every stage resolves its input and output locations through
//! [`DirectoryHandle`] so that producers and consumers always agree on
//! paths without passing raw strings by hand. Layout creation is
//! create-if-missing only: existing contents are never deleted or
//! overwritten, which is what makes repeated runs resumable.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Logical role of a pipeline artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactRole {
    /// Downloaded base model weights.
    BaseModel,
    /// Downloaded adapter (LoRA) weights.
    AdapterWeights,
    /// Merged self-contained weight set (weights + tokenizer files).
    MergedModel,
    /// Full-precision (F16) converted GGUF file.
    FullPrecision,
    /// One quantized GGUF variant; the variant kind selects the file.
    Quantized,
}

/// Handle over the on-disk artifact tree for one model.
#[derive(Debug, Clone)]
pub struct DirectoryHandle {
    root: PathBuf,
    model_name: String,
}

impl DirectoryHandle {
    /// Create the fixed set of role-named subdirectories under `root` if
    /// absent and return a handle over them.
    ///
    /// Safe to call on every run: create-if-missing, never deletes, never
    /// overwrites existing contents.
    pub fn ensure_layout(root: impl Into<PathBuf>, model_name: impl Into<String>) -> Result<Self> {
        let handle = Self {
            root: root.into(),
            model_name: model_name.into(),
        };

        for dir in [
            handle.root.clone(),
            handle.base_model_dir(),
            handle.adapter_dir(),
            handle.merged_dir(),
            handle.gguf_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| Error::io("creating artifact dir", &dir, e))?;
        }

        Ok(handle)
    }

    /// Root of the artifact tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Base name used for produced GGUF files.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn base_model_dir(&self) -> PathBuf {
        self.root.join("base_model")
    }

    pub fn adapter_dir(&self) -> PathBuf {
        self.root.join("lora_adapter")
    }

    pub fn merged_dir(&self) -> PathBuf {
        self.root.join("merged_model")
    }

    pub fn gguf_dir(&self) -> PathBuf {
        self.root.join("gguf")
    }

    /// Path of the full-precision converted GGUF file.
    pub fn full_precision_path(&self) -> PathBuf {
        self.gguf_dir().join(format!("{}.gguf", self.model_name))
    }

    /// Path of one quantized GGUF variant. `kind` is the quantization kind
    /// code; the filename uses its lowercase form.
    pub fn quantized_path(&self, kind: &str) -> PathBuf {
        self.gguf_dir()
            .join(format!("{}-{}.gguf", self.model_name, kind.to_lowercase()))
    }

    /// Canonical path for an artifact role/variant pair.
    ///
    /// `variant` is only meaningful for [`ArtifactRole::Quantized`];
    /// `Quantized` with no variant resolves to the directory that owns the
    /// quantized outputs. Pure: identical arguments always yield identical
    /// paths, and no two role/variant pairs collide.
    pub fn path_for(&self, role: ArtifactRole, variant: Option<&str>) -> PathBuf {
        match (role, variant) {
            (ArtifactRole::BaseModel, _) => self.base_model_dir(),
            (ArtifactRole::AdapterWeights, _) => self.adapter_dir(),
            (ArtifactRole::MergedModel, _) => self.merged_dir(),
            (ArtifactRole::FullPrecision, _) => self.full_precision_path(),
            (ArtifactRole::Quantized, Some(kind)) => self.quantized_path(kind),
            (ArtifactRole::Quantized, None) => self.gguf_dir(),
        }
    }

    /// Whether the gguf directory already holds at least one non-empty
    /// artifact. Used by the publish-only entry point to fail fast.
    pub fn has_gguf_artifacts(&self) -> bool {
        dir_has_non_empty_ext(&self.gguf_dir(), "gguf")
    }
}

/// Whether `path` is an existing file with non-zero size.
pub fn non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Whether `dir` contains at least one non-empty file with extension `ext`.
pub fn dir_has_non_empty_ext(dir: &Path, ext: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .any(|p| p.extension().and_then(|e| e.to_str()) == Some(ext) && non_empty_file(&p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_construction() {
        let handle = DirectoryHandle {
            root: PathBuf::from("/work"),
            model_name: "sample-chat".to_string(),
        };
        assert_eq!(handle.merged_dir(), PathBuf::from("/work/merged_model"));
        assert_eq!(
            handle.full_precision_path(),
            PathBuf::from("/work/gguf/sample-chat.gguf")
        );
        assert_eq!(
            handle.quantized_path("Q4_K_M"),
            PathBuf::from("/work/gguf/sample-chat-q4_k_m.gguf")
        );
    }

    #[test]
    fn test_path_for_is_deterministic_and_collision_free() {
        let handle = DirectoryHandle {
            root: PathBuf::from("/work"),
            model_name: "m".to_string(),
        };

        let a = handle.path_for(ArtifactRole::Quantized, Some("q4_0"));
        let b = handle.path_for(ArtifactRole::Quantized, Some("q4_0"));
        assert_eq!(a, b);

        let all = [
            handle.path_for(ArtifactRole::BaseModel, None),
            handle.path_for(ArtifactRole::AdapterWeights, None),
            handle.path_for(ArtifactRole::MergedModel, None),
            handle.path_for(ArtifactRole::FullPrecision, None),
            handle.path_for(ArtifactRole::Quantized, Some("q4_0")),
            handle.path_for(ArtifactRole::Quantized, Some("q8_0")),
        ];
        for (i, p) in all.iter().enumerate() {
            for (j, q) in all.iter().enumerate() {
                if i != j {
                    assert_ne!(p, q, "role paths must not collide");
                }
            }
        }
    }

    #[test]
    fn test_ensure_layout_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("work");

        let first = DirectoryHandle::ensure_layout(&root, "m").unwrap();
        // Drop a file into one of the dirs, then re-run.
        let marker = first.merged_dir().join("model.safetensors");
        std::fs::write(&marker, b"weights").unwrap();

        let second = DirectoryHandle::ensure_layout(&root, "m").unwrap();
        assert_eq!(first.merged_dir(), second.merged_dir());
        assert!(marker.exists(), "re-running layout must not delete contents");
        assert_eq!(std::fs::read(&marker).unwrap(), b"weights");
    }

    #[test]
    fn test_non_empty_file() {
        let temp = TempDir::new().unwrap();
        let empty = temp.path().join("empty.gguf");
        let full = temp.path().join("full.gguf");
        std::fs::write(&empty, b"").unwrap();
        std::fs::write(&full, b"data").unwrap();

        assert!(!non_empty_file(&empty));
        assert!(non_empty_file(&full));
        assert!(!non_empty_file(&temp.path().join("missing.gguf")));

        assert!(dir_has_non_empty_ext(temp.path(), "gguf"));
        assert!(!dir_has_non_empty_ext(temp.path(), "safetensors"));
    }

    #[test]
    fn test_has_gguf_artifacts() {
        let temp = TempDir::new().unwrap();
        let handle = DirectoryHandle::ensure_layout(temp.path().join("work"), "m").unwrap();
        assert!(!handle.has_gguf_artifacts());

        std::fs::write(handle.full_precision_path(), b"gguf-bytes").unwrap();
        assert!(handle.has_gguf_artifacts());
    }
}
