//! llama.cpp toolchain management.
//!
//! Owns the llama.cpp source checkout and the two-step cmake build that
//! produces `llama-quantize`. The built binary at its fixed relative path
//! is the "already built" marker; the orchestrator evaluates it once per
//! run and skips the build stages when it holds.
//!
//! All invocations are expressed as [`StageSpec`]s so the stage runner's
//! timeout and success-predicate policy applies uniformly.

use std::path::{Path, PathBuf};

use crate::config::StageTimeouts;
use crate::stage::{OutputCheck, StageSpec};

/// Git repository URL for llama.cpp.
const LLAMA_CPP_REPO: &str = "https://github.com/ggml-org/llama.cpp.git";

/// The llama.cpp checkout and build tree under the artifact root.
#[derive(Debug, Clone)]
pub struct Toolchain {
    base_dir: PathBuf,
}

impl Toolchain {
    pub fn new(root: &Path) -> Self {
        Self {
            base_dir: root.join("llama-cpp"),
        }
    }

    /// Path to the llama.cpp source checkout.
    pub fn source_dir(&self) -> PathBuf {
        self.base_dir.join("source")
    }

    /// Path to the cmake build directory.
    fn build_dir(&self) -> PathBuf {
        self.base_dir.join("build")
    }

    /// Path to the `llama-quantize` binary.
    pub fn quantize_binary(&self) -> PathBuf {
        self.build_dir().join("bin").join("llama-quantize")
    }

    /// Path to `convert_hf_to_gguf.py` from the llama.cpp repo.
    pub fn convert_script(&self) -> PathBuf {
        self.source_dir().join("convert_hf_to_gguf.py")
    }

    /// Whether a source checkout is present.
    pub fn has_source(&self) -> bool {
        self.convert_script().exists()
    }

    /// Whether the quantizer binary has already been built.
    pub fn is_built(&self) -> bool {
        self.quantize_binary().exists()
    }

    /// Shallow-clone the llama.cpp repository. Skipped when the checkout
    /// (detected via the conversion script) is already present.
    pub fn fetch_stage(&self) -> StageSpec {
        StageSpec::new("fetch-toolchain", "git")
            .args(["clone", "--depth", "1", LLAMA_CPP_REPO])
            .arg(self.source_dir())
            .output(OutputCheck::File(self.convert_script()))
            .skip_if_done()
            .timeout(StageTimeouts::GIT_CLONE)
    }

    /// `cmake` configure step.
    pub fn configure_stage(&self) -> StageSpec {
        StageSpec::new("toolchain-configure", "cmake")
            .arg(format!("-B{}", self.build_dir().display()))
            .arg(format!("-S{}", self.source_dir().display()))
            .arg("-DCMAKE_BUILD_TYPE=Release")
            .output(OutputCheck::File(self.build_dir().join("CMakeCache.txt")))
            .timeout(StageTimeouts::TOOLCHAIN_BUILD)
    }

    /// `cmake --build` step producing `llama-quantize`.
    pub fn compile_stage(&self) -> StageSpec {
        let nproc = std::thread::available_parallelism()
            .map(|n| n.get().to_string())
            .unwrap_or_else(|_| "4".to_string());

        StageSpec::new("toolchain-compile", "cmake")
            .arg("--build")
            .arg(self.build_dir())
            .args(["--config", "Release", "-j", &nproc, "--target", "llama-quantize"])
            .output(OutputCheck::File(self.quantize_binary()))
            .timeout(StageTimeouts::TOOLCHAIN_BUILD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_path_construction() {
        let toolchain = Toolchain::new(Path::new("/work"));
        assert_eq!(
            toolchain.quantize_binary(),
            PathBuf::from("/work/llama-cpp/build/bin/llama-quantize")
        );
        assert_eq!(
            toolchain.convert_script(),
            PathBuf::from("/work/llama-cpp/source/convert_hf_to_gguf.py")
        );
    }

    #[test]
    fn test_markers() {
        let temp = TempDir::new().unwrap();
        let toolchain = Toolchain::new(temp.path());
        assert!(!toolchain.has_source());
        assert!(!toolchain.is_built());

        std::fs::create_dir_all(toolchain.source_dir()).unwrap();
        std::fs::write(toolchain.convert_script(), b"# convert").unwrap();
        assert!(toolchain.has_source());

        let binary = toolchain.quantize_binary();
        std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
        std::fs::write(&binary, b"\x7fELF").unwrap();
        assert!(toolchain.is_built());
    }

    #[test]
    fn test_stage_specs() {
        let toolchain = Toolchain::new(Path::new("/work"));

        let fetch = toolchain.fetch_stage();
        assert_eq!(fetch.name, "fetch-toolchain");
        assert!(fetch.skip_if_done);
        assert_eq!(fetch.program, PathBuf::from("git"));

        let compile = toolchain.compile_stage();
        assert!(compile
            .args
            .iter()
            .any(|a| a == std::ffi::OsStr::new("llama-quantize")));
        match &compile.output {
            OutputCheck::File(path) => assert_eq!(*path, toolchain.quantize_binary()),
            _ => panic!("compile stage must declare the quantizer binary"),
        }
    }
}
