//! Integration tests for the publish policy and stage sequencing, driven
//! against fake collaborators (a mock registry and `/bin/sh` stages).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use ggufsmith::error::{Error, Result};
use ggufsmith::{
    run_stages, DirectoryHandle, OutputCheck, PipelineConfig, Publisher, RegistryApi, StageRunner,
    StageSpec, StageStatus,
};

/// A registry whose uploads fail a configured number of times per remote
/// path before succeeding.
struct FlakyRegistry {
    /// remote path -> number of initial attempts that fail.
    failures: HashMap<String, usize>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl FlakyRegistry {
    fn new(failures: HashMap<String, usize>) -> Self {
        Self {
            failures,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn attempts_for(&self, remote: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(remote)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl RegistryApi for FlakyRegistry {
    async fn ensure_repo(&self, _repo_id: &str, _private: bool) -> Result<()> {
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote_path: &str, _repo_id: &str) -> Result<()> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(remote_path.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let budget = self.failures.get(remote_path).copied().unwrap_or(0);
        if attempt <= budget {
            return Err(Error::Publish {
                path: local.to_path_buf(),
                message: format!("simulated upload failure (attempt {attempt})"),
            });
        }
        Ok(())
    }
}

fn seeded_layout(model_name: &str) -> (tempfile::TempDir, DirectoryHandle) {
    let temp = tempfile::TempDir::new().unwrap();
    let layout = DirectoryHandle::ensure_layout(temp.path().join("work"), model_name).unwrap();
    std::fs::write(layout.full_precision_path(), b"f16 gguf bytes").unwrap();
    for kind in ["q4_0", "q4_k_m", "q5_k_m", "q8_0"] {
        std::fs::write(layout.quantized_path(kind), format!("{kind} bytes")).unwrap();
    }
    (temp, layout)
}

fn test_config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        root: root.to_path_buf(),
        model_name: "sample-chat".to_string(),
        repo_id: "acme/sample-chat-gguf".to_string(),
        hub_token: Some("hf_test".to_string()),
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn publish_partial_success_continues_past_failures() {
    let (_temp, layout) = seeded_layout("sample-chat");
    let config = test_config(layout.root());

    // One artifact fails on the initial attempt AND the retry.
    let failing = "sample-chat-q8_0.gguf".to_string();
    let registry = FlakyRegistry::new(HashMap::from([(failing.clone(), usize::MAX)]));

    let publisher = Publisher::new(&config, &registry);
    let report = publisher.publish(&layout).await.unwrap();

    // 5 artifacts were attempted: 4 succeeded, 1 failed, none aborted the rest.
    let artifacts: Vec<_> = report
        .files
        .iter()
        .filter(|f| f.remote_path.ends_with(".gguf"))
        .collect();
    assert_eq!(artifacts.len(), 5);
    assert_eq!(
        artifacts
            .iter()
            .filter(|f| f.status == StageStatus::Succeeded)
            .count(),
        4
    );
    let failed: Vec<_> = artifacts
        .iter()
        .filter(|f| f.status == StageStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].remote_path, failing);

    // Exactly one retry after the initial failure.
    assert_eq!(registry.attempts_for(&failing), 2);
    // The description documents went up as well.
    assert!(report.files.iter().any(|f| f.remote_path == "README.md"));
    assert!(report.files.iter().any(|f| f.remote_path == "manifest.json"));
    assert!(!report.is_complete());
}

#[tokio::test]
async fn publish_retry_recovers_transient_failure() {
    let (_temp, layout) = seeded_layout("sample-chat");
    let config = test_config(layout.root());

    // Fails once, then succeeds on the retry.
    let flaky = "sample-chat-q4_0.gguf".to_string();
    let registry = FlakyRegistry::new(HashMap::from([(flaky.clone(), 1)]));

    let publisher = Publisher::new(&config, &registry);
    let report = publisher.publish(&layout).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(registry.attempts_for(&flaky), 2);
}

#[tokio::test]
async fn publish_fails_fast_without_artifacts() {
    let temp = tempfile::TempDir::new().unwrap();
    let layout = DirectoryHandle::ensure_layout(temp.path().join("work"), "sample-chat").unwrap();
    let config = test_config(layout.root());
    let registry = FlakyRegistry::new(HashMap::new());

    let publisher = Publisher::new(&config, &registry);
    let err = publisher.publish(&layout).await.unwrap_err();
    assert!(err.to_string().contains("run the full pipeline first"));
    // Nothing was attempted against the registry.
    assert!(registry.attempts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn required_stage_failure_halts_the_sequence() {
    let temp = tempfile::TempDir::new().unwrap();
    let convert_marker = temp.path().join("convert-ran");
    let quantize_marker = temp.path().join("quantize-ran");
    let runner = StageRunner::new(Duration::from_secs(5));

    let specs = vec![
        StageSpec::new("merge-adapter", "/bin/sh").args(["-c", "echo 'CUDA error' >&2; exit 1"]),
        StageSpec::new("convert-gguf", "/bin/sh")
            .args(["-c", &format!("touch {}", convert_marker.display())]),
        StageSpec::new("quantize-q4_0", "/bin/sh")
            .args(["-c", &format!("touch {}", quantize_marker.display())]),
    ];

    let (results, failed) = run_stages(&runner, specs).await;
    assert_eq!(failed.as_deref(), Some("merge-adapter"));
    assert_eq!(results.len(), 1);
    assert!(!convert_marker.exists());
    assert!(!quantize_marker.exists());
}

#[tokio::test]
async fn completed_stages_skip_on_rerun() {
    // Second invocation of an identical sequence must skip without
    // re-spawning: the commands here would clobber the outputs if re-run.
    let temp = tempfile::TempDir::new().unwrap();
    let out = temp.path().join("model.gguf");
    let runner = StageRunner::new(Duration::from_secs(5));

    let build = || {
        vec![StageSpec::new("convert-gguf", "/bin/sh")
            .args(["-c", &format!("echo converted > {}", out.display())])
            .output(OutputCheck::File(out.clone()))
            .skip_if_done()]
    };

    let (first, _) = run_stages(&runner, build()).await;
    assert_eq!(first[0].status, StageStatus::Succeeded);
    let original = std::fs::read(&out).unwrap();

    let (second, _) = run_stages(&runner, build()).await;
    assert_eq!(second[0].status, StageStatus::Skipped);
    assert_eq!(std::fs::read(&out).unwrap(), original);
}
