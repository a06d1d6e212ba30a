//! Single-stage execution of external processes.
//!
//! A [`StageSpec`] names an external command with explicit argv (no shell
//! interpolation), an expected output artifact, and an optional skip
//! predicate. The [`StageRunner`] executes it with a wall-clock bound and
//! maps the outcome to a [`StageResult`].
//!
//! Exit-code success alone is not trusted: tools in this pipeline have
//! been observed exiting 0 while silently producing nothing, so a stage
//! only succeeds when its process exits 0 AND its declared output exists
//! with non-zero size.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::layout;

/// Number of trailing output lines kept for failure diagnostics.
const DIAGNOSTIC_TAIL_LINES: usize = 12;

/// Terminal state of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of one stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub stage: String,
    /// Terminal status.
    pub status: StageStatus,
    /// Diagnostic or skip reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Wall-clock seconds spent in the stage.
    pub elapsed_secs: f64,
    /// Size of the declared output artifact, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_bytes: Option<u64>,
}

impl StageResult {
    pub fn succeeded(stage: impl Into<String>, elapsed: Duration, output_bytes: Option<u64>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Succeeded,
            message: None,
            elapsed_secs: elapsed.as_secs_f64(),
            output_bytes,
        }
    }

    pub fn failed(stage: impl Into<String>, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Failed,
            message: Some(message.into()),
            elapsed_secs: elapsed.as_secs_f64(),
            output_bytes: None,
        }
    }

    pub fn skipped(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Skipped,
            message: Some(message.into()),
            elapsed_secs: 0.0,
            output_bytes: None,
        }
    }

    /// Whether the stage allows the pipeline to advance.
    pub fn is_ok(&self) -> bool {
        self.status != StageStatus::Failed
    }
}

/// Declared output artifact of a stage.
#[derive(Debug, Clone)]
pub enum OutputCheck {
    /// No declared output; exit status alone decides.
    None,
    /// A single file that must exist with non-zero size.
    File(PathBuf),
    /// A directory that must contain at least one non-empty weights file.
    WeightsDir(PathBuf),
}

impl OutputCheck {
    /// Whether the declared output is present and non-empty.
    pub fn satisfied(&self) -> bool {
        match self {
            Self::None => true,
            Self::File(path) => layout::non_empty_file(path),
            Self::WeightsDir(dir) => layout::dir_has_non_empty_ext(dir, "safetensors"),
        }
    }

    /// Size of the declared output, when measurable.
    pub fn size_bytes(&self) -> Option<u64> {
        match self {
            Self::None => None,
            Self::File(path) => std::fs::metadata(path).map(|m| m.len()).ok(),
            Self::WeightsDir(dir) => {
                let entries = std::fs::read_dir(dir).ok()?;
                let total: u64 = entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        e.path().extension().and_then(|x| x.to_str()) == Some("safetensors")
                    })
                    .filter_map(|e| e.metadata().ok())
                    .map(|m| m.len())
                    .sum();
                Some(total)
            }
        }
    }

    /// The path a failure message should point at.
    fn describe(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::File(path) => Some(path.display().to_string()),
            Self::WeightsDir(dir) => Some(format!("{} (weights file)", dir.display())),
        }
    }
}

/// How to interpret the stage's line output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressStyle {
    /// Log lines at debug level only.
    #[default]
    Silent,
    /// Parse JSON progress lines (the embedded script protocol).
    JsonLines,
    /// Parse `llama-quantize` per-tensor progress lines.
    TensorLines,
}

/// JSON progress line emitted by the embedded Python scripts on stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptProgressLine {
    pub stage: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub output_size: Option<u64>,
}

/// A single external-process stage.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub output: OutputCheck,
    /// Skip execution when the declared output is already satisfied.
    pub skip_if_done: bool,
    pub progress: ProgressStyle,
    /// Per-stage wall-clock bound; falls back to the runner's default.
    pub timeout: Option<Duration>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            output: OutputCheck::None,
            skip_if_done: false,
            progress: ProgressStyle::Silent,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn output(mut self, output: OutputCheck) -> Self {
        self.output = output;
        self
    }

    pub fn skip_if_done(mut self) -> Self {
        self.skip_if_done = true;
        self
    }

    pub fn progress(mut self, progress: ProgressStyle) -> Self {
        self.progress = progress;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Executes stages with a configurable wall-clock timeout.
pub struct StageRunner {
    timeout: Duration,
}

impl StageRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run one stage to completion.
    ///
    /// Returns `Skipped` without spawning when the skip predicate holds;
    /// otherwise spawns the external process, drains its output, and maps
    /// exit status plus output presence to the terminal status.
    pub async fn run(&self, spec: &StageSpec) -> StageResult {
        if spec.skip_if_done && spec.output.satisfied() {
            let what = spec.output.describe().unwrap_or_else(|| "output".to_string());
            info!("[{}] skipped: {} already present", spec.name, what);
            return StageResult {
                output_bytes: spec.output.size_bytes(),
                ..StageResult::skipped(&spec.name, format!("{what} already present"))
            };
        }

        info!("[{}] starting: {}", spec.name, spec.program.display());
        let started = Instant::now();

        let mut child = match Command::new(&spec.program)
            .args(&spec.args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to spawn {}: {e}", spec.program.display());
                warn!("[{}] {}", spec.name, message);
                return StageResult::failed(&spec.name, message, started.elapsed());
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = stdout.map(|out| {
            tokio::spawn(drain_lines(out, spec.name.clone(), spec.progress, false))
        });
        let stderr_task = stderr.map(|err| {
            tokio::spawn(drain_lines(err, spec.name.clone(), spec.progress, true))
        });

        let timeout = spec.timeout.unwrap_or(self.timeout);
        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                let message = format!("process error: {e}");
                warn!("[{}] {}", spec.name, message);
                return StageResult::failed(&spec.name, message, started.elapsed());
            }
            Err(_) => {
                child.kill().await.ok();
                let message = format!("timed out after {timeout:?}");
                warn!("[{}] {}", spec.name, message);
                return StageResult::failed(&spec.name, message, started.elapsed());
            }
        };

        let stdout_tail = join_tail(stdout_task).await;
        let stderr_tail = join_tail(stderr_task).await;
        let elapsed = started.elapsed();

        if !status.success() {
            let tail = if stderr_tail.is_empty() { &stdout_tail } else { &stderr_tail };
            let mut message = format!("exited with status {}", status.code().unwrap_or(-1));
            if !tail.is_empty() {
                message.push_str(&format!(": {}", tail.join(" | ")));
            }
            warn!("[{}] {}", spec.name, message);
            return StageResult::failed(&spec.name, message, elapsed);
        }

        // Exit-code distrust: zero exit without the declared output is a
        // failure, not a success.
        if !spec.output.satisfied() {
            let what = spec.output.describe().unwrap_or_else(|| "output".to_string());
            let message = format!("exited 0 but expected output is missing or empty: {what}");
            warn!("[{}] {}", spec.name, message);
            return StageResult::failed(&spec.name, message, elapsed);
        }

        let output_bytes = spec.output.size_bytes();
        info!(
            "[{}] succeeded in {:.1}s{}",
            spec.name,
            elapsed.as_secs_f64(),
            output_bytes
                .map(|b| format!(" ({:.1} MiB)", b as f64 / (1024.0 * 1024.0)))
                .unwrap_or_default()
        );
        StageResult::succeeded(&spec.name, elapsed, output_bytes)
    }
}

/// Drain one output stream line by line, keeping a diagnostic tail.
async fn drain_lines(
    reader: impl AsyncRead + Unpin,
    stage: String,
    progress: ProgressStyle,
    is_stderr: bool,
) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut tail: Vec<String> = Vec::new();

    while let Ok(Some(line)) = lines.next_line().await {
        match progress {
            ProgressStyle::JsonLines if !is_stderr => {
                if let Ok(parsed) = serde_json::from_str::<ScriptProgressLine>(&line) {
                    match parsed.message {
                        Some(message) => info!("[{}] {}: {}", stage, parsed.stage, message),
                        None => debug!("[{}] {}", stage, parsed.stage),
                    }
                } else {
                    debug!("[{}] {}", stage, line);
                }
            }
            ProgressStyle::TensorLines => {
                if let Some((index, total, tensor)) = parse_tensor_progress(&line) {
                    debug!("[{}] tensor {}/{} {}", stage, index, total, tensor);
                } else {
                    debug!("[{}] {}", stage, line);
                }
            }
            _ => debug!("[{}] {}", stage, line),
        }

        if tail.len() == DIAGNOSTIC_TAIL_LINES {
            tail.remove(0);
        }
        tail.push(line);
    }
    tail
}

async fn join_tail(task: Option<tokio::task::JoinHandle<Vec<String>>>) -> Vec<String> {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Parse a `llama-quantize` per-tensor progress line.
///
/// llama-quantize emits lines like:
/// ```text
/// [ 123/ 456]  model.layers.5.attn_k.weight - [ 4096,  4096,     1,     1], type = f16, ...
/// ```
pub fn parse_tensor_progress(line: &str) -> Option<(u32, u32, &str)> {
    static TENSOR_RE: OnceLock<Regex> = OnceLock::new();
    let re = TENSOR_RE
        .get_or_init(|| Regex::new(r"\[\s*(\d+)/\s*(\d+)\]\s+(\S+)").expect("valid regex"));
    let caps = re.captures(line)?;
    let index = caps[1].parse().ok()?;
    let total = caps[2].parse().ok()?;
    Some((index, total, caps.get(3)?.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(name: &str, script: &str) -> StageSpec {
        StageSpec::new(name, "/bin/sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_success_requires_output() {
        // Exit-code distrust: exit 0 with a missing declared output fails.
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("never-written.gguf");
        let runner = StageRunner::new(Duration::from_secs(5));

        let spec = sh("convert", "exit 0").output(OutputCheck::File(missing.clone()));
        let result = runner.run(&spec).await;
        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.message.unwrap().contains("missing or empty"));

        // An empty output file is not success either.
        std::fs::write(&missing, b"").unwrap();
        let result = runner.run(&spec).await;
        assert_eq!(result.status, StageStatus::Failed);
    }

    #[tokio::test]
    async fn test_succeeds_with_output() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("model.gguf");
        let runner = StageRunner::new(Duration::from_secs(5));

        let spec = sh("convert", &format!("echo data > {}", out.display()))
            .output(OutputCheck::File(out.clone()));
        let result = runner.run(&spec).await;
        assert_eq!(result.status, StageStatus::Succeeded);
        assert!(result.output_bytes.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_diagnostics() {
        let runner = StageRunner::new(Duration::from_secs(5));
        let spec = sh("merge", "echo boom >&2; exit 3");
        let result = runner.run(&spec).await;
        assert_eq!(result.status, StageStatus::Failed);
        let message = result.message.unwrap();
        assert!(message.contains("status 3"));
        assert!(message.contains("boom"));
    }

    #[tokio::test]
    async fn test_skip_when_output_present() {
        // A skippable stage whose output exists must not spawn the process;
        // the command here would fail if it ran.
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("model.gguf");
        std::fs::write(&out, b"already converted").unwrap();

        let runner = StageRunner::new(Duration::from_secs(5));
        let spec = sh("convert", "exit 1")
            .output(OutputCheck::File(out))
            .skip_if_done();
        let result = runner.run(&spec).await;
        assert_eq!(result.status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_empty_output_does_not_skip() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("model.gguf");
        std::fs::write(&out, b"").unwrap();

        let runner = StageRunner::new(Duration::from_secs(5));
        let spec = sh("convert", &format!("echo data > {}", out.display()))
            .output(OutputCheck::File(out))
            .skip_if_done();
        let result = runner.run(&spec).await;
        assert_eq!(result.status, StageStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_timeout_fails() {
        let runner = StageRunner::new(Duration::from_millis(100));
        let spec = sh("merge", "sleep 5");
        let result = runner.run(&spec).await;
        assert_eq!(result.status, StageStatus::Failed);
        assert!(result.message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_weights_dir_output() {
        let temp = TempDir::new().unwrap();
        let merged = temp.path().join("merged");
        std::fs::create_dir_all(&merged).unwrap();

        let check = OutputCheck::WeightsDir(merged.clone());
        assert!(!check.satisfied());

        std::fs::write(merged.join("model.safetensors"), b"weights").unwrap();
        assert!(check.satisfied());
        assert_eq!(check.size_bytes(), Some(7));
    }

    #[test]
    fn test_parse_tensor_progress() {
        let line = "[ 123/ 456]  model.layers.5.attn_k.weight - [ 4096, 4096, 1, 1], type = f16";
        assert_eq!(
            parse_tensor_progress(line),
            Some((123, 456, "model.layers.5.attn_k.weight"))
        );
        assert_eq!(parse_tensor_progress("main: build = 1234"), None);
    }

    #[test]
    fn test_spawn_failure_is_failed() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let runner = StageRunner::new(Duration::from_secs(1));
            let spec = StageSpec::new("merge", "/nonexistent/binary");
            let result = runner.run(&spec).await;
            assert_eq!(result.status, StageStatus::Failed);
            assert!(result.message.unwrap().contains("failed to spawn"));
        });
    }
}
