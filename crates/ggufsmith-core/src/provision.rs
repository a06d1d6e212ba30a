//! Python environment provisioning.
//!
//! Creates an isolated virtual environment with the merge/conversion
//! dependencies installed. Provisioning is idempotent: the venv's python
//! binary is the marker, and an existing environment is reused without
//! touching the package index.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::StageTimeouts;
use crate::error::{Error, Result};
use crate::scripts;

/// Package index hostnames that pip is told to trust explicitly.
///
/// A fixed allowlist for hosts with flaky TLS interception on some
/// networks; verification stays on for everything else.
pub const TRUSTED_HOSTS: &[&str] = &["pypi.org", "pypi.python.org", "files.pythonhosted.org"];

/// Handle over a provisioned execution environment.
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    venv_dir: PathBuf,
}

impl EnvironmentHandle {
    /// Path to the Python binary inside the venv.
    pub fn python(&self) -> PathBuf {
        self.venv_dir.join("bin").join("python")
    }

    #[cfg(test)]
    pub(crate) fn for_tests(venv_dir: PathBuf) -> Self {
        Self { venv_dir }
    }
}

/// Provisions the Python environment under the artifact root.
pub struct Provisioner {
    root: PathBuf,
}

impl Provisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn venv_dir(&self) -> PathBuf {
        self.root.join("venv")
    }

    fn venv_python(&self) -> PathBuf {
        self.venv_dir().join("bin").join("python")
    }

    /// Whether the environment marker is present.
    pub fn is_provisioned(&self) -> bool {
        self.venv_python().exists()
    }

    /// Ensure the isolated environment exists with all declared
    /// dependencies installed.
    ///
    /// Reuses an existing venv (marker: the venv python binary). A failed
    /// dependency install is fatal: later stages must not run against an
    /// unmet dependency set. The pip self-upgrade is best-effort.
    pub async fn ensure_environment(&self) -> Result<EnvironmentHandle> {
        scripts::ensure_scripts_deployed(&self.root)?;

        let venv_dir = self.venv_dir();
        let python = self.venv_python();
        let handle = EnvironmentHandle {
            venv_dir: venv_dir.clone(),
        };

        if python.exists() {
            debug!("Reusing existing venv at {}", venv_dir.display());
            return Ok(handle);
        }

        info!("Creating virtual environment at {}", venv_dir.display());
        let output = run_with_timeout(
            Command::new("python3").args(["-m", "venv", &venv_dir.to_string_lossy()]),
            StageTimeouts::VENV_CREATION,
            "venv creation",
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Provisioning {
                message: format!(
                    "Failed to create Python venv. Ensure python3 is installed. Error: {stderr}"
                ),
            });
        }

        // Upgrade pip first; transient index failures here are non-fatal.
        let output = run_with_timeout(
            Command::new(&python)
                .args(["-m", "pip", "install", "--upgrade", "pip"])
                .args(trusted_host_args()),
            StageTimeouts::PIP_INSTALL,
            "pip upgrade",
        )
        .await;
        match output {
            Ok(o) if !o.status.success() => {
                warn!(
                    "pip upgrade failed (non-fatal): {}",
                    String::from_utf8_lossy(&o.stderr)
                );
            }
            Err(e) => warn!("pip upgrade failed (non-fatal): {e}"),
            _ => {}
        }

        let requirements = scripts::requirements_path(&self.root);
        info!("Installing merge dependencies from {}", requirements.display());
        let output = run_with_timeout(
            Command::new(&python)
                .args(["-m", "pip", "install", "-r", &requirements.to_string_lossy()])
                .args(trusted_host_args()),
            StageTimeouts::PIP_INSTALL,
            "pip install",
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Provisioning {
                message: format!("Failed to install merge dependencies: {stderr}"),
            });
        }

        info!("Python environment ready");
        Ok(handle)
    }
}

/// `--trusted-host` argument pairs for each allowlisted index host.
fn trusted_host_args() -> Vec<String> {
    TRUSTED_HOSTS
        .iter()
        .flat_map(|host| ["--trusted-host".to_string(), (*host).to_string()])
        .collect()
}

/// Run a command to completion, bounded by a wall-clock timeout.
async fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
    what: &str,
) -> Result<std::process::Output> {
    let fut = cmd.kill_on_drop(true).output();
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|e| Error::Provisioning {
            message: format!("Failed to run {what}: {e}"),
        }),
        Err(_) => Err(Error::Provisioning {
            message: format!("{what} timed out after {timeout:?}"),
        }),
    }
}
