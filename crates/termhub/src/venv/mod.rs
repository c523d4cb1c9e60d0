//! Python virtual environment orchestration.
//!
//! Drives a shell session through environment setup by sending it synthetic
//! keystrokes and observing the filesystem for results. The orchestrator
//! never parses terminal output; progress is inferred from marker files
//! (`bin/activate` appearing under the environment directory) polled on an
//! interval.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::session::{AutoInstallDeps, EnvironmentState, SessionConfig};
use crate::term::{ShellInput, TermError};

/// Phase of environment orchestration, reported to clients as it advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VenvPhase {
    NotApplicable,
    Detected,
    PythonFound,
    EnvExists,
    Creating,
    Created,
    Activating,
    Activated,
    Ready,
    AskInstall,
    Installing,
    InstallStarted,
    Error,
}

/// A single progress report.
#[derive(Debug, Clone, Serialize)]
pub struct VenvStatus {
    pub phase: VenvPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

impl VenvStatus {
    pub fn new(phase: VenvPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            remediation: None,
            link: None,
        }
    }

    pub fn error(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self {
            phase: VenvPhase::Error,
            message: message.into(),
            remediation: Some(remediation.into()),
            link: None,
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }
}

/// Timing knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct VenvSettings {
    /// How often to check for the environment marker during creation.
    pub poll_interval: Duration,
    /// How long to wait for environment creation before giving up.
    pub create_timeout: Duration,
    /// Delay between triggering an install and reporting it as started.
    pub install_notify_delay: Duration,
}

impl Default for VenvSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            create_timeout: Duration::from_secs(30),
            install_notify_delay: Duration::from_millis(1500),
        }
    }
}

/// Files whose presence marks a directory as a Python project.
const MANIFEST_FILES: &[&str] = &[
    "requirements.txt",
    "pyproject.toml",
    "setup.py",
    "setup.cfg",
    "Pipfile",
];

/// Directory names checked for an existing environment, in priority order.
const ENV_DIR_CANDIDATES: &[&str] = &[".venv", "venv", "env"];

/// Name of the environment directory the orchestrator creates.
const CREATED_ENV_DIR: &str = ".venv";

#[cfg(windows)]
const ACTIVATE_MARKER: &str = "Scripts/activate";
#[cfg(not(windows))]
const ACTIVATE_MARKER: &str = "bin/activate";

/// Interpreter location inside an environment directory.
#[cfg(windows)]
const ENV_PYTHON: &str = "Scripts/python.exe";
#[cfg(not(windows))]
const ENV_PYTHON: &str = "bin/python";

const PYTHON_DOWNLOAD_URL: &str = "https://www.python.org/downloads/";

/// True when `cwd` contains a Python manifest or any top-level `.py` file.
pub async fn is_python_project(cwd: &Path) -> bool {
    for manifest in MANIFEST_FILES {
        if cwd.join(manifest).exists() {
            return true;
        }
    }

    let Ok(mut entries) = tokio::fs::read_dir(cwd).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "py") {
            return true;
        }
    }
    false
}

/// An existing environment directory under `cwd`, identified by its
/// activation script.
pub fn find_existing_env(cwd: &Path) -> Option<PathBuf> {
    ENV_DIR_CANDIDATES
        .iter()
        .map(|name| cwd.join(name))
        .find(|dir| dir.join(ACTIVATE_MARKER).exists())
}

/// The shell command that installs this project's dependencies, if the
/// project declares any.
pub fn install_command(cwd: &Path) -> Option<String> {
    if cwd.join("requirements.txt").exists() {
        Some("pip install -r requirements.txt".to_string())
    } else if cwd.join("pyproject.toml").exists()
        || cwd.join("setup.py").exists()
        || cwd.join("setup.cfg").exists()
    {
        Some("pip install -e .".to_string())
    } else if cwd.join("Pipfile").exists() {
        Some("pipenv install".to_string())
    } else {
        None
    }
}

/// First candidate command that responds to `--version`.
pub async fn resolve_runtime(candidates: &[&str]) -> Option<String> {
    for candidate in candidates {
        match tokio::process::Command::new(candidate)
            .arg("--version")
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
                debug!("resolved runtime {candidate}: {version}");
                return Some(candidate.to_string());
            }
            Ok(_) => debug!("runtime candidate {candidate} failed --version"),
            Err(e) => debug!("runtime candidate {candidate} not usable: {e}"),
        }
    }
    None
}

/// Trigger a dependency install in the shell and report progress.
///
/// The install itself is fire and forget: the command is typed into the
/// shell and `install-started` is reported after a short delay, without
/// waiting for pip to finish.
pub async fn trigger_install(
    shell: &dyn ShellInput,
    command: &str,
    status_tx: &mpsc::Sender<VenvStatus>,
    notify_delay: Duration,
) -> Result<(), TermError> {
    shell.write_input(&format!("{command}\n"))?;
    let _ = status_tx
        .send(VenvStatus::new(
            VenvPhase::Installing,
            format!("Installing dependencies: {command}"),
        ))
        .await;

    tokio::time::sleep(notify_delay).await;
    let _ = status_tx
        .send(VenvStatus::new(
            VenvPhase::InstallStarted,
            "Dependency installation started".to_string(),
        ))
        .await;
    Ok(())
}

/// Run the full orchestration for one session.
///
/// Returns the resulting environment state, or `None` when orchestration
/// stopped early (not a Python project, missing runtime, creation timeout,
/// or creation disabled). Errors are reported on `status_tx` as well as
/// logged; only shell write failures abort with `Err`.
pub async fn run(
    cwd: &Path,
    config: &SessionConfig,
    settings: &VenvSettings,
    shell: &dyn ShellInput,
    status_tx: &mpsc::Sender<VenvStatus>,
) -> Result<Option<EnvironmentState>, TermError> {
    let send = |status: VenvStatus| async {
        let _ = status_tx.send(status).await;
    };

    if !is_python_project(cwd).await {
        send(VenvStatus::new(
            VenvPhase::NotApplicable,
            "Not a Python project",
        ))
        .await;
        return Ok(None);
    }
    send(VenvStatus::new(VenvPhase::Detected, "Python project detected")).await;

    let Some(runtime) =
        resolve_runtime(&[config.preferred_runtime_command.as_str(), "python"]).await
    else {
        warn!("no python runtime found in {}", cwd.display());
        send(
            VenvStatus::error(
                "No Python runtime found",
                format!(
                    "Install Python or set preferredRuntimeCommand (tried `{}` and `python`)",
                    config.preferred_runtime_command
                ),
            )
            .with_link(PYTHON_DOWNLOAD_URL),
        )
        .await;
        return Ok(None);
    };
    send(VenvStatus::new(
        VenvPhase::PythonFound,
        format!("Using runtime `{runtime}`"),
    ))
    .await;

    let env_dir = match find_existing_env(cwd) {
        Some(existing) => {
            send(VenvStatus::new(
                VenvPhase::EnvExists,
                format!("Found existing environment at {}", existing.display()),
            ))
            .await;
            existing
        }
        None => {
            if !config.auto_create_env {
                send(VenvStatus::error(
                    "No virtual environment found",
                    "Create one manually or enable autoCreateEnv",
                ))
                .await;
                return Ok(None);
            }
            match create_env(cwd, &runtime, settings, shell, status_tx).await? {
                Some(created) => created,
                None => return Ok(None),
            }
        }
    };

    if !config.auto_activate_env {
        info!("environment ready at {} (activation disabled)", env_dir.display());
        send(VenvStatus::new(VenvPhase::Ready, "Environment ready")).await;
        let runtime_executable = env_dir.join(ENV_PYTHON);
        return Ok(Some(EnvironmentState {
            active: false,
            path: Some(env_dir),
            runtime_executable: Some(runtime_executable),
        }));
    }

    send(VenvStatus::new(
        VenvPhase::Activating,
        "Activating environment",
    ))
    .await;
    shell.write_input(&format!(
        "source {}\n",
        env_dir.join(ACTIVATE_MARKER).display()
    ))?;
    send(VenvStatus::new(VenvPhase::Activated, "Environment activated")).await;

    let runtime_executable = env_dir.join(ENV_PYTHON);
    let state = EnvironmentState {
        active: true,
        path: Some(env_dir),
        runtime_executable: Some(runtime_executable),
    };

    match install_command(cwd) {
        None => {
            send(VenvStatus::new(VenvPhase::Ready, "Environment ready")).await;
        }
        Some(command) => match config.auto_install_deps {
            AutoInstallDeps::Never => {
                send(VenvStatus::new(VenvPhase::Ready, "Environment ready")).await;
            }
            AutoInstallDeps::Ask => {
                send(VenvStatus::new(
                    VenvPhase::AskInstall,
                    format!("Dependencies found. Install with `{command}`?"),
                ))
                .await;
            }
            AutoInstallDeps::Always => {
                // Install completion is never observed; install-started
                // is the final report.
                trigger_install(shell, &command, status_tx, settings.install_notify_delay)
                    .await?;
            }
        },
    }

    Ok(Some(state))
}

/// Create a new environment and poll for its activation marker.
async fn create_env(
    cwd: &Path,
    runtime: &str,
    settings: &VenvSettings,
    shell: &dyn ShellInput,
    status_tx: &mpsc::Sender<VenvStatus>,
) -> Result<Option<PathBuf>, TermError> {
    let env_dir = cwd.join(CREATED_ENV_DIR);
    let marker = env_dir.join(ACTIVATE_MARKER);

    shell.write_input(&format!("{runtime} -m venv {CREATED_ENV_DIR}\n"))?;
    let _ = status_tx
        .send(VenvStatus::new(
            VenvPhase::Creating,
            "Creating virtual environment",
        ))
        .await;

    let started = Instant::now();
    loop {
        tokio::time::sleep(settings.poll_interval).await;
        if marker.exists() {
            break;
        }

        let elapsed = started.elapsed();
        if elapsed >= settings.create_timeout {
            warn!(
                "venv creation in {} timed out after {:?}",
                cwd.display(),
                elapsed
            );
            let _ = status_tx
                .send(VenvStatus::error(
                    format!(
                        "Environment creation timed out after {}s",
                        settings.create_timeout.as_secs()
                    ),
                    format!("Run `{runtime} -m venv {CREATED_ENV_DIR}` manually and check its output"),
                ))
                .await;
            return Ok(None);
        }

        // Re-report so clients can tell a slow creation from a stall.
        let _ = status_tx
            .send(VenvStatus::new(
                VenvPhase::Creating,
                format!("Creating virtual environment ({}s)", elapsed.as_secs()),
            ))
            .await;
    }

    let _ = status_tx
        .send(VenvStatus::new(
            VenvPhase::Created,
            format!("Environment created at {}", env_dir.display()),
        ))
        .await;
    Ok(Some(env_dir))
}
