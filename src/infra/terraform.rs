use super::{InfraEngine, InfraStep, NodeDestroyRequest};
use crate::error::{DestroyError, Result};
use crate::meta::MetaConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STDERR_TAIL_LINES: usize = 20;

/// Engine driving a terraform-compatible binary over the provider modules
#[derive(Debug, Clone)]
pub struct TerraformEngine {
    binary: PathBuf,
    modules_dir: PathBuf,
    work_dir: PathBuf,
    cancel: CancellationToken,
}

impl TerraformEngine {
    /// # Arguments
    /// * `binary` - engine executable
    /// * `modules_dir` - root holding `<provider>/layouts/<layout>/<step>`
    /// * `work_dir` - scratch directory for state and variable files
    pub fn new(
        binary: impl Into<PathBuf>,
        modules_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            binary: binary.into(),
            modules_dir: modules_dir.into(),
            work_dir: work_dir.into(),
            cancel,
        }
    }

    pub fn module_dir(&self, meta: &MetaConfig, step: InfraStep) -> PathBuf {
        self.modules_dir
            .join(&meta.provider_name)
            .join("layouts")
            .join(&meta.layout)
            .join(step.as_str())
    }

    /// Full argument list of a destroy run
    pub fn destroy_args(&self, module_dir: &Path, state_file: &Path, vars_file: &Path) -> Vec<String> {
        vec![
            format!("-chdir={}", module_dir.display()),
            "destroy".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
            "-no-color".to_string(),
            format!("-state={}", state_file.display()),
            format!("-var-file={}", vars_file.display()),
        ]
    }

    async fn run_destroy(
        &self,
        name: &str,
        meta: &MetaConfig,
        step: InfraStep,
        variables: serde_json::Value,
        state: &[u8],
    ) -> Result<Vec<u8>> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let state_file = self.work_dir.join(format!("{name}.tfstate"));
        let vars_file = self.work_dir.join(format!("{name}.tfvars.json"));
        tokio::fs::write(&state_file, state).await?;
        let vars = serde_json::to_vec_pretty(&variables)
            .map_err(|e| DestroyError::Internal(format!("cannot encode engine variables: {e}")))?;
        tokio::fs::write(&vars_file, vars).await?;

        let module_dir = self.module_dir(meta, step);
        let args = self.destroy_args(&module_dir, &state_file, &vars_file);
        info!(name = %name, step = %step, module = %module_dir.display(), "Running infrastructure destroy");

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DestroyError::InfraEngine(format!("cannot start {}: {e}", self.binary.display()))
            })?;

        // Dropping the child on cancellation kills it
        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = self.cancel.cancelled() => {
                warn!(name = %name, "Infrastructure destroy interrupted");
                return Err(DestroyError::Cancelled);
            }
        };

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(name = %name, "{line}");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            let message = format!(
                "{} destroy of {name} exited with {}: {tail}",
                self.binary.display(),
                output.status.code().unwrap_or(-1)
            );
            // Some resources may already be gone; the caller keeps what the engine recorded
            return Err(match tokio::fs::read(&state_file).await {
                Ok(partial) if partial != state => {
                    warn!(name = %name, "Infrastructure engine failed with a changed state");
                    DestroyError::InfraEnginePartial {
                        message,
                        state: partial,
                    }
                }
                _ => DestroyError::InfraEngine(message),
            });
        }

        let new_state = tokio::fs::read(&state_file).await?;
        for file in [&state_file, &vars_file] {
            if let Err(e) = tokio::fs::remove_file(file).await {
                debug!(path = %file.display(), error = %e, "Cannot remove engine scratch file");
            }
        }
        Ok(new_state)
    }
}

#[async_trait]
impl InfraEngine for TerraformEngine {
    async fn destroy_node(&self, request: NodeDestroyRequest<'_>) -> Result<Vec<u8>> {
        let variables = request.meta.engine_variables(Some((
            request.node_group,
            request.node_index,
            request.settings,
        )));
        self.run_destroy(
            request.node_name,
            request.meta,
            request.step,
            variables,
            request.state,
        )
        .await
    }

    async fn destroy_base_infra(&self, meta: &MetaConfig, state: &[u8]) -> Result<Vec<u8>> {
        let name = if meta.cluster_prefix.is_empty() {
            "base-infrastructure".to_string()
        } else {
            format!("{}-base-infrastructure", meta.cluster_prefix)
        };
        self.run_destroy(
            &name,
            meta,
            InfraStep::BaseInfrastructure,
            meta.engine_variables(None),
            state,
        )
        .await
    }
}
