//! Phased execution context
//!
//! A pipeline is an ordered list of named phases. The context keeps a
//! pointer to the running phase and the set of completed phases in the
//! state cache, so a second invocation skips finished phases and resumes
//! at the first incomplete one.

use crate::cache::{StateCache, StateCacheExt};
use crate::error::{DestroyError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Named checkpoint within a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "AllNodesPhase")]
    AllNodes,
    #[serde(rename = "BaseInfraPhase")]
    BaseInfra,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::AllNodes => "AllNodesPhase",
            Phase::BaseInfra => "BaseInfraPhase",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phases of the destroy pipeline, in execution order
pub const DESTROY_PHASES: &[Phase] = &[Phase::AllNodes, Phase::BaseInfra];

/// What the caller should do after a phase transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseAction {
    /// Execute the phase
    Run,
    /// A previous run already completed this phase
    Skip,
    /// The configured stop point was reached; return without further work
    Stop,
}

impl PhaseAction {
    pub fn should_run(&self) -> bool {
        matches!(self, PhaseAction::Run)
    }

    pub fn should_stop(&self) -> bool {
        matches!(self, PhaseAction::Stop)
    }
}

/// Persisted pipeline progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineProgress {
    pub operation: String,
    pub current_phase: Option<Phase>,
    pub completed_phases: Vec<Phase>,
    pub next_phase: Option<Phase>,
    pub completed: bool,
}

impl PipelineProgress {
    pub fn is_phase_completed(&self, phase: Phase) -> bool {
        self.completed_phases.contains(&phase)
    }
}

#[derive(Debug, Default)]
struct ContextState {
    progress: PipelineProgress,
    running: Option<Phase>,
    initialized: bool,
}

#[derive(Debug)]
pub struct PhasedExecutionContext {
    operation: String,
    phases: Vec<Phase>,
    stop_after: Option<Phase>,
    progress_file: Option<PathBuf>,
    state: Mutex<ContextState>,
}

impl PhasedExecutionContext {
    pub fn new(operation: impl Into<String>, phases: &[Phase]) -> Self {
        Self {
            operation: operation.into(),
            phases: phases.to_vec(),
            stop_after: None,
            progress_file: None,
            state: Mutex::new(ContextState::default()),
        }
    }

    /// Context for the destroy pipeline
    pub fn for_destroy() -> Self {
        Self::new("destroy", DESTROY_PHASES)
    }

    /// Stop the pipeline once `phase` completes
    pub fn with_stop_after(mut self, phase: Phase) -> Self {
        self.stop_after = Some(phase);
        self
    }

    /// Mirror progress as JSON into `path` on every transition
    pub fn with_progress_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.progress_file = Some(path.into());
        self
    }

    fn cache_key(&self) -> String {
        format!("{}-phase-progress", self.operation)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the pipeline in the cache, resuming previous progress if present
    pub fn init_pipeline(&self, cache: &dyn StateCache) -> Result<()> {
        let key = self.cache_key();
        let progress = match cache.load_struct_opt::<PipelineProgress>(&key) {
            Ok(Some(progress)) => {
                info!(
                    operation = %self.operation,
                    completed = ?progress.completed_phases,
                    current = ?progress.current_phase,
                    "Resuming pipeline from cached progress"
                );
                progress
            }
            Ok(None) => PipelineProgress {
                operation: self.operation.clone(),
                next_phase: self.phases.first().copied(),
                ..Default::default()
            },
            Err(e) if e.is_decode() => {
                warn!(error = %e, "Cached pipeline progress is corrupt, starting over");
                PipelineProgress {
                    operation: self.operation.clone(),
                    next_phase: self.phases.first().copied(),
                    ..Default::default()
                }
            }
            Err(e) => return Err(e.into()),
        };

        let mut state = self.lock();
        state.progress = progress;
        state.running = None;
        state.initialized = true;
        self.persist(cache, &state.progress)
    }

    /// Move the pointer to `phase`
    ///
    /// # Returns
    /// * `PhaseAction::Skip` - phase finished in a previous run, or `is_first`
    ///   and the cached pointer is already past it
    /// * `PhaseAction::Run` - caller executes the phase
    pub fn start_phase(
        &self,
        phase: Phase,
        is_first: bool,
        cache: &dyn StateCache,
    ) -> Result<PhaseAction> {
        let mut state = self.lock();
        if !state.initialized {
            return Err(DestroyError::Precondition(
                "phased execution context used before init_pipeline".to_string(),
            ));
        }

        if state.progress.is_phase_completed(phase) {
            info!(phase = %phase, "Phase already completed, skipping");
            return Ok(PhaseAction::Skip);
        }

        if is_first {
            if let Some(current) = state.progress.current_phase {
                if self.index_of(current)? > self.index_of(phase)? {
                    info!(phase = %phase, current = %current, "Pipeline is past this phase, skipping");
                    return Ok(PhaseAction::Skip);
                }
            }
        }

        let next = self.next_after(phase)?;
        state.running = Some(phase);
        state.progress.current_phase = Some(phase);
        state.progress.next_phase = next;
        self.persist(cache, &state.progress)?;

        info!(operation = %self.operation, phase = %phase, "Starting phase");
        Ok(PhaseAction::Run)
    }

    /// Complete the running phase (if any) and start `next`
    pub fn switch_phase(&self, next: Phase, cache: &dyn StateCache) -> Result<PhaseAction> {
        {
            let mut state = self.lock();
            if let Some(running) = state.running.take() {
                if self.index_of(next)? <= self.index_of(running)? {
                    return Err(DestroyError::Internal(format!(
                        "cannot switch from {running} back to {next}"
                    )));
                }
                self.mark_completed(&mut state.progress, running);
                self.persist(cache, &state.progress)?;

                if self.stop_after == Some(running) {
                    info!(phase = %running, "Stop requested after phase");
                    return Ok(PhaseAction::Stop);
                }
            }
        }
        self.start_phase(next, false, cache)
    }

    /// Complete the running phase and mark the whole pipeline done
    pub fn complete_phase(&self, cache: &dyn StateCache) -> Result<()> {
        let mut state = self.lock();
        if let Some(running) = state.running.take() {
            self.mark_completed(&mut state.progress, running);
        }
        state.progress.current_phase = None;
        state.progress.next_phase = None;
        state.progress.completed = true;
        self.persist(cache, &state.progress)?;

        info!(operation = %self.operation, "Pipeline completed");
        Ok(())
    }

    /// Snapshot of current progress
    pub fn progress(&self) -> PipelineProgress {
        self.lock().progress.clone()
    }

    fn mark_completed(&self, progress: &mut PipelineProgress, phase: Phase) {
        if !progress.completed_phases.contains(&phase) {
            progress.completed_phases.push(phase);
        }
        debug!(phase = %phase, "Phase completed");
    }

    fn index_of(&self, phase: Phase) -> Result<usize> {
        self.phases
            .iter()
            .position(|p| *p == phase)
            .ok_or_else(|| {
                DestroyError::Internal(format!(
                    "phase {phase} is not part of the {} pipeline",
                    self.operation
                ))
            })
    }

    fn next_after(&self, phase: Phase) -> Result<Option<Phase>> {
        let idx = self.index_of(phase)?;
        Ok(self.phases.get(idx + 1).copied())
    }

    fn persist(&self, cache: &dyn StateCache, progress: &PipelineProgress) -> Result<()> {
        cache.save_struct(&self.cache_key(), progress)?;

        if let Some(path) = &self.progress_file {
            let written = serde_json::to_vec_pretty(progress)
                .map_err(std::io::Error::other)
                .and_then(|bytes| std::fs::write(path, bytes));
            if let Err(e) = written {
                warn!(path = %path.display(), error = %e, "Failed to write progress file");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "phases_test.rs"]
mod tests;
