//! Engine Supervisor
//!
//! Runs several tournament engines in one process, one tokio task per
//! participant. A failing engine only ends its own run; its error is logged
//! with the participant alias and kept for [`EngineSupervisor::join_all`].

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::tournament::TournamentEngine;
use super::EngineError;
use crate::core::state::Outcome;
use crate::ledger::Ledger;

/// Caller-assigned run identifier.
pub type RunId = uuid::Uuid;

/// Why a run produced no outcome.
#[derive(Debug, Error)]
pub enum RunError {
    /// The engine stopped on a fatal error.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The run was aborted by [`EngineSupervisor::shutdown`].
    #[error("run cancelled")]
    Cancelled,
    /// The engine task panicked.
    #[error("run panicked: {0}")]
    Panicked(String),
}

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A run with this id is already tracked.
    #[error("run {0} already exists")]
    DuplicateRun(RunId),
}

/// Final report of one run.
#[derive(Debug)]
pub struct RunReport {
    /// Run id.
    pub id: RunId,
    /// Participant alias.
    pub alias: String,
    /// Outcome or failure.
    pub result: Result<Outcome, RunError>,
}

struct RunEntry {
    alias: String,
    handle: JoinHandle<Result<Outcome, EngineError>>,
}

/// Runs tournament engines concurrently.
pub struct EngineSupervisor {
    runs: RwLock<BTreeMap<RunId, RunEntry>>,
}

impl EngineSupervisor {
    /// Create an empty supervisor.
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Start `engine` under `id`.
    pub async fn spawn<L: Ledger>(
        &self,
        id: RunId,
        mut engine: TournamentEngine<L>,
    ) -> Result<(), SupervisorError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&id) {
            return Err(SupervisorError::DuplicateRun(id));
        }

        let alias = engine.alias().to_string();
        let task_alias = alias.clone();
        let handle = tokio::spawn(async move {
            let result = engine.register_and_play().await;
            match &result {
                Ok(outcome) => info!(run = %id, alias = %task_alias, %outcome, "Run finished"),
                Err(err) => error!(run = %id, alias = %task_alias, %err, "Run failed"),
            }
            result
        });

        runs.insert(id, RunEntry { alias, handle });
        Ok(())
    }

    /// Runs still in progress.
    pub async fn active_count(&self) -> usize {
        let runs = self.runs.read().await;
        runs.values().filter(|r| !r.handle.is_finished()).count()
    }

    /// Runs tracked, finished or not.
    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }

    /// Wait for every run and collect the reports, in run id order.
    pub async fn join_all(&self) -> Vec<RunReport> {
        let runs = std::mem::take(&mut *self.runs.write().await);

        let mut reports = Vec::with_capacity(runs.len());
        for (id, entry) in runs {
            let result = match entry.handle.await {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(err)) => Err(RunError::Engine(err)),
                Err(join) if join.is_cancelled() => Err(RunError::Cancelled),
                Err(join) => Err(RunError::Panicked(join.to_string())),
            };
            reports.push(RunReport {
                id,
                alias: entry.alias,
                result,
            });
        }
        reports
    }

    /// Abort every run still in progress.
    pub async fn shutdown(&self) {
        let runs = self.runs.read().await;
        let mut aborted = 0;
        for entry in runs.values() {
            if !entry.handle.is_finished() {
                entry.handle.abort();
                aborted += 1;
            }
        }
        info!(aborted, "Supervisor shut down");
    }
}

impl Default for EngineSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
