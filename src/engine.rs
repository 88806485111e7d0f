//! Run orchestration: filtering, baseline, timeout policy and tallying.

use crate::config::EngineConfig;
use crate::enablement::Enablement;
use crate::executor::{MutantExecutorDealer, Outcome};
use crate::mutant::{BoxedMutant, Mutant, MutantType, Status};
use crate::pool::WorkerPool;
use crate::verify::{Verdict, Verifier};
use crate::workdir::{ProvisionError, Provisioner, Reclaim};
use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("worker count must be at least 1 (got {0})")]
    InvalidWorkers(usize),
    #[error("unknown mutant configuration keys: {}", .0.join(", "))]
    UnknownMutantKeys(Vec<String>),
    #[error("baseline test run did not pass: {0:?}")]
    BaselineFailed(Verdict),
    #[error("cannot provision baseline working directory: {0}")]
    Provision(#[from] ProvisionError),
}

/// Resolved knobs for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub workers: usize,
    pub timeout_coefficient: u32,
    pub min_timeout: Duration,
    /// When set, used for every mutant instead of the derived timeout.
    pub fixed_timeout: Option<Duration>,
    pub baseline_timeout: Duration,
    /// Classify without executing anything.
    pub dry_run: bool,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            workers: config.workers,
            timeout_coefficient: config.timeout_coefficient,
            min_timeout: Duration::from_secs(config.min_timeout_seconds),
            fixed_timeout: config.timeout_seconds.map(Duration::from_secs),
            baseline_timeout: Duration::from_secs(config.baseline_timeout_seconds),
            dry_run: false,
        }
    }

    /// Per-mutant deadline given how long the unmutated suite took.
    pub fn mutant_timeout(&self, baseline: Duration) -> Duration {
        if let Some(fixed) = self.fixed_timeout {
            return fixed;
        }
        (baseline * self.timeout_coefficient).max(self.min_timeout)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Result of filtering the input before execution.
#[derive(Debug, Default)]
pub struct Partition {
    pub runnable: Vec<BoxedMutant>,
    pub not_covered: Vec<BoxedMutant>,
    /// Mutants dropped because their type is disabled.
    pub disabled: usize,
}

pub struct Engine {
    settings: EngineSettings,
    enablement: Enablement,
    provisioner: Arc<dyn Provisioner>,
    verifier: Arc<dyn Verifier>,
}

impl Engine {
    /// Validate the configuration and bind the collaborators.
    pub fn new(
        settings: EngineSettings,
        enablement: Enablement,
        provisioner: Arc<dyn Provisioner>,
        verifier: Arc<dyn Verifier>,
    ) -> Result<Self, EngineError> {
        if settings.workers == 0 {
            return Err(EngineError::InvalidWorkers(settings.workers));
        }
        if !enablement.unknown_keys().is_empty() {
            return Err(EngineError::UnknownMutantKeys(
                enablement.unknown_keys().to_vec(),
            ));
        }
        Ok(Self {
            settings,
            enablement,
            provisioner,
            verifier,
        })
    }

    /// Drop disabled types and split off mutants no test covers.
    pub fn partition(&self, mutants: Vec<BoxedMutant>) -> Partition {
        let mut partition = Partition::default();
        for mutant in mutants {
            if !self.enablement.is_enabled(mutant.mutant_type()) {
                tracing::debug!(
                    "Skipping disabled {} at {}",
                    mutant.mutant_type(),
                    mutant.position()
                );
                partition.disabled += 1;
            } else if mutant.status() == Status::NotCovered {
                partition.not_covered.push(mutant);
            } else {
                partition.runnable.push(mutant);
            }
        }
        partition
    }

    /// Run the unmutated suite once; it must pass.
    pub async fn baseline(&self) -> Result<Duration, EngineError> {
        let workdir = self.provisioner.acquire("").await?;
        tracing::info!("Running baseline tests in {}", workdir.package_dir.display());

        let start = Instant::now();
        let verdict = self
            .verifier
            .verify(&workdir.package_dir, self.settings.baseline_timeout)
            .await;
        let elapsed = start.elapsed();
        self.provisioner.reclaim(workdir, Reclaim::Reuse);

        match verdict {
            Verdict::Passed => {
                tracing::info!("Baseline passed in {:.1}s", elapsed.as_secs_f64());
                Ok(elapsed)
            }
            other => Err(EngineError::BaselineFailed(other)),
        }
    }

    /// Execute every enabled, covered mutant and tally the results.
    pub async fn run(&self, mutants: Vec<BoxedMutant>) -> Result<RunSummary, EngineError> {
        let start = Instant::now();
        let partition = self.partition(mutants);
        let mut summary = RunSummary {
            disabled: partition.disabled,
            ..Default::default()
        };
        for mutant in &partition.not_covered {
            summary.record(mutant.as_ref(), Duration::ZERO, None);
        }

        if self.settings.dry_run || partition.runnable.is_empty() {
            for mutant in &partition.runnable {
                summary.record(mutant.as_ref(), Duration::ZERO, None);
            }
            self.provisioner.release();
            summary.elapsed_ms = start.elapsed().as_millis() as u64;
            return Ok(summary);
        }

        let timeout = match self.baseline().await {
            Ok(baseline) => self.settings.mutant_timeout(baseline),
            Err(e) => {
                self.provisioner.release();
                return Err(e);
            }
        };
        let dealer = MutantExecutorDealer::new(
            Arc::clone(&self.provisioner),
            Arc::clone(&self.verifier),
            timeout,
        );
        let pool = WorkerPool::new(self.settings.workers, Arc::new(dealer))?;
        tracing::info!(
            "Executing {} mutants on {} workers, timeout {:.1}s",
            partition.runnable.len(),
            pool.workers(),
            timeout.as_secs_f64()
        );
        let mut outcomes = pool.run(partition.runnable);

        while let Some(outcome) = outcomes.recv().await {
            if !outcome.mutant.status().is_terminal() {
                tracing::error!(
                    "Mutant at {} came back unclassified",
                    outcome.mutant.position()
                );
            }
            log_outcome(&outcome);
            summary.record(
                outcome.mutant.as_ref(),
                outcome.elapsed,
                outcome.rollback_error.as_ref().map(|e| e.to_string()),
            );
        }

        tracing::debug!("Slot states after run: {:?}", pool.slot_states());
        summary.elapsed_ms = start.elapsed().as_millis() as u64;
        Ok(summary)
    }
}

fn log_outcome(outcome: &Outcome) {
    let mutant = &outcome.mutant;
    tracing::info!(
        "{:<12} {} at {}",
        mutant.status().to_string(),
        mutant.mutant_type(),
        mutant.position()
    );
}

/// One classified mutant in the report.
#[derive(Debug, Clone, Serialize)]
pub struct MutantReport {
    #[serde(rename = "type")]
    pub mutant_type: MutantType,
    pub status: Status,
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
    pub package: String,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
}

/// Tally of one run.
///
/// Timed-out mutants are counted on their own; neither score folds them in.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub killed: usize,
    pub lived: usize,
    pub timed_out: usize,
    pub not_viable: usize,
    pub not_covered: usize,
    pub errored: usize,
    /// Only non-zero in dry runs.
    pub runnable: usize,
    pub disabled: usize,
    pub rollback_failures: usize,
    pub elapsed_ms: u64,
    pub mutants: Vec<MutantReport>,
}

impl RunSummary {
    fn record(&mut self, mutant: &dyn Mutant, elapsed: Duration, rollback_error: Option<String>) {
        match mutant.status() {
            Status::Killed => self.killed += 1,
            Status::Lived => self.lived += 1,
            Status::TimedOut => self.timed_out += 1,
            Status::NotViable => self.not_viable += 1,
            Status::NotCovered => self.not_covered += 1,
            Status::Errored => self.errored += 1,
            Status::Runnable => self.runnable += 1,
        }
        if rollback_error.is_some() {
            self.rollback_failures += 1;
        }

        let position = mutant.position();
        self.mutants.push(MutantReport {
            mutant_type: mutant.mutant_type(),
            status: mutant.status(),
            file: position.file.clone(),
            line: position.line,
            column: position.column,
            package: mutant.package().to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
            rollback_error,
        });
    }

    /// Mutants that went through (or, in a dry run, would go through) execution.
    pub fn executed(&self) -> usize {
        self.killed + self.lived + self.timed_out + self.not_viable + self.errored + self.runnable
    }

    /// Killed as a percentage of killed plus lived.
    pub fn efficacy(&self) -> f64 {
        percentage(self.killed, self.killed + self.lived)
    }

    /// Executed as a percentage of executed plus not covered.
    pub fn coverage(&self) -> f64 {
        let executed = self.executed();
        percentage(executed, executed + self.not_covered)
    }

    pub fn log(&self) {
        tracing::info!(
            "Killed: {}, Lived: {}, Timed out: {}, Not viable: {}, Not covered: {}, Errored: {}",
            self.killed,
            self.lived,
            self.timed_out,
            self.not_viable,
            self.not_covered,
            self.errored
        );
        if self.runnable > 0 {
            tracing::info!("Runnable (dry run): {}", self.runnable);
        }
        tracing::info!(
            "Test efficacy: {:.2}%, Mutant coverage: {:.2}%, elapsed {:.1}s",
            self.efficacy(),
            self.coverage(),
            self.elapsed_ms as f64 / 1000.0
        );
        if self.rollback_failures > 0 {
            tracing::error!(
                "{} mutations could not be rolled back; their working directories were discarded",
                self.rollback_failures
            );
        }
    }

    /// Write the summary as pretty JSON with a generation timestamp.
    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        #[derive(Serialize)]
        struct ResultsFile<'a> {
            generated_at: String,
            efficacy: f64,
            coverage: f64,
            #[serde(flatten)]
            summary: &'a RunSummary,
        }

        let results = ResultsFile {
            generated_at: chrono::Utc::now().to_rfc3339(),
            efficacy: self.efficacy(),
            coverage: self.coverage(),
            summary: self,
        };
        let contents =
            serde_json::to_string_pretty(&results).context("Failed to serialize results")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write results to {:?}", path))?;
        Ok(())
    }
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}
