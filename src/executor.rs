//! Mutation test executor.
//!
//! Handles applying one mutation in an isolated working directory, running
//! the verification command, and reverting the change.

use crate::mutant::{BoxedMutant, Mutant, MutantError, Status};
use crate::pool::{CompletionToken, WorkerInfo};
use crate::verify::Verifier;
use crate::workdir::{Provisioner, Reclaim, Workdir};
use crate::BoxFuture;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Extra time given to a verifier past its own deadline before it is aborted.
const VERIFY_GRACE: Duration = Duration::from_secs(5);

/// A classified mutant as it leaves the engine.
#[derive(Debug)]
pub struct Outcome {
    pub mutant: BoxedMutant,
    /// Set when the working directory could not be restored.
    pub rollback_error: Option<MutantError>,
    pub elapsed: Duration,
}

/// One mutant's full apply/verify/rollback cycle.
pub trait Executor: Send {
    /// Run to completion, emitting exactly one [`Outcome`] and signalling
    /// the completion token exactly once.
    fn start(self: Box<Self>, worker: WorkerInfo) -> BoxFuture<'static, ()>;
}

/// Builds the executor bound to a mutant.
pub trait ExecutorDealer: Send + Sync {
    fn new_executor(
        &self,
        mutant: BoxedMutant,
        out: mpsc::Sender<Outcome>,
        token: CompletionToken,
    ) -> Box<dyn Executor>;

    /// Called once after the last executor of a run has completed.
    fn finish(&self) {}
}

/// Executor that works on a provisioned copy of the source tree.
pub struct MutantExecutor {
    mutant: BoxedMutant,
    provisioner: Arc<dyn Provisioner>,
    verifier: Arc<dyn Verifier>,
    timeout: Duration,
    out: mpsc::Sender<Outcome>,
    token: CompletionToken,
}

impl MutantExecutor {
    async fn run(self, worker: WorkerInfo) {
        let MutantExecutor {
            mut mutant,
            provisioner,
            verifier,
            timeout,
            out,
            token,
        } = self;

        let start = Instant::now();
        let position = mutant.position().clone();
        let package = mutant.package().to_string();
        tracing::debug!(
            "Worker {} executing {} at {}",
            worker.id,
            mutant.mutant_type(),
            position
        );

        let acquired = {
            let provisioner = Arc::clone(&provisioner);
            tokio::spawn(async move { provisioner.acquire(&package).await }).await
        };

        let (status, rollback_error) = match acquired {
            Ok(Ok(workdir)) => {
                let (status, rollback_error) =
                    execute(mutant.as_mut(), &workdir, verifier, timeout).await;
                // a killed or crashed run may have left files behind
                let dirty = rollback_error.is_some()
                    || matches!(status, Status::TimedOut | Status::Errored);
                let reclaim = if dirty {
                    Reclaim::Discard
                } else {
                    Reclaim::Reuse
                };
                let reclaimed = panic::catch_unwind(AssertUnwindSafe(|| {
                    provisioner.reclaim(workdir, reclaim)
                }));
                if reclaimed.is_err() {
                    tracing::error!(
                        "Provisioner panicked while reclaiming the working directory of {}",
                        position
                    );
                }
                (status, rollback_error)
            }
            Ok(Err(e)) => {
                tracing::error!("Cannot provision working directory for {}: {}", position, e);
                (Status::Errored, None)
            }
            Err(e) => {
                tracing::error!("Provisioner crashed while preparing {}: {}", position, e);
                (Status::Errored, None)
            }
        };

        if mutant.status().can_become(status) {
            mutant.set_status(status);
        } else {
            tracing::error!(
                "Refusing status change {} -> {} for {}",
                mutant.status(),
                status,
                position
            );
        }

        let outcome = Outcome {
            mutant,
            rollback_error,
            elapsed: start.elapsed(),
        };
        if out.send(outcome).await.is_err() {
            tracing::warn!("Result receiver closed, dropping outcome for {}", position);
        }

        token.done();
    }
}

impl Executor for MutantExecutor {
    fn start(self: Box<Self>, worker: WorkerInfo) -> BoxFuture<'static, ()> {
        Box::pin(self.run(worker))
    }
}

/// Apply, verify and always roll back.
///
/// Panics from the mutant are caught so rollback and emission still happen.
async fn execute(
    mutant: &mut dyn Mutant,
    workdir: &Workdir,
    verifier: Arc<dyn Verifier>,
    timeout: Duration,
) -> (Status, Option<MutantError>) {
    mutant.set_workdir(workdir.root.clone());

    let applied = panic::catch_unwind(AssertUnwindSafe(|| mutant.apply()));
    let status = match applied {
        Ok(Ok(())) => verify(verifier, workdir, timeout).await,
        Ok(Err(e)) => {
            tracing::warn!("Mutation at {} is not viable: {}", mutant.position(), e);
            Status::NotViable
        }
        Err(_) => {
            tracing::error!("Mutant at {} panicked while applying", mutant.position());
            Status::Errored
        }
    };

    let rollback_error = match panic::catch_unwind(AssertUnwindSafe(|| mutant.rollback())) {
        Ok(result) => result.err(),
        Err(_) => Some(MutantError::Panicked("rollback")),
    };
    if let Some(e) = &rollback_error {
        tracing::error!(
            "CRITICAL: failed to roll back mutation at {} in {}: {}",
            mutant.position(),
            workdir.root.display(),
            e
        );
    }

    (status, rollback_error)
}

/// Run the verifier on its own task so a crash cannot skip rollback.
async fn verify(verifier: Arc<dyn Verifier>, workdir: &Workdir, timeout: Duration) -> Status {
    let dir = workdir.package_dir.clone();
    let mut handle = tokio::spawn(async move { verifier.verify(&dir, timeout).await });

    match tokio::time::timeout(timeout + VERIFY_GRACE, &mut handle).await {
        Ok(Ok(verdict)) => verdict.status(),
        Ok(Err(e)) => {
            tracing::error!("Verification crashed in {}: {}", workdir.package_dir.display(), e);
            Status::Errored
        }
        Err(_) => {
            handle.abort();
            tracing::debug!("Verifier overran its deadline of {:?}", timeout);
            Status::TimedOut
        }
    }
}

/// Dealer producing [`MutantExecutor`]s that share one provisioner and verifier.
pub struct MutantExecutorDealer {
    provisioner: Arc<dyn Provisioner>,
    verifier: Arc<dyn Verifier>,
    timeout: Duration,
}

impl MutantExecutorDealer {
    pub fn new(provisioner: Arc<dyn Provisioner>, verifier: Arc<dyn Verifier>, timeout: Duration) -> Self {
        Self {
            provisioner,
            verifier,
            timeout,
        }
    }
}

impl ExecutorDealer for MutantExecutorDealer {
    fn new_executor(
        &self,
        mutant: BoxedMutant,
        out: mpsc::Sender<Outcome>,
        token: CompletionToken,
    ) -> Box<dyn Executor> {
        Box::new(MutantExecutor {
            mutant,
            provisioner: Arc::clone(&self.provisioner),
            verifier: Arc::clone(&self.verifier),
            timeout: self.timeout,
            out,
            token,
        })
    }

    fn finish(&self) {
        self.provisioner.release();
    }
}
