//! Bounded worker pool that drives executors.
//!
//! `run` hands every mutant to exactly one executor, at most `workers` of them
//! at a time, and returns a channel that yields outcomes in completion order.
//! The channel closes once, after the last outcome has been sent.

use crate::engine::EngineError;
use crate::executor::{ExecutorDealer, Outcome};
use crate::mutant::BoxedMutant;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::Notify;

/// Identity of the worker slot running an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: usize,
}

/// Per-slot lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Waiting for the next job
    Idle,
    /// A job was taken off the queue, executor being built
    Dispatched,
    /// Executor running
    Running,
}

impl SlotState {
    fn as_u8(self) -> u8 {
        match self {
            SlotState::Idle => 0,
            SlotState::Dispatched => 1,
            SlotState::Running => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => SlotState::Dispatched,
            2 => SlotState::Running,
            _ => SlotState::Idle,
        }
    }
}

struct CompletionInner {
    remaining: AtomicUsize,
    notify: Notify,
}

/// Counts outstanding executors and wakes a waiter when the last one is done.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new(CompletionInner {
                remaining: AtomicUsize::new(count),
                notify: Notify::new(),
            }),
        }
    }

    /// A token that decrements the counter once, when consumed or dropped.
    pub fn token(&self) -> CompletionToken {
        CompletionToken {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    pub fn remaining(&self) -> usize {
        self.inner.remaining.load(Ordering::SeqCst)
    }

    /// Resolve once the counter has reached zero.
    pub async fn wait(&self) {
        loop {
            if self.remaining() == 0 {
                return;
            }
            self.inner.notify.notified().await;
        }
    }
}

/// One unit of the completion counter.
///
/// Signals exactly once: either through [`CompletionToken::done`] or when
/// dropped, which also covers an executor that unwinds.
pub struct CompletionToken {
    inner: Option<Arc<CompletionInner>>,
}

impl CompletionToken {
    pub fn done(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        match inner
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(1) => inner.notify.notify_one(),
            Ok(_) => {}
            Err(_) => tracing::error!("Completion counter signalled more often than expected"),
        }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        self.signal();
    }
}

impl std::fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionToken")
            .field("pending", &self.inner.is_some())
            .finish()
    }
}

struct Job {
    mutant: BoxedMutant,
    token: CompletionToken,
}

/// Fixed-size pool of execution slots.
pub struct WorkerPool {
    workers: usize,
    dealer: Arc<dyn ExecutorDealer>,
    slots: Arc<[AtomicU8]>,
}

impl WorkerPool {
    pub fn new(workers: usize, dealer: Arc<dyn ExecutorDealer>) -> Result<Self, EngineError> {
        if workers == 0 {
            return Err(EngineError::InvalidWorkers(workers));
        }
        let slots = (0..workers)
            .map(|_| AtomicU8::new(SlotState::Idle.as_u8()))
            .collect();
        Ok(Self {
            workers,
            dealer,
            slots,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Current state of every slot, indexed by worker id.
    pub fn slot_states(&self) -> Vec<SlotState> {
        self.slots
            .iter()
            .map(|s| SlotState::from_u8(s.load(Ordering::SeqCst)))
            .collect()
    }

    /// Start executing `mutants` and return the outcome stream.
    ///
    /// Must be called from within a tokio runtime. Only one run should be
    /// active per pool at a time.
    pub fn run(&self, mutants: Vec<BoxedMutant>) -> mpsc::Receiver<Outcome> {
        let total = mutants.len();
        let (out_tx, out_rx) = mpsc::channel(self.workers);

        if total == 0 {
            self.dealer.finish();
            return out_rx;
        }

        let completion = Completion::new(total);
        let active = self.workers.min(total);
        tracing::debug!("Starting {} workers for {} mutants", active, total);

        let (job_tx, job_rx) = mpsc::channel::<Job>(active);
        let job_rx = Arc::new(TokioMutex::new(job_rx));

        let dispatch_completion = completion.clone();
        tokio::spawn(async move {
            for mutant in mutants {
                let job = Job {
                    mutant,
                    token: dispatch_completion.token(),
                };
                if job_tx.send(job).await.is_err() {
                    tracing::error!("Job queue closed before all mutants were dispatched");
                    break;
                }
            }
        });

        for id in 0..active {
            tokio::spawn(worker_loop(
                WorkerInfo { id },
                Arc::clone(&job_rx),
                Arc::clone(&self.dealer),
                out_tx.clone(),
                Arc::clone(&self.slots),
            ));
        }

        let dealer = Arc::clone(&self.dealer);
        tokio::spawn(async move {
            completion.wait().await;
            tracing::debug!("All {} mutants completed", total);
            dealer.finish();
            drop(out_tx);
        });

        out_rx
    }
}

async fn worker_loop(
    worker: WorkerInfo,
    jobs: Arc<TokioMutex<mpsc::Receiver<Job>>>,
    dealer: Arc<dyn ExecutorDealer>,
    out: mpsc::Sender<Outcome>,
    slots: Arc<[AtomicU8]>,
) {
    let set_state = |state: SlotState| {
        slots[worker.id].store(state.as_u8(), Ordering::SeqCst);
        tracing::debug!("Worker {} -> {:?}", worker.id, state);
    };

    loop {
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };

        let job = match job {
            Some(j) => j,
            None => {
                tracing::debug!("Worker {} finished - no more jobs", worker.id);
                break;
            }
        };

        set_state(SlotState::Dispatched);
        let executor = dealer.new_executor(job.mutant, out.clone(), job.token);

        set_state(SlotState::Running);
        if let Err(e) = tokio::spawn(executor.start(worker)).await {
            tracing::error!("Executor on worker {} crashed: {}", worker.id, e);
        }

        set_state(SlotState::Idle);
    }
}
