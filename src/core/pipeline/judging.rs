use futures::stream::FuturesUnordered;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::task::{self, JoinError, JoinHandle};
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::{
    constants::RES_TX_ERR,
    core::domain::{Cancellation, RunContext},
};

/// Blocking work run on a pool slot. It receives the slot's run context.
pub struct JudgeJob<T> {
    pub id: Uuid,
    pub work: Box<dyn FnOnce(&RunContext) -> T + Send>,
}

impl<T> JudgeJob<T> {
    pub fn new(work: impl FnOnce(&RunContext) -> T + Send + 'static) -> Self {
        Self {
            id: Uuid::new_v4(),
            work: Box::new(work),
        }
    }
}

impl<T> std::fmt::Debug for JudgeJob<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JudgeJob").field("id", &self.id).finish()
    }
}

#[derive(Debug)]
pub struct JobResult<T> {
    pub id: Uuid,
    pub run_id: String,
    pub output: T,
}

/// Bounded set of worker slots, each with its own run id.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    workers: usize,
    cancellation: Cancellation,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            cancellation: Cancellation::new(),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Stops in-flight sandboxed runs. Their jobs finish with an error.
    pub fn cancel(&self) {
        tracing::warn!("Cancelling judging jobs");
        self.cancellation.cancel();
    }

    fn run_ids(&self) -> Vec<String> {
        (0..self.workers).rev().map(|n| format!("worker-{n}")).collect()
    }
}

/// Runs jobs from `job_rx` on at most `pool.workers()` blocking threads and
/// sends each result to `res_tx`. Ends once `job_rx` is closed and drained.
#[tracing::instrument(skip(job_rx, res_tx))]
pub fn handle_judging<T: Send + 'static>(
    pool: WorkerPool,
    mut job_rx: Receiver<JudgeJob<T>>,
    res_tx: Sender<JobResult<T>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut free = pool.run_ids();
        let mut running = FuturesUnordered::new();
        let mut open = true;

        loop {
            tokio::select! {
                job = job_rx.recv(), if open && !free.is_empty() => match job {
                    Some(job) => {
                        let Some(run_id) = free.pop() else {
                            continue;
                        };
                        tracing::debug!("Job {} starts on {run_id}", job.id);
                        running.push(run_job(job, run_id, pool.cancellation.clone()));
                    }
                    None => open = false,
                },
                Some((run_id, id, result)) = running.next(), if !running.is_empty() => {
                    free.push(run_id.clone());
                    match result {
                        Ok(output) => {
                            tracing::debug!("Job {id} finished on {run_id}");
                            let result = JobResult { id, run_id, output };
                            res_tx.send(result).await.expect(RES_TX_ERR);
                        }
                        Err(e) => tracing::error!("Job {id} failed on {run_id}: {e}"),
                    }
                }
                else => break,
            }
        }

        tracing::debug!("Judging pool stopped");
    })
}

async fn run_job<T: Send + 'static>(
    job: JudgeJob<T>,
    run_id: String,
    cancellation: Cancellation,
) -> (String, Uuid, Result<T, JoinError>) {
    let ctx = RunContext::new(run_id.clone(), cancellation);
    let JudgeJob { id, work } = job;
    let result = task::spawn_blocking(move || work(&ctx)).await;
    (run_id, id, result)
}
