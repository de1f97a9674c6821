//! Running branch calls of one protocol phase.

pub mod two_phase;

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use rayon::{ThreadPool, ThreadPoolBuilder};
pub use two_phase::TwoPhaseCommitter;
use tracing::warn;

use crate::config::CoordinatorConfig;
use crate::error::{ResourceError, ResourceResult};
use crate::scheduler::deadline_after;

/// A call to one branch, runnable on any thread.
pub type BranchCall<T> = Box<dyn FnOnce() -> ResourceResult<T> + Send + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How the calls of a phase are spread over threads.
///
/// Every strategy waits for all calls of a phase before returning, so no
/// branch is committed before every branch has voted. Each call is bounded by
/// `call_timeout`.
#[derive(Clone)]
pub enum PhaseExecutor {
    /// One call after the other. Each call runs on its own helper thread so
    /// the caller can stop waiting for it.
    Serial { call_timeout: Duration },
    /// A fresh thread per call, all calls at once.
    ThreadPerBranch { call_timeout: Duration },
    /// A fixed pool of worker threads.
    Pool {
        pool: Arc<ThreadPool>,
        call_timeout: Duration,
    },
}

impl PhaseExecutor {
    pub fn from_config(config: &CoordinatorConfig) -> Result<Self, rayon::ThreadPoolBuildError> {
        let call_timeout = config.branch_call_timeout();
        if !config.asynchronous_2pc {
            return Ok(PhaseExecutor::Serial { call_timeout });
        }
        match config.background_threads {
            0 => Ok(PhaseExecutor::ThreadPerBranch { call_timeout }),
            threads => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("minitx-branch-{index}"))
                    .build()?;
                Ok(PhaseExecutor::Pool {
                    pool: Arc::new(pool),
                    call_timeout,
                })
            }
        }
    }

    /// Runs every call and returns the results in the order of `calls`.
    ///
    /// A call that does not finish within the timeout yields
    /// [`ResourceError::Timeout`]; it keeps running in the background and its
    /// late result is dropped. A call that panics resumes the panic on the
    /// calling thread.
    pub fn run_all<T: Send + 'static>(&self, calls: Vec<BranchCall<T>>) -> Vec<ResourceResult<T>> {
        match self {
            PhaseExecutor::Serial { call_timeout } => calls
                .into_iter()
                .flat_map(|call| fan_out(vec![call], *call_timeout, spawn_thread))
                .collect(),
            PhaseExecutor::ThreadPerBranch { call_timeout } => {
                fan_out(calls, *call_timeout, spawn_thread)
            }
            PhaseExecutor::Pool { pool, call_timeout } => {
                fan_out(calls, *call_timeout, |job| pool.spawn(job))
            }
        }
    }

    pub fn run_one<T: Send + 'static>(&self, call: BranchCall<T>) -> ResourceResult<T> {
        self.run_all(vec![call])
            .pop()
            .unwrap_or_else(|| Err(ResourceError::ProtocolViolation("call produced no result".into())))
    }
}

fn spawn_thread(job: Job) {
    // A job that never starts leaves its result missing, which reads as a timeout.
    if let Err(e) = thread::Builder::new()
        .name("minitx-branch".into())
        .spawn(job)
    {
        warn!(error = %e, "failed to spawn branch thread");
    }
}

fn fan_out<T, S>(calls: Vec<BranchCall<T>>, timeout: Duration, spawn: S) -> Vec<ResourceResult<T>>
where
    T: Send + 'static,
    S: Fn(Job),
{
    let count = calls.len();
    let (sender, receiver) = mpsc::channel();
    for (index, call) in calls.into_iter().enumerate() {
        let sender = sender.clone();
        spawn(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(call));
            // The receiver is gone once the phase gave up waiting.
            let _ = sender.send((index, result));
        }));
    }
    drop(sender);

    let mut results: Vec<Option<ResourceResult<T>>> = (0..count).map(|_| None).collect();
    let deadline = deadline_after(timeout);
    let mut received = 0;
    while received < count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(remaining) {
            Ok((index, Ok(result))) => {
                results[index] = Some(result);
                received += 1;
            }
            Ok((_, Err(payload))) => panic::resume_unwind(payload),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(pending = count - received, ?timeout, "branch calls did not finish in time");
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    results
        .into_iter()
        .map(|result| result.unwrap_or(Err(ResourceError::Timeout(timeout))))
        .collect()
}
