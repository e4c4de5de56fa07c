//! Batch script checking.
//!
//! A batch either passes completely or reports one failing check. Checks in a
//! batch run in no particular order and the first failure stops the rest.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::verifier::{ScriptCheck, ScriptError, ScriptVerifier};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckFailure {
    pub tx_index: usize,
    pub input_index: usize,
    pub error: ScriptError,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "script check failed for tx {} input {}: {}",
            self.tx_index, self.input_index, self.error
        )
    }
}

impl std::error::Error for CheckFailure {}

enum Pending {
    Done(Result<(), CheckFailure>),
    Running(Receiver<Result<(), CheckFailure>>),
}

/// Outstanding batch returned by [`CheckQueue::enqueue_batch`].
pub struct BatchHandle {
    pending: Pending,
    len: usize,
}

impl BatchHandle {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub trait CheckQueue: Send + Sync {
    fn enqueue_batch(&self, checks: Vec<ScriptCheck>) -> BatchHandle;
    fn await_batch(&self, handle: BatchHandle) -> Result<(), CheckFailure>;
}

fn run_check(check: &ScriptCheck, verifier: &dyn ScriptVerifier) -> Result<(), CheckFailure> {
    check.run(verifier).map_err(|error| CheckFailure {
        tx_index: check.tx_index,
        input_index: check.input_index,
        error,
    })
}

fn resolve(handle: BatchHandle) -> Result<(), CheckFailure> {
    match handle.pending {
        Pending::Done(result) => result,
        Pending::Running(receiver) => receiver.recv().unwrap_or_else(|_| {
            Err(CheckFailure {
                tx_index: 0,
                input_index: 0,
                error: ScriptError::Other("check worker exited without a result".to_string()),
            })
        }),
    }
}

/// Runs every check on the calling thread when the batch is enqueued.
pub struct InlineCheckQueue {
    verifier: Arc<dyn ScriptVerifier>,
}

impl InlineCheckQueue {
    pub fn new(verifier: Arc<dyn ScriptVerifier>) -> Self {
        Self { verifier }
    }
}

impl CheckQueue for InlineCheckQueue {
    fn enqueue_batch(&self, checks: Vec<ScriptCheck>) -> BatchHandle {
        let len = checks.len();
        let result = checks
            .iter()
            .try_for_each(|check| run_check(check, self.verifier.as_ref()));
        BatchHandle {
            pending: Pending::Done(result),
            len,
        }
    }

    fn await_batch(&self, handle: BatchHandle) -> Result<(), CheckFailure> {
        resolve(handle)
    }
}

/// Fans checks out over a dedicated rayon pool; `enqueue_batch` returns
/// immediately so the caller can keep applying UTXO changes meanwhile.
pub struct ParallelCheckQueue {
    pool: Arc<ThreadPool>,
    verifier: Arc<dyn ScriptVerifier>,
}

impl ParallelCheckQueue {
    pub fn new(verifier: Arc<dyn ScriptVerifier>, threads: usize) -> Result<Self, String> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|idx| format!("scriptcheck-{idx}"))
            .build()
            .map_err(|err| format!("failed to start script check pool: {err}"))?;
        Ok(Self {
            pool: Arc::new(pool),
            verifier,
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl CheckQueue for ParallelCheckQueue {
    fn enqueue_batch(&self, checks: Vec<ScriptCheck>) -> BatchHandle {
        let len = checks.len();
        if checks.is_empty() {
            return BatchHandle {
                pending: Pending::Done(Ok(())),
                len,
            };
        }
        let (sender, receiver) = bounded(1);
        let verifier = Arc::clone(&self.verifier);
        let pool = Arc::clone(&self.pool);
        self.pool.spawn(move || {
            let result = pool.install(|| {
                checks
                    .par_iter()
                    .try_for_each(|check| run_check(check, verifier.as_ref()))
            });
            if let Err(failure) = &result {
                ledgerd_log::log_debug!("{failure}");
            }
            let _ = sender.send(result);
        });
        BatchHandle {
            pending: Pending::Running(receiver),
            len,
        }
    }

    fn await_batch(&self, handle: BatchHandle) -> Result<(), CheckFailure> {
        resolve(handle)
    }
}
