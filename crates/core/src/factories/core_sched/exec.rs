//! Serialized persistence executor for the core scheduler.

use ferret_api::*;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex};

std::thread_local! {
    static IN_CONTEXT: std::cell::Cell<bool> = const {
        std::cell::Cell::new(false)
    };
}

/// True when the calling thread is currently running a job inside the
/// serialized executor.
pub(crate) fn on_executor() -> bool {
    IN_CONTEXT.with(|c| c.get())
}

/// Run `f` with the executor-context flag set, for tests that call
/// executor-only entry points directly.
#[cfg(test)]
pub(crate) fn with_executor_context<R>(f: impl FnOnce() -> R) -> R {
    IN_CONTEXT.with(|c| c.set(true));
    let out = f();
    IN_CONTEXT.with(|c| c.set(false));
    out
}

struct QueuedJob {
    priority: JobPriority,
    seq: u64,
    dedup: Option<&'static str>,
    job: Box<dyn FnOnce() + 'static + Send>,
}

impl std::fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedJob")
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .field("dedup", &self.dedup)
            .finish()
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, oth: &Self) -> bool {
        self.priority == oth.priority && self.seq == oth.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, oth: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(oth))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, oth: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap, reverse so the numerically lowest
        // (priority, seq) pops first.
        (oth.priority, oth.seq).cmp(&(self.priority, self.seq))
    }
}

#[derive(Debug)]
struct ExecState {
    queue: BinaryHeap<QueuedJob>,
    queued_dedup: HashSet<&'static str>,
    next_seq: u64,
}

/// A single-consumer priority job queue. Jobs submitted here run one at
/// a time on a dedicated tokio task, lowest [JobPriority] first, FIFO
/// within a priority level.
pub(crate) struct SerialExec {
    state: Arc<Mutex<ExecState>>,
    notify: Arc<tokio::sync::Notify>,
    drain_task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for SerialExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExec").finish()
    }
}

impl Drop for SerialExec {
    fn drop(&mut self) {
        self.drain_task.abort();
    }
}

impl SerialExec {
    pub fn new() -> Arc<Self> {
        let state = Arc::new(Mutex::new(ExecState {
            queue: BinaryHeap::new(),
            queued_dedup: HashSet::new(),
            next_seq: 0,
        }));
        let notify = Arc::new(tokio::sync::Notify::new());

        let drain_task =
            tokio::task::spawn(drain(state.clone(), notify.clone()));

        Arc::new(Self {
            state,
            notify,
            drain_task,
        })
    }

    /// Queue a job. Returns false without queueing when `dedup` is set
    /// and a job with the same dedup id is already waiting.
    pub fn submit<F>(
        &self,
        priority: JobPriority,
        dedup: Option<&'static str>,
        job: F,
    ) -> bool
    where
        F: FnOnce() + 'static + Send,
    {
        {
            let mut lock = self.state.lock().unwrap();
            if let Some(id) = dedup {
                if !lock.queued_dedup.insert(id) {
                    return false;
                }
            }
            let seq = lock.next_seq;
            lock.next_seq += 1;
            lock.queue.push(QueuedJob {
                priority,
                seq,
                dedup,
                job: Box::new(job),
            });
        }
        self.notify.notify_one();
        true
    }

    /// Diagnostic count of jobs currently waiting.
    pub fn queued_count(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

async fn drain(
    state: Arc<Mutex<ExecState>>,
    notify: Arc<tokio::sync::Notify>,
) {
    loop {
        let job = {
            let mut lock = state.lock().unwrap();
            match lock.queue.pop() {
                Some(queued) => {
                    if let Some(id) = queued.dedup {
                        lock.queued_dedup.remove(id);
                    }
                    Some(queued.job)
                }
                None => None,
            }
        };

        match job {
            Some(job) => {
                let run = move || {
                    struct Reset;
                    impl Drop for Reset {
                        fn drop(&mut self) {
                            IN_CONTEXT.with(|c| c.set(false));
                        }
                    }
                    // Blocking threads are pooled, clear the flag even
                    // if the job panics.
                    IN_CONTEXT.with(|c| c.set(true));
                    let _reset = Reset;
                    job();
                };
                // Jobs are sync and may touch a blocking record store.
                if let Err(err) =
                    tokio::task::spawn_blocking(run).await
                {
                    tracing::warn!(?err, "scheduler job panicked");
                }
            }
            None => notify.notified().await,
        }
    }
}
