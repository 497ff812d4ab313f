//! Sched is a ferret module deciding which block the sending layer
//! should attempt next.
//!
//! It tracks every pending fetch or insert request registered by local
//! clients, durable or memory-only, and answers one question on demand:
//! given priority classes, retry counts, per-key cooldowns and a bounded
//! window onto the durable index, what is the single best block to try
//! right now?
//!
//! It consists of multiple parts:
//! - A transient index of memory-only requests, bucketed by priority
//!   class, mutated inline under its own lock.
//! - A persistent index over the record store, holding requests that
//!   survive a restart. All durable mutation is marshaled through one
//!   serialized executor.
//! - A starter queue: a bounded in-memory cache of ready durable
//!   request groups, refilled from the persistent index and trimmed by
//!   priority/retry eviction, so dispatch never scans the full durable
//!   index.
//! - Cooldown queues putting failed (key, request) pairs on a fixed
//!   timer, restored to eligibility by a periodic batched sweep.
//! - Offered-keys buckets holding keys peers volunteered, dispatched as
//!   synthetic transient fetches.
//!
//! ### Dispatch
//!
//! Requests order by (priority class, retry count), lower first. Each
//! [grab](RequestScheduler::grab) call finds the best queued durable
//! group, then asks the transient side for a candidate that ties or
//! beats it; the [PriorityPolicy] decides how much priority-class slack
//! a memory-only candidate gets. Keys currently in flight or cooling
//! are skipped. Producing a block never mutates durable state; durable
//! bookkeeping happens in executor jobs after the sending layer reports
//! back.
//!
//! ### The serialized executor
//!
//! A single drain task runs prioritized jobs one at a time; callers
//! already inside a job mutate inline instead of re-enqueueing. Success
//! and pending-key notifications run at an elevated priority so a found
//! block reaches its listeners before the slot that discovered it is
//! reused. When the job backlog grows past a threshold, new durable
//! registrations degrade to writing minimal stub records that a
//! deduplicated low-priority job upgrades later.

use ferret_api::*;
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};

mod cooldown;
mod exec;
mod offered;
mod persistent;
mod starter;
mod transient;

use cooldown::CooldownQueue;
use exec::{on_executor, SerialExec};
use offered::OfferedKeys;
use persistent::PersistentIndex;
use starter::{StarterGroup, StarterState};
use transient::TransientIndex;

const MOD_NAME: &str = "coreSched";

const REFILL_JOB: &str = "refill";
const SWEEP_JOB: &str = "cooldownSweep";
const STUB_JOB: &str = "stubReconcile";

/// How many stub records a single reconcile job upgrades.
const STUB_BATCH: usize = 16;

/// CoreSched configuration types.
pub mod config {
    use ferret_api::config::ModConfig;
    use ferret_api::*;
    use std::time::Duration;

    /// Configuration parameters for [CoreSchedFactory](super::CoreSchedFactory).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CoreSchedConfig {
        /// Max total not-started keys held in the starter queue.
        /// Default: 512.
        pub starter_queue_capacity: u32,

        /// Not-started total above which an operational error is
        /// logged. Default: 800.
        pub starter_queue_warning: u32,

        /// Executor backlog above which new durable registrations fall
        /// back to the deferred-stub path. Default: 100.
        pub job_backlog_threshold: u32,

        /// How long a failed (key, request) pair stays on cooldown.
        /// Default: 30 min.
        pub cooldown_period: Duration,

        /// Max expired keys restored per sweep pass and queue.
        /// Default: 20.
        pub cooldown_sweep_batch: u32,

        /// How often the cooldown sweep runs. Default: 1 s.
        pub sweep_interval: Duration,

        /// Priority-class slack granted to memory-only candidates under
        /// [PriorityPolicy::Soft]. Default: 1.
        pub soft_slack: u8,

        /// The dispatch tolerance policy at startup. Can be changed at
        /// runtime through
        /// [set_priority_policy](ferret_api::RequestScheduler::set_priority_policy).
        /// Default: hard.
        pub default_priority_policy: PriorityPolicy,
    }

    impl Default for CoreSchedConfig {
        fn default() -> Self {
            Self {
                starter_queue_capacity: 512,
                starter_queue_warning: 800,
                job_backlog_threshold: 100,
                cooldown_period: Duration::from_secs(60 * 30),
                cooldown_sweep_batch: 20,
                sweep_interval: Duration::from_secs(1),
                soft_slack: 1,
                default_priority_policy: PriorityPolicy::Hard,
            }
        }
    }

    /// Module-level configuration for CoreSched.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct CoreSchedModConfig {
        /// CoreSched configuration.
        pub core_sched: CoreSchedConfig,
    }

    impl ModConfig for CoreSchedModConfig {}
}

use config::*;

/// A production-ready request scheduler module.
#[derive(Debug)]
pub struct CoreSchedFactory {}

impl CoreSchedFactory {
    /// Construct a new CoreSchedFactory.
    pub fn create() -> DynRequestSchedulerFactory {
        Arc::new(Self {})
    }
}

impl RequestSchedulerFactory for CoreSchedFactory {
    fn default_config(
        &self,
        config: &mut ferret_api::config::Config,
    ) -> FtResult<()> {
        config
            .add_default_module_config::<CoreSchedModConfig>(
                MOD_NAME.into(),
            )?;
        Ok(())
    }

    fn create(
        &self,
        config: Arc<ferret_api::config::Config>,
        kind: RequestKind,
        record_store: DynRecordStore,
        hydrator: DynRequestHydrator,
        checker: Option<DynDatastoreChecker>,
        waker: DynDispatchWaker,
    ) -> BoxFut<'static, FtResult<DynRequestScheduler>> {
        Box::pin(async move {
            let config: CoreSchedModConfig =
                config.get_module_config(MOD_NAME)?;
            let out: DynRequestScheduler = Arc::new(CoreSched::new(
                config.core_sched,
                kind,
                record_store,
                hydrator,
                checker,
                waker,
            )?);
            Ok(out)
        })
    }
}

#[derive(Debug)]
struct SchedInner {
    config: CoreSchedConfig,
    kind: RequestKind,
    transient: TransientIndex,
    persistent: PersistentIndex,
    starter: Mutex<StarterState>,
    offered: OfferedKeys,
    cooldown_transient: Mutex<CooldownQueue>,
    cooldown_persistent: Mutex<CooldownQueue>,
    policy: Mutex<PriorityPolicy>,
    checker: Option<DynDatastoreChecker>,
    waker: DynDispatchWaker,
    // Weak so jobs queued on the executor can resubmit themselves
    // without keeping the executor alive past its owner.
    exec: OnceLock<Weak<SerialExec>>,
}

impl SchedInner {
    /// Queue a job on the serialized executor. Returns false if the
    /// executor is gone or a deduplicated twin is already waiting.
    fn submit(
        &self,
        priority: JobPriority,
        dedup: Option<&'static str>,
        job: impl FnOnce() + 'static + Send,
    ) -> bool {
        match self.exec.get().and_then(|weak| weak.upgrade()) {
            Some(exec) => exec.submit(priority, dedup, job),
            None => false,
        }
    }

    fn exec_backlog(&self) -> usize {
        self.exec
            .get()
            .and_then(|weak| weak.upgrade())
            .map(|exec| exec.queued_count())
            .unwrap_or(0)
    }

    /// Admit a durable request to the starter queue if it beats the
    /// worst queued group or there is spare capacity, then trim. Wakes
    /// the driver on admission.
    fn maybe_add_to_starter(
        &self,
        record_id: RecordId,
        request: DynSendableRequest,
    ) -> bool {
        if request.is_cancelled() || request.is_empty() {
            return false;
        }
        let group = StarterGroup::new(record_id, request);
        if group.keys.is_empty() {
            return false;
        }

        let capacity = self.config.starter_queue_capacity as usize;
        let admitted = {
            let mut starter = self.starter.lock().unwrap();
            if starter.is_claimed(&group.record_id) {
                false
            } else {
                let spare = starter.not_started_total() < capacity;
                let better = starter
                    .worst_key()
                    .map(|worst| group.ordering_key() < worst)
                    .unwrap_or(true);
                if spare || better {
                    starter.groups.push(group);
                    starter.trim(capacity);
                    true
                } else {
                    false
                }
            }
        };
        if admitted {
            self.waker.wake();
        }
        admitted
    }

    /// Best memory-only candidate within `bound`: the transient buckets
    /// and the offered-keys buckets compete on ordering key. The chosen
    /// key enters the in-flight set before release.
    fn transient_candidate(
        &self,
        starter: &mut StarterState,
        bound: Option<(u8, u32)>,
    ) -> Option<ChosenBlock> {
        let from_index =
            self.transient.choose_candidate(bound, |key, request| {
                starter.fetching.contains(key)
                    || self
                        .cooldown_transient
                        .lock()
                        .unwrap()
                        .is_cooling(key, request)
            });

        let offered_key = self
            .offered
            .best_class(&starter.fetching)
            .map(|class| (class, 0_u32))
            .filter(|offered| match bound {
                Some(bound) => *offered <= bound,
                None => true,
            });

        let index_key = from_index
            .as_ref()
            .map(|(_, r)| (r.priority_class(), r.retry_count()));

        let use_offered = match (offered_key, index_key) {
            (Some(offered), Some(index)) => offered < index,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let (key, request) = if use_offered {
            self.offered
                .take_from(offered_key.unwrap().0, &starter.fetching)?
        } else {
            from_index?
        };

        starter.fetching.insert(key.clone());
        Some(ChosenBlock {
            key,
            request,
            persistent: false,
        })
    }
}

/// The dispatch algorithm. Holds the starter lock for the whole
/// decision so the group scan, the in-flight check, and the claim are
/// one atomic step.
fn grab(inner: &Arc<SchedInner>) -> Option<ChosenBlock> {
    let slack = match *inner.policy.lock().unwrap() {
        PriorityPolicy::Hard => 0,
        PriorityPolicy::Soft => inner.config.soft_slack,
    };
    let capacity = inner.config.starter_queue_capacity as usize;

    let mut starter = inner.starter.lock().unwrap();
    let out = loop {
        let Some(idx) = starter.best_idx() else {
            // The durable cache is dry. Refill in the background and
            // fall back to memory-only candidates alone.
            submit_refill(inner);
            break inner.transient_candidate(&mut starter, None);
        };

        let bound = starter.groups[idx].ordering_key();
        let adjusted = (bound.0.saturating_add(slack), bound.1);
        if let Some(block) =
            inner.transient_candidate(&mut starter, Some(adjusted))
        {
            break Some(block);
        }

        if starter.groups[idx].request.is_cancelled() {
            let group = starter.groups.swap_remove(idx);
            starter.running.remove(&group.record_id);
            let i = inner.clone();
            inner.submit(JobPriority::NORMAL, None, move || {
                if let Err(err) = i.persistent.remove(&group.record_id)
                {
                    tracing::warn!(
                        ?err,
                        "failed to drop cancelled request record",
                    );
                }
            });
            continue;
        }
        if starter.groups[idx].request.is_empty() {
            starter.groups.swap_remove(idx);
            continue;
        }

        let StarterState {
            groups,
            running,
            fetching,
        } = &mut *starter;

        let picked = {
            let group = &mut groups[idx];
            let eligible: Vec<usize> = {
                let cooldown = inner.cooldown_persistent.lock().unwrap();
                group
                    .keys
                    .iter()
                    .enumerate()
                    .filter(|(_, key)| {
                        !fetching.contains(key)
                            && !cooldown.is_cooling(key, &group.request)
                    })
                    .map(|(key_idx, _)| key_idx)
                    .collect()
            };
            if eligible.is_empty() {
                None
            } else {
                let pick = eligible
                    [rand::thread_rng().gen_range(0..eligible.len())];
                let key = group.keys.remove(pick)?;
                Some((
                    key,
                    group.request.clone(),
                    group.record_id.clone(),
                    group.keys.is_empty(),
                ))
            }
        };

        match picked {
            None => {
                // Nothing dispatchable in this group right now. Drop
                // it; refill re-admits the record once it is eligible
                // again.
                groups.swap_remove(idx);
                continue;
            }
            Some((key, request, record_id, exhausted)) => {
                fetching.insert(key.clone());
                running.insert(record_id);
                if exhausted {
                    groups.swap_remove(idx);
                }
                break Some(ChosenBlock {
                    key,
                    request,
                    persistent: true,
                });
            }
        }
    };

    let below = starter.not_started_total() < capacity;
    drop(starter);
    if out.is_some() && below {
        submit_refill(inner);
    }
    out
}

/// Durable half of [RequestScheduler::register]. Runs on the executor;
/// commits each record, then routes the batch through the datastore
/// checker seam or straight to registration completion.
fn register_persistent(
    inner: &Arc<SchedInner>,
    requests: Vec<DynSendableRequest>,
    block_hint: Option<bytes::Bytes>,
    skip_store_check: bool,
) -> FtResult<()> {
    if let Err(err) = inner.persistent.register(requests.clone()) {
        tracing::error!(%err, "durable registration failed");
        for request in requests.iter() {
            request.internal_error(err.clone());
        }
        return Err(err);
    }
    match (&inner.checker, skip_store_check) {
        (Some(checker), false) => {
            checker.queue_check(requests, block_hint, true)
        }
        _ => finish_register_persistent(inner, requests, true),
    }
    Ok(())
}

/// Durable half of [RequestScheduler::finish_register]: drop records
/// the store check satisfied, admit the rest to the starter queue.
fn finish_register_persistent(
    inner: &Arc<SchedInner>,
    requests: Vec<DynSendableRequest>,
    any_valid: bool,
) {
    if !any_valid {
        for request in requests {
            let Some(record) = request.record() else {
                continue;
            };
            if let Err(err) = inner.persistent.remove(&record.record_id)
            {
                tracing::warn!(
                    ?err,
                    "failed to drop satisfied request record",
                );
            }
        }
        return;
    }
    for request in requests {
        let Some(record) = request.record() else {
            continue;
        };
        inner.maybe_add_to_starter(record.record_id, request);
    }
}

/// Success bookkeeping for a durable block, at TRIP_PENDING priority so
/// it never runs ahead of a pending-key notification for the same key.
fn persistent_succeeded(
    inner: &Arc<SchedInner>,
    request: DynSendableRequest,
) {
    let Some(record) = request.record() else {
        return;
    };
    let record_id = record.record_id;

    if request.is_cancelled() || request.is_empty() {
        {
            let mut starter = inner.starter.lock().unwrap();
            starter.groups.retain(|group| group.record_id != record_id);
            starter.running.remove(&record_id);
        }
        if let Err(err) = inner.persistent.remove(&record_id) {
            tracing::warn!(
                ?err,
                %record_id,
                "failed to drop finished request record",
            );
        }
    } else {
        // Still wants keys: release the claim unless a group with more
        // of its keys is queued.
        let mut starter = inner.starter.lock().unwrap();
        let queued = starter
            .groups
            .iter()
            .any(|group| group.record_id == record_id);
        if !queued {
            starter.running.remove(&record_id);
        }
    }

    submit_refill(inner);
}

fn submit_refill(inner: &Arc<SchedInner>) {
    let i = inner.clone();
    inner.submit(JobPriority::FILL, Some(REFILL_JOB), move || {
        refill_job(&i)
    });
}

/// Pull best-first candidates from the persistent index into the
/// starter queue until capacity is met. Skips everything queued or
/// running. Returns early while the queue is still above the 3/4 mark.
fn refill_job(inner: &Arc<SchedInner>) {
    let capacity = inner.config.starter_queue_capacity as usize;
    let (mut total, mut excluded) = {
        let starter = inner.starter.lock().unwrap();
        (starter.not_started_total(), starter.claimed_records())
    };

    if total > inner.config.starter_queue_warning as usize {
        tracing::error!(
            total,
            capacity,
            "starter queue far over capacity",
        );
    }
    if total * 4 > capacity * 3 {
        return;
    }

    while total < capacity {
        let Some((record_id, request)) =
            inner.persistent.best_candidate(&excluded)
        else {
            break;
        };
        excluded.insert(record_id.clone());
        if inner.maybe_add_to_starter(record_id, request) {
            total = inner.starter.lock().unwrap().not_started_total();
        }
    }
}

fn submit_sweep(inner: &Arc<SchedInner>) {
    let i = inner.clone();
    inner.submit(JobPriority::NORMAL, Some(SWEEP_JOB), move || {
        sweep_job(&i)
    });
}

/// Restore expired cooldown pairs to eligibility, batch-capped per
/// queue. Re-submits itself while it keeps finding expired keys so
/// bursts drain without monopolizing the executor.
fn sweep_job(inner: &Arc<SchedInner>) {
    let batch = inner.config.cooldown_sweep_batch as usize;
    let mut expired = inner
        .cooldown_transient
        .lock()
        .unwrap()
        .pop_expired(batch);
    expired.extend(
        inner
            .cooldown_persistent
            .lock()
            .unwrap()
            .pop_expired(batch),
    );

    let mut moved = false;
    for (key, requests) in expired {
        for request in requests {
            if request.is_cancelled() {
                continue;
            }
            request.requeue_after_cooldown(&key);
            moved = true;
        }
    }

    if moved {
        inner.waker.wake();
        submit_sweep(inner);
    }
}

fn submit_stub_reconcile(inner: &Arc<SchedInner>) {
    let i = inner.clone();
    inner.submit(JobPriority::LOW, Some(STUB_JOB), move || {
        stub_reconcile_job(&i)
    });
}

/// Upgrade a batch of deferred stub records into fully registered
/// requests, then re-queue itself while stubs remain.
fn stub_reconcile_job(inner: &Arc<SchedInner>) {
    match inner.persistent.reconcile_stubs(STUB_BATCH) {
        Ok(upgraded) => {
            for (record_id, request) in upgraded {
                inner.maybe_add_to_starter(record_id, request);
            }
        }
        Err(err) => {
            tracing::warn!(?err, "stub reconciliation failed");
        }
    }
    if inner.persistent.has_stubs() {
        submit_stub_reconcile(inner);
    }
}

async fn sweep_loop(inner: Arc<SchedInner>) {
    let mut interval = tokio::time::interval(inner.config.sweep_interval);
    interval
        .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        submit_sweep(&inner);
    }
}

#[derive(Debug)]
struct CoreSched {
    inner: Arc<SchedInner>,
    exec: Arc<SerialExec>,
    sweep_task: tokio::task::JoinHandle<()>,
}

impl Drop for CoreSched {
    fn drop(&mut self) {
        self.sweep_task.abort();
    }
}

impl CoreSched {
    fn new(
        config: CoreSchedConfig,
        kind: RequestKind,
        record_store: DynRecordStore,
        hydrator: DynRequestHydrator,
        checker: Option<DynDatastoreChecker>,
        waker: DynDispatchWaker,
    ) -> FtResult<Self> {
        let persistent =
            PersistentIndex::open(kind, record_store, hydrator)?;

        let cooldown_period = config.cooldown_period;
        let inner = Arc::new(SchedInner {
            policy: Mutex::new(config.default_priority_policy),
            config,
            kind,
            transient: TransientIndex::new(),
            persistent,
            starter: Mutex::new(StarterState::new()),
            offered: OfferedKeys::new(),
            cooldown_transient: Mutex::new(CooldownQueue::new(
                cooldown_period,
            )),
            cooldown_persistent: Mutex::new(CooldownQueue::new(
                cooldown_period,
            )),
            checker,
            waker,
            exec: OnceLock::new(),
        });

        let exec = SerialExec::new();
        let _ = inner.exec.set(Arc::downgrade(&exec));

        if inner.persistent.has_stubs() {
            submit_stub_reconcile(&inner);
        }
        submit_refill(&inner);

        let sweep_task = tokio::task::spawn(sweep_loop(inner.clone()));

        Ok(Self {
            inner,
            exec,
            sweep_task,
        })
    }
}

impl RequestScheduler for CoreSched {
    fn register(
        &self,
        listener: Option<DynHasKeyListener>,
        requests: Vec<DynSendableRequest>,
        persistent: bool,
        block_hint: Option<bytes::Bytes>,
        skip_store_check: bool,
    ) -> FtResult<()> {
        let inner = &self.inner;

        for request in requests.iter() {
            let bad = if request.kind() != inner.kind {
                Some(format!(
                    "cannot register {} requests on a {} scheduler",
                    request.kind(),
                    inner.kind,
                ))
            } else if request.persistent() != persistent {
                Some(
                    "request persistence flag does not match the batch"
                        .into(),
                )
            } else {
                None
            };
            if let Some(ctx) = bad {
                let err = FtError::invalid_state(ctx);
                tracing::error!(%err, "rejecting request batch");
                for request in requests.iter() {
                    request.internal_error(err.clone());
                }
                return Err(err);
            }
        }

        // Listener construction failure aborts the whole batch with no
        // partial state.
        let listener = match listener {
            Some(has) => match has.make_key_listener() {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::warn!(
                        ?err,
                        "listener construction failed, \
                         aborting registration",
                    );
                    return Err(err);
                }
            },
            None => None,
        };

        if !persistent {
            if let Some(listener) = listener {
                inner.transient.add_listener(listener);
            }
            match (&inner.checker, skip_store_check) {
                (Some(checker), false) => {
                    checker.queue_check(requests, block_hint, false)
                }
                _ => self.finish_register(requests, false, true),
            }
            return Ok(());
        }

        if let Some(listener) = listener {
            inner.persistent.add_listener(listener);
        }

        if on_executor() {
            return register_persistent(
                inner,
                requests,
                block_hint,
                skip_store_check,
            );
        }

        let backlog = inner.exec_backlog();
        if backlog > inner.config.job_backlog_threshold as usize {
            // Shed load: queue only minimal stub writes now, a
            // low-priority job completes registration later.
            let mut records = Vec::with_capacity(requests.len());
            for request in requests.iter() {
                records.push(request.record().ok_or_else(|| {
                    FtError::invalid_state(
                        "durable request without a record",
                    )
                })?);
            }
            tracing::warn!(
                backlog,
                count = records.len(),
                "persistence backlog, deferring registrations \
                 to stub records",
            );
            let i = inner.clone();
            inner.submit(JobPriority::NORMAL, None, move || {
                for record in records {
                    if let Err(err) = i.persistent.write_stub(record) {
                        tracing::warn!(
                            ?err,
                            "failed to write stub record",
                        );
                    }
                }
                submit_stub_reconcile(&i);
            });
            return Ok(());
        }

        let i = inner.clone();
        inner.submit(JobPriority::NORMAL, None, move || {
            let _ = register_persistent(
                &i,
                requests,
                block_hint,
                skip_store_check,
            );
        });
        Ok(())
    }

    fn grab(&self) -> Option<ChosenBlock> {
        grab(&self.inner)
    }

    fn succeeded(&self, request: DynSendableRequest, block: &ChosenBlock) {
        self.inner
            .starter
            .lock()
            .unwrap()
            .fetching
            .remove(&block.key);

        if !block.persistent {
            if request.is_cancelled() || request.is_empty() {
                self.inner.transient.remove_request(&request);
            }
            return;
        }

        let i = self.inner.clone();
        self.inner
            .submit(JobPriority::TRIP_PENDING, None, move || {
                persistent_succeeded(&i, request)
            });
    }

    fn call_failure(
        &self,
        request: DynSendableRequest,
        err: SendError,
        priority: JobPriority,
    ) {
        if !request.persistent() {
            request.on_failure(err);
            return;
        }
        let i = self.inner.clone();
        self.inner.submit(priority, None, move || {
            request.on_failure(err);
            if let Some(record) = request.record() {
                let mut starter = i.starter.lock().unwrap();
                let queued = starter
                    .groups
                    .iter()
                    .any(|group| group.record_id == record.record_id);
                if !queued {
                    starter.running.remove(&record.record_id);
                }
            }
            submit_refill(&i);
        });
    }

    fn trip_pending_key(&self, key: &Key, data: bytes::Bytes) {
        self.inner.offered.remove_everywhere(key);
        self.inner.transient.trip_pending_key(key, &data);

        // Cheap existence check first, the job itself is the expensive
        // part.
        if self.inner.persistent.any_probably_want_key(key) {
            let i = self.inner.clone();
            let key = key.clone();
            self.inner
                .submit(JobPriority::TRIP_PENDING, None, move || {
                    i.persistent.trip_pending_key(&key, &data);
                });
        }
    }

    fn maybe_queue_offered_key(&self, key: Key, force: bool) {
        let seed = if force {
            Some(priority_class::IMMEDIATE)
        } else {
            None
        };
        let prio = self.inner.transient.get_key_prio(&key, seed);
        let prio = self.inner.persistent.get_key_prio(&key, prio);
        if let Some(class) = prio {
            if self.inner.offered.insert(class, key) {
                self.inner.waker.wake();
            }
        }
    }

    fn dequeue_offered_key(&self, key: &Key) {
        self.inner.offered.remove_everywhere(key);
    }

    fn reregister_all(&self, requester: &RequesterId) {
        self.inner.transient.reregister_all(requester);

        let i = self.inner.clone();
        let requester = requester.clone();
        self.inner.submit(JobPriority::NORMAL, None, move || {
            {
                let mut starter = i.starter.lock().unwrap();
                starter.groups.retain(|group| {
                    group.request.requester() != requester
                });
            }
            submit_refill(&i);
        });

        self.inner.waker.wake();
    }

    fn count_queued_requests(&self) -> u64 {
        self.inner.transient.count_queued()
            + self.inner.persistent.count_queued()
    }

    fn remove_pending_keys(
        &self,
        listener: DynKeyListener,
        complain_if_absent: bool,
    ) {
        let found_transient =
            self.inner.transient.remove_listener(&listener);

        let i = self.inner.clone();
        self.inner.submit(JobPriority::NORMAL, None, move || {
            let found_persistent =
                i.persistent.remove_listener(&listener);
            if complain_if_absent
                && !found_transient
                && !found_persistent
            {
                tracing::error!(
                    requester = %listener.requester(),
                    "removed pending keys for an unknown listener",
                );
            }
        });
    }

    fn queue_cooldown(
        &self,
        key: Key,
        request: DynSendableRequest,
    ) -> FtResult<std::time::Instant> {
        if request.persistent() {
            if !on_executor() {
                return Err(FtError::invalid_state(
                    "cooldown for a durable request outside \
                     the persistence context",
                ));
            }
            Ok(self
                .inner
                .cooldown_persistent
                .lock()
                .unwrap()
                .add(key, request))
        } else {
            Ok(self
                .inner
                .cooldown_transient
                .lock()
                .unwrap()
                .add(key, request))
        }
    }

    fn remove_fetching_key(&self, key: &Key) {
        self.inner.starter.lock().unwrap().fetching.remove(key);
    }

    fn finish_register(
        &self,
        requests: Vec<DynSendableRequest>,
        persistent: bool,
        any_valid: bool,
    ) {
        if !persistent {
            if !any_valid {
                return;
            }
            self.inner.transient.register_requests(requests);
            self.inner.waker.wake();
            return;
        }

        let i = self.inner.clone();
        if on_executor() {
            finish_register_persistent(&i, requests, any_valid);
        } else {
            self.inner.submit(JobPriority::NORMAL, None, move || {
                finish_register_persistent(&i, requests, any_valid)
            });
        }
    }

    fn salt_key(&self, key: &Key) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&key.0 .0);
        hasher.update(self.inner.persistent.salt());
        hasher.finalize().into()
    }

    fn set_priority_policy(&self, policy: PriorityPolicy) {
        *self.inner.policy.lock().unwrap() = policy;
    }

    fn priority_policy(&self) -> PriorityPolicy {
        *self.inner.policy.lock().unwrap()
    }
}

#[cfg(test)]
mod test;
