//! Request scheduler module types.

use crate::{
    config, BoxFut, ChosenBlock, DynDatastoreChecker, DynDispatchWaker,
    DynHasKeyListener, DynKeyListener, DynRecordStore, DynRequestHydrator,
    DynSendableRequest, FtResult, JobPriority, Key, RequestKind, RequesterId,
    SendError,
};
use std::sync::Arc;

/// Runtime-tunable tolerance for preferring memory-only requests over
/// durable ones during dispatch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum PriorityPolicy {
    /// A transient candidate must tie or beat the best durable group's
    /// (priority, retry) ordering key exactly.
    Hard,

    /// A transient candidate may be up to the configured slack worse in
    /// priority class and still win.
    Soft,
}

/// Trait for implementing a request scheduler module, the component that
/// decides which single block the sending layer should attempt next.
pub trait RequestScheduler: 'static + Send + Sync + std::fmt::Debug {
    /// Register a batch of requests, optionally with a key listener.
    ///
    /// `persistent` must match every request's own persistence flag.
    /// Registering requests of the wrong [RequestKind] for this scheduler
    /// fails with an invalid-state error before anything is mutated.
    /// `block_hint` is handed through to the datastore checker when the
    /// caller already holds candidate block data. `skip_store_check`
    /// bypasses the checker seam entirely.
    fn register(
        &self,
        listener: Option<DynHasKeyListener>,
        requests: Vec<DynSendableRequest>,
        persistent: bool,
        block_hint: Option<bytes::Bytes>,
        skip_store_check: bool,
    ) -> FtResult<()>;

    /// Choose the next block to attempt, or `None` if nothing is
    /// currently dispatchable. Safe to call from any thread, including
    /// concurrently.
    fn grab(&self) -> Option<ChosenBlock>;

    /// The sending layer completed the block successfully. The in-flight
    /// key is released immediately; durable bookkeeping follows on the
    /// persistence context.
    fn succeeded(&self, request: DynSendableRequest, block: &ChosenBlock);

    /// Route a failure to the request's own handler, marshaling through
    /// the persistence context at the given priority when the request is
    /// durable.
    fn call_failure(
        &self,
        request: DynSendableRequest,
        err: SendError,
        priority: JobPriority,
    );

    /// A block for the key arrived from any direction. Notifies every
    /// listener waiting on the key and drops the key from the offered
    /// set.
    fn trip_pending_key(&self, key: &Key, data: bytes::Bytes);

    /// A peer offered us a key. Queue it for fetching if any listener
    /// plausibly wants it, or unconditionally at the immediate class
    /// when `force` is set.
    fn maybe_queue_offered_key(&self, key: Key, force: bool);

    /// Drop an offered key from every priority bucket.
    fn dequeue_offered_key(&self, key: &Key);

    /// Re-bucket all of an owner's requests after an out-of-band
    /// priority change.
    fn reregister_all(&self, requester: &RequesterId);

    /// Diagnostic count of queued requests, transient plus durable.
    fn count_queued_requests(&self) -> u64;

    /// Remove a listener's pending-key subscriptions. Idempotent; if
    /// `complain_if_absent` and the listener is unknown to both indexes,
    /// an error is logged.
    fn remove_pending_keys(
        &self,
        listener: DynKeyListener,
        complain_if_absent: bool,
    );

    /// Put a (key, request) pair on cooldown, returning the expiry.
    ///
    /// Durable requests must call this from the persistence context;
    /// elsewhere it fails with an invalid-state error and mutates
    /// nothing.
    fn queue_cooldown(
        &self,
        key: Key,
        request: DynSendableRequest,
    ) -> FtResult<std::time::Instant>;

    /// The sending layer finished an attempt for the key, successfully
    /// or not. Clears the in-flight bookkeeping so the key can be chosen
    /// again.
    fn remove_fetching_key(&self, key: &Key);

    /// Completion hook for the datastore checker: the requests in the
    /// batch that were not satisfied locally now finish registration.
    /// `any_valid` is false when every request was satisfied or
    /// cancelled.
    fn finish_register(
        &self,
        requests: Vec<DynSendableRequest>,
        persistent: bool,
        any_valid: bool,
    );

    /// Digest of the routing key mixed with this store's private random
    /// salt, for local lookup addressing that outsiders cannot predict.
    fn salt_key(&self, key: &Key) -> [u8; 32];

    /// Set the dispatch tolerance policy.
    fn set_priority_policy(&self, policy: PriorityPolicy);

    /// Get the dispatch tolerance policy.
    fn priority_policy(&self) -> PriorityPolicy;
}

/// Trait object [RequestScheduler].
pub type DynRequestScheduler = Arc<dyn RequestScheduler>;

/// A factory for creating RequestScheduler instances.
pub trait RequestSchedulerFactory:
    'static + Send + Sync + std::fmt::Debug
{
    /// Help the builder construct a default config from the chosen
    /// module factories.
    fn default_config(&self, config: &mut config::Config) -> FtResult<()>;

    /// Construct a RequestScheduler instance.
    fn create(
        &self,
        config: Arc<config::Config>,
        kind: RequestKind,
        record_store: DynRecordStore,
        hydrator: DynRequestHydrator,
        checker: Option<DynDatastoreChecker>,
        waker: DynDispatchWaker,
    ) -> BoxFut<'static, FtResult<DynRequestScheduler>>;
}

/// Trait object [RequestSchedulerFactory].
pub type DynRequestSchedulerFactory = Arc<dyn RequestSchedulerFactory>;
