//! Ferret request and dispatch types.

use crate::{FtError, Key, RecordId, RequesterId, Timestamp};
use std::sync::Arc;

/// Request priority classes. Lower values are more urgent.
///
/// Dispatch orders groups by (priority class, retry count) ascending, so
/// a class-1 request with many retries still beats a fresh class-4 one.
pub mod priority_class {
    /// Absolute top priority, reserved for node-critical traffic.
    pub const MAXIMUM: u8 = 0;

    /// Operations a user is actively waiting on.
    pub const INTERACTIVE: u8 = 1;

    /// Semi-interactive operations, wanted soon but not blocking a user.
    pub const IMMEDIATE: u8 = 2;

    /// Subscription update traffic.
    pub const UPDATE: u8 = 3;

    /// Large background transfers.
    pub const BULK: u8 = 4;

    /// Speculative prefetch.
    pub const PREFETCH: u8 = 5;

    /// Absolute lowest priority.
    pub const MINIMUM: u8 = 6;

    /// The number of distinct priority classes.
    pub const NUM_PRIORITY_CLASSES: usize = 7;
}

/// Whether a scheduler instance dispatches fetches or inserts.
///
/// A node runs one scheduler per kind; registering a request with the
/// wrong kind is an invariant violation, not a routing hint.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    /// Retrieve blocks from the network.
    Fetch,

    /// Push blocks to the network.
    Insert,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch => f.write_str("fetch"),
            Self::Insert => f.write_str("insert"),
        }
    }
}

/// The kind of failure the sending layer reports for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// No route to any peer that could serve the key.
    RouteNotFound,

    /// A peer rejected the attempt due to load.
    RejectedOverload,

    /// The transfer started but did not complete.
    TransferFailed,

    /// The network answered authoritatively that the data is not found.
    DataNotFound,

    /// A local failure unrelated to the network.
    Internal,
}

/// A transport or store failure surfaced to a request's own failure
/// handler. The scheduler never interprets these beyond routing them.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {ctx}")]
pub struct SendError {
    /// The failure category.
    pub kind: SendErrorKind,

    /// Any context associated with this failure.
    pub ctx: Arc<str>,
}

impl SendError {
    /// Construct a new SendError.
    pub fn new<C: std::fmt::Display>(kind: SendErrorKind, ctx: C) -> Self {
        Self {
            kind,
            ctx: ctx.to_string().into_boxed_str().into(),
        }
    }
}

/// Priority of a job submitted to the serialized persistence context.
/// Lower values run sooner; jobs at the same level run in submission
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobPriority(pub u8);

impl JobPriority {
    /// Starter queue refill.
    pub const FILL: Self = Self(0);

    /// Pending-key trips and success bookkeeping. Runs ahead of normal
    /// work so a found block reaches its listeners before anything else
    /// touches the same key.
    pub const TRIP_PENDING: Self = Self(1);

    /// Registration, sweeps, and other routine work.
    pub const NORMAL: Self = Self(4);

    /// Deferred stub reconciliation.
    pub const LOW: Self = Self(6);
}

/// The durable descriptor of a persistent request.
///
/// This is what actually lands in the record store. A full record carries
/// everything needed to rehydrate the live request after a restart; a
/// `stub` record is the minimal deferred-registration form written when
/// the persistence context is backlogged, later upgraded by the
/// reconcile job.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// The durable address of this record.
    pub record_id: RecordId,

    /// The owning client.
    pub requester: RequesterId,

    /// Fetch or insert.
    pub kind: RequestKind,

    /// The priority class at registration time.
    pub priority_class: u8,

    /// The retry count at registration time.
    pub retry_count: u32,

    /// The keys this request wants.
    pub keys: Vec<Key>,

    /// When the record was written.
    pub registered_at: Timestamp,

    /// True for the deferred-registration form.
    #[serde(default)]
    pub stub: bool,
}

/// A low-level request the scheduler can hand to the sending layer.
///
/// One request covers one or more keys. The scheduler treats the request
/// as the unit of registration and priority, and individual keys as the
/// unit of dispatch.
pub trait SendableRequest: 'static + Send + Sync + std::fmt::Debug {
    /// Fetch or insert.
    fn kind(&self) -> RequestKind;

    /// True if this request must survive a restart. Immutable for the
    /// lifetime of the request.
    fn persistent(&self) -> bool;

    /// The current priority class, 0 most urgent. See [priority_class].
    fn priority_class(&self) -> u8;

    /// How many times this request has been retried.
    fn retry_count(&self) -> u32;

    /// True once the owner has cancelled this request. Checked lazily
    /// right before a block is handed out.
    fn is_cancelled(&self) -> bool;

    /// True once no keys remain wanted.
    fn is_empty(&self) -> bool;

    /// The owning client.
    fn requester(&self) -> RequesterId;

    /// The keys still wanted by this request.
    fn list_keys(&self) -> Vec<Key>;

    /// The durable descriptor for this request. `Some` iff
    /// [SendableRequest::persistent] is true.
    fn record(&self) -> Option<RequestRecord>;

    /// The sending layer failed an attempt for this request.
    fn on_failure(&self, err: SendError);

    /// A cooldown on the given key expired and the key is dispatchable
    /// again.
    fn requeue_after_cooldown(&self, key: &Key);

    /// The scheduler hit an internal error while handling this request.
    fn internal_error(&self, err: FtError);
}

/// Trait object [SendableRequest].
pub type DynSendableRequest = Arc<dyn SendableRequest>;

/// An immutable unit of dispatch: one key of one request, valid for a
/// single network attempt.
#[derive(Debug, Clone)]
pub struct ChosenBlock {
    /// The key to attempt.
    pub key: Key,

    /// The request the key belongs to.
    pub request: DynSendableRequest,

    /// Snapshot of the request's persistence flag at grab time.
    pub persistent: bool,
}

/// Rebuilds a live request from its durable descriptor, after a restart
/// or when a stub record is reconciled.
pub trait RequestHydrator: 'static + Send + Sync + std::fmt::Debug {
    /// Construct a live request from a record. An `Err` means the record
    /// cannot be reactivated; the scheduler logs and skips it.
    fn hydrate(
        &self,
        record: &RequestRecord,
    ) -> crate::FtResult<DynSendableRequest>;
}

/// Trait object [RequestHydrator].
pub type DynRequestHydrator = Arc<dyn RequestHydrator>;

/// Pokes the node's sending driver whenever new work may have become
/// dispatchable.
pub trait DispatchWaker: 'static + Send + Sync + std::fmt::Debug {
    /// New work may be available; poll [grab](crate::RequestScheduler::grab)
    /// soon.
    fn wake(&self);
}

/// Trait object [DispatchWaker].
pub type DynDispatchWaker = Arc<dyn DispatchWaker>;

/// A waker that does nothing, for embedders that poll on their own
/// schedule.
#[derive(Debug)]
pub struct NoopWaker;

impl DispatchWaker for NoopWaker {
    fn wake(&self) {}
}

/// Seam for local datastore presence checks.
///
/// When installed, newly registered requests are handed here before they
/// become dispatchable; the node checks its local store and reports back
/// via [finish_register](crate::RequestScheduler::finish_register). No
/// checking policy lives in the scheduler.
pub trait DatastoreChecker: 'static + Send + Sync + std::fmt::Debug {
    /// Queue a batch of requests for a local presence check.
    fn queue_check(
        &self,
        requests: Vec<DynSendableRequest>,
        block_hint: Option<bytes::Bytes>,
        persistent: bool,
    );
}

/// Trait object [DatastoreChecker].
pub type DynDatastoreChecker = Arc<dyn DatastoreChecker>;
