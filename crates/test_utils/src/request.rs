//! Test implementations of the request traits.

use ferret_api::*;
use std::sync::atomic::{
    AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering,
};
use std::sync::{Arc, Mutex};

/// Builder for [TestRequest]. Obtained from [TestRequest::fetch] or
/// [TestRequest::insert].
#[derive(Debug)]
pub struct TestRequestBuilder {
    kind: RequestKind,
    keys: Vec<Key>,
    persistent: bool,
    priority_class: u8,
    retry_count: u32,
    requester: Option<RequesterId>,
}

impl TestRequestBuilder {
    /// Set the priority class. Defaults to [priority_class::BULK].
    pub fn priority_class(mut self, priority_class: u8) -> Self {
        self.priority_class = priority_class;
        self
    }

    /// Set the retry count. Defaults to zero.
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Mark the request durable. Durable test requests carry a record
    /// with a random stable record id.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Set the owning requester. Defaults to a fresh random id.
    pub fn requester(mut self, requester: RequesterId) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Build the request.
    pub fn build(self) -> Arc<TestRequest> {
        let requester = self
            .requester
            .unwrap_or_else(crate::random_requester_id);
        Arc::new(TestRequest {
            kind: self.kind,
            persistent: self.persistent,
            record_id: crate::random_record_id(),
            requester,
            registered_at: Timestamp::now(),
            priority_class: AtomicU8::new(self.priority_class),
            retry_count: AtomicU32::new(self.retry_count),
            cancelled: AtomicBool::new(false),
            keys: Mutex::new(self.keys),
            failures: Mutex::new(Vec::new()),
            requeued: Mutex::new(Vec::new()),
            internal_errors: AtomicUsize::new(0),
        })
    }
}

/// A scriptable in-memory [SendableRequest] that records every callback
/// it receives.
#[derive(Debug)]
pub struct TestRequest {
    kind: RequestKind,
    persistent: bool,
    record_id: RecordId,
    requester: RequesterId,
    registered_at: Timestamp,
    priority_class: AtomicU8,
    retry_count: AtomicU32,
    cancelled: AtomicBool,
    keys: Mutex<Vec<Key>>,
    failures: Mutex<Vec<SendError>>,
    requeued: Mutex<Vec<Key>>,
    internal_errors: AtomicUsize,
}

impl TestRequest {
    /// Builder for a fetch request over the given keys.
    pub fn fetch(keys: &[Key]) -> TestRequestBuilder {
        Self::builder(RequestKind::Fetch, keys)
    }

    /// Builder for an insert request over the given keys.
    pub fn insert(keys: &[Key]) -> TestRequestBuilder {
        Self::builder(RequestKind::Insert, keys)
    }

    fn builder(kind: RequestKind, keys: &[Key]) -> TestRequestBuilder {
        TestRequestBuilder {
            kind,
            keys: keys.to_vec(),
            persistent: false,
            priority_class: priority_class::BULK,
            retry_count: 0,
            requester: None,
        }
    }

    /// Rebuild a durable request from its record, as a hydrator would.
    pub fn from_record(record: &RequestRecord) -> Arc<TestRequest> {
        Arc::new(TestRequest {
            kind: record.kind,
            persistent: true,
            record_id: record.record_id.clone(),
            requester: record.requester.clone(),
            registered_at: record.registered_at,
            priority_class: AtomicU8::new(record.priority_class),
            retry_count: AtomicU32::new(record.retry_count),
            cancelled: AtomicBool::new(false),
            keys: Mutex::new(record.keys.clone()),
            failures: Mutex::new(Vec::new()),
            requeued: Mutex::new(Vec::new()),
            internal_errors: AtomicUsize::new(0),
        })
    }

    /// Cancel the request.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Change the priority class of the live request.
    pub fn set_priority_class(&self, priority_class: u8) {
        self.priority_class.store(priority_class, Ordering::SeqCst);
    }

    /// Drop one key from the wanted set, as a completed transfer would.
    pub fn remove_key(&self, key: &Key) {
        self.keys.lock().unwrap().retain(|k| k != key);
    }

    /// The failures routed to this request so far.
    pub fn failures(&self) -> Vec<SendError> {
        self.failures.lock().unwrap().clone()
    }

    /// The keys whose cooldowns have expired so far.
    pub fn requeued_keys(&self) -> Vec<Key> {
        self.requeued.lock().unwrap().clone()
    }

    /// How many internal errors have been routed to this request.
    pub fn internal_error_count(&self) -> usize {
        self.internal_errors.load(Ordering::SeqCst)
    }
}

impl SendableRequest for TestRequest {
    fn kind(&self) -> RequestKind {
        self.kind
    }

    fn persistent(&self) -> bool {
        self.persistent
    }

    fn priority_class(&self) -> u8 {
        self.priority_class.load(Ordering::SeqCst)
    }

    fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn is_empty(&self) -> bool {
        self.keys.lock().unwrap().is_empty()
    }

    fn requester(&self) -> RequesterId {
        self.requester.clone()
    }

    fn list_keys(&self) -> Vec<Key> {
        self.keys.lock().unwrap().clone()
    }

    fn record(&self) -> Option<RequestRecord> {
        if !self.persistent {
            return None;
        }
        Some(RequestRecord {
            record_id: self.record_id.clone(),
            requester: self.requester.clone(),
            kind: self.kind,
            priority_class: self.priority_class(),
            retry_count: self.retry_count(),
            keys: self.list_keys(),
            registered_at: self.registered_at,
            stub: false,
        })
    }

    fn on_failure(&self, err: SendError) {
        self.failures.lock().unwrap().push(err);
    }

    fn requeue_after_cooldown(&self, key: &Key) {
        self.requeued.lock().unwrap().push(key.clone());
    }

    fn internal_error(&self, _err: FtError) {
        self.internal_errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// A [RequestHydrator] that rebuilds [TestRequest]s, counting the
/// rebuilds it performs.
#[derive(Debug)]
pub struct TestHydrator {
    count: AtomicUsize,
}

impl TestHydrator {
    /// Construct a new TestHydrator.
    pub fn create() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
        })
    }

    /// How many records have been hydrated so far.
    pub fn hydrated_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl RequestHydrator for TestHydrator {
    fn hydrate(
        &self,
        record: &RequestRecord,
    ) -> FtResult<DynSendableRequest> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(TestRequest::from_record(record))
    }
}
