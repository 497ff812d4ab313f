use super::config::CoreSchedConfig;
use super::{CoreSched, CoreSchedFactory};
use crate::factories::MemRecordStore;
use ferret_api::*;
use ferret_test_utils::{
    enable_tracing, iter_check, random_key, FailingListenerSource,
    TestHydrator, TestListener, TestRequest,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Test {
    sched: CoreSched,
    store: DynRecordStore,
    hydrator: Arc<TestHydrator>,
}

impl Test {
    fn setup() -> Self {
        Self::setup_config(CoreSchedConfig::default())
    }

    fn setup_config(config: CoreSchedConfig) -> Self {
        Self::setup_with(config, None)
    }

    fn setup_with(
        config: CoreSchedConfig,
        checker: Option<DynDatastoreChecker>,
    ) -> Self {
        let store = MemRecordStore::create();
        let hydrator = TestHydrator::create();
        let sched = CoreSched::new(
            config,
            RequestKind::Fetch,
            store.clone(),
            hydrator.clone(),
            checker,
            Arc::new(NoopWaker),
        )
        .unwrap();
        Self {
            sched,
            store,
            hydrator,
        }
    }

    /// Register a durable batch and wait for it to land in the starter
    /// queue.
    async fn register_durable(&self, requests: Vec<DynSendableRequest>) {
        let want = requests.len();
        self.sched
            .register(None, requests, true, None, false)
            .unwrap();
        iter_check!(1000, {
            if self.sched.inner.starter.lock().unwrap().groups.len()
                >= want
            {
                break;
            }
        });
    }

    /// Register a single durable request with its listener source and
    /// wait for it to land in the starter queue.
    async fn register_durable_with_listener(
        &self,
        listener: DynHasKeyListener,
        request: DynSendableRequest,
    ) {
        self.sched
            .register(Some(listener), vec![request], true, None, false)
            .unwrap();
        iter_check!(1000, {
            if !self
                .sched
                .inner
                .starter
                .lock()
                .unwrap()
                .groups
                .is_empty()
            {
                break;
            }
        });
    }
}

#[derive(Debug)]
struct RecordingChecker {
    batches: Mutex<Vec<(Vec<DynSendableRequest>, bool)>>,
}

impl RecordingChecker {
    fn create() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
        })
    }

    fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

impl DatastoreChecker for RecordingChecker {
    fn queue_check(
        &self,
        requests: Vec<DynSendableRequest>,
        _block_hint: Option<bytes::Bytes>,
        persistent: bool,
    ) {
        self.batches.lock().unwrap().push((requests, persistent));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn factory_creates_with_default_config() {
    enable_tracing();

    let factory = CoreSchedFactory::create();
    let mut config = ferret_api::config::Config::default();
    factory.default_config(&mut config).unwrap();

    let sched = factory
        .create(
            Arc::new(config),
            RequestKind::Fetch,
            MemRecordStore::create(),
            TestHydrator::create(),
            None,
            Arc::new(NoopWaker),
        )
        .await
        .unwrap();

    assert_eq!(PriorityPolicy::Hard, sched.priority_policy());
    assert_eq!(0, sched.count_queued_requests());
    assert!(sched.grab().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_register_grab_succeed() {
    enable_tracing();
    let test = Test::setup();

    let key = random_key();
    let request = TestRequest::fetch(&[key.clone()]).build();
    test.sched
        .register(None, vec![request.clone()], false, None, false)
        .unwrap();
    assert_eq!(1, test.sched.count_queued_requests());

    let block = test.sched.grab().unwrap();
    assert_eq!(key, block.key);
    assert!(!block.persistent);

    // The key is in flight, nothing else to hand out.
    assert!(test.sched.grab().is_none());

    request.remove_key(&key);
    test.sched.succeeded(request.clone(), &block);
    assert_eq!(0, test.sched.count_queued_requests());
    assert!(test.sched.grab().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_orders_by_class_then_retries() {
    enable_tracing();
    let test = Test::setup();

    let retried = random_key();
    let fresh = random_key();
    let slow = random_key();
    let requests: Vec<DynSendableRequest> = vec![
        TestRequest::fetch(&[retried.clone()])
            .priority_class(priority_class::INTERACTIVE)
            .retry_count(5)
            .build(),
        TestRequest::fetch(&[fresh.clone()])
            .priority_class(priority_class::INTERACTIVE)
            .build(),
        TestRequest::fetch(&[slow.clone()])
            .priority_class(priority_class::UPDATE)
            .build(),
    ];
    test.sched
        .register(None, requests, false, None, false)
        .unwrap();

    assert_eq!(fresh, test.sched.grab().unwrap().key);
    assert_eq!(retried, test.sched.grab().unwrap().key);
    assert_eq!(slow, test.sched.grab().unwrap().key);
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_beats_durable_within_bound() {
    enable_tracing();
    let test = Test::setup();

    let durable_key = random_key();
    test.register_durable(vec![TestRequest::fetch(&[durable_key])
        .persistent()
        .priority_class(priority_class::BULK)
        .build()])
        .await;

    let urgent = random_key();
    test.sched
        .register(
            None,
            vec![TestRequest::fetch(&[urgent.clone()])
                .priority_class(priority_class::INTERACTIVE)
                .build()],
            false,
            None,
            false,
        )
        .unwrap();

    let block = test.sched.grab().unwrap();
    assert_eq!(urgent, block.key);
    assert!(!block.persistent);
}

#[tokio::test(flavor = "multi_thread")]
async fn hard_policy_durable_beats_looser_transient() {
    enable_tracing();
    let test = Test::setup();

    let durable_key = random_key();
    test.register_durable(vec![TestRequest::fetch(&[durable_key
        .clone()])
        .persistent()
        .priority_class(priority_class::INTERACTIVE)
        .build()])
        .await;

    test.sched
        .register(
            None,
            vec![TestRequest::fetch(&[random_key()])
                .priority_class(priority_class::IMMEDIATE)
                .build()],
            false,
            None,
            false,
        )
        .unwrap();

    let block = test.sched.grab().unwrap();
    assert_eq!(durable_key, block.key);
    assert!(block.persistent);
}

#[tokio::test(flavor = "multi_thread")]
async fn soft_policy_grants_transient_slack() {
    enable_tracing();
    let test = Test::setup();
    test.sched.set_priority_policy(PriorityPolicy::Soft);
    assert_eq!(PriorityPolicy::Soft, test.sched.priority_policy());

    test.register_durable(vec![TestRequest::fetch(&[random_key()])
        .persistent()
        .priority_class(priority_class::BULK)
        .build()])
        .await;

    // One class looser than the durable bound, allowed by the default
    // slack of one.
    let prefetch = random_key();
    test.sched
        .register(
            None,
            vec![TestRequest::fetch(&[prefetch.clone()])
                .priority_class(priority_class::PREFETCH)
                .build()],
            false,
            None,
            false,
        )
        .unwrap();

    let block = test.sched.grab().unwrap();
    assert_eq!(prefetch, block.key);
    assert!(!block.persistent);
}

#[tokio::test(flavor = "multi_thread")]
async fn kind_mismatch_rejected_before_mutation() {
    enable_tracing();
    let test = Test::setup();

    let request = TestRequest::insert(&[random_key()]).build();
    let err = test
        .sched
        .register(None, vec![request.clone()], false, None, false)
        .unwrap_err();

    assert!(err.is_invalid_state());
    assert_eq!(1, request.internal_error_count());
    assert_eq!(0, test.sched.count_queued_requests());
    assert!(test.sched.grab().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn persistence_flag_mismatch_rejected() {
    enable_tracing();
    let test = Test::setup();

    let request = TestRequest::fetch(&[random_key()]).build();
    let err = test
        .sched
        .register(None, vec![request.clone()], true, None, false)
        .unwrap_err();

    assert!(err.is_invalid_state());
    assert_eq!(1, request.internal_error_count());
    assert_eq!(0, test.sched.count_queued_requests());
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_listener_aborts_registration() {
    enable_tracing();
    let test = Test::setup();

    let err = test
        .sched
        .register(
            Some(Arc::new(FailingListenerSource)),
            vec![TestRequest::fetch(&[random_key()]).build()],
            false,
            None,
            false,
        )
        .unwrap_err();

    assert!(!err.is_invalid_state());
    assert_eq!(0, test.sched.count_queued_requests());
    assert!(test.sched.grab().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn cooldown_requeues_after_expiry() {
    enable_tracing();
    let test = Test::setup_config(CoreSchedConfig {
        cooldown_period: Duration::from_millis(30),
        sweep_interval: Duration::from_millis(10),
        ..Default::default()
    });

    let key = random_key();
    let request = TestRequest::fetch(&[key.clone()]).build();
    let request: DynSendableRequest = request;
    test.sched
        .register(None, vec![request.clone()], false, None, false)
        .unwrap();

    test.sched
        .queue_cooldown(key.clone(), request.clone())
        .unwrap();
    assert!(test.sched.grab().is_none());

    iter_check!(1000, {
        if !test
            .sched
            .inner
            .cooldown_transient
            .lock()
            .unwrap()
            .is_cooling(&key, &request)
        {
            break;
        }
    });

    let block = iter_check!(1000, {
        if let Some(block) = test.sched.grab() {
            return block;
        }
    });
    assert_eq!(key, block.key);
}

#[tokio::test(flavor = "multi_thread")]
async fn cooldown_expiry_notifies_the_request() {
    enable_tracing();
    let test = Test::setup_config(CoreSchedConfig {
        cooldown_period: Duration::from_millis(30),
        sweep_interval: Duration::from_millis(10),
        ..Default::default()
    });

    let key = random_key();
    let request = TestRequest::fetch(&[key.clone()]).build();
    test.sched
        .register(None, vec![request.clone()], false, None, false)
        .unwrap();
    test.sched
        .queue_cooldown(key.clone(), request.clone())
        .unwrap();

    iter_check!(1000, {
        if request.requeued_keys() == vec![key.clone()] {
            break;
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn durable_cooldown_requires_persistence_context() {
    enable_tracing();
    let test = Test::setup();

    let key = random_key();
    let request = TestRequest::fetch(&[key.clone()])
        .persistent()
        .build();
    let err = test
        .sched
        .queue_cooldown(key, request)
        .unwrap_err();
    assert!(err.is_invalid_state());
}

#[tokio::test(flavor = "multi_thread")]
async fn durable_grab_succeed_deletes_the_record() {
    enable_tracing();
    let test = Test::setup();

    let key = random_key();
    let request = TestRequest::fetch(&[key.clone()])
        .persistent()
        .build();
    test.register_durable(vec![request.clone()]).await;
    assert_eq!(2, test.store.list().unwrap().len());

    let block = test.sched.grab().unwrap();
    assert_eq!(key, block.key);
    assert!(block.persistent);

    request.remove_key(&key);
    test.sched.succeeded(request, &block);

    // Only the salt record stays behind.
    iter_check!(1000, {
        if test.store.list().unwrap().len() == 1 {
            break;
        }
    });
    assert_eq!(0, test.sched.count_queued_requests());
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_routes_to_the_durable_request() {
    enable_tracing();
    let test = Test::setup();

    let request = TestRequest::fetch(&[random_key()])
        .persistent()
        .build();
    test.register_durable(vec![request.clone()]).await;

    let block = test.sched.grab().unwrap();
    test.sched.call_failure(
        block.request.clone(),
        SendError::new(SendErrorKind::TransferFailed, "peer went away"),
        JobPriority::NORMAL,
    );

    iter_check!(1000, {
        if request.failures().len() == 1 {
            break;
        }
    });
    assert_eq!(
        SendErrorKind::TransferFailed,
        request.failures()[0].kind,
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_routes_to_the_transient_request_inline() {
    enable_tracing();
    let test = Test::setup();

    let request = TestRequest::fetch(&[random_key()]).build();
    let dyn_request: DynSendableRequest = request.clone();
    test.sched.call_failure(
        dyn_request,
        SendError::new(SendErrorKind::RouteNotFound, "no route"),
        JobPriority::NORMAL,
    );

    assert_eq!(1, request.failures().len());
    assert_eq!(SendErrorKind::RouteNotFound, request.failures()[0].kind);
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_rehydrates_durable_requests() {
    enable_tracing();
    let Test {
        sched,
        store,
        hydrator: _,
    } = Test::setup();

    let key = random_key();
    let request = TestRequest::fetch(&[key.clone()])
        .persistent()
        .build();
    sched
        .register(None, vec![request], true, None, false)
        .unwrap();
    iter_check!(1000, {
        if store.list().unwrap().len() == 2 {
            break;
        }
    });
    drop(sched);

    let hydrator = TestHydrator::create();
    let sched = CoreSched::new(
        CoreSchedConfig::default(),
        RequestKind::Fetch,
        store.clone(),
        hydrator.clone(),
        None,
        Arc::new(NoopWaker),
    )
    .unwrap();

    assert_eq!(1, hydrator.hydrated_count());
    assert_eq!(1, sched.count_queued_requests());

    let block = iter_check!(1000, {
        if let Some(block) = sched.grab() {
            return block;
        }
    });
    assert_eq!(key, block.key);
    assert!(block.persistent);
}

#[tokio::test(flavor = "multi_thread")]
async fn salt_survives_a_restart() {
    enable_tracing();
    let test = Test::setup();

    let key = random_key();
    let other = random_key();
    let digest = test.sched.salt_key(&key);
    assert_eq!(digest, test.sched.salt_key(&key));
    assert_ne!(digest, test.sched.salt_key(&other));

    let store = test.store.clone();
    drop(test);

    let sched = CoreSched::new(
        CoreSchedConfig::default(),
        RequestKind::Fetch,
        store,
        TestHydrator::create(),
        None,
        Arc::new(NoopWaker),
    )
    .unwrap();
    assert_eq!(digest, sched.salt_key(&key));
}

#[tokio::test(flavor = "multi_thread")]
async fn starter_admission_evicts_the_worst_group() {
    enable_tracing();
    let test = Test::setup_config(CoreSchedConfig {
        starter_queue_capacity: 1,
        starter_queue_warning: 3,
        ..Default::default()
    });

    let bulk_key = random_key();
    test.register_durable(vec![TestRequest::fetch(&[bulk_key.clone()])
        .persistent()
        .priority_class(priority_class::BULK)
        .build()])
        .await;

    let urgent_key = random_key();
    test.sched
        .register(
            None,
            vec![TestRequest::fetch(&[urgent_key.clone()])
                .persistent()
                .priority_class(priority_class::INTERACTIVE)
                .build()],
            true,
            None,
            false,
        )
        .unwrap();

    // The urgent group displaces the bulk one from the full queue.
    iter_check!(1000, {
        let starter = test.sched.inner.starter.lock().unwrap();
        if starter.groups.len() == 1
            && starter.groups[0].priority_class
                == priority_class::INTERACTIVE
        {
            break;
        }
    });

    assert_eq!(urgent_key, test.sched.grab().unwrap().key);

    // Refill brings the evicted record back once there is room again.
    let block = iter_check!(1000, {
        if let Some(block) = test.sched.grab() {
            return block;
        }
    });
    assert_eq!(bulk_key, block.key);
}

#[tokio::test(flavor = "multi_thread")]
async fn trip_pending_key_notifies_transient_listeners() {
    enable_tracing();
    let test = Test::setup();

    let key = random_key();
    let request: DynSendableRequest =
        TestRequest::fetch(&[key.clone()]).build();
    let listener = TestListener::for_requests(vec![request.clone()]);
    test.sched
        .register(
            Some(listener.source()),
            vec![request],
            false,
            None,
            false,
        )
        .unwrap();

    test.sched
        .trip_pending_key(&key, bytes::Bytes::from_static(b"data"));
    assert_eq!(vec![key], listener.found_keys());
}

#[tokio::test(flavor = "multi_thread")]
async fn trip_pending_key_notifies_durable_listeners() {
    enable_tracing();
    let test = Test::setup();

    let key = random_key();
    let request: DynSendableRequest = TestRequest::fetch(&[key.clone()])
        .persistent()
        .build();
    let listener = TestListener::for_requests(vec![request.clone()]);
    test.register_durable_with_listener(listener.source(), request)
        .await;

    test.sched
        .trip_pending_key(&key, bytes::Bytes::from_static(b"data"));
    iter_check!(1000, {
        if listener.found_keys() == vec![key.clone()] {
            break;
        }
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_pending_keys_unsubscribes() {
    enable_tracing();
    let test = Test::setup();

    let key = random_key();
    let request: DynSendableRequest =
        TestRequest::fetch(&[key.clone()]).build();
    let listener = TestListener::for_requests(vec![request.clone()]);
    test.sched
        .register(
            Some(listener.source()),
            vec![request],
            false,
            None,
            false,
        )
        .unwrap();

    test.sched
        .trip_pending_key(&key, bytes::Bytes::from_static(b"one"));
    test.sched.remove_pending_keys(listener.clone(), false);
    test.sched
        .trip_pending_key(&key, bytes::Bytes::from_static(b"two"));

    assert_eq!(vec![key], listener.found_keys());
}

#[tokio::test(flavor = "multi_thread")]
async fn forced_offered_key_is_dispatchable() {
    enable_tracing();
    let test = Test::setup();

    let key = random_key();
    test.sched.maybe_queue_offered_key(key.clone(), true);

    let block = test.sched.grab().unwrap();
    assert_eq!(key, block.key);
    assert!(!block.persistent);
    assert_eq!(
        priority_class::IMMEDIATE,
        block.request.priority_class(),
    );

    // Dispatching an offered key consumes it.
    assert!(test.sched.grab().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn unwanted_offered_key_is_ignored() {
    enable_tracing();
    let test = Test::setup();

    test.sched.maybe_queue_offered_key(random_key(), false);
    assert!(test.sched.grab().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn offered_key_adopts_listener_priority() {
    enable_tracing();
    let test = Test::setup();

    let key = random_key();
    let request: DynSendableRequest = TestRequest::fetch(&[key.clone()])
        .priority_class(priority_class::UPDATE)
        .build();
    let listener = TestListener::for_requests(vec![request.clone()]);
    test.sched
        .register(
            Some(listener.source()),
            vec![request],
            false,
            None,
            false,
        )
        .unwrap();

    test.sched.maybe_queue_offered_key(key, false);
    assert_eq!(
        Some(priority_class::UPDATE),
        test.sched
            .inner
            .offered
            .best_class(&std::collections::HashSet::new()),
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn dequeue_drops_an_offered_key() {
    enable_tracing();
    let test = Test::setup();

    let key = random_key();
    test.sched.maybe_queue_offered_key(key.clone(), true);
    test.sched.dequeue_offered_key(&key);
    assert!(test.sched.grab().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn trip_drops_an_offered_key() {
    enable_tracing();
    let test = Test::setup();

    let key = random_key();
    test.sched.maybe_queue_offered_key(key.clone(), true);
    test.sched
        .trip_pending_key(&key, bytes::Bytes::from_static(b"data"));
    assert!(test.sched.grab().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn reregister_moves_requests_to_their_new_class() {
    enable_tracing();
    let test = Test::setup();

    let mine = random_key();
    let other = random_key();
    let request = TestRequest::fetch(&[mine.clone()])
        .priority_class(priority_class::BULK)
        .build();
    let competitor: DynSendableRequest =
        TestRequest::fetch(&[other.clone()])
            .priority_class(priority_class::UPDATE)
            .build();
    test.sched
        .register(
            None,
            vec![request.clone(), competitor],
            false,
            None,
            false,
        )
        .unwrap();

    request.set_priority_class(priority_class::INTERACTIVE);
    test.sched.reregister_all(&request.requester());

    assert_eq!(mine, test.sched.grab().unwrap().key);
    assert_eq!(other, test.sched.grab().unwrap().key);
}

#[tokio::test(flavor = "multi_thread")]
async fn checker_gates_transient_registration() {
    enable_tracing();
    let checker = RecordingChecker::create();
    let test = Test::setup_with(
        CoreSchedConfig::default(),
        Some(checker.clone()),
    );

    let key = random_key();
    let request: DynSendableRequest =
        TestRequest::fetch(&[key.clone()]).build();
    test.sched
        .register(None, vec![request.clone()], false, None, false)
        .unwrap();

    // The batch is parked with the checker, not dispatchable yet.
    assert_eq!(1, checker.batch_count());
    assert!(test.sched.grab().is_none());

    test.sched.finish_register(vec![request], false, true);
    assert_eq!(key, test.sched.grab().unwrap().key);

    // Skipping the store check bypasses the seam entirely.
    let skipped = random_key();
    test.sched
        .register(
            None,
            vec![TestRequest::fetch(&[skipped.clone()]).build()],
            false,
            None,
            true,
        )
        .unwrap();
    assert_eq!(1, checker.batch_count());
    assert_eq!(skipped, test.sched.grab().unwrap().key);
}

#[tokio::test(flavor = "multi_thread")]
async fn checker_gates_durable_registration() {
    enable_tracing();
    let checker = RecordingChecker::create();
    let test = Test::setup_with(
        CoreSchedConfig::default(),
        Some(checker.clone()),
    );

    let key = random_key();
    let request: DynSendableRequest = TestRequest::fetch(&[key.clone()])
        .persistent()
        .build();
    test.sched
        .register(None, vec![request.clone()], true, None, false)
        .unwrap();

    iter_check!(1000, {
        if checker.batch_count() == 1 {
            break;
        }
    });
    assert!(test.sched.grab().is_none());

    test.sched.finish_register(vec![request], true, true);
    let block = iter_check!(1000, {
        if let Some(block) = test.sched.grab() {
            return block;
        }
    });
    assert_eq!(key, block.key);
    assert!(block.persistent);
}

#[tokio::test(flavor = "multi_thread")]
async fn store_satisfied_durable_requests_are_dropped() {
    enable_tracing();
    let checker = RecordingChecker::create();
    let test = Test::setup_with(
        CoreSchedConfig::default(),
        Some(checker.clone()),
    );

    let request: DynSendableRequest = TestRequest::fetch(&[random_key()])
        .persistent()
        .build();
    test.sched
        .register(None, vec![request.clone()], true, None, false)
        .unwrap();
    iter_check!(1000, {
        if checker.batch_count() == 1 {
            break;
        }
    });

    // The local store already had everything.
    test.sched.finish_register(vec![request], true, false);
    iter_check!(1000, {
        if test.store.list().unwrap().len() == 1
            && test.sched.count_queued_requests() == 0
        {
            break;
        }
    });
    assert!(test.sched.grab().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn backlogged_registration_degrades_to_stubs() {
    enable_tracing();
    let test = Test::setup_config(CoreSchedConfig {
        job_backlog_threshold: 0,
        ..Default::default()
    });

    // Hold the executor on a gate job so further jobs pile up behind
    // it.
    let (g_send, g_recv) = std::sync::mpsc::channel::<()>();
    test.sched.exec.submit(JobPriority::FILL, None, move || {
        g_recv.recv().unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    test.sched.exec.submit(JobPriority::NORMAL, None, || {});

    let key = random_key();
    let request = TestRequest::fetch(&[key.clone()])
        .persistent()
        .build();
    test.sched
        .register(None, vec![request], true, None, false)
        .unwrap();

    g_send.send(()).unwrap();

    // The deferred stub is committed, then upgraded to a full
    // registration by the reconcile job.
    iter_check!(1000, {
        if test.sched.count_queued_requests() == 1
            && !test.sched.inner.persistent.has_stubs()
        {
            break;
        }
    });
    assert_eq!(1, test.hydrator.hydrated_count());

    let block = iter_check!(1000, {
        if let Some(block) = test.sched.grab() {
            return block;
        }
    });
    assert_eq!(key, block.key);
    assert!(block.persistent);
}
