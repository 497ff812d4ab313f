//! Durable request index over the record store.
//!
//! All mutation happens on the serialized persistence context; the
//! assertion at each write entry point turns off-context callers into
//! invalid-state errors before anything is touched.

use super::exec::on_executor;
use ferret_api::*;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// Reserved record holding this store's private lookup salt.
fn salt_record_id() -> RecordId {
    RecordId::from(bytes::Bytes::from_static(b"scheduler-salt"))
}

fn assert_executor(ctx: &str) -> FtResult<()> {
    if on_executor() {
        Ok(())
    } else {
        Err(FtError::invalid_state(format!(
            "{ctx} outside the persistence context"
        )))
    }
}

#[derive(Debug)]
struct PersistentState {
    live: HashMap<RecordId, DynSendableRequest>,
    stubs: VecDeque<RecordId>,
    listeners: Vec<DynKeyListener>,
    salt: [u8; 32],
}

/// Index of durable requests: live rehydrated requests, deferred stub
/// records awaiting reconciliation, and the listeners registered
/// alongside them.
#[derive(Debug)]
pub(crate) struct PersistentIndex {
    kind: RequestKind,
    store: DynRecordStore,
    hydrator: DynRequestHydrator,
    state: Mutex<PersistentState>,
}

impl PersistentIndex {
    /// Load the store's surviving records: full records are rehydrated
    /// into live requests, stubs are queued for reconciliation. Records
    /// that fail to parse or hydrate are logged and left in place.
    pub fn open(
        kind: RequestKind,
        store: DynRecordStore,
        hydrator: DynRequestHydrator,
    ) -> FtResult<Self> {
        let mut live = HashMap::new();
        let mut stubs = VecDeque::new();
        let mut salt = None;

        for (record_id, data) in store.list()? {
            if record_id == salt_record_id() {
                if data.len() == 32 {
                    let mut s = [0_u8; 32];
                    s.copy_from_slice(&data);
                    salt = Some(s);
                } else {
                    tracing::warn!("malformed salt record, regenerating");
                }
                continue;
            }

            let record: RequestRecord =
                match serde_json::from_slice(&data) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::warn!(
                            ?err,
                            %record_id,
                            "unreadable request record, skipping",
                        );
                        continue;
                    }
                };

            if record.kind != kind {
                tracing::warn!(
                    %record_id,
                    record_kind = %record.kind,
                    scheduler_kind = %kind,
                    "request record of the wrong kind, skipping",
                );
                continue;
            }

            if record.stub {
                stubs.push_back(record_id);
                continue;
            }

            match hydrator.hydrate(&record) {
                Ok(request) => {
                    live.insert(record_id, request);
                }
                Err(err) => {
                    tracing::warn!(
                        ?err,
                        %record_id,
                        "failed to rehydrate request record, skipping",
                    );
                }
            }
        }

        let salt = match salt {
            Some(salt) => salt,
            None => {
                let salt = rand::random::<[u8; 32]>();
                store.put(
                    salt_record_id(),
                    bytes::Bytes::copy_from_slice(&salt),
                )?;
                salt
            }
        };

        Ok(Self {
            kind,
            store,
            hydrator,
            state: Mutex::new(PersistentState {
                live,
                stubs,
                listeners: Vec::new(),
                salt,
            }),
        })
    }

    /// This store's private lookup salt.
    pub fn salt(&self) -> [u8; 32] {
        self.state.lock().unwrap().salt
    }

    /// Attach a pending-key listener. Listener state is memory-only,
    /// so this is safe from any thread.
    pub fn add_listener(&self, listener: DynKeyListener) {
        self.state.lock().unwrap().listeners.push(listener);
    }

    /// Durably register a batch of requests. Each record is committed
    /// before its request goes live.
    pub fn register(
        &self,
        requests: Vec<DynSendableRequest>,
    ) -> FtResult<()> {
        assert_executor("durable register")?;

        for request in requests {
            if request.is_cancelled() {
                continue;
            }
            let record = request.record().ok_or_else(|| {
                FtError::invalid_state(
                    "durable request without a record",
                )
            })?;
            let data = serde_json::to_vec(&record)
                .map_err(FtError::other)?;
            self.store
                .put(record.record_id.clone(), data.into())?;
            self.state
                .lock()
                .unwrap()
                .live
                .insert(record.record_id, request);
        }

        Ok(())
    }

    /// Commit the minimal deferred-registration form of a record. The
    /// full registration happens later in [reconcile_stubs].
    ///
    /// [reconcile_stubs]: PersistentIndex::reconcile_stubs
    pub fn write_stub(&self, mut record: RequestRecord) -> FtResult<()> {
        assert_executor("stub write")?;

        record.stub = true;
        let data = serde_json::to_vec(&record).map_err(FtError::other)?;
        self.store.put(record.record_id.clone(), data.into())?;
        self.state
            .lock()
            .unwrap()
            .stubs
            .push_back(record.record_id);
        Ok(())
    }

    /// Upgrade up to `max` stub records into live requests, oldest
    /// first. Returns the newly live requests. Stubs that fail to load
    /// are logged and dropped.
    pub fn reconcile_stubs(
        &self,
        max: usize,
    ) -> FtResult<Vec<(RecordId, DynSendableRequest)>> {
        assert_executor("stub reconciliation")?;

        let mut out = Vec::new();
        while out.len() < max {
            let record_id = {
                match self.state.lock().unwrap().stubs.pop_front() {
                    Some(record_id) => record_id,
                    None => break,
                }
            };

            let Some(data) = self.store.get(&record_id)? else {
                continue;
            };
            let mut record: RequestRecord =
                match serde_json::from_slice(&data) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::warn!(
                            ?err,
                            %record_id,
                            "unreadable stub record, dropping",
                        );
                        self.store.delete(&record_id)?;
                        continue;
                    }
                };

            let request = match self.hydrator.hydrate(&record) {
                Ok(request) => request,
                Err(err) => {
                    tracing::warn!(
                        ?err,
                        %record_id,
                        "failed to hydrate stub record, dropping",
                    );
                    self.store.delete(&record_id)?;
                    continue;
                }
            };

            record.stub = false;
            let data = serde_json::to_vec(&record)
                .map_err(FtError::other)?;
            self.store.put(record_id.clone(), data.into())?;

            self.state
                .lock()
                .unwrap()
                .live
                .insert(record_id.clone(), request.clone());
            out.push((record_id, request));
        }
        Ok(out)
    }

    /// True while any stub records await reconciliation.
    pub fn has_stubs(&self) -> bool {
        !self.state.lock().unwrap().stubs.is_empty()
    }

    /// Remove a request and its durable record.
    pub fn remove(&self, record_id: &RecordId) -> FtResult<()> {
        assert_executor("durable remove")?;

        {
            let mut lock = self.state.lock().unwrap();
            lock.live.remove(record_id);
            lock.stubs.retain(|id| id != record_id);
        }
        self.store.delete(record_id)
    }

    /// The live request at a record id, if any.
    pub fn get_live(
        &self,
        record_id: &RecordId,
    ) -> Option<DynSendableRequest> {
        self.state.lock().unwrap().live.get(record_id).cloned()
    }

    /// The most urgent live request not in `excluded`. Cancelled and
    /// emptied requests are passed over; their removal happens on the
    /// dispatch paths.
    pub fn best_candidate(
        &self,
        excluded: &HashSet<RecordId>,
    ) -> Option<(RecordId, DynSendableRequest)> {
        let lock = self.state.lock().unwrap();
        lock.live
            .iter()
            .filter(|(record_id, request)| {
                !excluded.contains(*record_id)
                    && !request.is_cancelled()
                    && !request.is_empty()
            })
            .min_by_key(|(_, request)| {
                (request.priority_class(), request.retry_count())
            })
            .map(|(record_id, request)| {
                (record_id.clone(), request.clone())
            })
    }

    fn snapshot_wanting(&self, key: &Key) -> Vec<DynKeyListener> {
        self.state
            .lock()
            .unwrap()
            .listeners
            .iter()
            .filter(|l| l.probably_want_key(key))
            .cloned()
            .collect()
    }

    /// Notify every listener plausibly waiting on the key that a block
    /// arrived.
    pub fn trip_pending_key(&self, key: &Key, data: &bytes::Bytes) {
        for listener in self.snapshot_wanting(key) {
            listener.handle_found(key, data);
        }
    }

    pub fn any_probably_want_key(&self, key: &Key) -> bool {
        !self.snapshot_wanting(key).is_empty()
    }

    /// The most urgent priority class any request waiting on the key
    /// carries, folded with `seed`.
    pub fn get_key_prio(&self, key: &Key, seed: Option<u8>) -> Option<u8> {
        let mut out = seed;
        for listener in self.snapshot_wanting(key) {
            for request in listener.requests_for_key(key) {
                let class = request.priority_class();
                out = Some(match out {
                    Some(prev) => prev.min(class),
                    None => class,
                });
            }
        }
        out
    }

    /// Drop a listener by identity. Returns true if it was registered.
    pub fn remove_listener(&self, listener: &DynKeyListener) -> bool {
        let mut lock = self.state.lock().unwrap();
        let before = lock.listeners.len();
        lock.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        lock.listeners.len() != before
    }

    /// Drop all of a requester's live requests and records. Returns the
    /// dropped record ids.
    pub fn remove_by_requester(
        &self,
        requester: &RequesterId,
    ) -> FtResult<Vec<RecordId>> {
        assert_executor("durable remove")?;

        let doomed: Vec<RecordId> = {
            let lock = self.state.lock().unwrap();
            lock.live
                .iter()
                .filter(|(_, request)| request.requester() == *requester)
                .map(|(record_id, _)| record_id.clone())
                .collect()
        };
        for record_id in doomed.iter() {
            self.remove(record_id)?;
        }
        Ok(doomed)
    }

    /// Diagnostic count of durable requests, live plus deferred stubs.
    pub fn count_queued(&self) -> u64 {
        let lock = self.state.lock().unwrap();
        (lock.live.len() + lock.stubs.len()) as u64
    }
}
