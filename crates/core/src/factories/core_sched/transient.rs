//! Memory-only request index: priority buckets plus key listeners.

use ferret_api::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct TransientState {
    buckets: Vec<Vec<DynSendableRequest>>,
    listeners: Vec<DynKeyListener>,
}

/// Index of transient requests, bucketed by priority class, plus the
/// pending-key listeners registered alongside them.
///
/// Listener callbacks can call back into the scheduler, so they are
/// always invoked after the internal lock is released. Cheap request
/// getters (priority class, cancellation) are fine under the lock.
#[derive(Debug)]
pub(crate) struct TransientIndex {
    state: Mutex<TransientState>,
}

fn clamp(priority_class: u8) -> usize {
    (priority_class as usize).min(priority_class::NUM_PRIORITY_CLASSES - 1)
}

impl TransientIndex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransientState {
                buckets: (0..priority_class::NUM_PRIORITY_CLASSES)
                    .map(|_| Vec::new())
                    .collect(),
                listeners: Vec::new(),
            }),
        }
    }

    pub fn add_listener(&self, listener: DynKeyListener) {
        self.state.lock().unwrap().listeners.push(listener);
    }

    /// Bucket a batch of requests by their current priority class.
    /// Cancelled requests are skipped.
    pub fn register_requests(&self, requests: Vec<DynSendableRequest>) {
        let mut lock = self.state.lock().unwrap();
        for request in requests {
            if request.is_cancelled() {
                continue;
            }
            let class = clamp(request.priority_class());
            lock.buckets[class].push(request);
        }
    }

    /// Drop one request from every bucket by identity.
    pub fn remove_request(&self, request: &DynSendableRequest) {
        let mut lock = self.state.lock().unwrap();
        for bucket in lock.buckets.iter_mut() {
            bucket.retain(|r| !Arc::ptr_eq(r, request));
        }
    }

    /// Drop a listener by identity. Returns true if it was registered.
    pub fn remove_listener(&self, listener: &DynKeyListener) -> bool {
        let mut lock = self.state.lock().unwrap();
        let before = lock.listeners.len();
        lock.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        lock.listeners.len() != before
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

    /// All transiently indexed requests waiting on the key.
    pub fn requests_for_key(&self, key: &Key) -> Vec<DynSendableRequest> {
        let mut out = Vec::new();
        for listener in self.snapshot_wanting(key) {
            out.extend(listener.requests_for_key(key));
        }
        out
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
    /// carries, folded with `seed`. `None` when nothing wants the key
    /// and no seed was given.
    pub fn get_key_prio(&self, key: &Key, seed: Option<u8>) -> Option<u8> {
        self.requests_for_key(key)
            .into_iter()
            .map(|request| request.priority_class())
            .chain(seed)
            .min()
    }

    /// Pick the most urgent (key, request) whose ordering key ties or
    /// beats `bound`, skipping keys for which `skip` returns true. Dead
    /// requests found along the way are dropped from their bucket.
    pub fn choose_candidate(
        &self,
        bound: Option<(u8, u32)>,
        mut skip: impl FnMut(&Key, &DynSendableRequest) -> bool,
    ) -> Option<(Key, DynSendableRequest)> {
        let mut lock = self.state.lock().unwrap();
        for class in 0..lock.buckets.len() {
            if let Some((bound_class, _)) = bound {
                if class as u8 > bound_class {
                    return None;
                }
            }

            lock.buckets[class]
                .retain(|r| !r.is_cancelled() && !r.is_empty());

            let mut order: Vec<usize> =
                (0..lock.buckets[class].len()).collect();
            order.sort_by_key(|idx| {
                lock.buckets[class][*idx].retry_count()
            });

            for idx in order {
                let request = lock.buckets[class][idx].clone();
                if let Some(bound) = bound {
                    if (class as u8, request.retry_count()) > bound {
                        continue;
                    }
                }
                if let Some(key) = request
                    .list_keys()
                    .into_iter()
                    .find(|key| !skip(key, &request))
                {
                    return Some((key, request));
                }
            }
        }
        None
    }

    /// Re-bucket all of a requester's requests by their current
    /// priority class.
    pub fn reregister_all(&self, requester: &RequesterId) {
        let mut lock = self.state.lock().unwrap();
        let mut moved = Vec::new();
        for bucket in lock.buckets.iter_mut() {
            let mut keep = Vec::new();
            for request in bucket.drain(..) {
                if request.requester() == *requester {
                    moved.push(request);
                } else {
                    keep.push(request);
                }
            }
            *bucket = keep;
        }
        for request in moved {
            if request.is_cancelled() {
                continue;
            }
            let class = clamp(request.priority_class());
            lock.buckets[class].push(request);
        }
    }

    pub fn count_queued(&self) -> u64 {
        self.state
            .lock()
            .unwrap()
            .buckets
            .iter()
            .map(|bucket| bucket.len() as u64)
            .sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ferret_test_utils::*;

    #[test]
    fn choose_orders_by_class_then_retries() {
        let index = TransientIndex::new();
        let slow: DynSendableRequest = TestRequest::fetch(&[random_key()])
            .priority_class(priority_class::UPDATE)
            .build();
        let urgent: DynSendableRequest =
            TestRequest::fetch(&[random_key()])
                .priority_class(priority_class::INTERACTIVE)
                .retry_count(7)
                .build();
        index.register_requests(vec![slow, urgent.clone()]);

        let (_, chosen) =
            index.choose_candidate(None, |_, _| false).unwrap();
        assert!(Arc::ptr_eq(&chosen, &urgent));
    }

    #[test]
    fn choose_respects_the_bound() {
        let index = TransientIndex::new();
        let request = TestRequest::fetch(&[random_key()])
            .priority_class(priority_class::UPDATE)
            .retry_count(2)
            .build();
        index.register_requests(vec![request]);

        // Same class, fewer retries at the bound: candidate loses.
        assert!(index
            .choose_candidate(
                Some((priority_class::UPDATE, 1)),
                |_, _| false
            )
            .is_none());

        // Ties are allowed.
        assert!(index
            .choose_candidate(
                Some((priority_class::UPDATE, 2)),
                |_, _| false
            )
            .is_some());
    }

    #[test]
    fn choose_skips_ineligible_keys() {
        let index = TransientIndex::new();
        let busy = random_key();
        let free = random_key();
        let request =
            TestRequest::fetch(&[busy.clone(), free.clone()]).build();
        index.register_requests(vec![request]);

        let (key, _) = index
            .choose_candidate(None, |key, _| *key == busy)
            .unwrap();
        assert_eq!(free, key);

        assert!(index
            .choose_candidate(None, |_, _| true)
            .is_none());
    }

    #[test]
    fn choose_drops_cancelled_requests() {
        let index = TransientIndex::new();
        let request = TestRequest::fetch(&[random_key()]).build();
        index.register_requests(vec![request.clone()]);

        request.cancel();

        assert!(index.choose_candidate(None, |_, _| false).is_none());
        assert_eq!(0, index.count_queued());
    }

    #[test]
    fn reregister_moves_to_the_current_class() {
        let index = TransientIndex::new();
        let request = TestRequest::fetch(&[random_key()])
            .priority_class(priority_class::BULK)
            .build();
        index.register_requests(vec![request.clone()]);

        request.set_priority_class(priority_class::INTERACTIVE);
        index.reregister_all(&request.requester());

        let (_, chosen) = index
            .choose_candidate(
                Some((priority_class::INTERACTIVE, 0)),
                |_, _| false,
            )
            .unwrap();
        let request: DynSendableRequest = request;
        assert!(Arc::ptr_eq(&chosen, &request));
    }

    #[test]
    fn key_prio_folds_listeners_and_seed() {
        let index = TransientIndex::new();
        let key = random_key();
        assert_eq!(None, index.get_key_prio(&key, None));
        assert_eq!(Some(3), index.get_key_prio(&key, Some(3)));

        let request = TestRequest::fetch(&[key.clone()])
            .priority_class(priority_class::INTERACTIVE)
            .build();
        let listener = TestListener::for_requests(vec![request]);
        index.add_listener(listener);

        assert_eq!(
            Some(priority_class::INTERACTIVE),
            index.get_key_prio(&key, Some(priority_class::BULK)),
        );
    }

    #[test]
    fn trip_notifies_wanting_listeners_only() {
        let index = TransientIndex::new();
        let key = random_key();
        let other = random_key();

        let wanting = TestListener::for_requests(vec![
            TestRequest::fetch(&[key.clone()]).build(),
        ]);
        let ignoring = TestListener::for_requests(vec![
            TestRequest::fetch(&[other]).build(),
        ]);
        index.add_listener(wanting.clone());
        index.add_listener(ignoring.clone());

        index
            .trip_pending_key(&key, &bytes::Bytes::from_static(b"data"));

        assert_eq!(vec![key], wanting.found_keys());
        assert!(ignoring.found_keys().is_empty());
    }

    #[test]
    fn remove_listener_reports_presence() {
        let index = TransientIndex::new();
        let listener = TestListener::for_requests(vec![]);
        index.add_listener(listener.clone());

        let dyn_listener: DynKeyListener = listener;
        assert!(index.remove_listener(&dyn_listener));
        assert!(!index.remove_listener(&dyn_listener));
    }
}
