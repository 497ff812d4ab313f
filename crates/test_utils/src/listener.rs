//! Test implementations of the pending-key listener traits.

use ferret_api::*;
use std::sync::{Arc, Mutex};

/// A [KeyListener] over a fixed set of requests that records every
/// block it is handed.
#[derive(Debug)]
pub struct TestListener {
    requester: RequesterId,
    requests: Mutex<Vec<DynSendableRequest>>,
    found: Mutex<Vec<Key>>,
}

impl TestListener {
    /// Construct a listener wanting exactly the keys of the given
    /// requests. The listener adopts the first request's requester, or
    /// a fresh random one when the set is empty.
    pub fn for_requests(requests: Vec<DynSendableRequest>) -> Arc<Self> {
        let requester = requests
            .first()
            .map(|request| request.requester())
            .unwrap_or_else(crate::random_requester_id);
        Arc::new(Self {
            requester,
            requests: Mutex::new(requests),
            found: Mutex::new(Vec::new()),
        })
    }

    /// The keys handed to [KeyListener::handle_found] so far.
    pub fn found_keys(&self) -> Vec<Key> {
        self.found.lock().unwrap().clone()
    }

    /// Wrap this listener as a registration source.
    pub fn source(self: &Arc<Self>) -> DynHasKeyListener {
        Arc::new(TestListenerSource(self.clone()))
    }
}

impl KeyListener for TestListener {
    fn probably_want_key(&self, key: &Key) -> bool {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .any(|request| request.list_keys().contains(key))
    }

    fn requests_for_key(&self, key: &Key) -> Vec<DynSendableRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.list_keys().contains(key))
            .cloned()
            .collect()
    }

    fn handle_found(&self, key: &Key, _data: &bytes::Bytes) {
        self.found.lock().unwrap().push(key.clone());
    }

    fn requester(&self) -> RequesterId {
        self.requester.clone()
    }
}

#[derive(Debug)]
struct TestListenerSource(Arc<TestListener>);

impl HasKeyListener for TestListenerSource {
    fn make_key_listener(&self) -> FtResult<Option<DynKeyListener>> {
        Ok(Some(self.0.clone()))
    }
}

/// A registration source whose listener construction always fails,
/// aborting the registration it is attached to.
#[derive(Debug)]
pub struct FailingListenerSource;

impl HasKeyListener for FailingListenerSource {
    fn make_key_listener(&self) -> FtResult<Option<DynKeyListener>> {
        Err(FtError::other("test listener construction failure"))
    }
}
