//! Priority buckets of keys peers have offered us.

use ferret_api::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// One priority class worth of offered keys, dispatchable as a single
/// synthetic transient fetch request.
///
/// Offered keys have no owning client and no failure policy of their
/// own. A failed attempt is logged and dropped; the peer can offer the
/// key again.
#[derive(Debug)]
pub(crate) struct OfferedKeysList {
    priority_class: u8,
    keys: Mutex<HashSet<Key>>,
}

impl OfferedKeysList {
    fn new(priority_class: u8) -> Arc<Self> {
        Arc::new(Self {
            priority_class,
            keys: Mutex::new(HashSet::new()),
        })
    }
}

impl SendableRequest for OfferedKeysList {
    fn kind(&self) -> RequestKind {
        RequestKind::Fetch
    }

    fn persistent(&self) -> bool {
        false
    }

    fn priority_class(&self) -> u8 {
        self.priority_class
    }

    fn retry_count(&self) -> u32 {
        0
    }

    fn is_cancelled(&self) -> bool {
        false
    }

    fn is_empty(&self) -> bool {
        self.keys.lock().unwrap().is_empty()
    }

    fn requester(&self) -> RequesterId {
        RequesterId(bytes::Bytes::from_static(b"offered-keys").into())
    }

    fn list_keys(&self) -> Vec<Key> {
        self.keys.lock().unwrap().iter().cloned().collect()
    }

    fn record(&self) -> Option<RequestRecord> {
        None
    }

    fn on_failure(&self, err: SendError) {
        tracing::debug!(?err, "offered key fetch failed");
    }

    fn requeue_after_cooldown(&self, _key: &Key) {}

    fn internal_error(&self, err: FtError) {
        tracing::debug!(?err, "offered key internal error");
    }
}

/// All offered-key buckets, one per priority class.
#[derive(Debug)]
pub(crate) struct OfferedKeys {
    lists: [Arc<OfferedKeysList>; priority_class::NUM_PRIORITY_CLASSES],
}

impl OfferedKeys {
    pub fn new() -> Self {
        Self {
            lists: std::array::from_fn(|class| {
                OfferedKeysList::new(class as u8)
            }),
        }
    }

    fn clamp(priority_class: u8) -> usize {
        (priority_class as usize)
            .min(priority_class::NUM_PRIORITY_CLASSES - 1)
    }

    /// Queue a key at the given class. Returns false if the key was
    /// already queued there.
    pub fn insert(&self, priority_class: u8, key: Key) -> bool {
        self.lists[Self::clamp(priority_class)]
            .keys
            .lock()
            .unwrap()
            .insert(key)
    }

    /// Drop a key from every bucket.
    pub fn remove_everywhere(&self, key: &Key) {
        for list in self.lists.iter() {
            list.keys.lock().unwrap().remove(key);
        }
    }

    /// The most urgent class holding any key not in `excluded`.
    pub fn best_class(&self, excluded: &HashSet<Key>) -> Option<u8> {
        for list in self.lists.iter() {
            if list
                .keys
                .lock()
                .unwrap()
                .iter()
                .any(|key| !excluded.contains(key))
            {
                return Some(list.priority_class);
            }
        }
        None
    }

    /// Take one key from the given class, skipping `excluded`. The key
    /// leaves the bucket; a failed attempt does not bring it back.
    pub fn take_from(
        &self,
        priority_class: u8,
        excluded: &HashSet<Key>,
    ) -> Option<(Key, DynSendableRequest)> {
        let list = &self.lists[Self::clamp(priority_class)];
        let mut lock = list.keys.lock().unwrap();
        let key = lock
            .iter()
            .find(|key| !excluded.contains(*key))
            .cloned()?;
        lock.remove(&key);
        Some((key, list.clone()))
    }
}
