//! In-memory starter queue over the durable index.

use ferret_api::*;
use std::collections::{HashSet, VecDeque};

/// A durable request admitted to the starter queue, with its keys and
/// ordering data frozen at admission time. Lost and rebuilt from the
/// durable index on restart.
#[derive(Debug)]
pub(crate) struct StarterGroup {
    pub record_id: RecordId,
    pub request: DynSendableRequest,
    pub priority_class: u8,
    pub retry_count: u32,
    pub keys: VecDeque<Key>,
}

impl StarterGroup {
    pub fn new(
        record_id: RecordId,
        request: DynSendableRequest,
    ) -> Self {
        let priority_class = request.priority_class();
        let retry_count = request.retry_count();
        let keys = request.list_keys().into_iter().collect();
        Self {
            record_id,
            request,
            priority_class,
            retry_count,
            keys,
        }
    }

    /// Dispatch ordering key, lower is more urgent.
    pub fn ordering_key(&self) -> (u8, u32) {
        (self.priority_class, self.retry_count)
    }
}

/// The scheduler's hot dispatch state: the starter queue itself plus
/// the running and in-flight sets. All three live under one lock so a
/// dispatch decision sees a consistent snapshot.
#[derive(Debug)]
pub(crate) struct StarterState {
    /// Admitted groups with not-yet-started keys, unordered.
    pub groups: Vec<StarterGroup>,

    /// Record ids with a dispatched block not yet resolved. Excluded
    /// from refill so a claimed request is not admitted twice.
    pub running: HashSet<RecordId>,

    /// Keys currently being fetched by the sending layer.
    pub fetching: HashSet<Key>,
}

impl StarterState {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            running: HashSet::new(),
            fetching: HashSet::new(),
        }
    }

    /// Total not-started keys across all queued groups. This is the
    /// number the queue capacity bounds.
    pub fn not_started_total(&self) -> usize {
        self.groups.iter().map(|group| group.keys.len()).sum()
    }

    /// True if the record is already queued or has a block in flight.
    pub fn is_claimed(&self, record_id: &RecordId) -> bool {
        self.running.contains(record_id)
            || self
                .groups
                .iter()
                .any(|group| group.record_id == *record_id)
    }

    /// Record ids refill must pass over: everything queued or running.
    pub fn claimed_records(&self) -> HashSet<RecordId> {
        let mut out = self.running.clone();
        out.extend(
            self.groups.iter().map(|group| group.record_id.clone()),
        );
        out
    }

    /// Index of the most urgent waiting group.
    pub fn best_idx(&self) -> Option<usize> {
        self.groups
            .iter()
            .enumerate()
            .min_by_key(|(_, group)| group.ordering_key())
            .map(|(idx, _)| idx)
    }

    /// Ordering key of the least urgent waiting group.
    pub fn worst_key(&self) -> Option<(u8, u32)> {
        self.groups
            .iter()
            .map(|group| group.ordering_key())
            .max()
    }

    /// Evict whole groups worst-first until the not-started total is at
    /// or under `capacity`. Never evicts when already at-or-under.
    /// Evicted records also leave the running set so the durable index
    /// can offer them again. Returns the evicted groups.
    pub fn trim(&mut self, capacity: usize) -> Vec<StarterGroup> {
        let mut evicted = Vec::new();
        while self.not_started_total() > capacity {
            let worst = self
                .groups
                .iter()
                .enumerate()
                .max_by_key(|(_, group)| group.ordering_key())
                .map(|(idx, _)| idx);
            match worst {
                Some(idx) => {
                    let group = self.groups.swap_remove(idx);
                    self.running.remove(&group.record_id);
                    evicted.push(group);
                }
                None => break,
            }
        }
        evicted
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ferret_test_utils::*;

    fn group(
        priority_class: u8,
        retry_count: u32,
        num_keys: usize,
    ) -> StarterGroup {
        let keys: Vec<Key> = (0..num_keys).map(|_| random_key()).collect();
        let request = TestRequest::fetch(&keys)
            .priority_class(priority_class)
            .retry_count(retry_count)
            .build();
        StarterGroup::new(random_record_id(), request)
    }

    #[test]
    fn best_orders_by_class_then_retries() {
        let mut state = StarterState::new();
        state.groups.push(group(1, 0, 1));
        state.groups.push(group(0, 5, 1));
        state.groups.push(group(0, 9, 1));

        // Class 0 with 5 retries beats class 1 with none.
        let best = state.best_idx().unwrap();
        assert_eq!((0, 5), state.groups[best].ordering_key());
    }

    #[test]
    fn trim_evicts_worst_first() {
        // At capacity 70 with A(prio 2, 50 keys) and B(prio 5, 10
        // keys), admitting C(prio 1, 20 keys) must cost B its slot and
        // stop there.
        let mut state = StarterState::new();
        state.groups.push(group(2, 0, 50));
        state.groups.push(group(5, 0, 10));
        state.groups.push(group(1, 0, 20));

        let evicted = state.trim(70);

        assert_eq!(1, evicted.len());
        assert_eq!((5, 0), evicted[0].ordering_key());
        assert_eq!(70, state.not_started_total());
    }

    #[test]
    fn trim_continues_until_at_or_under_capacity() {
        let mut state = StarterState::new();
        state.groups.push(group(2, 0, 50));
        state.groups.push(group(5, 0, 10));
        state.groups.push(group(1, 0, 20));

        let evicted = state.trim(60);

        // Evicting B alone leaves 70, so A goes too.
        assert_eq!(2, evicted.len());
        assert_eq!((5, 0), evicted[0].ordering_key());
        assert_eq!((2, 0), evicted[1].ordering_key());
        assert_eq!(20, state.not_started_total());
    }

    #[test]
    fn trim_never_evicts_at_or_under_capacity() {
        let mut state = StarterState::new();
        state.groups.push(group(2, 0, 5));

        assert!(state.trim(5).is_empty());
        assert_eq!(5, state.not_started_total());
    }

    #[test]
    fn trim_releases_the_running_claim() {
        let mut state = StarterState::new();
        let evictee = group(6, 0, 4);
        let record_id = evictee.record_id.clone();
        state.groups.push(evictee);
        state.running.insert(record_id.clone());

        let evicted = state.trim(0);

        assert_eq!(1, evicted.len());
        assert!(!state.is_claimed(&record_id));
    }
}
