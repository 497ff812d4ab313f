//! Fixed-period cooldown tracking for (key, request) pairs.

use ferret_api::*;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// Tracks (key, request) pairs that recently failed and must not be
/// re-attempted until a fixed period elapses.
///
/// Expiry order matches insertion order because every entry gets the
/// same period. Re-adding a pair refreshes its expiry; the stale front
/// entry is discarded lazily when the sweep reaches it.
#[derive(Debug)]
pub(crate) struct CooldownQueue {
    period: std::time::Duration,
    order: VecDeque<(Key, Instant)>,
    entries: HashMap<Key, Vec<(DynSendableRequest, Instant)>>,
}

impl CooldownQueue {
    pub fn new(period: std::time::Duration) -> Self {
        Self {
            period,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    /// Put a pair on cooldown, returning the expiry instant. If the
    /// pair is already cooling its expiry is pushed out to now + period.
    pub fn add(
        &mut self,
        key: Key,
        request: DynSendableRequest,
    ) -> Instant {
        let expires_at = Instant::now() + self.period;
        let list = self.entries.entry(key.clone()).or_default();
        match list.iter_mut().find(|(r, _)| {
            std::sync::Arc::ptr_eq(r, &request)
        }) {
            Some((_, at)) => *at = expires_at,
            None => list.push((request, expires_at)),
        }
        self.order.push_back((key, expires_at));
        expires_at
    }

    /// True if this exact (key, request) pair is still cooling.
    pub fn is_cooling(
        &self,
        key: &Key,
        request: &DynSendableRequest,
    ) -> bool {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(list) => list.iter().any(|(r, at)| {
                *at > now && std::sync::Arc::ptr_eq(r, request)
            }),
            None => false,
        }
    }

    /// Remove up to `max_keys` expired keys, returning each key with
    /// the requests whose cooldown on it just ended.
    pub fn pop_expired(
        &mut self,
        max_keys: usize,
    ) -> Vec<(Key, Vec<DynSendableRequest>)> {
        let now = Instant::now();
        let mut out = Vec::new();

        while out.len() < max_keys {
            match self.order.front() {
                Some((_, at)) if *at <= now => (),
                _ => break,
            }
            let (key, _) = self.order.pop_front().unwrap();

            let Some(list) = self.entries.get_mut(&key) else {
                // Stale order entry, already swept.
                continue;
            };

            let mut done = Vec::new();
            list.retain(|(request, entry_at)| {
                if *entry_at <= now {
                    done.push(request.clone());
                    false
                } else {
                    true
                }
            });
            if list.is_empty() {
                self.entries.remove(&key);
            }

            if !done.is_empty() {
                out.push((key, done));
            }
        }

        out
    }

    /// Diagnostic count of pairs currently cooling.
    #[cfg(test)]
    pub fn pair_count(&self) -> usize {
        self.entries.values().map(|l| l.len()).sum()
    }
}
