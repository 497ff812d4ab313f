//! Pending-key listener types.

use crate::{DynSendableRequest, FtResult, Key, RequesterId};
use std::sync::Arc;

/// A subscription to keys a client is waiting on.
///
/// Listeners are registered alongside requests and notified when a
/// matching block arrives from any direction, not just the request's own
/// attempts.
pub trait KeyListener: 'static + Send + Sync + std::fmt::Debug {
    /// Cheap existence check: could this listener plausibly want the
    /// key? False negatives are not allowed; false positives only cost a
    /// wasted lookup.
    fn probably_want_key(&self, key: &Key) -> bool;

    /// All requests of this listener currently waiting on the key.
    fn requests_for_key(&self, key: &Key) -> Vec<DynSendableRequest>;

    /// A block for the key arrived.
    fn handle_found(&self, key: &Key, data: &bytes::Bytes);

    /// The owning client.
    fn requester(&self) -> RequesterId;
}

/// Trait object [KeyListener].
pub type DynKeyListener = Arc<dyn KeyListener>;

/// A registration source that may carry a key listener.
pub trait HasKeyListener: 'static + Send + Sync + std::fmt::Debug {
    /// Construct the key listener for this registration, if it has one.
    ///
    /// An `Err` aborts the whole registration before any state is
    /// touched.
    fn make_key_listener(&self) -> FtResult<Option<DynKeyListener>>;
}

/// Trait object [HasKeyListener].
pub type DynHasKeyListener = Arc<dyn HasKeyListener>;
