//! Test utilities associated with ids.

use bytes::Bytes;
use ferret_api::{id::Id, Key, RecordId, RequesterId};

use crate::random_bytes;

/// Create a random id.
pub fn random_id() -> Id {
    Id(Bytes::from(random_bytes(32)))
}

/// Create a random key.
pub fn random_key() -> Key {
    Key(random_id())
}

/// Create a random record id.
pub fn random_record_id() -> RecordId {
    RecordId(random_id())
}

/// Create a random requester id.
pub fn random_requester_id() -> RequesterId {
    RequesterId(random_id())
}
