//! Durable record store types.

use crate::{FtResult, RecordId};
use std::sync::Arc;

/// The API a ferret host must implement to provide durable storage for
/// request records.
///
/// The interface is synchronous: the scheduler only touches the store
/// from its single serialized persistence context, so implementations
/// need no internal concurrency control beyond being [Send] + [Sync].
/// A committed [put](RecordStore::put) must survive a restart.
pub trait RecordStore: 'static + Send + Sync + std::fmt::Debug {
    /// Write a record, overwriting any prior value at the same id.
    fn put(&self, record_id: RecordId, data: bytes::Bytes) -> FtResult<()>;

    /// Read a record, `None` if absent.
    fn get(&self, record_id: &RecordId) -> FtResult<Option<bytes::Bytes>>;

    /// Delete a record. Deleting an absent record is not an error.
    fn delete(&self, record_id: &RecordId) -> FtResult<()>;

    /// List all records in the store.
    fn list(&self) -> FtResult<Vec<(RecordId, bytes::Bytes)>>;
}

/// Trait object [RecordStore].
pub type DynRecordStore = Arc<dyn RecordStore>;
