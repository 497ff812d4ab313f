//! An in-memory record store for testing and ephemeral nodes. Contents
//! do not survive the process, so requests registered through it are
//! durable in name only.

use ferret_api::*;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// An in-memory implementation of the [RecordStore] API.
#[derive(Debug)]
pub struct MemRecordStore {
    state: Mutex<BTreeMap<RecordId, bytes::Bytes>>,
}

impl MemRecordStore {
    /// Construct a new MemRecordStore.
    pub fn create() -> DynRecordStore {
        std::sync::Arc::new(Self {
            state: Mutex::new(BTreeMap::new()),
        })
    }
}

impl RecordStore for MemRecordStore {
    fn put(&self, record_id: RecordId, data: bytes::Bytes) -> FtResult<()> {
        self.state.lock().unwrap().insert(record_id, data);
        Ok(())
    }

    fn get(&self, record_id: &RecordId) -> FtResult<Option<bytes::Bytes>> {
        Ok(self.state.lock().unwrap().get(record_id).cloned())
    }

    fn delete(&self, record_id: &RecordId) -> FtResult<()> {
        self.state.lock().unwrap().remove(record_id);
        Ok(())
    }

    fn list(&self) -> FtResult<Vec<(RecordId, bytes::Bytes)>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .iter()
            .map(|(record_id, data)| (record_id.clone(), data.clone()))
            .collect())
    }
}
