//! ECU registry
//!
//! The registry is the only state shared between execution units. It is
//! owned by the gateway controller and handed to other components behind
//! an `Arc`; every access goes through one internal lock and readers only
//! ever receive copies of records.

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::ecu::{EcuId, EcuRecord, EcuStatus};
use crate::error::GatewayError;
use crate::storage::{Storage, StorageError};

/// Outcome of loading the registry from storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Records restored from storage
    pub loaded: usize,
    /// ECUs without a persisted record (configured defaults kept)
    pub missing: usize,
    /// Records that failed validation (marked Corrupted)
    pub corrupted: usize,
}

/// In-memory table of ECU records indexed by ECU id
#[derive(Debug)]
pub struct EcuRegistry {
    records: RwLock<Vec<EcuRecord>>,
}

impl EcuRegistry {
    pub fn new(records: Vec<EcuRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn contains(&self, ecu: EcuId) -> bool {
        ecu.index() < self.len()
    }

    /// All ECU ids in ascending order
    pub fn ids(&self) -> Vec<EcuId> {
        (0..self.len()).map(|i| EcuId(i as u8)).collect()
    }

    /// Copy of one record
    pub fn get(&self, ecu: EcuId) -> Result<EcuRecord, GatewayError> {
        self.records
            .read()
            .get(ecu.index())
            .copied()
            .ok_or(GatewayError::InvalidEcu(ecu.0))
    }

    /// Copy of the whole table
    pub fn snapshot(&self) -> Vec<EcuRecord> {
        self.records.read().clone()
    }

    pub fn status(&self, ecu: EcuId) -> Result<EcuStatus, GatewayError> {
        self.get(ecu).map(|r| r.status)
    }

    /// Mutate one record in place, returning the updated copy
    pub fn update<F>(&self, ecu: EcuId, f: F) -> Result<EcuRecord, GatewayError>
    where
        F: FnOnce(&mut EcuRecord),
    {
        let mut records = self.records.write();
        let record = records
            .get_mut(ecu.index())
            .ok_or(GatewayError::InvalidEcu(ecu.0))?;
        f(record);
        Ok(*record)
    }

    /// Set the status, returning the previous one
    pub fn set_status(&self, ecu: EcuId, status: EcuStatus) -> Result<EcuStatus, GatewayError> {
        let mut previous = status;
        self.update(ecu, |r| {
            previous = r.status;
            r.status = status;
        })?;
        if previous != status {
            debug!(%ecu, ?previous, ?status, "ECU status changed");
        }
        Ok(previous)
    }

    /// Replace a whole record
    pub fn replace(&self, ecu: EcuId, record: EcuRecord) -> Result<(), GatewayError> {
        self.update(ecu, |r| *r = record).map(|_| ())
    }

    /// Restore records from storage
    ///
    /// A record that fails validation is not trusted: the configured record
    /// is kept but its status is forced to `Corrupted`.
    pub async fn load_from(&self, storage: &dyn Storage) -> Result<LoadSummary, StorageError> {
        let mut summary = LoadSummary::default();
        for ecu in self.ids() {
            match storage.read_record(ecu).await? {
                None => summary.missing += 1,
                Some(bytes) => match EcuRecord::decode(&bytes) {
                    Ok(record) => {
                        // Index bounds were checked by ids()
                        let _ = self.replace(ecu, record);
                        summary.loaded += 1;
                    }
                    Err(e) => {
                        warn!(%ecu, error = %e, "Persisted ECU record invalid, marking corrupted");
                        let _ = self.set_status(ecu, EcuStatus::Corrupted);
                        summary.corrupted += 1;
                    }
                },
            }
        }
        Ok(summary)
    }

    /// Persist every record, returning the number written
    pub async fn store_to(&self, storage: &dyn Storage) -> Result<usize, StorageError> {
        let records = self.snapshot();
        for (i, record) in records.iter().enumerate() {
            storage.write_record(EcuId(i as u8), &record.encode()).await?;
        }
        Ok(records.len())
    }

    /// Persist a single record
    pub async fn store_one(&self, storage: &dyn Storage, ecu: EcuId) -> Result<(), StorageError> {
        let record = self
            .get(ecu)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        storage.write_record(ecu, &record.encode()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecu::{Endianness, Protocol};
    use crate::storage::MemoryStorage;

    fn registry() -> EcuRegistry {
        EcuRegistry::new(vec![
            EcuRecord::new(Protocol::Can, 0),
            EcuRecord::new(Protocol::Lin, 1),
        ])
    }

    #[test]
    fn test_out_of_range_access_is_rejected() {
        let reg = registry();
        assert_eq!(reg.get(EcuId(2)), Err(GatewayError::InvalidEcu(2)));
        assert!(reg.set_status(EcuId(5), EcuStatus::Fault).is_err());
        assert!(!reg.contains(EcuId(2)));
    }

    #[test]
    fn test_set_status_returns_previous() {
        let reg = registry();
        let prev = reg.set_status(EcuId(1), EcuStatus::Updating).unwrap();
        assert_eq!(prev, EcuStatus::Normal);
        assert_eq!(reg.status(EcuId(1)).unwrap(), EcuStatus::Updating);
    }

    #[tokio::test]
    async fn test_store_then_load_round_trip() {
        let storage = MemoryStorage::new();
        let reg = registry();
        reg.update(EcuId(0), |r| {
            r.status = EcuStatus::Sleeping;
            r.firmware_version = 42;
            r.endianness = Endianness::Little;
        })
        .unwrap();
        assert_eq!(reg.store_to(&storage).await.unwrap(), 2);

        let restored = registry();
        let summary = restored.load_from(&storage).await.unwrap();
        assert_eq!(summary.loaded, 2);
        assert_eq!(restored.get(EcuId(0)).unwrap(), reg.get(EcuId(0)).unwrap());
    }

    #[tokio::test]
    async fn test_invalid_record_marks_corrupted() {
        let storage = MemoryStorage::new();
        storage.put_record(EcuId(1), vec![0xFF; 16]);

        let reg = registry();
        let summary = reg.load_from(&storage).await.unwrap();
        assert_eq!(summary.missing, 1);
        assert_eq!(summary.corrupted, 1);
        assert_eq!(reg.status(EcuId(1)).unwrap(), EcuStatus::Corrupted);
        assert_eq!(reg.get(EcuId(1)).unwrap().protocol, Protocol::Lin);
    }
}
