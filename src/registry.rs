use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::types::{AnnouncementKey, AnnouncementRecord};

/// Instances this client has announced and not yet deannounced.
#[derive(Debug, Default)]
pub struct AnnouncementRegistry {
    records: Mutex<HashMap<AnnouncementKey, AnnouncementRecord>>,
}

impl AnnouncementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AnnouncementKey, AnnouncementRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a record, replacing any record with the same key.
    pub fn upsert(&self, record: AnnouncementRecord) -> Option<AnnouncementRecord> {
        let previous = self.lock().insert(record.key.clone(), record);
        if let Some(previous) = &previous {
            debug!("Replaced announcement {}", previous.key);
        }
        previous
    }

    pub fn remove(&self, key: &AnnouncementKey) -> Option<AnnouncementRecord> {
        self.lock().remove(key)
    }

    /// Finds the record announced with exactly this requested host.
    pub fn find_requested(
        &self,
        service: &str,
        version: &str,
        requested_host: &str,
        port: u16,
    ) -> Option<AnnouncementRecord> {
        self.lock()
            .values()
            .find(|r| {
                r.key.service == service
                    && r.key.version == version
                    && r.key.port == port
                    && r.requested_host == requested_host
            })
            .cloned()
    }

    /// Copy of every record, ordered by key.
    pub fn snapshot(&self) -> Vec<AnnouncementRecord> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
