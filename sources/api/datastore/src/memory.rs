//! In-memory config store implementation for testing

use super::{ConfigRecord, ConfigStore, Result};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    records: BTreeMap<String, Vec<u8>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Default::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_config(&self, name: &str) -> Result<Option<ConfigRecord>> {
        Ok(self
            .records
            .get(name)
            .map(|payload| ConfigRecord::new(name, payload.clone())))
    }

    fn upsert_config(&mut self, record: &ConfigRecord) -> Result<()> {
        self.records
            .insert(record.name.clone(), record.payload.clone());
        Ok(())
    }

    fn list_config_names(&self) -> Result<Vec<String>> {
        Ok(self.records.keys().cloned().collect())
    }
}
