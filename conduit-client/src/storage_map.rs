//! Datacenter → storage host lookup table.
//!
//! The table is configuration data, not code: operators load it at startup
//! (typically from a JSON object of identifier → URL) and can ship an updated
//! table without a rebuild. Identifiers absent from the table surface as
//! [`crate::DownloadError::UnknownDatacenter`].

use std::collections::HashMap;

use serde::Deserialize;

/// Storage host table keyed by datacenter identifier.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct StorageMap {
    hosts: HashMap<String, String>,
}

impl StorageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a table from a JSON object of `identifier → host URL`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn insert(&mut self, dc_id: impl Into<String>, host: impl Into<String>) {
        self.hosts.insert(dc_id.into(), host.into());
    }

    /// The storage host serving files for the given datacenter, if known.
    pub fn host(&self, dc_id: &str) -> Option<&str> {
        self.hosts.get(dc_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl FromIterator<(String, String)> for StorageMap {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self { hosts: iter.into_iter().collect() }
    }
}
