//! Registry of connected libraries.
//!
//! A library stays registered for as long as it keeps heartbeating; the
//! framer sweeps this registry once per tick and reclaims the connections
//! of anything that has gone quiet for longer than the reply timeout.

use std::collections::{BTreeSet, HashMap};

/// One connected library process.
#[derive(Debug)]
pub struct LibraryInfo {
    pub library_id: i32,
    pub aeron_session_id: i32,
    pub connect_correlation_id: i64,
    pub last_heartbeat_ms: u64,
    owned: BTreeSet<u64>,
}

impl LibraryInfo {
    pub fn new(
        library_id: i32,
        aeron_session_id: i32,
        connect_correlation_id: i64,
        now_ms: u64,
    ) -> Self {
        Self {
            library_id,
            aeron_session_id,
            connect_correlation_id,
            last_heartbeat_ms: now_ms,
            owned: BTreeSet::new(),
        }
    }

    pub fn on_heartbeat(&mut self, now_ms: u64) {
        self.last_heartbeat_ms = now_ms;
    }

    pub fn add_connection(&mut self, connection_id: u64) {
        self.owned.insert(connection_id);
    }

    pub fn remove_connection(&mut self, connection_id: u64) -> bool {
        self.owned.remove(&connection_id)
    }

    pub fn owns(&self, connection_id: u64) -> bool {
        self.owned.contains(&connection_id)
    }

    pub fn owned_connections(&self) -> impl Iterator<Item = u64> + '_ {
        self.owned.iter().copied()
    }
}

#[derive(Debug, Default)]
pub struct Libraries {
    libraries: HashMap<i32, LibraryInfo>,
}

impl Libraries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, library: LibraryInfo) {
        self.libraries.insert(library.library_id, library);
    }

    pub fn remove(&mut self, library_id: i32) -> Option<LibraryInfo> {
        self.libraries.remove(&library_id)
    }

    pub fn get(&self, library_id: i32) -> Option<&LibraryInfo> {
        self.libraries.get(&library_id)
    }

    pub fn get_mut(&mut self, library_id: i32) -> Option<&mut LibraryInfo> {
        self.libraries.get_mut(&library_id)
    }

    pub fn contains(&self, library_id: i32) -> bool {
        self.libraries.contains_key(&library_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LibraryInfo> {
        self.libraries.values()
    }

    /// Libraries silent for longer than `timeout_ms`, oldest first.
    pub fn expired(&self, now_ms: u64, timeout_ms: u64) -> Vec<i32> {
        let mut expired: Vec<(u64, i32)> = self
            .libraries
            .values()
            .filter(|library| now_ms.saturating_sub(library.last_heartbeat_ms) > timeout_ms)
            .map(|library| (library.last_heartbeat_ms, library.library_id))
            .collect();
        expired.sort();
        expired.into_iter().map(|(_, id)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.libraries.is_empty()
    }
}
