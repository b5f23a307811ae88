//! Session identity store: composite key to session id, deduplicating live
//! logons.
//!
//! A composite key maps to the same session id across reconnects; a logon
//! for a key that is already live yields `DUPLICATE_SESSION`. Durable
//! persistence of the mapping lives elsewhere; this is the contract the
//! framer programs against.

use std::collections::{HashMap, HashSet};

use crate::session::CompositeKey;

/// A second live logon for an already-active composite key.
pub const DUPLICATE_SESSION: i64 = -1;

/// Reserved initial value; never assigned to a session.
pub const MISSING: i64 = -2;

pub trait SessionIdStore: Send {
    /// Resolve a logon to a session id, or `DUPLICATE_SESSION` when the key
    /// is already live.
    fn on_logon(&mut self, key: &CompositeKey) -> i64;

    /// The session is gone; its key may log on again.
    fn on_disconnect(&mut self, session_id: i64);
}

/// In-memory store with monotonic id assignment.
#[derive(Debug, Default)]
pub struct MapSessionIds {
    ids: HashMap<CompositeKey, i64>,
    live: HashSet<i64>,
    counter: i64,
}

impl MapSessionIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionIdStore for MapSessionIds {
    fn on_logon(&mut self, key: &CompositeKey) -> i64 {
        let counter = &mut self.counter;
        let id = *self.ids.entry(key.clone()).or_insert_with(|| {
            *counter += 1;
            *counter
        });
        if !self.live.insert(id) {
            return DUPLICATE_SESSION;
        }
        id
    }

    fn on_disconnect(&mut self, session_id: i64) {
        self.live.remove(&session_id);
    }
}
