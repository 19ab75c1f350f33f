//! The admitted-model registry.
//!
//! Name uniqueness is enforced with a two-phase reserve/fill so two peers
//! racing through admission with the same name cannot both win.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tm_link::Connection;
use tm_meta::Meta;

#[derive(Clone)]
pub struct Admitted {
    pub conn: Connection,
    pub meta: Arc<Meta>,
}

#[derive(Clone, Default)]
pub struct Registry {
    // None marks a reserved name whose admission is still completing.
    inner: Arc<Mutex<HashMap<String, Option<Admitted>>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Claim a name.  Returns `false` when it is already reserved or
    /// admitted.
    pub fn reserve(&self, name: &str) -> bool {
        let mut map = self.lock();
        if map.contains_key(name) {
            false
        } else {
            map.insert(name.to_owned(), None);
            true
        }
    }

    /// Complete a reservation.
    pub fn fill(&self, name: &str, conn: Connection, meta: Arc<Meta>) {
        self.lock().insert(name.to_owned(), Some(Admitted { conn, meta }));
    }

    /// Drop a name, reserved or admitted.
    pub fn remove(&self, name: &str) {
        self.lock().remove(name);
    }

    pub fn get_conn(&self, name: &str) -> Option<Connection> {
        self.lock()
            .get(name)
            .and_then(|slot| slot.as_ref().map(|a| a.conn.clone()))
    }

    /// Names of fully admitted models.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, slot)| slot.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn admitted(&self) -> Vec<(String, Connection)> {
        self.lock()
            .iter()
            .filter_map(|(name, slot)| slot.as_ref().map(|a| (name.clone(), a.conn.clone())))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Option<Admitted>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_blocks_duplicates() {
        let reg = Registry::new();
        assert!(reg.reserve("car/#1"));
        assert!(!reg.reserve("car/#1"));
        reg.remove("car/#1");
        assert!(reg.reserve("car/#1"));
    }

    #[test]
    fn reserved_names_are_not_listed() {
        let reg = Registry::new();
        reg.reserve("car/#1");
        assert!(reg.names().is_empty());
        assert!(reg.get_conn("car/#1").is_none());
    }
}
