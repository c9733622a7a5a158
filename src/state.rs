use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rusqlite::params;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::db::SharedConnection;
use crate::errors::AppResult;
use crate::model::AddressKey;

/// Keyed state with an in-memory read path and an optional sqlite mirror.
///
/// Every write swaps the whole value for a key under the write lock, so
/// readers see either the previous or the next value, never a mix. The sqlite
/// row is written before the in-memory swap.
pub struct KeyedStateStore<V> {
    name: &'static str,
    entries: RwLock<HashMap<AddressKey, Arc<V>>>,
    db: Option<SharedConnection>,
}

impl<V> KeyedStateStore<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn in_memory(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    /// Opens the store and restores every row persisted under `name`.
    pub fn open(name: &'static str, db: SharedConnection) -> AppResult<Self> {
        let restored = load_rows::<V>(name, &db)?;
        debug!(target: "state_store", store = name, restored = restored.len(), "state restored");
        Ok(Self {
            name,
            entries: RwLock::new(restored),
            db: Some(db),
        })
    }

    pub fn get(&self, key: &AddressKey) -> Option<Arc<V>> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Writes `value` and returns the value it replaced.
    pub fn put(&self, key: AddressKey, value: V) -> AppResult<Option<Arc<V>>> {
        let mut entries = self.entries.write();
        self.persist(&key, Some(&value))?;
        Ok(entries.insert(key, Arc::new(value)))
    }

    /// Writes `value` only when `accept` approves it against the current value.
    pub fn put_if<F>(&self, key: AddressKey, value: V, accept: F) -> AppResult<bool>
    where
        F: FnOnce(Option<&V>, &V) -> bool,
    {
        let mut entries = self.entries.write();
        if !accept(entries.get(&key).map(Arc::as_ref), &value) {
            return Ok(false);
        }
        self.persist(&key, Some(&value))?;
        entries.insert(key, Arc::new(value));
        Ok(true)
    }

    pub fn delete(&self, key: &AddressKey) -> AppResult<Option<Arc<V>>> {
        let mut entries = self.entries.write();
        self.persist(key, None)?;
        Ok(entries.remove(key))
    }

    /// Applies one changelog record; `None` is a tombstone.
    pub fn apply_changelog(&self, key: AddressKey, value: Option<V>) -> AppResult<()> {
        match value {
            Some(value) => self.put(key, value).map(|_| ()),
            None => self.delete(&key).map(|_| ()),
        }
    }

    pub fn snapshot(&self) -> Vec<(AddressKey, Arc<V>)> {
        self.entries
            .read()
            .iter()
            .map(|(key, value)| (key.clone(), Arc::clone(value)))
            .collect()
    }

    fn persist(&self, key: &AddressKey, value: Option<&V>) -> AppResult<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let conn = db.lock();
        match value {
            Some(value) => {
                let encoded = serde_json::to_string(value)?;
                conn.execute(
                    "INSERT INTO state_entries (store, key, value, updated_at)
                    VALUES (?1, ?2, ?3, DATETIME('now'))
                    ON CONFLICT(store, key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = DATETIME('now')",
                    params![self.name, key.as_str(), encoded],
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM state_entries WHERE store = ?1 AND key = ?2",
                    params![self.name, key.as_str()],
                )?;
            }
        }
        Ok(())
    }
}

fn load_rows<V: DeserializeOwned>(
    name: &str,
    db: &SharedConnection,
) -> AppResult<HashMap<AddressKey, Arc<V>>> {
    let conn = db.lock();
    let mut stmt = conn.prepare("SELECT key, value FROM state_entries WHERE store = ?1")?;
    let rows = stmt
        .query_map([name], |row| {
            let key: String = row.get(0)?;
            let value: String = row.get(1)?;
            Ok((key, value))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut restored = HashMap::with_capacity(rows.len());
    for (key, value) in rows {
        match serde_json::from_str::<V>(&value) {
            Ok(decoded) => {
                restored.insert(AddressKey::normalize(&key), Arc::new(decoded));
            }
            Err(err) => warn!(
                target: "state_store",
                store = name,
                key,
                ?err,
                "dropping undecodable state row"
            ),
        }
    }
    Ok(restored)
}
