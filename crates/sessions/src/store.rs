use std::{collections::BTreeMap, fs, path::PathBuf};

use {anyhow::Result, serde::de::DeserializeOwned, serde_json::Value, tracing::warn};

use crate::session::Session;

const CURRENT_SESSION: &str = "current_session";

/// JSON file-backed key/value store for small pieces of durable client state.
pub struct StateStore {
    path: PathBuf,
    entries: BTreeMap<String, Value>,
}

impl StateStore {
    /// Load the store from disk, or start empty. A corrupt file is treated
    /// as empty and overwritten on the next save.
    pub fn load(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let data = fs::read_to_string(&path)?;
            serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "state file unreadable, starting empty");
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, entries })
    }

    /// Persist to disk via a temp file and rename.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(&self.entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.entries.get(key)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "ignoring malformed state entry");
                None
            },
        }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    // ── Typed accessors ─────────────────────────────────────────────

    pub fn current_session(&self) -> Option<Session> {
        self.get(CURRENT_SESSION)
    }

    pub fn set_current_session(&mut self, session: &Session) -> Result<()> {
        self.set(CURRENT_SESSION, serde_json::to_value(session)?);
        self.save()
    }

    pub fn clear_current_session(&mut self) -> Result<()> {
        if self.remove(CURRENT_SESSION).is_some() {
            self.save()?;
        }
        Ok(())
    }
}
