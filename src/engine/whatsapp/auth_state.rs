// WhatsApp Connection Manager — Directory-Backed Auth State
// Credentials (creds.json) plus a key store (<category>-<id>.json) inside one
// Working Area. The transport reads and writes keys directly; credential
// updates arrive as notifications and are merged here, then flushed.

use crate::atoms::constants::{CREDS_FILE, TEMP_FILE_PREFIX};
use crate::atoms::error::EngineResult;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct AuthState {
    dir: PathBuf,
    creds: Mutex<Value>,
}

impl AuthState {
    /// Load credentials from `dir`, or start with an empty set if the
    /// directory holds none yet (a fresh pairing).
    pub async fn load(dir: &Path) -> EngineResult<Self> {
        let creds = match tokio::fs::read(dir.join(CREDS_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(AuthState { dir: dir.to_path_buf(), creds: Mutex::new(creds) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn credentials(&self) -> Value {
        self.creds.lock().clone()
    }

    /// True once the transport has written anything into the credentials.
    pub fn has_credentials(&self) -> bool {
        self.creds.lock().as_object().is_some_and(|m| !m.is_empty())
    }

    /// Merge a partial credential update (top-level keys replace) and flush.
    pub async fn update_credentials(&self, update: Value) -> EngineResult<()> {
        {
            let mut creds = self.creds.lock();
            match update {
                Value::Object(patch) if creds.is_object() => {
                    if let Some(current) = creds.as_object_mut() {
                        current.extend(patch);
                    }
                }
                other => *creds = other,
            }
        }
        self.persist().await
    }

    /// Write the current credentials to creds.json.
    pub async fn persist(&self) -> EngineResult<()> {
        let bytes = serde_json::to_vec(&*self.creds.lock())?;
        write_atomic(&self.dir, CREDS_FILE, &bytes).await
    }

    // ── Key store ──────────────────────────────────────────────────────

    pub async fn get_keys(&self, category: &str, ids: &[&str]) -> EngineResult<HashMap<String, Value>> {
        let mut found = HashMap::new();
        for id in ids {
            match tokio::fs::read(self.dir.join(key_file_name(category, id))).await {
                Ok(bytes) => {
                    found.insert(id.to_string(), serde_json::from_slice(&bytes)?);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(found)
    }

    /// Store a key, or delete it when `value` is `None`.
    pub async fn set_key(&self, category: &str, id: &str, value: Option<&Value>) -> EngineResult<()> {
        let name = key_file_name(category, id);
        match value {
            Some(v) => write_atomic(&self.dir, &name, &serde_json::to_vec(v)?).await,
            None => match tokio::fs::remove_file(self.dir.join(&name)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}

/// `/` and `:` show up in signal-protocol key ids and are not safe in file names.
pub(crate) fn key_file_name(category: &str, id: &str) -> String {
    format!("{}-{}.json", category, id).replace('/', "__").replace(':', "-")
}

/// Temp file + rename so a reader never sees a half-written file.
async fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> EngineResult<()> {
    let tmp = dir.join(format!("{}{}-{}", TEMP_FILE_PREFIX, name, uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, dir.join(name)).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
