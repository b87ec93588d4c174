//! Small persistent key/value cache backed by a JSON file.
//!
//! Plugins use this for short-lived tokens and device ids. Values carry an
//! optional expiry; expired entries are pruned on every write. Writes go to
//! a temp file first and are moved into place so a crash never leaves a
//! half-written cache.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use tracing::debug;

use crate::common::{PipeError, PipeResult};

pub struct Cache {
    path: PathBuf,
    prefix: String,
}

impl Cache {
    /// Cache stored under the user cache directory.
    pub fn new(filename: &str, prefix: impl Into<String>) -> Self {
        Self {
            path: cache_dir().join(filename),
            prefix: prefix.into(),
        }
    }

    /// Cache at an explicit path.
    pub fn with_path(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{key}", self.prefix)
        }
    }

    fn load(&self) -> Map<String, Value> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.load();
        let entry = entries.get(&self.full_key(key))?;
        if is_expired(entry) {
            return None;
        }
        entry.get("value").cloned()
    }

    /// Store a value, optionally expiring after `expires_in` seconds.
    pub fn set(&self, key: &str, value: Value, expires_in: Option<f64>) -> PipeResult<()> {
        let mut entries = self.load();
        entries.retain(|_, entry| !is_expired(entry));

        let mut entry = Map::new();
        entry.insert("value".into(), value);
        if let Some(secs) = expires_in {
            let expires = OffsetDateTime::now_utc().unix_timestamp() as f64 + secs;
            entry.insert("expires".into(), json!(expires));
        }
        entries.insert(self.full_key(key), Value::Object(entry));
        self.write(&entries)
    }

    pub fn remove(&self, key: &str) -> PipeResult<()> {
        let mut entries = self.load();
        entries.remove(&self.full_key(key));
        self.write(&entries)
    }

    fn write(&self, entries: &Map<String, Value>) -> PipeResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipeError::plugin(format!("Cannot create cache dir: {e}")))?;
        }
        let tmp = self.path.with_extension("tmp");
        let rendered = serde_json::to_string(entries)
            .map_err(|e| PipeError::plugin(format!("Cannot serialize cache: {e}")))?;
        std::fs::write(&tmp, rendered)
            .map_err(|e| PipeError::plugin(format!("Cannot write cache: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| PipeError::plugin(format!("Cannot move cache into place: {e}")))?;
        debug!("Wrote cache {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn is_expired(entry: &Value) -> bool {
    match entry.get("expires").and_then(Value::as_f64) {
        Some(expires) => (OffsetDateTime::now_utc().unix_timestamp() as f64) >= expires,
        None => false,
    }
}

fn cache_dir() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache")))
        .unwrap_or_else(std::env::temp_dir)
        .join("streampipe")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache(prefix: &str) -> (tempfile::TempDir, Cache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::with_path(dir.path().join("cache.json"), prefix);
        (dir, cache)
    }

    #[test]
    fn roundtrip() {
        let (_dir, cache) = temp_cache("svc");
        cache.set("token", json!("abc"), None).unwrap();
        assert_eq!(cache.get("token"), Some(json!("abc")));
        cache.remove("token").unwrap();
        assert_eq!(cache.get("token"), None);
    }

    #[test]
    fn prefixes_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let a = Cache::with_path(&path, "a");
        let b = Cache::with_path(&path, "b");
        a.set("token", json!(1), None).unwrap();
        b.set("token", json!(2), None).unwrap();
        assert_eq!(a.get("token"), Some(json!(1)));
        assert_eq!(b.get("token"), Some(json!(2)));
    }

    #[test]
    fn expired_entries_are_gone() {
        let (_dir, cache) = temp_cache("svc");
        cache.set("stale", json!("x"), Some(-1.0)).unwrap();
        cache.set("fresh", json!("y"), Some(3600.0)).unwrap();
        assert_eq!(cache.get("stale"), None);
        assert_eq!(cache.get("fresh"), Some(json!("y")));
        // The expired entry was pruned from disk by the second write.
        let raw = std::fs::read_to_string(cache.path()).unwrap();
        assert!(!raw.contains("stale"));
    }

    #[test]
    fn corrupt_file_is_treated_as_empty() {
        let (_dir, cache) = temp_cache("svc");
        std::fs::write(cache.path(), "not json").unwrap();
        assert_eq!(cache.get("anything"), None);
        cache.set("k", json!(true), None).unwrap();
        assert_eq!(cache.get("k"), Some(json!(true)));
    }
}
