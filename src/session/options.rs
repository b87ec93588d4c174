//! Session options map.
//!
//! Keys are normalized: lookups are case-insensitive and `-`/`_` are
//! interchangeable. Values are JSON values so plugins and the engine can
//! share one heterogeneous map with typed getters.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

fn normalize(key: &str) -> String {
    key.to_ascii_lowercase().replace('_', "-")
}

pub struct Options {
    values: RwLock<HashMap<String, Value>>,
}

impl Options {
    pub fn new() -> Self {
        let opts = Self {
            values: RwLock::new(HashMap::new()),
        };
        opts.apply_defaults();
        opts
    }

    fn apply_defaults(&self) {
        let defaults: &[(&str, Value)] = &[
            ("ringbuffer-size", Value::from(16 * 1024 * 1024u64)),
            ("stream-timeout", Value::from(60.0)),
            ("stream-segment-attempts", Value::from(3u64)),
            ("stream-segment-threads", Value::from(1u64)),
            ("stream-segment-timeout", Value::from(10.0)),
            ("hls-live-edge", Value::from(3u64)),
            ("hls-live-restart", Value::from(false)),
            ("hls-start-offset", Value::from(0.0)),
            ("hls-playlist-reload-attempts", Value::from(3u64)),
            ("hls-playlist-reload-time", Value::from("default")),
            ("hls-segment-stream-data", Value::from(false)),
            ("hls-segment-ignore-names", Value::Array(Vec::new())),
            ("hls-audio-select", Value::Array(Vec::new())),
            ("hls-disable-ads", Value::from(false)),
            ("dash-manifest-reload-attempts", Value::from(3u64)),
            ("ffmpeg-ffmpeg", Value::from("ffmpeg")),
            ("ffmpeg-fout", Value::Null),
            ("ffmpeg-verbose", Value::from(false)),
            ("ffmpeg-verbose-path", Value::Null),
            ("cdp-timeout", Value::from(2.0)),
            ("mux-subprocess", Value::from(true)),
        ];
        let mut values = self.values.write();
        for (key, value) in defaults {
            values.insert((*key).into(), value.clone());
        }
    }

    pub fn set(&self, key: &str, value: Value) {
        self.values.write().insert(normalize(key), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(&normalize(key)).cloned()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => vec![s],
            _ => Vec::new(),
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
