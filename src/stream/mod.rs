pub mod ffmpeg;
pub mod http;
pub mod quality;
pub mod segmented;
pub mod subprocess;

use std::io::Read;

use crate::common::PipeResult;

/// A playable stream descriptor. Opening yields a forward-only byte reader;
/// there is no seeking once a stream is open.
pub trait Stream: Send + Sync {
    /// Short protocol name ("http", "hls", "dash", ...), used in stream-type
    /// filtering and JSON output.
    fn stream_type(&self) -> &'static str;

    fn url(&self) -> Option<String> {
        None
    }

    fn open(&self) -> PipeResult<Box<dyn StreamHandle>>;

    fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({ "type": self.stream_type() });
        if let Some(url) = self.url() {
            obj["url"] = serde_json::Value::String(url);
        }
        obj
    }
}

/// An opened stream. `close` is idempotent and safe to call from any thread
/// through a clone of the underlying guts; reads after close return EOF.
pub trait StreamHandle: Read + Send {
    fn close(&mut self);
}
