//! Streampipe extracts playable streams from live-streaming and VOD
//! services and pipes the raw bytes to a player, a file or stdout.
//!
//! The [`session::Session`] is the entry point: it owns the HTTP layer,
//! the runtime options and the plugin registry. Plugins resolve URLs into
//! [`stream::Stream`] implementations (HLS, DASH, plain HTTP, subprocess
//! or FFmpeg-muxed), each of which opens into a readable byte handle.

pub mod buffer;
pub mod cache;
pub mod cdp;
pub mod common;
pub mod dash;
pub mod hls;
pub mod plugin;
pub mod plugins;
pub mod session;
pub mod stream;
