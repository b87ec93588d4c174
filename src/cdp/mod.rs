//! Chrome DevTools Protocol client: a multiplexing WebSocket connection,
//! target sessions and a Fetch-domain request router.

pub mod client;
pub mod connection;
pub mod proto;

pub use client::{CdpClient, CdpClientSession, PausedRequest, RequestAction, RequestStage};
pub use connection::CdpConnection;
