//! Realtime channel modules.
//!
//! - `client`: connection state machine, reconnect handling, heartbeat.
//! - `proto`: wire frames shared with the console event service.
//! - `transport`: factory/link seams and the websocket implementation.

/// Connection state machine and worker.
pub mod client;
/// Channel wire frames.
pub mod proto;
/// Transport seams and the tokio-tungstenite link.
pub mod transport;
