//! Client SDK for the NexusWatch operator console.
//!
//! The crate is organized by communication surface:
//! - `client`: the `ConsoleClient` facade and domain operation types.
//! - `console_api`: authenticated HTTP execution with retry and refresh.
//! - `channel`: realtime event channel with reconnect and heartbeat.
//! - `events`: typed publish/subscribe fan-out used by all consumers.
//! - `session`: credential ownership, persistence, and the refresh seam.
//! - `retry`: retry budget and backoff delay policy.

/// Console client facade and domain types.
pub mod client;
/// Authenticated HTTP request execution.
pub mod console_api;
/// Realtime event channel: transport seam, wire frames, state machine.
pub mod channel;
/// Typed event bus shared by the channel, the executor, and consumers.
pub mod events;
/// Retry budget and backoff policy.
pub mod retry;
/// Session credential store and token lifecycle.
pub mod session;

pub use client::{ConsoleClient, ConsoleClientOptions};
pub use events::{BusEvent, EventKind, SubscriptionId};
