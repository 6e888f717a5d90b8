//! Realtime analytics delivery client.
//!
//! Keeps a streaming feed of per-code scan metrics alive across network
//! interruptions: exponential-backoff reconnection with an attempt budget,
//! application-level heartbeats, and full subscription replay on every
//! successful reconnect. Inbound updates fan out to independently registered
//! listener groups.

pub mod backoff;
pub mod callback;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod state;
pub mod subscription;
pub mod transport;

pub use callback::CallbackHandle;
pub use client::FeedClient;
pub use config::FeedConfig;
pub use state::ConnectionState;
pub use subscription::DEFAULT_METRIC_TYPES;
