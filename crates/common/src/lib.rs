//! Common wire types and errors for the realtime scan-analytics feed.

pub mod envelope;
pub mod error;

pub use envelope::{
    Envelope, EnvelopeType, ErrorPayload, MetricsUpdate, SnapshotUpdate, SubscribePayload,
    UnsubscribePayload,
};
pub use error::{Error, Result};
