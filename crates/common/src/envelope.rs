//! Wire envelope for the realtime analytics feed.
//!
//! Every message exchanged over the persistent connection is a JSON envelope
//! carrying a `type` tag, an optional structured payload, an optional
//! correlation id, and a millisecond timestamp.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Envelope
// ============================================================================

/// Message kinds carried on the wire.
///
/// Inbound frames with a type not listed here deserialize to [`Unknown`] and
/// are dropped by the dispatcher rather than treated as errors.
///
/// [`Unknown`]: EnvelopeType::Unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Subscribe,
    Unsubscribe,
    MetricsUpdate,
    SnapshotUpdate,
    Error,
    Ping,
    Pong,
    #[serde(other)]
    Unknown,
}

/// The typed, timestamped message unit exchanged over the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Milliseconds since epoch.
    pub timestamp: i64,
}

impl Envelope {
    /// Create an outbound envelope stamped with the current time.
    pub fn new(kind: EnvelopeType, payload: Option<Value>) -> Self {
        Self {
            kind,
            payload,
            correlation_id: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Create an outbound control envelope with a fresh correlation id.
    pub fn control(kind: EnvelopeType, payload: Option<Value>) -> Self {
        Self {
            correlation_id: Some(Uuid::new_v4().to_string()),
            ..Self::new(kind, payload)
        }
    }
}

// ============================================================================
// Client → Server payloads
// ============================================================================

/// Payload of a `subscribe` envelope: the full requested target set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    /// Code ids to receive realtime metrics for.
    pub target_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_types: Option<Vec<String>>,
    /// Requested update interval in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_interval: Option<u64>,
}

/// Payload of an `unsubscribe` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribePayload {
    pub target_ids: Vec<String>,
}

// ============================================================================
// Server → Client payloads
// ============================================================================

/// Incremental metric values for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    pub target_id: String,
    /// Metric name → value, opaque to the client.
    pub metrics: Value,
    pub timestamp: i64,
}

/// Full current counters for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUpdate {
    pub target_id: String,
    pub snapshot: Value,
    pub timestamp: i64,
}

/// Payload of a server `error` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}
