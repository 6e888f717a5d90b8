//! Inbound frame parsing and listener fan-out.
//!
//! A frame that fails to parse becomes a single error notification and never
//! touches connection state. Listener failures are contained here: an error
//! return is logged, a panic is caught at the dispatch boundary, and delivery
//! continues with the remaining listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};

use common::{Envelope, EnvelopeType, ErrorPayload, MetricsUpdate, SnapshotUpdate};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::callback::CallbackRegistry;
use crate::state::ConnectionState;

pub const PARSE_ERROR_MESSAGE: &str = "failed to parse message";

/// Routes inbound envelopes to the matching listener sets.
#[derive(Default)]
pub struct Dispatcher {
    callbacks: CallbackRegistry,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks_mut(&mut self) -> &mut CallbackRegistry {
        &mut self.callbacks
    }

    /// Parse one raw frame and deliver it.
    pub fn handle_frame(&self, raw: &str) {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "failed to parse inbound frame");
                counter!("feed_parse_errors_total").increment(1);
                self.notify_error(PARSE_ERROR_MESSAGE);
                return;
            }
        };

        match envelope.kind {
            EnvelopeType::MetricsUpdate => self.deliver_metrics(envelope.payload),
            EnvelopeType::SnapshotUpdate => self.deliver_snapshot(envelope.payload),
            EnvelopeType::Error => {
                let message = envelope
                    .payload
                    .and_then(|p| serde_json::from_value::<ErrorPayload>(p).ok())
                    .map(|p| p.message)
                    .unwrap_or_else(|| "server error".to_string());
                warn!(message = %message, "server reported an error");
                self.notify_error(&message);
            }
            EnvelopeType::Pong => {
                // Heartbeat acknowledgment, consumed silently.
                debug!("pong received");
            }
            other => {
                debug!(kind = ?other, "ignoring unexpected message type");
            }
        }
    }

    fn deliver_metrics(&self, payload: Option<Value>) {
        let update: MetricsUpdate = match payload.map(serde_json::from_value).transpose() {
            Ok(Some(update)) => update,
            Ok(None) | Err(_) => {
                warn!("metrics_update with missing or malformed payload");
                counter!("feed_parse_errors_total").increment(1);
                self.notify_error(PARSE_ERROR_MESSAGE);
                return;
            }
        };
        counter!("feed_metrics_updates_total").increment(1);
        for listener in self.callbacks.metrics() {
            match catch_unwind(AssertUnwindSafe(|| listener(&update))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(target_id = %update.target_id, error = %e, "metrics listener failed"),
                Err(_) => error!(target_id = %update.target_id, "metrics listener panicked"),
            }
        }
    }

    fn deliver_snapshot(&self, payload: Option<Value>) {
        let update: SnapshotUpdate = match payload.map(serde_json::from_value).transpose() {
            Ok(Some(update)) => update,
            Ok(None) | Err(_) => {
                warn!("snapshot_update with missing or malformed payload");
                counter!("feed_parse_errors_total").increment(1);
                self.notify_error(PARSE_ERROR_MESSAGE);
                return;
            }
        };
        counter!("feed_snapshot_updates_total").increment(1);
        for listener in self.callbacks.snapshots() {
            match catch_unwind(AssertUnwindSafe(|| listener(&update))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(target_id = %update.target_id, error = %e, "snapshot listener failed"),
                Err(_) => error!(target_id = %update.target_id, "snapshot listener panicked"),
            }
        }
    }

    /// Notify state listeners, in registration order.
    pub fn notify_state(&self, state: ConnectionState) {
        for listener in self.callbacks.state() {
            if catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
                error!(%state, "state listener panicked");
            }
        }
    }

    /// Notify error listeners, in registration order.
    pub fn notify_error(&self, message: &str) {
        counter!("feed_errors_total").increment(1);
        for listener in self.callbacks.errors() {
            if catch_unwind(AssertUnwindSafe(|| listener(message))).is_err() {
                error!("error listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Listener;
    use common::Error;
    use std::sync::{Arc, Mutex};

    fn recording_dispatcher() -> (Dispatcher, Arc<Mutex<Vec<String>>>) {
        let mut dispatcher = Dispatcher::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        dispatcher.callbacks_mut().insert(
            1,
            Listener::Error(Box::new(move |msg| {
                sink.lock().unwrap().push(msg.to_string());
            })),
        );
        (dispatcher, errors)
    }

    #[test]
    fn test_malformed_frame_notifies_error_listeners_once() {
        let (dispatcher, errors) = recording_dispatcher();
        dispatcher.handle_frame("{definitely not json");
        assert_eq!(
            *errors.lock().unwrap(),
            vec![PARSE_ERROR_MESSAGE.to_string()]
        );
    }

    #[test]
    fn test_malformed_payload_notifies_error_listeners() {
        let (dispatcher, errors) = recording_dispatcher();
        dispatcher
            .handle_frame(r#"{"type": "metrics_update", "payload": {"bogus": 1}, "timestamp": 1}"#);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_pong_is_consumed_silently() {
        let (dispatcher, errors) = recording_dispatcher();
        dispatcher.handle_frame(r#"{"type": "pong", "timestamp": 1}"#);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_type_is_dropped_without_error() {
        let (dispatcher, errors) = recording_dispatcher();
        dispatcher.handle_frame(r#"{"type": "promo_blast", "timestamp": 1}"#);
        assert!(errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_server_error_payload_reaches_error_listeners() {
        let (dispatcher, errors) = recording_dispatcher();
        dispatcher.handle_frame(
            r#"{"type": "error", "payload": {"message": "rate limited"}, "timestamp": 1}"#,
        );
        assert_eq!(*errors.lock().unwrap(), vec!["rate limited".to_string()]);
    }

    #[test]
    fn test_failing_listener_does_not_stop_delivery() {
        let mut dispatcher = Dispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        dispatcher.callbacks_mut().insert(
            1,
            Listener::Metrics(Box::new(|_| Err(Error::Generic("boom".to_string())))),
        );
        dispatcher
            .callbacks_mut()
            .insert(2, Listener::Metrics(Box::new(|_| panic!("listener bug"))));
        let sink = seen.clone();
        dispatcher.callbacks_mut().insert(
            3,
            Listener::Metrics(Box::new(move |update| {
                sink.lock().unwrap().push(update.target_id.clone());
                Ok(())
            })),
        );

        dispatcher.handle_frame(
            r#"{"type": "metrics_update",
                "payload": {"targetId": "qr-9", "metrics": {"scans": 1}, "timestamp": 2},
                "timestamp": 3}"#,
        );
        assert_eq!(*seen.lock().unwrap(), vec!["qr-9".to_string()]);
    }
}
