//! Tracks the requested target set so it can be replayed after a reconnect.

use std::collections::BTreeSet;

use common::SubscribePayload;

/// Metric types requested when a subscriber never asked for specific ones.
pub const DEFAULT_METRIC_TYPES: &[&str] = &["scans", "unique_scans", "locations"];

/// The set of code ids (and metric types) the client wants realtime data for.
///
/// Mutated only through subscribe/unsubscribe. Survives every state
/// transition except an explicit disconnect, which clears it.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    targets: BTreeSet<String>,
    metric_types: BTreeSet<String>,
    update_interval_ms: Option<u64>,
}

impl SubscriptionSet {
    pub fn new(update_interval_ms: Option<u64>) -> Self {
        Self {
            update_interval_ms,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn contains(&self, target: &str) -> bool {
        self.targets.contains(target)
    }

    /// Merge new targets (and optionally metric types) into the tracked set.
    pub fn merge(&mut self, targets: Vec<String>, metric_types: Option<Vec<String>>) {
        self.targets.extend(targets);
        if let Some(types) = metric_types {
            self.metric_types.extend(types);
        }
    }

    /// Remove targets from the tracked set and return the ids an unsubscribe
    /// message should name. `None` targets the entire tracked set.
    pub fn remove(&mut self, targets: Option<Vec<String>>) -> Vec<String> {
        match targets {
            Some(ids) => {
                for id in &ids {
                    self.targets.remove(id);
                }
                ids
            }
            None => std::mem::take(&mut self.targets).into_iter().collect(),
        }
    }

    pub fn clear(&mut self) {
        self.targets.clear();
    }

    /// Build the payload carrying the full tracked set, falling back to the
    /// default metric types when none were ever requested.
    pub fn subscribe_payload(&self) -> SubscribePayload {
        let metric_types = if self.metric_types.is_empty() {
            DEFAULT_METRIC_TYPES.iter().map(|s| s.to_string()).collect()
        } else {
            self.metric_types.iter().cloned().collect()
        };
        SubscribePayload {
            target_ids: self.targets.iter().cloned().collect(),
            metric_types: Some(metric_types),
            update_interval: self.update_interval_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_deduplicates() {
        let mut set = SubscriptionSet::default();
        set.merge(vec!["a".into(), "b".into()], None);
        set.merge(vec!["b".into(), "c".into()], None);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_remove_named_targets() {
        let mut set = SubscriptionSet::default();
        set.merge(vec!["a".into(), "b".into()], None);
        let removed = set.remove(Some(vec!["a".into(), "x".into()]));
        // The unsubscribe message names what was asked for, tracked or not.
        assert_eq!(removed, vec!["a".to_string(), "x".to_string()]);
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
    }

    #[test]
    fn test_remove_all_drains_the_set() {
        let mut set = SubscriptionSet::default();
        set.merge(vec!["a".into(), "b".into()], None);
        let removed = set.remove(None);
        assert_eq!(removed.len(), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn test_payload_defaults_metric_types() {
        let mut set = SubscriptionSet::new(Some(1000));
        set.merge(vec!["a".into()], None);
        let payload = set.subscribe_payload();
        assert_eq!(
            payload.metric_types.unwrap(),
            DEFAULT_METRIC_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
        );
        assert_eq!(payload.update_interval, Some(1000));
    }

    #[test]
    fn test_payload_uses_requested_metric_types() {
        let mut set = SubscriptionSet::default();
        set.merge(vec!["a".into()], Some(vec!["scans".into()]));
        let payload = set.subscribe_payload();
        assert_eq!(payload.metric_types.unwrap(), vec!["scans".to_string()]);
    }
}
