//! Last-writer-wins state engine.
//!
//! Holds the node's view of every sensor reading it has ever accepted,
//! keyed internally by `sensor_id` alone — at most one record per
//! `sensor_id`, regardless of which origin produced it. Updates are merged
//! with a strict tiebreak rule so that every node converges to the same
//! value for a `sensor_id` regardless of delivery order, as long as it
//! eventually sees every update. Snapshots render each record under the
//! combined `"<origin>:<sensor_id>"` key so a reader can see which origin
//! currently owns the value, but that combined key is a presentation
//! detail only — it never participates in the merge comparison.
//!
//! Three things live behind one lock: the authoritative state map, a UI
//! buffer (every accepted update, cleared whenever read), and a
//! replication buffer (every accepted update, cleared whenever read,
//! consumed by the replication publisher). Grouping them under one lock
//! keeps "accept an update" atomic with respect to "read a buffer" —
//! readers never observe a torn state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Optional metadata carried alongside a sensor value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<i64>,
}

/// A single last-writer-wins record: a value, the timestamp and origin
/// used to resolve conflicts, and optional metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub value: serde_json::Value,
    pub ts_ms: i64,
    pub origin: String,
    #[serde(default)]
    pub meta: RecordMeta,
}

/// An incoming update to merge into the state engine.
#[derive(Debug, Clone)]
pub struct Update {
    pub sensor_id: String,
    pub record: Record,
}

struct Inner {
    state: HashMap<String, Record>,
    ui_buffer: Vec<(String, Record)>,
    replication_buffer: Vec<(String, Record)>,
}

/// The node's last-writer-wins view of all known sensor readings.
pub struct StateEngine {
    self_node_id: String,
    inner: Mutex<Inner>,
}

impl StateEngine {
    pub fn new(self_node_id: impl Into<String>) -> Self {
        Self {
            self_node_id: self_node_id.into(),
            inner: Mutex::new(Inner {
                state: HashMap::new(),
                ui_buffer: Vec::new(),
                replication_buffer: Vec::new(),
            }),
        }
    }

    /// Merges `update` into the state map, applying the last-writer-wins
    /// tiebreak rule. Returns `true` if the update was accepted (`sensor_id`
    /// either did not exist yet, or `update` beat the previous record for
    /// it).
    ///
    /// Validation: `sensor_id` and `origin` must be non-empty strings, else
    /// the update is rejected with no side effects (no state mutation, no
    /// buffer writes).
    ///
    /// Tiebreak rule, against the existing record for the same `sensor_id`:
    /// `update.ts_ms > prev.ts_ms`, or
    /// `update.ts_ms == prev.ts_ms && update.origin > prev.origin`
    /// (lexicographic). Equal timestamp and equal-or-lesser origin is a
    /// rejection, not a no-op error — stale or duplicate updates are
    /// expected during replication and are simply dropped.
    pub fn merge_update(&self, update: Update) -> bool {
        if update.sensor_id.is_empty() || update.record.origin.is_empty() {
            return false;
        }

        let mut inner = self.inner.lock().expect("state lock poisoned");

        let accept = match inner.state.get(&update.sensor_id) {
            None => true,
            Some(prev) => {
                update.record.ts_ms > prev.ts_ms
                    || (update.record.ts_ms == prev.ts_ms && update.record.origin > prev.origin)
            }
        };

        if accept {
            let buffer_key = format!("{}:{}", update.record.origin, update.sensor_id);
            inner.state.insert(update.sensor_id, update.record.clone());
            inner.ui_buffer.push((buffer_key.clone(), update.record.clone()));
            inner.replication_buffer.push((buffer_key, update.record));
        }

        accept
    }

    /// Returns the full state snapshot, shaped as
    /// `{self_node_id: {"<origin>:<sensor_id>": record}}`. The state map
    /// itself is keyed by `sensor_id` alone; the combined key is built here
    /// purely for rendering.
    pub fn get_state_snapshot(&self) -> serde_json::Value {
        let inner = self.inner.lock().expect("state lock poisoned");
        let records: serde_json::Map<String, serde_json::Value> = inner
            .state
            .iter()
            .map(|(sensor_id, record)| {
                let key = format!("{}:{}", record.origin, sensor_id);
                (key, serde_json::to_value(record).unwrap_or(serde_json::Value::Null))
            })
            .collect();

        let mut outer = serde_json::Map::new();
        outer.insert(self.self_node_id.clone(), serde_json::Value::Object(records));
        serde_json::Value::Object(outer)
    }

    /// Drains and returns the UI buffer: every update accepted since the
    /// last call to this method.
    pub fn get_updates_snapshot(&self) -> Vec<(String, Record)> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        std::mem::take(&mut inner.ui_buffer)
    }

    /// Drains and returns the replication buffer: every update accepted
    /// since the last call to this method. Consumed by the replication
    /// publisher, separately from the UI buffer so a slow HTTP client
    /// cannot stall replication and vice versa.
    pub fn pop_replication_updates(&self) -> Vec<(String, Record)> {
        let mut inner = self.inner.lock().expect("state lock poisoned");
        std::mem::take(&mut inner.replication_buffer)
    }

    /// Logs the current state at debug level, one line per record. Intended
    /// to be called periodically from a diagnostic task; never part of the
    /// read/write hot path.
    pub fn debug_dump(&self) {
        let inner = self.inner.lock().expect("state lock poisoned");
        for (sensor_id, record) in inner.state.iter() {
            tracing::debug!(sensor_id = %sensor_id, ts_ms = record.ts_ms, origin = %record.origin, "state record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(sensor_id: &str, value: i64, ts_ms: i64, origin: &str) -> Update {
        Update {
            sensor_id: sensor_id.to_string(),
            record: Record {
                value: json!(value),
                ts_ms,
                origin: origin.to_string(),
                meta: RecordMeta::default(),
            },
        }
    }

    #[test]
    fn first_update_for_a_key_is_always_accepted() {
        let engine = StateEngine::new("self");
        assert!(engine.merge_update(update("s1", 1, 100, "node-a")));
    }

    #[test]
    fn newer_timestamp_wins() {
        let engine = StateEngine::new("self");
        engine.merge_update(update("s1", 1, 100, "node-a"));
        assert!(engine.merge_update(update("s1", 2, 200, "node-a")));
    }

    #[test]
    fn older_timestamp_is_rejected() {
        let engine = StateEngine::new("self");
        engine.merge_update(update("s1", 1, 200, "node-a"));
        assert!(!engine.merge_update(update("s1", 2, 100, "node-a")));
    }

    #[test]
    fn equal_timestamp_breaks_tie_on_origin() {
        let engine = StateEngine::new("self");
        engine.merge_update(update("s1", 1, 100, "node-a"));
        assert!(engine.merge_update(update("s1", 2, 100, "node-b")));
        assert!(!engine.merge_update(update("s1", 3, 100, "node-a")));
    }

    #[test]
    fn updates_from_different_origins_collide_on_the_same_sensor_id() {
        let engine = StateEngine::new("self");
        assert!(engine.merge_update(update("s1", 1, 1000, "B")));
        assert!(!engine.merge_update(update("s1", 2, 1000, "A")));

        let snapshot = engine.get_state_snapshot();
        let records = snapshot.get("self").unwrap().as_object().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records.contains_key("B:s1"));
        assert!(!records.contains_key("A:s1"));
    }

    #[test]
    fn empty_sensor_id_is_rejected_without_side_effects() {
        let engine = StateEngine::new("self");
        assert!(!engine.merge_update(update("", 1, 100, "node-a")));
        assert!(engine.get_updates_snapshot().is_empty());
        assert!(engine.pop_replication_updates().is_empty());
    }

    #[test]
    fn empty_origin_is_rejected_without_side_effects() {
        let engine = StateEngine::new("self");
        assert!(!engine.merge_update(update("s1", 1, 100, "")));
        assert!(engine.get_updates_snapshot().is_empty());
        assert!(engine.pop_replication_updates().is_empty());
    }

    #[test]
    fn snapshot_is_shaped_by_self_node_id() {
        let engine = StateEngine::new("self-node");
        engine.merge_update(update("s1", 1, 100, "node-a"));
        let snapshot = engine.get_state_snapshot();
        let records = snapshot.get("self-node").unwrap();
        assert!(records.get("node-a:s1").is_some());
    }

    #[test]
    fn ui_and_replication_buffers_clear_independently() {
        let engine = StateEngine::new("self");
        engine.merge_update(update("s1", 1, 100, "node-a"));

        let ui = engine.get_updates_snapshot();
        assert_eq!(ui.len(), 1);
        assert!(engine.get_updates_snapshot().is_empty());

        let replication = engine.pop_replication_updates();
        assert_eq!(replication.len(), 1);
        assert!(engine.pop_replication_updates().is_empty());
    }

    #[test]
    fn rejected_update_does_not_populate_buffers() {
        let engine = StateEngine::new("self");
        engine.merge_update(update("s1", 1, 200, "node-a"));
        engine.get_updates_snapshot();
        engine.pop_replication_updates();

        engine.merge_update(update("s1", 2, 100, "node-a"));
        assert!(engine.get_updates_snapshot().is_empty());
        assert!(engine.pop_replication_updates().is_empty());
    }
}
