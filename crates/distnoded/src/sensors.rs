//! Synthetic sensor sources.
//!
//! These generate the local sensor events the state engine replicates.
//! They are intentionally outside the core: a production deployment would
//! replace this module with real sensor hardware or an ingest adapter, and
//! nothing else in the node would need to change.
//!
//! This is a deliberately small subset of the original node's eight
//! generator kinds (numeric, boolean, categorical, incremental, noise,
//! spike, trend, wave) — enough to exercise the state engine and
//! replication path end-to-end without growing the ambient surface past
//! what feeds it.

use distnode_core::state::{Record, RecordMeta, StateEngine, Update};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Produces one value per call. `sample` is given the current wall-clock
/// time in milliseconds so implementations can timestamp their own output
/// deterministically in tests.
pub trait SensorSource: Send {
    fn sensor_id(&self) -> &str;
    fn sample(&mut self) -> serde_json::Value;
    fn period(&self) -> Duration;
    fn meta(&self) -> RecordMeta {
        RecordMeta::default()
    }
}

/// A numeric sensor drifting uniformly between `min` and `max`.
pub struct NumericSensor {
    sensor_id: String,
    min: f64,
    max: f64,
    period: Duration,
    unit: Option<String>,
}

impl NumericSensor {
    pub fn new(sensor_id: impl Into<String>, min: f64, max: f64, period: Duration, unit: Option<String>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            min,
            max,
            period,
            unit,
        }
    }
}

impl SensorSource for NumericSensor {
    fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    fn sample(&mut self) -> serde_json::Value {
        let value = rand::thread_rng().gen_range(self.min..=self.max);
        serde_json::json!(value)
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn meta(&self) -> RecordMeta {
        RecordMeta {
            unit: self.unit.clone(),
            period_ms: Some(self.period.as_millis() as i64),
        }
    }
}

/// A boolean sensor that flips true with probability `p_true` on each
/// sample.
pub struct BooleanSensor {
    sensor_id: String,
    p_true: f64,
    period: Duration,
}

impl BooleanSensor {
    pub fn new(sensor_id: impl Into<String>, p_true: f64, period: Duration) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            p_true,
            period,
        }
    }
}

impl SensorSource for BooleanSensor {
    fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    fn sample(&mut self) -> serde_json::Value {
        let value = rand::thread_rng().gen_bool(self.p_true);
        serde_json::json!(value)
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn meta(&self) -> RecordMeta {
        RecordMeta {
            unit: None,
            period_ms: Some(self.period.as_millis() as i64),
        }
    }
}

/// Spawns one periodic task per sensor source, each feeding samples
/// directly into the state engine as locally-originated updates.
pub fn spawn_all(self_node_id: String, state: Arc<StateEngine>, mut sources: Vec<Box<dyn SensorSource>>) {
    for mut source in sources.drain(..) {
        let self_node_id = self_node_id.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(source.period());
            loop {
                interval.tick().await;
                let value = source.sample();
                let ts_ms = now_ms();
                let record = Record {
                    value,
                    ts_ms,
                    origin: self_node_id.clone(),
                    meta: source.meta(),
                };
                state.merge_update(Update {
                    sensor_id: source.sensor_id().to_string(),
                    record,
                });
            }
        });
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
