//! `SENSOR_UPDATE` handler: the dispatcher-side half of replication.
//!
//! Every `SENSOR_UPDATE` an inbound connection decodes is handed here,
//! parsed back into a [`Update`], and merged into the local state engine
//! under the remote origin it carries — closing the loop with
//! [`crate::publisher`], which is what put it on the wire in the first
//! place.

use crate::dispatcher::{Handler, HandlerError};
use distnode_core::protocol::Envelope;
use distnode_core::state::{Record, RecordMeta, StateEngine, Update};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct SensorUpdatePayload {
    sensor_id: String,
    value: serde_json::Value,
    ts_ms: i64,
    origin: String,
    #[serde(default)]
    meta: RecordMeta,
}

pub struct SensorUpdateHandler {
    state: Arc<StateEngine>,
}

impl SensorUpdateHandler {
    pub fn new(state: Arc<StateEngine>) -> Self {
        Self { state }
    }
}

impl Handler for SensorUpdateHandler {
    fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        let payload: SensorUpdatePayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| HandlerError(format!("invalid SENSOR_UPDATE payload: {e}")))?;

        let accepted = self.state.merge_update(Update {
            sensor_id: payload.sensor_id.clone(),
            record: Record {
                value: payload.value,
                ts_ms: payload.ts_ms,
                origin: payload.origin.clone(),
                meta: payload.meta,
            },
        });

        debug!(
            sensor_id = %payload.sensor_id,
            origin = %payload.origin,
            accepted,
            "processed SENSOR_UPDATE"
        );
        Ok(())
    }
}
