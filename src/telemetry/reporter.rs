//! JSON lines reporter for boiler snapshots

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::boiler::BoilerSnapshot;
use crate::config::SensorConfig;

/// Renders snapshots, keeping only the sensors enabled in configuration
#[derive(Debug, Clone)]
pub struct SnapshotReporter {
    sensors: SensorConfig,
}

impl SnapshotReporter {
    pub fn new(sensors: SensorConfig) -> Self {
        Self { sensors }
    }

    /// Snapshot as a JSON object with disabled sensors removed
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error if the snapshot cannot be serialized
    pub fn to_value(&self, snapshot: &BoilerSnapshot) -> serde_json::Result<Value> {
        let Value::Object(fields) = serde_json::to_value(snapshot)? else {
            return Ok(Value::Null);
        };

        let mut filtered: Map<String, Value> = fields
            .into_iter()
            .filter(|(name, _)| self.sensors.is_enabled(name))
            .collect();

        if let Some(Value::Array(stale)) = filtered.get_mut("stale") {
            stale.retain(|name| name.as_str().map_or(true, |n| self.sensors.is_enabled(n)));
        }
        Ok(Value::Object(filtered))
    }

    /// One JSON line with a `timestamp` field
    pub fn render(&self, snapshot: &BoilerSnapshot, at: DateTime<Utc>) -> serde_json::Result<String> {
        let mut value = self.to_value(snapshot)?;
        if let Value::Object(fields) = &mut value {
            fields.insert(
                "timestamp".to_string(),
                Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        serde_json::to_string(&value)
    }

    /// Emit every published snapshot on the `telemetry` target until shutdown
    pub async fn run(
        self,
        mut snapshots: watch::Receiver<BoilerSnapshot>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                changed = snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let snapshot = snapshots.borrow_and_update().clone();
            match self.render(&snapshot, Utc::now()) {
                Ok(line) => info!(target: "telemetry", "{}", line),
                Err(e) => warn!("Failed to render snapshot: {}", e),
            }
        }
    }
}
