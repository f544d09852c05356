//! Sensor sources
//!
//! An LM never talks to field devices itself: it asks a [`SensorSource`] for
//! the latest snapshot once per cycle and asks it to reset after a failure.

use async_trait::async_trait;
use gridwatch_core::snapshot::Snapshot;
use gridwatch_core::state::{new_state, Shared};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed snapshot: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no data available")]
    Unavailable,
}

#[async_trait]
pub trait SensorSource: Send {
    async fn read_snapshot(&mut self) -> Result<Snapshot, SensorError>;

    /// Re-establishes the connection to the instrumentation after a failed read.
    async fn reset(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn describe(&self) -> String;
}

/// Reads a JSON [`Snapshot`] from a file on every poll. Another process (a
/// field gateway or a simulator) keeps the file current.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SensorSource for JsonFileSource {
    async fn read_snapshot(&mut self) -> Result<Snapshot, SensorError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SensorError::Io { path: self.path.display().to_string(), source })?;
        let mut snapshot: Snapshot = serde_json::from_str(&text)?;
        if snapshot.taken_at == 0.0 {
            let fresh = Snapshot::stamped_now(Vec::new(), Vec::new());
            snapshot.taken_at = fresh.taken_at;
        }
        Ok(snapshot)
    }

    async fn reset(&mut self) -> Result<(), SensorError> {
        debug!(path = %self.path.display(), "file source has no connection to reset");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Serves whatever snapshot was last handed to it. Clones share the value, so
/// a test keeps one clone to drive the readings.
#[derive(Clone, Default)]
pub struct StaticSource {
    current: Shared<Option<Snapshot>>,
    resets: Shared<u32>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self { current: new_state(None), resets: new_state(0) }
    }

    pub fn with(snapshot: Snapshot) -> Self {
        let source = Self::new();
        source.set(snapshot);
        source
    }

    pub fn set(&self, snapshot: Snapshot) {
        *self.current.lock() = Some(snapshot);
    }

    /// Makes the next reads fail until [`set`](Self::set) is called again.
    pub fn clear(&self) {
        *self.current.lock() = None;
    }

    pub fn resets(&self) -> u32 {
        *self.resets.lock()
    }
}

#[async_trait]
impl SensorSource for StaticSource {
    async fn read_snapshot(&mut self) -> Result<Snapshot, SensorError> {
        self.current.lock().clone().ok_or(SensorError::Unavailable)
    }

    async fn reset(&mut self) -> Result<(), SensorError> {
        *self.resets.lock() += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridwatch_devkit::fixtures;
    use std::io::Write;

    #[tokio::test]
    async fn file_source_reads_and_stamps() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let document = r#"{
            "switches": [{"id": "S2", "state": "OPEN"}],
            "meters": [{"id": "M1", "current": 12.5, "voltage": 230.0}]
        }"#;
        file.write_all(document.as_bytes()).unwrap();
        let mut source = JsonFileSource::new(file.path());
        let snapshot = source.read_snapshot().await.unwrap();
        assert!(snapshot.taken_at > 0.0);
        assert_eq!(snapshot.meter_reading("M1").unwrap().current, 12.5);
        assert_eq!(snapshot.switches.len(), 1);
    }

    #[tokio::test]
    async fn file_source_reports_missing_and_malformed_files() {
        let mut missing = JsonFileSource::new("/nonexistent/gridwatch/sensors.json");
        assert!(matches!(missing.read_snapshot().await, Err(SensorError::Io { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ half").unwrap();
        let mut broken = JsonFileSource::new(file.path());
        assert!(matches!(broken.read_snapshot().await, Err(SensorError::Parse(_))));
    }

    #[tokio::test]
    async fn static_source_is_shared_between_clones() {
        let handle = StaticSource::new();
        let mut source = handle.clone();
        assert!(matches!(source.read_snapshot().await, Err(SensorError::Unavailable)));
        handle.set(fixtures::healthy_a().build());
        assert_eq!(source.read_snapshot().await.unwrap().meters.len(), 3);
        source.reset().await.unwrap();
        assert_eq!(handle.resets(), 1);
    }
}
