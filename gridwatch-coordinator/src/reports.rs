//! Recent violation reports, served to the report sink.

use gridwatch_core::contracts::ReqViolationEvent;
use gridwatch_core::queue::BoundedQueue;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const REPORT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationReport {
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix seconds at which the C2 received the violation.
    pub timestamp: i64,
    pub requirement: i32,
    pub component_id: String,
}

/// Messages the report sink sends over its socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkRequest {
    Query { timestamp: f64 },
}

#[derive(Debug)]
pub struct ReportLog {
    entries: BoundedQueue<ViolationReport>,
}

impl Default for ReportLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportLog {
    pub fn new() -> Self {
        Self { entries: BoundedQueue::new(REPORT_CAPACITY) }
    }

    pub fn record(&mut self, event: &ReqViolationEvent, received_at: OffsetDateTime) {
        self.entries.push(ViolationReport {
            kind: "report".to_string(),
            timestamp: received_at.unix_timestamp(),
            requirement: event.requirement,
            component_id: event.component_id.clone(),
        });
    }

    /// Entries strictly newer than `timestamp`, oldest first.
    pub fn newer_than(&self, timestamp: f64) -> Vec<ViolationReport> {
        self.entries.iter().filter(|r| r.timestamp as f64 > timestamp).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON answer to one sink message; `None` when there is nothing to send.
    pub fn answer(&self, text: &str) -> Option<String> {
        let SinkRequest::Query { timestamp } = serde_json::from_str(text).ok()?;
        let reports = self.newer_than(timestamp);
        if reports.is_empty() {
            return None;
        }
        serde_json::to_string(&reports).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn event(n: i32) -> ReqViolationEvent {
        ReqViolationEvent { requirement: n, component_id: format!("C{n}") }
    }

    #[test]
    fn keeps_the_latest_256() {
        let mut log = ReportLog::new();
        let at = datetime!(2024-05-01 12:00 UTC);
        for n in 0..300 {
            log.record(&event(n), at);
        }
        assert_eq!(log.len(), REPORT_CAPACITY);
        let all = log.newer_than(f64::MIN);
        assert_eq!(all.first().unwrap().requirement, 44);
        assert_eq!(all.last().unwrap().requirement, 299);
    }

    #[test]
    fn query_is_strictly_newer_and_silent_when_empty() {
        let mut log = ReportLog::new();
        let t0 = datetime!(2024-05-01 12:00 UTC);
        log.record(&event(1), t0);
        log.record(&event(7), t0 + time::Duration::seconds(5));

        let t0_secs = t0.unix_timestamp();
        let reply = log.answer(&format!(r#"{{"type":"query","timestamp":{t0_secs}}}"#)).unwrap();
        let reports: Vec<ViolationReport> = serde_json::from_str(&reply).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].requirement, 7);
        assert_eq!(reports[0].kind, "report");

        let later = format!(r#"{{"type":"query","timestamp":{}}}"#, t0_secs + 5);
        assert!(log.answer(&later).is_none());
        assert!(log.answer(r#"{"type":"subscribe"}"#).is_none());
        assert!(log.answer("garbage").is_none());
    }
}
