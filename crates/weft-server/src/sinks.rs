//! Execution and request record sinks.
//!
//! The dispatcher and the HTTP layer hand finished records to a [`Recorder`],
//! whose own thread fans them out to the configured sinks. Sending never
//! blocks, so a slow sink cannot stall script execution.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use weft_common::{ExecutionRecord, Result, RequestRecord, SessionId, WeftError};

/// Consumer of finished raw-script executions.
pub trait ExecutionSink: Send + Sync {
    fn record_execution(&self, record: &ExecutionRecord);
}

/// Consumer of served-request records.
pub trait RequestLogSink: Send + Sync {
    fn record_request(&self, record: &RequestRecord);
}

/// Bounded in-memory history, newest entries kept.
#[derive(Debug)]
pub struct MemoryLog<T> {
    capacity: usize,
    entries: Mutex<VecDeque<T>>,
}

impl<T: Clone> MemoryLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn push(&self, entry: T) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Up to `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<T> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().rev().find(|e| predicate(e)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExecutionSink for MemoryLog<ExecutionRecord> {
    fn record_execution(&self, record: &ExecutionRecord) {
        self.push(record.clone());
    }
}

impl RequestLogSink for MemoryLog<RequestRecord> {
    fn record_request(&self, record: &RequestRecord) {
        self.push(record.clone());
    }
}

/// Writes one log line per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ExecutionSink for TracingSink {
    fn record_execution(&self, record: &ExecutionRecord) {
        if record.is_success() {
            info!(
                session = %record.session_id,
                origin = ?record.origin,
                "Script executed"
            );
        } else {
            warn!(
                session = %record.session_id,
                origin = ?record.origin,
                "Script failed: {}",
                record.error
            );
        }
    }
}

impl RequestLogSink for TracingSink {
    fn record_request(&self, record: &RequestRecord) {
        info!(
            "{} {} -> {} ({:.2}ms, {} db ops)",
            record.method,
            record.path,
            record.status,
            record.duration_ms,
            record.db_operations.len()
        );
    }
}

/// Raw-script sessions submitted but not yet recorded.
#[derive(Debug, Clone, Default)]
pub struct PendingSessions(Arc<Mutex<HashSet<SessionId>>>);

impl PendingSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: SessionId) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).insert(session);
    }

    pub fn remove(&self, session: &SessionId) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).remove(session);
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).contains(session)
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Record {
    Execution(ExecutionRecord),
    Request(RequestRecord),
}

/// Handle for handing records to the sinks.
///
/// A session stays in [`PendingSessions`] until every execution sink has
/// seen its record, so lookups never observe a gap between "pending" and
/// "recorded".
#[derive(Clone)]
pub struct Recorder {
    sender: Option<mpsc::UnboundedSender<Record>>,
    pending: PendingSessions,
}

impl Recorder {
    /// Starts the fan-out thread. It exits once every handle is dropped.
    pub fn spawn(
        execution_sinks: Vec<Arc<dyn ExecutionSink>>,
        request_sinks: Vec<Arc<dyn RequestLogSink>>,
    ) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Record>();
        let pending = PendingSessions::new();
        let finished = pending.clone();

        std::thread::Builder::new()
            .name("weft-recorder".to_string())
            .spawn(move || {
                while let Some(record) = receiver.blocking_recv() {
                    match record {
                        Record::Execution(record) => {
                            for sink in &execution_sinks {
                                sink.record_execution(&record);
                            }
                            finished.remove(&record.session_id);
                        }
                        Record::Request(record) => {
                            for sink in &request_sinks {
                                sink.record_request(&record);
                            }
                        }
                    }
                }
                debug!("Recorder stopped");
            })
            .map_err(WeftError::Io)?;

        Ok(Self {
            sender: Some(sender),
            pending,
        })
    }

    /// A recorder without sinks; records are dropped.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            pending: PendingSessions::new(),
        }
    }

    pub fn pending(&self) -> &PendingSessions {
        &self.pending
    }

    pub fn record_execution(&self, record: ExecutionRecord) {
        let session = record.session_id;
        match &self.sender {
            Some(sender) => {
                if sender.send(Record::Execution(record)).is_err() {
                    error!("Recorder is gone, dropping execution record {}", session);
                    self.pending.remove(&session);
                }
            }
            None => self.pending.remove(&session),
        }
    }

    pub fn record_request(&self, record: RequestRecord) {
        if let Some(sender) = &self.sender {
            if sender.send(Record::Request(record)).is_err() {
                error!("Recorder is gone, dropping request record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use weft_common::{ExecutionResult, Origin};

    fn execution(source: &str) -> ExecutionRecord {
        ExecutionRecord::new(
            SessionId::new(),
            source,
            Origin::Api,
            &ExecutionResult::success(serde_json::json!(1), Vec::new()),
        )
    }

    fn request(path: &str) -> RequestRecord {
        RequestRecord {
            method: "GET".to_string(),
            path: path.to_string(),
            status: 200,
            duration_ms: 1.5,
            remote_addr: None,
            console: Vec::new(),
            db_operations: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_memory_log_is_bounded_and_newest_first() {
        let log = MemoryLog::new(3);
        for i in 0..5 {
            log.push(i);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.recent(10), vec![4, 3, 2]);
        assert_eq!(log.recent(1), vec![4]);
        assert_eq!(log.find(|v| *v < 4), Some(3));
    }

    #[test]
    fn test_recorder_fans_out_and_clears_pending() {
        let executions = Arc::new(MemoryLog::<ExecutionRecord>::new(10));
        let requests = Arc::new(MemoryLog::<RequestRecord>::new(10));
        let recorder = Recorder::spawn(
            vec![
                executions.clone() as Arc<dyn ExecutionSink>,
                Arc::new(TracingSink) as Arc<dyn ExecutionSink>,
            ],
            vec![requests.clone() as Arc<dyn RequestLogSink>],
        )
        .unwrap();

        let record = execution("1");
        let session = record.session_id;
        recorder.pending().insert(session);
        recorder.record_execution(record);
        recorder.record_request(request("/a"));

        wait_until(|| executions.len() == 1 && requests.len() == 1);
        wait_until(|| !recorder.pending().contains(&session));
        assert_eq!(requests.recent(1)[0].path, "/a");
    }

    #[test]
    fn test_disabled_recorder_still_clears_pending() {
        let recorder = Recorder::disabled();
        let record = execution("2");
        let session = record.session_id;
        recorder.pending().insert(session);
        recorder.record_execution(record);
        assert!(recorder.pending().is_empty());
    }
}
