//! Processor Scenarios
//!
//! Drives `MessageProcessor` end to end with the real `HandlerSet` and
//! in-memory collaborators: a map-backed blob store, a scripted device
//! transport, a recording outcome reporter and a sleeper that records delays
//! instead of waiting.

use async_trait::async_trait;
use fabfleet_worker::blob::BlobStore;
use fabfleet_worker::broker::{ReceiptHandle, ReceivedEntry};
use fabfleet_worker::config::RetryPolicy;
use fabfleet_worker::error::{ReportError, StorageError, TransportError};
use fabfleet_worker::processor::Sleeper;
use fabfleet_worker::types::UploadResource;
use fabfleet_worker::{
    DeadLetterChannel, DeadLetterRecord, DeviceTransport, HandlerSet, JobTransferRecord, MemoryQueue,
    Message, MessageBroker, MessageProcessor, MessageType, OutcomeReporter, ProcessOutcome, QueueError,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ============================================================================
// Doubles
// ============================================================================

#[derive(Default)]
struct MapBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    downloads: AtomicU32,
}

impl MapBlobStore {
    fn with_blob(key: &str, data: &[u8]) -> Self {
        let store = Self::default();
        store.blobs.lock().unwrap().insert(key.to_string(), data.to_vec());
        store
    }
}

#[async_trait]
impl BlobStore for MapBlobStore {
    async fn download_file(
        &self,
        key: &str,
        destination: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, StorageError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        destination.write_all(&data).await?;
        Ok(data.len() as u64)
    }

    async fn upload_file(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        key: &str,
    ) -> Result<u64, StorageError> {
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        let len = data.len() as u64;
        self.blobs.lock().unwrap().insert(key.to_string(), data);
        Ok(len)
    }
}

/// Fails the first `failures` calls of every operation, then succeeds.
struct ScriptedTransport {
    failures: u32,
    calls: AtomicU32,
    delivered: Mutex<Vec<(JobTransferRecord, Vec<u8>)>>,
}

impl ScriptedTransport {
    fn failing_first(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Result<(), TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(TransportError::ConnectionFailed {
                addr: "10.0.0.5:55555".to_string(),
                message: "connection refused".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeviceTransport for ScriptedTransport {
    async fn send_heartbeat(&self, _address: IpAddr, _content: &str) -> Result<(), TransportError> {
        self.next_outcome()
    }

    async fn send_job(
        &self,
        record: &JobTransferRecord,
        file: &Path,
        _address: IpAddr,
    ) -> Result<u64, TransportError> {
        self.next_outcome()?;
        let bytes = tokio::fs::read(file).await?;
        let len = bytes.len() as u64;
        self.delivered.lock().unwrap().push((record.clone(), bytes));
        Ok(len)
    }

    async fn fetch_device_info(
        &self,
        _address: IpAddr,
        _resource: UploadResource,
    ) -> Result<Vec<u8>, TransportError> {
        self.next_outcome().map(|_| b"{}".to_vec())
    }

    async fn forward_upload(
        &self,
        _upload_url: &str,
        _device_name: &str,
        _body: Vec<u8>,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingReporter {
    results: Mutex<Vec<String>>,
}

impl RecordingReporter {
    fn results(&self) -> Vec<String> {
        self.results.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutcomeReporter for RecordingReporter {
    async fn report(&self, _msg: &Message, result: &str) -> Result<(), ReportError> {
        self.results.lock().unwrap().push(result.to_string());
        Ok(())
    }
}

struct BrokenReporter;

#[async_trait]
impl OutcomeReporter for BrokenReporter {
    async fn report(&self, _msg: &Message, _result: &str) -> Result<(), ReportError> {
        Err(ReportError::Status(reqwest::StatusCode::BAD_GATEWAY))
    }
}

#[derive(Default)]
struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    fn secs(&self) -> Vec<u64> {
        self.delays.lock().unwrap().iter().map(Duration::as_secs).collect()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, delay: Duration) {
        self.delays.lock().unwrap().push(delay);
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    processor: MessageProcessor,
    queue: Arc<MemoryQueue>,
    dlq: Arc<MemoryQueue>,
    blobs: Arc<MapBlobStore>,
    transport: Arc<ScriptedTransport>,
    reporter: Arc<RecordingReporter>,
    sleeper: Arc<RecordingSleeper>,
    _scratch: tempfile::TempDir,
}

fn harness(transport: ScriptedTransport, policy: RetryPolicy) -> Harness {
    let scratch = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let dlq = Arc::new(MemoryQueue::new());
    let blobs = Arc::new(MapBlobStore::with_blob("abc123", b"solid part\nendsolid part\n"));
    let transport = Arc::new(transport);
    let reporter = Arc::new(RecordingReporter::default());
    let sleeper = Arc::new(RecordingSleeper::default());

    let handlers = Arc::new(HandlerSet::new(blobs.clone(), transport.clone(), scratch.path()));
    let processor = MessageProcessor::new(queue.clone(), dlq.clone(), handlers, reporter.clone(), policy)
        .with_sleeper(sleeper.clone());

    Harness {
        processor,
        queue,
        dlq,
        blobs,
        transport,
        reporter,
        sleeper,
        _scratch: scratch,
    }
}

fn job_message() -> Message {
    Message {
        kind: MessageType::Job,
        file_name: Some("part.stl".to_string()),
        blob_key: Some("abc123".to_string()),
        material: Some("HR PA 12".to_string()),
        target_address: Some("10.0.0.5".to_string()),
        device_name: "printer-1".to_string(),
        device_uuid: Some("dev-1".to_string()),
        message_uuid: Some("msg-1".to_string()),
        result_url: Some("http://backend/results".to_string()),
        ..Message::default()
    }
}

fn dead_letters(dlq: &MemoryQueue) -> Vec<DeadLetterRecord> {
    dlq.ready_bodies()
        .iter()
        .map(|body| serde_json::from_str(body).unwrap())
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn scenario_a_job_recovers_on_third_attempt() {
    let h = harness(ScriptedTransport::failing_first(2), RetryPolicy::default());

    let report = h.processor.process_message(&job_message()).await;

    assert!(matches!(report.outcome, ProcessOutcome::Succeeded { attempts: 3 }));
    assert_eq!(h.transport.calls(), 3);
    assert_eq!(h.blobs.downloads.load(Ordering::SeqCst), 3);
    assert_eq!(h.sleeper.secs(), vec![15, 30]);
    assert_eq!(h.reporter.results().last().map(String::as_str), Some("SUCCESS"));
    assert!(h.dlq.is_empty());

    let delivered = h.transport.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, JobTransferRecord::new("part.stl", "HR PA 12"));
    assert_eq!(delivered[0].1, b"solid part\nendsolid part\n");
}

#[tokio::test]
async fn scenario_b_job_exhausts_retries_and_is_dead_lettered() {
    let h = harness(ScriptedTransport::always_failing(), RetryPolicy::default());

    let report = h.processor.process_message(&job_message()).await;

    assert!(matches!(report.outcome, ProcessOutcome::DeadLettered { attempts: 5, .. }));
    assert_eq!(h.transport.calls(), 5);
    assert_eq!(h.sleeper.secs(), vec![15, 30, 60, 120]);

    let results = h.reporter.results();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.starts_with("FAILURE: ")));

    let records = dead_letters(&h.dlq);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, MessageType::Job);
    assert_eq!(records[0].additional_info, "part.stl");
    assert_eq!(records[0].device_name, "printer-1");
    assert!(records[0].last_result.starts_with("FAILURE: "));
    assert!(records[0].last_result.contains("connection refused"));
}

#[tokio::test]
async fn first_attempt_success_reports_once() {
    let h = harness(ScriptedTransport::failing_first(0), RetryPolicy::default());

    let report = h.processor.process_message(&job_message()).await;

    assert!(matches!(report.outcome, ProcessOutcome::Succeeded { attempts: 1 }));
    assert_eq!(h.transport.calls(), 1);
    assert!(h.sleeper.secs().is_empty());
    assert_eq!(h.reporter.results(), vec!["SUCCESS".to_string()]);
    assert!(h.dlq.is_empty());
}

#[tokio::test]
async fn no_reports_without_result_url() {
    let h = harness(ScriptedTransport::always_failing(), RetryPolicy::new(2, 1));
    let msg = Message {
        result_url: None,
        ..job_message()
    };

    let report = h.processor.process_message(&msg).await;

    assert!(matches!(report.outcome, ProcessOutcome::DeadLettered { attempts: 2, .. }));
    assert!(h.reporter.results().is_empty());
}

#[tokio::test]
async fn unknown_type_has_no_side_effects() {
    let h = harness(ScriptedTransport::always_failing(), RetryPolicy::default());
    let msg = Message {
        kind: MessageType::Unknown,
        ..job_message()
    };

    let report = h.processor.process_message(&msg).await;

    assert!(matches!(report.outcome, ProcessOutcome::Skipped));
    assert_eq!(h.transport.calls(), 0);
    assert_eq!(h.blobs.downloads.load(Ordering::SeqCst), 0);
    assert!(h.sleeper.secs().is_empty());
    assert!(h.dlq.is_empty());
    // Origin still hears SUCCESS for a message nothing was done with
    assert_eq!(h.reporter.results(), vec!["SUCCESS".to_string()]);
}

#[tokio::test]
async fn backoff_doubles_from_configured_start() {
    let h = harness(ScriptedTransport::always_failing(), RetryPolicy::new(6, 2));

    h.processor.process_message(&job_message()).await;

    assert_eq!(h.sleeper.secs(), vec![2, 4, 8, 16, 32]);
    assert_eq!(dead_letters(&h.dlq).len(), 1);
}

#[tokio::test]
async fn additional_info_depends_on_type() {
    let h = harness(ScriptedTransport::always_failing(), RetryPolicy::new(1, 1));

    let heartbeat = Message {
        kind: MessageType::Heartbeat,
        content: Some("are you there?".to_string()),
        target_address: Some("10.0.0.9".to_string()),
        device_name: "printer-3".to_string(),
        ..Message::default()
    };
    let upload = Message {
        kind: MessageType::Upload,
        target_address: Some("10.0.0.7".to_string()),
        upload_info: Some("Identification".to_string()),
        upload_url: Some("http://backend/upload".to_string()),
        device_name: "printer-2".to_string(),
        ..Message::default()
    };

    h.processor.process_message(&heartbeat).await;
    h.processor.process_message(&upload).await;

    let infos: Vec<String> = dead_letters(&h.dlq)
        .into_iter()
        .map(|r| r.additional_info)
        .collect();
    assert_eq!(infos, vec!["are you there?".to_string(), "Identification".to_string()]);
}

#[tokio::test]
async fn validation_failures_consume_every_attempt() {
    let h = harness(ScriptedTransport::failing_first(0), RetryPolicy::default());
    let msg = Message {
        blob_key: None,
        ..job_message()
    };

    let report = h.processor.process_message(&msg).await;

    assert!(matches!(report.outcome, ProcessOutcome::DeadLettered { attempts: 5, .. }));
    assert_eq!(h.transport.calls(), 0);
    let records = dead_letters(&h.dlq);
    assert!(records[0].last_result.contains("s3name"));
}

#[tokio::test]
async fn failed_reports_are_returned_not_retried() {
    let scratch = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let dlq = Arc::new(MemoryQueue::new());
    let handlers = Arc::new(HandlerSet::new(
        Arc::new(MapBlobStore::with_blob("abc123", b"x")),
        Arc::new(ScriptedTransport::failing_first(1)),
        scratch.path(),
    ));
    let processor = MessageProcessor::new(queue, dlq, handlers, Arc::new(BrokenReporter), RetryPolicy::new(3, 1))
        .with_sleeper(Arc::new(RecordingSleeper::default()));

    let report = processor.process_message(&job_message()).await;

    assert!(matches!(report.outcome, ProcessOutcome::Succeeded { attempts: 2 }));
    assert_eq!(report.report_failures.len(), 2);
}

// ============================================================================
// Intake
// ============================================================================

#[tokio::test]
async fn poll_removes_entries_before_processing_completes() {
    let h = harness(ScriptedTransport::failing_first(0), RetryPolicy::default());
    h.queue.push(serde_json::to_string(&job_message()).unwrap());
    h.queue.push(r#"{"type":"HEARTBEAT","#);

    let report = h.processor.poll_once().await.unwrap();

    assert_eq!(report.received, 2);
    assert_eq!(report.malformed, 1);
    assert_eq!(report.remove_failures, 0);
    // Decoded entry is gone, the malformed one waits for redelivery
    assert_eq!(h.queue.ready_count(), 0);
    assert_eq!(h.queue.in_flight_count(), 1);

    for task in report.tasks {
        let result = task.await.unwrap();
        assert!(result.outcome.is_success());
    }
}

#[tokio::test]
async fn bounded_processor_still_runs_every_message() {
    let scratch = tempfile::tempdir().unwrap();
    let queue = Arc::new(MemoryQueue::new());
    let dlq = Arc::new(MemoryQueue::new());
    let transport = Arc::new(ScriptedTransport::failing_first(0));
    let handlers = Arc::new(HandlerSet::new(
        Arc::new(MapBlobStore::with_blob("abc123", b"x")),
        transport.clone(),
        scratch.path(),
    ));
    let processor = MessageProcessor::new(
        queue.clone(),
        dlq,
        handlers,
        Arc::new(RecordingReporter::default()),
        RetryPolicy::default(),
    )
    .with_max_in_flight(1);

    for _ in 0..4 {
        queue.push(serde_json::to_string(&job_message()).unwrap());
    }

    let report = processor.poll_once().await.unwrap();
    assert_eq!(report.tasks.len(), 4);
    for task in report.tasks {
        assert!(task.await.unwrap().outcome.is_success());
    }
    assert_eq!(transport.calls(), 4);
}

/// Dead-letter channel whose sends always fail.
struct UnreachableDeadLetters;

#[async_trait]
impl MessageBroker for UnreachableDeadLetters {
    async fn receive_messages(&self) -> Result<Vec<ReceivedEntry>, QueueError> {
        Ok(Vec::new())
    }

    async fn remove_message(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        Err(QueueError::UnknownHandle(handle.to_string()))
    }
}

#[async_trait]
impl DeadLetterChannel for UnreachableDeadLetters {
    async fn send_message(&self, _body: &str) -> Result<(), QueueError> {
        Err(QueueError::Io("dead-letter queue unreachable".to_string()))
    }
}

#[tokio::test]
async fn failed_dead_letter_send_is_returned_with_the_record() {
    let scratch = tempfile::tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::always_failing());
    let reporter = Arc::new(RecordingReporter::default());
    let sleeper = Arc::new(RecordingSleeper::default());
    let handlers = Arc::new(HandlerSet::new(
        Arc::new(MapBlobStore::with_blob("abc123", b"solid part\n")),
        transport.clone(),
        scratch.path(),
    ));
    let processor = MessageProcessor::new(
        Arc::new(MemoryQueue::new()),
        Arc::new(UnreachableDeadLetters),
        handlers,
        reporter.clone(),
        RetryPolicy::default(),
    )
    .with_sleeper(sleeper.clone());

    let report = processor.process_message(&job_message()).await;

    match report.outcome {
        ProcessOutcome::DeadLetterFailed { attempts, ref record, ref error } => {
            assert_eq!(attempts, 5);
            assert_eq!(record.kind, MessageType::Job);
            assert_eq!(record.additional_info, "part.stl");
            assert_eq!(record.device_name, "printer-1");
            assert!(record.last_result.starts_with("FAILURE: "));
            assert!(matches!(error, QueueError::Io(ref m) if m.contains("unreachable")));
        }
        other => panic!("expected a failed dead-letter send, got {other:?}"),
    }
    assert!(!report.outcome.is_success());
    assert_eq!(transport.calls(), 5);
    assert_eq!(sleeper.secs(), vec![15, 30, 60, 120]);

    let results = reporter.results();
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.starts_with("FAILURE: ")));
}
