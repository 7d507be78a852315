//! End-to-end pipeline tests: real directories, real worker threads, a
//! recording uploader in place of the network.

use sp_common::{
    ConsentProvider, PayloadFormat, SpoolConfig, StorageConfig, TrackingConsent, UploadConfig,
};
use sp_core::{feature_dirs, FeaturePipeline};
use sp_storage::files::list_batch_files_or_empty;
use sp_storage::BytesSerializer;
use sp_upload::{AlwaysReady, ReachabilityFlag, UploadStatus, Uploader};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Records every payload and answers with a fixed HTTP code.
struct RecordingUploader {
    payloads: Mutex<Vec<String>>,
    code: u16,
    latency: Duration,
}

impl RecordingUploader {
    fn answering(code: u16) -> Arc<Self> {
        Self::answering_after(code, Duration::ZERO)
    }

    fn answering_after(code: u16, latency: Duration) -> Arc<Self> {
        Arc::new(RecordingUploader {
            payloads: Mutex::new(Vec::new()),
            code,
            latency,
        })
    }

    fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }
}

impl Uploader for RecordingUploader {
    fn upload(&self, payload: &[u8]) -> UploadStatus {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        self.payloads
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(payload).into_owned());
        UploadStatus::from_http_code(self.code)
    }
}

fn config(temp_dir: &TempDir) -> SpoolConfig {
    SpoolConfig {
        storage: StorageConfig {
            recent_delay_ms: 50,
            payload_format: PayloadFormat::NewLine,
            ..StorageConfig::with_root(temp_dir.path().to_path_buf())
        },
        upload: UploadConfig {
            min_delay_ms: Some(10),
            default_delay_ms: Some(20),
            max_delay_ms: Some(100),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn uploaded_records(uploader: &RecordingUploader) -> Vec<String> {
    uploader
        .payloads()
        .iter()
        .flat_map(|p| p.split('\n').map(str::to_string).collect::<Vec<_>>())
        .collect()
}

#[test]
fn scheduled_uploads_deliver_in_order_after_consent() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(&temp_dir);
    let (pending_dir, granted_dir) = feature_dirs(&config, "logs");
    let consent = ConsentProvider::new(TrackingConsent::Pending);
    let uploader = RecordingUploader::answering(202);
    let pipeline: FeaturePipeline<String> = FeaturePipeline::new(
        "logs",
        config,
        &consent,
        Arc::new(BytesSerializer),
        uploader.clone(),
        Arc::new(AlwaysReady),
    )
    .unwrap();
    pipeline.start_uploads().unwrap();

    let records: Vec<String> = (0..6).map(|i| format!("{{\"seq\":{}}}", i)).collect();
    for record in &records {
        pipeline.writer().write(record.clone());
    }

    // Pending data stays on the device.
    assert!(pipeline.wait_for_writes(Duration::from_secs(10)));
    std::thread::sleep(Duration::from_millis(200));
    assert!(uploader.payloads().is_empty());
    assert!(!list_batch_files_or_empty(&pending_dir).is_empty());

    consent.set_consent(TrackingConsent::Granted);
    assert!(
        wait_for(Duration::from_secs(10), || uploaded_records(&uploader).len() == records.len()),
        "uploaded so far: {:?}",
        uploader.payloads()
    );
    assert_eq!(uploaded_records(&uploader), records);

    pipeline.stop();
    assert!(list_batch_files_or_empty(&pending_dir).is_empty());
    assert!(list_batch_files_or_empty(&granted_dir).is_empty());
}

#[test]
fn flush_sends_the_active_file_without_scheduler() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = config(&temp_dir);
    config.storage.recent_delay_ms = 60_000;
    config.storage.payload_format = PayloadFormat::JsonArray;
    let (_, granted_dir) = feature_dirs(&config, "rum");
    let uploader = RecordingUploader::answering(200);
    let pipeline: FeaturePipeline<String> = FeaturePipeline::new(
        "rum",
        config,
        &ConsentProvider::new(TrackingConsent::Granted),
        Arc::new(BytesSerializer),
        uploader.clone(),
        Arc::new(AlwaysReady),
    )
    .unwrap();

    pipeline.writer().write("\"a\"".to_string());
    pipeline.writer().write("\"b\"".to_string());
    let report = pipeline.flush();

    assert_eq!(report.uploaded, 1);
    assert_eq!(uploader.payloads(), vec!["[\"a\",\"b\"]"]);
    assert!(list_batch_files_or_empty(&granted_dir).is_empty());

    // Later writes open a fresh file.
    pipeline.writer().write("\"c\"".to_string());
    assert_eq!(pipeline.flush().uploaded, 1);
    assert_eq!(uploader.payloads().len(), 2);
}

#[test]
fn flush_during_writes_uploads_every_record_once() {
    const RECORDS: usize = 5_000;

    let temp_dir = TempDir::new().unwrap();
    let mut config = config(&temp_dir);
    config.storage.recent_delay_ms = 60_000;
    config.writer.queue_capacity = RECORDS;
    let (_, granted_dir) = feature_dirs(&config, "logs");
    let uploader = RecordingUploader::answering_after(200, Duration::from_millis(1));
    let pipeline: Arc<FeaturePipeline<String>> = Arc::new(
        FeaturePipeline::new(
            "logs",
            config,
            &ConsentProvider::new(TrackingConsent::Granted),
            Arc::new(BytesSerializer),
            uploader.clone(),
            Arc::new(AlwaysReady),
        )
        .unwrap(),
    );

    let producer = {
        let writer = pipeline.writer();
        std::thread::spawn(move || {
            for i in 0..RECORDS {
                writer.write(format!("r{}", i));
                if i % 64 == 0 {
                    std::thread::yield_now();
                }
            }
        })
    };
    while !producer.is_finished() {
        pipeline.flush();
    }
    producer.join().unwrap();
    pipeline.flush();

    let stats = pipeline.status().writer;
    assert_eq!(stats.written, RECORDS as u64);
    assert_eq!(stats.dropped(), 0);

    let mut uploaded = uploaded_records(&uploader);
    uploaded.sort();
    let mut expected: Vec<String> = (0..RECORDS).map(|i| format!("r{}", i)).collect();
    expected.sort();
    assert_eq!(uploaded.len(), RECORDS, "lost or duplicated records");
    assert_eq!(uploaded, expected);
    assert!(list_batch_files_or_empty(&granted_dir).is_empty());
}

#[test]
fn drop_all_does_not_wait_for_queued_writes() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(&temp_dir);
    let (_, granted_dir) = feature_dirs(&config, "logs");
    let pipeline: FeaturePipeline<String> = FeaturePipeline::new(
        "logs",
        config,
        &ConsentProvider::new(TrackingConsent::Granted),
        Arc::new(BytesSerializer),
        RecordingUploader::answering(200),
        Arc::new(AlwaysReady),
    )
    .unwrap();
    pipeline.writer().write("old".to_string());
    assert!(pipeline.wait_for_writes(Duration::from_secs(10)));

    pipeline.drop_all();
    assert!(list_batch_files_or_empty(&granted_dir).is_empty());

    // Writes queued after the drop land in a fresh file.
    pipeline.writer().write("new".to_string());
    assert!(pipeline.wait_for_writes(Duration::from_secs(10)));
    assert_eq!(list_batch_files_or_empty(&granted_dir).len(), 1);
}

#[test]
fn unreachable_network_keeps_batches() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(&temp_dir);
    let (_, granted_dir) = feature_dirs(&config, "traces");
    let reachability = Arc::new(ReachabilityFlag::new(false));
    let uploader = RecordingUploader::answering(200);
    let pipeline: FeaturePipeline<String> = FeaturePipeline::new(
        "traces",
        config,
        &ConsentProvider::new(TrackingConsent::Granted),
        Arc::new(BytesSerializer),
        uploader.clone(),
        reachability.clone(),
    )
    .unwrap();
    pipeline.start_uploads().unwrap();
    pipeline.writer().write("span".to_string());

    std::thread::sleep(Duration::from_millis(300));
    assert!(uploader.payloads().is_empty());
    assert_eq!(list_batch_files_or_empty(&granted_dir).len(), 1);

    reachability.set_reachable(true);
    assert!(wait_for(Duration::from_secs(10), || uploader.payloads().len() == 1));
    assert!(wait_for(Duration::from_secs(10), || {
        list_batch_files_or_empty(&granted_dir).is_empty()
    }));
}

#[test]
fn drop_all_and_stop_on_drop() {
    let temp_dir = TempDir::new().unwrap();
    let config = config(&temp_dir);
    let (pending_dir, granted_dir) = feature_dirs(&config, "logs");
    let consent = ConsentProvider::new(TrackingConsent::Granted);
    {
        let pipeline: FeaturePipeline<String> = FeaturePipeline::new(
            "logs",
            config.clone(),
            &consent,
            Arc::new(BytesSerializer),
            RecordingUploader::answering(200),
            Arc::new(AlwaysReady),
        )
        .unwrap();
        pipeline.writer().write("kept".to_string());
        assert!(pipeline.wait_for_writes(Duration::from_secs(10)));
        consent.set_consent(TrackingConsent::Pending);
        pipeline.writer().write("pending".to_string());
        // Dropped without stop(): the writer still drains.
    }
    assert_eq!(list_batch_files_or_empty(&granted_dir).len(), 1);
    assert_eq!(list_batch_files_or_empty(&pending_dir).len(), 1);

    let pipeline: FeaturePipeline<String> = FeaturePipeline::new(
        "logs",
        config,
        &consent,
        Arc::new(BytesSerializer),
        RecordingUploader::answering(200),
        Arc::new(AlwaysReady),
    )
    .unwrap();
    pipeline.drop_all();
    assert!(list_batch_files_or_empty(&granted_dir).is_empty());
    assert!(list_batch_files_or_empty(&pending_dir).is_empty());
}
