//! Consent-gated storage tests on a real filesystem: writer, orchestrators,
//! migrator and reader wired together the way a feature pipeline does it.

use sp_common::{ConsentProvider, StorageConfig, TrackingConsent};
use sp_storage::files::list_batch_files_or_empty;
use sp_storage::format::read_events;
use sp_storage::{
    BatchFileOrchestrator, BatchReader, BatchWriter, BytesSerializer, ConsentAwareDataMigrator,
    ConsentAwareFileOrchestrator, DataReader, DataWriter, FileLockRegistry, FileOrchestrator,
    SequentialWorker,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

struct Storage {
    _temp_dir: TempDir,
    pending_dir: PathBuf,
    granted_dir: PathBuf,
    consent: ConsentProvider,
    granted: Arc<BatchFileOrchestrator>,
    writer: BatchWriter<String>,
    reader: BatchReader,
}

fn storage(initial: TrackingConsent, tweak: impl FnOnce(&mut StorageConfig)) -> Storage {
    let temp_dir = TempDir::new().unwrap();
    let mut config = StorageConfig::with_root(temp_dir.path().to_path_buf());
    config.recent_delay_ms = 0;
    tweak(&mut config);

    let locks = Arc::new(FileLockRegistry::new());
    let pending_dir = config.root_dir.join("logs-pending-v1");
    let granted_dir = config.root_dir.join("logs-v1");
    let pending = Arc::new(BatchFileOrchestrator::new(
        pending_dir.clone(),
        &config,
        locks.clone(),
    ));
    let granted = Arc::new(BatchFileOrchestrator::new(
        granted_dir.clone(),
        &config,
        locks.clone(),
    ));

    let consent = ConsentProvider::new(initial);
    let orchestrator = Arc::new(ConsentAwareFileOrchestrator::new(
        pending,
        granted.clone(),
        Arc::new(ConsentAwareDataMigrator::new(locks.clone())),
        Arc::new(SequentialWorker::spawn("logs-migration", 16).unwrap()),
        &consent,
        config.migration_timeout(),
    ));
    let writer = BatchWriter::new(
        orchestrator.clone(),
        Arc::new(BytesSerializer),
        locks.clone(),
        Arc::new(SequentialWorker::spawn("logs-writer", 1024).unwrap()),
        config.max_item_size,
    );
    let reader = BatchReader::new(orchestrator, locks);

    Storage {
        _temp_dir: temp_dir,
        pending_dir,
        granted_dir,
        consent,
        granted,
        writer,
        reader,
    }
}

fn drain_records(reader: &BatchReader) -> Vec<String> {
    let mut records = Vec::new();
    while let Some(batch) = reader.read_next_batch() {
        records.extend(
            batch
                .events
                .iter()
                .map(|e| String::from_utf8(e.data.clone()).unwrap()),
        );
        reader.on_batch_consumed(&batch.id);
    }
    records
}

fn count_files(dir: &Path) -> usize {
    list_batch_files_or_empty(dir).len()
}

fn records(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{{\"seq\":{}}}", i)).collect()
}

#[test]
fn pending_then_granted_moves_everything() {
    let s = storage(TrackingConsent::Pending, |_| {});
    for record in records(5) {
        s.writer.write(record);
    }
    assert!(s.writer.wait_idle(WAIT));
    assert!(count_files(&s.pending_dir) > 0);
    assert_eq!(count_files(&s.granted_dir), 0);

    s.consent.set_consent(TrackingConsent::Granted);

    assert_eq!(drain_records(&s.reader), records(5));
    assert_eq!(count_files(&s.pending_dir), 0);
}

#[test]
fn pending_then_not_granted_discards_everything() {
    let s = storage(TrackingConsent::Pending, |_| {});
    for record in records(3) {
        s.writer.write(record);
    }
    assert!(s.writer.wait_idle(WAIT));

    s.consent.set_consent(TrackingConsent::NotGranted);

    assert!(drain_records(&s.reader).is_empty());
    assert_eq!(count_files(&s.pending_dir), 0);
    assert_eq!(count_files(&s.granted_dir), 0);

    // Later consent does not resurrect anything.
    s.consent.set_consent(TrackingConsent::Granted);
    assert!(drain_records(&s.reader).is_empty());
}

/// Write `n` records from another thread and switch consent to `next`
/// while they are still arriving, polling the orchestrator so migrations
/// run alongside the writes.
fn write_across_consent_change(s: &Storage, n: usize, next: TrackingConsent) {
    std::thread::scope(|scope| {
        let producer = scope.spawn(|| {
            for record in records(n) {
                s.writer.write(record);
                std::thread::sleep(Duration::from_micros(200));
            }
        });
        while s.writer.stats().written < (n / 2) as u64 && !producer.is_finished() {
            std::thread::sleep(Duration::from_micros(100));
        }
        s.consent.set_consent(next);
        while !producer.is_finished() {
            s.reader.flushable_batches();
        }
        producer.join().unwrap();
    });
    assert!(s.writer.wait_idle(WAIT));
}

#[test]
fn writes_racing_a_grant_all_land_in_order() {
    let n = 200;
    let s = storage(TrackingConsent::Pending, |_| {});
    write_across_consent_change(&s, n, TrackingConsent::Granted);

    let stats = s.writer.stats();
    assert_eq!(stats.written, n as u64);
    assert_eq!(stats.dropped(), 0);
    assert_eq!(drain_records(&s.reader), records(n));
    assert_eq!(count_files(&s.pending_dir), 0);
    assert_eq!(count_files(&s.granted_dir), 0);
}

#[test]
fn writes_racing_a_refusal_leave_nothing() {
    let n = 200;
    let s = storage(TrackingConsent::Pending, |_| {});
    write_across_consent_change(&s, n, TrackingConsent::NotGranted);

    let stats = s.writer.stats();
    assert!(stats.written > 0);
    assert_eq!(stats.written + stats.dropped_unavailable, n as u64);
    assert_eq!(stats.dropped(), stats.dropped_unavailable);

    // Nothing written before or after the refusal is readable or on disk.
    assert!(drain_records(&s.reader).is_empty());
    assert_eq!(count_files(&s.pending_dir), 0);
    assert_eq!(count_files(&s.granted_dir), 0);
}

#[test]
fn not_granted_persists_nothing() {
    let s = storage(TrackingConsent::NotGranted, |_| {});
    for record in records(20) {
        s.writer.write(record);
    }
    assert!(s.writer.wait_idle(WAIT));

    assert!(!s.pending_dir.exists());
    assert!(!s.granted_dir.exists());
    assert_eq!(s.writer.stats().dropped_unavailable, 20);
}

#[test]
fn granted_data_survives_revocation() {
    let s = storage(TrackingConsent::Granted, |_| {});
    for record in records(4) {
        s.writer.write(record);
    }
    assert!(s.writer.wait_idle(WAIT));

    s.consent.set_consent(TrackingConsent::NotGranted);
    s.writer.write("after revocation".to_string());
    assert!(s.writer.wait_idle(WAIT));

    assert_eq!(drain_records(&s.reader), records(4));
}

#[test]
fn size_cap_evicts_oldest_and_keeps_newest() {
    // Each record is 40 bytes + 6 bytes of framing, one per file.
    let cap = 200u64;
    let s = storage(TrackingConsent::Granted, |c| {
        c.recent_delay_ms = 60_000;
        c.max_items_per_batch = 1;
        c.max_batch_size = 100;
        c.max_disk_space = cap;
    });
    let all: Vec<String> = (0..10).map(|i| format!("{:040}", i)).collect();
    for record in &all {
        s.writer.write(record.clone());
    }
    assert!(s.writer.wait_idle(WAIT));

    let status = s.granted.status();
    assert!(status.total_bytes <= cap, "total {} over cap", status.total_bytes);
    assert!(status.file_count < all.len());

    let files = s.granted.get_all_files();
    let newest = files.last().unwrap();
    let events = read_events(newest).unwrap();
    assert_eq!(events[0].data, all.last().unwrap().as_bytes());

    // What survived is a contiguous tail of what was written.
    let kept: Vec<Vec<u8>> = files
        .iter()
        .flat_map(|f| read_events(f).unwrap())
        .map(|e| e.data)
        .collect();
    let expected_tail: Vec<Vec<u8>> = all[all.len() - kept.len()..]
        .iter()
        .map(|r| r.as_bytes().to_vec())
        .collect();
    assert_eq!(kept, expected_tail);
}

#[test]
fn file_reaching_exact_size_limit_rolls_over() {
    // 10-byte records frame to 16 bytes; three fill a 48-byte file exactly.
    let s = storage(TrackingConsent::Granted, |c| {
        c.recent_delay_ms = 60_000;
        c.max_batch_size = 48;
        c.max_item_size = 16;
    });
    for i in 0..4 {
        s.writer.write(format!("record-{:03}", i));
    }
    assert!(s.writer.wait_idle(WAIT));

    let files = s.granted.get_all_files();
    assert_eq!(files.len(), 2);
    assert_eq!(std::fs::metadata(&files[0]).unwrap().len(), 48);
    assert_eq!(read_events(&files[0]).unwrap().len(), 3);
    assert_eq!(read_events(&files[1]).unwrap().len(), 1);
}

#[test]
fn drop_all_ignores_consent() {
    let s = storage(TrackingConsent::Pending, |_| {});
    for record in records(3) {
        s.writer.write(record);
    }
    assert!(s.writer.wait_idle(WAIT));
    std::fs::create_dir_all(&s.granted_dir).unwrap();
    std::fs::write(s.granted_dir.join(sp_storage::files::batch_file_name(1)), b"").unwrap();

    s.reader.drop_all();
    assert_eq!(count_files(&s.pending_dir), 0);
    assert_eq!(count_files(&s.granted_dir), 0);
}
