use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::log::{DetectionLog, PersistedRecord};
use crate::{EnqueueError, LogEntry, StoreConfig, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub persisted: u64,
    pub image_failures: u64,
    pub log_failures: u64,
    pub dropped: u64,
}

enum Job {
    Entry(Box<LogEntry>),
    Shutdown,
}

/// Producer side of the persistence queue. Never blocks: when the queue is
/// at capacity the newest entry is rejected and counted.
#[derive(Clone)]
pub struct EntryQueue {
    tx: mpsc::Sender<Job>,
    dropped: Arc<AtomicU64>,
}

impl EntryQueue {
    fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, dropped: Arc::new(AtomicU64::new(0)) }, rx)
    }

    pub fn enqueue(&self, entry: LogEntry) -> Result<(), EnqueueError> {
        match self.tx.try_send(Job::Entry(Box::new(entry))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(Job::Entry(e))) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("store: queue full ({}), dropped {} ({} dropped so far)", self.tx.max_capacity(), e.filename, n);
                Err(EnqueueError::QueueFull)
            }
            Err(TrySendError::Full(Job::Shutdown)) => Err(EnqueueError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Single-consumer persistence pipeline: entries are written strictly in
/// submission order on a blocking thread, off the frame loop.
pub struct PersistenceWorker {
    queue: EntryQueue,
    task: JoinHandle<WorkerStats>,
}

impl PersistenceWorker {
    /// Must be called from within a tokio runtime.
    pub fn spawn(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let dir = PathBuf::from(&cfg.dir);
        std::fs::create_dir_all(&dir)?;
        let log = DetectionLog::open(dir.join(&cfg.log_file))?;
        info!("store: logging to {} (queue {})", log.path().display(), cfg.queue_capacity);

        let (queue, rx) = EntryQueue::bounded(cfg.queue_capacity);
        let consumer = Consumer {
            dir,
            log,
            attempts: cfg.write_attempts.max(1),
            stats: WorkerStats::default(),
        };
        let task = tokio::task::spawn_blocking(move || consumer.drain(rx));
        Ok(Self { queue, task })
    }

    pub fn enqueue(&self, entry: LogEntry) -> Result<(), EnqueueError> {
        self.queue.enqueue(entry)
    }

    pub fn queue(&self) -> &EntryQueue {
        &self.queue
    }

    /// Sends the sentinel and waits for everything queued before it to be
    /// written. Consumes the handle, so nothing can be enqueued afterwards.
    pub async fn shutdown(self) -> Result<WorkerStats, StoreError> {
        let Self { queue, task } = self;
        if queue.tx.send(Job::Shutdown).await.is_err() {
            warn!("store: consumer already stopped");
        }
        let mut stats = task.await.map_err(|e| StoreError::WorkerGone(e.to_string()))?;
        stats.dropped = queue.dropped();
        Ok(stats)
    }
}

struct Consumer {
    dir: PathBuf,
    log: DetectionLog,
    attempts: u32,
    stats: WorkerStats,
}

impl Consumer {
    fn drain(mut self, mut rx: mpsc::Receiver<Job>) -> WorkerStats {
        while let Some(job) = rx.blocking_recv() {
            match job {
                Job::Entry(entry) => self.persist(*entry),
                Job::Shutdown => break,
            }
        }
        debug!("store: consumer finished {:?}", self.stats);
        self.stats
    }

    // Failures are per entry: logged, counted, and the loop moves on.
    fn persist(&mut self, entry: LogEntry) {
        let (path, name) = unique_image_path(&self.dir, &entry.filename);
        let saved = with_attempts(self.attempts, || {
            entry.frame.save_with_format(&path, ImageFormat::Jpeg).map_err(StoreError::from)
        });
        if let Err(e) = saved {
            self.stats.image_failures += 1;
            warn!("store: image {} not written: {}", path.display(), e);
            // the encoder may have created the file before failing
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("store: partial image {} left behind: {}", path.display(), e);
                }
            }
        }

        let rec = PersistedRecord {
            image: &name,
            label: &entry.label,
            priority: entry.priority,
            timestamp: &entry.timestamp,
            latitude: &entry.latitude,
            longitude: &entry.longitude,
        };
        match with_attempts(self.attempts, || self.log.append(&rec)) {
            Ok(()) => {
                self.stats.persisted += 1;
                info!("store: stored {} | {} | {} | {}, {}", entry.label, entry.priority, entry.timestamp, entry.latitude, entry.longitude);
            }
            Err(e) => {
                self.stats.log_failures += 1;
                warn!("store: row for {} not appended: {}", name, e);
            }
        }
    }
}

fn with_attempts<T>(attempts: u32, mut op: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
    let mut n = 1;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if n < attempts => {
                debug!("store: attempt {}/{} failed: {}", n, attempts, e);
                n += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Same-second captures share a name; later ones get `_1`, `_2`, ...
fn unique_image_path(dir: &Path, filename: &str) -> (PathBuf, String) {
    let first = dir.join(filename);
    if !first.exists() {
        return (first, filename.to_string());
    }
    let (stem, ext) = match filename.rsplit_once('.') {
        Some((s, e)) => (s, format!(".{}", e)),
        None => (filename, String::new()),
    };
    let mut n = 1u32;
    loop {
        let name = format!("{}_{}{}", stem, n, ext);
        let path = dir.join(&name);
        if !path.exists() {
            return (path, name);
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rdscan_vision::priority::Priority;

    fn cfg(dir: &Path, capacity: usize) -> StoreConfig {
        StoreConfig {
            dir: dir.to_string_lossy().into_owned(),
            log_file: "detections_log.csv".into(),
            queue_capacity: capacity,
            write_attempts: 2,
        }
    }

    fn entry(stamp: &str, label: &str) -> LogEntry {
        let frame = RgbImage::from_pixel(8, 8, Rgb([90, 90, 90]));
        LogEntry::capture(&frame, stamp.to_string(), label, Priority::Low, "No Satellite".into(), "No Satellite".into())
    }

    fn rows(dir: &Path) -> Vec<csv::StringRecord> {
        let mut rdr = csv::Reader::from_path(dir.join("detections_log.csv")).unwrap();
        rdr.records().map(|r| r.unwrap()).collect()
    }

    #[tokio::test]
    async fn drains_in_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let worker = PersistenceWorker::spawn(&cfg(dir.path(), 64)).unwrap();
        for i in 0..20 {
            worker.enqueue(entry(&format!("20260307_0900{:02}", i), "crack")).unwrap();
        }
        let stats = worker.shutdown().await.unwrap();
        assert_eq!(stats, WorkerStats { persisted: 20, ..Default::default() });

        let rows = rows(dir.path());
        assert_eq!(rows.len(), 20);
        for (i, r) in rows.iter().enumerate() {
            let name = format!("capture_20260307_0900{:02}.jpg", i);
            assert_eq!(&r[0], name.as_str());
            assert_eq!(&r[2], "LOW");
            assert!(dir.path().join(&name).is_file());
        }
    }

    #[tokio::test]
    async fn thousand_rapid_enqueues_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let worker = PersistenceWorker::spawn(&cfg(dir.path(), 1024)).unwrap();
        for i in 0..1000 {
            let mut e = entry("20260307_090000", "pothole");
            e.timestamp = format!("{}", i);
            e.filename = format!("capture_{:04}.jpg", i);
            worker.enqueue(e).unwrap();
        }
        let stats = worker.shutdown().await.unwrap();
        assert_eq!(stats.persisted, 1000);
        assert_eq!(stats.dropped, 0);

        let rows = rows(dir.path());
        assert_eq!(rows.len(), 1000);
        for (i, r) in rows.iter().enumerate() {
            assert_eq!(&r[3], i.to_string().as_str());
        }
        let mut names: Vec<&str> = rows.iter().map(|r| r.get(0).unwrap()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 1000);
    }

    #[tokio::test]
    async fn same_second_captures_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let worker = PersistenceWorker::spawn(&cfg(dir.path(), 8)).unwrap();
        for _ in 0..3 {
            worker.enqueue(entry("20260307_090501", "manhole")).unwrap();
        }
        worker.shutdown().await.unwrap();

        let names: Vec<String> = rows(dir.path()).iter().map(|r| r[0].to_string()).collect();
        assert_eq!(names, vec![
            "capture_20260307_090501.jpg",
            "capture_20260307_090501_1.jpg",
            "capture_20260307_090501_2.jpg",
        ]);
        for n in &names {
            assert!(dir.path().join(n).is_file());
        }
    }

    #[tokio::test]
    async fn image_failure_does_not_stop_the_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let worker = PersistenceWorker::spawn(&cfg(dir.path(), 8)).unwrap();

        let mut broken = entry("20260307_090501", "pothole");
        broken.filename = "missing_dir/capture_20260307_090501.jpg".into();
        worker.enqueue(broken).unwrap();
        worker.enqueue(entry("20260307_090502", "pothole")).unwrap();

        let stats = worker.shutdown().await.unwrap();
        assert_eq!(stats.image_failures, 1);
        assert_eq!(stats.persisted, 2);
        assert!(dir.path().join("capture_20260307_090502.jpg").is_file());
        assert_eq!(rows(dir.path()).len(), 2);
    }

    #[tokio::test]
    async fn failed_encode_leaves_no_partial_image() {
        let dir = tempfile::tempdir().unwrap();
        let worker = PersistenceWorker::spawn(&cfg(dir.path(), 8)).unwrap();

        let mut empty = entry("20260307_090501", "crack");
        empty.frame = RgbImage::new(0, 0);
        worker.enqueue(empty).unwrap();
        worker.enqueue(entry("20260307_090502", "crack")).unwrap();

        let stats = worker.shutdown().await.unwrap();
        assert_eq!(stats.image_failures, 1);
        assert_eq!(stats.persisted, 2);
        assert!(!dir.path().join("capture_20260307_090501.jpg").exists());
        assert!(dir.path().join("capture_20260307_090502.jpg").is_file());
    }

    #[tokio::test]
    async fn restart_appends_without_second_header() {
        let dir = tempfile::tempdir().unwrap();
        for run in 0..3 {
            let worker = PersistenceWorker::spawn(&cfg(dir.path(), 8)).unwrap();
            worker.enqueue(entry(&format!("20260307_09050{}", run), "crack")).unwrap();
            worker.shutdown().await.unwrap();
        }
        let text = std::fs::read_to_string(dir.path().join("detections_log.csv")).unwrap();
        assert_eq!(text.matches("Image,Label,Priority").count(), 1);
        assert_eq!(text.lines().count(), 4);
    }

    #[tokio::test]
    async fn full_queue_rejects_newest_entry() {
        let (queue, _rx) = EntryQueue::bounded(2);
        assert!(queue.enqueue(entry("a", "crack")).is_ok());
        assert!(queue.enqueue(entry("b", "crack")).is_ok());
        assert_eq!(queue.enqueue(entry("c", "crack")), Err(EnqueueError::QueueFull));
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn closed_queue_reports_closed() {
        let (queue, rx) = EntryQueue::bounded(2);
        drop(rx);
        assert_eq!(queue.enqueue(entry("a", "crack")), Err(EnqueueError::Closed));
    }

    #[test]
    fn attempts_retry_then_give_up() {
        let mut calls = 0;
        let res: Result<(), StoreError> = with_attempts(2, || {
            calls += 1;
            Err(StoreError::Io(std::io::Error::other("disk full")))
        });
        assert!(res.is_err());
        assert_eq!(calls, 2);

        let mut calls = 0;
        let res = with_attempts(3, || {
            calls += 1;
            if calls < 2 { Err(StoreError::Io(std::io::Error::other("busy"))) } else { Ok(calls) }
        });
        assert_eq!(res.unwrap(), 2);
    }
}
