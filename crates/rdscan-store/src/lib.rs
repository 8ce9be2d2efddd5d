pub mod doctor;
pub mod log;
pub mod worker;

use image::RgbImage;
use rdscan_vision::priority::Priority;
use serde::Deserialize;
use time::{macros::format_description, OffsetDateTime};

pub use log::{DetectionLog, PersistedRecord, LOG_HEADER};
pub use worker::{EntryQueue, PersistenceWorker, WorkerStats};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("persistence worker gone: {0}")]
    WorkerGone(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("persistence queue full, entry dropped")]
    QueueFull,
    #[error("persistence worker closed")]
    Closed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for images and the CSV log.
    pub dir: String,
    pub log_file: String,
    pub queue_capacity: usize,
    /// Tries per image write / row append before giving up on it.
    pub write_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: ".".into(),
            log_file: "detections_log.csv".into(),
            queue_capacity: 256,
            write_attempts: 2,
        }
    }
}

/// One accepted detection on its way to disk. Owns a private copy of the
/// frame so later overlay drawing on the live frame never reaches the file.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub frame: RgbImage,
    pub filename: String,
    pub label: String,
    pub priority: Priority,
    pub timestamp: String,
    pub latitude: String,
    pub longitude: String,
}

impl LogEntry {
    pub fn capture(
        frame: &RgbImage,
        timestamp: String,
        label: &str,
        priority: Priority,
        latitude: String,
        longitude: String,
    ) -> Self {
        Self {
            frame: frame.clone(),
            filename: image_filename(&timestamp),
            label: label.to_string(),
            priority,
            timestamp,
            latitude,
            longitude,
        }
    }
}

pub fn image_filename(timestamp: &str) -> String {
    format!("capture_{}.jpg", timestamp)
}

/// `YYYYMMDD_HHMMSS`
pub fn capture_stamp(at: OffsetDateTime) -> String {
    at.format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

pub fn now_stamp() -> String {
    capture_stamp(OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()))
}
