use rdscan_vision::priority::Priority;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::StoreError;

pub const LOG_HEADER: [&str; 6] = ["Image", "Label", "Priority", "Timestamp", "Latitude", "Longitude"];

#[derive(Debug, Serialize)]
pub struct PersistedRecord<'a> {
    #[serde(rename = "Image")]
    pub image: &'a str,
    #[serde(rename = "Label")]
    pub label: &'a str,
    #[serde(rename = "Priority")]
    pub priority: Priority,
    #[serde(rename = "Timestamp")]
    pub timestamp: &'a str,
    #[serde(rename = "Latitude")]
    pub latitude: &'a str,
    #[serde(rename = "Longitude")]
    pub longitude: &'a str,
}

/// Append-only CSV evidence log. The header goes in exactly once, when the
/// file is first created (or found empty); later runs only append rows.
#[derive(Debug, Clone)]
pub struct DetectionLog {
    path: PathBuf,
}

impl DetectionLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let log = Self { path: path.into() };
        log.write_rows(&[])?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, rec: &PersistedRecord<'_>) -> Result<(), StoreError> {
        self.write_rows(std::slice::from_ref(rec))
    }

    fn write_rows(&self, rows: &[PersistedRecord<'_>]) -> Result<(), StoreError> {
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let fresh = f.metadata()?.len() == 0;

        let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(&mut f);
        if fresh {
            w.write_record(LOG_HEADER)?;
        }
        for r in rows {
            w.serialize(r)?;
        }
        w.flush()?;
        Ok(())
    }
}
