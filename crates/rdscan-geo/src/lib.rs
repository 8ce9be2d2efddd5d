pub mod doctor;
pub mod gnss;

use serde::Deserialize;
use std::sync::{Arc, RwLock};

pub const NO_FIX_TEXT: &str = "No Satellite";
pub const READER_ERROR_TEXT: &str = "GPS Error";

#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("open positioning source {name}")]
    Open {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("read positioning source {name}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Last known position as seen by the positioning reader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeoState {
    Fix { lat: f64, lon: f64 },
    NoFix,
    ReaderError,
}

impl GeoState {
    pub fn lat_text(&self) -> String {
        match self {
            GeoState::Fix { lat, .. } => format!("{:.6}", lat),
            GeoState::NoFix => NO_FIX_TEXT.to_string(),
            GeoState::ReaderError => READER_ERROR_TEXT.to_string(),
        }
    }

    pub fn lon_text(&self) -> String {
        match self {
            GeoState::Fix { lon, .. } => format!("{:.6}", lon),
            GeoState::NoFix => NO_FIX_TEXT.to_string(),
            GeoState::ReaderError => READER_ERROR_TEXT.to_string(),
        }
    }
}

/// Shared coordinate snapshot. One writer (the reader task), any number of
/// readers; the lat/lon pair is always replaced as a unit.
#[derive(Debug, Clone)]
pub struct GeoSnapshot {
    inner: Arc<RwLock<GeoState>>,
}

impl Default for GeoSnapshot {
    fn default() -> Self {
        Self { inner: Arc::new(RwLock::new(GeoState::NoFix)) }
    }
}

impl GeoSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> GeoState {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, state: GeoState) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GnssConfig {
    pub source: String, // "nmea-serial" | "nmea-file"
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    pub file: Option<String>,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_sentence")]
    pub sentence: String,
}

fn default_device() -> String { "/dev/ttyAMA0".into() }
fn default_baud() -> u32 { 9600 }
fn default_read_timeout_ms() -> u64 { 1000 }
fn default_sentence() -> String { "$GPGGA".into() }
