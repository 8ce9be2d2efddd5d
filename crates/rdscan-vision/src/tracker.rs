use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Centers closer than this (pixels) may be the same defect.
    pub distance_px: f64,
    /// A sighting only suppresses repeats for this long.
    pub window_s: f64,
    pub max_history: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { distance_px: 80.0, window_s: 10.0, max_history: 50 }
    }
}

impl DedupConfig {
    /// Checks the thresholds and returns the window as a `Duration`.
    pub fn check(&self) -> Result<Duration> {
        anyhow::ensure!(
            self.distance_px.is_finite() && self.distance_px > 0.0,
            "dedup.distance_px must be a finite value > 0, got {}",
            self.distance_px
        );
        anyhow::ensure!(self.window_s > 0.0, "dedup.window_s must be > 0, got {}", self.window_s);
        anyhow::ensure!(self.max_history >= 1, "dedup.max_history must be >= 1");
        Duration::try_from_secs_f64(self.window_s)
            .with_context(|| format!("dedup.window_s out of range: {}", self.window_s))
    }
}

#[derive(Debug, Clone)]
pub struct Sighting {
    pub cx: i32,
    pub cy: i32,
    pub label: String,
    pub seen_at: Instant,
}

/// Spatio-temporal duplicate filter over a bounded FIFO of accepted sightings.
///
/// Pixel centers are frame-relative, so this is an approximate clustering
/// test: the same defect re-arms once `window_s` has passed.
#[derive(Debug, Clone)]
pub struct DedupTracker {
    cfg: DedupConfig,
    window: Duration,
    history: VecDeque<Sighting>,
}

impl DedupTracker {
    pub fn new(cfg: DedupConfig) -> Result<Self> {
        let window = cfg.check()?;
        let history = VecDeque::with_capacity(cfg.max_history + 1);
        Ok(Self { cfg, window, history })
    }

    pub fn is_new_detection(&mut self, cx: i32, cy: i32, label: &str) -> bool {
        self.is_new_detection_at(cx, cy, label, Instant::now())
    }

    /// Returns false without touching history if a same-label sighting lies
    /// within the distance threshold and the time window. Otherwise records
    /// the sighting and returns true.
    pub fn is_new_detection_at(&mut self, cx: i32, cy: i32, label: &str, now: Instant) -> bool {
        let duplicate = self.history.iter().any(|s| {
            s.label == label
                && distance(cx, cy, s.cx, s.cy) < self.cfg.distance_px
                && now.saturating_duration_since(s.seen_at) < self.window
        });
        if duplicate {
            return false;
        }

        self.history.push_back(Sighting { cx, cy, label: label.to_string(), seen_at: now });
        while self.history.len() > self.cfg.max_history {
            self.history.pop_front();
        }
        true
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn history(&self) -> impl Iterator<Item = &Sighting> {
        self.history.iter()
    }
}

fn distance(x1: i32, y1: i32, x2: i32, y2: i32) -> f64 {
    let dx = f64::from(x1) - f64::from(x2);
    let dy = f64::from(y1) - f64::from(y2);
    dx.hypot(dy)
}
