use anyhow::{Context, Result};
use image::{ImageFormat, RgbImage};
use std::path::PathBuf;
use tracing::debug;

use rdscan_vision::overlay::Hud;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub sink: String, // "log" | "preview"
    pub preview_path: String,
    pub every_n_frames: u32,
    /// Stop the run after this many frames (bench drives).
    pub max_frames: Option<u64>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { sink: "log".into(), preview_path: "preview.jpg".into(), every_n_frames: 30, max_frames: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSignal {
    Continue,
    Quit,
}

/// Receives the annotated frame once per loop iteration.
pub trait DisplaySink {
    fn show(&mut self, frame: &RgbImage, hud: &Hud) -> Result<SinkSignal>;
}

pub fn from_config(cfg: &DisplayConfig) -> Result<Box<dyn DisplaySink>> {
    let every = u64::from(cfg.every_n_frames.max(1));
    match cfg.sink.as_str() {
        "log" => Ok(Box::new(LogSink { every, frames: 0, max_frames: cfg.max_frames })),
        "preview" => Ok(Box::new(PreviewSink {
            path: PathBuf::from(&cfg.preview_path),
            every,
            frames: 0,
            max_frames: cfg.max_frames,
        })),
        other => anyhow::bail!("unknown display.sink: {}", other),
    }
}

fn limit_reached(frames: u64, max_frames: Option<u64>) -> SinkSignal {
    match max_frames {
        Some(max) if frames >= max => SinkSignal::Quit,
        _ => SinkSignal::Continue,
    }
}

/// Headless rig: the HUD goes to the log.
pub struct LogSink {
    every: u64,
    frames: u64,
    max_frames: Option<u64>,
}

impl DisplaySink for LogSink {
    fn show(&mut self, _frame: &RgbImage, hud: &Hud) -> Result<SinkSignal> {
        self.frames += 1;
        if self.frames % self.every == 0 {
            debug!("frame {}: lat={} lon={} fps={}", self.frames, hud.lat, hud.lon, hud.fps);
        }
        Ok(limit_reached(self.frames, self.max_frames))
    }
}

/// Writes the annotated frame to a JPEG for a remote viewer. The file is
/// replaced by rename so readers never see a half-written image.
pub struct PreviewSink {
    path: PathBuf,
    every: u64,
    frames: u64,
    max_frames: Option<u64>,
}

impl DisplaySink for PreviewSink {
    fn show(&mut self, frame: &RgbImage, _hud: &Hud) -> Result<SinkSignal> {
        self.frames += 1;
        if self.frames % self.every == 0 {
            let tmp = self.path.with_extension("jpg.part");
            frame
                .save_with_format(&tmp, ImageFormat::Jpeg)
                .with_context(|| format!("write preview {}", tmp.display()))?;
            std::fs::rename(&tmp, &self.path).with_context(|| format!("publish preview {}", self.path.display()))?;
        }
        Ok(limit_reached(self.frames, self.max_frames))
    }
}
