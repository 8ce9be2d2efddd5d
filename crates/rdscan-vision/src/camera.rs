use anyhow::{Context, Result};
use image::{imageops::FilterType, RgbImage};
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CameraConfig {
    pub mode: String,   // "libcamera-jpeg" | "v4l2-mjpeg"
    #[serde(default = "default_device")]
    pub device: String, // /dev/video0 (v4l2)
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
}

fn default_device() -> String { "/dev/video0".into() }
fn default_width() -> u32 { 640 }
fn default_height() -> u32 { 480 }
fn default_fps() -> u32 { 30 }

/// Pull-model frame source. Every frame comes out as RGB8 at exactly
/// `width` x `height`.
pub struct Camera {
    cfg: CameraConfig,
}

impl Camera {
    pub fn new(cfg: CameraConfig) -> Result<Self> {
        anyhow::ensure!(cfg.width > 0 && cfg.height > 0, "camera size must be non-zero");
        match cfg.mode.as_str() {
            "libcamera-jpeg" | "v4l2-mjpeg" => Ok(Self { cfg }),
            other => anyhow::bail!("unknown camera.mode: {}", other),
        }
    }

    pub async fn capture(&self) -> Result<RgbImage> {
        let jpeg = capture_jpeg(&self.cfg).await?;
        decode_frame(&jpeg, self.cfg.width, self.cfg.height)
    }
}

pub fn decode_frame(jpeg: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let rgb = image::load_from_memory(jpeg).context("decode camera jpeg")?.to_rgb8();
    if rgb.dimensions() == (width, height) {
        return Ok(rgb);
    }
    Ok(image::imageops::resize(&rgb, width, height, FilterType::Triangle))
}

/// - libcamera-jpeg: `libcamera-still -n -t 1 --width .. --height .. -o -`
/// - v4l2-mjpeg: one MJPEG frame through `ffmpeg`
pub async fn capture_jpeg(cfg: &CameraConfig) -> Result<Vec<u8>> {
    match cfg.mode.as_str() {
        "libcamera-jpeg" => capture_libcamera(cfg).await,
        "v4l2-mjpeg" => capture_v4l2_ffmpeg(cfg).await,
        other => anyhow::bail!("unknown camera.mode: {}", other),
    }
}

async fn capture_libcamera(cfg: &CameraConfig) -> Result<Vec<u8>> {
    let mut cmd = Command::new("libcamera-still");
    cmd.args([
        "-n",
        "-t", "1",
        "--width", &cfg.width.to_string(),
        "--height", &cfg.height.to_string(),
        "-o", "-",
    ]);

    debug!("capture: libcamera-still");
    let out = cmd.output().await.context("run libcamera-still")?;
    anyhow::ensure!(out.status.success(), "libcamera-still failed");
    Ok(out.stdout)
}

async fn capture_v4l2_ffmpeg(cfg: &CameraConfig) -> Result<Vec<u8>> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args([
        "-hide_banner", "-loglevel", "error",
        "-f", "video4linux2",
        "-input_format", "mjpeg",
        "-framerate", &cfg.fps.to_string(),
        "-video_size", &format!("{}x{}", cfg.width, cfg.height),
        "-i", &cfg.device,
        "-vframes", "1",
        "-f", "image2pipe",
        "-vcodec", "mjpeg",
        "-",
    ]);

    debug!("capture: ffmpeg v4l2 {}", cfg.device);
    let out = cmd.output().await.context("run ffmpeg capture")?;
    anyhow::ensure!(out.status.success(), "ffmpeg capture failed");
    Ok(out.stdout)
}
