mod nms;
pub mod camera;
pub mod overlay;
pub mod priority;
pub mod tracker;
#[cfg(feature = "vision-tflite")]
pub mod tflite;

use anyhow::Result;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// One labeled box from the detector, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub conf: f32,
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Detection {
    pub fn new(label: impl Into<String>, conf: f32, x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { label: label.into(), conf, x1, y1, x2, y2 }
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.x1 + self.x2).div_euclid(2), (self.y1 + self.y2).div_euclid(2))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub backend: String, // "tflite"
    pub model_path: String,

    pub img_w: u32,
    pub img_h: u32,
    pub class_names: Vec<String>,

    #[serde(default = "default_conf_threshold")]
    pub conf_threshold: f32,
    #[serde(default = "default_nms_iou")]
    pub nms_iou_threshold: f32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
}

fn default_conf_threshold() -> f32 { 0.4 }
fn default_nms_iou() -> f32 { 0.45 }
fn default_max_detections() -> usize { 32 }

/// Black-box classifier + localizer. Confidence filtering happens inside.
pub trait Detector: Send {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>>;
}

/// Ultralytics-style rows `[cx, cy, w, h, obj, cls0..]` normalized to the
/// model input, mapped back onto a `frame_w` x `frame_h` frame.
pub fn postprocess_ultralytics(
    raw: &[f32],
    num_preds: usize,
    class_names: &[String],
    conf_th: f32,
    frame_w: u32,
    frame_h: u32,
) -> Vec<Detection> {
    let num_classes = class_names.len();
    if num_classes == 0 { return Vec::new(); }
    let stride = 5 + num_classes;
    let (fw, fh) = (frame_w as f32, frame_h as f32);
    let mut out = Vec::new();

    for i in 0..num_preds {
        let base = i * stride;
        if base + stride > raw.len() { break; }
        let row = &raw[base..base + stride];

        let (best_c, best_p) = row[5..]
            .iter()
            .enumerate()
            .fold((0usize, 0.0f32), |acc, (c, &p)| if p > acc.1 { (c, p) } else { acc });
        let conf = row[4] * best_p;
        if conf < conf_th { continue; }

        let (cx, cy, w, h) = (row[0] * fw, row[1] * fh, row[2] * fw, row[3] * fh);
        out.push(Detection {
            label: class_names[best_c].clone(),
            conf,
            x1: (cx - w / 2.0).clamp(0.0, fw) as i32,
            y1: (cy - h / 2.0).clamp(0.0, fh) as i32,
            x2: (cx + w / 2.0).clamp(0.0, fw) as i32,
            y2: (cy + h / 2.0).clamp(0.0, fh) as i32,
        });
    }
    out
}

pub fn nms_filter(mut dets: Vec<Detection>, iou_th: f32, max_det: usize) -> Vec<Detection> {
    dets.sort_by(|a, b| b.conf.partial_cmp(&a.conf).unwrap_or(std::cmp::Ordering::Equal));
    let mut kept: Vec<Detection> = Vec::new();

    'outer: for d in dets {
        for k in &kept {
            if k.label == d.label && nms::iou(&d, k) >= iou_th {
                continue 'outer;
            }
        }
        kept.push(d);
        if kept.len() >= max_det { break; }
    }
    kept
}
