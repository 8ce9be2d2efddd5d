use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use serde::Deserialize;

use crate::Detection;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const COORD_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const FPS_COLOR: Rgb<u8> = Rgb([255, 255, 0]);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// TTF/OTF used for labels and HUD text. Boxes are drawn without it.
    pub font_path: Option<String>,
    pub text_px: f32,
    pub box_thickness: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self { font_path: None, text_px: 18.0, box_thickness: 2 }
    }
}

/// Per-frame status line content.
#[derive(Debug, Clone, PartialEq)]
pub struct Hud {
    pub lat: String,
    pub lon: String,
    pub fps: u32,
}

pub struct Overlay {
    font: Option<FontVec>,
    scale: PxScale,
    thickness: u32,
}

impl Overlay {
    pub fn new(cfg: &OverlayConfig) -> Result<Self> {
        let font = match &cfg.font_path {
            Some(p) => {
                let bytes = std::fs::read(p).with_context(|| format!("read overlay font {}", p))?;
                Some(FontVec::try_from_vec(bytes).map_err(|e| anyhow::anyhow!("parse overlay font {}: {}", p, e))?)
            }
            None => None,
        };
        Ok(Self { font, scale: PxScale::from(cfg.text_px), thickness: cfg.box_thickness.max(1) })
    }

    pub fn boxes_only() -> Self {
        Self { font: None, scale: PxScale::from(18.0), thickness: 2 }
    }

    pub fn draw_detections(&self, frame: &mut RgbImage, dets: &[Detection]) {
        for d in dets {
            for inset in 0..self.thickness as i32 {
                let w = (d.x2 - d.x1 - 2 * inset).max(1) as u32;
                let h = (d.y2 - d.y1 - 2 * inset).max(1) as u32;
                draw_hollow_rect_mut(frame, Rect::at(d.x1 + inset, d.y1 + inset).of_size(w, h), BOX_COLOR);
            }
            self.text(frame, BOX_COLOR, d.x1, d.y1 - 10, &d.label);
        }
    }

    pub fn draw_hud(&self, frame: &mut RgbImage, hud: &Hud) {
        self.text(frame, COORD_COLOR, 20, 40, &format!("Lat: {}", hud.lat));
        self.text(frame, COORD_COLOR, 20, 70, &format!("Lon: {}", hud.lon));
        self.text(frame, FPS_COLOR, 20, 110, &format!("FPS: {}", hud.fps));
    }

    // (x, baseline) like a classic putText origin
    fn text(&self, frame: &mut RgbImage, color: Rgb<u8>, x: i32, baseline: i32, s: &str) {
        if let Some(font) = &self.font {
            let top = baseline - self.scale.y as i32;
            draw_text_mut(frame, color, x, top, self.scale, font, s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boxes_are_drawn_without_a_font() {
        let mut frame = RgbImage::new(64, 48);
        let overlay = Overlay::boxes_only();
        overlay.draw_detections(&mut frame, &[Detection::new("crack", 0.9, 10, 10, 30, 30)]);
        assert_eq!(*frame.get_pixel(10, 10), BOX_COLOR);
        assert_eq!(*frame.get_pixel(11, 20), BOX_COLOR);
        assert_eq!(*frame.get_pixel(20, 20), Rgb([0, 0, 0]));
    }

    #[test]
    fn hud_without_font_leaves_frame_untouched() {
        let mut frame = RgbImage::new(64, 48);
        Overlay::boxes_only().draw_hud(&mut frame, &Hud { lat: "1".into(), lon: "2".into(), fps: 30 });
        assert!(frame.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn degenerate_and_offscreen_boxes_do_not_panic() {
        let mut frame = RgbImage::new(32, 32);
        let overlay = Overlay::boxes_only();
        overlay.draw_detections(&mut frame, &[
            Detection::new("pothole", 0.9, 5, 5, 5, 5),
            Detection::new("pothole", 0.9, -20, -20, 100, 100),
        ]);
    }

    #[test]
    fn missing_font_file_is_an_error() {
        let cfg = OverlayConfig { font_path: Some("/nonexistent/font.ttf".into()), ..Default::default() };
        assert!(Overlay::new(&cfg).is_err());
    }
}
