use image::RgbImage;
use std::time::Instant;
use tracing::{debug, warn};

use rdscan_geo::GeoSnapshot;
use rdscan_store::{now_stamp, EntryQueue, LogEntry};
use rdscan_vision::overlay::{Hud, Overlay};
use rdscan_vision::priority::{select_new_detection, Priority};
use rdscan_vision::tracker::DedupTracker;
use rdscan_vision::Detection;

#[derive(Debug, Clone)]
pub struct FrameReport {
    /// Label and priority handed to the persistence queue this frame.
    pub stored: Option<(String, Priority)>,
    pub hud: Hud,
}

/// Per-frame decisions of the field loop: dedup, at most one enqueue per
/// frame, overlay.
pub struct Pipeline {
    tracker: DedupTracker,
    geo: GeoSnapshot,
    overlay: Overlay,
    queue: EntryQueue,
    fps: FpsCounter,
}

impl Pipeline {
    pub fn new(tracker: DedupTracker, geo: GeoSnapshot, overlay: Overlay, queue: EntryQueue) -> Self {
        Self { tracker, geo, overlay, queue, fps: FpsCounter::default() }
    }

    pub fn process_frame(&mut self, frame: &mut RgbImage, dets: &[Detection]) -> FrameReport {
        let now = Instant::now();
        // boxes first: the evidence copy shows what was detected
        self.overlay.draw_detections(frame, dets);

        let geo = self.geo.get();
        let mut stored = None;
        if let Some((d, prio)) = select_new_detection(&mut self.tracker, dets, now) {
            let entry = LogEntry::capture(frame, now_stamp(), &d.label, prio, geo.lat_text(), geo.lon_text());
            match self.queue.enqueue(entry) {
                Ok(()) => {
                    debug!("pipeline: queued {} ({}) at {:?}", d.label, prio, d.center());
                    stored = Some((d.label.clone(), prio));
                }
                Err(e) => warn!("pipeline: {} not queued: {}", d.label, e),
            }
        }

        let hud = Hud { lat: geo.lat_text(), lon: geo.lon_text(), fps: self.fps.tick(now) };
        self.overlay.draw_hud(frame, &hud);
        FrameReport { stored, hud }
    }
}

#[derive(Debug, Default)]
pub struct FpsCounter {
    prev: Option<Instant>,
}

impl FpsCounter {
    pub fn tick(&mut self, now: Instant) -> u32 {
        let fps = match self.prev {
            Some(p) => {
                let dt = now.saturating_duration_since(p).as_secs_f64();
                if dt > 0.0 { (1.0 / dt).round() as u32 } else { 0 }
            }
            None => 0,
        };
        self.prev = Some(now);
        fps
    }
}
