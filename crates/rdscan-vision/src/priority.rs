use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

use crate::tracker::DedupTracker;
use crate::Detection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classes worth logging, in scan order.
pub const PRIORITY_CLASSES: [(&str, Priority); 3] = [
    ("pothole", Priority::High),
    ("manhole", Priority::Medium),
    ("crack", Priority::Low),
];

pub fn priority_of(label: &str) -> Option<Priority> {
    PRIORITY_CLASSES.iter().find(|(l, _)| *l == label).map(|(_, p)| *p)
}

/// Picks at most one detection per frame: classes are scanned in priority
/// order and the first detection the tracker accepts as new wins. Labels
/// outside the table are never consulted.
pub fn select_new_detection<'a>(
    tracker: &mut DedupTracker,
    dets: &'a [Detection],
    now: Instant,
) -> Option<(&'a Detection, Priority)> {
    for (class, prio) in PRIORITY_CLASSES {
        for d in dets.iter().filter(|d| d.label == class) {
            let (cx, cy) = d.center();
            if tracker.is_new_detection_at(cx, cy, &d.label, now) {
                return Some((d, prio));
            }
        }
    }
    None
}
