use crate::Detection;

pub fn iou(a: &Detection, b: &Detection) -> f32 {
    let ix_a = a.x1.max(b.x1);
    let iy_a = a.y1.max(b.y1);
    let ix_b = a.x2.min(b.x2);
    let iy_b = a.y2.min(b.y2);

    let iw = (ix_b - ix_a).max(0) as f32;
    let ih = (iy_b - iy_a).max(0) as f32;
    let inter = iw * ih;
    let area = |d: &Detection| ((d.x2 - d.x1).max(0) * (d.y2 - d.y1).max(0)) as f32;
    let union = area(a) + area(b) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}
