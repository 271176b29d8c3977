use imageproc::contours::{find_contours, BorderType};
use imageproc::point::Point;

use crate::background::ForegroundMask;
use crate::my_types::Rect;

/// Largest connected moving blob of a mask.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DominantRegion {
    pub area: f64,
    pub bounding_box: Option<Rect>,
}

/// Picks the dominant moving region out of a foreground mask.
#[derive(Clone, Debug)]
pub struct ContourAggregator {
    min_area: f64,
}

impl ContourAggregator {
    pub fn new(min_area: f64) -> Self {
        Self { min_area }
    }

    /// Largest external contour with an area strictly above `min_area`.
    /// Contours come in border-following (raster) order and the first of
    /// equally large ones wins. `(0, None)` when nothing qualifies.
    pub fn find_dominant_region(&self, mask: &ForegroundMask) -> DominantRegion {
        let mut best = DominantRegion::default();
        for contour in find_contours::<i32>(mask) {
            // outermost borders only
            if contour.border_type != BorderType::Outer || contour.parent.is_some() {
                continue;
            }
            let area = contour_area(&contour.points);
            if area > self.min_area && area > best.area {
                best = DominantRegion {
                    area,
                    bounding_box: bounding_rect(&contour.points),
                };
            }
        }
        best
    }
}

/// Polygon area by the shoelace formula, points taken as pixel centers.
pub fn contour_area(points: &[Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.;
    }
    let mut twice_area = 0i64;
    for (i, p) in points.iter().enumerate() {
        let q = &points[(i + 1) % points.len()];
        twice_area += p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64;
    }
    twice_area.abs() as f64 / 2.
}

/// Inclusive pixel bounds of a point set.
pub fn bounding_rect(points: &[Point<i32>]) -> Option<Rect> {
    let first = points.first()?;
    let (mut x0, mut y0, mut x1, mut y1) = (first.x, first.y, first.x, first.y);
    for p in points {
        x0 = x0.min(p.x);
        y0 = y0.min(p.y);
        x1 = x1.max(p.x);
        y1 = y1.max(p.y);
    }
    Some(Rect::new(x0, y0, (x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32))
}
