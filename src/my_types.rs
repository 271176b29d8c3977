use nalgebra as na;
use serde::{Deserialize, Serialize};

pub type Vector2d = na::Vector2<f64>;
pub type Matrix2d = na::Matrix2<f64>;
pub type Matrixd = na::DMatrix<f64>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub usize);

/// Axis-aligned rectangle in pixel coordinates, `(x, y)` is the top-left corner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from corner coordinates, `(x2, y2)` exclusive.
    pub fn from_corners(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        let (x1, x2) = (x1.min(x2), x1.max(x2));
        let (y1, y2) = (y1.min(y2), y1.max(y2));
        // the span of two i32 always fits a u32
        let width = (x2 as i64 - x1 as i64) as u32;
        let height = (y2 as i64 - y1 as i64) as u32;
        Self::new(x1, y1, width, height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Bounding box as reported by the object detector, `(x1, y1)` top-left and
/// `(x2, y2)` bottom-right in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn center(&self) -> Vector2d {
        Vector2d::new((self.x1 + self.x2) / 2., (self.y1 + self.y2) / 2.)
    }

    /// Integer pixel corners, truncated the way the annotations are drawn.
    pub fn to_pixels(&self) -> [i32; 4] {
        [
            self.x1 as i32,
            self.y1 as i32,
            self.x2 as i32,
            self.y2 as i32,
        ]
    }

    pub fn to_rect(&self) -> Rect {
        let [x1, y1, x2, y2] = self.to_pixels();
        Rect::from_corners(x1, y1, x2, y2)
    }
}
