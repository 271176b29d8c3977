use crate::image::Image;
use crate::my_types::*;

/// Shi-Tomasi corner detector used to seed the sparse flow tracker.
/// ref https://docs.opencv.org/4.x/d4/d8c/tutorial_py_shi_tomasi.html
#[derive(Clone, Debug)]
pub struct CornerDetector {
    max_corners: usize,
    quality_level: f64,
    min_distance: f64,
    block_size: usize,
    /// minimum eigenvalue response of the last processed image
    response: Vec<f64>,
}

impl CornerDetector {
    pub fn new(
        max_corners: usize,
        quality_level: f64,
        min_distance: f64,
        block_size: usize,
    ) -> Self {
        CornerDetector {
            max_corners,
            quality_level,
            min_distance,
            block_size,
            response: vec![],
        }
    }

    /// Return the strongest corners of `image`, strongest first.
    /// An image without texture yields no corners.
    pub fn detect(&mut self, image: &Image) -> Vec<Vector2d> {
        let w = image.width;
        let h = image.height;
        let r = self.block_size / 2;
        // sobel needs one pixel and the block window `r` more
        let border = r + 1;
        if self.max_corners == 0 || image.is_empty() || w <= 2 * border || h <= 2 * border {
            return vec![];
        }

        self.compute_response(image);

        let max_response = self.response.iter().cloned().fold(0., f64::max);
        if max_response <= 0. {
            return vec![];
        }
        let threshold = max_response * self.quality_level;

        let mut candidates = vec![];
        for y in border..h - border {
            for x in border..w - border {
                let v = self.response[y * w + x];
                if v <= threshold || v <= 0. {
                    continue;
                }
                if !self.is_local_max(x, y, w, h) {
                    continue;
                }
                candidates.push((v, x, y));
            }
        }
        // strongest first, scan order breaks ties
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let min_dist2 = self.min_distance.powi(2);
        let mut corners: Vec<Vector2d> = vec![];
        for (_, x, y) in candidates {
            let p = Vector2d::new(x as f64, y as f64);
            if corners
                .iter()
                .any(|c| (c - p).norm_squared() < min_dist2)
            {
                continue;
            }
            corners.push(p);
            if corners.len() >= self.max_corners {
                break;
            }
        }
        corners
    }

    fn is_local_max(&self, x: usize, y: usize, w: usize, h: usize) -> bool {
        let v = self.response[y * w + x];
        for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                if self.response[ny * w + nx] > v {
                    return false;
                }
            }
        }
        true
    }

    /// Minimum eigenvalue of the gradient covariance over a `block_size` window.
    fn compute_response(&mut self, image: &Image) {
        let w = image.width;
        let h = image.height;
        let n = w * h;
        let mut xx = vec![0f64; n];
        let mut yy = vec![0f64; n];
        let mut xy = vec![0f64; n];
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let (gx, gy) = sobel(image, x as i32, y as i32);
                xx[y * w + x] = gx * gx;
                yy[y * w + x] = gy * gy;
                xy[y * w + x] = gx * gy;
            }
        }
        let r = self.block_size / 2;
        let xx = box_sum(&xx, w, h, r);
        let yy = box_sum(&yy, w, h, r);
        let xy = box_sum(&xy, w, h, r);

        self.response.clear();
        self.response.resize(n, 0.);
        for i in 0..n {
            let a = xx[i] / 2.;
            let c = yy[i] / 2.;
            let b = xy[i];
            self.response[i] = (a + c) - ((a - c).powi(2) + b * b).sqrt();
        }
    }
}

fn sobel(image: &Image, x: i32, y: i32) -> (f64, f64) {
    let v = |dx: i32, dy: i32| image.value_i32(x + dx, y + dy) as f64;
    let gx = (v(1, -1) + 2. * v(1, 0) + v(1, 1)) - (v(-1, -1) + 2. * v(-1, 0) + v(-1, 1));
    let gy = (v(-1, 1) + 2. * v(0, 1) + v(1, 1)) - (v(-1, -1) + 2. * v(0, -1) + v(1, -1));
    (gx, gy)
}

/// Separable box filter, the window is truncated at the borders.
fn box_sum(values: &[f64], w: usize, h: usize, r: usize) -> Vec<f64> {
    let mut rows = vec![0f64; w * h];
    for y in 0..h {
        for x in 0..w {
            let x0 = x.saturating_sub(r);
            let x1 = (x + r).min(w - 1);
            rows[y * w + x] = values[y * w + x0..=y * w + x1].iter().sum();
        }
    }
    let mut out = vec![0f64; w * h];
    for y in 0..h {
        let y0 = y.saturating_sub(r);
        let y1 = (y + r).min(h - 1);
        for x in 0..w {
            out[y * w + x] = (y0..=y1).map(|yy| rows[yy * w + x]).sum();
        }
    }
    out
}
