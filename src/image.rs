use image::GrayImage;

use crate::my_types::*;

/// Row-major grayscale image storage
#[derive(Clone, Debug)]
pub struct Image {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl Image {
    /// Create an empty image
    pub fn empty() -> Image {
        Image {
            data: vec![],
            width: 0,
            height: 0,
        }
    }

    /// Create an image filled with a single value
    pub fn filled(width: usize, height: usize, value: u8) -> Image {
        Image {
            data: vec![value; width * height],
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline(always)]
    pub fn value(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline(always)]
    pub fn value_i32(&self, x: i32, y: i32) -> u8 {
        self.data[y as usize * self.width + x as usize]
    }

    /// Pixel value with coordinates clamped to the image borders
    #[inline(always)]
    pub fn value_clamped(&self, x: i32, y: i32) -> u8 {
        let x = x.clamp(0, self.width as i32 - 1);
        let y = y.clamp(0, self.height as i32 - 1);
        self.value_i32(x, y)
    }

    #[inline(always)]
    pub fn set_value(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.width + x] = value;
    }

    /// Copy `patch` into the image with its top-left corner at `(x, y)`.
    /// Pixels falling outside the image are skipped.
    pub fn set_sub_image_i32(&mut self, x: i32, y: i32, patch: &Image) {
        for py in 0..patch.height as i32 {
            for px in 0..patch.width as i32 {
                let (tx, ty) = (x + px, y + py);
                if tx < 0 || ty < 0 || tx >= self.width as i32 || ty >= self.height as i32 {
                    continue;
                }
                self.set_value(
                    tx as usize,
                    ty as usize,
                    patch.value(px as usize, py as usize),
                );
            }
        }
    }
}

impl From<&GrayImage> for Image {
    fn from(gray: &GrayImage) -> Self {
        Image {
            data: gray.as_raw().clone(),
            width: gray.width() as usize,
            height: gray.height() as usize,
        }
    }
}

/// Bilinear interpolation of the pixel value at a sub-pixel position.
/// Coordinates outside the image are clamped to the border.
pub fn bilinear(image: &Image, point: Vector2d) -> f64 {
    let x0 = point.x.floor();
    let y0 = point.y.floor();
    let ax = point.x - x0;
    let ay = point.y - y0;
    let (x0, y0) = (x0 as i32, y0 as i32);

    let v00 = image.value_clamped(x0, y0) as f64;
    let v10 = image.value_clamped(x0 + 1, y0) as f64;
    let v01 = image.value_clamped(x0, y0 + 1) as f64;
    let v11 = image.value_clamped(x0 + 1, y0 + 1) as f64;

    (1. - ay) * ((1. - ax) * v00 + ax * v10) + ay * ((1. - ax) * v01 + ax * v11)
}
