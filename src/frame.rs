use anyhow::Result;
use image::{imageops, GrayImage, RgbImage};

use crate::image::Image;
use crate::pyramid::Pyramid;

/// One decoded color frame. Owned by the pipeline for a single iteration.
#[derive(Clone, Debug)]
pub struct Frame {
    /// 1-based position in the stream
    pub index: usize,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(index: usize, image: RgbImage) -> Self {
        Self { index, image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn to_gray(&self) -> GrayImage {
        imageops::grayscale(&self.image)
    }
}

#[derive(Clone, Debug)]
pub struct PyramidFrame {
    /// original image
    pub image: Image,
    /// downsized images
    pub pyramid: Pyramid,
}

impl PyramidFrame {
    pub fn new(image: Image, lk_levels: usize) -> Result<PyramidFrame> {
        let mut pyramid = Pyramid::empty();
        pyramid.compute(&image, lk_levels)?;
        Ok(PyramidFrame { image, pyramid })
    }

    pub fn from_gray(gray: &GrayImage, lk_levels: usize) -> Result<PyramidFrame> {
        Self::new(Image::from(gray), lk_levels)
    }

    /// Number of usable levels including the full resolution image
    pub fn level_count(&self) -> usize {
        self.pyramid.levels.len() + 1
    }

    pub fn get_image_at_level(&self, level: usize) -> &Image {
        if level == 0 {
            &self.image
        } else {
            &self.pyramid.levels[level - 1]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pyramid_frame_levels() {
        let gray = GrayImage::new(40, 40);
        let frame = PyramidFrame::from_gray(&gray, 2).unwrap();
        assert_eq!(frame.level_count(), 3);
        assert_eq!(frame.get_image_at_level(2).width, 10);
    }

    #[test]
    fn test_to_gray() {
        let frame = Frame::new(1, RgbImage::from_pixel(4, 2, image::Rgb([200, 200, 200])));
        let gray = frame.to_gray();
        assert_eq!(gray.dimensions(), (4, 2));
        assert_eq!(gray.get_pixel(0, 0)[0], 200);
    }
}
