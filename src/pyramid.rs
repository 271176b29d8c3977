use anyhow::{bail, Result};

use crate::image::Image;

#[derive(Clone, Debug)]
pub struct Pyramid {
    pub levels: Vec<Image>,
}

impl Pyramid {
    pub fn empty() -> Self {
        Self { levels: vec![] }
    }

    /// Compute up to `level_count` half-resolution levels below `frame`.
    /// Building stops early once the parent is smaller than 4x4, so the
    /// number of levels actually built is `self.levels.len()`.
    pub fn compute(&mut self, frame: &Image, level_count: usize) -> Result<()> {
        self.levels.clear();
        for i in 0..level_count {
            let parent = if i == 0 { frame } else { &self.levels[i - 1] };
            if parent.width < 4 || parent.height < 4 {
                break;
            }
            let mut child = Image::empty();
            downscale(parent, &mut child)?;
            self.levels.push(child);
        }
        Ok(())
    }
}

/// downscale the parent image and store the result in child
/// an odd trailing row or column of the parent is ignored
fn downscale(parent: &Image, child: &mut Image) -> Result<()> {
    let w = parent.width as i32;
    let h = parent.height as i32;
    if w < 2 || h < 2 {
        bail!("cannot downscale image with shape {w} x {h}");
    }

    let w_half = w / 2;
    let h_half = h / 2;
    child.data.clear();
    child.width = w_half as usize;
    child.height = h_half as usize;

    // prevent pixel out of bounds
    let v = |x: i32, y: i32| -> u16 { parent.value_clamped(x, y) as u16 };

    for y in 0..h_half {
        let y2 = 2 * y;
        for x in 0..w_half {
            let x2 = 2 * x;
            // 3x3 binomial kernel centered on the even pixel
            let value = v(x2, y2) / 4
                + (v(x2 + 1, y2) + v(x2 - 1, y2) + v(x2, y2 + 1) + v(x2, y2 - 1)) / 8
                + (v(x2 + 1, y2 + 1) + v(x2 - 1, y2 - 1) + v(x2 - 1, y2 + 1) + v(x2 + 1, y2 - 1))
                    / 16;
            child.data.push(value as u8);
        }
    }
    Ok(())
}
