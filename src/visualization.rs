use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context as AnyhowContext, Result};
use chrono::Local;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect as DrawRect;
use serde::Serialize;

use crate::frame::Frame;
use crate::motion::MotionSummary;
use crate::my_types::Rect;

pub const GREEN: [u8; 3] = [0, 255, 0];
pub const RED: [u8; 3] = [255, 0, 0];
pub const ORANGE: [u8; 3] = [255, 165, 0];

/// Stroke width of the drawn rectangles
const THICKNESS: i32 = 2;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OverlayPrimitive {
    pub rect: Rect,
    pub label: String,
    pub color: [u8; 3],
}

/// Everything drawn on top of one frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FrameOverlay {
    pub frame_index: usize,
    pub primitives: Vec<OverlayPrimitive>,
}

impl FrameOverlay {
    pub fn new(frame_index: usize) -> Self {
        Self {
            frame_index,
            primitives: vec![],
        }
    }

    pub fn push_detection(
        &mut self,
        rect: Rect,
        object_type: &str,
        confidence: f64,
        speed: f64,
        is_running: bool,
    ) {
        let color = if is_running {
            ORANGE
        } else if object_type == "person" {
            GREEN
        } else {
            RED
        };
        self.primitives.push(OverlayPrimitive {
            rect,
            label: format!("{} {:.2} | Speed: {:.2}", object_type, confidence, speed),
            color,
        });
    }

    /// Adds the dominant motion region, if there is one.
    pub fn push_motion(&mut self, motion: &MotionSummary) {
        if let Some(rect) = motion.bounding_box {
            self.primitives.push(OverlayPrimitive {
                rect,
                label: format!("Speed: {:.1} px/frame", motion.speed),
                color: if motion.is_running { RED } else { GREEN },
            });
        }
    }

    /// Draw the rectangles onto a copy of `image`.
    ///
    /// The rendered frames carry no text: labels are only written to the
    /// overlay record (`overlays.jsonl` for [`ImageSequenceWriter`]).
    pub fn render(&self, image: &RgbImage) -> RgbImage {
        let mut canvas = image.clone();
        for primitive in &self.primitives {
            let bounds = clamp_to_canvas(primitive.rect, image.width(), image.height());
            for inset in 0..THICKNESS {
                let width = bounds.width as i32 - 2 * inset;
                let height = bounds.height as i32 - 2 * inset;
                if width <= 0 || height <= 0 {
                    break;
                }
                let rect = DrawRect::at(bounds.x + inset, bounds.y + inset)
                    .of_size(width as u32, height as u32);
                draw_hollow_rect_mut(&mut canvas, rect, Rgb(primitive.color));
            }
        }
        canvas
    }
}

/// Pull the corners of `rect` to just outside the canvas, so borders that are
/// off screen stay off screen and the drawn lines stay short.
fn clamp_to_canvas(rect: Rect, width: u32, height: u32) -> Rect {
    let margin = THICKNESS as i64 + 1;
    let x1 = (rect.x as i64).max(-margin);
    let y1 = (rect.y as i64).max(-margin);
    let x2 = (rect.x as i64 + rect.width as i64).min(width as i64 + margin);
    let y2 = (rect.y as i64 + rect.height as i64).min(height as i64 + margin);
    if x2 <= x1 || y2 <= y1 {
        return Rect::new(0, 0, 0, 0);
    }
    Rect::new(x1 as i32, y1 as i32, (x2 - x1) as u32, (y2 - y1) as u32)
}

/// Consumes annotated frames as the analysis goes.
pub trait AnnotatedFrameWriter {
    /// Prepare the output for a stream; returns where it is written, if anywhere.
    fn begin(&mut self, stream_name: &str) -> Result<Option<PathBuf>>;

    fn write(&mut self, frame: &Frame, overlay: &FrameOverlay) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Discards everything.
#[derive(Default)]
pub struct NullFrameWriter;

impl AnnotatedFrameWriter for NullFrameWriter {
    fn begin(&mut self, _stream_name: &str) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn write(&mut self, _frame: &Frame, _overlay: &FrameOverlay) -> Result<()> {
        Ok(())
    }
}

/// Writes `frame_NNNNNN.png` files and an `overlays.jsonl` label log into a
/// fresh `<stem>_<YYYYmmdd_HHMMSS>` folder under the output root.
pub struct ImageSequenceWriter {
    output_root: PathBuf,
    dir: Option<PathBuf>,
    overlays: Option<BufWriter<File>>,
}

impl ImageSequenceWriter {
    pub fn new(output_root: &Path) -> Self {
        Self {
            output_root: output_root.to_path_buf(),
            dir: None,
            overlays: None,
        }
    }
}

impl AnnotatedFrameWriter for ImageSequenceWriter {
    fn begin(&mut self, stream_name: &str) -> Result<Option<PathBuf>> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let dir = self.output_root.join(format!("{}_{}", stream_name, stamp));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create output folder {}", dir.display()))?;
        let overlays = File::create(dir.join("overlays.jsonl"))?;
        self.overlays = Some(BufWriter::new(overlays));
        self.dir = Some(dir.clone());
        Ok(Some(dir))
    }

    fn write(&mut self, frame: &Frame, overlay: &FrameOverlay) -> Result<()> {
        let (Some(dir), Some(overlays)) = (&self.dir, &mut self.overlays) else {
            anyhow::bail!("writer used before begin");
        };
        let path = dir.join(format!("frame_{:06}.png", frame.index));
        overlay
            .render(&frame.image)
            .save(&path)
            .with_context(|| format!("cannot write {}", path.display()))?;
        serde_json::to_writer(&mut *overlays, overlay)?;
        overlays.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut overlays) = self.overlays.take() {
            overlays.flush()?;
        }
        Ok(())
    }
}
