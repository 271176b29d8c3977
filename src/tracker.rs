use anyhow::Result;
use image::GrayImage;
use log::debug;

use crate::config::Config;
use crate::detector::CornerDetector;
use crate::feature::{FlowResult, TrackedPoint};
use crate::frame::{Frame, PyramidFrame};
use crate::optical_flow::OpticalFlow;

/// Follows a sparse set of corners from frame to frame and reports how far
/// each one moved.
pub struct SparseFlowTracker {
    detector: CornerDetector,
    optical_flow: OpticalFlow,
    lk_levels: usize,
    previous: Option<PyramidFrame>,
    points: Vec<TrackedPoint>,
}

impl SparseFlowTracker {
    pub fn new(config: &Config) -> Self {
        SparseFlowTracker {
            detector: CornerDetector::new(
                config.max_corners,
                config.corner_quality,
                config.corner_min_distance,
                config.corner_block_size,
            ),
            optical_flow: OpticalFlow::new(
                config.lk_window,
                config.lk_levels,
                config.lk_iters,
                config.lk_epsilon,
            ),
            lk_levels: config.lk_levels,
            previous: None,
            points: vec![],
        }
    }

    /// Points currently followed, with their last displacement.
    pub fn points(&self) -> &[TrackedPoint] {
        &self.points
    }

    pub fn track(&mut self, frame: &Frame) -> Result<FlowResult> {
        self.track_gray(&frame.to_gray())
    }

    pub fn track_gray(&mut self, gray: &GrayImage) -> Result<FlowResult> {
        let current = PyramidFrame::from_gray(gray, self.lk_levels)?;

        let previous = match self.previous.take() {
            Some(previous)
                if previous.image.width == current.image.width
                    && previous.image.height == current.image.height =>
            {
                previous
            }
            _ => {
                // nothing comparable to track against
                self.points = self.seed(&current);
                debug!("seeded {} flow points", self.points.len());
                self.previous = Some(current);
                return Ok(FlowResult::default());
            }
        };

        if self.points.is_empty() {
            self.points = self.seed(&previous);
            if self.points.is_empty() {
                self.previous = Some(current);
                return Ok(FlowResult::default());
            }
            debug!("re-seeded {} flow points", self.points.len());
        }

        let points0: Vec<_> = self.points.iter().map(|p| p.point).collect();
        let tracked = self.optical_flow.process(&previous, &current, &points0);

        let mut result = FlowResult::default();
        let mut survivors = vec![];
        for (point0, point1) in points0.iter().zip(tracked.iter()) {
            result.valid.push(point1.is_some());
            if let Some(point1) = point1 {
                let displacement = point1 - point0;
                result.flows.push([displacement.x, displacement.y]);
                survivors.push(TrackedPoint {
                    point: *point1,
                    displacement,
                });
            }
        }

        self.points = survivors;
        self.previous = Some(current);
        Ok(result)
    }

    fn seed(&mut self, frame: &PyramidFrame) -> Vec<TrackedPoint> {
        self.detector
            .detect(&frame.image)
            .into_iter()
            .map(TrackedPoint::seeded)
            .collect()
    }
}
