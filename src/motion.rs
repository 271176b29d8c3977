use std::collections::VecDeque;

use serde::Serialize;

use crate::config::Config;
use crate::contours::DominantRegion;
use crate::feature::FlowResult;
use crate::my_types::*;

/// Mean flow magnitude (px/frame) at or below which a still scene is stationary
const STATIONARY_MAX_SPEED: f64 = 1.;
/// directions needed before a trajectory can be called erratic
const ERRATIC_MIN_SAMPLES: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Stationary,
    Walking,
    Running,
    Erratic,
}

/// Frame-level motion, built once per frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MotionSummary {
    pub is_moving: bool,
    pub is_running: bool,
    /// mean flow magnitude in px/frame
    pub speed: f64,
    /// mean flow displacement in px/frame
    pub direction: [f64; 2],
    pub contour_area: f64,
    pub bounding_box: Option<Rect>,
}

impl MotionSummary {
    pub fn still() -> Self {
        MotionSummary {
            is_moving: false,
            is_running: false,
            speed: 0.,
            direction: [0., 0.],
            contour_area: 0.,
            bounding_box: None,
        }
    }
}

#[derive(Debug)]
pub struct MotionClassifier {
    running_threshold: f64,
    history_size: usize,
    erratic_coherence: f64,
    /// unit directions of recent frames with flow
    directions: VecDeque<Vector2d>,
}

impl MotionClassifier {
    pub fn new(config: &Config) -> Self {
        Self {
            running_threshold: config.motion_running_threshold,
            history_size: config.direction_history,
            erratic_coherence: config.erratic_coherence,
            directions: VecDeque::with_capacity(config.direction_history),
        }
    }

    pub fn classify(&mut self, flow: &FlowResult, region: &DominantRegion) -> MotionSummary {
        let (speed, direction) = if flow.is_empty() {
            (0., Vector2d::zeros())
        } else {
            let n = flow.flows.len() as f64;
            let speed = flow.flow_vectors().map(|f| f.norm()).sum::<f64>() / n;
            let direction = flow.flow_vectors().sum::<Vector2d>() / n;
            (speed, direction)
        };

        if direction.norm() > 0. && self.history_size > 0 {
            if self.directions.len() == self.history_size {
                self.directions.pop_front();
            }
            self.directions.push_back(direction.normalize());
        }

        MotionSummary {
            is_moving: region.area > 0.,
            is_running: speed > self.running_threshold,
            speed,
            direction: [direction.x, direction.y],
            contour_area: region.area,
            bounding_box: region.bounding_box,
        }
    }

    /// Length of the mean of the recent unit directions: 1 for a straight
    /// trajectory, near 0 when the direction keeps changing.
    pub fn direction_coherence(&self) -> Option<f64> {
        if self.directions.len() < ERRATIC_MIN_SAMPLES {
            return None;
        }
        let mean = self.directions.iter().sum::<Vector2d>() / self.directions.len() as f64;
        Some(mean.norm())
    }

    pub fn movement_type(&self, summary: &MotionSummary) -> MovementType {
        if !summary.is_moving && summary.speed <= STATIONARY_MAX_SPEED {
            return MovementType::Stationary;
        }
        if summary.is_moving {
            if let Some(coherence) = self.direction_coherence() {
                if coherence < self.erratic_coherence {
                    return MovementType::Erratic;
                }
            }
        }
        if summary.is_running {
            MovementType::Running
        } else {
            MovementType::Walking
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(vectors: &[[f64; 2]]) -> FlowResult {
        FlowResult {
            flows: vectors.to_vec(),
            valid: vec![true; vectors.len()],
        }
    }

    fn region(area: f64) -> DominantRegion {
        DominantRegion {
            area,
            bounding_box: if area > 0. {
                Some(Rect::new(0, 0, 10, 10))
            } else {
                None
            },
        }
    }

    #[test]
    fn test_no_flow_is_still() {
        for threshold in [0., 1., 20.] {
            let mut config = Config::default();
            config.motion_running_threshold = threshold;
            let mut classifier = MotionClassifier::new(&config);
            let summary = classifier.classify(&FlowResult::default(), &region(0.));
            assert_eq!(summary.speed, 0.);
            assert!(!summary.is_running);
            assert!(!summary.is_moving);
            assert_eq!(summary.direction, [0., 0.]);
        }
    }

    #[test]
    fn test_mean_speed_and_direction() {
        let mut classifier = MotionClassifier::new(&Config::default());
        let summary = classifier.classify(&flow(&[[3., 4.], [0., 10.]]), &region(900.));
        assert_eq!(summary.speed, 7.5);
        assert_eq!(summary.direction, [1.5, 7.]);
        assert!(summary.is_moving);
        assert!(!summary.is_running);
        assert_eq!(summary.contour_area, 900.);
        assert_eq!(summary.bounding_box, Some(Rect::new(0, 0, 10, 10)));
    }

    #[test]
    fn test_running_threshold_is_strict() {
        let mut config = Config::default();
        config.motion_running_threshold = 5.;
        let mut classifier = MotionClassifier::new(&config);
        assert!(!classifier.classify(&flow(&[[3., 4.]]), &region(0.)).is_running);
        assert!(classifier.classify(&flow(&[[3., 4.1]]), &region(0.)).is_running);
    }

    #[test]
    fn test_movement_types() {
        let mut classifier = MotionClassifier::new(&Config::default());
        let still = classifier.classify(&FlowResult::default(), &region(0.));
        assert_eq!(classifier.movement_type(&still), MovementType::Stationary);

        let walking = classifier.classify(&flow(&[[4., 0.]]), &region(1000.));
        assert_eq!(classifier.movement_type(&walking), MovementType::Walking);

        let running = classifier.classify(&flow(&[[30., 0.]]), &region(1000.));
        assert_eq!(classifier.movement_type(&running), MovementType::Running);
    }

    #[test]
    fn test_erratic_trajectory() {
        let mut classifier = MotionClassifier::new(&Config::default());
        let mut last = MotionSummary::still();
        for v in [[5., 0.], [-5., 0.], [0., 5.], [0., -5.]] {
            last = classifier.classify(&flow(&[v]), &region(1000.));
        }
        assert_eq!(classifier.direction_coherence(), Some(0.));
        assert_eq!(classifier.movement_type(&last), MovementType::Erratic);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut config = Config::default();
        config.direction_history = 3;
        let mut classifier = MotionClassifier::new(&config);
        for v in [[-5., 0.], [0., 5.], [5., 0.], [5., 0.], [5., 0.]] {
            classifier.classify(&flow(&[v]), &region(1000.));
        }
        assert_eq!(classifier.direction_coherence(), Some(1.));
    }
}
