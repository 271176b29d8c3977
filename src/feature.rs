use serde::Serialize;

use crate::my_types::*;

/// A feature point followed by the sparse flow tracker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackedPoint {
    pub point: Vector2d,
    /// displacement since the previous frame
    pub displacement: Vector2d,
}

impl TrackedPoint {
    pub fn seeded(point: Vector2d) -> Self {
        TrackedPoint {
            point,
            displacement: Vector2d::zeros(),
        }
    }
}

/// Result of tracking one frame: displacements of the points that survived
/// and a validity flag for every point that was tracked, in seeding order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FlowResult {
    pub flows: Vec<[f64; 2]>,
    pub valid: Vec<bool>,
}

impl FlowResult {
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn flow_vectors(&self) -> impl Iterator<Item = Vector2d> + '_ {
        self.flows.iter().map(|f| Vector2d::new(f[0], f[1]))
    }
}
