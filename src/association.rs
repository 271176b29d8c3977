use std::collections::HashMap;

use log::debug;
use serde::Serialize;

use crate::config::{AssociationKind, Config};
use crate::detection::DetectedObject;
use crate::my_types::*;

/// Quantized identity of a detection: class plus rounded center.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PositionKey {
    pub class_id: u32,
    pub x: i64,
    pub y: i64,
}

impl PositionKey {
    pub fn of(detection: &DetectedObject) -> Self {
        let center = detection.bbox.center();
        PositionKey {
            class_id: detection.class_id,
            x: center.x.round() as i64,
            y: center.y.round() as i64,
        }
    }
}

/// Per-object motion estimate, aligned with the detections it was built from.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ObjectMotion {
    /// `None` with positional association
    pub track_id: Option<TrackId>,
    pub speed: f64,
    pub is_running: bool,
}

#[derive(Clone, Debug)]
struct Track {
    id: TrackId,
    class_id: u32,
    center: Vector2d,
    /// frames since the track was last matched
    missed: usize,
}

enum Strategy {
    /// One-frame memory keyed by `PositionKey`.
    Positional(HashMap<PositionKey, Vector2d>),
    Nearest {
        tracks: Vec<Track>,
        next_id: usize,
    },
}

/// Estimates per-object speed by matching each frame's detections against
/// the previous ones.
pub struct ObjectMotionAssociator {
    strategy: Strategy,
    fps: f64,
    speed_scale: f64,
    running_threshold: f64,
    match_distance: f64,
    max_missed_frames: usize,
}

impl ObjectMotionAssociator {
    pub fn new(config: &Config, fps: f64) -> Self {
        let strategy = match config.association {
            AssociationKind::Positional => Strategy::Positional(HashMap::new()),
            AssociationKind::Nearest => Strategy::Nearest {
                tracks: vec![],
                next_id: 0,
            },
        };
        ObjectMotionAssociator {
            strategy,
            fps: fps.max(1.),
            speed_scale: config.speed_scale,
            running_threshold: config.object_running_threshold,
            match_distance: config.match_distance,
            max_missed_frames: config.max_missed_frames,
        }
    }

    /// Process one frame of detections; the result is in detection order.
    pub fn associate(&mut self, detections: &[DetectedObject]) -> Vec<ObjectMotion> {
        let speeds = match &mut self.strategy {
            Strategy::Positional(table) => {
                let speeds = positional(table, detections);
                speeds.into_iter().map(|s| (None, s)).collect::<Vec<_>>()
            }
            Strategy::Nearest { tracks, next_id } => nearest(
                tracks,
                next_id,
                detections,
                self.match_distance,
                self.max_missed_frames,
            )
            .into_iter()
            .map(|(id, s)| (Some(id), s))
            .collect(),
        };

        speeds
            .into_iter()
            .map(|(track_id, distance)| {
                let speed = distance * self.speed_scale / self.fps;
                ObjectMotion {
                    track_id,
                    speed,
                    is_running: speed > self.running_threshold,
                }
            })
            .collect()
    }

    /// Keys of the position table, sorted. Empty with nearest-neighbour
    /// association.
    pub fn position_keys(&self) -> Vec<PositionKey> {
        match &self.strategy {
            Strategy::Positional(table) => {
                let mut keys: Vec<_> = table.keys().copied().collect();
                keys.sort();
                keys
            }
            Strategy::Nearest { .. } => vec![],
        }
    }

    pub fn active_tracks(&self) -> usize {
        match &self.strategy {
            Strategy::Positional(table) => table.len(),
            Strategy::Nearest { tracks, .. } => tracks.len(),
        }
    }
}

/// Returns the per-frame displacement of each detection, 0 for new keys.
fn positional(table: &mut HashMap<PositionKey, Vector2d>, detections: &[DetectedObject]) -> Vec<f64> {
    let mut next = HashMap::with_capacity(detections.len());
    let mut displacements = Vec::with_capacity(detections.len());
    for detection in detections {
        let key = PositionKey::of(detection);
        let center = detection.bbox.center();
        let displacement = match table.get(&key) {
            Some(previous) => (center - previous).norm(),
            None => 0.,
        };
        displacements.push(displacement);
        // later detections overwrite earlier ones on a key collision
        next.insert(key, center);
    }
    *table = next;
    displacements
}

/// Greedy nearest-neighbour assignment. Returns the track id and the
/// per-frame displacement of each detection.
fn nearest(
    tracks: &mut Vec<Track>,
    next_id: &mut usize,
    detections: &[DetectedObject],
    match_distance: f64,
    max_missed_frames: usize,
) -> Vec<(TrackId, f64)> {
    let centers: Vec<Vector2d> = detections.iter().map(|d| d.bbox.center()).collect();

    let mut candidates = vec![];
    for (ti, track) in tracks.iter().enumerate() {
        for (di, detection) in detections.iter().enumerate() {
            if detection.class_id != track.class_id {
                continue;
            }
            let distance = (centers[di] - track.center).norm();
            if distance <= match_distance {
                candidates.push((distance, ti, di));
            }
        }
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut track_match: Vec<Option<usize>> = vec![None; tracks.len()];
    let mut result: Vec<Option<(TrackId, f64)>> = vec![None; detections.len()];
    for (distance, ti, di) in candidates {
        if track_match[ti].is_some() || result[di].is_some() {
            continue;
        }
        track_match[ti] = Some(di);
        let frames_since_seen = (tracks[ti].missed + 1) as f64;
        result[di] = Some((tracks[ti].id, distance / frames_since_seen));
    }

    let mut survivors = Vec::with_capacity(tracks.len() + detections.len());
    for (track, matched) in tracks.drain(..).zip(track_match) {
        match matched {
            Some(di) => survivors.push(Track {
                center: centers[di],
                missed: 0,
                ..track
            }),
            None if track.missed < max_missed_frames => survivors.push(Track {
                missed: track.missed + 1,
                ..track
            }),
            None => debug!("track {:?} expired", track.id),
        }
    }

    let output = result
        .into_iter()
        .enumerate()
        .map(|(di, matched)| match matched {
            Some(m) => m,
            None => {
                let id = TrackId(*next_id);
                *next_id += 1;
                survivors.push(Track {
                    id,
                    class_id: detections[di].class_id,
                    center: centers[di],
                    missed: 0,
                });
                (id, 0.)
            }
        })
        .collect();

    *tracks = survivors;
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(cx: f64, cy: f64, class_id: u32) -> DetectedObject {
        DetectedObject::new(BBox::new(cx - 10., cy - 20., cx + 10., cy + 20.), 0.9, class_id)
    }

    fn config(association: AssociationKind) -> Config {
        let mut config = Config::default();
        config.association = association;
        config
    }

    #[test]
    fn test_speed_between_frames() {
        let mut associator = ObjectMotionAssociator::new(&config(AssociationKind::Nearest), 30.);
        let first = associator.associate(&[at(100., 100., 0)]);
        assert_eq!(first[0].speed, 0.);
        assert!(!first[0].is_running);

        let second = associator.associate(&[at(130., 100., 0)]);
        assert_eq!(second[0].speed, 30.);
        assert!(second[0].is_running);
        assert_eq!(second[0].track_id, first[0].track_id);
    }

    #[test]
    fn test_running_threshold_is_strict() {
        let mut config = config(AssociationKind::Nearest);
        config.object_running_threshold = 30.;
        let mut associator = ObjectMotionAssociator::new(&config, 30.);
        associator.associate(&[at(100., 100., 0)]);
        let motion = associator.associate(&[at(130., 100., 0)]);
        assert_eq!(motion[0].speed, 30.);
        assert!(!motion[0].is_running);
    }

    #[test]
    fn test_positional_same_key() {
        let mut associator =
            ObjectMotionAssociator::new(&config(AssociationKind::Positional), 30.);
        associator.associate(&[at(100.25, 100., 0)]);
        let motion = associator.associate(&[at(99.75, 100., 0)]);
        assert_eq!(motion[0].speed, 0.5);
        assert_eq!(motion[0].track_id, None);

        // a real move changes the key
        let moved = associator.associate(&[at(130., 100., 0)]);
        assert_eq!(moved[0].speed, 0.);
    }

    #[test]
    fn test_position_table_is_replaced() {
        let mut associator =
            ObjectMotionAssociator::new(&config(AssociationKind::Positional), 30.);
        let a = at(100., 100., 0);
        let b = at(300., 200., 49);
        associator.associate(&[a, b]);
        assert_eq!(
            associator.position_keys(),
            vec![PositionKey::of(&a), PositionKey::of(&b)]
        );

        associator.associate(&[a]);
        assert_eq!(associator.position_keys(), vec![PositionKey::of(&a)]);

        associator.associate(&[]);
        assert!(associator.position_keys().is_empty());
    }

    #[test]
    fn test_key_collision_keeps_later_detection() {
        let mut associator =
            ObjectMotionAssociator::new(&config(AssociationKind::Positional), 30.);
        associator.associate(&[at(100.25, 100., 0), at(99.75, 100., 0)]);
        assert_eq!(associator.active_tracks(), 1);
        let motion = associator.associate(&[at(99.75, 100., 0)]);
        assert_eq!(motion[0].speed, 0.);
    }

    #[test]
    fn test_classes_do_not_match() {
        let mut associator = ObjectMotionAssociator::new(&config(AssociationKind::Nearest), 30.);
        let first = associator.associate(&[at(100., 100., 0)]);
        let second = associator.associate(&[at(110., 100., 49)]);
        assert_eq!(second[0].speed, 0.);
        assert_ne!(second[0].track_id, first[0].track_id);
    }

    #[test]
    fn test_greedy_assignment() {
        let mut associator = ObjectMotionAssociator::new(&config(AssociationKind::Nearest), 30.);
        let first = associator.associate(&[at(100., 100., 0), at(200., 100., 0)]);
        // the second object moved close to where the first one was
        let second = associator.associate(&[at(210., 100., 0), at(105., 100., 0)]);
        assert_eq!(second[0].track_id, first[1].track_id);
        assert_eq!(second[0].speed, 10.);
        assert_eq!(second[1].track_id, first[0].track_id);
        assert_eq!(second[1].speed, 5.);
    }

    #[test]
    fn test_track_survives_short_gap() {
        let mut associator = ObjectMotionAssociator::new(&config(AssociationKind::Nearest), 30.);
        let first = associator.associate(&[at(100., 100., 0)]);
        associator.associate(&[]);
        associator.associate(&[]);
        assert_eq!(associator.active_tracks(), 1);
        let back = associator.associate(&[at(130., 100., 0)]);
        assert_eq!(back[0].track_id, first[0].track_id);
        assert_eq!(back[0].speed, 10.);
    }

    #[test]
    fn test_track_expires() {
        let mut associator = ObjectMotionAssociator::new(&config(AssociationKind::Nearest), 30.);
        let first = associator.associate(&[at(100., 100., 0)]);
        for _ in 0..3 {
            associator.associate(&[]);
        }
        assert_eq!(associator.active_tracks(), 0);
        let back = associator.associate(&[at(100., 100., 0)]);
        assert_ne!(back[0].track_id, first[0].track_id);
        assert_eq!(back[0].speed, 0.);
    }

    #[test]
    fn test_far_detection_spawns_track() {
        let mut associator = ObjectMotionAssociator::new(&config(AssociationKind::Nearest), 30.);
        associator.associate(&[at(100., 100., 0)]);
        let far = associator.associate(&[at(300., 100., 0)]);
        assert_eq!(far[0].speed, 0.);
        assert_eq!(associator.active_tracks(), 2);
    }
}
