use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::my_types::*;

/// Class id of people in the detector's label set
pub const PERSON_CLASS: u32 = 0;

/// One box returned by the object detector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub bbox: BBox,
    /// in [0, 1]
    pub confidence: f64,
    pub class_id: u32,
}

impl DetectedObject {
    pub fn new(bbox: BBox, confidence: f64, class_id: u32) -> Self {
        Self {
            bbox,
            confidence: confidence.clamp(0., 1.),
            class_id,
        }
    }

    /// Parse a raw `[x1, y1, x2, y2, confidence, class_id]` row.
    pub fn from_row(row: &[f64]) -> Result<Self> {
        if row.len() < 6 {
            return Err(anyhow!("detection row needs 6 values, got {}", row.len()));
        }
        if row[5] < 0. {
            return Err(anyhow!("negative class id {}", row[5]));
        }
        Ok(Self::new(
            BBox::new(row[0], row[1], row[2], row[3]),
            row[4],
            row[5] as u32,
        ))
    }
}

/// Black-box object detector run once per frame.
///
/// An empty list is a valid answer. Errors are reported to the caller, which
/// treats them as a frame without detections.
pub trait ObjectDetector {
    fn name(&self) -> &'static str;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedObject>>;
}

/// Allow-list of the classes worth reporting, with their display names.
#[derive(Clone, Debug)]
pub struct ClassCatalog {
    names: BTreeMap<u32, String>,
}

impl Default for ClassCatalog {
    fn default() -> Self {
        Self::from_pairs(&[(PERSON_CLASS, "person"), (49, "knife"), (67, "pistol")])
    }
}

impl ClassCatalog {
    /// Wider set used for live feeds, vehicles and improvised weapons included
    pub fn extended() -> Self {
        Self::from_pairs(&[
            (PERSON_CLASS, "person"),
            (1, "bicycle"),
            (2, "car"),
            (3, "motorcycle"),
            (5, "truck"),
            (6, "bus"),
            (7, "train"),
            (8, "airplane"),
            (49, "knife"),
            (67, "pistol"),
            (70, "weapon"),
            (71, "bat"),
        ])
    }

    pub fn from_pairs(pairs: &[(u32, &str)]) -> Self {
        Self {
            names: pairs
                .iter()
                .map(|(id, name)| (*id, name.to_string()))
                .collect(),
        }
    }

    pub fn name(&self, class_id: u32) -> Option<&str> {
        self.names.get(&class_id).map(|s| s.as_str())
    }

    pub fn contains(&self, class_id: u32) -> bool {
        self.names.contains_key(&class_id)
    }

    /// Keep the detections of listed classes, in detector order
    pub fn filter(&self, detections: Vec<DetectedObject>) -> Vec<DetectedObject> {
        detections
            .into_iter()
            .filter(|d| self.contains(d.class_id))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ReplayLine {
    frame: usize,
    #[serde(default)]
    detections: Vec<Vec<f64>>,
}

/// Replays detector output recorded offline as JSON lines:
/// `{"frame": 3, "detections": [[x1, y1, x2, y2, conf, class], ...]}`.
pub struct ReplayDetector {
    frames: HashMap<usize, Vec<DetectedObject>>,
}

impl ReplayDetector {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("cannot open detections file {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut frames: HashMap<usize, Vec<DetectedObject>> = HashMap::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: ReplayLine = serde_json::from_str(&line)
                .context(format!("JSON deserialization failed for line {}", number + 1))?;
            let entry = frames.entry(parsed.frame).or_default();
            for row in &parsed.detections {
                match DetectedObject::from_row(row) {
                    Ok(detection) => entry.push(detection),
                    Err(err) => warn!("skipping detection on line {}: {}", number + 1, err),
                }
            }
        }
        Ok(Self { frames })
    }
}

impl ObjectDetector for ReplayDetector {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedObject>> {
        Ok(self.frames.get(&frame.index).cloned().unwrap_or_default())
    }
}

/// Returns a fixed list per call, in order. Once the script runs out every
/// frame is empty.
#[derive(Default)]
pub struct ScriptedDetector {
    script: std::collections::VecDeque<Result<Vec<DetectedObject>, String>>,
}

impl ScriptedDetector {
    pub fn new(frames: Vec<Vec<DetectedObject>>) -> Self {
        Self {
            script: frames.into_iter().map(Ok).collect(),
        }
    }

    /// Queue a failing inference call
    pub fn push_failure(&mut self, message: &str) {
        self.script.push_back(Err(message.to_string()));
    }

    pub fn push(&mut self, detections: Vec<DetectedObject>) {
        self.script.push_back(Ok(detections));
    }
}

impl ObjectDetector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<DetectedObject>> {
        match self.script.pop_front() {
            Some(Ok(detections)) => Ok(detections),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(vec![]),
        }
    }
}

/// A person found on a still image.
#[derive(Clone, Debug, Serialize)]
pub struct PersonDetection {
    pub bbox: [i32; 4],
    pub confidence: f64,
    pub class_id: u32,
    pub class_name: String,
    /// share of the image covered by the box, in percent
    pub area_percentage: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct IntrusionCheck {
    pub intrusion_detected: bool,
    pub person_count: usize,
    pub confidence_threshold: f64,
    pub detections: Vec<PersonDetection>,
}

/// Look for people on a single frame.
pub fn detect_intrusion(
    frame: &Frame,
    detector: &mut dyn ObjectDetector,
    catalog: &ClassCatalog,
    confidence_threshold: f64,
) -> Result<IntrusionCheck> {
    let image_area = (frame.width() as f64 * frame.height() as f64).max(1.);
    let detections: Vec<PersonDetection> = detector
        .detect(frame)
        .with_context(|| format!("{} detector failed on frame {}", detector.name(), frame.index))?
        .into_iter()
        .filter(|d| d.class_id == PERSON_CLASS && d.confidence >= confidence_threshold)
        .map(|d| {
            let rect = d.bbox.to_rect();
            PersonDetection {
                bbox: d.bbox.to_pixels(),
                confidence: d.confidence,
                class_id: d.class_id,
                class_name: catalog.name(d.class_id).unwrap_or("person").to_string(),
                area_percentage: rect.area() as f64 / image_area * 100.,
            }
        })
        .collect();

    Ok(IntrusionCheck {
        intrusion_detected: !detections.is_empty(),
        person_count: detections.len(),
        confidence_threshold,
        detections,
    })
}
