use std::fmt;

use serde::Serialize;

use crate::config::Config;

const WEAPONS: [&str; 2] = ["knife", "pistol"];
const VEHICLES: [&str; 3] = ["car", "motorcycle", "truck"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatLevel {
    None,
    Low,
    Medium,
    High,
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ThreatLevel::None => "NONE",
            ThreatLevel::Low => "LOW",
            ThreatLevel::Medium => "MEDIUM",
            ThreatLevel::High => "HIGH",
        };
        write!(f, "{}", name)
    }
}

/// Maps an object and its motion to a threat level, first matching rule wins.
#[derive(Clone, Copy, Debug)]
pub struct ThreatScorer {
    vehicle_speed_threshold: f64,
}

impl Default for ThreatScorer {
    fn default() -> Self {
        Self {
            vehicle_speed_threshold: 5.,
        }
    }
}

impl ThreatScorer {
    pub fn new(config: &Config) -> Self {
        Self {
            vehicle_speed_threshold: config.vehicle_speed_threshold,
        }
    }

    pub fn score(&self, object_type: &str, speed: f64, is_running: bool) -> ThreatLevel {
        if WEAPONS.contains(&object_type) {
            ThreatLevel::High
        } else if VEHICLES.contains(&object_type) && speed > self.vehicle_speed_threshold {
            ThreatLevel::Medium
        } else if is_running {
            ThreatLevel::Low
        } else {
            ThreatLevel::None
        }
    }
}
