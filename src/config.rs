use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use clap::Parser;

/// Background modelling strategy of the motion isolator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackgroundKind {
    /// Per-pixel mixture of Gaussians.
    Mog2,
    /// Per-pixel nearest-neighbour sample history.
    Knn,
    /// Plain difference against the previous frame.
    Diff,
}

impl FromStr for BackgroundKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "mog2" => Ok(BackgroundKind::Mog2),
            "knn" => Ok(BackgroundKind::Knn),
            "diff" | "none" => Ok(BackgroundKind::Diff),
            other => Err(format!("unknown background model: {other}")),
        }
    }
}

impl fmt::Display for BackgroundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackgroundKind::Mog2 => "mog2",
            BackgroundKind::Knn => "knn",
            BackgroundKind::Diff => "diff",
        };
        f.write_str(name)
    }
}

/// How detections are linked to the previous frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssociationKind {
    /// Greedy gated nearest-neighbour assignment with track ids.
    Nearest,
    /// `(class, rounded center)` lookup in a one-frame position table.
    Positional,
}

impl FromStr for AssociationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(AssociationKind::Nearest),
            "positional" => Ok(AssociationKind::Positional),
            other => Err(format!("unknown association strategy: {other}")),
        }
    }
}

impl fmt::Display for AssociationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssociationKind::Nearest => "nearest",
            AssociationKind::Positional => "positional",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, clap::Parser)]
pub struct Config {
    /// Seed of the sample replacement RNG used by the knn background model
    #[clap(long, default_value = "0")]
    pub seed: u64,

    /// Background model: mog2, knn or diff
    #[clap(long, default_value = "mog2")]
    pub background: BackgroundKind,

    #[clap(long, default_value = "50")]
    pub bg_history: usize,

    #[clap(long, default_value = "50")]
    pub mog2_var_threshold: f32,

    #[clap(long, default_value = "400")]
    pub knn_dist2_threshold: f32,

    /// Binarization threshold of the foreground mask
    #[clap(long, default_value = "25")]
    pub diff_threshold: u8,

    #[clap(long, default_value = "2")]
    pub dilate_iterations: u8,

    #[clap(long, default_value = "1.1")]
    pub blur_sigma: f32,

    /// Minimum contour area of the dominant motion region
    #[clap(long, default_value = "800")]
    pub min_area: f64,

    #[clap(long, default_value = "100")]
    pub max_corners: usize,

    #[clap(long, default_value = "0.3")]
    pub corner_quality: f64,

    #[clap(long, default_value = "7")]
    pub corner_min_distance: f64,

    #[clap(long, default_value = "7")]
    pub corner_block_size: usize,

    #[clap(long, default_value = "15")]
    pub lk_window: usize,

    #[clap(long, default_value = "2")]
    pub lk_levels: usize,

    #[clap(long, default_value = "10")]
    pub lk_iters: usize,

    #[clap(long, default_value = "0.03")]
    pub lk_epsilon: f64,

    /// Mean flow magnitude (px/frame) above which the scene counts as running
    #[clap(long, default_value = "20.0")]
    pub motion_running_threshold: f64,

    /// Per-object speed above which a detection counts as running
    #[clap(long, default_value = "2.5")]
    pub object_running_threshold: f64,

    /// Multiplier applied to per-object displacement per second
    #[clap(long, default_value = "30.0")]
    pub speed_scale: f64,

    #[clap(long, default_value = "5.0")]
    pub vehicle_speed_threshold: f64,

    /// Object association: nearest or positional
    #[clap(long, default_value = "nearest")]
    pub association: AssociationKind,

    #[clap(long, default_value = "100.0")]
    pub match_distance: f64,

    #[clap(long, default_value = "2")]
    pub max_missed_frames: usize,

    #[clap(long, default_value = "10")]
    pub direction_history: usize,

    #[clap(long, default_value = "0.5")]
    pub erratic_coherence: f64,

    /// Frame rate used when the source does not report one
    #[clap(long, default_value = "30")]
    pub fallback_fps: f64,

    #[clap(long, default_value = "5")]
    pub max_read_failures: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config::parse_from(["intruder-motion"])
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.bg_history == 0 {
            bail!("bg_history must be greater than zero");
        }
        if self.blur_sigma <= 0. {
            bail!("blur_sigma must be positive");
        }
        if self.lk_window < 3 || self.lk_window % 2 == 0 {
            bail!("lk_window must be an odd number >= 3");
        }
        if self.corner_block_size < 3 || self.corner_block_size % 2 == 0 {
            bail!("corner_block_size must be an odd number >= 3");
        }
        if !(0. ..=1.).contains(&self.corner_quality) {
            bail!("corner_quality must be within [0, 1]");
        }
        if self.speed_scale < 0. || self.match_distance < 0. {
            bail!("speed_scale and match_distance must be non-negative");
        }
        Ok(())
    }

    /// Frame rate to use for a source reporting `reported`, never below one.
    pub fn effective_fps(&self, reported: Option<f64>) -> f64 {
        let fps = reported
            .filter(|fps| fps.is_finite() && *fps > 0.)
            .unwrap_or(self.fallback_fps);
        fps.floor().max(1.)
    }
}
