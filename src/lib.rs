pub mod alert;
pub mod association;
pub mod background;
pub mod config;
pub mod contours;
pub mod detection;
pub mod detector;
pub mod error;
pub mod feature;
pub mod frame;
pub mod image;
pub mod motion;
pub mod my_types;
pub mod optical_flow;
pub mod pipeline;
pub mod pyramid;
pub mod source;
pub mod threat;
pub mod tracker;
pub mod visualization;

pub use crate::config::Config;
pub use crate::error::{AnalysisError, FrameReadError};
pub use crate::pipeline::{
    AnalysisStatus, AnnotatedDetection, FrameAnalysis, FrameAnalysisPipeline, VideoAnalysisReport,
};
