use thiserror::Error;

/// Failures an analysis can run into. Only `SourceUnavailable` and
/// `EncodingFailure` stop the frame loop; the others are logged and the
/// analysis continues.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("cannot open frame source {path:?}: {reason}")]
    SourceUnavailable { path: String, reason: String },
    #[error("object detector failed on frame {frame_index}: {reason}")]
    InferenceFailure { frame_index: usize, reason: String },
    #[error("alert sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error("cannot write annotated output: {0}")]
    EncodingFailure(String),
}

/// Error of a single read from a frame source. End of stream is not an
/// error, sources report it as `Ok(None)`.
#[derive(Debug, Error)]
pub enum FrameReadError {
    #[error("transient read failure: {0}")]
    Transient(String),
    #[error(transparent)]
    Fatal(#[from] AnalysisError),
}
