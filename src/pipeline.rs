use std::time::Instant;

use indicatif::ProgressStyle;
use log::{debug, info, warn};
use serde::Serialize;
use tracing::{info_span, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::alert::{Alert, AlertSink};
use crate::association::ObjectMotionAssociator;
use crate::background::{foreground_count, BackgroundMotionIsolator};
use crate::config::Config;
use crate::contours::ContourAggregator;
use crate::detection::{ClassCatalog, DetectedObject, ObjectDetector, PERSON_CLASS};
use crate::error::{AnalysisError, FrameReadError};
use crate::frame::Frame;
use crate::motion::{MotionClassifier, MotionSummary, MovementType};
use crate::my_types::*;
use crate::source::FrameSource;
use crate::threat::{ThreatLevel, ThreatScorer};
use crate::tracker::SparseFlowTracker;
use crate::visualization::{AnnotatedFrameWriter, FrameOverlay};

/// One detected object of one frame with its motion.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnnotatedDetection {
    pub frame_index: usize,
    pub time_seconds: f64,
    pub bbox: [i32; 4],
    pub confidence: f64,
    pub is_running: bool,
    pub speed: f64,
    pub object_type: String,
    pub track_id: Option<TrackId>,
    pub threat_level: ThreatLevel,
}

/// Everything computed for one frame.
#[derive(Clone, Debug)]
pub struct FrameAnalysis {
    pub frame_index: usize,
    pub foreground_pixels: usize,
    pub motion: MotionSummary,
    pub movement: MovementType,
    pub detections: Vec<AnnotatedDetection>,
    pub overlay: FrameOverlay,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Success,
    Error,
    /// the analysis stopped early, detections so far are kept
    Partial,
}

#[derive(Clone, Debug, Serialize)]
pub struct VideoAnalysisReport {
    pub status: AnalysisStatus,
    pub intrusion_detected: bool,
    pub detections: Vec<AnnotatedDetection>,
    pub video_path: Option<String>,
    pub processing_time_seconds: f64,
    pub total_matching_class_count: usize,
    pub frames_processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl VideoAnalysisReport {
    /// Report of an analysis that could not start.
    pub fn failed(error: &AnalysisError) -> Self {
        Self {
            status: AnalysisStatus::Error,
            intrusion_detected: false,
            detections: vec![],
            video_path: None,
            processing_time_seconds: 0.,
            total_matching_class_count: 0,
            frames_processed: 0,
            message: Some(error.to_string()),
        }
    }
}

/// Analysis state of one stream at a time. `analyze` starts every stream from
/// a fresh background model, flow tracker, direction history and track table,
/// and leaves them fresh when it returns. The configuration, the catalog and
/// the alert sink carry over.
pub struct FrameAnalysisPipeline {
    config: Config,
    catalog: ClassCatalog,
    fps: f64,
    isolator: BackgroundMotionIsolator,
    tracker: SparseFlowTracker,
    contours: ContourAggregator,
    classifier: MotionClassifier,
    associator: ObjectMotionAssociator,
    scorer: ThreatScorer,
    sink: Option<Box<dyn AlertSink>>,
    video_reference: String,
}

impl FrameAnalysisPipeline {
    pub fn new(config: &Config, catalog: ClassCatalog) -> Self {
        let fps = config.effective_fps(None);
        FrameAnalysisPipeline {
            config: config.clone(),
            catalog,
            fps,
            isolator: BackgroundMotionIsolator::new(config),
            tracker: SparseFlowTracker::new(config),
            contours: ContourAggregator::new(config.min_area),
            classifier: MotionClassifier::new(config),
            associator: ObjectMotionAssociator::new(config, fps),
            scorer: ThreatScorer::new(config),
            sink: None,
            video_reference: String::new(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Frame rate of the stream. Resets object association.
    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps.max(1.);
        self.associator = ObjectMotionAssociator::new(&self.config, self.fps);
    }

    /// Forget everything learned from the frames seen so far.
    pub fn reset_stream(&mut self, fps: f64) {
        self.isolator = BackgroundMotionIsolator::new(&self.config);
        self.tracker = SparseFlowTracker::new(&self.config);
        self.classifier = MotionClassifier::new(&self.config);
        self.set_fps(fps);
    }

    /// Reference stored with every alert
    pub fn set_video_reference(&mut self, reference: &str) {
        self.video_reference = reference.to_string();
    }

    pub fn process_frame(&mut self, frame: &Frame, detections: Vec<DetectedObject>) -> FrameAnalysis {
        let mask = self.isolator.isolate(frame);
        let flow = self.tracker.track(frame).unwrap_or_else(|err| {
            warn!("flow tracking failed on frame {}: {:#}", frame.index, err);
            Default::default()
        });
        let region = self.contours.find_dominant_region(&mask);
        let motion = self.classifier.classify(&flow, &region);
        let movement = self.classifier.movement_type(&motion);

        let detections = self.catalog.filter(detections);
        let motions = self.associator.associate(&detections);

        let mut overlay = FrameOverlay::new(frame.index);
        let mut annotated = Vec::with_capacity(detections.len());
        for (detection, object_motion) in detections.iter().zip(motions) {
            let object_type = self
                .catalog
                .name(detection.class_id)
                .unwrap_or("unknown")
                .to_string();
            let threat_level =
                self.scorer
                    .score(&object_type, object_motion.speed, object_motion.is_running);
            let record = AnnotatedDetection {
                frame_index: frame.index,
                time_seconds: frame.index as f64 / self.fps,
                bbox: detection.bbox.to_pixels(),
                confidence: detection.confidence,
                is_running: object_motion.is_running,
                speed: object_motion.speed,
                object_type,
                track_id: object_motion.track_id,
                threat_level,
            };
            overlay.push_detection(
                detection.bbox.to_rect(),
                &record.object_type,
                record.confidence,
                record.speed,
                record.is_running,
            );
            self.emit_alert(&record);
            annotated.push(record);
        }
        overlay.push_motion(&motion);

        FrameAnalysis {
            frame_index: frame.index,
            foreground_pixels: foreground_count(&mask),
            motion,
            movement,
            detections: annotated,
            overlay,
        }
    }

    fn emit_alert(&mut self, record: &AnnotatedDetection) {
        let alert = Alert::new(
            &record.object_type,
            record.confidence,
            record.bbox,
            record.speed,
            record.is_running,
            record.threat_level,
            record.frame_index,
            &self.video_reference,
        );
        let Some(sink) = self.sink.as_mut() else {
            info!("alert (log only): {:?}", alert);
            return;
        };
        match sink.append(&alert) {
            Ok(()) => info!("alert saved: {:?}", alert),
            Err(err) => {
                warn!(
                    "{}, continuing log only",
                    AnalysisError::SinkUnavailable(format!("{:#}", err))
                );
                info!("alert (log only): {:?}", alert);
                self.sink = None;
            }
        }
    }

    /// Run the whole stream. Never fails: problems end up in the report's
    /// status and message.
    pub fn analyze(
        &mut self,
        source: &mut dyn FrameSource,
        detector: &mut dyn ObjectDetector,
        writer: &mut dyn AnnotatedFrameWriter,
    ) -> VideoAnalysisReport {
        let start = Instant::now();
        self.reset_stream(self.config.effective_fps(source.fps()));

        let mut report = VideoAnalysisReport {
            status: AnalysisStatus::Success,
            intrusion_detected: false,
            detections: vec![],
            video_path: None,
            processing_time_seconds: 0.,
            total_matching_class_count: 0,
            frames_processed: 0,
            message: None,
        };

        let stream_name = source.name();
        match writer.begin(&stream_name) {
            Ok(path) => {
                report.video_path = path.map(|p| p.display().to_string());
            }
            Err(err) => {
                let error = AnalysisError::EncodingFailure(format!("{:#}", err));
                warn!("{}", error);
                report.status = AnalysisStatus::Partial;
                report.message = Some(error.to_string());
                report.processing_time_seconds = start.elapsed().as_secs_f64();
                return report;
            }
        }
        info!(
            "analyzing {} at {} fps with the {} detector",
            stream_name,
            self.fps,
            detector.name()
        );
        let reference = report.video_path.clone().unwrap_or(stream_name);
        self.set_video_reference(&reference);

        let analysis_span = info_span!("analysis");
        analysis_span.pb_set_style(&ProgressStyle::default_bar());
        if let Some(count) = source.frame_count() {
            analysis_span.pb_set_length(count);
        }
        let analysis_span_enter = analysis_span.enter();

        let mut read_failures = 0;
        loop {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(FrameReadError::Transient(reason)) => {
                    read_failures += 1;
                    warn!("frame read failed ({} in a row): {}", read_failures, reason);
                    if read_failures >= self.config.max_read_failures {
                        warn!("too many read failures, ending stream");
                        break;
                    }
                    continue;
                }
                Err(FrameReadError::Fatal(error)) => {
                    warn!("{}", error);
                    report.status = if report.frames_processed > 0 {
                        AnalysisStatus::Partial
                    } else {
                        AnalysisStatus::Error
                    };
                    report.message = Some(error.to_string());
                    break;
                }
            };
            read_failures = 0;

            let detections = detector.detect(&frame).unwrap_or_else(|err| {
                let error = AnalysisError::InferenceFailure {
                    frame_index: frame.index,
                    reason: format!("{} detector: {:#}", detector.name(), err),
                };
                warn!("{}, no objects this frame", error);
                vec![]
            });

            let analysis = self.process_frame(&frame, detections);
            report.frames_processed += 1;
            report.total_matching_class_count += analysis
                .detections
                .iter()
                .filter(|d| self.catalog.name(PERSON_CLASS) == Some(d.object_type.as_str()))
                .count();
            debug!(
                "frame {}: {:?}, {} objects",
                frame.index,
                analysis.movement,
                analysis.detections.len()
            );

            let written = writer.write(&frame, &analysis.overlay);
            report.detections.extend(analysis.detections);
            if let Err(err) = written {
                let error = AnalysisError::EncodingFailure(format!("{:#}", err));
                warn!("{}", error);
                report.status = AnalysisStatus::Partial;
                report.message = Some(error.to_string());
                break;
            }

            Span::current().pb_inc(1);
        }

        std::mem::drop(analysis_span_enter);
        std::mem::drop(analysis_span);

        if let Err(err) = writer.finish() {
            let error = AnalysisError::EncodingFailure(format!("{:#}", err));
            warn!("{}", error);
            report.status = AnalysisStatus::Partial;
            report.message.get_or_insert(error.to_string());
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.flush() {
                warn!("{}", AnalysisError::SinkUnavailable(format!("{:#}", err)));
            }
        }

        self.reset_stream(self.fps);

        report.intrusion_detected = report.total_matching_class_count > 0;
        report.processing_time_seconds = start.elapsed().as_secs_f64();
        info!(
            "analyzed {} frames in {:.2}s, {} detections",
            report.frames_processed,
            report.processing_time_seconds,
            report.detections.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    use anyhow::{anyhow, Result};
    use image::{Rgb, RgbImage};

    use super::*;
    use crate::detection::ScriptedDetector;
    use crate::source::MemorySource;
    use crate::visualization::{ImageSequenceWriter, NullFrameWriter};

    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<Alert>>>);

    impl AlertSink for SharedSink {
        fn append(&mut self, alert: &Alert) -> Result<()> {
            self.0.borrow_mut().push(alert.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    impl AlertSink for BrokenSink {
        fn append(&mut self, _alert: &Alert) -> Result<()> {
            Err(anyhow!("database down"))
        }
    }

    #[derive(Default)]
    struct OverlayRecorder {
        overlays: Vec<FrameOverlay>,
    }

    impl AnnotatedFrameWriter for OverlayRecorder {
        fn begin(&mut self, _stream_name: &str) -> Result<Option<PathBuf>> {
            Ok(None)
        }

        fn write(&mut self, _frame: &Frame, overlay: &FrameOverlay) -> Result<()> {
            self.overlays.push(overlay.clone());
            Ok(())
        }
    }

    struct FailingWriter {
        written: usize,
    }

    impl AnnotatedFrameWriter for FailingWriter {
        fn begin(&mut self, _stream_name: &str) -> Result<Option<PathBuf>> {
            Ok(None)
        }

        fn write(&mut self, _frame: &Frame, _overlay: &FrameOverlay) -> Result<()> {
            self.written += 1;
            if self.written > 1 {
                return Err(anyhow!("disk full"));
            }
            Ok(())
        }
    }

    fn person_at(x: f64) -> DetectedObject {
        DetectedObject::new(BBox::new(x, 40., x + 20., 80.), 0.9, 0)
    }

    fn blank_frames(n: usize) -> Vec<RgbImage> {
        vec![RgbImage::from_pixel(160, 120, Rgb([40, 40, 40])); n]
    }

    #[test]
    fn test_person_moving_across_frames() {
        let mut source = MemorySource::new("walk", Some(30.), blank_frames(3));
        let mut detector = ScriptedDetector::new(vec![
            vec![person_at(10.)],
            vec![person_at(50.)],
            vec![person_at(90.)],
        ]);
        let alerts = SharedSink::default();
        let mut pipeline = FrameAnalysisPipeline::new(&Config::default(), ClassCatalog::default())
            .with_sink(Box::new(alerts.clone()));
        let report = pipeline.analyze(&mut source, &mut detector, &mut NullFrameWriter);

        assert_eq!(report.status, AnalysisStatus::Success);
        assert_eq!(report.frames_processed, 3);
        assert_eq!(report.detections.len(), 3);
        assert_eq!(report.detections[0].speed, 0.);
        assert!(report.detections[1].speed > 0.);
        assert!(report.detections[2].speed > 0.);
        assert_eq!(report.detections[1].speed, 40.);
        assert!(report.detections[1].is_running);
        assert_eq!(report.detections[1].threat_level, ThreatLevel::Low);
        assert_eq!(report.detections[2].time_seconds, 3. / 30.);
        assert_eq!(report.total_matching_class_count, 3);
        assert!(report.intrusion_detected);
        assert_eq!(alerts.0.borrow().len(), 3);
        assert_eq!(alerts.0.borrow()[0].video_reference, "walk");
    }

    #[test]
    fn test_catalog_drops_other_classes() {
        let mut source = MemorySource::new("mixed", Some(30.), blank_frames(1));
        let bbox = BBox::new(0., 0., 10., 10.);
        let mut detector = ScriptedDetector::new(vec![vec![
            DetectedObject::new(bbox, 0.8, 2),
            DetectedObject::new(bbox, 0.8, 67),
        ]]);
        let mut pipeline = FrameAnalysisPipeline::new(&Config::default(), ClassCatalog::default());
        let report = pipeline.analyze(&mut source, &mut detector, &mut NullFrameWriter);
        assert_eq!(report.detections.len(), 1);
        assert_eq!(report.detections[0].object_type, "pistol");
        assert_eq!(report.detections[0].threat_level, ThreatLevel::High);
        assert_eq!(report.total_matching_class_count, 0);
        assert!(!report.intrusion_detected);
    }

    #[test]
    fn test_detector_failure_is_skipped() {
        let mut source = MemorySource::new("clip", Some(30.), blank_frames(2));
        let mut detector = ScriptedDetector::default();
        detector.push_failure("inference crashed");
        detector.push(vec![person_at(10.)]);
        let mut pipeline = FrameAnalysisPipeline::new(&Config::default(), ClassCatalog::default());
        let report = pipeline.analyze(&mut source, &mut detector, &mut NullFrameWriter);
        assert_eq!(report.status, AnalysisStatus::Success);
        assert_eq!(report.frames_processed, 2);
        assert_eq!(report.detections.len(), 1);
        assert_eq!(report.detections[0].frame_index, 2);
    }

    #[test]
    fn test_broken_sink_degrades_to_log_only() {
        let mut source = MemorySource::new("clip", Some(30.), blank_frames(2));
        let mut detector = ScriptedDetector::new(vec![vec![person_at(10.)], vec![person_at(12.)]]);
        let mut pipeline = FrameAnalysisPipeline::new(&Config::default(), ClassCatalog::default())
            .with_sink(Box::new(BrokenSink));
        let report = pipeline.analyze(&mut source, &mut detector, &mut NullFrameWriter);
        assert_eq!(report.status, AnalysisStatus::Success);
        assert_eq!(report.detections.len(), 2);
    }

    #[test]
    fn test_transient_read_failures() {
        let mut config = Config::default();
        config.max_read_failures = 2;

        let mut source = MemorySource::new("clip", Some(30.), blank_frames(1));
        source.push_failure("glitch");
        let mut pipeline = FrameAnalysisPipeline::new(&config, ClassCatalog::default());
        let report = pipeline.analyze(&mut source, &mut ScriptedDetector::default(), &mut NullFrameWriter);
        assert_eq!(report.status, AnalysisStatus::Success);
        assert_eq!(report.frames_processed, 1);

        let mut source = MemorySource::new("clip", Some(30.), vec![]);
        for _ in 0..2 {
            source.push_failure("glitch");
        }
        // never reached
        source.push_failure("glitch");
        let mut pipeline = FrameAnalysisPipeline::new(&config, ClassCatalog::default());
        let report = pipeline.analyze(&mut source, &mut ScriptedDetector::default(), &mut NullFrameWriter);
        assert_eq!(report.frames_processed, 0);
        assert!(source.next_frame().is_err());
    }

    #[test]
    fn test_encoding_failure_is_partial() {
        let mut source = MemorySource::new("clip", Some(30.), blank_frames(3));
        let mut detector = ScriptedDetector::new(vec![vec![person_at(10.)]; 3]);
        let mut pipeline = FrameAnalysisPipeline::new(&Config::default(), ClassCatalog::default());
        let report = pipeline.analyze(&mut source, &mut detector, &mut FailingWriter { written: 0 });
        assert_eq!(report.status, AnalysisStatus::Partial);
        assert_eq!(report.frames_processed, 2);
        assert_eq!(report.detections.len(), 2);
        assert!(report.message.unwrap().contains("disk full"));
    }

    #[test]
    fn test_failed_report() {
        let report = VideoAnalysisReport::failed(&AnalysisError::SourceUnavailable {
            path: "missing".to_string(),
            reason: "not found".to_string(),
        });
        assert_eq!(report.status, AnalysisStatus::Error);
        assert!(report.detections.is_empty());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "error");
    }

    #[test]
    fn test_moving_block_is_seen() {
        let mut config = Config::default();
        config.background = crate::config::BackgroundKind::Diff;
        let frames: Vec<RgbImage> = (0..4u32)
            .map(|i| {
                RgbImage::from_fn(160, 120, |x, y| {
                    let x0 = 10 + 25 * i;
                    if x >= x0 && x < x0 + 40 && (40..80).contains(&y) {
                        Rgb([230, 230, 230])
                    } else {
                        Rgb([20, 20, 20])
                    }
                })
            })
            .collect();
        let mut pipeline = FrameAnalysisPipeline::new(&config, ClassCatalog::default());
        let mut analyses = vec![];
        for (i, image) in frames.into_iter().enumerate() {
            analyses.push(pipeline.process_frame(&Frame::new(i + 1, image), vec![]));
        }
        assert_eq!(analyses[0].foreground_pixels, 0);
        assert!(!analyses[0].motion.is_moving);
        assert!(analyses[3].foreground_pixels > 0);
        assert!(analyses[3].motion.is_moving);
        assert_eq!(analyses[3].overlay.primitives.len(), 1);
    }

    #[test]
    fn test_second_stream_starts_fresh() {
        let mut config = Config::default();
        config.background = crate::config::BackgroundKind::Diff;
        let mut pipeline = FrameAnalysisPipeline::new(&config, ClassCatalog::default());

        let white = RgbImage::from_pixel(160, 120, Rgb([255, 255, 255]));
        let mut first = MemorySource::new("day", Some(30.), vec![white]);
        let mut detector = ScriptedDetector::new(vec![vec![person_at(10.)]]);
        pipeline.analyze(&mut first, &mut detector, &mut NullFrameWriter);

        let black = RgbImage::from_pixel(160, 120, Rgb([0, 0, 0]));
        let mut second = MemorySource::new("night", Some(30.), vec![black; 2]);
        let mut detector = ScriptedDetector::new(vec![vec![person_at(60.)], vec![person_at(60.)]]);
        let report = pipeline.analyze(&mut second, &mut detector, &mut NullFrameWriter);
        assert_eq!(report.frames_processed, 2);
        // a track carried over from the first stream would give a speed here
        assert_eq!(report.detections[0].speed, 0.);
        assert_eq!(report.detections[0].track_id, report.detections[1].track_id);

        // frames handed in after a finished analysis start a new stream too
        let mut third = MemorySource::new("dusk", Some(30.), blank_frames(1));
        let frame = third.next_frame().unwrap().unwrap();
        let analysis = pipeline.process_frame(&frame, vec![]);
        assert_eq!(analysis.foreground_pixels, 0);
        assert!(!analysis.motion.is_moving);
    }

    #[test]
    fn test_first_frame_of_next_stream_has_no_foreground() {
        let mut config = Config::default();
        config.background = crate::config::BackgroundKind::Diff;
        let mut pipeline = FrameAnalysisPipeline::new(&config, ClassCatalog::default());

        let white = RgbImage::from_pixel(160, 120, Rgb([255, 255, 255]));
        let mut first = MemorySource::new("day", Some(30.), vec![white]);
        pipeline.analyze(&mut first, &mut ScriptedDetector::default(), &mut NullFrameWriter);

        // a stream of two black frames; with stale state the first one differs
        // from the white frame everywhere and the region covers the image
        let black = RgbImage::from_pixel(160, 120, Rgb([0, 0, 0]));
        let mut second = MemorySource::new("night", Some(30.), vec![black; 2]);
        let mut writer = OverlayRecorder::default();
        let report = pipeline.analyze(&mut second, &mut ScriptedDetector::default(), &mut writer);
        assert_eq!(report.frames_processed, 2);
        assert!(writer.overlays.iter().all(|o| o.primitives.is_empty()));
    }

    #[test]
    fn test_out_of_range_box_does_not_abort() {
        let mut source = MemorySource::new("clip", Some(30.), blank_frames(2));
        let wild = DetectedObject::new(BBox::new(-3e9, 0., 100., 10.), 0.9, 0);
        let mut detector = ScriptedDetector::new(vec![vec![wild], vec![person_at(10.)]]);
        let root = tempfile::tempdir().unwrap();
        let mut writer = ImageSequenceWriter::new(root.path());
        let mut pipeline = FrameAnalysisPipeline::new(&Config::default(), ClassCatalog::default());
        let report = pipeline.analyze(&mut source, &mut detector, &mut writer);
        assert_eq!(report.status, AnalysisStatus::Success);
        assert_eq!(report.frames_processed, 2);
        assert_eq!(report.detections[0].bbox, [i32::MIN, 0, 100, 10]);

        let frame = Frame::new(1, RgbImage::new(160, 120));
        let analysis = pipeline.process_frame(&frame, vec![wild]);
        assert_eq!(analysis.detections.len(), 1);
    }

    #[test]
    fn test_writer_output_folder_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let mut writer = ImageSequenceWriter::new(root.path());
        let mut source = MemorySource::new("clip", Some(30.), blank_frames(2));
        let mut detector = ScriptedDetector::new(vec![vec![person_at(10.)]]);
        let mut pipeline = FrameAnalysisPipeline::new(&Config::default(), ClassCatalog::default());
        let report = pipeline.analyze(&mut source, &mut detector, &mut writer);
        let dir = PathBuf::from(report.video_path.unwrap());
        assert!(dir.starts_with(root.path()));
        assert!(dir.join("frame_000001.png").is_file());
        assert!(dir.join("frame_000002.png").is_file());
    }
}
