use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::error;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use intruder_motion::alert::JsonlAlertSink;
use intruder_motion::config::Config;
use intruder_motion::detection::{detect_intrusion, ClassCatalog, ReplayDetector};
use intruder_motion::pipeline::{FrameAnalysisPipeline, VideoAnalysisReport};
use intruder_motion::source::{FrameSource, ImageSequenceSource, PipeSource};
use intruder_motion::visualization::{AnnotatedFrameWriter, ImageSequenceWriter, NullFrameWriter};

#[derive(Parser)]
pub struct Args {
    /// Folder of frames, read in file name order, or `-` for a live feed of
    /// PPM frames on stdin
    #[clap(short, long)]
    pub input_folder: PathBuf,
    /// Recorded detector output, one JSON object per frame
    #[clap(long)]
    pub detections: PathBuf,
    /// Where annotated frames are written; nothing is written when omitted
    #[clap(long)]
    pub output: Option<PathBuf>,
    /// Frame rate of the input frames
    #[clap(long)]
    pub fps: Option<f64>,
    /// Alert log, appended to
    #[clap(long)]
    pub alerts: Option<PathBuf>,
    /// Use the wider class list of live feeds
    #[clap(long)]
    pub extended_classes: bool,
    /// Only check the first frame for people
    #[clap(long)]
    pub still: bool,
    #[clap(long, default_value = "0.5")]
    pub confidence_threshold: f64,
    #[clap(flatten)]
    pub config: Config,
}

fn main() -> Result<()> {
    // parse the config
    let args = Args::parse();
    args.config.validate()?;

    // setup logging
    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stdout_writer()))
        .with(indicatif_layer)
        .init();

    let catalog = if args.extended_classes {
        ClassCatalog::extended()
    } else {
        ClassCatalog::default()
    };
    let mut detector = ReplayDetector::open(&args.detections)?;

    let opened = if args.input_folder.as_os_str() == "-" {
        Ok(Box::new(PipeSource::stdin(args.fps)) as Box<dyn FrameSource>)
    } else {
        ImageSequenceSource::open(&args.input_folder, args.fps)
            .map(|source| Box::new(source) as Box<dyn FrameSource>)
    };
    let mut source = match opened {
        Ok(source) => source,
        Err(err) => {
            error!("{}", err);
            println!(
                "{}",
                serde_json::to_string_pretty(&VideoAnalysisReport::failed(&err))?
            );
            return Ok(());
        }
    };

    if args.still {
        if let Some(frame) = source.next_frame()? {
            let check =
                detect_intrusion(&frame, &mut detector, &catalog, args.confidence_threshold)?;
            println!("{}", serde_json::to_string_pretty(&check)?);
        }
        return Ok(());
    }

    let mut pipeline = FrameAnalysisPipeline::new(&args.config, catalog);
    if let Some(alerts) = &args.alerts {
        match JsonlAlertSink::open(alerts) {
            Ok(sink) => pipeline = pipeline.with_sink(Box::new(sink)),
            Err(err) => error!("{:#}, alerts are only logged", err),
        }
    }

    let mut writer: Box<dyn AnnotatedFrameWriter> = match &args.output {
        Some(output) => Box::new(ImageSequenceWriter::new(output)),
        None => Box::new(NullFrameWriter),
    };
    let report = pipeline.analyze(source.as_mut(), &mut detector, writer.as_mut());
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
