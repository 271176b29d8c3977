//! Frame sources.
//!
//! A source yields frames in capture order together with a nominal frame
//! rate. End of stream is `Ok(None)`; a frame that could not be read this
//! time is `FrameReadError::Transient` and the caller may keep reading.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use image::codecs::pnm::PnmDecoder;
use image::{DynamicImage, RgbImage};
use log::{debug, warn};

use crate::error::{AnalysisError, FrameReadError};
use crate::frame::Frame;

const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

pub trait FrameSource {
    /// Nominal frame rate, `None` when the source does not know it.
    fn fps(&self) -> Option<f64>;

    fn frame_count(&self) -> Option<u64> {
        None
    }

    /// Short name used for output artifacts.
    fn name(&self) -> String;

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameReadError>;
}

/// Directory of still images, read in file name order.
pub struct ImageSequenceSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    position: usize,
    fps: Option<f64>,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path, fps: Option<f64>) -> Result<Self, AnalysisError> {
        let unavailable = |reason: String| AnalysisError::SourceUnavailable {
            path: dir.display().to_string(),
            reason,
        };
        let entries = std::fs::read_dir(dir).map_err(|e| unavailable(e.to_string()))?;

        let mut files = vec![];
        for entry in entries {
            let path = entry.map_err(|e| unavailable(e.to_string()))?.path();
            let is_frame = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_frame && path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(unavailable("no image frames found".to_string()));
        }
        files.sort();
        debug!("found {} frames in {}", files.len(), dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            position: 0,
            fps,
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.files.len() as u64)
    }

    fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "frames".to_string())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameReadError> {
        let Some(path) = self.files.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        match image::open(path) {
            Ok(decoded) => Ok(Some(Frame::new(self.position, decoded.to_rgb8()))),
            Err(err) => Err(FrameReadError::Transient(format!(
                "{}: {}",
                path.display(),
                err
            ))),
        }
    }
}

/// Live feed of binary PPM (P6) images back to back on a byte stream, such as
/// `ffmpeg -f image2pipe -vcodec ppm -` piped into stdin. The length is
/// unknown until the stream closes.
pub struct PipeSource<R: Read> {
    name: String,
    fps: Option<f64>,
    reader: BufReader<R>,
    read: usize,
}

impl PipeSource<std::io::Stdin> {
    pub fn stdin(fps: Option<f64>) -> Self {
        Self::new("stdin", fps, std::io::stdin())
    }
}

impl<R: Read> PipeSource<R> {
    pub fn new(name: &str, fps: Option<f64>, reader: R) -> Self {
        Self {
            name: name.to_string(),
            fps,
            reader: BufReader::new(reader),
            read: 0,
        }
    }
}

impl<R: Read> FrameSource for PipeSource<R> {
    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameReadError> {
        let at_end = self.reader.fill_buf().map_err(|e| AnalysisError::SourceUnavailable {
            path: self.name.clone(),
            reason: e.to_string(),
        })?;
        if at_end.is_empty() {
            return Ok(None);
        }

        let decoded = PnmDecoder::new(&mut self.reader).and_then(DynamicImage::from_decoder);
        match decoded {
            Ok(image) => {
                self.read += 1;
                Ok(Some(Frame::new(self.read, image.to_rgb8())))
            }
            Err(err) => {
                warn!("{}: undecodable frame after {}", self.name, self.read);
                Err(FrameReadError::Transient(format!("{}: {}", self.name, err)))
            }
        }
    }
}

/// Frames held in memory. Indices are assigned on read.
pub struct MemorySource {
    name: String,
    fps: Option<f64>,
    frames: VecDeque<Result<RgbImage, String>>,
    total: u64,
    read: usize,
}

impl MemorySource {
    pub fn new(name: &str, fps: Option<f64>, images: Vec<RgbImage>) -> Self {
        let total = images.len() as u64;
        Self {
            name: name.to_string(),
            fps,
            frames: images.into_iter().map(Ok).collect(),
            total,
            read: 0,
        }
    }

    /// Queue a read that fails once.
    pub fn push_failure(&mut self, message: &str) {
        self.frames.push_back(Err(message.to_string()));
    }
}

impl FrameSource for MemorySource {
    fn fps(&self) -> Option<f64> {
        self.fps
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.total)
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameReadError> {
        match self.frames.pop_front() {
            None => Ok(None),
            Some(Err(message)) => Err(FrameReadError::Transient(message)),
            Some(Ok(image)) => {
                self.read += 1;
                Ok(Some(Frame::new(self.read, image)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_missing_directory() {
        let result = ImageSequenceSource::open(Path::new("/nonexistent/frames"), Some(30.));
        assert!(matches!(
            result,
            Err(AnalysisError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a frame").unwrap();
        assert!(ImageSequenceSource::open(dir.path(), None).is_err());
    }

    #[test]
    fn test_reads_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, value) in [("b.png", 20u8), ("a.png", 10), ("c.png", 30)] {
            RgbImage::from_pixel(8, 6, Rgb([value, value, value]))
                .save(dir.path().join(name))
                .unwrap();
        }
        let mut source = ImageSequenceSource::open(dir.path(), Some(10.)).unwrap();
        assert_eq!(source.frame_count(), Some(3));

        let mut values = vec![];
        while let Some(frame) = source.next_frame().unwrap() {
            values.push((frame.index, frame.image.get_pixel(0, 0)[0]));
        }
        assert_eq!(values, vec![(1, 10), (2, 20), (3, 30)]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_frame_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), b"garbage").unwrap();
        RgbImage::new(4, 4).save(dir.path().join("b.png")).unwrap();
        let mut source = ImageSequenceSource::open(dir.path(), None).unwrap();
        assert!(matches!(
            source.next_frame(),
            Err(FrameReadError::Transient(_))
        ));
        assert_eq!(source.next_frame().unwrap().unwrap().index, 2);
    }

    #[test]
    fn test_memory_source() {
        let mut source = MemorySource::new("synthetic", Some(30.), vec![RgbImage::new(4, 4); 2]);
        source.push_failure("dropped");
        assert_eq!(source.next_frame().unwrap().unwrap().index, 1);
        assert_eq!(source.next_frame().unwrap().unwrap().index, 2);
        assert!(source.next_frame().is_err());
        assert!(source.next_frame().unwrap().is_none());
    }

    fn ppm(width: usize, height: usize, value: u8) -> Vec<u8> {
        let mut bytes = format!("P6\n{} {}\n255\n", width, height).into_bytes();
        bytes.extend(std::iter::repeat(value).take(width * height * 3));
        bytes
    }

    #[test]
    fn test_pipe_source_reads_back_to_back_frames() {
        let mut stream = ppm(4, 2, 100);
        stream.extend(ppm(4, 2, 200));
        let mut source = PipeSource::new("live", Some(25.), std::io::Cursor::new(stream));
        assert_eq!(source.frame_count(), None);
        assert_eq!(source.fps(), Some(25.));

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!((first.index, first.width(), first.height()), (1, 4, 2));
        assert_eq!(first.image.get_pixel(3, 1), &Rgb([100, 100, 100]));
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(second.index, 2);
        assert_eq!(second.image.get_pixel(0, 0), &Rgb([200, 200, 200]));
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_pipe_source_truncated_tail() {
        let mut stream = ppm(4, 2, 100);
        stream.extend(&ppm(4, 2, 200)[..20]);
        let mut source = PipeSource::new("live", None, std::io::Cursor::new(stream));
        assert_eq!(source.next_frame().unwrap().unwrap().index, 1);
        assert!(matches!(
            source.next_frame(),
            Err(FrameReadError::Transient(_))
        ));
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_pipe_source_empty_stream() {
        let mut source = PipeSource::new("live", None, std::io::empty());
        assert!(source.next_frame().unwrap().is_none());
    }
}
