use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::alert::Detection;

/// A frame and what the external detector found in it
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Frame {
    /// Encoded image, stored as is when the frame becomes evidence
    pub image: Vec<u8>,
    pub detections: Vec<Detection>,
}

/// Source of frames for the edge loop. `read_frame` may block until the next frame arrives.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;
}

#[derive(Debug, Deserialize, Serialize)]
struct FeedLine {
    #[serde(default)]
    image: Option<PathBuf>,
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Newline delimited JSON replay of a detector's output, one frame per line:
/// `{"image": "frames/0001.jpg", "detections": [{"label": "person", "confidence": 0.9, "bbox": {...}}]}`
pub struct ReplayFeed<R> {
    reader: R,
    /// Image paths are resolved against this directory
    base_dir: PathBuf,
    line: String,
}

impl ReplayFeed<Box<dyn BufRead + Send>> {
    /// Opens `-` (stdin) or a feed file
    pub fn open(source: &str) -> Result<Self, CaptureError> {
        if source == "-" {
            let stdin: Box<dyn BufRead + Send> = Box::new(BufReader::new(std::io::stdin()));
            return Ok(Self::new(stdin, PathBuf::from(".")));
        }
        let path = Path::new(source);
        let file = File::open(path)
            .map_err(|e| CaptureError::Unavailable(source.to_string(), e.to_string()))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let reader: Box<dyn BufRead + Send> = Box::new(BufReader::new(file));
        Ok(Self::new(reader, base_dir))
    }
}

impl<R: BufRead> ReplayFeed<R> {
    pub fn new(reader: R, base_dir: PathBuf) -> Self {
        Self {
            reader,
            base_dir,
            line: String::new(),
        }
    }
}

impl<R: BufRead> FrameSource for ReplayFeed<R> {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        self.line.clear();
        let read = self
            .reader
            .read_line(&mut self.line)
            .map_err(|e| CaptureError::NoFrame(format!("Read failed: {}", e)))?;
        if read == 0 {
            return Err(CaptureError::Closed);
        }
        let line = self.line.trim();
        if line.is_empty() {
            return Err(CaptureError::NoFrame("Empty line".into()));
        }
        let parsed: FeedLine = serde_json::from_str(line)
            .map_err(|e| CaptureError::NoFrame(format!("Malformed feed line: {}", e)))?;

        let image = match parsed.image {
            Some(image) => {
                let path = self.base_dir.join(image);
                std::fs::read(&path).map_err(|e| {
                    CaptureError::NoFrame(format!("Unable to read {}: {}", path.display(), e))
                })?
            }
            None => Vec::new(),
        };
        trace!(detections = parsed.detections.len(), bytes = image.len(), "Frame read");
        Ok(Frame {
            image,
            detections: parsed.detections,
        })
    }
}

quick_error! {
    #[derive(Debug, PartialEq, Eq)]
    pub enum CaptureError {
        Unavailable(feed: String, error: String) {
            display("Unable to open detection feed {}: {}", feed, error)
        }
        NoFrame(reason: String) {
            display("No frame available: {}", reason)
        }
        Closed {
            display("Detection feed ended")
        }
    }
}
