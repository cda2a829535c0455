//! Frame acquisition
//!
//! A capture backend opens a source descriptor (device path, index or URL)
//! and yields decoded frames. Production capture runs `ffmpeg` as a child
//! process emitting MJPEG on stdout; JPEG boundaries are found by SOI/EOI
//! markers.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;

/// Upper bound for a single buffered JPEG
const MAX_JPEG_BYTES: usize = 8 * 1024 * 1024;

/// Read chunk size for the MJPEG pipe
const READ_CHUNK_BYTES: usize = 16 * 1024;

/// A decoded RGB frame. Cloning shares the pixel buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Arc<RgbImage>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
            captured_at: Utc::now(),
        }
    }

    /// Decode a JPEG buffer
    pub fn from_jpeg(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)?.into_rgb8();
        Ok(Self::new(image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Encode as JPEG at the given quality (1-100)
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64 * 1024);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode_image(self.image.as_ref())?;
        Ok(out)
    }
}

/// An open capture device
pub trait FrameSource: Send {
    /// Block until the next frame is available or the read fails
    fn read_frame(&mut self) -> Result<Frame>;
}

/// Opens capture devices for source descriptors
pub trait CaptureBackend: Send + Sync {
    fn open(&self, source: &str) -> Result<Box<dyn FrameSource>>;
}

// ========================================
// ffmpeg capture
// ========================================

/// Capture via an `ffmpeg` child process
#[derive(Debug, Clone)]
pub struct FfmpegCapture {
    binary: String,
    /// Optional demuxer (`-f`), e.g. `v4l2` or `avfoundation`
    input_format: Option<String>,
}

impl FfmpegCapture {
    pub fn new(input_format: Option<String>) -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            input_format,
        }
    }

    /// Numeric sources are device indexes
    fn resolve_source(source: &str) -> String {
        if !source.is_empty() && source.chars().all(|c| c.is_ascii_digit()) {
            format!("/dev/video{}", source)
        } else {
            source.to_string()
        }
    }

    fn command(&self, source: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        // minimal buffering so the latest frame is what we read
        cmd.args(["-fflags", "nobuffer", "-flags", "low_delay"]);
        if let Some(format) = &self.input_format {
            cmd.args(["-f", format]);
        }
        cmd.args(["-i", &Self::resolve_source(source)]);
        cmd.args(["-an", "-f", "mjpeg", "-q:v", "3", "pipe:1"]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }
}

impl CaptureBackend for FfmpegCapture {
    fn open(&self, source: &str) -> Result<Box<dyn FrameSource>> {
        let mut child = self
            .command(source)
            .spawn()
            .map_err(|e| Error::Device(format!("failed to spawn {}: {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Device("ffmpeg stdout not captured".to_string()))?;

        tracing::info!(source = %source, pid = child.id(), "Capture process started");

        Ok(Box::new(FfmpegSource {
            child,
            stream: MjpegSplitter::new(stdout),
        }))
    }
}

struct FfmpegSource {
    child: Child,
    stream: MjpegSplitter<ChildStdout>,
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Frame> {
        let jpeg = self.stream.next_jpeg()?;
        Frame::from_jpeg(&jpeg)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ========================================
// MJPEG splitting
// ========================================

/// Splits a concatenated JPEG byte stream into individual images
pub struct MjpegSplitter<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R: Read> MjpegSplitter<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG (SOI through EOI)
    pub fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self.reader.read(&mut chunk)?;
            if read == 0 {
                return Err(Error::Device("mjpeg stream ended".to_string()));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out at most `step` bytes per call
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_splitter_across_chunks() {
        let first = vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        let second = vec![0xFF, 0xD8, 9, 0xFF, 0xD9];
        let mut data = vec![0x00, 0x42];
        data.extend(&first);
        data.extend(&second);

        let mut splitter = MjpegSplitter::new(Trickle {
            data,
            pos: 0,
            step: 3,
        });

        assert_eq!(splitter.next_jpeg().unwrap(), first);
        assert_eq!(splitter.next_jpeg().unwrap(), second);
        assert!(matches!(splitter.next_jpeg(), Err(Error::Device(_))));
    }

    #[test]
    fn test_find_bounds_needs_eoi() {
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0x01]), None);
        assert_eq!(find_jpeg_bounds(&[0x00, 0xFF, 0xD8, 0xFF, 0xD9]), Some((1, 5)));
    }

    #[test]
    fn test_frame_jpeg_round_trip_dimensions() {
        let frame = Frame::new(RgbImage::from_pixel(16, 8, image::Rgb([200, 10, 10])));
        let jpeg = frame.to_jpeg(80).unwrap();
        let decoded = Frame::from_jpeg(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 8));
    }

    #[test]
    fn test_numeric_source_maps_to_device() {
        assert_eq!(FfmpegCapture::resolve_source("0"), "/dev/video0");
        assert_eq!(
            FfmpegCapture::resolve_source("rtsp://cam/stream"),
            "rtsp://cam/stream"
        );
    }
}
