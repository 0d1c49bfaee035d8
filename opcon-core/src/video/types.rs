//! Shared types for the video ingest pipeline.
//!
//! [`DecodedFrame`] is a *view*: it borrows the decode thread's reusable
//! output buffer for the duration of a single frame callback. Consumers
//! that need to keep pixels past the callback copy them into an
//! [`OwnedFrame`].

use std::time::Instant;

use crate::config::StreamOptions;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout of decoded frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb24,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
        }
    }
}

// ── StreamSession ────────────────────────────────────────────────

/// One decode lifetime: the source URL plus its open options.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSession {
    pub url: String,
    pub options: StreamOptions,
}

impl StreamSession {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: StreamOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Whether the URL names an RTSP source (TCP interleaving applies).
    pub fn is_rtsp(&self) -> bool {
        self.url.starts_with("rtsp://") || self.url.starts_with("rtsps://")
    }
}

// ── StreamGeometry ───────────────────────────────────────────────

/// Properties of the selected video track, known once the stream is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamGeometry {
    /// Index of the video track within the container.
    pub stream_index: usize,
    pub codec: String,
    pub width: u32,
    pub height: u32,
}

// ── RgbBuffer ────────────────────────────────────────────────────

/// The reusable output buffer owned by the decode thread.
///
/// Allocated once per session from the stream geometry and overwritten
/// by every converted picture.
#[derive(Debug)]
pub struct RgbBuffer {
    width: u32,
    height: u32,
    stride: u32,
    data: Vec<u8>,
}

impl RgbBuffer {
    /// Allocate a tightly packed RGB24 buffer, or `None` when the
    /// geometry is empty or its byte size overflows.
    pub fn allocate(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        let stride = width.checked_mul(PixelFormat::Rgb24.bytes_per_pixel() as u32)?;
        let len = (stride as usize).checked_mul(height as usize)?;
        Some(Self {
            width,
            height,
            stride,
            data: vec![0u8; len],
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row pitch in bytes.
    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Borrow the buffer as a frame for one callback.
    pub fn frame(&self, sequence: u64) -> DecodedFrame<'_> {
        DecodedFrame {
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: PixelFormat::Rgb24,
            data: &self.data,
            sequence,
            timestamp: Instant::now(),
        }
    }
}

// ── DecodedFrame ─────────────────────────────────────────────────

/// A decoded, colour-converted picture lent to a frame callback.
///
/// The `data` slice holds `height` rows of `stride` bytes each.
#[derive(Debug, Clone, Copy)]
pub struct DecodedFrame<'a> {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row pitch in **bytes**.
    pub stride: u32,
    /// Pixel layout (always RGB24).
    pub format: PixelFormat,
    /// Pixel data: `stride * height` bytes, valid for the callback only.
    pub data: &'a [u8],
    /// Zero-based index of the frame within its session.
    pub sequence: u64,
    /// Monotonic emission timestamp.
    pub timestamp: Instant,
}

impl DecodedFrame<'_> {
    /// Returns a row slice.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        let end = start + self.stride as usize;
        &self.data[start..end]
    }

    /// Returns the RGB bytes at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride as usize + x as usize * bpp;
        &self.data[offset..offset + bpp]
    }

    /// Copy the pixels out so they outlive the callback.
    pub fn to_owned_frame(&self) -> OwnedFrame {
        OwnedFrame {
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: self.format,
            data: self.data.to_vec(),
            sequence: self.sequence,
            timestamp: self.timestamp,
        }
    }
}

/// A retained copy of a [`DecodedFrame`].
#[derive(Debug, Clone)]
pub struct OwnedFrame {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
    pub sequence: u64,
    pub timestamp: Instant,
}
