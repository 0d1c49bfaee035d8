//! The demux/decode/convert seam driven by [`StreamDecoder`].
//!
//! A [`VideoPipeline`] is created per session by a [`PipelineFactory`]
//! and used exclusively from the decode thread:
//!
//! ```text
//! open ──► read_unit ──► decode_unit ──► (emit 0..n pictures)
//!              ▲              │
//!              └──────────────┘        release (exactly once)
//! ```
//!
//! [`StreamDecoder`]: crate::video::StreamDecoder

use std::sync::Arc;

use crate::error::DecodeError;
use crate::video::types::{RgbBuffer, StreamGeometry, StreamSession};

/// One compressed unit read from the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUnit {
    /// Track the unit belongs to.
    pub stream_index: usize,
    pub data: Vec<u8>,
}

/// Outcome of a single read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus {
    Unit(MediaUnit),
    /// The source is exhausted; the loop exits cleanly.
    EndOfStream,
    /// Nothing available right now; try again.
    WouldBlock,
}

/// Cross-thread hook that unblocks a pending `open`/`read_unit`.
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

/// A demux → decode → RGB conversion pipeline for one session.
pub trait VideoPipeline: Send {
    /// Open the stream, discover its tracks, select the first video
    /// track and prepare decoder and converter.
    fn open(&mut self, session: &StreamSession) -> Result<StreamGeometry, DecodeError>;

    /// Read the next compressed unit.
    fn read_unit(&mut self) -> Result<ReadStatus, DecodeError>;

    /// Decode one unit of the video track, converting every available
    /// picture into `out` and calling `emit` once per picture.
    ///
    /// Returns the number of pictures emitted.
    fn decode_unit(
        &mut self,
        unit: MediaUnit,
        out: &mut RgbBuffer,
        emit: &mut dyn FnMut(&RgbBuffer),
    ) -> Result<usize, DecodeError>;

    /// Hook used by `stop()` to wake a blocked read.
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }

    /// Free every native resource. Must tolerate repeated calls.
    fn release(&mut self);
}

/// Creates a fresh pipeline for each decode session.
pub trait PipelineFactory: Send + Sync {
    fn create(&self, session: &StreamSession) -> Box<dyn VideoPipeline>;
}

impl<F> PipelineFactory for F
where
    F: Fn(&StreamSession) -> Box<dyn VideoPipeline> + Send + Sync,
{
    fn create(&self, session: &StreamSession) -> Box<dyn VideoPipeline> {
        self(session)
    }
}
