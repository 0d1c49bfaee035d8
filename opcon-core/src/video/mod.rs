//! Low-latency RTMP/RTSP video ingest.
//!
//! - [`types`]: session, geometry, frame buffer and frame views
//! - [`pipeline`]: the demux/decode/convert seam
//! - [`ffmpeg`]: the FFmpeg tool-chain implementation of that seam
//! - [`decoder`]: [`StreamDecoder`], the background decode loop

pub mod decoder;
pub mod ffmpeg;
pub mod pipeline;
pub mod types;

pub use decoder::{DecoderState, FrameStats, StreamDecoder};
pub use ffmpeg::{FfmpegFactory, FfmpegPipeline};
pub use pipeline::{Interrupter, MediaUnit, PipelineFactory, ReadStatus, VideoPipeline};
pub use types::{DecodedFrame, OwnedFrame, PixelFormat, RgbBuffer, StreamGeometry, StreamSession};
