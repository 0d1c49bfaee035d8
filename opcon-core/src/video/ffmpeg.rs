//! FFmpeg tool-chain pipeline.
//!
//! `ffprobe` opens the source and reports its tracks; an `ffmpeg` child
//! then demuxes, decodes (frame threads, low delay) and converts the
//! selected video track to packed `rgb24` with `fast_bilinear` scaling,
//! writing raw pictures to a pipe. Each read from the pipe yields one
//! picture-sized unit.
//!
//! Stopping never touches the decode thread: the [`Interrupter`] kills
//! the child process, which closes the pipe and unblocks the read.

use std::io::{ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::DecodeError;
use crate::video::pipeline::{
    Interrupter, MediaUnit, PipelineFactory, ReadStatus, VideoPipeline,
};
use crate::video::types::{RgbBuffer, StreamGeometry, StreamSession};

// ── ffprobe output ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    index: usize,
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

/// Pick the first video track out of `ffprobe -of json` output.
fn select_video_stream(probe_json: &str, url: &str) -> Result<StreamGeometry, DecodeError> {
    let probe: ProbeOutput = serde_json::from_str(probe_json)
        .map_err(|e| DecodeError::OpenFailed(format!("unreadable stream info for {url}: {e}")))?;

    let video = probe
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| DecodeError::NoVideoStream(url.to_string()))?;

    let codec = video
        .codec_name
        .filter(|c| !c.is_empty())
        .ok_or_else(|| DecodeError::CodecOpenFailed(format!("unknown codec on track {}", video.index)))?;

    match (video.width, video.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => Ok(StreamGeometry {
            stream_index: video.index,
            codec,
            width,
            height,
        }),
        _ => Err(DecodeError::CodecOpenFailed(format!(
            "{codec} track {} reports no picture size",
            video.index
        ))),
    }
}

// ── Argument builders ────────────────────────────────────────────

/// Input-side options shared by `ffprobe` and `ffmpeg`.
fn input_args(session: &StreamSession) -> Vec<String> {
    let opts = &session.options;
    let mut args: Vec<String> = Vec::new();

    if session.is_rtsp() && opts.force_tcp {
        args.extend(["-rtsp_transport".into(), "tcp".into()]);
    }

    let mut fflags = Vec::new();
    if opts.no_buffer {
        fflags.push("nobuffer");
    }
    if opts.frame_drop {
        fflags.push("+discardcorrupt");
    }
    if !fflags.is_empty() {
        args.extend(["-fflags".into(), fflags.concat()]);
    }

    if opts.low_delay {
        args.extend(["-flags".into(), "low_delay".into()]);
    }
    if opts.zero_latency {
        args.extend(["-max_delay".into(), "0".into()]);
    }

    args.extend(["-probesize".into(), opts.probe_size.max(32).to_string()]);

    let timeout_us = opts.io_timeout().as_micros().to_string();
    if session.is_rtsp() {
        args.extend(["-timeout".into(), timeout_us]);
    } else {
        args.extend(["-rw_timeout".into(), timeout_us]);
    }

    args
}

fn probe_args(session: &StreamSession) -> Vec<String> {
    let mut args = vec!["-v".to_string(), "error".to_string()];
    args.extend(input_args(session));
    args.extend([
        "-show_entries".into(),
        "stream=index,codec_type,codec_name,width,height".into(),
        "-of".into(),
        "json".into(),
        session.url.clone(),
    ]);
    args
}

fn decode_args(session: &StreamSession, geometry: &StreamGeometry) -> Vec<String> {
    let opts = &session.options;
    let mut args = vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ];
    args.extend(input_args(session));
    if opts.low_delay {
        args.extend(["-flags2".into(), "fast".into()]);
    }
    args.extend([
        "-threads".into(),
        opts.decode_threads.max(1).to_string(),
        "-thread_type".into(),
        "frame".into(),
        "-i".into(),
        session.url.clone(),
        "-map".into(),
        format!("0:{}", geometry.stream_index),
        "-an".into(),
        "-sws_flags".into(),
        "fast_bilinear".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-f".into(),
        "rawvideo".into(),
        "-".into(),
    ]);
    args
}

// ── FfmpegPipeline ───────────────────────────────────────────────

type ChildSlot = Arc<Mutex<Option<Child>>>;

fn lock_slot(slot: &ChildSlot) -> MutexGuard<'_, Option<Child>> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// [`VideoPipeline`] backed by the `ffprobe`/`ffmpeg` executables.
pub struct FfmpegPipeline {
    ffmpeg: String,
    ffprobe: String,
    /// The running child (probe during `open`, decoder afterwards).
    child: ChildSlot,
    stdout: Option<ChildStdout>,
    stream_index: usize,
    /// Bytes per converted picture.
    frame_len: usize,
    /// Read buffer handed out as a unit and returned by `decode_unit`.
    scratch: Vec<u8>,
    released: bool,
}

impl FfmpegPipeline {
    /// Use `ffmpeg` and `ffprobe` from `PATH`.
    pub fn new() -> Self {
        Self::with_binaries("ffmpeg", "ffprobe")
    }

    pub fn with_binaries(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            child: Arc::new(Mutex::new(None)),
            stdout: None,
            stream_index: 0,
            frame_len: 0,
            scratch: Vec::new(),
            released: false,
        }
    }

    fn probe(&mut self, session: &StreamSession) -> Result<StreamGeometry, DecodeError> {
        let mut child = Command::new(&self.ffprobe)
            .args(probe_args(session))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DecodeError::OpenFailed(format!("failed to run {}: {e}", self.ffprobe)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        *lock_slot(&self.child) = Some(child);

        let mut report = String::new();
        let read = match stdout {
            Some(mut out) => out.read_to_string(&mut report),
            None => Ok(0),
        };
        let mut diagnostics = String::new();
        if let Some(mut err) = stderr {
            let _ = err.read_to_string(&mut diagnostics);
        }
        let status = self.reap_child();

        if let Err(e) = read {
            return Err(DecodeError::OpenFailed(format!("reading stream info: {e}")));
        }
        match status {
            Some(s) if s.success() => select_video_stream(&report, &session.url),
            Some(s) => {
                let detail = diagnostics.trim();
                Err(DecodeError::OpenFailed(if detail.is_empty() {
                    format!("{} exited with {s}", self.ffprobe)
                } else {
                    detail.to_string()
                }))
            }
            None => Err(DecodeError::OpenFailed(format!("{} did not exit", self.ffprobe))),
        }
    }

    /// Take the child out of the slot and wait for it.
    fn reap_child(&self) -> Option<ExitStatus> {
        let child = lock_slot(&self.child).take();
        child.and_then(|mut c| c.wait().ok())
    }

    /// Called on pipe EOF: a clean exit is end-of-stream, anything else
    /// is a read failure.
    fn finish_stream(&mut self) -> Result<ReadStatus, DecodeError> {
        // The slot is not held across the wait so the interrupter never blocks.
        match self.reap_child() {
            Some(s) if !s.success() => Err(DecodeError::ReadFailed(format!(
                "{} exited with {s}",
                self.ffmpeg
            ))),
            _ => Ok(ReadStatus::EndOfStream),
        }
    }
}

impl Default for FfmpegPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoPipeline for FfmpegPipeline {
    fn open(&mut self, session: &StreamSession) -> Result<StreamGeometry, DecodeError> {
        let geometry = self.probe(session)?;
        info!(
            "video track {} ({}, {}x{}) on {}",
            geometry.stream_index, geometry.codec, geometry.width, geometry.height, session.url
        );

        self.frame_len = RgbBuffer::allocate(geometry.width, geometry.height)
            .map(|b| b.byte_len())
            .ok_or_else(|| {
                DecodeError::ConvertInitFailed(format!(
                    "cannot convert {}x{} to rgb24",
                    geometry.width, geometry.height
                ))
            })?;

        let mut child = Command::new(&self.ffmpeg)
            .args(decode_args(session, &geometry))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                DecodeError::CodecOpenFailed(format!("failed to run {}: {e}", self.ffmpeg))
            })?;

        let stdout = child.stdout.take();
        *lock_slot(&self.child) = Some(child);
        self.stdout = Some(stdout.ok_or_else(|| {
            DecodeError::ConvertInitFailed("decoder output pipe unavailable".into())
        })?);

        self.stream_index = geometry.stream_index;
        self.scratch = vec![0u8; self.frame_len];
        Ok(geometry)
    }

    fn read_unit(&mut self) -> Result<ReadStatus, DecodeError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Err(DecodeError::ReadFailed("pipeline is not open".into()));
        };
        if self.scratch.len() != self.frame_len {
            self.scratch.resize(self.frame_len, 0);
        }

        match stdout.read_exact(&mut self.scratch) {
            Ok(()) => Ok(ReadStatus::Unit(MediaUnit {
                stream_index: self.stream_index,
                data: std::mem::take(&mut self.scratch),
            })),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => self.finish_stream(),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(ReadStatus::WouldBlock)
            }
            Err(e) => Err(DecodeError::ReadFailed(e.to_string())),
        }
    }

    fn decode_unit(
        &mut self,
        unit: MediaUnit,
        out: &mut RgbBuffer,
        emit: &mut dyn FnMut(&RgbBuffer),
    ) -> Result<usize, DecodeError> {
        // Units arrive already decoded and converted by the child.
        if unit.data.len() != out.byte_len() {
            return Err(DecodeError::ConvertInitFailed(format!(
                "converted picture is {} bytes, expected {}",
                unit.data.len(),
                out.byte_len()
            )));
        }
        out.as_mut_slice().copy_from_slice(&unit.data);
        self.scratch = unit.data;
        emit(out);
        Ok(1)
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let slot = Arc::clone(&self.child);
        Some(Arc::new(move || {
            if let Some(child) = lock_slot(&slot).as_mut() {
                if let Err(e) = child.kill() {
                    debug!("interrupt: child already gone: {e}");
                }
            }
        }))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Closing the pipe first lets a still-running child exit on EPIPE.
        self.stdout = None;
        if let Some(mut child) = lock_slot(&self.child).take() {
            if let Err(e) = child.kill() {
                debug!("release: child already exited: {e}");
            }
            if let Err(e) = child.wait() {
                warn!("release: failed to reap {}: {e}", self.ffmpeg);
            }
        }
        self.scratch = Vec::new();
        debug!("ffmpeg pipeline released");
    }
}

impl Drop for FfmpegPipeline {
    fn drop(&mut self) {
        self.release();
    }
}

// ── FfmpegFactory ────────────────────────────────────────────────

/// Creates an [`FfmpegPipeline`] per session.
#[derive(Debug, Clone)]
pub struct FfmpegFactory {
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Default for FfmpegFactory {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
        }
    }
}

impl PipelineFactory for FfmpegFactory {
    fn create(&self, _session: &StreamSession) -> Box<dyn VideoPipeline> {
        Box::new(FfmpegPipeline::with_binaries(&self.ffmpeg, &self.ffprobe))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamOptions;

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn selects_first_video_track() {
        let json = r#"{"streams":[
            {"index":0,"codec_type":"audio","codec_name":"aac"},
            {"index":1,"codec_type":"video","codec_name":"h264","width":1280,"height":720},
            {"index":2,"codec_type":"video","codec_name":"hevc","width":640,"height":480}
        ]}"#;
        let geometry = select_video_stream(json, "rtmp://cam/live").unwrap();
        assert_eq!(geometry.stream_index, 1);
        assert_eq!(geometry.codec, "h264");
        assert_eq!((geometry.width, geometry.height), (1280, 720));
    }

    #[test]
    fn audio_only_has_no_video_stream() {
        let json = r#"{"streams":[{"index":0,"codec_type":"audio","codec_name":"aac"}]}"#;
        let err = select_video_stream(json, "rtmp://cam/live").unwrap_err();
        assert!(matches!(err, DecodeError::NoVideoStream(_)));

        let err = select_video_stream("{}", "rtmp://cam/live").unwrap_err();
        assert!(matches!(err, DecodeError::NoVideoStream(_)));
    }

    #[test]
    fn missing_codec_or_size_fails_codec_open() {
        let json = r#"{"streams":[{"index":0,"codec_type":"video","width":640,"height":480}]}"#;
        assert!(matches!(
            select_video_stream(json, "u").unwrap_err(),
            DecodeError::CodecOpenFailed(_)
        ));

        let json = r#"{"streams":[{"index":0,"codec_type":"video","codec_name":"h264"}]}"#;
        assert!(matches!(
            select_video_stream(json, "u").unwrap_err(),
            DecodeError::CodecOpenFailed(_)
        ));
    }

    #[test]
    fn garbage_probe_output_fails_open() {
        assert!(matches!(
            select_video_stream("not json", "u").unwrap_err(),
            DecodeError::OpenFailed(_)
        ));
    }

    #[test]
    fn rtsp_input_forces_tcp_and_low_latency() {
        let session = StreamSession::new("rtsp://10.0.0.2/stream");
        let args = input_args(&session);
        assert!(has_pair(&args, "-rtsp_transport", "tcp"));
        assert!(has_pair(&args, "-fflags", "nobuffer+discardcorrupt"));
        assert!(has_pair(&args, "-flags", "low_delay"));
        assert!(has_pair(&args, "-max_delay", "0"));
        assert!(has_pair(&args, "-probesize", "32"));
        assert!(has_pair(&args, "-timeout", "5000000"));
    }

    #[test]
    fn rtmp_input_uses_rw_timeout() {
        let options = StreamOptions {
            frame_drop: false,
            zero_latency: false,
            ..StreamOptions::default()
        };
        let session = StreamSession::new("rtmp://10.0.0.2/live/test").with_options(options);
        let args = input_args(&session);
        assert!(!args.iter().any(|a| a == "-rtsp_transport"));
        assert!(!args.iter().any(|a| a == "-max_delay"));
        assert!(has_pair(&args, "-fflags", "nobuffer"));
        assert!(has_pair(&args, "-rw_timeout", "5000000"));
    }

    #[test]
    fn decode_args_map_track_and_convert_to_rgb() {
        let session = StreamSession::new("rtmp://10.0.0.2/live/test");
        let geometry = StreamGeometry {
            stream_index: 1,
            codec: "h264".into(),
            width: 640,
            height: 480,
        };
        let args = decode_args(&session, &geometry);
        assert!(has_pair(&args, "-map", "0:1"));
        assert!(has_pair(&args, "-pix_fmt", "rgb24"));
        assert!(has_pair(&args, "-sws_flags", "fast_bilinear"));
        assert!(has_pair(&args, "-thread_type", "frame"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn missing_probe_binary_fails_open() {
        let mut pipeline =
            FfmpegPipeline::with_binaries("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        let err = pipeline
            .open(&StreamSession::new("rtmp://127.0.0.1/live/test"))
            .unwrap_err();
        assert!(matches!(err, DecodeError::OpenFailed(_)));
        pipeline.release();
        pipeline.release();
    }

    #[test]
    fn read_before_open_fails() {
        let mut pipeline = FfmpegPipeline::new();
        assert!(matches!(
            pipeline.read_unit(),
            Err(DecodeError::ReadFailed(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn child_exit_is_reaped_out_of_the_slot() {
        let mut pipeline = FfmpegPipeline::with_binaries("sh", "sh");
        let spawn = |code: i32| {
            Command::new("sh")
                .args(["-c", &format!("exit {code}")])
                .spawn()
                .unwrap()
        };

        *lock_slot(&pipeline.child) = Some(spawn(0));
        assert!(matches!(pipeline.finish_stream(), Ok(ReadStatus::EndOfStream)));
        assert!(lock_slot(&pipeline.child).is_none());

        *lock_slot(&pipeline.child) = Some(spawn(3));
        assert!(matches!(pipeline.finish_stream(), Err(DecodeError::ReadFailed(_))));
        assert!(lock_slot(&pipeline.child).is_none());

        // Nothing left to kill; the interrupter returns at once.
        let interrupt = pipeline.interrupter().unwrap();
        interrupt();
        assert!(matches!(pipeline.finish_stream(), Ok(ReadStatus::EndOfStream)));
    }
}
