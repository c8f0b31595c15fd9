//! Transcoder process adapters
//!
//! - `TranscoderAdapter`: the uniform start contract
//! - `TranscoderHandle`: wait/stop on one attempt with exit classification
//! - `FfmpegAdapter`: the production implementation

mod adapter;
mod ffmpeg;

pub use adapter::{
    ExitClass, HandleEvent, ProcessControl, ProcessExit, StartRequest, TranscoderAdapter,
    TranscoderEvent, TranscoderHandle,
};
pub use ffmpeg::{FfmpegAdapter, FfmpegConfig, SPOOL_PATTERN};
