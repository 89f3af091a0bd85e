//! Video conversion pipeline: muxes separate v.redd.it audio/video streams
//! into a single cached mp4.

pub mod cache;
pub mod pipeline;

pub use cache::{VideoCache, VideoCacheEntry};
pub use pipeline::{Converted, VideoConversionPipeline};
