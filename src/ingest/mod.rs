//! Frame sources.
//!
//! - USB/V4L2 cameras (feature: ingest-v4l2)
//! - Synthetic `stub://` source (demos and tests)
//!
//! A source owns its device for its whole lifetime. Frames are handed to the
//! vision loop by value and dropped at the end of the iteration that captured
//! them; nothing here writes pixels to disk or the network.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod v4l2;

use anyhow::Result;

use crate::frame::Frame;

pub use v4l2::{V4l2Config, V4l2Source};

/// Anything that yields frames one at a time.
///
/// `next_frame` errors are treated as "no frame this time" by the vision loop.
/// Only `connect` failures are fatal.
pub trait FrameSource {
    /// Open the device. Called once before the first `next_frame`.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame>;
}
