use anyhow::Result;

use crate::detect::result::DetectionResult;

/// Detector backend trait.
///
/// Backends turn one RGB24 frame into zero or more labelled detections. They
/// must treat the pixel slice as read-only and must not keep it past the call.
///
/// An `Err` from `detect` is an unrecoverable inference failure; the vision loop
/// does not retry it.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult>;

    /// Optional warm-up hook, run once at startup.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
