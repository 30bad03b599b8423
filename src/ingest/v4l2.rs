//! V4L2 frame source.
//!
//! `V4l2Source` captures from a local V4L2 device (feature: ingest-v4l2), or
//! from a synthetic generator when the device path starts with `stub://`.
//!
//! The device is opened at the configured resolution and fourcc (800x600 MJPG by
//! default) with a single mmap buffer, so every capture is the most recent image
//! the camera produced rather than a queued one. Captured buffers are decoded to
//! RGB24 before they leave this module.

use anyhow::{anyhow, Result};
#[cfg(feature = "ingest-v4l2")]
use anyhow::Context;
#[cfg(feature = "ingest-v4l2")]
use ouroboros::self_referencing;

use super::FrameSource;
use crate::config::CameraSettings;
use crate::frame::Frame;
#[cfg(feature = "ingest-v4l2")]
use super::normalize::{normalize_to_rgb, PixelFormat};

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0") or `stub://name`.
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Requested capture fourcc, e.g. "MJPG".
    pub fourcc: String,
    /// Number of mmap buffers to queue.
    pub buffer_count: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self::from(&CameraSettings::default())
    }
}

impl From<&CameraSettings> for V4l2Config {
    fn from(settings: &CameraSettings) -> Self {
        Self {
            device: settings.device.clone(),
            width: settings.width,
            height: settings.height,
            fourcc: settings.fourcc.clone(),
            buffer_count: settings.buffer_count,
        }
    }
}

/// V4L2 frame source.
///
/// Uses libv4l for real devices, with a synthetic fallback for `stub://` paths.
pub struct V4l2Source {
    backend: V4l2Backend,
}

enum V4l2Backend {
    Synthetic(SyntheticV4l2Source),
    #[cfg(feature = "ingest-v4l2")]
    Device(DeviceV4l2Source),
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Result<Self> {
        if config.device.starts_with("stub://") {
            return Ok(Self {
                backend: V4l2Backend::Synthetic(SyntheticV4l2Source::new(config)),
            });
        }
        Self::device(config)
    }

    #[cfg(feature = "ingest-v4l2")]
    fn device(config: V4l2Config) -> Result<Self> {
        Ok(Self {
            backend: V4l2Backend::Device(DeviceV4l2Source::new(config)?),
        })
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    fn device(config: V4l2Config) -> Result<Self> {
        Err(anyhow!(
            "camera device {} requires the 'ingest-v4l2' feature.\n\
             Recompile with: cargo build --features ingest-v4l2",
            config.device
        ))
    }

    /// Number of frames captured so far (including flushed ones).
    pub fn frames_captured(&self) -> u64 {
        match &self.backend {
            V4l2Backend::Synthetic(source) => source.frame_count,
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.frame_count,
        }
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            V4l2Backend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            V4l2Backend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "ingest-v4l2")]
            V4l2Backend::Device(source) => source.next_frame(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for demos and tests
// ----------------------------------------------------------------------------

struct SyntheticV4l2Source {
    config: V4l2Config,
    connected: bool,
    frame_count: u64,
}

impl SyntheticV4l2Source {
    fn new(config: V4l2Config) -> Self {
        Self {
            config,
            connected: false,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!(
            "V4l2Source: connected to {} (synthetic, {}x{})",
            self.config.device,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("synthetic source {} not connected", self.config.device));
        }
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        )
    }

    /// A belt-coloured background with a round "fruit" that drifts across it.
    /// The fruit's hue cycles from green through red to brown.
    fn generate_synthetic_pixels(&self) -> Vec<u8> {
        let width = self.config.width as i64;
        let height = self.config.height as i64;
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);

        let phase = (self.frame_count % 120) as i64;
        let cx = phase * width / 120;
        let cy = height / 2;
        let radius = (width.min(height) / 6).max(1);
        let fruit = match (self.frame_count / 120) % 3 {
            0 => [70u8, 160, 40],
            1 => [200, 40, 30],
            _ => [110, 80, 40],
        };

        for y in 0..height {
            for x in 0..width {
                let dx = x - cx;
                let dy = y - cy;
                if dx * dx + dy * dy <= radius * radius {
                    pixels.extend_from_slice(&fruit);
                } else {
                    let shade = 40 + ((x + y) % 16) as u8;
                    pixels.extend_from_slice(&[shade, shade, shade + 8]);
                }
            }
        }
        pixels
    }
}

// ----------------------------------------------------------------------------
// Production V4L2 source using libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
struct DeviceV4l2Source {
    config: V4l2Config,
    state: Option<DeviceV4l2State>,
    frame_count: u64,
    fourcc: [u8; 4],
    active_width: u32,
    active_height: u32,
    pixel_format: PixelFormat,
}

#[cfg(feature = "ingest-v4l2")]
#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[cfg(feature = "ingest-v4l2")]
impl DeviceV4l2Source {
    fn new(config: V4l2Config) -> Result<Self> {
        let fourcc: [u8; 4] = config
            .fourcc
            .as_bytes()
            .try_into()
            .map_err(|_| anyhow!("fourcc must be four bytes, got '{}'", config.fourcc))?;
        Ok(Self {
            active_width: config.width,
            active_height: config.height,
            pixel_format: PixelFormat::from_fourcc(&fourcc)?,
            fourcc,
            config,
            state: None,
            frame_count: 0,
        })
    }

    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(&self.fourcc);

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        // The driver may have picked something else; decode what it actually gives us.
        self.pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr)?;
        self.active_width = format.width;
        self.active_height = format.height;

        let buffer_count = self.config.buffer_count;
        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, buffer_count)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?}, {} buffer(s))",
            self.config.device,
            self.active_width,
            self.active_height,
            self.pixel_format,
            buffer_count
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.active_width, self.active_height, self.pixel_format);
        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let (pixels, width, height) = state.with_mut(|fields| {
            let (buf, meta) = fields.stream.next().context("capture v4l2 frame")?;
            let used = match meta.bytesused as usize {
                0 => buf.len(),
                n => n.min(buf.len()),
            };
            normalize_to_rgb(&buf[..used], width, height, format)
        })?;

        self.frame_count += 1;
        Frame::new(pixels, width, height, self.frame_count)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
