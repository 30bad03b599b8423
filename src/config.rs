use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_TOPIC: &str = "robotica/frutas";
const DEFAULT_VISION_CLIENT_ID: &str = "sorter-vision";
const DEFAULT_RELAY_CLIENT_ID: &str = "sorter-relay";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.75;
const DEFAULT_COOLDOWN_SECS: f64 = 6.0;
const DEFAULT_FLUSH_FRAMES: u32 = 5;
const MAX_FLUSH_FRAMES: u32 = 120;

const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
const DEFAULT_CAMERA_WIDTH: u32 = 800;
const DEFAULT_CAMERA_HEIGHT: u32 = 600;
const DEFAULT_CAMERA_FOURCC: &str = "MJPG";
const DEFAULT_CAMERA_BUFFERS: u32 = 1;

const DEFAULT_DETECTOR_BACKEND: &str = "tract";
const DEFAULT_MODEL_PATH: &str = "best.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_MIN_SCORE: f32 = 0.25;
const DEFAULT_CLASS_NAMES: [&str; 5] = ["half_ripe", "mold", "ripe", "rotten", "unripe"];

const DEFAULT_SERIAL_PORT: &str = "/dev/ttyACM0";
const DEFAULT_BAUD_RATE: u32 = crate::serial::DEFAULT_BAUD_RATE;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SorterConfigFile {
    channel: Option<ChannelConfigFile>,
    vision: Option<VisionConfigFile>,
    camera: Option<CameraConfigFile>,
    detector: Option<DetectorConfigFile>,
    relay: Option<RelayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ChannelConfigFile {
    broker_addr: Option<String>,
    topic: Option<String>,
    vision_client_id: Option<String>,
    relay_client_id: Option<String>,
    connect_timeout_secs: Option<u64>,
    keep_alive_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct VisionConfigFile {
    confidence_threshold: Option<f32>,
    cooldown_secs: Option<f64>,
    flush_frames: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fourcc: Option<String>,
    buffer_count: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    class_names: Option<Vec<String>>,
    min_score: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    serial_port: Option<String>,
    baud_rate: Option<u32>,
    poll_interval_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
}

/// Full configuration for both nodes. Each binary reads the sections it needs.
#[derive(Debug, Clone)]
pub struct SorterConfig {
    pub channel: ChannelSettings,
    pub vision: VisionSettings,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub relay: RelaySettings,
}

/// Message channel between the nodes.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// `host[:port]`, `mqtt://host[:port]` or `tcp://host[:port]`.
    pub broker_addr: String,
    pub topic: String,
    pub vision_client_id: String,
    pub relay_client_id: String,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
}

#[derive(Debug, Clone)]
pub struct VisionSettings {
    /// A detection qualifies only when strictly above this value.
    pub confidence_threshold: f32,
    pub cooldown: Duration,
    /// Frames read and discarded after each cooldown.
    pub flush_frames: u32,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// Device path, or `stub://name` for the synthetic source.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fourcc: String,
    pub buffer_count: u32,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// `tract` or `stub`.
    pub backend: String,
    pub model_path: PathBuf,
    pub input_size: u32,
    /// Index order must match the model's class rows.
    pub class_names: Vec<String>,
    pub min_score: f32,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub serial_port: String,
    pub baud_rate: u32,
    pub poll_interval: Duration,
    pub write_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_file(ChannelConfigFile::default())
    }
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            cooldown: Duration::from_secs_f64(DEFAULT_COOLDOWN_SECS),
            flush_frames: DEFAULT_FLUSH_FRAMES,
        }
    }
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self::from_file(CameraConfigFile::default())
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self::from_file(DetectorConfigFile::default())
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_file(RelayConfigFile::default())
    }
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            channel: ChannelSettings::default(),
            vision: VisionSettings::default(),
            camera: CameraSettings::default(),
            detector: DetectorSettings::default(),
            relay: RelaySettings::default(),
        }
    }
}

impl ChannelSettings {
    fn from_file(file: ChannelConfigFile) -> Self {
        Self {
            broker_addr: file
                .broker_addr
                .unwrap_or_else(|| DEFAULT_BROKER_ADDR.to_string()),
            topic: file.topic.unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            vision_client_id: file
                .vision_client_id
                .unwrap_or_else(|| DEFAULT_VISION_CLIENT_ID.to_string()),
            relay_client_id: file
                .relay_client_id
                .unwrap_or_else(|| DEFAULT_RELAY_CLIENT_ID.to_string()),
            connect_timeout: Duration::from_secs(
                file.connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            keep_alive: Duration::from_secs(file.keep_alive_secs.unwrap_or(DEFAULT_KEEP_ALIVE_SECS)),
        }
    }
}

impl CameraSettings {
    fn from_file(file: CameraConfigFile) -> Self {
        Self {
            device: file
                .device
                .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
            width: file.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: file.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            fourcc: file
                .fourcc
                .unwrap_or_else(|| DEFAULT_CAMERA_FOURCC.to_string()),
            buffer_count: file.buffer_count.unwrap_or(DEFAULT_CAMERA_BUFFERS),
        }
    }
}

impl DetectorSettings {
    fn from_file(file: DetectorConfigFile) -> Self {
        Self {
            backend: file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
            model_path: file
                .model_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            input_size: file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            class_names: file.class_names.unwrap_or_else(|| {
                DEFAULT_CLASS_NAMES
                    .iter()
                    .map(|name| name.to_string())
                    .collect()
            }),
            min_score: file.min_score.unwrap_or(DEFAULT_MIN_SCORE),
        }
    }
}

impl RelaySettings {
    fn from_file(file: RelayConfigFile) -> Self {
        Self {
            serial_port: file
                .serial_port
                .unwrap_or_else(|| DEFAULT_SERIAL_PORT.to_string()),
            baud_rate: file.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
            poll_interval: Duration::from_millis(
                file.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            write_timeout: Duration::from_millis(
                file.write_timeout_ms.unwrap_or(DEFAULT_WRITE_TIMEOUT_MS),
            ),
        }
    }
}

impl SorterConfig {
    /// Load from the file named by `SORTER_CONFIG` (if any), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SORTER_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Same as [`SorterConfig::load`] with an explicit file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => SorterConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SorterConfigFile) -> Result<Self> {
        let vision = file.vision.unwrap_or_default();
        let cooldown_secs = vision.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS);
        Ok(Self {
            channel: ChannelSettings::from_file(file.channel.unwrap_or_default()),
            vision: VisionSettings {
                confidence_threshold: vision
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                cooldown: duration_from_secs(cooldown_secs, "vision.cooldown_secs")?,
                flush_frames: vision.flush_frames.unwrap_or(DEFAULT_FLUSH_FRAMES),
            },
            camera: CameraSettings::from_file(file.camera.unwrap_or_default()),
            detector: DetectorSettings::from_file(file.detector.unwrap_or_default()),
            relay: RelaySettings::from_file(file.relay.unwrap_or_default()),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_non_empty("SORTER_BROKER_ADDR") {
            self.channel.broker_addr = addr;
        }
        if let Some(topic) = env_non_empty("SORTER_TOPIC") {
            self.channel.topic = topic;
        }
        if let Some(threshold) = env_non_empty("SORTER_CONFIDENCE_THRESHOLD") {
            self.vision.confidence_threshold = threshold.parse().map_err(|_| {
                anyhow!("SORTER_CONFIDENCE_THRESHOLD must be a number between 0 and 1")
            })?;
        }
        if let Some(cooldown) = env_non_empty("SORTER_COOLDOWN_SECS") {
            let seconds: f64 = cooldown
                .parse()
                .map_err(|_| anyhow!("SORTER_COOLDOWN_SECS must be a number of seconds"))?;
            self.vision.cooldown = duration_from_secs(seconds, "SORTER_COOLDOWN_SECS")?;
        }
        if let Some(flush) = env_non_empty("SORTER_FLUSH_FRAMES") {
            self.vision.flush_frames = flush
                .parse()
                .map_err(|_| anyhow!("SORTER_FLUSH_FRAMES must be a non-negative integer"))?;
        }
        if let Some(device) = env_non_empty("SORTER_CAMERA_DEVICE") {
            self.camera.device = device;
        }
        if let Some(model) = env_non_empty("SORTER_MODEL_PATH") {
            self.detector.model_path = PathBuf::from(model);
        }
        if let Some(port) = env_non_empty("SORTER_SERIAL_PORT") {
            self.relay.serial_port = port;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let threshold = self.vision.confidence_threshold;
        if !(0.0..1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence threshold must be in [0, 1), got {}",
                threshold
            ));
        }
        if self.vision.cooldown.is_zero() {
            return Err(anyhow!("cooldown must be greater than zero"));
        }
        if self.vision.flush_frames > MAX_FLUSH_FRAMES {
            return Err(anyhow!(
                "flush_frames must be at most {}, got {}",
                MAX_FLUSH_FRAMES,
                self.vision.flush_frames
            ));
        }

        self.channel.topic = self.channel.topic.trim().to_string();
        validate_topic(&self.channel.topic)?;
        if self.channel.broker_addr.trim().is_empty() {
            return Err(anyhow!("broker address must not be empty"));
        }
        if self.channel.connect_timeout.is_zero() {
            return Err(anyhow!("connect timeout must be greater than zero"));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!(
                "camera resolution must be non-zero, got {}x{}",
                self.camera.width,
                self.camera.height
            ));
        }
        if self.camera.buffer_count == 0 {
            return Err(anyhow!("camera buffer_count must be at least 1"));
        }
        self.camera.fourcc = self.camera.fourcc.to_ascii_uppercase();
        if self.camera.fourcc.len() != 4 {
            return Err(anyhow!(
                "camera fourcc must be four characters, got '{}'",
                self.camera.fourcc
            ));
        }

        if self.detector.class_names.is_empty() {
            return Err(anyhow!("detector class_names must not be empty"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input_size must be non-zero"));
        }

        if self.relay.baud_rate == 0 {
            return Err(anyhow!("serial baud rate must be non-zero"));
        }
        if self.relay.poll_interval.is_zero() {
            return Err(anyhow!("relay poll interval must be greater than zero"));
        }
        Ok(())
    }
}

/// A publish topic: non-empty, no wildcards, no NUL.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(anyhow!("topic must not be empty"));
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(anyhow!(
            "topic '{}' must not contain MQTT wildcards or NUL",
            topic
        ));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<SorterConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn duration_from_secs(seconds: f64, what: &str) -> Result<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(anyhow!("{} must be a non-negative number, got {}", what, seconds));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| anyhow!("{} is out of range ({}): {}", what, seconds, e))
}
