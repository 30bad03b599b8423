//! Ripeness sorting line.
//!
//! A camera station classifies each object on the line, publishes the label on a
//! single MQTT topic, and a relay turns that label into one actuator command on a
//! serial link.
//!
//! # Architecture
//!
//! Two independent processes, each a single blocking control loop:
//!
//! 1. **Vision node** (`vision`): capture, detect, pick the best detection above the
//!    confidence threshold, publish its label, then cool down and flush stale frames
//!    so the same physical object is classified exactly once.
//! 2. **Relay node** (`relay`): receive a label, map it to `R`, `U` or `M`
//!    (`mapper`), write `<cmd>\n` to the serial line (`serial`).
//!
//! The nodes share nothing but the channel contract in `transport`.
//!
//! # Module Structure
//!
//! - `config`: startup configuration (file, environment, validation)
//! - `vision`: vision node state machine
//! - `relay`: relay node loop
//! - `mapper`: label to actuator command table
//! - `serial`: serial command link
//! - `frame`: captured raster buffers
//! - `ingest`: frame sources (V4L2 devices, synthetic `stub://` source)
//! - `detect`: detector backends and best-detection selection
//! - `transport`: publisher/subscriber seams (MQTT, in-memory loopback)
//! - `operator`: preview window and quit key
//! - `pacing`: blocking suspension points (real and manual clocks)

pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod mapper;
pub mod operator;
pub mod pacing;
pub mod relay;
pub mod serial;
pub mod transport;
pub mod vision;

pub use config::{
    CameraSettings, ChannelSettings, DetectorSettings, RelaySettings, SorterConfig,
    VisionSettings,
};
pub use detect::{
    build_backend, select_best, BestDetection, Detection, DetectionResult, DetectorBackend,
    StubBackend,
};
pub use frame::Frame;
pub use ingest::{FrameSource, V4l2Config, V4l2Source};
pub use mapper::{map_label, ActuatorCommand};
pub use operator::{preview_log_target, HeadlessOperator, OperatorSurface, TerminalPreview};
pub use pacing::{ManualClock, Pacer, ThreadPacer};
pub use relay::{RelayNode, RelayOutcome, RelaySummary};
pub use serial::SerialLink;
pub use transport::{loopback, MqttPublisher, MqttSubscriber, Publisher, Subscriber};
pub use vision::{StepOutcome, VisionNode, VisionState, VisionSummary};
