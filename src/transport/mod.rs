//! Classification channel between the vision and relay nodes.
//!
//! The channel carries one thing: a label string published on a single topic.
//! Both ends sit behind small traits so each node loop can run against MQTT in
//! production and against the in-memory loopback in tests and the demo.

mod memory;
mod mqtt;

use anyhow::Result;
use std::time::Duration;

pub use memory::{loopback, MemoryPublisher, MemorySubscriber};
pub use mqtt::{parse_mqtt_endpoint, MqttEndpoint, MqttPublisher, MqttSubscriber, DEFAULT_MQTT_PORT};

/// Sending half. Fire-and-forget: a successful return means the message was
/// handed to the transport, not that anyone received it.
pub trait Publisher {
    fn publish(&mut self, label: &str) -> Result<()>;
}

/// Receiving half with a bounded wait.
pub trait Subscriber {
    /// Wait up to `timeout` for the next payload.
    ///
    /// `Ok(None)` means nothing arrived in time. `Err` is a link-level problem;
    /// callers may keep polling and the transport reconnects on its own.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}
