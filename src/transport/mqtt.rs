//! MQTT 3.1.1 transport.
//!
//! Plain TCP only. QoS 1 for publishes. Each handle owns one `rumqttc` client
//! whose connection event loop runs on a helper thread.

use anyhow::{anyhow, Context, Result};
use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Packet, QoS,
    RecvTimeoutError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Publisher, Subscriber};
use crate::config::{validate_topic, ChannelSettings};

pub const DEFAULT_MQTT_PORT: u16 = 1883;
const REQUEST_CAPACITY: usize = 10;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
}

/// Parse a broker address.
///
/// Supports formats:
/// - `host` (port 1883)
/// - `host:port`
/// - `mqtt://host[:port]`, `tcp://host[:port]`
/// - `[ipv6]:port`
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => {
                return Err(anyhow!(
                    "MQTT over TLS is not supported: {} (use mqtt:// or tcp://)",
                    addr
                ))
            }
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }
    let remainder = remainder.trim_end_matches('/');
    if remainder.is_empty() {
        return Err(anyhow!("missing MQTT host in '{}'", addr));
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in '{}'", addr));
    }
    Ok(MqttEndpoint { host, port })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    // Handle IPv6 addresses in brackets: [::1]:1883
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => parse_port(port, addr)?,
            None if rest.is_empty() => DEFAULT_MQTT_PORT,
            None => return Err(anyhow!("invalid MQTT address: {}", addr)),
        };
        return Ok((host.to_string(), port));
    }

    match addr.rsplit_once(':') {
        None => Ok((addr.to_string(), DEFAULT_MQTT_PORT)),
        Some((host, _)) if host.contains(':') => Err(anyhow!(
            "IPv6 MQTT address must be bracketed: {}",
            addr
        )),
        Some((host, port)) => Ok((host.to_string(), parse_port(port, addr)?)),
    }
}

fn parse_port(port: &str, addr: &str) -> Result<u16> {
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    if port == 0 {
        return Err(anyhow!("invalid MQTT port in {}", addr));
    }
    Ok(port)
}

fn mqtt_options(settings: &ChannelSettings, client_id: &str) -> Result<MqttOptions> {
    let endpoint = parse_mqtt_endpoint(&settings.broker_addr)?;
    let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(settings.keep_alive.max(Duration::from_secs(5)));
    options.set_clean_session(true);
    Ok(options)
}

/// Publishing handle for the vision node.
///
/// `connect` blocks until the broker acknowledges the session, so an unreachable
/// broker is reported at startup. After that a helper thread keeps the
/// connection alive and reconnects with a short backoff.
pub struct MqttPublisher {
    client: Client,
    topic: String,
    closing: Arc<AtomicBool>,
}

impl MqttPublisher {
    pub fn connect(settings: &ChannelSettings) -> Result<Self> {
        validate_topic(&settings.topic)?;
        let options = mqtt_options(settings, &settings.vision_client_id)?;
        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);

        wait_for_connack(&mut connection, settings.connect_timeout).with_context(|| {
            format!("failed to connect to MQTT broker {}", settings.broker_addr)
        })?;
        log::info!(
            "connected to MQTT broker {} as {}",
            settings.broker_addr,
            settings.vision_client_id
        );

        let closing = Arc::new(AtomicBool::new(false));
        std::thread::Builder::new()
            .name("mqtt-publisher".to_string())
            .spawn({
                let closing = Arc::clone(&closing);
                move || drive_connection(connection, closing)
            })
            .context("spawn MQTT connection thread")?;

        Ok(Self {
            client,
            topic: settings.topic.clone(),
            closing,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Publisher for MqttPublisher {
    fn publish(&mut self, label: &str) -> Result<()> {
        // try_publish: a full request queue means the link is down; report it
        // instead of blocking the vision loop.
        self.client
            .try_publish(
                self.topic.as_str(),
                QoS::AtLeastOnce,
                false,
                label.as_bytes().to_vec(),
            )
            .with_context(|| format!("publish '{}' to {}", label, self.topic))
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        // The connection thread exits on its own once the session closes.
        if let Err(err) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect failed: {}", err);
        }
    }
}

fn wait_for_connack(connection: &mut Connection, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(anyhow!("no CONNACK within {:?}", timeout));
        }
        match connection.recv_timeout(remaining) {
            Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(anyhow!("broker refused connection: {:?}", ack.code));
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(anyhow::Error::new(err).context("MQTT connection error")),
            Err(RecvTimeoutError::Timeout) => {
                return Err(anyhow!("no CONNACK within {:?}", timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("MQTT event loop closed before CONNACK"))
            }
        }
    }
}

fn drive_connection(mut connection: Connection, closing: Arc<AtomicBool>) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => log::info!("MQTT session established"),
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => break,
            Err(err) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("MQTT connection error: {}; reconnecting", err);
                std::thread::sleep(RECONNECT_BACKOFF);
            }
        }
    }
    log::debug!("MQTT connection thread exiting");
}

/// Receiving handle for the relay node.
///
/// A helper thread drives the connection and hands matching payloads over a
/// channel, so `recv_timeout` never cancels a connect in progress. The
/// subscription is renewed after every CONNACK because sessions are clean.
pub struct MqttSubscriber {
    client: Client,
    deliveries: Receiver<Delivery>,
    topic: String,
    closing: Arc<AtomicBool>,
}

enum Delivery {
    Message(Vec<u8>),
    LinkDown(String),
}

impl MqttSubscriber {
    /// Create the client and start its connection thread. Does not wait for
    /// the broker; the thread keeps reconnecting until one answers.
    pub fn connect(settings: &ChannelSettings) -> Result<Self> {
        validate_topic(&settings.topic)?;
        let options = mqtt_options(settings, &settings.relay_client_id)?;
        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let (tx, deliveries) = mpsc::channel();
        let closing = Arc::new(AtomicBool::new(false));

        std::thread::Builder::new()
            .name("mqtt-subscriber".to_string())
            .spawn({
                let client = client.clone();
                let topic = settings.topic.clone();
                let closing = Arc::clone(&closing);
                move || drive_subscription(connection, client, topic, tx, closing)
            })
            .context("spawn MQTT connection thread")?;

        log::info!(
            "MQTT client {} targeting {}",
            settings.relay_client_id,
            settings.broker_addr
        );
        Ok(Self {
            client,
            deliveries,
            topic: settings.topic.clone(),
            closing,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Subscriber for MqttSubscriber {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.deliveries.recv_timeout(timeout) {
            Ok(Delivery::Message(payload)) => Ok(Some(payload)),
            Ok(Delivery::LinkDown(err)) => Err(anyhow!("MQTT connection error: {}", err)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(anyhow!("MQTT connection thread exited"))
            }
        }
    }
}

impl Drop for MqttSubscriber {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Err(err) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect failed: {}", err);
        }
    }
}

fn drive_subscription(
    mut connection: Connection,
    client: Client,
    topic: String,
    tx: Sender<Delivery>,
    closing: Arc<AtomicBool>,
) {
    let mut subscribe_pending = false;
    for event in connection.iter() {
        let delivery = match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                log::info!("connected to MQTT broker");
                subscribe_pending = true;
                None
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => Some(Delivery::LinkDown(format!(
                "broker refused connection: {:?}",
                ack.code
            ))),
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                log::info!("subscribed to {}", topic);
                None
            }
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == topic => {
                Some(Delivery::Message(publish.payload.to_vec()))
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                log::debug!("ignoring message on unexpected topic {}", publish.topic);
                None
            }
            Ok(_) => None,
            Err(ConnectionError::RequestsDone) => break,
            Err(err) => {
                if closing.load(Ordering::SeqCst) {
                    break;
                }
                // Renewed on the next CONNACK.
                subscribe_pending = false;
                log::warn!("MQTT connection error: {}; reconnecting", err);
                std::thread::sleep(RECONNECT_BACKOFF);
                Some(Delivery::LinkDown(err.to_string()))
            }
        };

        if let Some(delivery) = delivery {
            if tx.send(delivery).is_err() {
                break;
            }
        }

        if subscribe_pending {
            subscribe_pending = !renew_subscription(&client, &topic);
        }
    }
    log::debug!("MQTT subscriber thread exiting");
}

/// Queue a SUBSCRIBE. Returns false when the request queue is full; the caller
/// retries after the next connection event.
fn renew_subscription(client: &Client, topic: &str) -> bool {
    match client.try_subscribe(topic, QoS::AtLeastOnce) {
        Ok(()) => true,
        Err(err) => {
            log::warn!("subscribe to {} failed, retrying: {}", topic, err);
            false
        }
    }
}
