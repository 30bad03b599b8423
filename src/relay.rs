//! Relay node control loop.
//!
//! Receives classification labels, maps each to at most one actuator command,
//! and writes it to the serial link. At most one message is in flight; nothing
//! is buffered or retried.

use anyhow::{Context, Result};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::RelaySettings;
use crate::mapper::{map_label, ActuatorCommand};
use crate::pacing::{Pacer, ThreadPacer};
use crate::serial::{is_transient_write_error, SerialLink};
use crate::transport::Subscriber;

/// Result of handling one receive. Fatal conditions are returned as `Err`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Command written to the serial link.
    Forwarded(ActuatorCommand),
    /// Label has no command. Nothing written.
    Ignored { label: String },
    /// Payload was not UTF-8. Dropped.
    DecodeFailed(String),
    /// Nothing arrived within the poll interval.
    Idle,
    /// Receive failed; the transport reconnects on its own.
    LinkError(String),
    /// Serial write timed out or was interrupted. The command is lost.
    WriteFailed {
        command: ActuatorCommand,
        error: String,
    },
}

impl RelayOutcome {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DecodeFailed(_) | Self::LinkError(_) | Self::WriteFailed { .. }
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub messages: u64,
    pub forwarded: u64,
    pub ignored: u64,
    pub decode_failures: u64,
    pub link_errors: u64,
    pub write_failures: u64,
}

pub struct RelayNode<W: Write> {
    subscriber: Box<dyn Subscriber>,
    serial: SerialLink<W>,
    poll_interval: Duration,
    pacer: Box<dyn Pacer>,
    summary: RelaySummary,
}

impl<W: Write> RelayNode<W> {
    pub fn new(
        settings: &RelaySettings,
        subscriber: Box<dyn Subscriber>,
        serial: SerialLink<W>,
    ) -> Self {
        Self {
            subscriber,
            serial,
            poll_interval: settings.poll_interval,
            pacer: Box::new(ThreadPacer),
            summary: RelaySummary::default(),
        }
    }

    pub fn with_pacer(mut self, pacer: Box<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn serial(&self) -> &SerialLink<W> {
        &self.serial
    }

    pub fn summary(&self) -> &RelaySummary {
        &self.summary
    }

    /// Handle one raw payload.
    ///
    /// Only a non-transient serial write error is fatal.
    pub fn on_message(&mut self, payload: &[u8]) -> Result<RelayOutcome> {
        self.summary.messages += 1;

        let label = match std::str::from_utf8(payload) {
            Ok(label) => label,
            Err(err) => {
                self.summary.decode_failures += 1;
                log::warn!("dropping undecodable message ({} bytes): {}", payload.len(), err);
                return Ok(RelayOutcome::DecodeFailed(err.to_string()));
            }
        };
        log::info!("received: {}", label);

        let Some(command) = map_label(label) else {
            self.summary.ignored += 1;
            log::debug!("no command for label {:?}", label);
            return Ok(RelayOutcome::Ignored {
                label: label.to_string(),
            });
        };

        match self.serial.write_command(command) {
            Ok(()) => {
                self.summary.forwarded += 1;
                log::info!("sent to serial: {}", command);
                Ok(RelayOutcome::Forwarded(command))
            }
            Err(err) if is_transient_write_error(&err) => {
                self.summary.write_failures += 1;
                log::warn!("serial write of {} failed, command dropped: {}", command, err);
                Ok(RelayOutcome::WriteFailed {
                    command,
                    error: err.to_string(),
                })
            }
            Err(err) => Err(err).with_context(|| format!("serial write of {} failed", command)),
        }
    }

    /// Wait up to one poll interval for a message and handle it.
    pub fn poll_once(&mut self) -> Result<RelayOutcome> {
        match self.subscriber.recv_timeout(self.poll_interval) {
            Ok(Some(payload)) => self.on_message(&payload),
            Ok(None) => Ok(RelayOutcome::Idle),
            Err(err) => {
                self.summary.link_errors += 1;
                log::warn!("channel error: {:#}", err);
                // The receive may have returned immediately.
                self.pacer.sleep(self.poll_interval);
                Ok(RelayOutcome::LinkError(format!("{:#}", err)))
            }
        }
    }

    /// Poll until `stop` is raised or a fatal error occurs.
    pub fn run(mut self, stop: &AtomicBool) -> Result<RelaySummary> {
        log::info!("relay loop started (poll every {:?})", self.poll_interval);
        while !stop.load(Ordering::SeqCst) {
            if let Err(err) = self.poll_once() {
                log::error!("relay loop stopped: {:#}", err);
                return Err(err);
            }
        }
        log::info!("relay loop stopped: {:?}", self.summary);
        Ok(self.summary)
    }
}
