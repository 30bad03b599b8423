use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use super::{Publisher, Subscriber};

/// Connected in-process publisher/subscriber pair.
pub fn loopback() -> (MemoryPublisher, MemorySubscriber) {
    let (tx, rx) = mpsc::channel();
    (MemoryPublisher { tx }, MemorySubscriber { rx })
}

#[derive(Clone)]
pub struct MemoryPublisher {
    tx: Sender<Vec<u8>>,
}

impl MemoryPublisher {
    /// Push raw bytes, bypassing the label path. Used to feed malformed payloads.
    pub fn publish_bytes(&self, payload: &[u8]) -> Result<()> {
        self.tx
            .send(payload.to_vec())
            .map_err(|_| anyhow!("loopback subscriber dropped"))
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&mut self, label: &str) -> Result<()> {
        self.publish_bytes(label.as_bytes())
    }
}

pub struct MemorySubscriber {
    rx: Receiver<Vec<u8>>,
}

impl Subscriber for MemorySubscriber {
    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("loopback publisher dropped")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_order() {
        let (mut publisher, mut subscriber) = loopback();
        publisher.publish("ripe").unwrap();
        publisher.publish("mold").unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(subscriber.recv_timeout(timeout).unwrap().unwrap(), b"ripe");
        assert_eq!(subscriber.recv_timeout(timeout).unwrap().unwrap(), b"mold");
        assert!(subscriber.recv_timeout(timeout).unwrap().is_none());
    }

    #[test]
    fn dropped_publisher_is_a_link_error() {
        let (publisher, mut subscriber) = loopback();
        drop(publisher);
        assert!(subscriber.recv_timeout(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn dropped_subscriber_fails_publish() {
        let (mut publisher, subscriber) = loopback();
        drop(subscriber);
        assert!(publisher.publish("ripe").is_err());
    }
}
