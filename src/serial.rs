//! Serial command link to the sorting mechanism.
//!
//! Payload is one command character followed by `\n`. No framing, no checksum,
//! nothing is read back.

use anyhow::{Context, Result};
use std::io::{self, Write};
use std::time::Duration;

use crate::mapper::ActuatorCommand;

/// Baud rate the mechanism's microcontroller listens on.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Write half of the serial link. Generic over the writer so tests can capture
/// the exact bytes.
pub struct SerialLink<W: Write> {
    writer: W,
    commands_written: u64,
}

impl SerialLink<Box<dyn serialport::SerialPort>> {
    /// Open a serial device at `baud_rate`, 8N1, no flow control.
    pub fn open(path: &str, baud_rate: u32, write_timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(write_timeout)
            .open()
            .with_context(|| format!("open serial port {} at {} baud", path, baud_rate))?;
        log::info!("serial link open on {} ({} baud)", path, baud_rate);
        Ok(Self::new(port))
    }
}

impl<W: Write> SerialLink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            commands_written: 0,
        }
    }

    /// Write one command and flush. Blocks until the bytes are handed to the device.
    pub fn write_command(&mut self, command: ActuatorCommand) -> io::Result<()> {
        self.writer.write_all(&command.wire_bytes())?;
        self.writer.flush()?;
        self.commands_written += 1;
        Ok(())
    }

    pub fn commands_written(&self) -> u64 {
        self.commands_written
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Write errors that may clear up on the next message (slow or busy device).
/// Everything else means the device is gone.
pub fn is_transient_write_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_command_and_newline() {
        let mut link = SerialLink::new(Vec::new());
        link.write_command(ActuatorCommand::Ripe).unwrap();
        link.write_command(ActuatorCommand::Mold).unwrap();
        assert_eq!(link.get_ref().as_slice(), b"R\nM\n");
        assert_eq!(link.commands_written(), 2);
    }

    #[test]
    fn classifies_write_errors() {
        assert!(is_transient_write_error(&io::Error::from(
            io::ErrorKind::TimedOut
        )));
        assert!(!is_transient_write_error(&io::Error::from(
            io::ErrorKind::BrokenPipe
        )));
        assert!(!is_transient_write_error(&io::Error::from(
            io::ErrorKind::NotFound
        )));
    }
}
