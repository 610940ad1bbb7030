use std::io::Write;

use colored::Colorize;
use tracing::{error, info};

use super::{decode, AlertEvent};

/// Where decoded intrusion alerts end up on the monitor
pub trait NotificationSink {
    /// Present the alert on the high visibility channel
    fn intrusion(&mut self, location: &str, timestamp: &str);
    /// Draw the operator's attention (beep, flash, ...)
    fn attention(&mut self);
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageOutcome {
    Alerted { location: String, timestamp: String },
    Informational(AlertEvent),
    Dropped,
}

/// Subscriber side handler. Never fails: bad payloads are logged and discarded.
pub struct Listener<S> {
    sink: S,
}

impl<S: NotificationSink> Listener<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn on_message(&mut self, payload: &[u8]) -> MessageOutcome {
        let event = match decode(payload) {
            Ok(event) => event,
            Err(e) => {
                error!(payload = %String::from_utf8_lossy(payload), "Dropping undecodable message: {}", e);
                return MessageOutcome::Dropped;
            }
        };

        if event.status.is_intrusion() {
            self.sink.intrusion(&event.location, &event.timestamp);
            self.sink.attention();
            MessageOutcome::Alerted {
                location: event.location,
                timestamp: event.timestamp,
            }
        } else {
            info!(status = %event.status, location = %event.location, timestamp = %event.timestamp, "Received non-alert message");
            MessageOutcome::Informational(event)
        }
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

/// Prints alerts in bold red and rings the terminal bell
pub struct TerminalSink<W> {
    out: W,
}

impl TerminalSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> TerminalSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> NotificationSink for TerminalSink<W> {
    fn intrusion(&mut self, location: &str, timestamp: &str) {
        let line = format!(
            "[ALERT] Intruder detected! Evidence captured. Location: {} Time: {}",
            location, timestamp
        );
        if let Err(e) = writeln!(self.out, "{}", line.red().bold()) {
            error!("Unable to write alert to terminal: {}", e);
        }
    }

    fn attention(&mut self) {
        // BEL, terminals without a bell just ignore it
        let _ = self.out.write_all(b"\x07");
        let _ = self.out.flush();
    }
}
