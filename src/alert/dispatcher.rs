use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{AlertEvent, CooldownGate, EvidenceStore, Rectangle};
use crate::mqtt::PublishError;

/// One object reported by the external detector for a single frame
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: Rectangle,
}

/// Outbound half of the transport, as seen from the frame loop. Implementations must return
/// promptly; a slow broker is reported as an error, never waited on.
pub trait AlertPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct DispatchSettings {
    pub topic: String,
    pub location: String,
    pub target_label: String,
    pub confidence_threshold: f32,
}

#[derive(Debug, PartialEq, Clone)]
pub enum FrameOutcome {
    /// No qualifying detection inside the zone
    Clear,
    /// Intrusion seen but an alert was accepted less than a cooldown ago
    Suppressed,
    /// Alert accepted. Either side effect may have failed independently.
    Dispatched {
        event: AlertEvent,
        evidence: Option<PathBuf>,
        published: bool,
    },
}

/// Publisher side decision pipeline: zone test, cooldown, evidence then publish
pub struct Dispatcher<P, E> {
    settings: DispatchSettings,
    gate: CooldownGate,
    publisher: P,
    evidence: E,
}

impl<P: AlertPublisher, E: EvidenceStore> Dispatcher<P, E> {
    pub fn new(settings: DispatchSettings, gate: CooldownGate, publisher: P, evidence: E) -> Self {
        Self {
            settings,
            gate,
            publisher,
            evidence,
        }
    }

    /// Whether any detection of the target class, at or above the threshold, has its center in the zone
    pub fn is_intruding(&self, detections: &[Detection], zone: &Rectangle) -> bool {
        detections
            .iter()
            .filter(|d| {
                d.label == self.settings.target_label
                    && d.confidence >= self.settings.confidence_threshold
            })
            .any(|d| zone.contains(d.bbox.center()))
    }

    pub fn on_frame(
        &self,
        image: &[u8],
        detections: &[Detection],
        zone: &Rectangle,
        now: DateTime<Local>,
    ) -> FrameOutcome {
        if !self.is_intruding(detections, zone) {
            return FrameOutcome::Clear;
        }
        // The window is consumed here whatever happens to the evidence or the publish below
        if !self.gate.try_accept(now) {
            debug!("Intrusion within cooldown, alert suppressed");
            return FrameOutcome::Suppressed;
        }

        let evidence = match self.evidence.capture(image, now) {
            Ok(path) => {
                info!(path = %path.display(), "Evidence saved");
                Some(path)
            }
            Err(e) => {
                error!("Unable to save evidence: {}", e);
                None
            }
        };

        let event = AlertEvent::intrusion(now, self.settings.location.clone());
        let published = match self.publisher.publish(&self.settings.topic, event.encode()) {
            Ok(()) => {
                info!(topic = %self.settings.topic, location = %event.location, timestamp = %event.timestamp, "Intrusion alert published");
                true
            }
            Err(e) => {
                warn!(topic = %self.settings.topic, "Unable to publish intrusion alert: {}", e);
                false
            }
        };

        FrameOutcome::Dispatched {
            event,
            evidence,
            published,
        }
    }

    #[cfg(test)]
    pub fn gate(&self) -> &CooldownGate {
        &self.gate
    }

    #[cfg(test)]
    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn into_publisher(self) -> P {
        self.publisher
    }
}
