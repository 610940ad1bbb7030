mod cooldown;
mod dispatcher;
mod event;
mod evidence;
mod geometry;
mod listener;

pub use cooldown::CooldownGate;
pub use dispatcher::{AlertPublisher, Detection, DispatchSettings, Dispatcher, FrameOutcome};
pub use event::{decode, AlertEvent};
pub use evidence::{DirectoryStore, EvidenceError, EvidenceStore};
pub use geometry::Rectangle;
pub use listener::{Listener, NotificationSink, TerminalSink};

#[cfg(test)]
pub(crate) use dispatcher::test as fakes;
