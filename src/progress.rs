use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Name of the real-time channel progress events are published on.
pub const CHANNEL: &str = "queue_update";

/// Highest progress a non-terminal event may carry; exactly 100 is reserved
/// for `completed`.
const MAX_IN_FLIGHT_PROGRESS: f64 = 99.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: String,
    pub name: String,
    pub status: Status,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

/// Fire-and-forget sink for progress events. Implementations must not block
/// the caller and need not retain events nobody is listening for.
pub trait Publisher: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Publisher for BroadcastPublisher {
    fn publish(&self, event: ProgressEvent) {
        // Err only means there are no subscribers right now.
        let _ = self.tx.send(event);
    }
}

/// Per-execution view of the publisher: remembers the task identity and the
/// highest progress reported so far, so events of one execution never go
/// backwards.
pub struct Reporter<'a> {
    publisher: &'a dyn Publisher,
    id: String,
    name: String,
    reported: f64,
    terminal: bool,
}

impl<'a> Reporter<'a> {
    pub fn new(publisher: &'a dyn Publisher, id: &str, name: &str) -> Self {
        Self {
            publisher,
            id: id.to_string(),
            name: name.to_string(),
            reported: 0.0,
            terminal: false,
        }
    }

    pub fn progress(&self) -> f64 {
        self.reported
    }

    pub fn queued(&mut self) {
        self.emit(Status::Queued, self.reported, None, None);
    }

    pub fn downloading(&mut self, percent: f64) {
        let clamped = percent.clamp(0.0, MAX_IN_FLIGHT_PROGRESS);
        self.reported = self.reported.max(clamped);
        self.emit(Status::Downloading, self.reported, None, None);
    }

    pub fn completed(&mut self, warning: Option<String>) {
        self.reported = 100.0;
        self.emit(Status::Completed, 100.0, warning, None);
        self.terminal = true;
    }

    /// A failed event that is followed by a retry; does not end the
    /// execution.
    pub fn attempt_failed(&mut self, reason: String) {
        self.emit(Status::Failed, self.reported, None, Some(reason));
    }

    pub fn failed(&mut self, reason: String) {
        self.emit(Status::Failed, self.reported, None, Some(reason));
        self.terminal = true;
    }

    pub fn cancelled(&mut self) {
        self.emit(Status::Cancelled, self.reported, None, None);
        self.terminal = true;
    }

    fn emit(&self, status: Status, progress: f64, warning: Option<String>, reason: Option<String>) {
        if self.terminal {
            return;
        }
        self.publisher.publish(ProgressEvent {
            id: self.id.clone(),
            name: self.name.clone(),
            status,
            progress,
            warning,
            reason,
        });
    }
}
