use super::queue::QueueState;
use super::status::PackageStatus;
use crate::error::FilepoolError;
use tokio::sync::broadcast;

/// Notifications published by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum FilepoolEvent {
    /// The queue started transferring a file
    FileDownloading { site_id: String, file_id: String },
    /// A file is available locally (freshly downloaded or already current)
    FileDownloaded { site_id: String, file_id: String },
    /// A queued transfer failed; `dropped` tells whether it left the queue
    FileDownloadFailed {
        site_id: String,
        file_id: String,
        error: FilepoolError,
        dropped: bool,
    },
    /// Transfer progress of the file the queue is working on
    QueueProgress {
        site_id: String,
        file_id: String,
        loaded: u64,
        total: Option<u64>,
    },
    PackageStatusChanged {
        site_id: String,
        component: String,
        component_id: Option<String>,
        status: PackageStatus,
    },
    QueueStateChanged(QueueState),
}

/// Fan-out of engine events. Slow subscribers lose the oldest events.
pub struct EventBus {
    tx: broadcast::Sender<FilepoolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FilepoolEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: FilepoolEvent) {
        tracing::trace!("Event: {:?}", event);
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(FilepoolEvent::QueueStateChanged(QueueState::Running));
        assert_eq!(
            rx.recv().await.unwrap(),
            FilepoolEvent::QueueStateChanged(QueueState::Running)
        );
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(FilepoolEvent::FileDownloaded {
            site_id: "s".into(),
            file_id: "f".into(),
        });
    }
}
