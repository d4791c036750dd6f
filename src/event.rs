//! Drive events.
//!
//! Components take an explicit [`EventSink`] at construction; there is no
//! process-wide event registry. Consumers subscribe through
//! [`EventSink::subscribe`] and receive every event raised after that point.

use tokio::sync::broadcast;

use crate::error::ApiError;

/// Everything the core announces about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DriveMountResult { location: String, result: String },
    DriveMountFailed { location: String, error: ApiError },
    DriveUnmountPending { location: String },
    DriveStopTimedOut { location: String },
    UnmountRequested,
    FileRemovedExternally { api_path: String, source_path: String },
    FilesystemItemOpened { api_path: String, source_path: String, directory: bool },
    FilesystemItemClosed { api_path: String, source_path: String, directory: bool, modified: bool },
    DownloadBegin { api_path: String, chunk: usize },
    DownloadEnd { api_path: String, chunk: usize, error: Option<ApiError> },
    UploadBegin { api_path: String, source_path: String },
    UploadEnd { api_path: String, source_path: String, error: Option<ApiError> },
    UploadRetry { api_path: String, attempt: u32 },
    ItemTimeout { api_path: String },
    PacketClientTimeout { phase: String },
    RemoteServerExpired { client_id: String, thread_id: u64 },
}

/// Broadcast fan-out for [`Event`]. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: broadcast::Sender<Event>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Raises an event; silently dropped when nobody listens.
    pub fn raise(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventSink};

    #[tokio::test]
    async fn subscribers_observe_raised_events() {
        let sink = EventSink::default();
        let mut recv = sink.subscribe();

        sink.raise(Event::UnmountRequested);
        assert_eq!(recv.recv().await.unwrap(), Event::UnmountRequested);
    }

    #[test]
    fn raising_without_subscribers_is_fine() {
        let sink = EventSink::default();
        sink.raise(Event::UnmountRequested);
    }
}
