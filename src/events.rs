//! Events emitted by the download queue.
//!
//! The queue reports everything a frontend needs to render through a single
//! event stream: per-entry status transitions, progress updates, resolved
//! metadata for lazily expanded collections, and network connectivity
//! changes. Consumers receive events over an unbounded channel so that a
//! slow frontend can never stall a download worker.

use tokio::sync::mpsc;

use crate::{item::WorkItem, queue::DownloadStatus};

/// Events that can be emitted by the download queue.
#[derive(Clone, Debug)]
pub enum Event {
    /// An entry moved to a new status.
    ///
    /// Terminal statuses carry a human-readable message suitable for direct
    /// display, e.g. a partial-success summary or an error description.
    StatusChanged {
        entry_id: String,
        status: DownloadStatus,
        message: String,
    },

    /// An entry's overall progress changed.
    Progress {
        entry_id: String,
        percent: f64,
        message: String,
    },

    /// A collection entry finished expanding and now carries its children.
    MetadataResolved { entry_id: String, item: WorkItem },

    /// Network connectivity flipped, as observed by the periodic probe.
    NetworkStatus { connected: bool },
}

/// Sending half of the event stream, held by the queue.
///
/// Sends never block and never fail visibly: once the receiving side is
/// gone, events are dropped silently. The queue must keep running whether or
/// not anyone is listening.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    pub fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            trace!("event receiver dropped, discarding event");
        }
    }
}

/// Creates a connected event sink and receiver pair.
#[must_use]
pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}
