//! Source event plumbing shared by the stream and polling sources.
//!
//! Sources never mutate Controller state directly; they only emit events
//! over an mpsc channel that the Controller drains serially. This keeps the
//! cache single-writer even though sources run as independent background
//! tasks.

use crate::core::data::Datafile;

/// An event emitted by a primary data source (stream or polling).
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A new datafile arrived. Must still pass `is_newer_data` before it is
    /// admitted to the cache.
    Data(Datafile),
    /// The source established a live connection (stream: first byte of
    /// data; polling has no concept of "connected" beyond a successful
    /// poll, so it does not emit this).
    Connected,
    /// The source's connection was torn down (transport error, server
    /// close, or explicit `stop()`).
    Disconnected,
    /// A non-fatal error occurred; the source keeps running.
    Error(String),
}

/// Sending half of the source event channel.
pub type SourceEventSender = tokio::sync::mpsc::Sender<SourceEvent>;

/// Receiving half of the source event channel.
pub type SourceEventReceiver = tokio::sync::mpsc::Receiver<SourceEvent>;

/// Bounded channel capacity for source event plumbing. Datafile delivery is
/// not backpressured at the application level — the Controller only ever
/// cares about the latest admitted datafile — but the channel itself still
/// needs a bound to avoid unbounded buffering if the Controller is slow to
/// drain.
pub const SOURCE_EVENT_CHANNEL_CAPACITY: usize = 32;

/// Create a fresh source event channel.
pub fn source_event_channel() -> (SourceEventSender, SourceEventReceiver) {
    tokio::sync::mpsc::channel(SOURCE_EVENT_CHANNEL_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_round_trips_an_event() {
        let (tx, mut rx) = source_event_channel();
        tx.send(SourceEvent::Connected).await.unwrap();
        match rx.recv().await {
            Some(SourceEvent::Connected) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
