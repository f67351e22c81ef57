//! Process-level event bus (component #10, spec.md §2 and §6).
//!
//! The core subscribes to `Migrating`/`Aborting`/`PersistState`/`SystemInfo`
//! the way `fusillade`'s Postgres manager fans out request-update
//! notifications over a channel (`PgListener` → `mpsc` → `Stream`); here the
//! transport is a plain `tokio::sync::broadcast` channel since events are
//! process-local, not cross-process.

use tokio::sync::broadcast;

use crate::system_status::SystemSnapshot;

/// A process-level signal the core reacts to, or that other components may
/// emit for each other to observe.
#[derive(Debug, Clone)]
pub enum CrawlerEvent {
    /// The process is about to be migrated to a new host; components
    /// should persist state and pause.
    Migrating,
    /// The crawl is being aborted; dispatch should cease without draining.
    Aborting,
    /// A periodic or triggered request to persist component state.
    PersistState,
    /// A fresh system resource snapshot, for observers other than
    /// `SystemStatus` itself.
    SystemInfo(SystemSnapshot),
    /// A session was retired, either for usage/error exhaustion or an
    /// explicit blocked-status `retire()` (spec.md §4.3).
    SessionRetired(crate::session::SessionId),
}

/// Broadcast bus for [`CrawlerEvent`]s.
///
/// Cloning an `EventBus` is cheap and shares the same underlying channel,
/// matching `broadcast::Sender`'s own clone semantics.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CrawlerEvent>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity (how many
    /// un-consumed events a lagging subscriber may fall behind by before
    /// it starts missing them).
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to future events. Events emitted before this call are not
    /// replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<CrawlerEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all current subscribers. Returns the number of
    /// receivers the event was delivered to; `0` is not an error, it just
    /// means nobody is currently listening.
    pub fn emit(&self, event: CrawlerEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(CrawlerEvent::Aborting);

        assert!(matches!(rx1.recv().await.unwrap(), CrawlerEvent::Aborting));
        assert!(matches!(rx2.recv().await.unwrap(), CrawlerEvent::Aborting));
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        assert_eq!(bus.emit(CrawlerEvent::PersistState), 0);
    }
}
