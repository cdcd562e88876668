//! Terminal events and their subscribers

mod manager;

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, unbounded};
use derive_more::Display;
use parking_lot::Mutex;
use tracing::trace;

pub use manager::EventManager;

use crate::channel::SlotHandle;
use crate::status::IfdStatus;

/// Event published to subscribers
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum IfdEvent {
    /// A terminal was attached
    #[display("terminal added: {}", _0.name)]
    TerminalAdded(IfdStatus),
    /// A terminal was detached
    #[display("terminal removed: {}", _0.name)]
    TerminalRemoved(IfdStatus),
    /// A card was inserted
    #[display("card inserted: {}", _0.name)]
    CardInserted(IfdStatus),
    /// A card was removed
    #[display("card removed: {}", _0.name)]
    CardRemoved(IfdStatus),
    /// A card was reset through `disconnect`
    #[display("card reset: {terminal}")]
    CardReset {
        /// Terminal name
        terminal: String,
        /// Handle of the closed channel
        handle: SlotHandle,
    },
    /// Devices were powered up
    #[display("devices prepared")]
    PrepareDevices,
    /// Devices were powered down
    #[display("devices powered down")]
    PowerDownDevices,
}

impl IfdEvent {
    /// Terminal the event refers to, if any
    pub fn terminal(&self) -> Option<&str> {
        match self {
            Self::TerminalAdded(s)
            | Self::TerminalRemoved(s)
            | Self::CardInserted(s)
            | Self::CardRemoved(s) => Some(&s.name),
            Self::CardReset { terminal, .. } => Some(terminal),
            Self::PrepareDevices | Self::PowerDownDevices => None,
        }
    }
}

/// Fan out of events to any number of subscribers
#[derive(Debug, Clone, Default)]
pub struct EventDispatcher {
    subscribers: Arc<Mutex<Vec<Sender<IfdEvent>>>>,
}

impl EventDispatcher {
    /// Create a dispatcher without subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive all events published from now on
    pub fn subscribe(&self) -> Receiver<IfdEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish an event. Subscribers that dropped their receiver are
    /// forgotten.
    pub fn notify(&self, event: IfdEvent) {
        trace!(%event, "publishing event");
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_and_cleanup() {
        let dispatcher = EventDispatcher::new();
        let a = dispatcher.subscribe();
        let b = dispatcher.subscribe();

        dispatcher.notify(IfdEvent::PrepareDevices);
        assert_eq!(a.try_recv().unwrap(), IfdEvent::PrepareDevices);
        assert_eq!(b.try_recv().unwrap(), IfdEvent::PrepareDevices);

        drop(b);
        dispatcher.notify(IfdEvent::PowerDownDevices);
        assert_eq!(dispatcher.subscriber_count(), 1);
        assert_eq!(a.try_recv().unwrap(), IfdEvent::PowerDownDevices);
    }

    #[test]
    fn test_event_terminal() {
        let event = IfdEvent::CardInserted(IfdStatus::empty("Reader1"));
        assert_eq!(event.terminal(), Some("Reader1"));
        assert_eq!(event.to_string(), "card inserted: Reader1");
        assert_eq!(IfdEvent::PrepareDevices.terminal(), None);
    }
}
