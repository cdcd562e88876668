//! Terminal state tracking on top of a provider watcher
//!
//! The watcher keeps the current status of every terminal and diffs it
//! against the status a caller expects. A diff lists every terminal whose
//! state differs, plus expected terminals that vanished (reported as not
//! connected).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::CancellationToken;
use crate::channel::ChannelManager;
use crate::scio::{ScioResult, StateChangeEvent, TerminalWatcher};
use crate::status::{IfdStatus, SlotStatus};

/// Grace period used to collect bursts of events
const DRAIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Tracks terminal state changes
pub struct EventWatcher {
    manager: Arc<ChannelManager>,
    watcher: Box<dyn TerminalWatcher>,
    current: Vec<IfdStatus>,
}

impl std::fmt::Debug for EventWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWatcher")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl EventWatcher {
    /// Start watching and take the initial snapshot
    pub fn start(manager: Arc<ChannelManager>) -> ScioResult<Self> {
        let mut watcher = manager.terminals().watcher()?;
        let current = watcher
            .start()?
            .into_iter()
            .map(|t| {
                let slot = SlotStatus {
                    index: 0,
                    card_available: t.card_present,
                    atr: None,
                };
                IfdStatus::new(t.name, true, vec![slot])
            })
            .collect();
        Ok(Self {
            manager,
            watcher,
            current,
        })
    }

    /// Copy of the current state
    pub fn current_state(&self) -> Vec<IfdStatus> {
        self.current.clone()
    }

    /// Terminals whose state differs from `expected`. Empty when nothing
    /// changed.
    pub fn compare(&self, expected: &[IfdStatus]) -> Vec<IfdStatus> {
        let mut remaining = self.current.clone();
        for next in expected {
            match remaining.iter().position(|s| s.name == next.name) {
                Some(pos) if remaining[pos].state_equals(next) => {
                    remaining.remove(pos);
                }
                Some(_) => {}
                None => {
                    let mut gone = next.clone();
                    gone.connected = false;
                    remaining.push(gone);
                }
            }
        }
        remaining
    }

    /// Block until the state differs from `expected` or the timeout
    /// expires. Returns the diff, empty on timeout.
    pub fn wait_and_update(
        &mut self,
        expected: &[IfdStatus],
        timeout: Duration,
        token: &CancellationToken,
    ) -> ScioResult<Vec<IfdStatus>> {
        let diff = self.compare(expected);
        if !diff.is_empty() {
            return Ok(diff);
        }

        let Some(first) = self.watcher.wait_for_change(timeout, token)? else {
            trace!("wait timed out");
            return Ok(Vec::new());
        };
        let mut events = vec![first];
        while let Some(next) = self.watcher.wait_for_change(DRAIN_TIMEOUT, token)? {
            events.push(next);
        }

        for event in events {
            self.update(event);
        }
        Ok(self.compare(expected))
    }

    fn entry(&mut self, name: &str) -> &mut IfdStatus {
        let pos = match self.current.iter().position(|s| s.name == name) {
            Some(pos) => pos,
            None => {
                self.current.push(IfdStatus::empty(name));
                self.current.len() - 1
            }
        };
        let status = &mut self.current[pos];
        if status.slots.is_empty() {
            status.slots.push(SlotStatus::empty(0));
        }
        status
    }

    fn update(&mut self, event: StateChangeEvent) {
        debug!(?event, "terminal state changed");
        match event {
            StateChangeEvent::TerminalAdded(name) => {
                let status = self.entry(&name);
                *status = IfdStatus::empty(name);
            }
            StateChangeEvent::CardInserted(name) => {
                let slot = match self.manager.open_master(&name) {
                    Ok(master) => SlotStatus::with_card(0, Some(master.atr())),
                    Err(e) => {
                        debug!(terminal = %name, error = %e, "card not usable");
                        self.manager.close_master(&name);
                        SlotStatus::empty(0)
                    }
                };
                let status = self.entry(&name);
                status.connected = true;
                status.slots[0] = slot;
            }
            StateChangeEvent::CardRemoved(name) => {
                self.manager.close_master(&name);
                self.entry(&name).slots[0] = SlotStatus::empty(0);
            }
            StateChangeEvent::TerminalRemoved(name) => {
                self.manager.close_master(&name);
                let status = self.entry(&name);
                status.connected = false;
                status.slots[0] = SlotStatus::empty(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::scio::mock::MockTerminals;

    fn setup() -> (MockTerminals, Arc<ChannelManager>) {
        let mock = MockTerminals::new();
        mock.add_terminal("Reader1");
        let manager = Arc::new(ChannelManager::new(Arc::new(mock.clone())));
        (mock, manager)
    }

    #[test]
    fn test_compare_is_idempotent() {
        let (_mock, manager) = setup();
        let watcher = EventWatcher::start(Arc::clone(&manager)).unwrap();
        let current = watcher.current_state();
        assert!(watcher.compare(&current).is_empty());

        let expected = vec![IfdStatus::new(
            "Reader1",
            true,
            vec![SlotStatus::with_card(0, None)],
        )];
        let first = watcher.compare(&expected);
        let second = watcher.compare(&expected);
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert!(!first[0].slots[0].card_available);
    }

    #[test]
    fn test_unknown_expected_is_disconnected() {
        let (_mock, manager) = setup();
        let watcher = EventWatcher::start(Arc::clone(&manager)).unwrap();
        let mut expected = watcher.current_state();
        expected.push(IfdStatus::empty("Reader2"));

        let diff = watcher.compare(&expected);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].name, "Reader2");
        assert!(!diff[0].connected);
    }

    #[test]
    fn test_card_insert_wakes_wait() {
        let (mock, manager) = setup();
        let mut watcher = EventWatcher::start(Arc::clone(&manager)).unwrap();
        let expected = watcher.current_state();

        let inserter = mock.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            inserter.insert_card("Reader1", &[0x3B, 0x02, 0x14, 0x50]);
        });

        let diff = watcher
            .wait_and_update(&expected, Duration::from_secs(5), &CancellationToken::new())
            .unwrap();
        handle.join().unwrap();

        assert_eq!(diff.len(), 1);
        assert!(diff[0].slots[0].card_available);
        assert_eq!(
            diff[0].slots[0].atr.as_deref(),
            Some(&[0x3B, 0x02, 0x14, 0x50][..])
        );
        assert!(manager.master("Reader1").is_some());
    }

    #[test]
    fn test_burst_is_batched() {
        let (mock, manager) = setup();
        let mut watcher = EventWatcher::start(Arc::clone(&manager)).unwrap();
        let expected = watcher.current_state();

        mock.insert_card("Reader1", &[0x3B, 0x00]);
        mock.remove_card("Reader1");
        mock.add_terminal("Reader2");

        let diff = watcher
            .wait_and_update(&expected, Duration::from_secs(5), &CancellationToken::new())
            .unwrap();
        // Reader1 ends up as expected, only the new terminal differs
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].name, "Reader2");
        assert!(manager.master("Reader1").is_none());
    }

    #[test]
    fn test_timeout_and_cancel() {
        let (_mock, manager) = setup();
        let mut watcher = EventWatcher::start(Arc::clone(&manager)).unwrap();
        let expected = watcher.current_state();

        let diff = watcher
            .wait_and_update(&expected, Duration::from_millis(20), &CancellationToken::new())
            .unwrap();
        assert!(diff.is_empty());

        let token = CancellationToken::new();
        token.cancel();
        let err = watcher
            .wait_and_update(&expected, Duration::from_secs(5), &token)
            .unwrap_err();
        assert_eq!(err.code, crate::scio::ScioErrorCode::Cancelled);
    }

    #[test]
    fn test_terminal_removed() {
        let (mock, manager) = setup();
        mock.insert_card("Reader1", &[0x3B, 0x00]);
        let mut watcher = EventWatcher::start(Arc::clone(&manager)).unwrap();
        let expected = watcher.current_state();
        assert!(expected[0].slots[0].card_available);

        mock.remove_terminal("Reader1");
        let diff = watcher
            .wait_and_update(&expected, Duration::from_secs(5), &CancellationToken::new())
            .unwrap();
        assert_eq!(diff.len(), 1);
        assert!(!diff[0].connected);
        assert!(!diff[0].slots[0].card_available);
    }
}
