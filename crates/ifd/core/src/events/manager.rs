use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{EventDispatcher, IfdEvent};
use crate::CancellationToken;
use crate::channel::ChannelManager;
use crate::config::IfdConfig;
use crate::status::IfdStatus;
use crate::watcher::EventWatcher;

/// Background thread translating terminal state changes into events
#[derive(Debug)]
pub struct EventManager {
    token: CancellationToken,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventManager {
    /// Spawn the event thread
    pub fn start(
        manager: Arc<ChannelManager>,
        dispatcher: EventDispatcher,
        config: &IfdConfig,
    ) -> std::io::Result<Self> {
        let token = CancellationToken::new();
        let runner = Runner {
            manager,
            dispatcher,
            token: token.clone(),
            config: config.clone(),
            known: Vec::new(),
        };
        let thread = thread::Builder::new()
            .name(format!("{}-events", config.thread_name))
            .spawn(move || runner.run())?;
        Ok(Self {
            token,
            thread: Some(thread),
        })
    }

    /// Ask the thread to stop. A wait in progress is interrupted, the thread
    /// is not joined.
    pub fn stop(&mut self) {
        self.token.cancel();
        self.thread.take();
    }

    /// Whether the thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for EventManager {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Runner {
    manager: Arc<ChannelManager>,
    dispatcher: EventDispatcher,
    token: CancellationToken,
    config: IfdConfig,
    known: Vec<IfdStatus>,
}

impl Runner {
    fn run(mut self) {
        info!("event manager started");
        let mut failures = 0usize;
        while !self.token.is_cancelled() {
            match self.watch() {
                Ok(()) => break,
                Err(e) if self.token.is_cancelled() => {
                    debug!(error = %e, "event manager interrupted");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.config.backoff_for(failures);
                    warn!(error = %e, failures, ?delay, "waiting for terminal events failed");
                    self.sleep(delay);
                }
            }
        }
        info!("event manager stopped");
    }

    // Runs until cancelled or the provider fails
    fn watch(&mut self) -> crate::scio::ScioResult<()> {
        let mut watcher = EventWatcher::start(Arc::clone(&self.manager))?;
        while !self.token.is_cancelled() {
            let diff = watcher.wait_and_update(&self.known, Duration::MAX, &self.token)?;
            self.publish(diff);
        }
        Ok(())
    }

    fn publish(&mut self, diff: Vec<IfdStatus>) {
        for status in diff {
            let old = self.known.iter().position(|s| s.name == status.name);
            match (old, status.connected) {
                (None, true) => {
                    self.dispatcher
                        .notify(IfdEvent::TerminalAdded(status.clone()));
                    if status.card_available() {
                        self.dispatcher
                            .notify(IfdEvent::CardInserted(status.clone()));
                    }
                    self.known.push(status);
                }
                (None, false) => {}
                (Some(pos), false) => {
                    let old = self.known.remove(pos);
                    if old.card_available() {
                        self.dispatcher.notify(IfdEvent::CardRemoved(status.clone()));
                    }
                    self.dispatcher.notify(IfdEvent::TerminalRemoved(status));
                }
                (Some(pos), true) => {
                    match (self.known[pos].card_available(), status.card_available()) {
                        (false, true) => self
                            .dispatcher
                            .notify(IfdEvent::CardInserted(status.clone())),
                        (true, false) => self
                            .dispatcher
                            .notify(IfdEvent::CardRemoved(status.clone())),
                        _ => {}
                    }
                    self.known[pos] = status;
                }
            }
        }
    }

    fn sleep(&self, delay: Duration) {
        let Some(deadline) = Instant::now().checked_add(delay) else {
            return;
        };
        while !self.token.is_cancelled() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            thread::sleep(left.min(Duration::from_millis(10)));
        }
    }
}
