//! In-memory provider used by the unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;

use super::*;

#[derive(Debug, Default)]
struct MockTerminal {
    name: String,
    atr: Option<Bytes>,
    contactless: bool,
}

#[derive(Debug, Default)]
struct MockState {
    terminals: Vec<MockTerminal>,
    responses: VecDeque<Bytes>,
    control_responses: HashMap<u32, VecDeque<Bytes>>,
    transmitted: Vec<Vec<u8>>,
    controls: Vec<(u32, Vec<u8>)>,
    watchers: Vec<Sender<StateChangeEvent>>,
    connects: usize,
    disconnects: usize,
    resets: usize,
    fail_exclusive: bool,
    fail_disconnect: bool,
    exclusive_held: bool,
    prepare: Option<ScioResult<bool>>,
    powered: bool,
}

/// Scriptable provider
#[derive(Debug, Clone, Default)]
pub(crate) struct MockTerminals {
    state: Arc<Mutex<MockState>>,
}

impl MockTerminals {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn publish(state: &mut MockState, event: StateChangeEvent) {
        state.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn add_terminal(&self, name: &str) {
        let mut state = self.state.lock();
        state.terminals.push(MockTerminal {
            name: name.to_owned(),
            ..Default::default()
        });
        Self::publish(&mut state, StateChangeEvent::TerminalAdded(name.to_owned()));
    }

    pub(crate) fn add_contactless_terminal(&self, name: &str) {
        self.add_terminal(name);
        if let Some(t) = self.state.lock().terminals.iter_mut().find(|t| t.name == name) {
            t.contactless = true;
        }
    }

    pub(crate) fn remove_terminal(&self, name: &str) {
        let mut state = self.state.lock();
        state.terminals.retain(|t| t.name != name);
        Self::publish(&mut state, StateChangeEvent::TerminalRemoved(name.to_owned()));
    }

    pub(crate) fn insert_card(&self, name: &str, atr: &[u8]) {
        let mut state = self.state.lock();
        if let Some(t) = state.terminals.iter_mut().find(|t| t.name == name) {
            t.atr = Some(Bytes::copy_from_slice(atr));
        }
        Self::publish(&mut state, StateChangeEvent::CardInserted(name.to_owned()));
    }

    pub(crate) fn remove_card(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(t) = state.terminals.iter_mut().find(|t| t.name == name) {
            t.atr = None;
        }
        Self::publish(&mut state, StateChangeEvent::CardRemoved(name.to_owned()));
    }

    pub(crate) fn push_response(&self, response: &[u8]) {
        self.state
            .lock()
            .responses
            .push_back(Bytes::copy_from_slice(response));
    }

    pub(crate) fn push_control_response(&self, code: u32, response: &[u8]) {
        self.state
            .lock()
            .control_responses
            .entry(code)
            .or_default()
            .push_back(Bytes::copy_from_slice(response));
    }

    pub(crate) fn set_fail_exclusive(&self, fail: bool) {
        self.state.lock().fail_exclusive = fail;
    }

    pub(crate) fn set_fail_disconnect(&self, fail: bool) {
        self.state.lock().fail_disconnect = fail;
    }

    pub(crate) fn set_prepare(&self, outcome: ScioResult<bool>) {
        self.state.lock().prepare = Some(outcome);
    }

    pub(crate) fn transmitted(&self) -> Vec<Vec<u8>> {
        self.state.lock().transmitted.clone()
    }

    pub(crate) fn controls(&self) -> Vec<(u32, Vec<u8>)> {
        self.state.lock().controls.clone()
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.lock().connects
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    pub(crate) fn resets(&self) -> usize {
        self.state.lock().resets
    }
}

impl TerminalFactory for MockTerminals {
    fn create(&self) -> ScioResult<Arc<dyn ScioTerminals>> {
        Ok(Arc::new(self.clone()))
    }
}

impl ScioTerminals for MockTerminals {
    fn list(&self) -> ScioResult<Vec<TerminalState>> {
        Ok(self
            .state
            .lock()
            .terminals
            .iter()
            .map(|t| TerminalState::new(t.name.clone(), t.atr.is_some()))
            .collect())
    }

    fn connect(&self, name: &str, protocol: ScioProtocol) -> ScioResult<Box<dyn ScioCard>> {
        let mut state = self.state.lock();
        let terminal = state
            .terminals
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ScioError::no_such_terminal(name))?;
        let atr = terminal
            .atr
            .clone()
            .ok_or_else(|| ScioError::new(ScioErrorCode::NoSmartcard, "no card present"))?;
        state.connects += 1;
        Ok(Box::new(MockCard {
            state: Arc::clone(&self.state),
            terminal: name.to_owned(),
            atr,
            protocol,
        }))
    }

    fn watcher(&self) -> ScioResult<Box<dyn TerminalWatcher>> {
        let (tx, rx) = unbounded();
        self.state.lock().watchers.push(tx);
        Ok(Box::new(MockWatcher {
            state: Arc::clone(&self.state),
            events: rx,
        }))
    }

    fn is_contactless(&self, name: &str) -> bool {
        self.state
            .lock()
            .terminals
            .iter()
            .any(|t| t.name == name && t.contactless)
    }

    fn prepare_devices(&self) -> ScioResult<bool> {
        let mut state = self.state.lock();
        let outcome = state.prepare.clone().unwrap_or(Ok(false));
        if outcome.is_ok() {
            state.powered = true;
        }
        outcome
    }

    fn power_down_devices(&self) -> bool {
        std::mem::take(&mut self.state.lock().powered)
    }
}

#[derive(Debug)]
pub(crate) struct MockCard {
    state: Arc<Mutex<MockState>>,
    terminal: String,
    atr: Bytes,
    protocol: ScioProtocol,
}

impl MockCard {
    fn check_present(&self, state: &MockState) -> ScioResult<()> {
        match state.terminals.iter().find(|t| t.name == self.terminal) {
            Some(t) if t.atr.is_some() => Ok(()),
            Some(_) => Err(ScioError::new(ScioErrorCode::RemovedCard, "card removed")),
            None => Err(ScioError::new(
                ScioErrorCode::ReaderUnavailable,
                "reader detached",
            )),
        }
    }
}

impl ScioCard for MockCard {
    fn atr(&self) -> Bytes {
        self.atr.clone()
    }

    fn protocol(&self) -> ScioProtocol {
        self.protocol
    }

    fn transmit(&mut self, command: &[u8]) -> ScioResult<Bytes> {
        let mut state = self.state.lock();
        self.check_present(&state)?;
        state.transmitted.push(command.to_vec());
        Ok(state
            .responses
            .pop_front()
            .unwrap_or_else(|| Bytes::from_static(&[0x90, 0x00])))
    }

    fn transmit_control(&mut self, code: u32, data: &[u8]) -> ScioResult<Bytes> {
        let mut state = self.state.lock();
        self.check_present(&state)?;
        state.controls.push((code, data.to_vec()));
        state
            .control_responses
            .get_mut(&code)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| ScioError::new(ScioErrorCode::UnsupportedFeature, "no such control code"))
    }

    fn begin_exclusive(&mut self) -> ScioResult<()> {
        let mut state = self.state.lock();
        if state.fail_exclusive {
            return Err(ScioError::new(ScioErrorCode::SharingViolation, "card in use"));
        }
        state.exclusive_held = true;
        Ok(())
    }

    fn end_exclusive(&mut self) -> ScioResult<()> {
        let mut state = self.state.lock();
        if !state.exclusive_held {
            return Err(ScioError::new(ScioErrorCode::NotReady, "no transaction"));
        }
        state.exclusive_held = false;
        Ok(())
    }

    fn reconnect(&mut self, reset: bool) -> ScioResult<()> {
        let mut state = self.state.lock();
        self.check_present(&state)?;
        if reset {
            state.resets += 1;
        }
        Ok(())
    }

    fn disconnect(self: Box<Self>, reset: bool) -> ScioResult<()> {
        let mut state = self.state.lock();
        if state.fail_disconnect {
            return Err(ScioError::new(ScioErrorCode::CommError, "reader unplugged"));
        }
        state.disconnects += 1;
        if reset {
            state.resets += 1;
        }
        Ok(())
    }
}

struct MockWatcher {
    state: Arc<Mutex<MockState>>,
    events: Receiver<StateChangeEvent>,
}

impl TerminalWatcher for MockWatcher {
    fn start(&mut self) -> ScioResult<Vec<TerminalState>> {
        // events queued before start are part of the initial snapshot
        while self.events.try_recv().is_ok() {}
        Ok(self
            .state
            .lock()
            .terminals
            .iter()
            .map(|t| TerminalState::new(t.name.clone(), t.atr.is_some()))
            .collect())
    }

    fn wait_for_change(
        &mut self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> ScioResult<Option<StateChangeEvent>> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if token.is_cancelled() {
                return Err(ScioError::cancelled());
            }
            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    left.min(Duration::from_millis(5))
                }
                None => Duration::from_millis(5),
            };
            match self.events.recv_timeout(slice) {
                Ok(event) => return Ok(Some(event)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ScioError::new(ScioErrorCode::InternalError, "watcher closed"));
                }
            }
        }
    }
}
