use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{MasterChannel, SlaveChannel, SlotHandle};
use crate::scio::{ScioError, ScioResult, ScioTerminals};
use crate::{IfdError, Result};

#[derive(Debug)]
struct MasterEntry {
    channel: Arc<MasterChannel>,
    // held open by presence tracking or a status query
    pinned: bool,
    slaves: usize,
}

impl MasterEntry {
    const fn is_unused(&self) -> bool {
        !self.pinned && self.slaves == 0
    }
}

#[derive(Debug, Default)]
struct State {
    masters: HashMap<String, MasterEntry>,
    slaves: HashMap<SlotHandle, Arc<SlaveChannel>>,
}

/// Owns the master channels by terminal name and the slave channels by
/// handle. A master stays open while it is pinned or has slaves.
#[derive(Debug)]
pub struct ChannelManager {
    terminals: Arc<dyn ScioTerminals>,
    state: Mutex<State>,
}

impl ChannelManager {
    /// Create a manager on top of a provider
    pub fn new(terminals: Arc<dyn ScioTerminals>) -> Self {
        Self {
            terminals,
            state: Mutex::new(State::default()),
        }
    }

    /// The provider
    pub fn terminals(&self) -> &Arc<dyn ScioTerminals> {
        &self.terminals
    }

    fn entry<'a>(&self, state: &'a mut State, name: &str) -> ScioResult<&'a mut MasterEntry> {
        let stale = state
            .masters
            .get(name)
            .is_some_and(|entry| !entry.channel.is_open());
        if stale {
            state.masters.remove(name);
        }
        if !state.masters.contains_key(name) {
            let channel = MasterChannel::open(self.terminals.as_ref(), name)?;
            state.masters.insert(
                name.to_owned(),
                MasterEntry {
                    channel: Arc::new(channel),
                    pinned: false,
                    slaves: 0,
                },
            );
        }
        state
            .masters
            .get_mut(name)
            .ok_or_else(|| ScioError::no_such_terminal(name))
    }

    /// Open the master channel of a terminal and keep it open until
    /// [`Self::close_master`]
    pub fn open_master(&self, name: &str) -> ScioResult<Arc<MasterChannel>> {
        let mut state = self.state.lock();
        let entry = self.entry(&mut state, name)?;
        entry.pinned = true;
        Ok(Arc::clone(&entry.channel))
    }

    /// The open master channel of a terminal
    pub fn master(&self, name: &str) -> Option<Arc<MasterChannel>> {
        self.state
            .lock()
            .masters
            .get(name)
            .filter(|entry| entry.channel.is_open())
            .map(|entry| Arc::clone(&entry.channel))
    }

    /// Close the master channel of a terminal and every slave on it
    pub fn close_master(&self, name: &str) {
        let mut state = self.state.lock();
        state.slaves.retain(|_, slave| slave.terminal() != name);
        if let Some(entry) = state.masters.remove(name) {
            if let Err(e) = entry.channel.close(false) {
                debug!(terminal = name, error = %e, "closing master channel failed");
            }
        }
    }

    /// Open a new slave channel, opening the master if needed
    pub fn open_slave(&self, name: &str) -> ScioResult<Arc<SlaveChannel>> {
        let mut state = self.state.lock();
        let entry = self.entry(&mut state, name)?;
        entry.slaves += 1;
        let slave = Arc::new(SlaveChannel::new(Arc::clone(&entry.channel)));
        state.slaves.insert(slave.handle(), Arc::clone(&slave));
        debug!(terminal = name, handle = %slave.handle(), "slave channel opened");
        Ok(slave)
    }

    /// Look up a slave channel
    pub fn slave(&self, handle: &SlotHandle) -> Result<Arc<SlaveChannel>> {
        self.state
            .lock()
            .slaves
            .get(handle)
            .cloned()
            .ok_or_else(|| IfdError::slot(format!("unknown slot handle {handle}")))
    }

    /// Close a slave channel. Its transaction is ended and the master is
    /// closed when nothing else needs it.
    pub fn close_slave(&self, handle: &SlotHandle) -> Result<Arc<SlaveChannel>> {
        let mut state = self.state.lock();
        let slave = state
            .slaves
            .remove(handle)
            .ok_or_else(|| IfdError::slot(format!("unknown slot handle {handle}")))?;
        if slave.is_exclusive() {
            if let Err(e) = slave.end_exclusive() {
                warn!(handle = %handle, error = %e, "ending transaction of closed channel failed");
            }
        }

        let name = slave.terminal().to_owned();
        let unused = match state.masters.get_mut(&name) {
            Some(entry) if Arc::ptr_eq(&entry.channel, slave.master()) => {
                entry.slaves = entry.slaves.saturating_sub(1);
                entry.is_unused()
            }
            _ => false,
        };
        // the slave is gone either way, a failing disconnect is only logged
        if unused {
            if let Some(entry) = state.masters.remove(&name) {
                if let Err(e) = entry.channel.close(false) {
                    warn!(terminal = %name, error = %e, "closing master channel failed");
                }
            }
        }
        debug!(terminal = %name, handle = %handle, "slave channel closed");
        Ok(slave)
    }

    /// Reset the card of a terminal. Tries an in place reconnect and falls
    /// back to reopening the master channel, which invalidates its slaves.
    pub fn reset_master(&self, name: &str) -> ScioResult<()> {
        let master = match self.master(name) {
            Some(master) => master,
            None => self.open_master(name)?,
        };
        match master.reconnect(true) {
            Ok(()) => return Ok(()),
            Err(e) => debug!(terminal = name, error = %e, "reconnect failed, reopening"),
        }
        if let Err(e) = master.close(true) {
            debug!(terminal = name, error = %e, "closing master channel failed");
        }
        self.close_master(name);
        self.open_master(name).map(|_| ())
    }

    /// Slave handles currently open on a terminal
    pub fn slaves_of(&self, name: &str) -> Vec<SlotHandle> {
        self.state
            .lock()
            .slaves
            .values()
            .filter(|slave| slave.terminal() == name)
            .map(|slave| slave.handle())
            .collect()
    }

    /// Close every channel
    pub fn close_all(&self) {
        let mut state = self.state.lock();
        state.slaves.clear();
        for (name, entry) in state.masters.drain() {
            if let Err(e) = entry.channel.close(false) {
                debug!(terminal = %name, error = %e, "closing master channel failed");
            }
        }
    }
}
