//! PC/SC implementation of the provider contract

use std::collections::{BTreeSet, VecDeque};
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ecard_ifd::CancellationToken;
use ecard_ifd::scio::{
    ScioCard, ScioError, ScioProtocol, ScioResult, ScioTerminals, StateChangeEvent,
    TerminalFactory, TerminalState, TerminalWatcher,
};
use parking_lot::Mutex;
use pcsc::{Context, ReaderState, Scope, State};
use tracing::{debug, info, trace};

use crate::card::{PcscCard, preferred_protocols};
use crate::config::PcscConfig;
use crate::error::{PcscError, is_service_gone, scio};
use crate::reader::{self, PcscReader};

fn establish() -> Result<Context, PcscError> {
    Ok(Context::establish(Scope::User)?)
}

/// PC/SC context, replaced when the resource manager restarts
struct SharedContext(Mutex<Context>);

impl fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedContext").finish_non_exhaustive()
    }
}

impl SharedContext {
    fn establish() -> Result<Self, PcscError> {
        Ok(Self(Mutex::new(establish()?)))
    }

    fn get(&self) -> Context {
        self.0.lock().clone()
    }

    fn reload(&self) -> Result<Context, PcscError> {
        let fresh = establish()?;
        *self.0.lock() = fresh.clone();
        info!("PC/SC context re-established");
        Ok(fresh)
    }

    // an unavailable service looks like a system without readers
    fn readers(&self) -> ScioResult<Vec<PcscReader>> {
        match reader::snapshot(&self.get()) {
            Ok(readers) => Ok(readers),
            Err(e) if is_service_gone(e) => {
                debug!(error = %e, "PC/SC service unavailable, reloading");
                let context = match self.reload() {
                    Ok(context) => context,
                    Err(e) => {
                        debug!(error = %e, "PC/SC service still unavailable");
                        return Ok(Vec::new());
                    }
                };
                match reader::snapshot(&context) {
                    Ok(readers) => Ok(readers),
                    Err(e) if is_service_gone(e) => Ok(Vec::new()),
                    Err(e) => Err(scio(e)),
                }
            }
            Err(e) => Err(scio(e)),
        }
    }
}

/// Creates a [`PcscTerminals`] for every established IFD context
#[derive(Debug, Clone, Default)]
pub struct PcscTerminalFactory {
    config: PcscConfig,
}

impl PcscTerminalFactory {
    /// Factory with the given configuration
    pub const fn new(config: PcscConfig) -> Self {
        Self { config }
    }

    /// The configuration handed to every provider
    pub const fn config(&self) -> &PcscConfig {
        &self.config
    }
}

impl TerminalFactory for PcscTerminalFactory {
    fn create(&self) -> ScioResult<Arc<dyn ScioTerminals>> {
        Ok(Arc::new(PcscTerminals::establish(self.config.clone())?))
    }
}

/// Terminals known to the PC/SC resource manager
#[derive(Debug)]
pub struct PcscTerminals {
    context: Arc<SharedContext>,
    config: PcscConfig,
}

impl PcscTerminals {
    /// Establish a user scope PC/SC context
    pub fn establish(config: PcscConfig) -> Result<Self, PcscError> {
        Ok(Self {
            context: Arc::new(SharedContext::establish()?),
            config,
        })
    }

    fn reader(&self, name: &str) -> ScioResult<Option<PcscReader>> {
        Ok(self
            .context
            .readers()?
            .into_iter()
            .find(|r| r.name() == name))
    }
}

impl ScioTerminals for PcscTerminals {
    fn list(&self) -> ScioResult<Vec<TerminalState>> {
        Ok(self
            .context
            .readers()?
            .iter()
            .map(|r| TerminalState::new(r.name(), r.has_card()))
            .collect())
    }

    fn is_card_present(&self, name: &str) -> ScioResult<bool> {
        self.reader(name)?
            .map(|r| r.has_card())
            .ok_or_else(|| ScioError::no_such_terminal(name))
    }

    fn connect(&self, name: &str, protocol: ScioProtocol) -> ScioResult<Box<dyn ScioCard>> {
        let raw = CString::new(name).map_err(|_| PcscError::InvalidReaderName(name.to_owned()))?;
        let card = self
            .context
            .get()
            .connect(
                &raw,
                self.config.share_mode.into(),
                preferred_protocols(protocol),
            )
            .map_err(scio)?;
        Ok(Box::new(PcscCard::spawn(name, card, protocol, &self.config)?))
    }

    fn watcher(&self) -> ScioResult<Box<dyn TerminalWatcher>> {
        Ok(Box::new(PcscWatcher::new(&self.config)?))
    }

    fn is_contactless(&self, name: &str) -> bool {
        match self.reader(name) {
            Ok(Some(reader)) => reader.atr().is_some_and(reader::is_contactless_atr),
            _ => false,
        }
    }
}

/// Presence watcher on its own PC/SC context, so cancelling its wait does
/// not disturb other calls
pub struct PcscWatcher {
    context: Arc<SharedContext>,
    poll: Duration,
    // None when the platform has no PnP notification reader
    pnp: Option<State>,
    readers: Vec<PcscReader>,
    terminals: BTreeSet<String>,
    cards: BTreeSet<String>,
    pending: VecDeque<StateChangeEvent>,
    hooked: Option<CancellationToken>,
}

impl fmt::Debug for PcscWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscWatcher")
            .field("terminals", &self.terminals)
            .field("cards", &self.cards)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl PcscWatcher {
    fn new(config: &PcscConfig) -> Result<Self, PcscError> {
        Ok(Self {
            context: Arc::new(SharedContext::establish()?),
            poll: config.poll_slice(),
            pnp: Some(State::UNAWARE),
            readers: Vec::new(),
            terminals: BTreeSet::new(),
            cards: BTreeSet::new(),
            pending: VecDeque::new(),
            hooked: None,
        })
    }

    // a cancelled token interrupts the blocking wait through the context
    fn hook(&mut self, token: &CancellationToken) {
        if self.hooked.as_ref().is_some_and(|t| t.same_as(token)) {
            return;
        }
        let context = Arc::clone(&self.context);
        token.on_cancel(move || {
            if let Err(e) = context.get().cancel() {
                trace!(error = %e, "interrupting status change wait failed");
            }
        });
        self.hooked = Some(token.clone());
    }

    fn block(&mut self, slice: Duration) -> Result<(), pcsc::Error> {
        let mut states = Vec::with_capacity(self.readers.len() + 1);
        if let Some(pnp) = self.pnp {
            states.push(ReaderState::new(pcsc::PNP_NOTIFICATION(), pnp));
        }
        states.extend(
            self.readers
                .iter()
                .map(|r| ReaderState::new(r.raw_name().to_owned(), r.state())),
        );
        if states.is_empty() {
            thread::sleep(slice);
            return Err(pcsc::Error::Timeout);
        }

        self.context.get().get_status_change(slice, &mut states)?;
        if self.pnp.is_some() {
            let mut pnp = states[0].event_state();
            pnp.remove(State::CHANGED);
            self.pnp = Some(pnp);
        }
        Ok(())
    }

    // queue the difference to the last snapshot, removals first
    fn refresh(&mut self) -> ScioResult<()> {
        let readers = self.context.readers()?;
        let terminals: BTreeSet<String> = readers.iter().map(PcscReader::name).collect();
        let cards: BTreeSet<String> = readers
            .iter()
            .filter(|r| r.has_card())
            .map(PcscReader::name)
            .collect();

        let removed_cards = self.cards.difference(&cards).cloned();
        let removed = self.terminals.difference(&terminals).cloned();
        let added = terminals.difference(&self.terminals).cloned();
        let inserted = cards.difference(&self.cards).cloned();
        let events: Vec<StateChangeEvent> = removed_cards
            .map(StateChangeEvent::CardRemoved)
            .chain(removed.map(StateChangeEvent::TerminalRemoved))
            .chain(added.map(StateChangeEvent::TerminalAdded))
            .chain(inserted.map(StateChangeEvent::CardInserted))
            .collect();
        if !events.is_empty() {
            trace!(events = events.len(), "terminal state changed");
        }

        self.pending.extend(events);
        self.terminals = terminals;
        self.cards = cards;
        self.readers = readers;
        Ok(())
    }
}

impl TerminalWatcher for PcscWatcher {
    fn start(&mut self) -> ScioResult<Vec<TerminalState>> {
        self.pending.clear();
        self.refresh()?;
        // the initial snapshot is not a change
        self.pending.clear();
        debug!(terminals = self.terminals.len(), cards = self.cards.len(), "watcher started");
        Ok(self
            .readers
            .iter()
            .map(|r| TerminalState::new(r.name(), r.has_card()))
            .collect())
    }

    fn wait_for_change(
        &mut self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> ScioResult<Option<StateChangeEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        self.hook(token);

        // an unbounded timeout does not fit into an instant
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
                    left.min(self.poll)
                }
                None => self.poll,
            };

            let mut unknown_reader = false;
            match self.block(slice) {
                Ok(()) => {}
                // without PnP the reader list is polled
                Err(pcsc::Error::Timeout) if self.pnp.is_some() => continue,
                Err(pcsc::Error::Timeout) => {}
                // the token is checked at the top of the loop
                Err(pcsc::Error::Cancelled) => continue,
                Err(pcsc::Error::UnknownReader) => unknown_reader = true,
                Err(pcsc::Error::NoReadersAvailable) => {}
                Err(e) if is_service_gone(e) => {
                    debug!(error = %e, "PC/SC service lost while waiting");
                    if let Err(e) = self.context.reload() {
                        debug!(error = %e, "PC/SC service still unavailable");
                        thread::sleep(slice);
                    }
                }
                Err(e) => return Err(scio(e)),
            }

            self.refresh()?;
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if unknown_reader && self.pnp.take().is_some() {
                debug!("PnP notifications unavailable, polling the reader list");
            }
        }
    }
}
