//! The IFD service
//!
//! [`IfdService`] is the entry point for every operation. It owns the
//! context lifecycle: the first [`IfdService::establish_context`] creates the
//! provider, the channel manager, the wait pool and the event manager, later
//! calls only add a reference. The last [`IfdService::release_context`] tears
//! all of it down again.
//!
//! ```ignore
//! let service = IfdService::new(Arc::new(PcscTerminalFactory::default()));
//! let ctx = service.establish_context()?;
//! for name in service.list_ifds(&ctx)? {
//!     println!("{name}");
//! }
//! service.release_context(&ctx)?;
//! ```

mod pool;
mod secure;
mod slot;
mod wait;


use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

pub use slot::{ControlResponse, DisconnectAction, InputApdu, TransmitResponse};
pub use wait::{WaitNotification, WaitRequest, WaitResponse};

use crate::CancellationToken;
use crate::channel::{ChannelManager, ContextHandle, SlotHandle};
use crate::config::IfdConfig;
use crate::events::{EventDispatcher, EventManager, IfdEvent};
use crate::protocol::{ProtocolFactory, ProtocolRegistry};
use crate::scio::{ScioErrorCode, ScioResult, TerminalFactory};
use crate::status::IfdStatus;
use crate::terminal::{IfdCapabilities, PIN_COMPARE_PROTOCOL, SlotCapability, TerminalInfo};
use crate::ui::UserConsent;
use crate::{IfdError, Result};
use pool::WaitPool;

/// Everything that lives as long as the context
#[derive(Debug)]
struct Context {
    handle: ContextHandle,
    manager: Arc<ChannelManager>,
    pool: WaitPool,
    events: Mutex<EventManager>,
    // asynchronous waits by session id
    sessions: Arc<Mutex<HashMap<String, CancellationToken>>>,
    // the outstanding synchronous wait
    sync_wait: Mutex<Option<wait::SyncWait>>,
}

impl Context {
    fn shutdown(&self) {
        self.pool.shutdown();
        self.sessions.lock().clear();
        self.sync_wait.lock().take();
        self.events.lock().stop();
        self.manager.close_all();
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    context: Option<Arc<Context>>,
    refs: usize,
}

/// Card terminal service
#[derive(Debug)]
pub struct IfdService {
    factory: Arc<dyn TerminalFactory>,
    registry: ProtocolRegistry,
    config: IfdConfig,
    consent: Option<Arc<dyn UserConsent>>,
    dispatcher: EventDispatcher,
    // serialises attach/detach and disconnect with reset
    lifecycle: Mutex<Lifecycle>,
}

impl IfdService {
    /// Create a service on top of a provider factory
    pub fn new(factory: Arc<dyn TerminalFactory>) -> Self {
        Self {
            factory,
            registry: ProtocolRegistry::new(),
            config: IfdConfig::default(),
            consent: None,
            dispatcher: EventDispatcher::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: IfdConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the software protocol registry
    pub fn with_registry(mut self, registry: ProtocolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register one software protocol
    pub fn with_protocol<S: Into<String>>(
        mut self,
        protocol: S,
        factory: Arc<dyn ProtocolFactory>,
    ) -> Self {
        self.registry.add(protocol, factory);
        self
    }

    /// Set the UI collaborator
    pub fn with_consent(mut self, consent: Arc<dyn UserConsent>) -> Self {
        self.consent = Some(consent);
        self
    }

    /// The configuration
    pub const fn config(&self) -> &IfdConfig {
        &self.config
    }

    /// The software protocol registry
    pub const fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    /// Receive terminal events of the active context
    pub fn subscribe(&self) -> Receiver<IfdEvent> {
        self.dispatcher.subscribe()
    }

    /// Number of clients attached to the active context
    pub fn context_refs(&self) -> usize {
        self.lifecycle.lock().refs
    }

    fn context(&self, handle: &ContextHandle) -> Result<Arc<Context>> {
        match &self.lifecycle.lock().context {
            Some(context) if context.handle == *handle => Ok(Arc::clone(context)),
            _ => Err(IfdError::InvalidContextHandle),
        }
    }

    /// Attach to the context, creating it on first use
    #[instrument(skip_all)]
    pub fn establish_context(&self) -> Result<ContextHandle> {
        let mut lifecycle = self.lifecycle.lock();
        if let Some(context) = &lifecycle.context {
            let handle = context.handle;
            lifecycle.refs += 1;
            debug!(refs = lifecycle.refs, "attached to context");
            return Ok(handle);
        }

        let terminals = self.factory.create().map_err(|e| {
            warn!(error = %e, "creating the terminal provider failed");
            IfdError::device(format!("Failed to initialize terminal provider: {e}"))
        })?;
        let manager = Arc::new(ChannelManager::new(terminals));
        let events = EventManager::start(Arc::clone(&manager), self.dispatcher.clone(), &self.config)
            .map_err(|e| IfdError::unknown(format!("Failed to start event manager: {e}")))?;

        let context = Context {
            handle: ContextHandle::generate(),
            manager,
            pool: WaitPool::new(self.config.thread_name.clone()),
            events: Mutex::new(events),
            sessions: Arc::default(),
            sync_wait: Mutex::new(None),
        };
        let handle = context.handle;
        lifecycle.context = Some(Arc::new(context));
        lifecycle.refs = 1;
        info!(context = %handle, "context established");
        Ok(handle)
    }

    /// Detach from the context. The last detach tears it down: running waits
    /// are cancelled, the event manager stops and every channel is closed.
    #[instrument(skip_all)]
    pub fn release_context(&self, handle: &ContextHandle) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match &lifecycle.context {
            Some(context) if context.handle == *handle => {}
            _ => return Err(IfdError::InvalidContextHandle),
        }

        lifecycle.refs = lifecycle.refs.saturating_sub(1);
        if lifecycle.refs > 0 {
            debug!(refs = lifecycle.refs, "detached from context");
            return Ok(());
        }
        if let Some(context) = lifecycle.context.take() {
            context.shutdown();
        }
        info!(context = %handle, "context released");
        Ok(())
    }

    /// Power up devices managed by the provider
    #[instrument(skip_all)]
    pub fn prepare_devices(&self, handle: &ContextHandle) -> Result<()> {
        let context = self.context(handle)?;
        let prepared = context
            .manager
            .terminals()
            .prepare_devices()
            .map_err(|e| match e.code {
                ScioErrorCode::CancelledByUser => IfdError::CancellationByUser(e.message),
                ScioErrorCode::Timeout => IfdError::Timeout(e.message),
                _ => IfdError::device(e.message),
            })?;
        if prepared {
            self.dispatcher.notify(IfdEvent::PrepareDevices);
        }
        Ok(())
    }

    /// Power down devices managed by the provider
    #[instrument(skip_all)]
    pub fn power_down_devices(&self, handle: &ContextHandle) -> Result<()> {
        let context = self.context(handle)?;
        if context.manager.terminals().power_down_devices() {
            self.dispatcher.notify(IfdEvent::PowerDownDevices);
        }
        Ok(())
    }

    /// Names of all attached terminals
    #[instrument(skip_all)]
    pub fn list_ifds(&self, handle: &ContextHandle) -> Result<Vec<String>> {
        let context = self.context(handle)?;
        let terminals = context.manager.terminals().list().map_err(|e| {
            warn!(error = %e, "listing terminals failed");
            IfdError::device(e.to_string())
        })?;
        Ok(terminals.into_iter().map(|t| t.name).collect())
    }

    /// Capabilities of a terminal, including the registered software
    /// protocols
    #[instrument(skip_all, fields(terminal = name))]
    pub fn get_ifd_capabilities(
        &self,
        handle: &ContextHandle,
        name: &str,
    ) -> Result<IfdCapabilities> {
        let context = self.context(handle)?;
        let manager = context.manager.as_ref();
        let known = manager
            .terminals()
            .list()
            .map_err(|e| capability_error(&e))?
            .iter()
            .any(|t| t.name == name);
        if !known {
            return Err(IfdError::UnknownIfd("Requested terminal not found.".into()));
        }

        let info = match manager.open_master(name) {
            Ok(channel) => TerminalInfo::with_channel(manager, channel),
            Err(e) => {
                debug!(error = %e, "continuing without a channel");
                TerminalInfo::new(manager, name)
            }
        };
        self.capabilities(&info).map_err(|e| capability_error(&e))
    }

    /// Reader capabilities merged with the software protocols
    fn capabilities(&self, info: &TerminalInfo<'_>) -> ScioResult<IfdCapabilities> {
        let mut capabilities = info.capabilities()?;
        if capabilities.slots.is_empty() {
            capabilities.slots.push(SlotCapability::default());
        }
        let protocols = &mut capabilities.slots[0].protocols;
        for protocol in self.registry.protocols() {
            if !protocols.iter().any(|p| p == protocol) {
                protocols.push(protocol.to_owned());
            }
        }
        if !protocols.iter().any(|p| p == PIN_COMPARE_PROTOCOL) {
            protocols.push(PIN_COMPARE_PROTOCOL.to_owned());
        }
        Ok(capabilities)
    }

    /// Status of one terminal, or of all terminals when no name is given
    #[instrument(skip_all, fields(terminal = name))]
    pub fn get_status(&self, handle: &ContextHandle, name: Option<&str>) -> Result<Vec<IfdStatus>> {
        let context = self.context(handle)?;
        let manager = context.manager.as_ref();
        let terminals = manager.terminals().list().map_err(|e| {
            warn!(error = %e, "listing terminals failed");
            IfdError::device("Failed to get list with the terminals.")
        })?;

        let names: Vec<String> = match name {
            Some(name) if terminals.iter().any(|t| t.name == name) => vec![name.to_owned()],
            Some(_) => {
                return Err(IfdError::UnknownIfd(
                    "The requested IFD name does not exist.".into(),
                ));
            }
            None => terminals.into_iter().map(|t| t.name).collect(),
        };

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            let info = match manager.open_master(&name) {
                Ok(channel) => TerminalInfo::with_channel(manager, channel),
                Err(_) => TerminalInfo::new(manager, name.clone()),
            };
            match info.status() {
                Ok(status) => statuses.push(status),
                // a card that cannot be connected is not a terminal failure
                Err(e)
                    if matches!(
                        e.code,
                        ScioErrorCode::UnpoweredCard
                            | ScioErrorCode::UnresponsiveCard
                            | ScioErrorCode::UnsupportedCard
                            | ScioErrorCode::ProtoMismatch
                    ) =>
                {
                    info!(terminal = %name, error = %e, "ignoring failed status request");
                }
                Err(e) => {
                    warn!(terminal = %name, error = %e, "status request failed");
                    return Err(IfdError::device(format!(
                        "Failed to determine status of terminal '{name}'."
                    )));
                }
            }
        }
        Ok(statuses)
    }

    /// Changing the verification data is not offered
    pub fn modify_verification_data(&self, handle: &ContextHandle, _slot: &SlotHandle) -> Result<()> {
        self.context(handle)?;
        Err(IfdError::unknown("Command not supported."))
    }

    /// Output on the reader display is not offered
    pub fn output(&self, handle: &ContextHandle, _name: &str) -> Result<()> {
        self.context(handle)?;
        Err(IfdError::unknown("Command not supported."))
    }
}

fn capability_error(error: &crate::scio::ScioError) -> IfdError {
    // removed cards are routine here
    if matches!(
        error.code,
        ScioErrorCode::NoSmartcard | ScioErrorCode::RemovedCard
    ) {
        debug!(error = %error, "failed to request status from terminal");
    } else {
        warn!(error = %error, "failed to request status from terminal");
    }
    IfdError::device("Failed to request status from terminal.")
}
