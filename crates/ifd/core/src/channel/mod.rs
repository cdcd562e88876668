//! Master and slave channels
//!
//! A master channel owns the provider connection to one card. Slave
//! channels are logical views on a master, addressed by a [`SlotHandle`],
//! each with its own transaction flag and optional secure messaging layer.

mod handle;
mod manager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

pub use handle::{ContextHandle, SlotHandle};
pub use manager::ChannelManager;

use crate::protocol::{ApduChannel, ChannelProtocol};
use crate::scio::{ScioCard, ScioError, ScioErrorCode, ScioProtocol, ScioResult, ScioTerminals};
use crate::{IfdError, Result};

/// Map a provider error of a slot operation. Codes saying that the card or
/// reader went away invalidate the handle.
pub fn slot_error(error: ScioError) -> IfdError {
    if error.code.is_vanished() || error.code == ScioErrorCode::InvalidHandle {
        IfdError::InvalidSlotHandle(error.to_string())
    } else {
        IfdError::UnknownIfdError(error.to_string())
    }
}

/// Connection to the card in one terminal
#[derive(Debug)]
pub struct MasterChannel {
    name: String,
    atr: Bytes,
    protocol: ScioProtocol,
    card: Mutex<Option<Box<dyn ScioCard>>>,
}

impl MasterChannel {
    /// Connect, trying the protocols in [`ScioProtocol::CONNECT_ORDER`]
    pub fn open(terminals: &dyn ScioTerminals, name: &str) -> ScioResult<Self> {
        let mut last = None;
        for protocol in ScioProtocol::CONNECT_ORDER {
            match terminals.connect(name, protocol) {
                Ok(card) => {
                    debug!(terminal = name, protocol = %card.protocol(), "master channel opened");
                    return Ok(Self {
                        name: name.to_owned(),
                        atr: card.atr(),
                        protocol: card.protocol(),
                        card: Mutex::new(Some(card)),
                    });
                }
                // retrying with another protocol cannot help
                Err(e) if e.code.is_vanished() || e.code == ScioErrorCode::UnknownReader => {
                    return Err(e);
                }
                Err(e) => {
                    trace!(terminal = name, %protocol, error = %e, "connect attempt failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| ScioError::new(ScioErrorCode::ProtoMismatch, name)))
    }

    /// Terminal name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// ATR read when the channel was opened
    pub fn atr(&self) -> Bytes {
        self.atr.clone()
    }

    /// Negotiated protocol
    pub const fn protocol(&self) -> ScioProtocol {
        self.protocol
    }

    /// Whether the connection is still open
    pub fn is_open(&self) -> bool {
        self.card.lock().is_some()
    }

    fn with_card<T>(&self, f: impl FnOnce(&mut dyn ScioCard) -> ScioResult<T>) -> ScioResult<T> {
        let mut card = self.card.lock();
        match card.as_mut() {
            Some(card) => f(card.as_mut()),
            None => Err(ScioError::new(
                ScioErrorCode::InvalidHandle,
                format!("channel to {} is closed", self.name),
            )),
        }
    }

    /// Send a command APDU
    pub fn transmit(&self, command: &[u8]) -> ScioResult<Bytes> {
        trace!(terminal = %self.name, command = %hex::encode(command), "transmit");
        let response = self.with_card(|card| card.transmit(command))?;
        trace!(terminal = %self.name, response = %hex::encode(&response), "received");
        Ok(response)
    }

    /// Send a reader control command
    pub fn transmit_control(&self, code: u32, data: &[u8]) -> ScioResult<Bytes> {
        trace!(terminal = %self.name, code = format_args!("{code:#010x}"), "control");
        self.with_card(|card| card.transmit_control(code, data))
    }

    /// Acquire the card exclusively
    pub fn begin_exclusive(&self) -> ScioResult<()> {
        self.with_card(|card| card.begin_exclusive())
    }

    /// Release exclusive access
    pub fn end_exclusive(&self) -> ScioResult<()> {
        self.with_card(|card| card.end_exclusive())
    }

    /// Reconnect in place, optionally resetting the card
    pub fn reconnect(&self, reset: bool) -> ScioResult<()> {
        self.with_card(|card| card.reconnect(reset))
    }

    /// Close the connection. Later calls fail with an invalid handle error.
    pub fn close(&self, reset: bool) -> ScioResult<()> {
        match self.card.lock().take() {
            Some(card) => {
                debug!(terminal = %self.name, reset, "master channel closed");
                card.disconnect(reset)
            }
            None => Ok(()),
        }
    }
}

/// Logical channel handed out by `connect`
#[derive(Debug)]
pub struct SlaveChannel {
    handle: SlotHandle,
    master: Arc<MasterChannel>,
    exclusive: AtomicBool,
    sm: Mutex<Option<Box<dyn ChannelProtocol>>>,
}

impl SlaveChannel {
    fn new(master: Arc<MasterChannel>) -> Self {
        Self {
            handle: SlotHandle::generate(),
            master,
            exclusive: AtomicBool::new(false),
            sm: Mutex::new(None),
        }
    }

    /// Handle naming this channel
    pub const fn handle(&self) -> SlotHandle {
        self.handle
    }

    /// Underlying master channel
    pub fn master(&self) -> &Arc<MasterChannel> {
        &self.master
    }

    /// Terminal name
    pub fn terminal(&self) -> &str {
        self.master.name()
    }

    /// Send a command APDU through the secure messaging layer, if any
    pub fn transmit(&self, command: &[u8]) -> Result<Bytes> {
        let mut sm = self.sm.lock();
        match sm.as_mut() {
            Some(protocol) => {
                let wrapped = protocol.apply_sm(command)?;
                let response = self.master.transmit(&wrapped).map_err(slot_error)?;
                protocol.remove_sm(&response)
            }
            None => self.master.transmit(command).map_err(slot_error),
        }
    }

    /// Send a reader control command
    pub fn transmit_control(&self, code: u32, data: &[u8]) -> Result<Bytes> {
        self.master.transmit_control(code, data).map_err(slot_error)
    }

    /// Begin a transaction on this channel
    pub fn begin_exclusive(&self) -> ScioResult<()> {
        self.master.begin_exclusive()?;
        self.exclusive.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// End the transaction of this channel
    pub fn end_exclusive(&self) -> ScioResult<()> {
        self.master.end_exclusive()?;
        self.exclusive.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Whether this channel holds a transaction
    pub fn is_exclusive(&self) -> bool {
        self.exclusive.load(Ordering::SeqCst)
    }

    /// Install an established secure messaging layer
    pub fn set_secure_messaging(&self, protocol: Box<dyn ChannelProtocol>) {
        *self.sm.lock() = Some(protocol);
    }

    /// Drop the secure messaging layer. Returns whether one was installed.
    pub fn remove_secure_messaging(&self) -> bool {
        self.sm.lock().take().is_some()
    }

    /// Whether a secure messaging layer is installed
    pub fn has_secure_messaging(&self) -> bool {
        self.sm.lock().is_some()
    }
}

impl ApduChannel for SlaveChannel {
    fn transmit_raw(&self, command: &[u8]) -> Result<Bytes> {
        self.master.transmit(command).map_err(slot_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolFactory;
    use crate::protocol::testing::XorFactory;
    use crate::scio::mock::MockTerminals;

    fn master() -> (MockTerminals, Arc<MasterChannel>) {
        let mock = MockTerminals::new();
        mock.add_terminal("Reader1");
        mock.insert_card("Reader1", &[0x3B, 0x80]);
        let master = MasterChannel::open(&mock, "Reader1").unwrap();
        (mock, Arc::new(master))
    }

    #[test]
    fn test_open_prefers_t1() {
        let (_mock, master) = master();
        assert_eq!(master.protocol(), ScioProtocol::T1);
        assert_eq!(master.atr().as_ref(), &[0x3B, 0x80]);
    }

    #[test]
    fn test_open_without_card() {
        let mock = MockTerminals::new();
        mock.add_terminal("Reader1");
        let err = MasterChannel::open(&mock, "Reader1").unwrap_err();
        assert_eq!(err.code, ScioErrorCode::NoSmartcard);
        assert_eq!(mock.connects(), 0);
    }

    #[test]
    fn test_closed_master_invalidates_slave() {
        let (mock, master) = master();
        let slave = SlaveChannel::new(Arc::clone(&master));
        master.close(false).unwrap();
        assert!(!master.is_open());
        assert!(matches!(
            slave.transmit(&[0x00, 0xA4, 0x04, 0x00]),
            Err(IfdError::InvalidSlotHandle(_))
        ));
        assert_eq!(mock.disconnects(), 1);
    }

    #[test]
    fn test_secure_messaging_wraps() {
        let (mock, master) = master();
        let slave = SlaveChannel::new(master);
        slave.set_secure_messaging(XorFactory { key: 0xFF, fail: false }.create_instance());
        mock.push_response(&[0x6F, 0xFF]);

        let response = slave.transmit(&[0x00, 0xB0]).unwrap();
        assert_eq!(response.as_ref(), &[0x90, 0x00]);
        assert_eq!(mock.transmitted(), vec![vec![0xFF, 0x4F]]);

        assert!(slave.remove_secure_messaging());
        assert!(!slave.has_secure_messaging());
        slave.transmit(&[0x00, 0xB0]).unwrap();
        assert_eq!(mock.transmitted()[1], vec![0x00, 0xB0]);
    }

    #[test]
    fn test_removed_card_maps_to_slot_error() {
        let (mock, master) = master();
        let slave = SlaveChannel::new(master);
        mock.remove_card("Reader1");
        assert!(matches!(
            slave.transmit(&[0x00, 0xB0]),
            Err(IfdError::InvalidSlotHandle(_))
        ));

        let err = slot_error(ScioError::new(ScioErrorCode::CommError, "x"));
        assert!(matches!(err, IfdError::UnknownIfdError(_)));
    }
}
