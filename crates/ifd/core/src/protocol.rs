//! Secure channel protocols and their registry
//!
//! Software protocols are registered by URI when the service is built. A
//! factory yields one fresh [`ChannelProtocol`] per establishment; once
//! established the instance wraps every APDU sent over its channel.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use zeroize::Zeroizing;

use crate::Result;
use crate::pace::PinId;
use crate::ui::UserConsent;

/// Raw APDU exchange used while a protocol is being established
pub trait ApduChannel {
    /// Send a command APDU and return the full response including trailer
    fn transmit_raw(&self, command: &[u8]) -> Result<Bytes>;
}

/// Input of a channel establishment
#[derive(Debug, Clone, Default)]
pub struct ProtocolData {
    /// Protocol URI
    pub protocol: String,
    /// Password used by password based protocols
    pub pin_id: Option<PinId>,
    /// Certificate holder authorization template
    pub chat: Option<Bytes>,
    /// Password value, if supplied by the host
    pub pin: Option<Zeroizing<String>>,
    /// Certificate description
    pub certificate_description: Option<Bytes>,
    /// Protocol specific values
    pub params: BTreeMap<String, Bytes>,
}

impl ProtocolData {
    /// Data for the given protocol
    pub fn new<S: Into<String>>(protocol: S) -> Self {
        Self {
            protocol: protocol.into(),
            ..Default::default()
        }
    }

    /// Set the password id
    pub const fn with_pin_id(mut self, pin_id: PinId) -> Self {
        self.pin_id = Some(pin_id);
        self
    }

    /// Set the CHAT
    pub fn with_chat<T: Into<Bytes>>(mut self, chat: T) -> Self {
        self.chat = Some(chat.into());
        self
    }

    /// Set the password value
    pub fn with_pin<S: Into<String>>(mut self, pin: S) -> Self {
        self.pin = Some(Zeroizing::new(pin.into()));
        self
    }

    /// Set the certificate description
    pub fn with_certificate_description<T: Into<Bytes>>(mut self, description: T) -> Self {
        self.certificate_description = Some(description.into());
        self
    }

    /// Add a protocol specific value
    pub fn with_param<K: Into<String>, V: Into<Bytes>>(mut self, key: K, value: V) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Output of a channel establishment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolOutput {
    /// Protocol URI
    pub protocol: String,
    /// Remaining password attempts reported by the card
    pub retry_counter: Option<u8>,
    /// Content of EF.CardAccess
    pub ef_card_access: Option<Bytes>,
    /// Most recent certification authority reference
    pub car_current: Option<Bytes>,
    /// Previous certification authority reference
    pub car_previous: Option<Bytes>,
    /// Card identifier
    pub id_icc: Option<Bytes>,
    /// Protocol specific values
    pub params: BTreeMap<String, Bytes>,
}

impl ProtocolOutput {
    /// Empty output for a protocol
    pub fn new<S: Into<String>>(protocol: S) -> Self {
        Self {
            protocol: protocol.into(),
            ..Default::default()
        }
    }
}

/// A secure channel protocol instance
pub trait ChannelProtocol: Send + fmt::Debug {
    /// Run the establishment over the raw channel
    fn establish(
        &mut self,
        data: &ProtocolData,
        channel: &dyn ApduChannel,
        consent: Option<&dyn UserConsent>,
    ) -> Result<ProtocolOutput>;

    /// Protect an outgoing command APDU
    fn apply_sm(&mut self, command: &[u8]) -> Result<Bytes>;

    /// Verify and unwrap an incoming response APDU
    fn remove_sm(&mut self, response: &[u8]) -> Result<Bytes>;
}

/// Creates protocol instances
pub trait ProtocolFactory: Send + Sync + fmt::Debug {
    /// A fresh, not yet established instance
    fn create_instance(&self) -> Box<dyn ChannelProtocol>;
}

/// Protocol URI to factory mapping, in registration order
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    factories: Vec<(String, Arc<dyn ProtocolFactory>)>,
}

impl ProtocolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Returns `false` if the URI is already taken, the
    /// existing entry is kept.
    pub fn add<S: Into<String>>(&mut self, protocol: S, factory: Arc<dyn ProtocolFactory>) -> bool {
        let protocol = protocol.into();
        if self.contains(&protocol) {
            return false;
        }
        self.factories.push((protocol, factory));
        true
    }

    /// Builder form of [`Self::add`]
    pub fn with<S: Into<String>>(mut self, protocol: S, factory: Arc<dyn ProtocolFactory>) -> Self {
        self.add(protocol, factory);
        self
    }

    /// Whether a factory is registered for the URI
    pub fn contains(&self, protocol: &str) -> bool {
        self.factories.iter().any(|(uri, _)| uri == protocol)
    }

    /// Factory registered for the URI
    pub fn get(&self, protocol: &str) -> Option<&Arc<dyn ProtocolFactory>> {
        self.factories
            .iter()
            .find(|(uri, _)| uri == protocol)
            .map(|(_, factory)| factory)
    }

    /// Registered URIs in registration order
    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|(uri, _)| uri.as_str())
    }

    /// Number of registered protocols
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! XOR "secure messaging" used to observe wrapping in tests

    use super::*;
    use crate::IfdError;

    #[derive(Debug)]
    pub(crate) struct XorProtocol {
        pub(crate) key: u8,
        pub(crate) fail: bool,
    }

    impl ChannelProtocol for XorProtocol {
        fn establish(
            &mut self,
            data: &ProtocolData,
            channel: &dyn ApduChannel,
            _consent: Option<&dyn UserConsent>,
        ) -> Result<ProtocolOutput> {
            if self.fail {
                return Err(IfdError::Protocol("key agreement failed".into()));
            }
            let response = channel.transmit_raw(&[0x00, 0x22, 0xC1, 0xA4])?;
            let mut output = ProtocolOutput::new(&data.protocol);
            output.params.insert("mse".into(), response);
            Ok(output)
        }

        fn apply_sm(&mut self, command: &[u8]) -> Result<Bytes> {
            Ok(command.iter().map(|b| b ^ self.key).collect())
        }

        fn remove_sm(&mut self, response: &[u8]) -> Result<Bytes> {
            Ok(response.iter().map(|b| b ^ self.key).collect())
        }
    }

    #[derive(Debug)]
    pub(crate) struct XorFactory {
        pub(crate) key: u8,
        pub(crate) fail: bool,
    }

    impl ProtocolFactory for XorFactory {
        fn create_instance(&self) -> Box<dyn ChannelProtocol> {
            Box::new(XorProtocol {
                key: self.key,
                fail: self.fail,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::XorFactory;
    use super::*;

    #[test]
    fn test_registry_keeps_first_and_order() {
        let mut registry = ProtocolRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.add("urn:b", Arc::new(XorFactory { key: 1, fail: false })));
        assert!(registry.add("urn:a", Arc::new(XorFactory { key: 2, fail: false })));
        assert!(!registry.add("urn:b", Arc::new(XorFactory { key: 3, fail: false })));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.protocols().collect::<Vec<_>>(), vec!["urn:b", "urn:a"]);
        assert!(registry.get("urn:c").is_none());

        let mut instance = registry.get("urn:b").unwrap().create_instance();
        assert_eq!(instance.apply_sm(&[0x00, 0x01]).unwrap().as_ref(), &[0x01, 0x00]);
    }

    #[test]
    fn test_protocol_data_builder() {
        let data = ProtocolData::new("urn:x")
            .with_pin_id(PinId::Can)
            .with_pin("123456")
            .with_param("k", vec![1u8]);
        assert_eq!(data.pin_id, Some(PinId::Can));
        assert_eq!(data.pin.as_deref().map(String::as_str), Some("123456"));
        assert_eq!(data.params.get("k").map(|b| b.as_ref()), Some(&[1u8][..]));
    }
}
