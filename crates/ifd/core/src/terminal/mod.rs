//! Per terminal information: status, reader features and capabilities

pub mod features;

use std::cell::OnceCell;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::{ChannelManager, MasterChannel};
use crate::pace::{ExecutePaceRequest, ExecutePaceResponse, PaceCapabilities, PaceFunction};
use crate::scio::{ScioError, ScioErrorCode, ScioResult};
use crate::status::{IfdStatus, SlotStatus};
use features::FeatureMap;

/// Interface protocol URI of contactless Type A cards
pub const PROTOCOL_TYPE_A: &str = "urn:iso:std:iso-iec:14443:-2:tech:protocols:Type-A";
/// Interface protocol URI of contact T=0 cards
pub const PROTOCOL_T0: &str = "urn:iso:std:iso-iec:7816:-3:tech:protocols:T-equals-0";
/// Protocol URI of PIN verification
pub const PIN_COMPARE_PROTOCOL: &str = "urn:oid:1.3.162.15480.3.0.9";

/// Protocols supported by one slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotCapability {
    /// Slot index
    pub index: u32,
    /// Protocol URIs
    pub protocols: Vec<String>,
}

/// Reader display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayCapability {
    /// Display index
    pub index: u32,
    /// Characters per line
    pub columns: u16,
    /// Number of lines
    pub lines: u16,
}

/// Reader keypad
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPadCapability {
    /// Keypad index
    pub index: u32,
    /// Number of keys
    pub keys: u32,
}

/// Everything a terminal reports about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfdCapabilities {
    /// Slots and their protocols
    pub slots: Vec<SlotCapability>,
    /// Display, if any
    pub display: Option<DisplayCapability>,
    /// Keypad, if any
    pub keypad: Option<KeyPadCapability>,
    /// Whether the reader can beep
    pub acoustic_signal: bool,
    /// Whether the reader can blink
    pub optical_signal: bool,
}

impl IfdCapabilities {
    /// Whether the first slot lists the protocol
    pub fn supports(&self, protocol: &str) -> bool {
        self.slots
            .first()
            .is_some_and(|slot| slot.protocols.iter().any(|p| p == protocol))
    }
}

/// Lazily queried view on one terminal. Reader features are only available
/// with an open channel.
#[derive(Debug)]
pub struct TerminalInfo<'a> {
    name: String,
    manager: &'a ChannelManager,
    channel: Option<Arc<MasterChannel>>,
    features: OnceCell<FeatureMap>,
}

impl<'a> TerminalInfo<'a> {
    /// View without a channel
    pub fn new<S: Into<String>>(manager: &'a ChannelManager, name: S) -> Self {
        Self {
            name: name.into(),
            manager,
            channel: None,
            features: OnceCell::new(),
        }
    }

    /// View backed by an open channel
    pub fn with_channel(manager: &'a ChannelManager, channel: Arc<MasterChannel>) -> Self {
        Self {
            name: channel.name().to_owned(),
            manager,
            channel: Some(channel),
            features: OnceCell::new(),
        }
    }

    /// Terminal name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a channel backs this view
    pub const fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Whether a card is present. Provider errors count as absent.
    pub fn is_card_present(&self) -> bool {
        self.manager
            .terminals()
            .is_card_present(&self.name)
            .unwrap_or(false)
    }

    /// Reader features, empty without a channel or when the request fails
    pub fn feature_codes(&self) -> &FeatureMap {
        self.features.get_or_init(|| {
            let Some(channel) = &self.channel else {
                return FeatureMap::new();
            };
            match channel.transmit_control(features::feature_request_ctl_code(), &[]) {
                Ok(data) => features::parse_feature_map(&data),
                Err(e) => {
                    warn!(terminal = %self.name, error = %e, "unable to request features from reader");
                    FeatureMap::new()
                }
            }
        })
    }

    /// Control code of a feature
    pub fn feature(&self, tag: u8) -> Option<u32> {
        self.feature_codes().get(&tag).copied()
    }

    /// Whether the reader runs PACE natively
    pub fn supports_pace(&self) -> bool {
        self.feature(features::EXECUTE_PACE).is_some()
    }

    /// Whether the reader verifies PINs on its keypad
    pub fn supports_pin_compare(&self) -> bool {
        self.feature(features::VERIFY_PIN_DIRECT).is_some()
    }

    /// Native PACE capabilities, empty without a channel or native PACE
    pub fn pace_capabilities(&self) -> ScioResult<PaceCapabilities> {
        let (Some(channel), Some(code)) = (&self.channel, self.feature(features::EXECUTE_PACE))
        else {
            return Ok(PaceCapabilities::default());
        };
        let request = ExecutePaceRequest::new(PaceFunction::GetReaderCapabilities).to_bytes();
        let raw = channel.transmit_control(code, &request)?;
        let response = ExecutePaceResponse::from_bytes(&raw)
            .map_err(|e| ScioError::new(ScioErrorCode::UnknownError, e.to_string()))?;
        if let Some(error) = response.error() {
            return Err(ScioError::new(
                ScioErrorCode::UnknownError,
                format!(
                    "PACE is advertised but the result is erroneous: {}",
                    error.description()
                ),
            ));
        }
        PaceCapabilities::from_response_data(&response.data)
            .map_err(|e| ScioError::new(ScioErrorCode::UnknownError, e.to_string()))
    }

    /// Current status. A present card is connected to read its ATR.
    pub fn status(&self) -> ScioResult<IfdStatus> {
        let present = self.is_card_present();
        let atr = match &self.channel {
            Some(channel) => Some(channel.atr()),
            None if present => match self.manager.open_master(&self.name) {
                Ok(master) => Some(master.atr()),
                Err(e) if e.code == ScioErrorCode::UnknownReader => {
                    return Err(ScioError::new(
                        ScioErrorCode::UnknownReader,
                        "Failed to connect card as terminal disappeared.",
                    ));
                }
                Err(e) => {
                    debug!(terminal = %self.name, error = %e, "reading ATR failed");
                    None
                }
            },
            None => None,
        };
        let slot = SlotStatus {
            index: 0,
            card_available: present,
            atr,
        };
        Ok(IfdStatus::new(self.name.clone(), true, vec![slot]))
    }

    fn interface_protocol(&self) -> Option<&'static str> {
        self.channel.as_ref().map(|_| {
            if self.manager.terminals().is_contactless(&self.name) {
                PROTOCOL_TYPE_A
            } else {
                PROTOCOL_T0
            }
        })
    }

    /// Protocols of slot 0: interface protocol, native PACE and native PIN
    /// compare
    pub fn slot_capability(&self) -> ScioResult<SlotCapability> {
        let mut protocols: Vec<String> = self
            .interface_protocol()
            .into_iter()
            .map(str::to_owned)
            .collect();
        if self.supports_pace() {
            protocols.extend(
                self.pace_capabilities()?
                    .protocols()
                    .into_iter()
                    .map(str::to_owned),
            );
        }
        if self.supports_pin_compare() {
            protocols.push(PIN_COMPARE_PROTOCOL.to_owned());
        }
        Ok(SlotCapability {
            index: 0,
            protocols,
        })
    }

    /// Display size read through `FEATURE_IFD_DISPLAY_PROPERTIES`
    pub fn display_capability(&self) -> Option<DisplayCapability> {
        let (channel, code) = (
            self.channel.as_ref()?,
            self.feature(features::IFD_DISPLAY_PROPERTIES)?,
        );
        let data = channel.transmit_control(code, &[]).ok()?;
        match data.as_ref() {
            [c1, c2, l1, l2] => {
                let columns = u16::from_be_bytes([*c1, *c2]);
                let lines = u16::from_be_bytes([*l1, *l2]);
                (columns > 0 && lines > 0).then_some(DisplayCapability {
                    index: 0,
                    columns,
                    lines,
                })
            }
            _ => None,
        }
    }

    /// Keypad read through `FEATURE_IFD_PIN_PROPERTIES`
    pub fn keypad_capability(&self) -> Option<KeyPadCapability> {
        let (channel, code) = (
            self.channel.as_ref()?,
            self.feature(features::IFD_PIN_PROPERTIES)?,
        );
        let data = channel.transmit_control(code, &[]).ok()?;
        // the properties do not carry a key count, a PIN pad has 16 keys
        (data.len() == 4).then_some(KeyPadCapability { index: 0, keys: 16 })
    }

    /// Capabilities as reported by the reader itself
    pub fn capabilities(&self) -> ScioResult<IfdCapabilities> {
        Ok(IfdCapabilities {
            slots: vec![self.slot_capability()?],
            display: self.display_capability(),
            keypad: self.keypad_capability(),
            // PC/SC cannot tell
            acoustic_signal: false,
            optical_signal: false,
        })
    }
}
