//! PIN verification on the reader keypad or through the UI

pub mod ccid;
pub mod encoding;

use std::time::Duration;

use bytes::Bytes;
use ecard_apdu_core::{Response, StatusWord, response::status::common};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

pub use ccid::PinVerifyStructure;
pub use encoding::{PasswordAttributes, PasswordType};

use crate::channel::SlaveChannel;
use crate::config::IfdConfig;
use crate::terminal::{IfdCapabilities, PIN_COMPARE_PROTOCOL, TerminalInfo, features};
use crate::ui::{PinPrompt, StepResult, UserConsent};
use crate::{IfdError, Result};

/// PIN pad input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinInput {
    /// Keypad index
    pub index: u32,
    /// How the PIN is encoded
    pub attributes: PasswordAttributes,
}

/// Requested input unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputUnit {
    /// PIN entry
    Pin(PinInput),
    /// Biometric sensor
    Biometric,
}

/// Input of `verify_user`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyUserRequest {
    /// Input unit to use
    pub input: InputUnit,
    /// Verify command header the PIN is appended to
    pub template: Bytes,
    /// Prompt text, the configured default otherwise
    pub message: Option<String>,
    /// Time until the first key, the configured default otherwise
    pub timeout: Option<Duration>,
}

impl VerifyUserRequest {
    /// PIN verification with a command template
    pub fn pin<T: Into<Bytes>>(attributes: PasswordAttributes, template: T) -> Self {
        Self {
            input: InputUnit::Pin(PinInput {
                index: 0,
                attributes,
            }),
            template: template.into(),
            message: None,
            timeout: None,
        }
    }
}

/// Output of `verify_user`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyUserResponse {
    /// Last response of the card or reader, if any
    pub response: Option<Bytes>,
    /// Outcome of the verification
    pub result: Result<()>,
}

impl VerifyUserResponse {
    fn failed(error: IfdError) -> Self {
        Self {
            response: None,
            result: Err(error),
        }
    }

    /// Whether the user was verified
    pub const fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Interpret the two byte result of a reader side verification
pub fn check_native_result(raw: &[u8]) -> Result<()> {
    let status = match raw {
        [.., sw1, sw2] => StatusWord::new(*sw1, *sw2),
        _ => return Err(IfdError::unknown("Reader returned no verify result.")),
    };
    match status {
        common::SUCCESS => Ok(()),
        common::INPUT_TIMEOUT => Err(IfdError::Timeout("Verify operation timed out.".into())),
        common::INPUT_CANCELLED => Err(IfdError::CancellationByUser(
            "Verify operation was cancelled with the cancel button.".into(),
        )),
        common::PIN_MISMATCH => Err(IfdError::unknown(
            "Modify PIN operation failed because two PINs were different.",
        )),
        common::PIN_WRONG_LENGTH => Err(IfdError::unknown("PIN has wrong length.")),
        common::INVALID_PARAMETER => Err(IfdError::parameter(
            "Invalid parameter passed to verify command.",
        )),
        other => Err(IfdError::unknown(other.message())),
    }
}

/// Runs a PIN verification against one channel
#[derive(Debug)]
pub struct PinVerifier<'a> {
    config: &'a IfdConfig,
    consent: Option<&'a dyn UserConsent>,
}

impl<'a> PinVerifier<'a> {
    /// Create a verifier
    pub const fn new(config: &'a IfdConfig, consent: Option<&'a dyn UserConsent>) -> Self {
        Self { config, consent }
    }

    fn prompt(&self, request: &VerifyUserRequest, attributes: &PasswordAttributes) -> PinPrompt {
        PinPrompt {
            message: request
                .message
                .clone()
                .unwrap_or_else(|| self.config.messages.authentication_request.clone()),
            min_length: attributes.min_length,
            max_length: attributes.max_length,
            first_key_timeout: request.timeout.unwrap_or(self.config.first_key_timeout),
            after_first_key_timeout: self.config.after_first_key_timeout,
        }
    }

    /// Verify the user. Precondition failures are errors, the outcome of the
    /// verification itself is reported in the response.
    #[instrument(skip_all, fields(terminal = %channel.terminal()))]
    pub fn verify(
        &self,
        channel: &SlaveChannel,
        info: &TerminalInfo<'_>,
        capabilities: &IfdCapabilities,
        request: &VerifyUserRequest,
    ) -> Result<VerifyUserResponse> {
        if !capabilities.supports(PIN_COMPARE_PROTOCOL) {
            return Err(IfdError::unknown(
                "PinCompare protocol is not supported by this IFD.",
            ));
        }
        let pin = match &request.input {
            InputUnit::Pin(pin) => pin,
            InputUnit::Biometric => {
                return Err(IfdError::UnknownInputUnit(
                    "Biometric authentication not supported by IFD.".into(),
                ));
            }
        };

        if let Some(code) = info.feature(features::VERIFY_PIN_DIRECT) {
            self.native(channel, code, request, &pin.attributes)
        } else if let Some(consent) = self.consent {
            self.software(channel, consent, request, &pin.attributes)
        } else {
            Err(IfdError::unknown(
                "No input unit available to perform PinCompare protocol.",
            ))
        }
    }

    fn native(
        &self,
        channel: &SlaveChannel,
        code: u32,
        request: &VerifyUserRequest,
        attributes: &PasswordAttributes,
    ) -> Result<VerifyUserResponse> {
        let structure =
            PinVerifyStructure::new(attributes, &request.template, self.config.language_id)?
                .to_bytes();
        let mut run = || channel.transmit_control(code, &structure);

        let outcome = match self.consent {
            Some(consent) => consent.run_native_verify(&self.prompt(request, attributes), &mut run),
            None => run().map(StepResult::Ok),
        };
        Ok(match outcome {
            Ok(StepResult::Ok(raw)) => {
                debug!(result = %hex::encode(&raw), "reader finished PIN verification");
                VerifyUserResponse {
                    result: check_native_result(&raw),
                    response: Some(raw),
                }
            }
            Ok(StepResult::Cancelled) => VerifyUserResponse::failed(IfdError::CancellationByUser(
                "PIN entry cancelled by user.".into(),
            )),
            Err(e) if e.is_terminated() => return Err(e),
            Err(e) => {
                warn!(error = %e, "reader PIN verification failed");
                VerifyUserResponse::failed(IfdError::AuthenticationFailed(e.to_string()))
            }
        })
    }

    fn software(
        &self,
        channel: &SlaveChannel,
        consent: &dyn UserConsent,
        request: &VerifyUserRequest,
        attributes: &PasswordAttributes,
    ) -> Result<VerifyUserResponse> {
        let prompt = self.prompt(request, attributes);
        loop {
            let pin = match consent.capture_pin(&prompt) {
                Ok(StepResult::Ok(pin)) => pin,
                Ok(StepResult::Cancelled) => {
                    return Ok(VerifyUserResponse::failed(IfdError::CancellationByUser(
                        "PIN entry cancelled by user.".into(),
                    )));
                }
                Err(e) if e.is_terminated() => return Err(e),
                Err(e) => return Ok(VerifyUserResponse::failed(e)),
            };

            let apdu = match build_verify_apdu(&request.template, attributes, &pin) {
                Ok(apdu) => apdu,
                Err(e) => return Ok(VerifyUserResponse::failed(e)),
            };
            drop(pin);

            let raw = match channel.transmit(&apdu) {
                Ok(raw) => raw,
                Err(e) if e.is_terminated() => return Err(e),
                Err(e) => {
                    return Ok(VerifyUserResponse::failed(IfdError::AuthenticationFailed(
                        e.to_string(),
                    )));
                }
            };
            drop(apdu);

            let status = match Response::from_bytes(&raw) {
                Ok(response) => response.status(),
                Err(e) => {
                    return Ok(VerifyUserResponse {
                        response: Some(raw),
                        result: Err(IfdError::Apdu(e.into())),
                    });
                }
            };
            if status.is_success() {
                info!("PIN verified");
                return Ok(VerifyUserResponse {
                    response: Some(raw),
                    result: Ok(()),
                });
            }
            match status.retry_counter() {
                Some(left) if left > 0 => {
                    debug!(left, "wrong PIN, asking again");
                    continue;
                }
                _ => {
                    return Ok(VerifyUserResponse {
                        response: Some(raw),
                        result: Err(IfdError::AuthenticationFailed(status.message())),
                    });
                }
            }
        }
    }
}

/// Verify command with the encoded PIN appended as data
pub fn build_verify_apdu(
    template: &[u8],
    attributes: &PasswordAttributes,
    pin: &str,
) -> Result<Zeroizing<Vec<u8>>> {
    let encoded = attributes.encode(pin)?;
    let len = u8::try_from(encoded.len())
        .map_err(|_| IfdError::parameter("Encoded PIN exceeds 255 bytes."))?;
    let mut apdu = Zeroizing::new(Vec::with_capacity(template.len() + 1 + encoded.len()));
    apdu.extend_from_slice(template);
    apdu.push(len);
    apdu.extend_from_slice(&encoded);
    Ok(apdu)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::channel::ChannelManager;
    use crate::scio::mock::MockTerminals;
    use crate::terminal::SlotCapability;
    use crate::ui::testing::ScriptedConsent;

    const TEMPLATE: [u8; 4] = [0x00, 0x20, 0x00, 0x01];

    fn caps() -> IfdCapabilities {
        IfdCapabilities {
            slots: vec![SlotCapability {
                index: 0,
                protocols: vec![PIN_COMPARE_PROTOCOL.to_owned()],
            }],
            ..Default::default()
        }
    }

    fn setup(native: bool) -> (MockTerminals, ChannelManager) {
        let mock = MockTerminals::new();
        mock.add_terminal("Reader1");
        mock.insert_card("Reader1", &[0x3B, 0x00]);
        if native {
            mock.push_control_response(
                features::feature_request_ctl_code(),
                &[0x06, 0x04, 0x42, 0x33, 0x00, 0x06],
            );
        }
        let manager = ChannelManager::new(Arc::new(mock.clone()));
        (mock, manager)
    }

    fn request() -> VerifyUserRequest {
        VerifyUserRequest::pin(
            PasswordAttributes::new(PasswordType::AsciiNumeric, 4, 6).with_max_length(6),
            TEMPLATE.to_vec(),
        )
    }

    #[test]
    fn test_native_result_mapping() {
        assert!(check_native_result(&[0x90, 0x00]).is_ok());
        assert!(matches!(
            check_native_result(&[0x64, 0x00]),
            Err(IfdError::Timeout(_))
        ));
        assert!(matches!(
            check_native_result(&[0x64, 0x01]),
            Err(IfdError::CancellationByUser(_))
        ));
        assert_eq!(
            check_native_result(&[0x64, 0x03]).unwrap_err().to_string(),
            "PIN has wrong length."
        );
        assert!(matches!(
            check_native_result(&[0x6B, 0x80]),
            Err(IfdError::IncorrectParameter(_))
        ));
        assert!(matches!(
            check_native_result(&[0x63, 0xC1]),
            Err(IfdError::Unknown(_))
        ));
    }

    #[test]
    fn test_native_verify() {
        let (mock, manager) = setup(true);
        mock.push_control_response(0x4233_0006, &[0x90, 0x00]);
        let slave = manager.open_slave("Reader1").unwrap();
        let info = TerminalInfo::with_channel(&manager, Arc::clone(slave.master()));
        let config = IfdConfig::default();

        let response = PinVerifier::new(&config, None)
            .verify(&slave, &info, &caps(), &request())
            .unwrap();
        assert!(response.is_ok());
        assert_eq!(response.response.as_deref(), Some(&[0x90, 0x00][..]));

        let (code, data) = mock.controls().pop().unwrap();
        assert_eq!(code, 0x4233_0006);
        assert_eq!(&data[..3], &[0x3C, 0x00, 0x82]);
        assert_eq!(&data[data.len() - 4..], &TEMPLATE);
    }

    #[test]
    fn test_native_cancel() {
        let (_mock, manager) = setup(true);
        let slave = manager.open_slave("Reader1").unwrap();
        let info = TerminalInfo::with_channel(&manager, Arc::clone(slave.master()));
        let config = IfdConfig::default();
        let consent = ScriptedConsent {
            cancel_native: true,
            ..Default::default()
        };

        let response = PinVerifier::new(&config, Some(&consent))
            .verify(&slave, &info, &caps(), &request())
            .unwrap();
        assert!(matches!(
            response.result,
            Err(IfdError::CancellationByUser(_))
        ));
        assert_eq!(consent.prompts.lock()[0].message, "Enter secret:");
    }

    #[test]
    fn test_software_retries_on_retry_counter() {
        let (mock, manager) = setup(false);
        mock.push_response(&[0x63, 0xC2]);
        mock.push_response(&[0x90, 0x00]);
        let slave = manager.open_slave("Reader1").unwrap();
        let info = TerminalInfo::with_channel(&manager, Arc::clone(slave.master()));
        let config = IfdConfig::default();
        let consent = ScriptedConsent::with_pins([Some("1111"), Some("123456")]);

        let response = PinVerifier::new(&config, Some(&consent))
            .verify(&slave, &info, &caps(), &request())
            .unwrap();
        assert!(response.is_ok());
        assert_eq!(
            mock.transmitted(),
            vec![
                hex::decode("002000010431313131").unwrap(),
                hex::decode("0020000106313233343536").unwrap(),
            ]
        );
    }

    #[test]
    fn test_software_blocked_pin() {
        let (mock, manager) = setup(false);
        mock.push_response(&[0x63, 0xC0]);
        let slave = manager.open_slave("Reader1").unwrap();
        let info = TerminalInfo::with_channel(&manager, Arc::clone(slave.master()));
        let config = IfdConfig::default();
        let consent = ScriptedConsent::with_pins([Some("1234")]);

        let response = PinVerifier::new(&config, Some(&consent))
            .verify(&slave, &info, &caps(), &request())
            .unwrap();
        assert!(matches!(
            response.result,
            Err(IfdError::AuthenticationFailed(_))
        ));
        assert_eq!(response.response.as_deref(), Some(&[0x63, 0xC0][..]));
    }

    #[test]
    fn test_software_cancel_and_transport_error() {
        let (mock, manager) = setup(false);
        let slave = manager.open_slave("Reader1").unwrap();
        let info = TerminalInfo::with_channel(&manager, Arc::clone(slave.master()));
        let config = IfdConfig::default();

        let consent = ScriptedConsent::with_pins([None]);
        let response = PinVerifier::new(&config, Some(&consent))
            .verify(&slave, &info, &caps(), &request())
            .unwrap();
        assert!(matches!(
            response.result,
            Err(IfdError::CancellationByUser(_))
        ));

        mock.remove_card("Reader1");
        let consent = ScriptedConsent::with_pins([Some("1234")]);
        let response = PinVerifier::new(&config, Some(&consent))
            .verify(&slave, &info, &caps(), &request())
            .unwrap();
        assert!(response.response.is_none());
        assert!(matches!(
            response.result,
            Err(IfdError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_preconditions() {
        let (_mock, manager) = setup(false);
        let slave = manager.open_slave("Reader1").unwrap();
        let info = TerminalInfo::with_channel(&manager, Arc::clone(slave.master()));
        let config = IfdConfig::default();
        let verifier = PinVerifier::new(&config, None);

        let err = verifier
            .verify(&slave, &info, &IfdCapabilities::default(), &request())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "PinCompare protocol is not supported by this IFD."
        );

        let err = verifier.verify(&slave, &info, &caps(), &request()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "No input unit available to perform PinCompare protocol."
        );

        let mut biometric = request();
        biometric.input = InputUnit::Biometric;
        assert!(matches!(
            verifier.verify(&slave, &info, &caps(), &biometric),
            Err(IfdError::UnknownInputUnit(_))
        ));
    }

    #[test]
    fn test_build_verify_apdu() {
        let attrs = PasswordAttributes::new(PasswordType::Bcd, 4, 3)
            .with_padding(true)
            .with_pad_char(0xFF);
        let apdu = build_verify_apdu(&TEMPLATE, &attrs, "1234").unwrap();
        assert_eq!(apdu.as_slice(), &[0x00, 0x20, 0x00, 0x01, 0x03, 0x12, 0x34, 0xFF]);

        let attrs = PasswordAttributes::new(PasswordType::Utf8, 4, 0);
        assert!(matches!(
            build_verify_apdu(&TEMPLATE, &attrs, &"1".repeat(256)),
            Err(IfdError::IncorrectParameter(_))
        ));
    }
}
