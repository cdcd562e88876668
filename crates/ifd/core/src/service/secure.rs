use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use super::IfdService;
use crate::channel::{ContextHandle, SlaveChannel, SlotHandle, slot_error};
use crate::pace::{
    EstablishPaceRequest, EstablishPaceResponse, ExecutePaceRequest, ExecutePaceResponse,
    PaceCapabilities, PaceCapability, PaceFunction,
};
use crate::pin::{PinVerifier, VerifyUserRequest, VerifyUserResponse};
use crate::protocol::{ProtocolData, ProtocolOutput};
use crate::scio::ScioError;
use crate::terminal::{TerminalInfo, features};
use crate::{IfdError, Result};

fn pace_error(error: ScioError) -> IfdError {
    if error.code.is_vanished() {
        slot_error(error)
    } else {
        IfdError::Protocol(error.message)
    }
}

fn pace_capabilities(info: &TerminalInfo<'_>) -> Result<PaceCapabilities> {
    info.pace_capabilities().map_err(pace_error)
}

impl IfdService {
    /// Verify the user with a PIN, on the reader keypad when possible
    #[instrument(skip_all, fields(slot = %slot))]
    pub fn verify_user(
        &self,
        handle: &ContextHandle,
        slot: &SlotHandle,
        request: &VerifyUserRequest,
    ) -> Result<VerifyUserResponse> {
        let context = self.context(handle)?;
        let manager = context.manager.as_ref();
        let channel = manager.slave(slot)?;
        let info = TerminalInfo::with_channel(manager, Arc::clone(channel.master()));
        let capabilities = self.capabilities(&info).map_err(slot_error)?;
        PinVerifier::new(&self.config, self.consent.as_deref()).verify(
            &channel,
            &info,
            &capabilities,
            request,
        )
    }

    /// Establish a secure channel, natively through the reader when it runs
    /// the requested PACE variant, else through a registered software
    /// protocol
    #[instrument(skip_all, fields(slot = %slot, protocol = %data.protocol))]
    pub fn establish_channel(
        &self,
        handle: &ContextHandle,
        slot: &SlotHandle,
        data: &ProtocolData,
    ) -> Result<ProtocolOutput> {
        let context = self.context(handle)?;
        let manager = context.manager.as_ref();
        let channel = manager.slave(slot)?;
        let info = TerminalInfo::with_channel(manager, Arc::clone(channel.master()));

        if let Some(output) = establish_native(&channel, &info, data)? {
            return Ok(output);
        }

        let factory = self.registry.get(&data.protocol).ok_or_else(|| {
            IfdError::UnknownProtocol("No such protocol available in this IFD.".into())
        })?;
        let mut protocol = factory.create_instance();
        let output = protocol.establish(data, &*channel, self.consent.as_deref())?;
        channel.set_secure_messaging(protocol);
        debug!("software secure channel established");
        Ok(output)
    }

    /// Tear down the secure channel. The software layer is removed even when
    /// the reader fails to destroy its native channel.
    #[instrument(skip_all, fields(slot = %slot))]
    pub fn destroy_channel(&self, handle: &ContextHandle, slot: &SlotHandle) -> Result<()> {
        let context = self.context(handle)?;
        let manager = context.manager.as_ref();
        let channel = manager.slave(slot)?;
        let info = TerminalInfo::with_channel(manager, Arc::clone(channel.master()));

        let mut result = Ok(());
        if let Some(code) = info.feature(features::EXECUTE_PACE) {
            match pace_capabilities(&info) {
                Ok(capabilities) if capabilities.contains(PaceCapability::DestroyChannel) => {
                    let request = ExecutePaceRequest::new(PaceFunction::DestroyChannel);
                    result = channel
                        .transmit_control(code, &request.to_bytes())
                        .and_then(|raw| ExecutePaceResponse::from_bytes(&raw))
                        .and_then(ExecutePaceResponse::into_result)
                        .map(|_| ());
                }
                Ok(_) => {}
                Err(e) => result = Err(e),
            }
        }

        if channel.remove_secure_messaging() {
            debug!("software secure channel removed");
        }
        result
    }
}

// Ok(None) when the reader cannot run the requested protocol itself
fn establish_native(
    channel: &SlaveChannel,
    info: &TerminalInfo<'_>,
    data: &ProtocolData,
) -> Result<Option<ProtocolOutput>> {
    let Some(code) = info.feature(features::EXECUTE_PACE) else {
        return Ok(None);
    };
    let capabilities = pace_capabilities(info)?;
    let advertised = !data.protocol.is_empty()
        && capabilities
            .protocols()
            .first()
            .is_some_and(|first| first.starts_with(data.protocol.as_str()));
    if !advertised {
        return Ok(None);
    }
    let Some(pin_id) = data.pin_id else {
        return Err(IfdError::parameter("PACE requires a PIN id."));
    };
    if !capabilities.supports_pin(pin_id) {
        debug!(?pin_id, "reader cannot run PACE with this password");
        return Ok(None);
    }

    let request = EstablishPaceRequest {
        pin_id,
        chat: data.chat.clone(),
        pin: data.pin.clone(),
        certificate_description: data.certificate_description.clone(),
    };
    let payload = request.to_bytes(capabilities)?;
    let execute = ExecutePaceRequest::with_data(
        PaceFunction::EstablishChannel,
        Bytes::copy_from_slice(&payload),
    );
    debug!(terminal = %info.name(), "establishing PACE on the reader");
    let raw = channel.transmit_control(code, &execute.to_bytes())?;
    debug!(response = %hex::encode(&raw), "reader finished PACE");

    let data_field = ExecutePaceResponse::from_bytes(&raw)?.into_result()?;
    let response = EstablishPaceResponse::from_bytes(&data_field)?;
    let mut output = ProtocolOutput::new(data.protocol.clone());
    output.retry_counter = response.retry_counter();
    output.ef_card_access = Some(response.ef_card_access);
    output.car_current = response.car_current;
    output.car_previous = response.car_previous;
    output.id_icc = response.id_icc;
    Ok(Some(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scio::ScioErrorCode;

    #[test]
    fn test_pace_errors() {
        assert!(matches!(
            pace_error(ScioError::new(ScioErrorCode::RemovedCard, "gone")),
            IfdError::InvalidSlotHandle(_)
        ));
        assert_eq!(
            pace_error(ScioError::new(ScioErrorCode::UnknownError, "bad capabilities")),
            IfdError::Protocol("bad capabilities".into())
        );
    }
}
