//! Native PACE structures exchanged through the reader's `EXECUTE_PACE`
//! feature (PC/SC Part 10 Amendment 1, BSI TR-03119).
//!
//! All length and result fields are little endian.

use bytes::{BufMut, Bytes, BytesMut};
use derive_more::Display;
use ecard_apdu_core::StatusWord;
use zeroize::Zeroizing;

use crate::{IfdError, Result};

/// Protocol URI of PACE
pub const PACE_PROTOCOL: &str = "urn:oid:0.4.0.127.0.7.2.2.4";

/// Function selector of an `EXECUTE_PACE` request
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PaceFunction {
    /// Query the reader's PACE capabilities
    GetReaderCapabilities = 0x01,
    /// Run PACE
    EstablishChannel = 0x02,
    /// Tear down a PACE channel
    DestroyChannel = 0x03,
}

/// One reader PACE capability bit
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaceCapability {
    /// PACE for qualified signatures
    #[display("QES")]
    Qes,
    /// PACE for the German eID
    #[display("GermanEID")]
    GermanEid,
    /// Generic PACE
    #[display("GenericPACE")]
    GenericPace,
    /// The reader can destroy a PACE channel
    #[display("DestroyPACEChannel")]
    DestroyChannel,
}

impl PaceCapability {
    /// All capabilities in bit order
    pub const ALL: [Self; 4] = [Self::Qes, Self::GermanEid, Self::GenericPace, Self::DestroyChannel];

    /// Bit of this capability in the capability byte
    pub const fn bit(&self) -> u8 {
        match self {
            Self::Qes => 0x10,
            Self::GermanEid => 0x20,
            Self::GenericPace => 0x40,
            Self::DestroyChannel => 0x80,
        }
    }

    /// Protocol made available by this capability, if any
    pub const fn protocol(&self) -> Option<&'static str> {
        match self {
            Self::Qes | Self::GermanEid | Self::GenericPace => Some(PACE_PROTOCOL),
            Self::DestroyChannel => None,
        }
    }
}

/// Capability bitmap reported by `GetReaderPACECapabilities`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PaceCapabilities(u8);

impl PaceCapabilities {
    /// Capabilities from the raw bitmap
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw bitmap
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Whether no capability is set
    pub const fn is_empty(&self) -> bool {
        self.0 & 0xF0 == 0
    }

    /// Whether the capability is set
    pub const fn contains(&self, capability: PaceCapability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Iterate over the set capabilities
    pub fn iter(&self) -> impl Iterator<Item = PaceCapability> + '_ {
        PaceCapability::ALL.into_iter().filter(|c| self.contains(*c))
    }

    /// Protocol URIs offered by these capabilities, without duplicates
    pub fn protocols(&self) -> Vec<&'static str> {
        let mut protocols = Vec::new();
        for protocol in self.iter().filter_map(|c| c.protocol()) {
            if !protocols.contains(&protocol) {
                protocols.push(protocol);
            }
        }
        protocols
    }

    /// Whether the reader can run PACE with the given password
    pub const fn supports_pin(&self, pin_id: PinId) -> bool {
        self.contains(PaceCapability::GenericPace)
            || self.contains(PaceCapability::GermanEid)
            || (self.contains(PaceCapability::Qes) && matches!(pin_id, PinId::Can))
    }

    /// Whether establishment carries terminal authentication data
    const fn with_terminal_authentication(&self) -> bool {
        self.contains(PaceCapability::GermanEid) || self.contains(PaceCapability::Qes)
    }

    /// Parse the data field of a capability response. A single byte is the
    /// bitmap itself, longer data starts with a length byte.
    pub fn from_response_data(data: &[u8]) -> Result<Self> {
        match data {
            [] => Ok(Self::default()),
            [bits] => Ok(Self(*bits)),
            [len, rest @ ..] => {
                let bits = rest
                    .get(..*len as usize)
                    .ok_or_else(|| IfdError::Protocol("truncated PACE capabilities".into()))?;
                Ok(Self(bits.first().copied().unwrap_or_default()))
            }
        }
    }
}

/// Password used to run PACE
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PinId {
    /// Machine readable zone
    #[display("MRZ")]
    Mrz = 0x01,
    /// Card access number
    #[display("CAN")]
    Can = 0x02,
    /// eID PIN
    #[display("PIN")]
    Pin = 0x03,
    /// PIN unblocking key
    #[display("PUK")]
    Puk = 0x04,
}

impl TryFrom<u8> for PinId {
    type Error = IfdError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Mrz),
            0x02 => Ok(Self::Can),
            0x03 => Ok(Self::Pin),
            0x04 => Ok(Self::Puk),
            other => Err(IfdError::parameter(format!("unknown PIN id {other:#04x}"))),
        }
    }
}

/// Outer `EXECUTE_PACE` request: function, 2 byte length, data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutePaceRequest {
    /// Requested function
    pub function: PaceFunction,
    /// Function specific input
    pub data: Bytes,
}

impl ExecutePaceRequest {
    /// Request without input data
    pub const fn new(function: PaceFunction) -> Self {
        Self {
            function,
            data: Bytes::new(),
        }
    }

    /// Request with input data
    pub fn with_data<T: Into<Bytes>>(function: PaceFunction, data: T) -> Self {
        Self {
            function,
            data: data.into(),
        }
    }

    /// Serialize for the control command
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.data.len());
        buf.put_u8(self.function as u8);
        buf.put_u16_le(self.data.len() as u16);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// Input of `EstablishPACEChannel`
#[derive(Debug, Clone)]
pub struct EstablishPaceRequest {
    /// Password type
    pub pin_id: PinId,
    /// Certificate holder authorization template
    pub chat: Option<Bytes>,
    /// Non secret password supplied by the host
    pub pin: Option<Zeroizing<String>>,
    /// Certificate description
    pub certificate_description: Option<Bytes>,
}

impl EstablishPaceRequest {
    /// Serialize the establishment input. The certificate description is
    /// only written for readers doing terminal authentication.
    pub fn to_bytes(&self, capabilities: PaceCapabilities) -> Result<Zeroizing<Vec<u8>>> {
        let chat = self.chat.as_deref().unwrap_or_default();
        let pin = self.pin.as_deref().map(String::as_bytes).unwrap_or_default();
        let chat_len = u8::try_from(chat.len())
            .map_err(|_| IfdError::parameter("CHAT exceeds 255 bytes."))?;
        let pin_len = u8::try_from(pin.len())
            .map_err(|_| IfdError::parameter("PIN exceeds 255 bytes."))?;

        let mut buf = Zeroizing::new(Vec::with_capacity(4 + chat.len() + pin.len()));
        buf.push(self.pin_id as u8);
        buf.push(chat_len);
        buf.extend_from_slice(chat);
        buf.push(pin_len);
        buf.extend_from_slice(pin);
        if capabilities.with_terminal_authentication() {
            let desc = self.certificate_description.as_deref().unwrap_or_default();
            let desc_len = u16::try_from(desc.len()).map_err(|_| {
                IfdError::parameter("Certificate description exceeds 65535 bytes.")
            })?;
            buf.extend_from_slice(&desc_len.to_le_bytes());
            buf.extend_from_slice(desc);
        }
        Ok(buf)
    }
}

/// Result codes of `EXECUTE_PACE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceResultCode {
    /// Inconsistent lengths in input
    InconsistentLength,
    /// Unexpected data in input
    UnexpectedData,
    /// Unexpected combination of data in input
    UnexpectedCombination,
    /// Syntax error in TLV response
    TlvResponseSyntax,
    /// Unexpected or missing object in TLV response
    UnexpectedTlvObject,
    /// Unknown PIN-ID
    UnknownPin,
    /// Wrong authentication token
    WrongAuthToken,
    /// Card error while selecting EF.CardAccess
    SelectEfCardAccess(StatusWord),
    /// Card error while reading EF.CardAccess
    ReadEfCardAccess(StatusWord),
    /// Card error on MSE: Set AT
    MseSetAt(StatusWord),
    /// Card error on General Authenticate step 1
    GeneralAuthenticate1(StatusWord),
    /// Card error on General Authenticate step 2
    GeneralAuthenticate2(StatusWord),
    /// Card error on General Authenticate step 3
    GeneralAuthenticate3(StatusWord),
    /// Card error on General Authenticate step 4
    GeneralAuthenticate4(StatusWord),
    /// Communication abort
    CommunicationAbort,
    /// No card
    NoCard,
    /// Aborted by the user
    Abort,
    /// Timeout
    Timeout,
    /// Code not listed above
    Unknown(u32),
}

impl PaceResultCode {
    /// Decode a non-zero result
    pub const fn from_code(code: u32) -> Self {
        let sw = StatusWord::from_u16(code as u16);
        match code {
            0xD000_0001 => Self::InconsistentLength,
            0xD000_0002 => Self::UnexpectedData,
            0xD000_0003 => Self::UnexpectedCombination,
            0xE000_0001 => Self::TlvResponseSyntax,
            0xE000_0002 => Self::UnexpectedTlvObject,
            0xE000_0003 => Self::UnknownPin,
            0xE000_0006 => Self::WrongAuthToken,
            0xF010_0001 => Self::CommunicationAbort,
            0xF010_0002 => Self::NoCard,
            0xF020_0001 => Self::Abort,
            0xF020_0002 => Self::Timeout,
            _ => match code & 0xFFFF_0000 {
                0xF000_0000 => Self::SelectEfCardAccess(sw),
                0xF001_0000 => Self::ReadEfCardAccess(sw),
                0xF002_0000 => Self::MseSetAt(sw),
                0xF003_0000 => Self::GeneralAuthenticate1(sw),
                0xF004_0000 => Self::GeneralAuthenticate2(sw),
                0xF005_0000 => Self::GeneralAuthenticate3(sw),
                0xF006_0000 => Self::GeneralAuthenticate4(sw),
                _ => Self::Unknown(code),
            },
        }
    }

    /// Human readable description
    pub fn description(&self) -> String {
        match self {
            Self::InconsistentLength => "Inconsistent lengths in input".into(),
            Self::UnexpectedData => "Unexpected data in input".into(),
            Self::UnexpectedCombination => "Unexpected combination of data in input".into(),
            Self::TlvResponseSyntax => "Syntax error in TLV response".into(),
            Self::UnexpectedTlvObject => "Unexpected or missing object in TLV response".into(),
            Self::UnknownPin => "Unknown PIN-ID".into(),
            Self::WrongAuthToken => "Wrong Authentication Token".into(),
            Self::SelectEfCardAccess(sw) => format!("Select EF.CardAccess: {sw}"),
            Self::ReadEfCardAccess(sw) => format!("Read Binary EF.CardAccess: {sw}"),
            Self::MseSetAt(sw) => format!("MSE: Set AT: {sw}"),
            Self::GeneralAuthenticate1(sw) => format!("General Authenticate Step 1: {sw}"),
            Self::GeneralAuthenticate2(sw) => format!("General Authenticate Step 2: {sw}"),
            Self::GeneralAuthenticate3(sw) => format!("General Authenticate Step 3: {sw}"),
            Self::GeneralAuthenticate4(sw) => format!("General Authenticate Step 4: {sw}"),
            Self::CommunicationAbort => {
                "Communication abort (e.g. card removed during protocol)".into()
            }
            Self::NoCard => "No card".into(),
            Self::Abort => "Abort".into(),
            Self::Timeout => "Timeout".into(),
            Self::Unknown(code) => format!("Unknown PACE result {code:#010x}"),
        }
    }

    /// Map onto the service error taxonomy
    pub fn into_error(self) -> IfdError {
        match self {
            Self::Abort => IfdError::CancellationByUser(self.description()),
            Self::Timeout => IfdError::Timeout(self.description()),
            Self::NoCard | Self::CommunicationAbort => IfdError::NoCard(self.description()),
            Self::MseSetAt(sw) if sw.retry_counter().is_some() => {
                IfdError::AuthenticationFailed(self.description())
            }
            _ => IfdError::Protocol(self.description()),
        }
    }
}

/// Outer `EXECUTE_PACE` response: 4 byte result, 2 byte length, data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutePaceResponse {
    /// Raw result code, zero on success
    pub result: u32,
    /// Function specific output
    pub data: Bytes,
}

impl ExecutePaceResponse {
    /// Parse the control command output
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(raw);
        let result = u32::from_le_bytes(reader.array::<4>()?);
        let len = reader.u16_le()? as usize;
        let data = Bytes::copy_from_slice(reader.take(len)?);
        Ok(Self { result, data })
    }

    /// Whether the reader reported an error
    pub const fn is_error(&self) -> bool {
        self.result != 0
    }

    /// Decoded error, `None` on success
    pub const fn error(&self) -> Option<PaceResultCode> {
        if self.is_error() {
            Some(PaceResultCode::from_code(self.result))
        } else {
            None
        }
    }

    /// The data field, or the mapped error
    pub fn into_result(self) -> Result<Bytes> {
        match self.error() {
            Some(code) => Err(code.into_error()),
            None => Ok(self.data),
        }
    }
}

/// Output of `EstablishPACEChannel`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishPaceResponse {
    /// Status word of MSE: Set AT
    pub mse_status: StatusWord,
    /// Content of EF.CardAccess
    pub ef_card_access: Bytes,
    /// Most recent certification authority reference
    pub car_current: Option<Bytes>,
    /// Previous certification authority reference
    pub car_previous: Option<Bytes>,
    /// Card identifier
    pub id_icc: Option<Bytes>,
}

impl EstablishPaceResponse {
    /// Parse the data field of a successful establishment
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let mse_status = StatusWord::from(reader.u16_le()?);
        let len = reader.u16_le()? as usize;
        let ef_card_access = Bytes::copy_from_slice(reader.take(len)?);
        let len = reader.u8()? as usize;
        let car_current = reader.optional(len)?;
        let len = reader.u8()? as usize;
        let car_previous = reader.optional(len)?;
        // IDICC is absent in responses of some readers
        let id_icc = if reader.is_empty() {
            None
        } else {
            let len = reader.u16_le()? as usize;
            reader.optional(len)?
        };

        Ok(Self {
            mse_status,
            ef_card_access,
            car_current,
            car_previous,
            id_icc,
        })
    }

    /// Retry counter from a `63 CX` MSE: Set AT status
    pub const fn retry_counter(&self) -> Option<u8> {
        self.mse_status.retry_counter()
    }
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(IfdError::Protocol(
                "malformed native PACE response".to_owned(),
            ));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array::<2>()?))
    }

    fn optional(&mut self, n: usize) -> Result<Option<Bytes>> {
        let value = self.take(n)?;
        Ok((!value.is_empty()).then(|| Bytes::copy_from_slice(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_request_framing() {
        let req = ExecutePaceRequest::new(PaceFunction::GetReaderCapabilities);
        assert_eq!(req.to_bytes().as_ref(), &[0x01, 0x00, 0x00]);

        let req = ExecutePaceRequest::with_data(PaceFunction::EstablishChannel, vec![0xAA; 0x102]);
        let bytes = req.to_bytes();
        assert_eq!(&bytes[..3], &[0x02, 0x02, 0x01]);
        assert_eq!(bytes.len(), 3 + 0x102);
    }

    #[test]
    fn test_establish_request_layout() {
        let req = EstablishPaceRequest {
            pin_id: PinId::Can,
            chat: Some(Bytes::from_static(&[0x7F, 0x4C])),
            pin: Some(Zeroizing::new("123456".to_owned())),
            certificate_description: Some(Bytes::from_static(&[0x30, 0x00])),
        };

        let generic = PaceCapabilities::from_bits(0x40);
        assert_eq!(
            hex::encode(req.to_bytes(generic).unwrap().as_slice()),
            "02027f4c06313233343536"
        );

        let eid = PaceCapabilities::from_bits(0x60);
        assert_eq!(
            hex::encode(req.to_bytes(eid).unwrap().as_slice()),
            "02027f4c0631323334353602003000"
        );
    }

    #[test]
    fn test_establish_request_rejects_long_fields() {
        let mut req = EstablishPaceRequest {
            pin_id: PinId::Pin,
            chat: Some(Bytes::from(vec![0x7F; 256])),
            pin: None,
            certificate_description: None,
        };
        let generic = PaceCapabilities::from_bits(0x40);
        assert!(matches!(
            req.to_bytes(generic),
            Err(IfdError::IncorrectParameter(_))
        ));

        req.chat = None;
        req.pin = Some(Zeroizing::new("1".repeat(256)));
        assert!(matches!(
            req.to_bytes(generic),
            Err(IfdError::IncorrectParameter(_))
        ));

        req.pin = Some(Zeroizing::new("1".repeat(255)));
        assert_eq!(req.to_bytes(generic).unwrap().len(), 3 + 255);
    }

    #[test]
    fn test_capabilities() {
        let caps = PaceCapabilities::from_response_data(&[0x01, 0xC0]).unwrap();
        assert!(caps.contains(PaceCapability::GenericPace));
        assert!(caps.contains(PaceCapability::DestroyChannel));
        assert!(!caps.contains(PaceCapability::GermanEid));
        assert_eq!(caps.protocols(), vec![PACE_PROTOCOL]);
        assert!(caps.supports_pin(PinId::Pin));

        let caps = PaceCapabilities::from_response_data(&[0x10]).unwrap();
        assert!(caps.supports_pin(PinId::Can));
        assert!(!caps.supports_pin(PinId::Puk));

        let caps = PaceCapabilities::from_response_data(&[0x80]).unwrap();
        assert!(caps.protocols().is_empty());

        assert!(PaceCapabilities::from_response_data(&[0x02, 0x40]).is_err());
    }

    #[test]
    fn test_execute_response() {
        let ok = ExecutePaceResponse::from_bytes(&[0, 0, 0, 0, 0x01, 0x00, 0x40]).unwrap();
        assert!(!ok.is_error());
        assert_eq!(ok.into_result().unwrap().as_ref(), &[0x40]);

        // MSE: Set AT failed with 63 C2
        let err = ExecutePaceResponse::from_bytes(&[0xC2, 0x63, 0x02, 0xF0, 0x00, 0x00]).unwrap();
        assert_eq!(
            err.error(),
            Some(PaceResultCode::MseSetAt(StatusWord::new(0x63, 0xC2)))
        );
        assert!(matches!(
            err.into_result(),
            Err(IfdError::AuthenticationFailed(_))
        ));

        let abort = ExecutePaceResponse::from_bytes(&[0x01, 0x00, 0x20, 0xF0, 0x00, 0x00]).unwrap();
        assert!(matches!(
            abort.into_result(),
            Err(IfdError::CancellationByUser(_))
        ));

        assert!(ExecutePaceResponse::from_bytes(&[0, 0, 0, 0, 0x05, 0x00, 0x01]).is_err());
    }

    #[test]
    fn test_establish_response() {
        let data = [
            0x00, 0x90, // MSE: Set AT status 90 00, little endian
            0x03, 0x00, 0x31, 0x01, 0x02, // EF.CardAccess
            0x02, 0xAA, 0xBB, // current CAR
            0x00, // no previous CAR
            0x01, 0x00, 0xCC, // IDICC
        ];
        let resp = EstablishPaceResponse::from_bytes(&data).unwrap();
        assert_eq!(resp.mse_status, StatusWord::new(0x90, 0x00));
        assert_eq!(resp.ef_card_access.as_ref(), &[0x31, 0x01, 0x02]);
        assert_eq!(resp.car_current.as_deref(), Some(&[0xAA, 0xBB][..]));
        assert!(resp.car_previous.is_none());
        assert_eq!(resp.id_icc.as_deref(), Some(&[0xCC][..]));
        assert_eq!(resp.retry_counter(), None);

        let data = [0xC2, 0x63, 0x00, 0x00, 0x00, 0x00];
        let resp = EstablishPaceResponse::from_bytes(&data).unwrap();
        assert_eq!(resp.retry_counter(), Some(2));
        assert!(resp.id_icc.is_none());

        assert!(EstablishPaceResponse::from_bytes(&[0x00, 0x90, 0x05, 0x00]).is_err());
    }
}
