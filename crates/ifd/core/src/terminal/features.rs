//! PC/SC Part 10 reader features

use std::collections::BTreeMap;

use tracing::trace;

/// `FEATURE_VERIFY_PIN_START`
pub const VERIFY_PIN_START: u8 = 0x01;
/// `FEATURE_VERIFY_PIN_FINISH`
pub const VERIFY_PIN_FINISH: u8 = 0x02;
/// `FEATURE_MODIFY_PIN_START`
pub const MODIFY_PIN_START: u8 = 0x03;
/// `FEATURE_MODIFY_PIN_FINISH`
pub const MODIFY_PIN_FINISH: u8 = 0x04;
/// `FEATURE_GET_KEY_PRESSED`
pub const GET_KEY_PRESSED: u8 = 0x05;
/// `FEATURE_VERIFY_PIN_DIRECT`
pub const VERIFY_PIN_DIRECT: u8 = 0x06;
/// `FEATURE_MODIFY_PIN_DIRECT`
pub const MODIFY_PIN_DIRECT: u8 = 0x07;
/// `FEATURE_IFD_PIN_PROPERTIES`
pub const IFD_PIN_PROPERTIES: u8 = 0x0A;
/// `FEATURE_IFD_DISPLAY_PROPERTIES`
pub const IFD_DISPLAY_PROPERTIES: u8 = 0x11;
/// `FEATURE_GET_TLV_PROPERTIES`
pub const GET_TLV_PROPERTIES: u8 = 0x12;
/// `FEATURE_EXECUTE_PACE`
pub const EXECUTE_PACE: u8 = 0x20;

/// Control code of `CM_IOCTL_GET_FEATURE_REQUEST`, `SCARD_CTL_CODE(3400)`
pub const fn feature_request_ctl_code() -> u32 {
    if cfg!(windows) {
        (0x31 << 16) | (3400 << 2)
    } else {
        0x4200_0000 + 3400
    }
}

/// Feature tag to control code
pub type FeatureMap = BTreeMap<u8, u32>;

/// Parse the TLV list answered to a feature request. Entries whose value
/// is not a 4 byte control code are skipped.
pub fn parse_feature_map(data: &[u8]) -> FeatureMap {
    let mut features = FeatureMap::new();
    let mut rest = data;
    while let [tag, len, tail @ ..] = rest {
        let len = *len as usize;
        let Some(value) = tail.get(..len) else {
            trace!(tag = format_args!("{tag:#04x}"), "truncated feature entry");
            break;
        };
        if let Ok(code) = <[u8; 4]>::try_from(value) {
            features.insert(*tag, u32::from_be_bytes(code));
        }
        rest = &tail[len..];
    }
    features
}
