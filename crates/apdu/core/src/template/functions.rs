//! Built-in template functions

use iso7816_tlv::ber::{Tag, Tlv, Value};

use super::{TemplateArg, TemplateError};

/// Name the BER-TLV function is registered under
pub const TLV: &str = "tlv";

/// `{tlv TAG VALUE}`: BER-TLV encoding of VALUE under TAG, definite length
pub fn tlv(args: &[TemplateArg]) -> Result<String, TemplateError> {
    let [tag, value] = args else {
        return Err(TemplateError::function(
            TLV,
            format!("expected tag and value, got {} parameters", args.len()),
        ));
    };
    let tag = tag.to_bytes()?;
    let value = value.to_bytes()?;

    if tag.is_empty() || tag.len() > 3 {
        return Err(TemplateError::function(TLV, "tag must be one to three bytes"));
    }
    let tag = Tag::try_from(tag.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
        .map_err(|e| TemplateError::function(TLV, format!("invalid tag: {e}")))?;

    let value = if tag.is_constructed() {
        let children = Tlv::parse_all(&value);
        let reencoded: usize = children.iter().map(|t| t.to_vec().len()).sum();
        if reencoded != value.len() {
            return Err(TemplateError::function(
                TLV,
                "value of a constructed tag is not a TLV sequence",
            ));
        }
        Value::Constructed(children)
    } else {
        Value::Primitive(value)
    };

    let encoded = Tlv::new(tag, value)
        .map_err(|e| TemplateError::function(TLV, e.to_string()))?
        .to_vec();

    Ok(hex::encode_upper(encoded))
}
