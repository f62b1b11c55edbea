use std::result::Result;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::{DecodeError, Engine};
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serializer};

/// Base64URL without padding or line breaks. Browsers are not consistent about
/// padding their challenges and key handles, so decoding takes either form.
const URL_SAFE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub fn encode<T: AsRef<[u8]>>(bytes: T) -> String {
    URL_SAFE.encode(bytes)
}

pub fn decode<T: AsRef<[u8]>>(input: T) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE.decode(input)
}

pub(crate) fn to_base64<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsRef<[u8]>,
{
    serializer.serialize_str(&encode(bytes))
}

pub(crate) fn from_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(deserializer)?;
    decode(&string).map_err(|err| D::Error::custom(format!("invalid base64url: {}", err)))
}
