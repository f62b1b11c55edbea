//! Client side of the FIDO U2F protocol: the JSON envelopes a relying party
//! sends, the client data derived from them, and the raw APDU commands and
//! responses exchanged with a security key.
//!
//! See https://fidoalliance.org/specs/fido-u2f-v1.2-ps-20170411/fido-u2f-raw-message-formats-v1.2-ps-20170411.html
//! See https://fidoalliance.org/specs/fido-u2f-v1.2-ps-20170411/fido-u2f-javascript-api-v1.2-ps-20170411.html

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
extern crate base64;
extern crate byteorder;
#[cfg(test)]
extern crate hex;
extern crate ring;
extern crate serde;
extern crate serde_derive;
extern crate serde_json;

use ring::digest;

pub use crate::apdu::{AuthenticateControlCode, Command, CommandDecodeError};
pub use crate::app_id::AppId;
pub use crate::client_data::{ClientData, ClientDataType};
pub use crate::constants::{MAX_KEY_HANDLE_LEN, PARAMETER_LEN, U2F_V2};
pub use crate::envelope::{encode_response, parse_request, EnvelopeError};
pub use crate::key_handle::{KeyHandle, KeyHandleTooLong};
pub use crate::request::{AuthRequest, Operation};
pub use crate::response::{Completion, ExchangeResult, StatusWord};

pub mod base64url {
    pub use crate::serde_base64::{decode, encode};
}

mod apdu;
mod app_id;
mod client_data;
mod constants;
mod envelope;
mod key_handle;
mod request;
mod response;
mod serde_base64;

pub(crate) fn sha256(data: &[u8]) -> [u8; PARAMETER_LEN] {
    let mut hash = [0u8; PARAMETER_LEN];
    hash.copy_from_slice(digest::digest(&digest::SHA256, data).as_ref());
    hash
}
