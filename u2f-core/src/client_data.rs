use serde_derive::Serialize;

use crate::app_id::AppId;
use crate::constants::{CID_UNAVAILABLE, PARAMETER_LEN};
use crate::serde_base64::to_base64;
use crate::sha256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum ClientDataType {
    #[serde(rename = "navigator.id.finishEnrollment")]
    FinishEnrollment,
    #[serde(rename = "navigator.id.getAssertion")]
    GetAssertion,
}

/// Client data describing the signing context. Never stored, the canonical
/// JSON string is rebuilt whenever it is needed so the hash sent to the token
/// and the copy echoed back to the relying party always agree.
#[derive(Clone, Debug, Serialize)]
pub struct ClientData<'a> {
    typ: ClientDataType,
    #[serde(serialize_with = "to_base64")]
    challenge: &'a [u8],
    origin: &'a AppId,
    cid_pubkey: &'static str,
}

impl<'a> ClientData<'a> {
    pub fn new(typ: ClientDataType, challenge: &'a [u8], origin: &'a AppId) -> ClientData<'a> {
        ClientData {
            typ,
            challenge,
            origin,
            cid_pubkey: CID_UNAVAILABLE,
        }
    }

    pub fn typ(&self) -> ClientDataType {
        self.typ
    }

    /// Canonical string form: `{"typ":..,"challenge":..,"origin":..,"cid_pubkey":"unavailable"}`
    pub fn to_json(&self) -> String {
        // Only strings and a byte slice encoded as a string, cannot fail
        serde_json::to_string(self).expect("client data is always representable as JSON")
    }

    /// The challenge parameter [32 bytes] of register and authenticate commands.
    pub fn hash(&self) -> [u8; PARAMETER_LEN] {
        sha256(self.to_json().as_bytes())
    }
}
