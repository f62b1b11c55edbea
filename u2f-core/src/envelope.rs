//! JSON envelopes exchanged with the web-facing caller, in the format of the
//! U2F JavaScript API's `u2f_sign_request` / `u2f_register_request` messages.

use std::result::Result;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::app_id::AppId;
use crate::constants::U2F_V2;
use crate::key_handle::{KeyHandle, KeyHandleTooLong};
use crate::request::{AuthRequest, Operation};
use crate::response::Completion;
use crate::serde_base64::{from_base64, to_base64};

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported protocol version {version:?}, expected {}", U2F_V2)]
    UnsupportedVersion { version: String },

    #[error("Sign request has no registered keys")]
    NoRegisteredKeys,

    #[error("Register request has no register requests")]
    NoRegisterRequests,

    #[error(transparent)]
    KeyHandleTooLong(#[from] KeyHandleTooLong),

    #[error("Completion does not match the kind of request")]
    MismatchedCompletion,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum RequestEnvelope {
    #[serde(rename = "u2f_sign_request", rename_all = "camelCase")]
    Sign {
        app_id: AppId,
        #[serde(deserialize_with = "from_base64")]
        challenge: Vec<u8>,
        request_id: i64,
        registered_keys: Vec<RegisteredKey>,
    },
    #[serde(rename = "u2f_register_request", rename_all = "camelCase")]
    Register {
        app_id: AppId,
        request_id: i64,
        register_requests: Vec<RegisterRequest>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisteredKey {
    version: String,
    #[serde(deserialize_with = "from_base64")]
    key_handle: Vec<u8>,
}

#[derive(Deserialize)]
struct RegisterRequest {
    version: String,
    #[serde(deserialize_with = "from_base64")]
    challenge: Vec<u8>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ResponseEnvelope<'a> {
    #[serde(rename = "u2f_sign_response", rename_all = "camelCase")]
    Sign {
        request_id: i64,
        response_data: SignResponseData<'a>,
    },
    #[serde(rename = "u2f_register_response", rename_all = "camelCase")]
    Register {
        request_id: i64,
        response_data: RegisterResponseData<'a>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignResponseData<'a> {
    key_handle: &'a KeyHandle,
    #[serde(serialize_with = "to_base64")]
    signature_data: &'a [u8],
    #[serde(serialize_with = "to_base64")]
    client_data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponseData<'a> {
    #[serde(serialize_with = "to_base64")]
    registration_data: &'a [u8],
    version: &'static str,
    #[serde(serialize_with = "to_base64")]
    client_data: String,
}

fn check_version(version: String) -> Result<(), EnvelopeError> {
    if version == U2F_V2 {
        Ok(())
    } else {
        Err(EnvelopeError::UnsupportedVersion { version })
    }
}

/// Parse an inbound `u2f_sign_request` or `u2f_register_request` envelope.
pub fn parse_request(json: &str) -> Result<AuthRequest, EnvelopeError> {
    let request = match serde_json::from_str(json)? {
        RequestEnvelope::Sign {
            app_id,
            challenge,
            request_id,
            registered_keys,
        } => {
            debug!(request_id, keys = registered_keys.len(), "Parsing sign request");
            if registered_keys.is_empty() {
                return Err(EnvelopeError::NoRegisteredKeys);
            }
            let mut key_handles = Vec::with_capacity(registered_keys.len());
            for registered_key in registered_keys {
                check_version(registered_key.version)?;
                key_handles.push(KeyHandle::from_bytes(&registered_key.key_handle)?);
            }
            AuthRequest::new(
                app_id,
                challenge,
                request_id,
                Operation::Sign { key_handles },
            )
        }
        RequestEnvelope::Register {
            app_id,
            request_id,
            register_requests,
        } => {
            debug!(
                request_id,
                register_requests = register_requests.len(),
                "Parsing register request"
            );
            // Several register requests are tolerated, but only the last one is used
            let mut challenge = None;
            for register_request in register_requests {
                check_version(register_request.version)?;
                challenge = Some(register_request.challenge);
            }
            let challenge = challenge.ok_or(EnvelopeError::NoRegisterRequests)?;
            AuthRequest::new(app_id, challenge, request_id, Operation::Register)
        }
    };
    Ok(request)
}

/// Frame a completed flow into the response envelope for `request`.
pub fn encode_response(
    request: &AuthRequest,
    completion: &Completion,
) -> Result<String, EnvelopeError> {
    let client_data = request.client_data().to_json();
    let envelope = match (request.operation(), completion) {
        (
            Operation::Sign { .. },
            Completion::Signed {
                key_handle,
                signature_data,
            },
        ) => ResponseEnvelope::Sign {
            request_id: request.request_id(),
            response_data: SignResponseData {
                key_handle,
                signature_data,
                client_data,
            },
        },
        (Operation::Register, Completion::Registered { registration_data }) => {
            ResponseEnvelope::Register {
                request_id: request.request_id(),
                response_data: RegisterResponseData {
                    registration_data,
                    version: U2F_V2,
                    client_data,
                },
            }
        }
        _ => return Err(EnvelopeError::MismatchedCompletion),
    };
    Ok(serde_json::to_string(&envelope)?)
}
