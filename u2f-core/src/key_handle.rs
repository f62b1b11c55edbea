use std::fmt::{self, Debug};
use std::result::Result;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::constants::MAX_KEY_HANDLE_LEN;
use crate::serde_base64::{encode, to_base64};

/// Opaque token-issued identifier of one registered credential.
#[derive(Clone, Eq, PartialEq)]
pub struct KeyHandle(Vec<u8>);

#[derive(Debug, Error)]
#[error("Key handle is {len} bytes, longer than the maximum of {}", MAX_KEY_HANDLE_LEN)]
pub struct KeyHandleTooLong {
    pub len: usize,
}

impl KeyHandle {
    pub fn from_bytes(bytes: &[u8]) -> Result<KeyHandle, KeyHandleTooLong> {
        if bytes.len() > MAX_KEY_HANDLE_LEN {
            return Err(KeyHandleTooLong { len: bytes.len() });
        }
        Ok(KeyHandle(bytes.to_vec()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_base64(&self) -> String {
        encode(&self.0)
    }
}

impl AsRef<[u8]> for KeyHandle {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KeyHandle({} bytes)", self.0.len())
    }
}

impl Serialize for KeyHandle {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        to_base64(&self.0, serializer)
    }
}
