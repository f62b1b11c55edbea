use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::constants::PARAMETER_LEN;
use crate::sha256;

/// Application id (facet) of the relying party, e.g. `https://example.com`.
/// Doubles as the client data origin.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    pub fn new<S: Into<String>>(app_id: S) -> AppId {
        AppId(app_id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The application parameter [32 bytes]: SHA-256 of the UTF-8 application id.
    pub fn application_parameter(&self) -> [u8; PARAMETER_LEN] {
        sha256(self.0.as_bytes())
    }
}

impl AsRef<str> for AppId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}
