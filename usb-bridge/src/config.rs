use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

/// How APDUs travel over the claimed interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// U2FHID messages split over 64 byte reports, channel set up by INIT.
    U2fHid,
    /// One transfer out carrying the APDU, one transfer in carrying the response.
    Raw,
}

impl Default for Framing {
    fn default() -> Self {
        Framing::U2fHid
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub presence_poll_interval_ms: u64,
    pub sign_retry_interval_ms: u64,
    pub register_retry_interval_ms: u64,
    pub exchange_timeout_ms: u64,
    /// Only accept interfaces whose report descriptor declares the FIDO usage page.
    pub enforce_fido_usage: bool,
    pub framing: Framing,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            presence_poll_interval_ms: 300,
            sign_retry_interval_ms: 300,
            register_retry_interval_ms: 200,
            exchange_timeout_ms: 20_000,
            enforce_fido_usage: false,
            framing: Framing::default(),
        }
    }
}

impl BridgeConfig {
    pub fn presence_poll_interval(&self) -> Duration {
        Duration::from_millis(self.presence_poll_interval_ms)
    }

    pub fn sign_retry_interval(&self) -> Duration {
        Duration::from_millis(self.sign_retry_interval_ms)
    }

    pub fn register_retry_interval(&self) -> Duration {
        Duration::from_millis(self.register_retry_interval_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn load(path: &Path) -> io::Result<Option<BridgeConfig>> {
        match File::open(path) {
            Ok(file) => serde_json::from_reader(file)
                .map_err(|e| e.into())
                .map(Some),
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}
