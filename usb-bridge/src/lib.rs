//! Bridges a U2F request envelope to a security key attached over USB HID.
//!
//! The embedding application supplies a [`HostPlatform`] and hands each
//! request to a [`BridgeSession`]. The session waits for a device, asks the
//! host for access, opens the key's HID interface and drives the sign or
//! register exchange until the user touches the key, the key refuses, or the
//! session is cancelled.

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
extern crate byteorder;
extern crate hex;
extern crate rand;
extern crate serde;
extern crate serde_derive;
extern crate serde_json;
extern crate u2f_core;

mod cancel;
mod config;
mod connector;
mod error;
#[cfg(test)]
mod fake;
pub mod framing;
pub mod hid_descriptor;
mod host;
mod permission;
mod runner;
mod session;
mod transport;

pub use crate::cancel::CancelToken;
pub use crate::config::{BridgeConfig, Framing};
pub use crate::connector::{ConnectError, Connector};
pub use crate::error::{FlowError, SessionError};
pub use crate::hid_descriptor::HidUsage;
pub use crate::host::{
    Direction, HostPlatform, UsbConnection, UsbDevice, UsbEndpoint, UsbInterface,
    USB_CLASS_HID, USB_CLASS_PER_INTERFACE,
};
pub use crate::permission::{PermissionReply, PermissionSlot};
pub use crate::runner::{AuthRunner, RunnerState};
pub use crate::session::{BridgeSession, SessionHandle};
pub use crate::transport::{DeviceSession, TransportError};
