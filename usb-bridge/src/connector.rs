use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::config::BridgeConfig;
use crate::hid_descriptor::{self, HidUsage};
use crate::host::{Direction, HostPlatform, UsbConnection, UsbDevice, UsbEndpoint, UsbInterface};
use crate::permission::{PermissionReply, PermissionSlot};
use crate::transport::DeviceSession;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("No USB device found")]
    DeviceNotFound,

    #[error("Permission to access {device} denied")]
    PermissionDenied { device: String },

    #[error("Host refused to open {device}")]
    OpenFailed { device: String },

    #[error("Could not claim interface {interface}")]
    ClaimFailed { interface: u8 },

    #[error("No interface of {device} can carry U2F messages")]
    NoUsableInterface { device: String },
}

/// Finds a security key, obtains access to it and opens a [`DeviceSession`].
pub struct Connector<H: HostPlatform> {
    host: H,
    config: BridgeConfig,
    permission: Arc<PermissionSlot>,
    cancel: CancelToken,
}

impl<H: HostPlatform> Connector<H> {
    pub fn new(host: H, config: BridgeConfig, cancel: CancelToken) -> Connector<H> {
        Connector {
            host,
            config,
            permission: Arc::new(PermissionSlot::new()),
            cancel,
        }
    }

    pub fn is_device_present(&self) -> bool {
        self.find_device().is_some()
    }

    fn find_device(&self) -> Option<UsbDevice> {
        self.host
            .enumerate_devices()
            .into_iter()
            .find(UsbDevice::is_candidate)
    }

    /// Runs `callback` with the opened session or the reason none could be
    /// opened. If the session was cancelled by the time the host answers the
    /// permission request, returns without running `callback`.
    pub fn connect<F>(&self, callback: F)
    where
        F: FnOnce(Result<DeviceSession<H::Connection>, ConnectError>),
    {
        let device = match self.find_device() {
            Some(device) => device,
            None => return callback(Err(ConnectError::DeviceNotFound)),
        };

        self.permission.clear();
        debug!(device = %device.name, "Requesting permission for USB device");
        self.host
            .request_permission(&device, PermissionReply::new(self.permission.clone()));
        let granted = self.permission.take();

        if self.cancel.is_cancelled() {
            info!(granted, "Stopped while waiting for permission, dropping decision");
            return;
        }

        if granted {
            debug!(device = %device.name, "Received permission");
            callback(self.open(&device))
        } else {
            info!(device = %device.name, "Did not receive permission");
            callback(Err(ConnectError::PermissionDenied {
                device: device.name,
            }))
        }
    }

    fn open(&self, device: &UsbDevice) -> Result<DeviceSession<H::Connection>, ConnectError> {
        debug!(
            device = %device.name,
            vendor_id = %format!("{:04x}", device.vendor_id),
            product_id = %format!("{:04x}", device.product_id),
            "Opening transport, going through interfaces"
        );
        for interface in &device.interfaces {
            let (in_endpoint, out_endpoint) = match endpoints(interface) {
                Some(endpoints) => endpoints,
                None => {
                    debug!(interface = interface.number, "Interface lacks an IN/OUT pair");
                    continue;
                }
            };

            let mut connection =
                self.host
                    .open_device(device)
                    .ok_or_else(|| ConnectError::OpenFailed {
                        device: device.name.clone(),
                    })?;
            if !connection.claim_interface(interface, true) {
                error!(interface = interface.number, "Could not claim interface");
                if let Err(err) = connection.close() {
                    warn!(error = %err, "Failed to close connection");
                }
                return Err(ConnectError::ClaimFailed {
                    interface: interface.number,
                });
            }

            let usage = match connection.report_descriptor(interface) {
                Ok(descriptor) => hid_descriptor::classify(&descriptor),
                Err(err) => {
                    warn!(
                        interface = interface.number,
                        error = %err,
                        "Could not read report descriptor"
                    );
                    HidUsage::default()
                }
            };
            debug!(
                interface = interface.number,
                usage_page = ?usage.usage_page,
                usage = ?usage.usage,
                fido = usage.is_fido(),
                "Classified interface"
            );

            if self.config.enforce_fido_usage && !usage.is_fido() {
                debug!(interface = interface.number, "Not a FIDO interface");
                if let Err(err) = connection.release_interface(interface) {
                    warn!(error = %err, "Failed to release interface");
                }
                if let Err(err) = connection.close() {
                    warn!(error = %err, "Failed to close connection");
                }
                continue;
            }

            info!(device = %device.name, interface = interface.number, "Opened device session");
            return Ok(DeviceSession::new(
                connection,
                interface.clone(),
                in_endpoint,
                out_endpoint,
                self.config.exchange_timeout(),
                self.config.framing,
            ));
        }

        Err(ConnectError::NoUsableInterface {
            device: device.name.clone(),
        })
    }
}

/// The interface's IN and OUT endpoints; when there are several of a
/// direction the last one listed is used.
fn endpoints(interface: &UsbInterface) -> Option<(UsbEndpoint, UsbEndpoint)> {
    let last = |direction: Direction| {
        interface
            .endpoints
            .iter()
            .rev()
            .find(|endpoint| endpoint.direction == direction)
            .cloned()
    };
    Some((last(Direction::In)?, last(Direction::Out)?))
}
