use std::io;
use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::{debug, trace, warn};
use u2f_usb_bridge::{
    Direction, HostPlatform, PermissionReply, UsbConnection, UsbDevice, UsbEndpoint, UsbInterface,
};

const LIBUSB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const LIBUSB_DT_REPORT: u16 = 0x22;
// https://github.com/torvalds/linux/blob/master/include/uapi/linux/hid.h
const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// Only consider devices with this vendor and product id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceFilter {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceFilter {
    /// Parses `vvvv:pppp`, both parts in hex.
    pub fn parse(value: &str) -> Result<DeviceFilter, String> {
        let mut parts = value.splitn(2, ':');
        let vendor_id = parts.next().unwrap_or_default();
        let product_id = parts
            .next()
            .ok_or_else(|| format!("expected vendor:product, got {:?}", value))?;
        let parse = |part: &str| {
            u16::from_str_radix(part, 16).map_err(|err| format!("invalid id {:?}: {}", part, err))
        };
        Ok(DeviceFilter {
            vendor_id: parse(vendor_id)?,
            product_id: parse(product_id)?,
        })
    }

    fn matches(&self, device: &UsbDevice) -> bool {
        device.vendor_id == self.vendor_id && device.product_id == self.product_id
    }
}

/// Host platform backed by libusb. Access is governed by device node
/// permissions, so permission requests are answered immediately.
pub struct RusbHost {
    context: Context,
    filter: Option<DeviceFilter>,
}

impl RusbHost {
    pub fn new(filter: Option<DeviceFilter>) -> rusb::Result<RusbHost> {
        Ok(RusbHost {
            context: Context::new()?,
            filter,
        })
    }

    fn find(&self, device: &UsbDevice) -> rusb::Result<Option<Device<Context>>> {
        Ok(self
            .context
            .devices()?
            .iter()
            .find(|candidate| device_name(candidate) == device.name))
    }
}

impl HostPlatform for RusbHost {
    type Connection = RusbConnection;

    fn enumerate_devices(&self) -> Vec<UsbDevice> {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(err) => {
                warn!(error = %err, "Failed to enumerate USB devices");
                return Vec::new();
            }
        };
        devices
            .iter()
            .filter_map(|device| match describe(&device) {
                Ok(device) => Some(device),
                Err(err) => {
                    trace!(device = %device_name(&device), error = %err, "Skipping device");
                    None
                }
            })
            .filter(|device| self.filter.map_or(true, |filter| filter.matches(device)))
            .collect()
    }

    fn request_permission(&self, device: &UsbDevice, reply: PermissionReply) {
        trace!(device = %device.name, "Granting permission");
        reply.deliver(true);
    }

    fn open_device(&self, device: &UsbDevice) -> Option<RusbConnection> {
        let result = self
            .find(device)
            .and_then(|found| found.ok_or(rusb::Error::NoDevice))
            .and_then(|found| found.open());
        match result {
            Ok(handle) => Some(RusbConnection {
                handle: Some(handle),
                detached: Vec::new(),
            }),
            Err(err) => {
                warn!(device = %device.name, error = %err, "Failed to open USB device");
                None
            }
        }
    }
}

fn device_name<T: UsbContext>(device: &Device<T>) -> String {
    format!("{:03}:{:03}", device.bus_number(), device.address())
}

fn describe<T: UsbContext>(device: &Device<T>) -> rusb::Result<UsbDevice> {
    let descriptor = device.device_descriptor()?;
    let config = device.active_config_descriptor()?;
    let interfaces = config
        .interfaces()
        .filter_map(|interface| interface.descriptors().next())
        .map(|interface| UsbInterface {
            number: interface.interface_number(),
            class: interface.class_code(),
            endpoints: interface
                .endpoint_descriptors()
                .map(|endpoint| UsbEndpoint {
                    address: endpoint.address(),
                    direction: match endpoint.direction() {
                        rusb::Direction::In => Direction::In,
                        rusb::Direction::Out => Direction::Out,
                    },
                    max_packet_size: endpoint.max_packet_size(),
                })
                .collect(),
        })
        .collect();
    Ok(UsbDevice {
        name: device_name(device),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        class: descriptor.class_code(),
        interfaces,
    })
}

pub struct RusbConnection {
    handle: Option<DeviceHandle<Context>>,
    /// Interfaces whose kernel driver was detached on claim.
    detached: Vec<u8>,
}

impl RusbConnection {
    fn handle(&mut self) -> io::Result<&mut DeviceHandle<Context>> {
        self.handle
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }
}

impl UsbConnection for RusbConnection {
    fn claim_interface(&mut self, interface: &UsbInterface, force: bool) -> bool {
        let number = interface.number;
        let handle = match self.handle.as_mut() {
            Some(handle) => handle,
            None => return false,
        };

        if force && handle.kernel_driver_active(number).unwrap_or(false) {
            match handle.detach_kernel_driver(number) {
                Ok(()) => {
                    debug!(interface = number, "Detached kernel driver");
                    self.detached.push(number);
                }
                Err(err) => {
                    warn!(interface = number, error = %err, "Failed to detach kernel driver");
                    return false;
                }
            }
        }

        match handle.claim_interface(number) {
            Ok(()) => true,
            Err(err) => {
                warn!(interface = number, error = %err, "Failed to claim interface");
                false
            }
        }
    }

    fn release_interface(&mut self, interface: &UsbInterface) -> io::Result<()> {
        let number = interface.number;
        let handle = self.handle()?;
        handle.release_interface(number).map_err(to_io_error)?;
        if let Some(index) = self.detached.iter().position(|n| *n == number) {
            self.detached.remove(index);
            let handle = self.handle()?;
            handle.attach_kernel_driver(number).map_err(to_io_error)?;
        }
        Ok(())
    }

    fn report_descriptor(&mut self, interface: &UsbInterface) -> io::Result<Vec<u8>> {
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Standard,
            rusb::Recipient::Interface,
        );
        let mut descriptor = vec![0u8; HID_MAX_DESCRIPTOR_SIZE];
        let len = self
            .handle()?
            .read_control(
                request_type,
                LIBUSB_REQUEST_GET_DESCRIPTOR,
                LIBUSB_DT_REPORT << 8,
                u16::from(interface.number),
                &mut descriptor,
                CONTROL_TIMEOUT,
            )
            .map_err(to_io_error)?;
        descriptor.truncate(len);
        Ok(descriptor)
    }

    fn bulk_transfer(
        &mut self,
        endpoint: &UsbEndpoint,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> io::Result<usize> {
        let handle = self.handle()?;
        // HID keys expose interrupt endpoints
        match endpoint.direction {
            Direction::In => handle.read_interrupt(endpoint.address, buffer, timeout),
            Direction::Out => handle.write_interrupt(endpoint.address, buffer, timeout),
        }
        .map_err(to_io_error)
    }

    fn close(&mut self) -> io::Result<()> {
        // libusb closes the handle when it is dropped
        self.handle.take();
        Ok(())
    }
}

fn to_io_error(err: rusb::Error) -> io::Error {
    let kind = match err {
        rusb::Error::Timeout => io::ErrorKind::TimedOut,
        rusb::Error::NoDevice => io::ErrorKind::NotConnected,
        rusb::Error::Access => io::ErrorKind::PermissionDenied,
        rusb::Error::NotFound => io::ErrorKind::NotFound,
        rusb::Error::Interrupted => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}
