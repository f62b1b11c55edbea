//! The pieces of the host USB stack the bridge relies on. The embedding
//! application implements [`HostPlatform`] on top of whatever it has: libusb,
//! a platform USB manager, or a simulated device in tests.

use std::io;
use std::time::Duration;

use crate::permission::PermissionReply;

pub const USB_CLASS_PER_INTERFACE: u8 = 0x00;
pub const USB_CLASS_HID: u8 = 0x03;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UsbEndpoint {
    pub address: u8,
    pub direction: Direction,
    pub max_packet_size: u16,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UsbInterface {
    pub number: u8,
    pub class: u8,
    pub endpoints: Vec<UsbEndpoint>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UsbDevice {
    /// Host specific name, e.g. a bus/address pair or a device node path.
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub interfaces: Vec<UsbInterface>,
}

impl UsbDevice {
    /// Presence heuristic, not a protocol check.
    pub fn is_candidate(&self) -> bool {
        self.class == USB_CLASS_HID || self.class == USB_CLASS_PER_INTERFACE
    }
}

pub trait HostPlatform {
    type Connection: UsbConnection;

    fn enumerate_devices(&self) -> Vec<UsbDevice>;

    /// Asks for access to `device`. The decision may arrive on any thread, at
    /// any later time, through `reply`.
    fn request_permission(&self, device: &UsbDevice, reply: PermissionReply);

    /// `None` when the host refuses to open the device.
    fn open_device(&self, device: &UsbDevice) -> Option<Self::Connection>;
}

pub trait UsbConnection {
    /// Claims `interface`, detaching any kernel driver when `force` is set.
    fn claim_interface(&mut self, interface: &UsbInterface, force: bool) -> bool;

    fn release_interface(&mut self, interface: &UsbInterface) -> io::Result<()>;

    /// Raw HID report descriptor of `interface`.
    fn report_descriptor(&mut self, interface: &UsbInterface) -> io::Result<Vec<u8>>;

    /// Transfers `buffer` to or from `endpoint` depending on its direction,
    /// returning the number of bytes moved.
    fn bulk_transfer(
        &mut self,
        endpoint: &UsbEndpoint,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> io::Result<usize>;

    fn close(&mut self) -> io::Result<()>;
}
