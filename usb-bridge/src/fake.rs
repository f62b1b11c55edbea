//! Simulated host platform and security key for exercising the bridge
//! without hardware.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};
use u2f_core::Command;

use crate::cancel::CancelToken;
use crate::config::Framing;
use crate::framing::{
    encode_message, ChannelId, CommandType, InitResponse, MessageAssembler, Packet,
    BROADCAST_CHANNEL_ID,
};
use crate::host::{
    Direction, HostPlatform, UsbConnection, UsbDevice, UsbEndpoint, UsbInterface, USB_CLASS_HID,
};
use crate::permission::PermissionReply;

/// Channel handed out by the first INIT, later ones count up from here.
pub const FIRST_CHANNEL_ID: u32 = 0x0000_2a2a;
const OTHER_CHANNEL_ID: ChannelId = ChannelId(0x0bad_0bad);

pub const FIDO_REPORT_DESCRIPTOR: &[u8] = &[0x06, 0xd0, 0xf1, 0x09, 0x01, 0xa1, 0x01, 0xc0];
pub const KEYBOARD_REPORT_DESCRIPTOR: &[u8] = &[0x05, 0x01, 0x09, 0x06, 0xa1, 0x01, 0xc0];

/// What the token answers to the next APDU.
#[derive(Clone, Debug)]
pub enum Reply {
    Status { payload: Vec<u8>, status: u16 },
    /// The transfer carrying the APDU fails.
    TransportFailure,
    /// U2FHID_ERROR with the given code.
    DeviceError(u8),
    /// The read for this APDU times out and the answer arrives afterwards.
    Late { payload: Vec<u8>, status: u16 },
    /// No answer ever comes, only traffic for another channel.
    Ignored,
}

impl Reply {
    pub fn success(payload: &[u8]) -> Reply {
        Reply::Status {
            payload: payload.to_vec(),
            status: 0x9000,
        }
    }

    pub fn busy() -> Reply {
        Reply::status(0x6985)
    }

    pub fn status(status: u16) -> Reply {
        Reply::Status {
            payload: vec![],
            status,
        }
    }

    pub fn late(payload: &[u8]) -> Reply {
        Reply::Late {
            payload: payload.to_vec(),
            status: 0x9000,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum PermissionBehavior {
    Grant,
    Deny,
    /// Decision delivered from another thread after a delay.
    GrantLater(Duration),
    /// Cancels the session before granting.
    CancelThenGrant,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub presence_polls: usize,
    pub inits: usize,
    pub permission_requests: usize,
    pub opens: usize,
    pub claims: usize,
    pub releases: usize,
    pub closes: usize,
}

#[derive(Debug)]
struct TokenState {
    framing: Framing,
    replies: VecDeque<Reply>,
    apdus: Vec<Vec<u8>>,
    pending_reads: VecDeque<Vec<u8>>,
    /// Reports that become readable once the next read has timed out.
    late_reads: Vec<Vec<u8>>,
    chatter: bool,
    channel_id: ChannelId,
    incoming: Option<MessageAssembler>,
    counters: Counters,
    cancel_after_apdus: Option<(usize, CancelToken)>,
}

/// Handle to inspect the simulated token after the fact.
#[derive(Clone, Debug)]
pub struct FakeToken(Arc<Mutex<TokenState>>);

impl FakeToken {
    pub fn new(framing: Framing, replies: Vec<Reply>) -> FakeToken {
        FakeToken(Arc::new(Mutex::new(TokenState {
            framing,
            replies: replies.into(),
            apdus: Vec::new(),
            pending_reads: VecDeque::new(),
            late_reads: Vec::new(),
            chatter: false,
            channel_id: BROADCAST_CHANNEL_ID,
            incoming: None,
            counters: Counters::default(),
            cancel_after_apdus: None,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.0.lock().unwrap()
    }

    pub fn cancel_after_apdus(&self, count: usize, token: CancelToken) {
        self.lock().cancel_after_apdus = Some((count, token));
    }

    pub fn apdus(&self) -> Vec<Vec<u8>> {
        self.lock().apdus.clone()
    }

    /// Every command received so far, decoded.
    pub fn commands(&self) -> Vec<Command> {
        self.lock()
            .apdus
            .iter()
            .map(|apdu| Command::decode(apdu).unwrap())
            .collect()
    }

    pub fn counters<T>(&self, f: impl FnOnce(&Counters) -> T) -> T {
        f(&self.lock().counters)
    }
}

impl TokenState {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        match self.framing {
            Framing::Raw => {
                let reply = self.handle_apdu(buffer.to_vec());
                match reply {
                    Reply::Status { payload, status } => {
                        self.pending_reads.push_back(with_status(payload, status))
                    }
                    Reply::TransportFailure => return Err(timed_out()),
                    Reply::Late { payload, status } => {
                        self.late_reads.push(with_status(payload, status))
                    }
                    Reply::Ignored => {}
                    Reply::DeviceError(_) => panic!("raw framing has no device errors"),
                }
            }
            Framing::U2fHid => {
                let packet = Packet::from_bytes(buffer).map_err(|err| {
                    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
                })?;
                let channel_id = packet.channel_id();
                let assembler = self
                    .incoming
                    .get_or_insert_with(|| MessageAssembler::new(channel_id));
                let message = match assembler.push(packet) {
                    Ok(Some(message)) => message,
                    Ok(None) => return Ok(buffer.len()),
                    Err(err) => {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
                    }
                };
                self.incoming = None;
                match message.command {
                    CommandType::Init => {
                        assert_eq!(channel_id, BROADCAST_CHANNEL_ID);
                        let mut nonce = [0u8; 8];
                        nonce.copy_from_slice(&message.data[..8]);
                        self.channel_id = ChannelId(FIRST_CHANNEL_ID + self.counters.inits as u32);
                        self.counters.inits += 1;
                        // A response for someone else's INIT first
                        let mut stale = InitResponse {
                            nonce: [0xee; 8],
                            channel_id: OTHER_CHANNEL_ID,
                            protocol_version: 2,
                            major_device_version: 1,
                            minor_device_version: 0,
                            build_device_version: 0,
                            capabilities: 0,
                        };
                        self.queue(BROADCAST_CHANNEL_ID, CommandType::Init, &stale.to_bytes());
                        stale.nonce = nonce;
                        stale.channel_id = self.channel_id;
                        self.queue(BROADCAST_CHANNEL_ID, CommandType::Init, &stale.to_bytes());
                    }
                    CommandType::Msg => {
                        assert_eq!(channel_id, self.channel_id);
                        match self.handle_apdu(message.data) {
                            Reply::Status { payload, status } => self.queue(
                                channel_id,
                                CommandType::Msg,
                                &with_status(payload, status),
                            ),
                            Reply::TransportFailure => return Err(timed_out()),
                            Reply::DeviceError(code) => {
                                self.queue(channel_id, CommandType::Error, &[code])
                            }
                            Reply::Late { payload, status } => {
                                let packets = encode_message(
                                    channel_id,
                                    CommandType::Msg,
                                    &with_status(payload, status),
                                )
                                .unwrap();
                                self.late_reads
                                    .extend(packets.iter().map(|packet| packet.to_bytes()));
                            }
                            Reply::Ignored => self.chatter = true,
                        }
                    }
                    other => panic!("unexpected command {:?}", other),
                }
            }
        }
        Ok(buffer.len())
    }

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        if self.pending_reads.is_empty() {
            if !self.late_reads.is_empty() {
                self.pending_reads.extend(self.late_reads.drain(..));
                return Err(timed_out());
            }
            if self.chatter {
                thread::sleep(Duration::from_millis(5));
                let keep_alive = Packet::Initialization {
                    channel_id: OTHER_CHANNEL_ID,
                    command: CommandType::KeepAlive,
                    payload_len: 1,
                    data: vec![1],
                };
                self.pending_reads.push_back(keep_alive.to_bytes());
            }
        }
        let report = self.pending_reads.pop_front().ok_or_else(timed_out)?;
        let len = report.len().min(buffer.len());
        buffer[..len].copy_from_slice(&report[..len]);
        Ok(len)
    }

    fn handle_apdu(&mut self, apdu: Vec<u8>) -> Reply {
        self.apdus.push(apdu);
        if let Some((count, ref token)) = self.cancel_after_apdus {
            if self.apdus.len() >= count {
                token.cancel();
            }
        }
        self.replies
            .pop_front()
            .unwrap_or_else(|| Reply::status(0x6f00))
    }

    fn queue(&mut self, channel_id: ChannelId, command: CommandType, data: &[u8]) {
        for packet in encode_message(channel_id, command, data).unwrap() {
            self.pending_reads.push_back(packet.to_bytes());
        }
    }
}

fn with_status(mut payload: Vec<u8>, status: u16) -> Vec<u8> {
    payload.write_u16::<BigEndian>(status).unwrap();
    payload
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "transfer timed out")
}

pub fn fido_interface(number: u8) -> UsbInterface {
    UsbInterface {
        number,
        class: USB_CLASS_HID,
        endpoints: vec![
            UsbEndpoint {
                address: 0x81 + number,
                direction: Direction::In,
                max_packet_size: 64,
            },
            UsbEndpoint {
                address: 0x01 + number,
                direction: Direction::Out,
                max_packet_size: 64,
            },
        ],
    }
}

pub fn fido_device() -> UsbDevice {
    UsbDevice {
        name: "fake-token".to_string(),
        vendor_id: 0x1050,
        product_id: 0x0120,
        class: 0,
        interfaces: vec![fido_interface(0)],
    }
}

#[derive(Clone, Debug)]
pub struct FakeHost {
    pub token: FakeToken,
    pub devices: Vec<UsbDevice>,
    /// Enumeration returns nothing for this many polls.
    pub absent_polls: usize,
    pub permission: PermissionBehavior,
    pub cancel: CancelToken,
    pub open_succeeds: bool,
    pub claim_succeeds: bool,
    /// Report descriptor per interface number, FIDO when missing.
    pub descriptors: Vec<(u8, Vec<u8>)>,
    /// Enumeration panics.
    pub panics: bool,
}

impl FakeHost {
    pub fn new(token: FakeToken) -> FakeHost {
        FakeHost {
            token,
            devices: vec![fido_device()],
            absent_polls: 0,
            permission: PermissionBehavior::Grant,
            cancel: CancelToken::new(),
            open_succeeds: true,
            claim_succeeds: true,
            descriptors: Vec::new(),
            panics: false,
        }
    }
}

impl HostPlatform for FakeHost {
    type Connection = FakeConnection;

    fn enumerate_devices(&self) -> Vec<UsbDevice> {
        if self.panics {
            panic!("enumeration failed");
        }
        let mut state = self.token.lock();
        state.counters.presence_polls += 1;
        if state.counters.presence_polls <= self.absent_polls {
            Vec::new()
        } else {
            self.devices.clone()
        }
    }

    fn request_permission(&self, _device: &UsbDevice, reply: PermissionReply) {
        self.token.lock().counters.permission_requests += 1;
        match self.permission {
            PermissionBehavior::Grant => reply.deliver(true),
            PermissionBehavior::Deny => reply.deliver(false),
            PermissionBehavior::GrantLater(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    reply.deliver(true);
                });
            }
            PermissionBehavior::CancelThenGrant => {
                self.cancel.cancel();
                reply.deliver(true);
            }
        }
    }

    fn open_device(&self, _device: &UsbDevice) -> Option<FakeConnection> {
        if !self.open_succeeds {
            return None;
        }
        self.token.lock().counters.opens += 1;
        Some(FakeConnection {
            token: self.token.clone(),
            claim_succeeds: self.claim_succeeds,
            descriptors: self.descriptors.clone(),
        })
    }
}

#[derive(Debug)]
pub struct FakeConnection {
    token: FakeToken,
    claim_succeeds: bool,
    descriptors: Vec<(u8, Vec<u8>)>,
}

impl UsbConnection for FakeConnection {
    fn claim_interface(&mut self, _interface: &UsbInterface, force: bool) -> bool {
        assert!(force);
        if self.claim_succeeds {
            self.token.lock().counters.claims += 1;
        }
        self.claim_succeeds
    }

    fn release_interface(&mut self, _interface: &UsbInterface) -> io::Result<()> {
        self.token.lock().counters.releases += 1;
        Ok(())
    }

    fn report_descriptor(&mut self, interface: &UsbInterface) -> io::Result<Vec<u8>> {
        Ok(self
            .descriptors
            .iter()
            .find(|(number, _)| *number == interface.number)
            .map(|(_, descriptor)| descriptor.clone())
            .unwrap_or_else(|| FIDO_REPORT_DESCRIPTOR.to_vec()))
    }

    fn bulk_transfer(
        &mut self,
        endpoint: &UsbEndpoint,
        buffer: &mut [u8],
        _timeout: Duration,
    ) -> io::Result<usize> {
        let mut state = self.token.lock();
        match endpoint.direction {
            Direction::Out => state.write(buffer),
            Direction::In => state.read(buffer),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.token.lock().counters.closes += 1;
        Ok(())
    }
}
