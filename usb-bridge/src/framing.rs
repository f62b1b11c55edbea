//! U2FHID message framing over fixed size HID reports.
//!
//! See https://fidoalliance.org/specs/fido-u2f-v1.2-ps-20170411/fido-u2f-hid-protocol-v1.2-ps-20170411.html

use std::cmp;
use std::io::{self, Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use tracing::trace;

pub const HID_REPORT_LEN: usize = 64;
const INITIAL_PACKET_DATA_LEN: usize = HID_REPORT_LEN - 7;
const CONTINUATION_PACKET_DATA_LEN: usize = HID_REPORT_LEN - 5;
const MAX_SEQUENCE_NUMBER: usize = 0x7f;
pub const MAX_MESSAGE_LEN: usize =
    INITIAL_PACKET_DATA_LEN + (MAX_SEQUENCE_NUMBER + 1) * CONTINUATION_PACKET_DATA_LEN;

const FRAME_TYPE_INIT: u8 = 0b1000_0000;
const FRAME_TYPE_MASK: u8 = 0b1000_0000;
const COMMAND_TYPE_MASK: u8 = 0b0111_1111;

const U2FHID_PING: u8 = 0x01;
const U2FHID_MSG: u8 = 0x03;
const U2FHID_LOCK: u8 = 0x04;
const U2FHID_INIT: u8 = 0x06;
const U2FHID_WINK: u8 = 0x08;
const U2FHID_KEEPALIVE: u8 = 0x3b;
const U2FHID_ERROR: u8 = 0x3f;

pub const INIT_NONCE_LEN: usize = 8;
const INIT_RESPONSE_LEN: usize = 17;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("HID report must be {} bytes, got {len}", HID_REPORT_LEN)]
    ReportLength { len: usize },

    #[error("Message of {len} bytes does not fit in one U2FHID transaction")]
    PayloadTooLong { len: usize },

    #[error("Continuation packet received before an initialization packet")]
    UnexpectedContinuation,

    #[error("Initialization packet received while a message was in progress")]
    UnexpectedInitialization,

    #[error("Expected continuation packet {expected}, got {actual}")]
    SequenceMismatch { expected: u8, actual: u8 },

    #[error("INIT response must be at least {} bytes, got {len}", INIT_RESPONSE_LEN)]
    InitResponseLength { len: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub const BROADCAST_CHANNEL_ID: ChannelId = ChannelId(0xffff_ffff);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub fn read<R: ReadBytesExt>(read: &mut R) -> io::Result<ChannelId> {
        Ok(ChannelId(read.read_u32::<BigEndian>()?))
    }

    pub fn write<W: WriteBytesExt>(&self, write: &mut W) -> io::Result<()> {
        write.write_u32::<BigEndian>(self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommandType {
    Ping,
    Msg,
    Lock,
    Init,
    Wink,
    KeepAlive,
    Error,
    Unknown { identifier: u8 },
}

impl CommandType {
    pub fn from_byte(byte: u8) -> CommandType {
        match byte & COMMAND_TYPE_MASK {
            U2FHID_PING => CommandType::Ping,
            U2FHID_MSG => CommandType::Msg,
            U2FHID_LOCK => CommandType::Lock,
            U2FHID_INIT => CommandType::Init,
            U2FHID_WINK => CommandType::Wink,
            U2FHID_KEEPALIVE => CommandType::KeepAlive,
            U2FHID_ERROR => CommandType::Error,
            id => CommandType::Unknown { identifier: id },
        }
    }

    pub fn to_byte(&self) -> u8 {
        match self {
            CommandType::Ping => U2FHID_PING,
            CommandType::Msg => U2FHID_MSG,
            CommandType::Lock => U2FHID_LOCK,
            CommandType::Init => U2FHID_INIT,
            CommandType::Wink => U2FHID_WINK,
            CommandType::KeepAlive => U2FHID_KEEPALIVE,
            CommandType::Error => U2FHID_ERROR,
            CommandType::Unknown { identifier } => *identifier,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    /// Offset  Length  Mnemonic  Description
    /// ------------------------------------------------------------------------------
    /// 0       4       CID       Channel identifier
    /// 4       1       CMD       Command identifier (bit 7 always set)
    /// 5       1       BCNTH     High part of payload length
    /// 6       1       BCNTL     Low part of payload length
    /// 7       (s - 7) DATA      Payload data (s is equal to the fixed packet size)
    Initialization {
        channel_id: ChannelId,
        command: CommandType,
        data: Vec<u8>,
        payload_len: u16,
    },
    /// Offset  Length  Mnemonic  Description
    /// ------------------------------------------------------------------------------
    /// 0       4       CID       Channel identifier
    /// 4       1       SEQ       Packet sequence 0x00..0x7f (bit 7 always cleared)
    /// 5       (s - 5) DATA      Payload data (s is equal to the fixed packet size)
    Continuation {
        channel_id: ChannelId,
        sequence_number: u8,
        data: Vec<u8>,
    },
}

impl Packet {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            Packet::Initialization { channel_id, .. } => *channel_id,
            Packet::Continuation { channel_id, .. } => *channel_id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Packet, FramingError> {
        if bytes.len() != HID_REPORT_LEN {
            return Err(FramingError::ReportLength { len: bytes.len() });
        }
        let mut reader = Cursor::new(bytes);

        let channel_id = ChannelId::read(&mut reader)?;
        let first_byte = reader.read_u8()?;
        if first_byte & FRAME_TYPE_MASK == FRAME_TYPE_INIT {
            let command = CommandType::from_byte(first_byte);
            let payload_len = reader.read_u16::<BigEndian>()?;
            let mut data = vec![0u8; INITIAL_PACKET_DATA_LEN];
            reader.read_exact(&mut data[..])?;
            Ok(Packet::Initialization {
                channel_id,
                command,
                data,
                payload_len,
            })
        } else {
            let mut data = vec![0u8; CONTINUATION_PACKET_DATA_LEN];
            reader.read_exact(&mut data[..])?;
            Ok(Packet::Continuation {
                channel_id,
                sequence_number: first_byte,
                data,
            })
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HID_REPORT_LEN);
        match self {
            Packet::Initialization {
                channel_id,
                command,
                data,
                payload_len,
            } => {
                assert!(data.len() <= INITIAL_PACKET_DATA_LEN);
                channel_id.write(&mut bytes).unwrap();
                bytes.push(command.to_byte() | FRAME_TYPE_INIT);
                bytes.write_u16::<BigEndian>(*payload_len).unwrap();
                bytes.extend_from_slice(data);
            }
            Packet::Continuation {
                channel_id,
                sequence_number,
                data,
            } => {
                assert!(data.len() <= CONTINUATION_PACKET_DATA_LEN);
                channel_id.write(&mut bytes).unwrap();
                assert_eq!(sequence_number & FRAME_TYPE_MASK, 0);
                bytes.push(*sequence_number);
                bytes.extend_from_slice(data);
            }
        }

        // Zero-pad to expected report length
        bytes.resize(HID_REPORT_LEN, 0u8);
        bytes
    }
}

/// Splits `data` into the packets of one message on `channel_id`.
pub fn encode_message(
    channel_id: ChannelId,
    command: CommandType,
    data: &[u8],
) -> Result<Vec<Packet>, FramingError> {
    if data.len() > MAX_MESSAGE_LEN {
        return Err(FramingError::PayloadTooLong { len: data.len() });
    }
    let split_index = cmp::min(data.len(), INITIAL_PACKET_DATA_LEN);
    let (initial, remaining) = data.split_at(split_index);
    let mut packets = vec![Packet::Initialization {
        channel_id,
        command,
        payload_len: data.len() as u16,
        data: initial.to_vec(),
    }];
    for (i, chunk) in remaining.chunks(CONTINUATION_PACKET_DATA_LEN).enumerate() {
        packets.push(Packet::Continuation {
            channel_id,
            sequence_number: i as u8,
            data: chunk.to_vec(),
        });
    }
    Ok(packets)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub command: CommandType,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Partial {
    command: CommandType,
    payload_len: usize,
    data: Vec<u8>,
    next_sequence_number: u8,
}

/// Reassembles one response message from the packets read on a channel.
#[derive(Debug)]
pub struct MessageAssembler {
    channel_id: ChannelId,
    partial: Option<Partial>,
}

impl MessageAssembler {
    pub fn new(channel_id: ChannelId) -> MessageAssembler {
        MessageAssembler {
            channel_id,
            partial: None,
        }
    }

    /// Feeds one packet, returning the message once it is complete. Packets
    /// for other channels and keep-alives are ignored.
    pub fn push(&mut self, packet: Packet) -> Result<Option<Message>, FramingError> {
        if packet.channel_id() != self.channel_id {
            trace!(
                channel_id = ?packet.channel_id(),
                "MessageAssembler::push: ignoring packet for another channel"
            );
            return Ok(None);
        }

        match packet {
            Packet::Initialization {
                command: CommandType::KeepAlive,
                ..
            } if self.partial.is_none() => {
                trace!("MessageAssembler::push: keep-alive");
                Ok(None)
            }
            Packet::Initialization {
                command,
                data,
                payload_len,
                ..
            } => {
                if self.partial.is_some() {
                    return Err(FramingError::UnexpectedInitialization);
                }
                self.partial = Some(Partial {
                    command,
                    payload_len: payload_len as usize,
                    data,
                    next_sequence_number: 0,
                });
                Ok(self.take_if_complete())
            }
            Packet::Continuation {
                sequence_number,
                data,
                ..
            } => {
                let partial = self
                    .partial
                    .as_mut()
                    .ok_or(FramingError::UnexpectedContinuation)?;
                if sequence_number != partial.next_sequence_number {
                    return Err(FramingError::SequenceMismatch {
                        expected: partial.next_sequence_number,
                        actual: sequence_number,
                    });
                }
                partial.next_sequence_number += 1;
                partial.data.extend_from_slice(&data);
                Ok(self.take_if_complete())
            }
        }
    }

    fn take_if_complete(&mut self) -> Option<Message> {
        match self.partial {
            Some(ref partial) if partial.data.len() >= partial.payload_len => {}
            _ => return None,
        }
        self.partial.take().map(|mut partial| {
            partial.data.truncate(partial.payload_len);
            Message {
                command: partial.command,
                data: partial.data,
            }
        })
    }
}

/// Payload of the response to U2FHID_INIT.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InitResponse {
    pub nonce: [u8; INIT_NONCE_LEN],
    pub channel_id: ChannelId,
    pub protocol_version: u8,
    pub major_device_version: u8,
    pub minor_device_version: u8,
    pub build_device_version: u8,
    pub capabilities: u8,
}

impl InitResponse {
    pub fn from_bytes(bytes: &[u8]) -> Result<InitResponse, FramingError> {
        if bytes.len() < INIT_RESPONSE_LEN {
            return Err(FramingError::InitResponseLength { len: bytes.len() });
        }
        let mut reader = Cursor::new(bytes);
        let mut nonce = [0u8; INIT_NONCE_LEN];
        reader.read_exact(&mut nonce)?;
        Ok(InitResponse {
            nonce,
            channel_id: ChannelId::read(&mut reader)?,
            protocol_version: reader.read_u8()?,
            major_device_version: reader.read_u8()?,
            minor_device_version: reader.read_u8()?,
            build_device_version: reader.read_u8()?,
            capabilities: reader.read_u8()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(INIT_RESPONSE_LEN);
        bytes.extend_from_slice(&self.nonce);
        self.channel_id.write(&mut bytes).unwrap();
        bytes.push(self.protocol_version);
        bytes.push(self.major_device_version);
        bytes.push(self.minor_device_version);
        bytes.push(self.build_device_version);
        bytes.push(self.capabilities);
        bytes
    }
}
