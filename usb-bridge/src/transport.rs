use std::io;
use std::time::{Duration, Instant};

use rand::RngCore;
use thiserror::Error;
use tracing::{debug, trace, warn};
use u2f_core::Command;

use crate::config::Framing;
use crate::framing::{
    encode_message, ChannelId, CommandType, FramingError, InitResponse, Message, MessageAssembler,
    Packet, BROADCAST_CHANNEL_ID, HID_REPORT_LEN, INIT_NONCE_LEN,
};
use crate::host::{UsbConnection, UsbEndpoint, UsbInterface};

/// Largest response a raw exchange reads back: a register response with a
/// long attestation certificate fits comfortably.
const RAW_RESPONSE_BUFFER_LEN: usize = 4096;

/// How long a read waits for leftovers of an abandoned exchange.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

/// Upper bound on reads discarded by one drain, enough for a full-size
/// U2FHID message.
const MAX_DRAINED_READS: usize = 160;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Framing(#[from] FramingError),

    #[error("Session is closed")]
    Closed,

    #[error("Wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Device reported U2FHID error {code:#04x}")]
    Device { code: u8 },

    #[error("Unexpected response command {command:?}")]
    UnexpectedCommand { command: CommandType },

    #[error("No response within {timeout:?}")]
    Timeout { timeout: Duration },
}

/// One opened and claimed interface, exclusively owned by whoever holds it.
/// Dropping the session releases the interface and closes the connection.
pub struct DeviceSession<C: UsbConnection> {
    connection: Option<C>,
    interface: UsbInterface,
    in_endpoint: UsbEndpoint,
    out_endpoint: UsbEndpoint,
    timeout: Duration,
    framing: Framing,
    channel_id: ChannelId,
}

impl<C: UsbConnection> DeviceSession<C> {
    pub fn new(
        connection: C,
        interface: UsbInterface,
        in_endpoint: UsbEndpoint,
        out_endpoint: UsbEndpoint,
        timeout: Duration,
        framing: Framing,
    ) -> DeviceSession<C> {
        DeviceSession {
            connection: Some(connection),
            interface,
            in_endpoint,
            out_endpoint,
            timeout,
            framing,
            channel_id: BROADCAST_CHANNEL_ID,
        }
    }

    pub fn interface(&self) -> &UsbInterface {
        &self.interface
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Allocates a U2FHID channel. A no-op for raw framing.
    pub fn init(&mut self) -> Result<(), TransportError> {
        if self.framing == Framing::Raw {
            return Ok(());
        }

        let mut nonce = [0u8; INIT_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.channel_id = BROADCAST_CHANNEL_ID;
        self.send_message(CommandType::Init, &nonce)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let message = self.receive_message(deadline)?;
            if message.command != CommandType::Init {
                return Err(TransportError::UnexpectedCommand {
                    command: message.command,
                });
            }
            let response = InitResponse::from_bytes(&message.data)?;
            if response.nonce != nonce {
                trace!("DeviceSession::init: ignoring INIT response for another nonce");
                continue;
            }
            debug!(
                channel_id = ?response.channel_id,
                protocol_version = response.protocol_version,
                version = %format!(
                    "{}.{}.{}",
                    response.major_device_version,
                    response.minor_device_version,
                    response.build_device_version
                ),
                capabilities = response.capabilities,
                "Allocated U2FHID channel"
            );
            self.channel_id = response.channel_id;
            return Ok(());
        }
    }

    /// Sends one APDU and returns the raw response, status word included.
    pub fn exchange(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        trace!(
            command = %hex::encode(command),
            decoded = ?Command::decode(command).ok(),
            "DeviceSession::exchange"
        );
        let response = match self.framing {
            Framing::Raw => self.exchange_raw(command)?,
            Framing::U2fHid => {
                self.send_message(CommandType::Msg, command)?;
                let message = self.receive_message(Instant::now() + self.timeout)?;
                match message.command {
                    CommandType::Msg => message.data,
                    CommandType::Error => {
                        return Err(TransportError::Device {
                            code: message.data.first().copied().unwrap_or(0),
                        })
                    }
                    other => return Err(TransportError::UnexpectedCommand { command: other }),
                }
            }
        };
        trace!(response = %hex::encode(&response), "DeviceSession::exchange");
        Ok(response)
    }

    /// Recovers after a failed exchange: discards whatever the token still
    /// sends for the abandoned command, then allocates a fresh U2FHID channel
    /// so late packets for the old one are ignored.
    pub fn resync(&mut self) -> Result<(), TransportError> {
        let mut buffer = vec![0u8; RAW_RESPONSE_BUFFER_LEN];
        let mut drained = 0;
        while drained < MAX_DRAINED_READS {
            let (connection, endpoint, _) = self.parts(Endpoint::In)?;
            match connection.bulk_transfer(endpoint, &mut buffer, DRAIN_TIMEOUT) {
                Ok(len) => {
                    trace!(stale = %hex::encode(&buffer[..len]), "DeviceSession::resync");
                    drained += 1;
                }
                Err(ref err) if err.kind() == io::ErrorKind::TimedOut => break,
                Err(err) => return Err(err.into()),
            }
        }
        debug!(drained, "Discarded stale reads");
        self.init()
    }

    /// Releases the interface and closes the connection. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            debug!(interface = self.interface.number, "Closing device session");
            if let Err(err) = connection.release_interface(&self.interface) {
                warn!(error = %err, "Failed to release interface");
            }
            if let Err(err) = connection.close() {
                warn!(error = %err, "Failed to close connection");
            }
        }
    }

    fn exchange_raw(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut out = command.to_vec();
        self.write(&mut out)?;
        let mut buffer = vec![0u8; RAW_RESPONSE_BUFFER_LEN];
        let len = self.transfer_in(&mut buffer)?;
        buffer.truncate(len);
        Ok(buffer)
    }

    fn send_message(&mut self, command: CommandType, data: &[u8]) -> Result<(), TransportError> {
        for packet in encode_message(self.channel_id, command, data)? {
            let mut report = packet.to_bytes();
            self.write(&mut report)?;
        }
        Ok(())
    }

    fn receive_message(&mut self, deadline: Instant) -> Result<Message, TransportError> {
        let mut assembler = MessageAssembler::new(self.channel_id);
        loop {
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout {
                    timeout: self.timeout,
                });
            }
            let mut report = [0u8; HID_REPORT_LEN];
            let len = self.transfer_in(&mut report)?;
            let packet = Packet::from_bytes(&report[..len])?;
            if let Some(message) = assembler.push(packet)? {
                return Ok(message);
            }
        }
    }

    fn write(&mut self, buffer: &mut [u8]) -> Result<(), TransportError> {
        let expected = buffer.len();
        let (connection, endpoint, timeout) = self.parts(Endpoint::Out)?;
        let written = connection.bulk_transfer(endpoint, buffer, timeout)?;
        if written != expected {
            return Err(TransportError::ShortWrite { written, expected });
        }
        Ok(())
    }

    fn transfer_in(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        let (connection, endpoint, timeout) = self.parts(Endpoint::In)?;
        Ok(connection.bulk_transfer(endpoint, buffer, timeout)?)
    }

    fn parts(
        &mut self,
        endpoint: Endpoint,
    ) -> Result<(&mut C, &UsbEndpoint, Duration), TransportError> {
        let endpoint = match endpoint {
            Endpoint::In => &self.in_endpoint,
            Endpoint::Out => &self.out_endpoint,
        };
        match self.connection {
            Some(ref mut connection) => Ok((connection, endpoint, self.timeout)),
            None => Err(TransportError::Closed),
        }
    }
}

impl<C: UsbConnection> Drop for DeviceSession<C> {
    fn drop(&mut self) {
        self.close();
    }
}

enum Endpoint {
    In,
    Out,
}
