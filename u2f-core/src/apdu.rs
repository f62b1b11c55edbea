use std::io::{Cursor, Read};
use std::result::Result;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::constants::*;
use crate::key_handle::KeyHandle;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthenticateControlCode {
    CheckOnly,
    EnforceUserPresenceAndSign,
    DontEnforceUserPresenceAndSign,
}

impl AuthenticateControlCode {
    fn to_byte(self) -> u8 {
        match self {
            AuthenticateControlCode::CheckOnly => AUTH_CHECK_ONLY,
            AuthenticateControlCode::EnforceUserPresenceAndSign => AUTH_ENFORCE,
            AuthenticateControlCode::DontEnforceUserPresenceAndSign => AUTH_DONT_ENFORCE,
        }
    }
}

/// U2F raw message sent to a security key.
/// See https://fidoalliance.org/specs/fido-u2f-v1.2-ps-20170411/fido-u2f-raw-message-formats-v1.2-ps-20170411.html
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Register {
        challenge: [u8; PARAMETER_LEN],
        application: [u8; PARAMETER_LEN],
    },
    Authenticate {
        control_code: AuthenticateControlCode,
        challenge: [u8; PARAMETER_LEN],
        application: [u8; PARAMETER_LEN],
        key_handle: KeyHandle,
    },
}

#[derive(Debug, Error)]
pub enum CommandDecodeError {
    #[error("Command truncated")]
    Truncated,

    #[error("Only extended length encoding is supported")]
    NotExtendedLength,

    #[error("Unsupported class byte {0:#04x}")]
    ClassNotSupported(u8),

    #[error("Unsupported instruction {0:#04x}")]
    InstructionNotSupported(u8),

    #[error("Unknown control code {0:#04x}")]
    UnknownControlCode(u8),

    #[error("Request data is {actual_len} bytes, expected {expected_len}")]
    RequestDataLength {
        expected_len: usize,
        actual_len: usize,
    },

    #[error("Unexpected trailing bytes after the command")]
    TrailingBytes,
}

impl Command {
    /// Extended length encoding: `CLA INS P1 P2 00 Lc1 Lc2 <request-data> Le1 Le2`
    pub fn encode(&self) -> Vec<u8> {
        let (command_code, parameter1, request_data) = match self {
            Command::Register {
                challenge,
                application,
            } => {
                let mut data = Vec::with_capacity(2 * PARAMETER_LEN);

                // The challenge parameter [32 bytes].
                data.extend_from_slice(challenge);

                // The application parameter [32 bytes].
                data.extend_from_slice(application);

                (REGISTER_COMMAND_CODE, 0x00, data)
            }
            Command::Authenticate {
                control_code,
                challenge,
                application,
                key_handle,
            } => {
                let mut data = Vec::with_capacity(2 * PARAMETER_LEN + 1 + key_handle.len());

                // The challenge parameter [32 bytes].
                data.extend_from_slice(challenge);

                // The application parameter [32 bytes].
                data.extend_from_slice(application);

                // key handle length byte [1 byte], KeyHandle guarantees it fits
                data.push(key_handle.len() as u8);

                // key handle [length specified in previous field]
                data.extend_from_slice(key_handle.as_ref());

                (AUTHENTICATE_COMMAND_CODE, control_code.to_byte(), data)
            }
        };

        let mut bytes = Vec::with_capacity(request_data.len() + 9);

        // CLA: Reserved to be used by the underlying transport protocol
        bytes.push(FIDO_CLA);

        // INS: U2F command code
        bytes.push(command_code);

        // P1, P2: Parameter 1 and 2, defined by each command.
        bytes.push(parameter1);
        bytes.push(0x00);

        // Extended Length Encoding always begins with a byte of value 0
        bytes.push(0x00);

        // Lc: Length of the request-data in big-endian order
        bytes
            .write_u16::<BigEndian>(request_data.len() as u16)
            .unwrap();

        bytes.extend_from_slice(&request_data);

        // Le: Maximum length of the response data, 0 meaning as much as possible
        bytes.write_u16::<BigEndian>(0).unwrap();

        bytes
    }

    /// Only supports Extended Length Encoding
    pub fn decode(data: &[u8]) -> Result<Command, CommandDecodeError> {
        let mut reader = Cursor::new(data);

        let class_byte = reader.read_u8().map_err(|_| CommandDecodeError::Truncated)?;
        if class_byte != FIDO_CLA {
            return Err(CommandDecodeError::ClassNotSupported(class_byte));
        }

        let command_code = reader.read_u8().map_err(|_| CommandDecodeError::Truncated)?;
        let parameter1 = reader.read_u8().map_err(|_| CommandDecodeError::Truncated)?;
        let _parameter2 = reader.read_u8().map_err(|_| CommandDecodeError::Truncated)?;

        let zero_byte = reader.read_u8().map_err(|_| CommandDecodeError::Truncated)?;
        if zero_byte != 0 {
            return Err(CommandDecodeError::NotExtendedLength);
        }

        let request_data_len = reader
            .read_u16::<BigEndian>()
            .map_err(|_| CommandDecodeError::Truncated)? as usize;

        let mut request_data = vec![0u8; request_data_len];
        reader
            .read_exact(&mut request_data[..])
            .map_err(|_| CommandDecodeError::Truncated)?;

        // Le is optional, but nothing may follow it
        let remaining_len = data.len() - reader.position() as usize;
        if remaining_len != 0 && remaining_len != 2 {
            return Err(CommandDecodeError::TrailingBytes);
        }

        let mut reader = Cursor::new(&request_data[..]);
        let mut challenge = [0u8; PARAMETER_LEN];
        let mut application = [0u8; PARAMETER_LEN];
        match command_code {
            REGISTER_COMMAND_CODE => {
                if request_data_len != 2 * PARAMETER_LEN {
                    return Err(CommandDecodeError::RequestDataLength {
                        expected_len: 2 * PARAMETER_LEN,
                        actual_len: request_data_len,
                    });
                }
                reader
                    .read_exact(&mut challenge)
                    .map_err(|_| CommandDecodeError::Truncated)?;
                reader
                    .read_exact(&mut application)
                    .map_err(|_| CommandDecodeError::Truncated)?;
                Ok(Command::Register {
                    challenge,
                    application,
                })
            }
            AUTHENTICATE_COMMAND_CODE => {
                let control_code = match parameter1 {
                    AUTH_CHECK_ONLY => AuthenticateControlCode::CheckOnly,
                    AUTH_ENFORCE => AuthenticateControlCode::EnforceUserPresenceAndSign,
                    AUTH_DONT_ENFORCE => AuthenticateControlCode::DontEnforceUserPresenceAndSign,
                    other => return Err(CommandDecodeError::UnknownControlCode(other)),
                };
                reader
                    .read_exact(&mut challenge)
                    .map_err(|_| CommandDecodeError::Truncated)?;
                reader
                    .read_exact(&mut application)
                    .map_err(|_| CommandDecodeError::Truncated)?;
                let key_handle_len = reader.read_u8().map_err(|_| CommandDecodeError::Truncated)?;

                let expected_len = 2 * PARAMETER_LEN + 1 + key_handle_len as usize;
                if request_data_len != expected_len {
                    return Err(CommandDecodeError::RequestDataLength {
                        expected_len,
                        actual_len: request_data_len,
                    });
                }

                let mut key_handle_bytes = vec![0u8; key_handle_len as usize];
                reader
                    .read_exact(&mut key_handle_bytes[..])
                    .map_err(|_| CommandDecodeError::Truncated)?;
                let key_handle = KeyHandle::from_bytes(&key_handle_bytes)
                    .map_err(|_| CommandDecodeError::Truncated)?;

                Ok(Command::Authenticate {
                    control_code,
                    challenge,
                    application,
                    key_handle,
                })
            }
            other => Err(CommandDecodeError::InstructionNotSupported(other)),
        }
    }

    pub fn challenge(&self) -> &[u8; PARAMETER_LEN] {
        match self {
            Command::Register { challenge, .. } => challenge,
            Command::Authenticate { challenge, .. } => challenge,
        }
    }

    pub fn application(&self) -> &[u8; PARAMETER_LEN] {
        match self {
            Command::Register { application, .. } => application,
            Command::Authenticate { application, .. } => application,
        }
    }
}
