use std::fmt;

use crate::constants::*;
use crate::key_handle::KeyHandle;

/// Status word [2 bytes] trailing every response from the token.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const NO_ERROR: StatusWord = StatusWord(SW_NO_ERROR);
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord(SW_CONDITIONS_NOT_SATISFIED);
    pub const WRONG_DATA: StatusWord = StatusWord(SW_WRONG_DATA);

    /// The last two bytes of a response, big-endian. `None` when the response
    /// is too short to carry a status word.
    pub fn from_response(response: &[u8]) -> Option<StatusWord> {
        if response.len() < 2 {
            return None;
        }
        let tail = &response[response.len() - 2..];
        Some(StatusWord(u16::from(tail[0]) << 8 | u16::from(tail[1])))
    }

    fn description(&self) -> &'static str {
        match self.0 {
            SW_NO_ERROR => "no error",
            SW_CONDITIONS_NOT_SATISFIED => "test of user presence required",
            SW_WRONG_DATA => "invalid key handle",
            SW_COMMAND_NOT_ALLOWED => "command not allowed",
            SW_WRONG_LENGTH => "wrong length",
            SW_CLA_NOT_SUPPORTED => "class not supported",
            SW_INS_NOT_SUPPORTED => "instruction not supported",
            SW_UNKNOWN => "no precise diagnosis",
            _ => "unknown",
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#06x} ({})", self.0, self.description())
    }
}

/// Interpretation of one response read back from the token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExchangeResult {
    /// 0x9000, payload is the response without its status word.
    Success { payload: Vec<u8> },
    /// 0x6985, the token waits for the user to touch it.
    Busy,
    /// Any other status word, or none at all.
    Failure { status: Option<StatusWord> },
}

impl ExchangeResult {
    pub fn from_response(response: &[u8]) -> ExchangeResult {
        match StatusWord::from_response(response) {
            Some(StatusWord::NO_ERROR) => ExchangeResult::Success {
                payload: response[..response.len() - 2].to_vec(),
            },
            Some(StatusWord::CONDITIONS_NOT_SATISFIED) => ExchangeResult::Busy,
            status => ExchangeResult::Failure { status },
        }
    }
}

/// Successful outcome of a flow, ready to be framed into a response envelope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Completion {
    Signed {
        key_handle: KeyHandle,
        signature_data: Vec<u8>,
    },
    Registered {
        registration_data: Vec<u8>,
    },
}
