use thiserror::Error;
use u2f_core::{EnvelopeError, StatusWord};

use crate::connector::ConnectError;
use crate::transport::TransportError;

/// Why an authentication flow ended without a result.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Connect(#[from] ConnectError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Token rejected the command with status {}", display_status(.status))]
    Rejected { status: Option<StatusWord> },

    #[error("Token accepted none of the {count} key handles")]
    NoKeyHandleAccepted { count: usize },
}

fn display_status(status: &Option<StatusWord>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "(none)".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid request envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("{0}")]
    Flow(#[from] FlowError),
}
