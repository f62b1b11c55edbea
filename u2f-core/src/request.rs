use crate::apdu::{AuthenticateControlCode, Command};
use crate::app_id::AppId;
use crate::client_data::{ClientData, ClientDataType};
use crate::key_handle::KeyHandle;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    /// Key handles in the order the relying party listed them, never empty.
    Sign { key_handles: Vec<KeyHandle> },
    Register,
}

/// One U2F request, parsed from its envelope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthRequest {
    application: AppId,
    challenge: Vec<u8>,
    request_id: i64,
    operation: Operation,
}

impl AuthRequest {
    pub fn new(
        application: AppId,
        challenge: Vec<u8>,
        request_id: i64,
        operation: Operation,
    ) -> AuthRequest {
        AuthRequest {
            application,
            challenge,
            request_id,
            operation,
        }
    }

    pub fn application(&self) -> &AppId {
        &self.application
    }

    pub fn challenge(&self) -> &[u8] {
        &self.challenge
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn is_sign(&self) -> bool {
        match self.operation {
            Operation::Sign { .. } => true,
            Operation::Register => false,
        }
    }

    pub fn client_data(&self) -> ClientData<'_> {
        let typ = match self.operation {
            Operation::Sign { .. } => ClientDataType::GetAssertion,
            Operation::Register => ClientDataType::FinishEnrollment,
        };
        ClientData::new(typ, &self.challenge, &self.application)
    }

    /// AUTHENTICATE enforcing user presence for one of this request's key handles.
    pub fn authenticate_command(&self, key_handle: &KeyHandle) -> Command {
        Command::Authenticate {
            control_code: AuthenticateControlCode::EnforceUserPresenceAndSign,
            challenge: self.client_data().hash(),
            application: self.application.application_parameter(),
            key_handle: key_handle.clone(),
        }
    }

    pub fn register_command(&self) -> Command {
        Command::Register {
            challenge: self.client_data().hash(),
            application: self.application.application_parameter(),
        }
    }
}
