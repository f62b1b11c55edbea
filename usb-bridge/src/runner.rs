use std::time::Duration;

use tracing::{debug, info, trace, warn};
use u2f_core::{AuthRequest, Completion, ExchangeResult, KeyHandle, Operation};

use crate::cancel::CancelToken;
use crate::config::BridgeConfig;
use crate::connector::Connector;
use crate::error::FlowError;
use crate::host::HostPlatform;
use crate::transport::DeviceSession;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunnerState {
    AwaitingDevice,
    Connecting,
    Signing,
    Registering,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        match self {
            RunnerState::Succeeded | RunnerState::Failed | RunnerState::Cancelled => true,
            _ => false,
        }
    }
}

/// Drives one request from waiting for a device to a terminal state.
pub struct AuthRunner<H: HostPlatform> {
    connector: Connector<H>,
    request: AuthRequest,
    config: BridgeConfig,
    cancel: CancelToken,
    state: RunnerState,
    retries: usize,
}

impl<H: HostPlatform> AuthRunner<H> {
    pub fn new(
        host: H,
        request: AuthRequest,
        config: BridgeConfig,
        cancel: CancelToken,
    ) -> AuthRunner<H> {
        AuthRunner {
            connector: Connector::new(host, config.clone(), cancel.clone()),
            request,
            config,
            cancel,
            state: RunnerState::AwaitingDevice,
            retries: 0,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Number of times a command was resent because the token was waiting for the user.
    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn run(&mut self) -> Result<Completion, FlowError> {
        let result = self.drive();
        self.state = match result {
            Ok(_) => RunnerState::Succeeded,
            Err(FlowError::Cancelled) => RunnerState::Cancelled,
            Err(_) => RunnerState::Failed,
        };
        match result {
            Ok(_) => info!(request_id = self.request.request_id(), "Request completed"),
            Err(FlowError::Cancelled) => {
                info!(request_id = self.request.request_id(), "Request cancelled")
            }
            Err(ref err) => {
                warn!(request_id = self.request.request_id(), error = %err, "Request failed")
            }
        }
        result
    }

    fn drive(&mut self) -> Result<Completion, FlowError> {
        self.state = RunnerState::AwaitingDevice;
        self.await_device()?;

        self.state = RunnerState::Connecting;
        // Closed when dropped, on every path out of this function
        let mut session = self.connect()?;
        session.init()?;

        match self.request.operation().clone() {
            Operation::Sign { key_handles } => {
                self.state = RunnerState::Signing;
                self.sign(&mut session, &key_handles)
            }
            Operation::Register => {
                self.state = RunnerState::Registering;
                self.register(&mut session)
            }
        }
    }

    fn await_device(&self) -> Result<(), FlowError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            if self.connector.is_device_present() {
                debug!("Device present");
                return Ok(());
            }
            trace!("No device yet");
            if !self.cancel.sleep(self.config.presence_poll_interval()) {
                return Err(FlowError::Cancelled);
            }
        }
    }

    fn connect(&self) -> Result<DeviceSession<H::Connection>, FlowError> {
        if self.cancel.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        let mut outcome = None;
        self.connector.connect(|result| outcome = Some(result));
        match outcome {
            Some(result) => Ok(result?),
            None => Err(FlowError::Cancelled),
        }
    }

    fn sign(
        &mut self,
        session: &mut DeviceSession<H::Connection>,
        key_handles: &[KeyHandle],
    ) -> Result<Completion, FlowError> {
        for (index, key_handle) in key_handles.iter().enumerate() {
            let command = self.request.authenticate_command(key_handle).encode();
            match self.exchange_until_ready(session, &command, self.config.sign_retry_interval()) {
                Ok(signature_data) => {
                    debug!(index, "Key handle accepted");
                    return Ok(Completion::Signed {
                        key_handle: key_handle.clone(),
                        signature_data,
                    });
                }
                Err(FlowError::Cancelled) => return Err(FlowError::Cancelled),
                Err(FlowError::Transport(err)) => {
                    debug!(index, error = %err, "Exchange failed");
                    if index + 1 < key_handles.len() {
                        // A late reply must not be read as the next handle's answer
                        session.resync()?;
                    }
                }
                Err(err) => debug!(index, error = %err, "Key handle not accepted"),
            }
        }
        Err(FlowError::NoKeyHandleAccepted {
            count: key_handles.len(),
        })
    }

    fn register(
        &mut self,
        session: &mut DeviceSession<H::Connection>,
    ) -> Result<Completion, FlowError> {
        let command = self.request.register_command().encode();
        let registration_data =
            self.exchange_until_ready(session, &command, self.config.register_retry_interval())?;
        Ok(Completion::Registered { registration_data })
    }

    /// Sends `command` until the token answers with something other than
    /// "user presence required", sleeping `retry_interval` between attempts.
    fn exchange_until_ready(
        &mut self,
        session: &mut DeviceSession<H::Connection>,
        command: &[u8],
        retry_interval: Duration,
    ) -> Result<Vec<u8>, FlowError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            let response = session.exchange(command)?;
            match ExchangeResult::from_response(&response) {
                ExchangeResult::Success { payload } => return Ok(payload),
                ExchangeResult::Busy => {
                    trace!("Waiting for user presence");
                    self.retries += 1;
                    if !self.cancel.sleep(retry_interval) {
                        return Err(FlowError::Cancelled);
                    }
                }
                ExchangeResult::Failure { status } => {
                    return Err(FlowError::Rejected { status });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use u2f_core::{AppId, StatusWord};

    use super::*;
    use crate::config::Framing;
    use crate::connector::ConnectError;
    use crate::fake::*;
    use crate::transport::TransportError;

    fn config(framing: Framing) -> BridgeConfig {
        BridgeConfig {
            presence_poll_interval_ms: 1,
            sign_retry_interval_ms: 1,
            register_retry_interval_ms: 1,
            framing,
            ..BridgeConfig::default()
        }
    }

    fn key_handle(name: &str) -> KeyHandle {
        KeyHandle::from_bytes(name.as_bytes()).unwrap()
    }

    fn sign_request(names: &[&str]) -> AuthRequest {
        AuthRequest::new(
            AppId::new("https://example.com"),
            vec![0, 0, 0],
            7,
            Operation::Sign {
                key_handles: names.iter().map(|name| key_handle(name)).collect(),
            },
        )
    }

    fn register_request() -> AuthRequest {
        AuthRequest::new(
            AppId::new("https://example.com"),
            b"enroll".to_vec(),
            3,
            Operation::Register,
        )
    }

    fn runner(
        host: FakeHost,
        request: AuthRequest,
        framing: Framing,
    ) -> AuthRunner<FakeHost> {
        let cancel = host.cancel.clone();
        AuthRunner::new(host, request, config(framing), cancel)
    }

    #[test]
    fn sign_stops_at_first_accepted_handle() {
        let token = FakeToken::new(
            Framing::U2fHid,
            vec![
                Reply::status(0x6a80),
                Reply::status(0x6a80),
                Reply::success(b"sig"),
                Reply::success(b"unused"),
            ],
        );
        let request = sign_request(&["one", "two", "three", "four"]);
        let mut runner = runner(
            FakeHost::new(token.clone()),
            request.clone(),
            Framing::U2fHid,
        );

        let completion = runner.run().unwrap();

        assert_eq!(
            completion,
            Completion::Signed {
                key_handle: key_handle("three"),
                signature_data: b"sig".to_vec(),
            }
        );
        assert_eq!(runner.state(), RunnerState::Succeeded);
        let apdus = token.apdus();
        assert_eq!(apdus.len(), 3);
        assert_eq!(
            apdus[2],
            request.authenticate_command(&key_handle("three")).encode()
        );
        token.counters(|c| assert_eq!(c.closes, 1));
    }

    #[test]
    fn sign_resends_identical_command_while_busy() {
        let token = FakeToken::new(
            Framing::U2fHid,
            vec![Reply::busy(), Reply::busy(), Reply::success(b"sig")],
        );
        let mut runner = runner(
            FakeHost::new(token.clone()),
            sign_request(&["KEY"]),
            Framing::U2fHid,
        );

        assert_matches!(runner.run(), Ok(Completion::Signed { .. }));
        assert_eq!(runner.retries(), 2);
        let apdus = token.apdus();
        assert_eq!(apdus.len(), 3);
        assert!(apdus.iter().all(|apdu| *apdu == apdus[0]));
    }

    #[test]
    fn sign_transport_error_advances_to_next_handle() {
        let token = FakeToken::new(
            Framing::Raw,
            vec![Reply::TransportFailure, Reply::success(b"sig")],
        );
        let mut runner = runner(
            FakeHost::new(token.clone()),
            sign_request(&["one", "two"]),
            Framing::Raw,
        );

        assert_eq!(
            runner.run().unwrap(),
            Completion::Signed {
                key_handle: key_handle("two"),
                signature_data: b"sig".to_vec(),
            }
        );
        assert_eq!(token.apdus().len(), 2);
    }

    #[test]
    fn sign_ignores_late_reply_for_previous_handle_raw() {
        let token = FakeToken::new(
            Framing::Raw,
            vec![Reply::late(b"sig-for-one"), Reply::success(b"sig-for-two")],
        );
        let mut runner = runner(
            FakeHost::new(token.clone()),
            sign_request(&["one", "two"]),
            Framing::Raw,
        );

        assert_eq!(
            runner.run().unwrap(),
            Completion::Signed {
                key_handle: key_handle("two"),
                signature_data: b"sig-for-two".to_vec(),
            }
        );
    }

    #[test]
    fn sign_ignores_late_reply_for_previous_handle_u2fhid() {
        let token = FakeToken::new(
            Framing::U2fHid,
            vec![Reply::late(&[0x5a; 100]), Reply::success(b"sig-for-two")],
        );
        let mut runner = runner(
            FakeHost::new(token.clone()),
            sign_request(&["one", "two"]),
            Framing::U2fHid,
        );

        assert_eq!(
            runner.run().unwrap(),
            Completion::Signed {
                key_handle: key_handle("two"),
                signature_data: b"sig-for-two".to_vec(),
            }
        );
        token.counters(|c| assert_eq!(c.inits, 2));
    }

    #[test]
    fn sign_does_not_resync_after_last_handle() {
        let token = FakeToken::new(Framing::U2fHid, vec![Reply::DeviceError(0x7f)]);
        let mut runner = runner(
            FakeHost::new(token.clone()),
            sign_request(&["one"]),
            Framing::U2fHid,
        );

        assert_matches!(runner.run(), Err(FlowError::NoKeyHandleAccepted { count: 1 }));
        token.counters(|c| assert_eq!(c.inits, 1));
    }

    #[test]
    fn sign_fails_when_no_handle_accepted() {
        let token = FakeToken::new(
            Framing::U2fHid,
            vec![Reply::status(0x6a80), Reply::DeviceError(0x7f)],
        );
        let mut runner = runner(
            FakeHost::new(token.clone()),
            sign_request(&["one", "two"]),
            Framing::U2fHid,
        );

        assert_matches!(runner.run(), Err(FlowError::NoKeyHandleAccepted { count: 2 }));
        assert_eq!(runner.state(), RunnerState::Failed);
        token.counters(|c| {
            assert_eq!(c.releases, 1);
            assert_eq!(c.closes, 1);
        });
    }

    #[test]
    fn register_retries_twice_then_succeeds() {
        let token = FakeToken::new(
            Framing::U2fHid,
            vec![Reply::busy(), Reply::busy(), Reply::success(b"registration")],
        );
        let mut runner = runner(
            FakeHost::new(token.clone()),
            register_request(),
            Framing::U2fHid,
        );

        assert_eq!(
            runner.run().unwrap(),
            Completion::Registered {
                registration_data: b"registration".to_vec()
            }
        );
        assert_eq!(runner.retries(), 2);
        let apdus = token.apdus();
        assert_eq!(apdus.len(), 3);
        assert_eq!(&apdus[0][..7], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x40]);
    }

    #[test]
    fn register_command_hashes_client_data() {
        let token = FakeToken::new(Framing::U2fHid, vec![Reply::success(b"attestation")]);
        let request = register_request();
        let mut runner = runner(
            FakeHost::new(token.clone()),
            request.clone(),
            Framing::U2fHid,
        );

        assert_matches!(runner.run(), Ok(Completion::Registered { .. }));
        let commands = token.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].challenge(), &request.client_data().hash());
        assert_eq!(
            commands[0].application(),
            &request.application().application_parameter()
        );
    }

    #[test]
    fn register_rejection_is_not_retried() {
        let token = FakeToken::new(
            Framing::Raw,
            vec![Reply::status(0x6a80), Reply::success(b"")],
        );
        let mut runner = runner(
            FakeHost::new(token.clone()),
            register_request(),
            Framing::Raw,
        );

        assert_matches!(
            runner.run(),
            Err(FlowError::Rejected {
                status: Some(StatusWord::WRONG_DATA)
            })
        );
        assert_eq!(token.apdus().len(), 1);
    }

    #[test]
    fn register_transport_error_aborts() {
        let token = FakeToken::new(Framing::U2fHid, vec![Reply::DeviceError(0x06)]);
        let mut runner = runner(
            FakeHost::new(token.clone()),
            register_request(),
            Framing::U2fHid,
        );

        assert_matches!(
            runner.run(),
            Err(FlowError::Transport(TransportError::Device { code: 0x06 }))
        );
        assert_eq!(runner.state(), RunnerState::Failed);
    }

    #[test]
    fn waits_for_device_to_appear() {
        let token = FakeToken::new(Framing::Raw, vec![Reply::success(b"sig")]);
        let mut host = FakeHost::new(token.clone());
        host.absent_polls = 3;
        let mut runner = runner(host, sign_request(&["KEY"]), Framing::Raw);

        assert_matches!(runner.run(), Ok(_));
        token.counters(|c| assert!(c.presence_polls >= 4));
    }

    #[test]
    fn cancel_while_awaiting_device_never_opens_transport() {
        let token = FakeToken::new(Framing::Raw, vec![]);
        let mut host = FakeHost::new(token.clone());
        host.absent_polls = usize::max_value();
        let cancel = host.cancel.clone();
        let mut runner = runner(host, sign_request(&["KEY"]), Framing::Raw);

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cancel.cancel();
        });
        assert_matches!(runner.run(), Err(FlowError::Cancelled));
        canceller.join().unwrap();

        assert_eq!(runner.state(), RunnerState::Cancelled);
        token.counters(|c| {
            assert!(c.presence_polls > 0);
            assert_eq!(c.permission_requests, 0);
            assert_eq!(c.opens, 0);
        });
    }

    #[test]
    fn cancelled_before_start() {
        let token = FakeToken::new(Framing::Raw, vec![]);
        let host = FakeHost::new(token.clone());
        host.cancel.cancel();
        let mut runner = runner(host, register_request(), Framing::Raw);

        assert_matches!(runner.run(), Err(FlowError::Cancelled));
        token.counters(|c| assert_eq!(c.presence_polls, 0));
    }

    #[test]
    fn cancel_wins_over_busy_retry() {
        let token = FakeToken::new(Framing::U2fHid, vec![Reply::busy(); 10]);
        let host = FakeHost::new(token.clone());
        token.cancel_after_apdus(3, host.cancel.clone());
        let mut runner = runner(host, register_request(), Framing::U2fHid);

        assert_matches!(runner.run(), Err(FlowError::Cancelled));
        assert_eq!(token.apdus().len(), 3);
        token.counters(|c| assert_eq!(c.closes, 1));
    }

    #[test]
    fn cancel_during_sign_does_not_try_next_handle() {
        let token = FakeToken::new(Framing::Raw, vec![Reply::busy(), Reply::success(b"sig")]);
        let host = FakeHost::new(token.clone());
        token.cancel_after_apdus(1, host.cancel.clone());
        let mut runner = runner(host, sign_request(&["one", "two"]), Framing::Raw);

        assert_matches!(runner.run(), Err(FlowError::Cancelled));
        assert_eq!(token.apdus().len(), 1);
    }

    #[test]
    fn permission_denied_fails() {
        let token = FakeToken::new(Framing::Raw, vec![]);
        let mut host = FakeHost::new(token);
        host.permission = PermissionBehavior::Deny;
        let mut runner = runner(host, register_request(), Framing::Raw);

        assert_matches!(
            runner.run(),
            Err(FlowError::Connect(ConnectError::PermissionDenied { .. }))
        );
        assert_eq!(runner.state(), RunnerState::Failed);
    }

    #[test]
    fn stop_while_waiting_for_permission_is_cancelled() {
        let token = FakeToken::new(Framing::Raw, vec![]);
        let mut host = FakeHost::new(token.clone());
        host.permission = PermissionBehavior::CancelThenGrant;
        let mut runner = runner(host, register_request(), Framing::Raw);

        assert_matches!(runner.run(), Err(FlowError::Cancelled));
        token.counters(|c| assert_eq!(c.opens, 0));
    }

    #[test]
    fn terminal_states() {
        assert!(RunnerState::Succeeded.is_terminal());
        assert!(RunnerState::Cancelled.is_terminal());
        assert!(!RunnerState::Signing.is_terminal());
    }
}
