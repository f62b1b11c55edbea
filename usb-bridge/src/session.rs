use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use tracing::{error, info};
use u2f_core::{encode_response, parse_request, AuthRequest};

use crate::cancel::CancelToken;
use crate::config::BridgeConfig;
use crate::error::SessionError;
use crate::host::HostPlatform;
use crate::runner::AuthRunner;

/// Bridges exactly one request envelope to a security key.
pub struct BridgeSession<H: HostPlatform> {
    host: H,
    config: BridgeConfig,
    cancel: CancelToken,
}

impl<H: HostPlatform> BridgeSession<H> {
    pub fn new(host: H, config: BridgeConfig) -> BridgeSession<H> {
        BridgeSession {
            host,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Token that stops this session at its next decision point.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the whole flow on the calling thread and returns the response envelope.
    pub fn process(self, envelope: &str) -> Result<String, SessionError> {
        let request = parse_request(envelope)?;
        self.run(request)
    }

    fn run(self, request: AuthRequest) -> Result<String, SessionError> {
        info!(
            request_id = request.request_id(),
            app_id = %request.application(),
            sign = request.is_sign(),
            "Processing request"
        );
        let mut runner = AuthRunner::new(self.host, request.clone(), self.config, self.cancel);
        let completion = runner.run()?;
        Ok(encode_response(&request, &completion)?)
    }
}

impl<H: HostPlatform + Send + 'static> BridgeSession<H> {
    /// Runs the flow on a background worker. `on_result` is called exactly
    /// once, with the response envelope or `None` when the request could not
    /// be parsed, failed, was cancelled or the host panicked.
    pub fn spawn<F>(self, envelope: &str, on_result: F) -> SessionHandle
    where
        F: FnOnce(Option<String>) + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let request = match parse_request(envelope) {
            Ok(request) => request,
            Err(err) => {
                error!(error = %err, "Invalid request envelope");
                on_result(None);
                return SessionHandle {
                    cancel,
                    worker: None,
                };
            }
        };

        let worker = thread::spawn(move || {
            let response = match panic::catch_unwind(AssertUnwindSafe(move || self.run(request))) {
                Ok(Ok(response)) => Some(response),
                Ok(Err(err)) => {
                    info!(error = %err, "No response");
                    None
                }
                Err(_) => {
                    error!("Bridge worker panicked");
                    None
                }
            };
            on_result(response)
        });

        SessionHandle {
            cancel,
            worker: Some(worker),
        }
    }
}

/// Owner's side of a spawned session. Dropping it cancels the session.
#[derive(Debug)]
pub struct SessionHandle {
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the worker to finish.
    pub fn join(mut self) -> thread::Result<()> {
        match self.worker.take() {
            Some(worker) => worker.join(),
            None => Ok(()),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.cancel.cancel();
        }
    }
}
