//! `wiremock`-backed server implementation.
//!
//! Every handle binds its own listener, so the requested port is honoured
//! and a taken port surfaces as [`StartupError::Bind`] instead of a panic.

use crate::error::{ConfigurationError, LookupError, StartupError, TeardownError};
use crate::resolver::BuildParameters;
use crate::server::{ServerFactory, ServerHandle};
use crate::stubs::{self, FILES_DIR};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Extra stubs mounted on servers that list the extension id.
pub trait ServerExtension: Send + Sync {
    /// Mocks to mount, built for one server.
    fn mocks(&self, params: &BuildParameters) -> Vec<Mock>;
}

/// `GET /__admin/health` answering `{"status":"healthy"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCheck;

impl ServerExtension for HealthCheck {
    fn mocks(&self, params: &BuildParameters) -> Vec<Mock> {
        let mut response =
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "healthy" }));
        if let Some(delay) = params.fixed_delay {
            response = response.set_delay(delay);
        }
        vec![Mock::given(method("GET"))
            .and(path("/__admin/health"))
            .respond_with(response)
            .with_priority(1)
            .named("health")]
    }
}

/// Builds [`WireMockHandle`]s.
#[derive(Clone)]
pub struct WireMockFactory {
    extensions: HashMap<String, Arc<dyn ServerExtension>>,
}

impl Default for WireMockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WireMockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.extensions.keys().collect();
        ids.sort();
        f.debug_struct("WireMockFactory").field("extensions", &ids).finish()
    }
}

impl WireMockFactory {
    /// Factory with the `health` extension.
    pub fn new() -> Self {
        Self {
            extensions: HashMap::new(),
        }
        .with_extension("health", HealthCheck)
    }

    /// Register an extension under `id`.
    #[must_use]
    pub fn with_extension<E>(mut self, id: impl Into<String>, extension: E) -> Self
    where
        E: ServerExtension + 'static,
    {
        self.extensions.insert(id.into(), Arc::new(extension));
        self
    }
}

impl ServerFactory for WireMockFactory {
    type Handle = WireMockHandle;

    fn build(&self, params: BuildParameters) -> Result<WireMockHandle, ConfigurationError> {
        let mut mocks = match params.stubs.root() {
            Some(root) => stubs::load_mocks(root, params.fixed_delay)?,
            None => Vec::new(),
        };
        for id in &params.extensions {
            let extension = self
                .extensions
                .get(id)
                .ok_or_else(|| ConfigurationError::UnknownExtension(id.clone()))?;
            mocks.extend(extension.mocks(&params).into_iter().map(|mock| (id.clone(), mock)));
        }
        debug!(name = %params.name, stubs = mocks.len(), "Built mock server");
        Ok(WireMockHandle::new(params, mocks))
    }
}

enum State {
    Built(Vec<(String, Mock)>),
    Running(MockServer),
    Stopped,
}

/// A single `wiremock` server.
///
/// A handle whose start failed cannot be started again.
pub struct WireMockHandle {
    params: BuildParameters,
    state: RwLock<State>,
    address: OnceLock<SocketAddr>,
    running: AtomicBool,
}

impl fmt::Debug for WireMockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireMockHandle")
            .field("name", &self.params.name)
            .field("address", &self.address.get())
            .field("running", &self.is_running())
            .finish()
    }
}

impl WireMockHandle {
    fn new(params: BuildParameters, mocks: Vec<(String, Mock)>) -> Self {
        Self {
            params,
            state: RwLock::new(State::Built(mocks)),
            address: OnceLock::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Parameters this server was built from.
    pub fn params(&self) -> &BuildParameters {
        &self.params
    }

    /// Absolute URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    /// Mount an additional mock on the running server.
    pub async fn mount(&self, mock: Mock) -> Result<(), LookupError> {
        match &*self.state.read().await {
            State::Running(server) => {
                server.register(mock).await;
                Ok(())
            }
            _ => Err(LookupError::NotRunning(self.params.name.clone())),
        }
    }

    /// Requests received so far; `None` when stopped or not recording.
    pub async fn received_requests(&self) -> Option<Vec<Request>> {
        match &*self.state.read().await {
            State::Running(server) => server.received_requests().await,
            _ => None,
        }
    }

    /// Drop every mounted mock and recorded request, file stubs included.
    pub async fn reset(&self) -> Result<(), LookupError> {
        match &*self.state.read().await {
            State::Running(server) => {
                server.reset().await;
                Ok(())
            }
            _ => Err(LookupError::NotRunning(self.params.name.clone())),
        }
    }

    /// Contents of `__files/<relative>` under this server's stub location.
    pub fn body_file(&self, relative: &str) -> Result<Vec<u8>, ConfigurationError> {
        let root = self
            .params
            .stubs
            .root()
            .ok_or_else(|| ConfigurationError::NoStubLocation(self.params.name.clone()))?;
        let path = root.join(FILES_DIR).join(relative);
        std::fs::read(&path).map_err(|source| ConfigurationError::Io { path, source })
    }

    async fn serve(&self, listener: TcpListener) -> MockServer {
        let builder = MockServer::builder().listener(listener);
        if self.params.record_requests {
            builder.start().await
        } else {
            builder.disable_request_recording().start().await
        }
    }

    fn bind_error(&self, source: std::io::Error) -> StartupError {
        StartupError::Bind {
            name: self.params.name.clone(),
            host: self.params.host.clone(),
            port: self.params.port,
            source,
        }
    }
}

#[async_trait]
impl ServerHandle for WireMockHandle {
    async fn start(&self) -> Result<(), StartupError> {
        let mut state = self.state.write().await;
        let mocks = match std::mem::replace(&mut *state, State::Stopped) {
            State::Built(mocks) => mocks,
            State::Running(server) => {
                *state = State::Running(server);
                return Ok(());
            }
            State::Stopped => return Err(StartupError::AlreadyStopped(self.params.name.clone())),
        };

        let listener = TcpListener::bind((self.params.host.as_str(), self.params.port))
            .map_err(|e| self.bind_error(e))?;
        listener.set_nonblocking(true).map_err(|e| self.bind_error(e))?;
        let address = listener.local_addr().map_err(|e| self.bind_error(e))?;

        let server = self.serve(listener).await;
        for (id, mock) in mocks {
            server.register(mock).await;
            if self.params.verbose {
                info!(name = %self.params.name, stub_id = %id, "Mounted stub");
            } else {
                debug!(name = %self.params.name, stub_id = %id, "Mounted stub");
            }
        }

        // a handle is started at most once, so the address is never reset
        let _ = self.address.set(address);
        *state = State::Running(server);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TeardownError> {
        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, State::Stopped)
        };
        self.running.store(false, Ordering::SeqCst);

        let State::Running(server) = previous else {
            return Ok(());
        };
        // dropping the server verifies expectations and may panic
        tokio::spawn(async move { drop(server) })
            .await
            .map_err(|e| {
                let reason = panic_reason(e);
                warn!(name = %self.params.name, reason = %reason, "Mock server failed to stop cleanly");
                TeardownError {
                    name: self.params.name.clone(),
                    reason,
                }
            })?;
        info!(name = %self.params.name, "Stopped mock server");
        Ok(())
    }

    fn base_url(&self) -> String {
        self.address
            .get()
            .map(|address| format!("http://{}", address))
            .unwrap_or_default()
    }

    fn port(&self) -> u16 {
        self.address.get().map_or(0, SocketAddr::port)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn panic_reason(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "server panicked while stopping".to_string())
}
