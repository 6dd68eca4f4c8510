//! In-memory server doubles for unit tests.

use crate::error::{ConfigurationError, StartupError, TeardownError};
use crate::resolver::BuildParameters;
use crate::server::{ServerFactory, ServerHandle};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static NEXT_PORT: AtomicU16 = AtomicU16::new(41000);

/// Handle that pretends to bind a port.
#[derive(Debug)]
pub(crate) struct FakeHandle {
    name: String,
    requested_port: u16,
    port: AtomicU16,
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: bool,
    fail_stop: bool,
    start_delay: Option<Duration>,
    stop_log: Arc<Mutex<Vec<String>>>,
}

impl FakeHandle {
    pub(crate) fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            requested_port: port,
            port: AtomicU16::new(0),
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_start: false,
            fail_stop: false,
            start_delay: None,
            stop_log: Arc::default(),
        }
    }

    pub(crate) fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub(crate) fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub(crate) fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServerHandle for FakeHandle {
    async fn start(&self) -> Result<(), StartupError> {
        if self.fail_start {
            return Err(StartupError::Bind {
                name: self.name.clone(),
                host: "127.0.0.1".to_string(),
                port: self.requested_port,
                source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
            });
        }
        if self.stop_count() > 0 {
            return Err(StartupError::AlreadyStopped(self.name.clone()));
        }
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        let port = if self.requested_port == 0 {
            NEXT_PORT.fetch_add(1, Ordering::SeqCst)
        } else {
            self.requested_port
        };
        self.port.store(port, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TeardownError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stop_log.lock().unwrap().push(self.name.clone());
        if self.fail_stop {
            return Err(TeardownError {
                name: self.name.clone(),
                reason: "simulated stop failure".to_string(),
            });
        }
        Ok(())
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port())
    }

    fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Factory that records every parameter set it builds from.
#[derive(Default)]
pub(crate) struct FakeFactory {
    built: Mutex<Vec<BuildParameters>>,
    occupied_ports: HashSet<u16>,
    failing_stops: HashSet<String>,
    known_extensions: Option<HashSet<String>>,
    start_delay: Option<Duration>,
    stop_log: Arc<Mutex<Vec<String>>>,
}

impl FakeFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starting on `port` fails as if another process held it.
    pub(crate) fn with_occupied_port(mut self, port: u16) -> Self {
        self.occupied_ports.insert(port);
        self
    }

    /// Stopping server `name` fails.
    pub(crate) fn with_failing_stop(mut self, name: &str) -> Self {
        self.failing_stops.insert(name.to_string());
        self
    }

    /// Only these extension ids build successfully.
    pub(crate) fn with_extensions(mut self, ids: &[&str]) -> Self {
        self.known_extensions = Some(ids.iter().map(|id| id.to_string()).collect());
        self
    }

    /// Every handle takes `delay` to start.
    pub(crate) fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// Names of servers stopped so far, in stop order.
    pub(crate) fn stopped(&self) -> Vec<String> {
        self.stop_log.lock().unwrap().clone()
    }

    pub(crate) fn built(&self) -> Vec<BuildParameters> {
        self.built.lock().unwrap().clone()
    }
}

impl ServerFactory for FakeFactory {
    type Handle = FakeHandle;

    fn build(&self, params: BuildParameters) -> Result<FakeHandle, ConfigurationError> {
        if let Some(known) = &self.known_extensions {
            if let Some(unknown) = params.extensions.iter().find(|id| !known.contains(*id)) {
                return Err(ConfigurationError::UnknownExtension(unknown.clone()));
            }
        }

        let mut handle = FakeHandle::new(&params.name, params.port);
        if self.occupied_ports.contains(&params.port) {
            handle = handle.failing_start();
        }
        if self.failing_stops.contains(&params.name) {
            handle = handle.failing_stop();
        }
        handle.start_delay = self.start_delay;
        handle.stop_log = Arc::clone(&self.stop_log);
        self.built.lock().unwrap().push(params);
        Ok(handle)
    }
}
