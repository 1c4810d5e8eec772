//! Hosting the application on a live HTTP endpoint
//!
//! [`ServerPool::acquire`] starts servers through the registered factories
//! and, when reuse is enabled, hands the same [`ServerHandle`] to every
//! session driving the same application.

pub mod default;

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use url::Url;

use crate::app::App;
use crate::common::{Error, Result};
use crate::registry::Registry;

/// Delay between readiness probes
const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Connect timeout of a single readiness probe
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(250);

/// A started server, as returned by a server factory
pub trait RunningServer: Send {
    /// Stop accepting connections and release the port
    fn shutdown(&mut self) -> Result<()>;
}

/// A live application host
pub struct ServerHandle {
    name: String,
    host: String,
    port: u16,
    app: App,
    pooled: bool,
    live: AtomicBool,
    instance: Mutex<Option<Box<dyn RunningServer>>>,
}

impl ServerHandle {
    fn new(
        name: &str,
        host: &str,
        port: u16,
        app: &App,
        pooled: bool,
        instance: Box<dyn RunningServer>,
    ) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            app: app.clone(),
            pooled,
            live: AtomicBool::new(true),
            instance: Mutex::new(Some(instance)),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Identity of the hosted application
    pub fn app_id(&self) -> usize {
        self.app.id()
    }

    /// Whether the handle was shared through the pool when started
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// `http://host:port` of the running server
    pub fn base_url(&self) -> Result<Url> {
        let raw = format!("http://{}:{}", self.host, self.port);
        Url::parse(&raw)
            .map_err(|e| Error::Internal(format!("Invalid server url '{}': {}", raw, e)))
    }

    /// Stop the server; stopping twice is a no-op
    pub fn stop(&self) -> Result<()> {
        let instance = self.instance.lock().take();
        self.live.store(false, Ordering::SeqCst);
        if let Some(mut instance) = instance {
            tracing::info!(
                server = %self.name,
                host = %self.host,
                port = self.port,
                "Stopping server"
            );
            instance.shutdown()?;
        }
        Ok(())
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(server = %self.name, error = %e, "Failed to stop server");
        }
    }
}

type Slot = Arc<Mutex<Option<Arc<ServerHandle>>>>;

/// Servers keyed by application identity and server name
#[derive(Default)]
pub struct ServerPool {
    slots: Mutex<HashMap<(usize, String), Slot>>,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a ready server for `app`, starting one when needed
    ///
    /// The pool lock only covers finding the slot; the startup wait runs
    /// under the slot's own lock so one key never starts twice while other
    /// keys proceed.
    #[tracing::instrument(skip(self, registry, app), fields(app = ?app))]
    pub fn acquire(
        &self,
        registry: &Registry,
        app: &App,
        server_name: &str,
        preferred_port: Option<u16>,
    ) -> Result<Arc<ServerHandle>> {
        let reuse = registry.reuse_server();
        let key = (app.id(), server_name.to_string());

        let slot = if reuse {
            self.slots.lock().entry(key).or_default().clone()
        } else {
            Slot::default()
        };

        let mut current = slot.lock();
        if let Some(handle) = current.as_ref().filter(|handle| handle.is_live()) {
            tracing::debug!(port = handle.port(), "Reusing running server");
            return Ok(handle.clone());
        }

        let factory = registry.server_factory(server_name)?;
        let host = registry.server_host();
        let port = match preferred_port {
            Some(port) => port,
            None => find_available_port(&host)?,
        };

        tracing::info!(server = server_name, %host, port, "Starting server");
        let instance = factory(app, port, &host)
            .map_err(|e| Error::server_startup(server_name, &format!("{}:{}", host, port), e))?;
        let handle = Arc::new(ServerHandle::new(server_name, &host, port, app, reuse, instance));

        let timeout = registry.server_startup_timeout();
        if let Err(e) = wait_until_ready(server_name, &host, port, timeout) {
            let _ = handle.stop();
            return Err(e);
        }

        if reuse {
            *current = Some(handle.clone());
        }
        Ok(handle)
    }

    /// Give a server back after a session is done with it
    ///
    /// Pooled servers keep running for the next session, whatever the reuse
    /// setting is now; servers started without reuse are stopped.
    pub fn release(&self, handle: &Arc<ServerHandle>) -> Result<()> {
        if handle.is_pooled() {
            return Ok(());
        }
        handle.stop()
    }

    /// Pooled server for `app` and `server_name`, if one is running
    pub fn get(&self, app: &App, server_name: &str) -> Option<Arc<ServerHandle>> {
        let slot = self.slots.lock().get(&(app.id(), server_name.to_string())).cloned()?;
        let current = slot.lock();
        current.as_ref().filter(|handle| handle.is_live()).cloned()
    }

    /// Stop every pooled server
    pub fn shutdown_all(&self) -> Result<()> {
        let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(handle) = slot.lock().take() {
                handle.stop()?;
            }
        }
        Ok(())
    }
}

/// Ask the OS for a free port on `host`
pub fn find_available_port(host: &str) -> Result<u16> {
    let listener = TcpListener::bind((host, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Poll until `host:port` accepts TCP connections
fn wait_until_ready(name: &str, host: &str, port: u16, timeout: Duration) -> Result<()> {
    let address = format!("{}:{}", host, port);
    let targets: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::server_startup(name, &address, e))?
        .collect();

    // No deadline when the timeout does not fit in an Instant
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if targets
            .iter()
            .any(|target| TcpStream::connect_timeout(target, PROBE_CONNECT_TIMEOUT).is_ok())
        {
            tracing::debug!(server = name, %address, "Server is ready");
            return Ok(());
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Error::server_startup(
                name,
                &address,
                format!("not accepting connections after {:?}", timeout),
            ));
        }
        std::thread::sleep(PROBE_INTERVAL);
    }
}
