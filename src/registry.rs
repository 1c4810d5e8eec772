//! Driver and server registry
//!
//! Holds the named driver and server factories together with the harness
//! configuration. A fresh [`Registry`] can be built per test; everything
//! else shares [`Registry::global`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use url::Url;

use crate::app::App;
use crate::common::{Error, Result};
use crate::driver::{http::HttpDriver, rack_test::RackTest, Driver};
use crate::server::{self, RunningServer, ServerPool};

/// Name of the built-in server, always resolvable
pub const DEFAULT_SERVER: &str = "default";

/// Builds a driver for an application
pub type DriverFactory = Arc<dyn Fn(&App) -> Result<Box<dyn Driver>> + Send + Sync>;

/// Starts an application on `port` and `host`
pub type ServerFactory =
    Arc<dyn Fn(&App, u16, &str) -> Result<Box<dyn RunningServer>> + Send + Sync>;

/// Selection passed to [`Registry::set_server`]
pub enum ServerChoice {
    /// A registered server name
    Named(String),
    /// An unregistered factory; always rejected
    Inline(ServerFactory),
}

impl From<&str> for ServerChoice {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for ServerChoice {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<ServerFactory> for ServerChoice {
    fn from(factory: ServerFactory) -> Self {
        Self::Inline(factory)
    }
}

/// Harness configuration
#[derive(Debug, Clone)]
pub struct Options {
    /// Deadline for implicit waits
    pub default_max_wait_time: Duration,
    /// Base url for every visit when set
    pub app_host: Option<Url>,
    /// Base url for drivers that do not run a server
    pub default_host: Url,
    /// Share servers between sessions for the same application
    pub reuse_server: bool,
    /// Name of the active server factory
    pub server_name: String,
    /// Interface servers bind to
    pub server_host: String,
    /// Preferred port; a free one is picked when unset
    pub server_port: Option<u16>,
    /// Start servers for drivers that need one
    pub run_server: bool,
    /// How long a server may take to accept connections
    pub server_startup_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            default_max_wait_time: Duration::from_secs(2),
            app_host: None,
            default_host: default_host(),
            reuse_server: true,
            server_name: DEFAULT_SERVER.to_string(),
            server_host: "127.0.0.1".to_string(),
            server_port: None,
            run_server: true,
            server_startup_timeout: Duration::from_secs(10),
        }
    }
}

fn default_host() -> Url {
    Url::parse("http://www.example.com").expect("static default host is a valid url")
}

/// Parse an absolute url with a scheme and a host
fn parse_absolute_url(setting: &str, value: &str) -> Result<Url> {
    match Url::parse(value) {
        Ok(url) if url.has_host() && !url.cannot_be_a_base() => Ok(url),
        _ => Err(Error::invalid_url(setting)),
    }
}

/// Named factories plus configuration
pub struct Registry {
    drivers: RwLock<HashMap<String, DriverFactory>>,
    servers: RwLock<HashMap<String, ServerFactory>>,
    options: RwLock<Options>,
    pool: ServerPool,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut drivers: Vec<_> = self.drivers.read().keys().cloned().collect();
        drivers.sort();
        let mut servers: Vec<_> = self.servers.read().keys().cloned().collect();
        servers.sort();
        f.debug_struct("Registry")
            .field("drivers", &drivers)
            .field("servers", &servers)
            .field("options", &*self.options.read())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create a registry with the built-in drivers and default options
    pub fn new() -> Self {
        let registry = Self::empty();
        let rack_test: DriverFactory = Arc::new(|app: &App| -> Result<Box<dyn Driver>> {
            Ok(Box::new(RackTest::new(app.clone())))
        });
        let http: DriverFactory =
            Arc::new(|_: &App| -> Result<Box<dyn Driver>> { Ok(Box::new(HttpDriver::new()?)) });

        let mut drivers = registry.drivers.write();
        drivers.insert(RackTest::NAME.to_string(), rack_test);
        drivers.insert(HttpDriver::NAME.to_string(), http);
        drop(drivers);
        registry
    }

    /// Create a registry without any registered driver
    pub fn empty() -> Self {
        Self {
            drivers: RwLock::new(HashMap::new()),
            servers: RwLock::new(HashMap::new()),
            options: RwLock::new(Options::default()),
            pool: ServerPool::new(),
        }
    }

    /// The process-wide registry
    pub fn global() -> Arc<Registry> {
        static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Registry::new())).clone()
    }

    // === Drivers ===

    /// Register a driver factory, replacing any previous one with that name
    pub fn register_driver<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&App) -> Result<Box<dyn Driver>> + Send + Sync + 'static,
    {
        validate_name("driver", name)?;
        tracing::debug!(driver = name, "Registering driver");
        self.drivers.write().insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Look up a driver factory
    pub fn driver_factory(&self, name: &str) -> Result<DriverFactory> {
        self.drivers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DriverNotFound {
                name: name.to_string(),
            })
    }

    /// Names of all registered drivers
    pub fn driver_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drivers.read().keys().cloned().collect();
        names.sort();
        names
    }

    // === Servers ===

    /// Register a server factory, replacing any previous one with that name
    ///
    /// Registering under [`DEFAULT_SERVER`] shadows the built-in server.
    pub fn register_server<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&App, u16, &str) -> Result<Box<dyn RunningServer>> + Send + Sync + 'static,
    {
        validate_name("server", name)?;
        tracing::debug!(server = name, "Registering server");
        self.servers.write().insert(name.to_string(), Arc::new(factory));
        Ok(())
    }

    /// Remove a server registration
    ///
    /// Removing [`DEFAULT_SERVER`] only drops a shadowing registration; the
    /// built-in server stays resolvable.
    pub fn unregister_server(&self, name: &str) -> bool {
        self.servers.write().remove(name).is_some()
    }

    /// Look up a server factory, falling back to the built-in default
    pub fn server_factory(&self, name: &str) -> Result<ServerFactory> {
        if let Some(factory) = self.servers.read().get(name) {
            return Ok(factory.clone());
        }
        if name == DEFAULT_SERVER {
            return Ok(Arc::new(
                |app: &App, port: u16, host: &str| -> Result<Box<dyn RunningServer>> {
                    Ok(Box::new(server::default::run_default_server(app, port, host)?))
                },
            ));
        }
        Err(Error::ServerNotFound {
            name: name.to_string(),
        })
    }

    /// Select the active server by name
    pub fn set_server(&self, choice: impl Into<ServerChoice>) -> Result<()> {
        match choice.into() {
            ServerChoice::Inline(_) => Err(Error::argument(
                "server must be selected by name; register the factory with register_server first",
            )),
            ServerChoice::Named(name) => {
                self.server_factory(&name)?;
                tracing::debug!(server = %name, "Selecting server");
                self.options.write().server_name = name;
                Ok(())
            }
        }
    }

    /// Factory of the active server
    pub fn server(&self) -> Result<ServerFactory> {
        let name = self.server_name();
        self.server_factory(&name)
    }

    pub fn server_name(&self) -> String {
        self.options.read().server_name.clone()
    }

    /// Servers started through this registry
    pub fn servers(&self) -> &ServerPool {
        &self.pool
    }

    // === Options ===

    /// Snapshot of the current configuration
    pub fn options(&self) -> Options {
        self.options.read().clone()
    }

    pub fn default_max_wait_time(&self) -> Duration {
        self.options.read().default_max_wait_time
    }

    pub fn set_default_max_wait_time(&self, duration: Duration) {
        self.options.write().default_max_wait_time = duration;
    }

    pub fn app_host(&self) -> Option<Url> {
        self.options.read().app_host.clone()
    }

    /// Set or clear the app host
    ///
    /// `None` and the empty string clear it; anything else must be an
    /// absolute url. The stored value is untouched on error.
    pub fn set_app_host(&self, url: Option<&str>) -> Result<()> {
        let parsed = match url.map(str::trim) {
            None | Some("") => None,
            Some(value) => Some(parse_absolute_url("app_host", value)?),
        };
        self.options.write().app_host = parsed;
        Ok(())
    }

    pub fn default_host(&self) -> Url {
        self.options.read().default_host.clone()
    }

    /// Set the default host; the stored value is untouched on error
    pub fn set_default_host(&self, url: &str) -> Result<()> {
        let parsed = parse_absolute_url("default_host", url.trim())?;
        self.options.write().default_host = parsed;
        Ok(())
    }

    pub fn reuse_server(&self) -> bool {
        self.options.read().reuse_server
    }

    pub fn set_reuse_server(&self, reuse: bool) {
        self.options.write().reuse_server = reuse;
    }

    pub fn server_host(&self) -> String {
        self.options.read().server_host.clone()
    }

    pub fn set_server_host(&self, host: &str) -> Result<()> {
        if host.trim().is_empty() {
            return Err(Error::argument("server_host must not be empty"));
        }
        self.options.write().server_host = host.trim().to_string();
        Ok(())
    }

    pub fn server_port(&self) -> Option<u16> {
        self.options.read().server_port
    }

    pub fn set_server_port(&self, port: Option<u16>) {
        self.options.write().server_port = port;
    }

    pub fn run_server(&self) -> bool {
        self.options.read().run_server
    }

    pub fn set_run_server(&self, run: bool) {
        self.options.write().run_server = run;
    }

    pub fn server_startup_timeout(&self) -> Duration {
        self.options.read().server_startup_timeout
    }

    pub fn set_server_startup_timeout(&self, timeout: Duration) {
        self.options.write().server_startup_timeout = timeout;
    }
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Configuration(format!("{} name must not be empty", kind)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Request, Response};

    fn echo_app() -> App {
        App::new(|_: &Request| Response::html("Hello world!"))
    }

    #[test]
    fn test_builtin_drivers_registered() {
        let registry = Registry::new();
        assert_eq!(registry.driver_names(), vec!["http", "rack_test"]);
        assert!(Registry::empty().driver_names().is_empty());
    }

    #[test]
    fn test_unknown_driver_not_found() {
        let registry = Registry::new();
        registry
            .register_driver("other", |app: &App| {
                Ok(Box::new(RackTest::new(app.clone())) as Box<dyn Driver>)
            })
            .unwrap();

        let err = registry.driver_factory("quox").err().unwrap();
        assert!(matches!(err, Error::DriverNotFound { ref name } if name == "quox"));
    }

    #[test]
    fn test_register_driver_last_write_wins() {
        let registry = Registry::new();
        registry
            .register_driver("custom", |_: &App| Err(Error::Internal("first".into())))
            .unwrap();
        registry
            .register_driver("custom", |_: &App| Err(Error::Internal("second".into())))
            .unwrap();

        let factory = registry.driver_factory("custom").unwrap();
        let err = factory(&echo_app()).err().unwrap();
        assert_eq!(err.to_string(), "Internal error: second");
    }

    #[test]
    fn test_register_driver_rejects_blank_name() {
        let registry = Registry::new();
        let err = registry
            .register_driver("  ", |app: &App| {
                Ok(Box::new(RackTest::new(app.clone())) as Box<dyn Driver>)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_default_server_always_resolves() {
        let registry = Registry::new();
        assert!(registry.server_factory(DEFAULT_SERVER).is_ok());
        assert!(!registry.unregister_server(DEFAULT_SERVER));
        assert!(registry.server_factory(DEFAULT_SERVER).is_ok());
        assert!(matches!(
            registry.server_factory("blob"),
            Err(Error::ServerNotFound { .. })
        ));
    }

    #[test]
    fn test_default_server_can_be_shadowed() {
        let registry = Registry::new();
        registry
            .register_server(DEFAULT_SERVER, |_: &App, _: u16, _: &str| {
                Err(Error::Internal("shadow".into()))
            })
            .unwrap();

        let factory = registry.server_factory(DEFAULT_SERVER).unwrap();
        let err = factory(&echo_app(), 0, "127.0.0.1").err().unwrap();
        assert_eq!(err.to_string(), "Internal error: shadow");

        assert!(registry.unregister_server(DEFAULT_SERVER));
        assert!(registry.server_factory(DEFAULT_SERVER).is_ok());
    }

    #[test]
    fn test_set_server_by_name() {
        let registry = Registry::new();
        registry
            .register_server("custom", |_: &App, _: u16, _: &str| {
                Err(Error::Internal("custom".into()))
            })
            .unwrap();

        registry.set_server("custom").unwrap();
        assert_eq!(registry.server_name(), "custom");
        let err = registry.server().unwrap()(&echo_app(), 0, "127.0.0.1").err().unwrap();
        assert_eq!(err.to_string(), "Internal error: custom");

        assert!(matches!(
            registry.set_server("missing"),
            Err(Error::ServerNotFound { .. })
        ));
        assert_eq!(registry.server_name(), "custom");
    }

    #[test]
    fn test_set_server_rejects_inline_factory() {
        let registry = Registry::new();
        let factory: ServerFactory =
            Arc::new(|_: &App, _: u16, _: &str| -> Result<Box<dyn RunningServer>> {
                Err(Error::Internal("inline".into()))
            });

        let err = registry.set_server(factory).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        assert_eq!(registry.server_name(), DEFAULT_SERVER);
    }

    #[test]
    fn test_default_max_wait_time_round_trip() {
        let registry = Registry::new();
        assert_eq!(registry.default_max_wait_time(), Duration::from_secs(2));
        for value in [Duration::ZERO, Duration::from_millis(1), Duration::from_secs(5)] {
            registry.set_default_max_wait_time(value);
            assert_eq!(registry.default_max_wait_time(), value);
        }
    }

    #[test]
    fn test_app_host_validation() {
        let registry = Registry::new();

        registry.set_app_host(Some("http://www.example.com")).unwrap();
        let previous = registry.app_host();
        assert!(previous.is_some());

        for bad in ["www.example.com", "not-a-url", "mailto:someone@example.com"] {
            let err = registry.set_app_host(Some(bad)).unwrap_err();
            assert!(err.to_string().contains("app_host should be set to a url"));
            assert_eq!(registry.app_host(), previous);
        }

        registry.set_app_host(None).unwrap();
        assert!(registry.app_host().is_none());
        registry.set_app_host(Some("")).unwrap();
        assert!(registry.app_host().is_none());
    }

    #[test]
    fn test_default_host_validation() {
        let registry = Registry::new();
        let previous = registry.default_host();

        let err = registry.set_default_host("www.example.com").unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        assert!(err.to_string().contains("default_host should be set to a url"));
        assert_eq!(registry.default_host(), previous);

        assert!(registry.set_default_host("").is_err());

        registry.set_default_host("http://www.example.org").unwrap();
        assert_eq!(registry.default_host().as_str(), "http://www.example.org/");
    }

    #[test]
    fn test_server_host_must_not_be_empty() {
        let registry = Registry::new();
        assert!(registry.set_server_host(" ").is_err());
        assert_eq!(registry.server_host(), "127.0.0.1");
        registry.set_server_host("localhost").unwrap();
        assert_eq!(registry.options().server_host, "localhost");
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&Registry::global(), &Registry::global()));
    }
}
