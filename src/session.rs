//! Sessions: the handle test code drives
//!
//! A session binds one application to one driver. Construction only records
//! what to use; the driver is resolved on first use and cached until the
//! session switches driver or resets.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::app::App;
use crate::common::{Error, Result};
use crate::driver::Driver;
use crate::registry::Registry;
use crate::server::ServerHandle;
use crate::wait::{Attempt, CancellationToken, Waiter};

/// Session binding state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No driver instantiated yet
    Unbound,
    /// A driver instance is active
    Bound,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbound => write!(f, "unbound"),
            Self::Bound => write!(f, "bound"),
        }
    }
}

/// Test-facing handle over a driver and an application
pub struct Session {
    /// Source of factories and configuration
    registry: Arc<Registry>,
    /// Application under test
    app: App,
    /// Name the driver is resolved under
    driver_name: String,
    /// Resolved driver, if bound
    driver: Option<Box<dyn Driver>>,
    /// Server hosting the application, for drivers that need one
    server: Option<Arc<ServerHandle>>,
    /// Last url a driver reported
    last_url: Option<Url>,
    /// Wait time override from `using_wait_time`
    wait_time: Option<Duration>,
    /// Cancels waits in progress
    cancel: CancellationToken,
}

impl Session {
    /// Create a session against the global registry
    pub fn new(driver_name: &str, app: App) -> Self {
        Self::with_registry(Registry::global(), driver_name, app)
    }

    /// Create a session against an explicit registry
    pub fn with_registry(registry: Arc<Registry>, driver_name: &str, app: App) -> Self {
        Self {
            registry,
            app,
            driver_name: driver_name.to_string(),
            driver: None,
            server: None,
            last_url: None,
            wait_time: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        if self.driver.is_some() {
            SessionState::Bound
        } else {
            SessionState::Unbound
        }
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Server bound to this session, if any
    pub fn server(&self) -> Option<&Arc<ServerHandle>> {
        self.server.as_ref()
    }

    /// Last url reported by a driver; survives driver switches
    pub fn last_url(&self) -> Option<&Url> {
        self.last_url.as_ref()
    }

    /// The bound driver, resolving it on first use
    ///
    /// A resolution failure leaves the session unbound.
    pub fn driver(&mut self) -> Result<&mut dyn Driver> {
        if self.driver.is_none() {
            let factory = self.registry.driver_factory(&self.driver_name)?;
            let driver = factory(&self.app)?;
            tracing::debug!(
                driver = %self.driver_name,
                state = %SessionState::Bound,
                "Driver resolved"
            );
            self.driver = Some(driver);
        }
        match self.driver.as_deref_mut() {
            Some(driver) => Ok(driver),
            None => Err(Error::Internal("driver slot empty after resolution".to_string())),
        }
    }

    /// Start or reuse a server when the driver needs one
    fn ensure_server(&mut self) -> Result<()> {
        if let Some(server) = &self.server {
            if server.is_live() {
                return Ok(());
            }
            tracing::debug!(
                server = %server.server_name(),
                port = server.port(),
                "Bound server stopped, acquiring again"
            );
            self.server = None;
        }
        if !self.registry.run_server() {
            return Ok(());
        }
        if !self.driver()?.needs_server() {
            return Ok(());
        }

        let name = self.registry.server_name();
        let port = self.registry.server_port();
        let handle = self
            .registry
            .servers()
            .acquire(&self.registry, &self.app, &name, port)?;
        self.server = Some(handle);
        Ok(())
    }

    /// Turn a visit argument into an absolute url
    ///
    /// Absolute http(s) urls pass through. Paths are appended to the app
    /// host, else the bound server, else the default host.
    fn resolve_url(&self, path: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(path) {
            if matches!(url.scheme(), "http" | "https") {
                return Ok(url);
            }
        }

        let base = match (self.registry.app_host(), &self.server) {
            (Some(app_host), _) => app_host,
            (None, Some(server)) => server.base_url()?,
            (None, None) => self.registry.default_host(),
        };
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path);
        Url::parse(&joined)
            .map_err(|e| Error::argument(format!("cannot visit '{}': {}", joined, e)))
    }

    /// Navigate to `path`
    #[tracing::instrument(skip(self), fields(driver = %self.driver_name))]
    pub fn visit(&mut self, path: &str) -> Result<()> {
        self.ensure_server()?;
        let url = self.resolve_url(path)?;
        tracing::debug!(%url, "Visiting");

        let driver = self.driver()?;
        driver.visit(&url)?;
        let current = driver.current_url()?;
        self.last_url = Some(current);
        Ok(())
    }

    /// Url of the current page, read from the driver
    pub fn current_url(&mut self) -> Result<Url> {
        let url = self.driver()?.current_url()?;
        if url.has_host() {
            self.last_url = Some(url.clone());
        }
        Ok(url)
    }

    /// Path of the current page
    pub fn current_path(&mut self) -> Result<String> {
        Ok(self.current_url()?.path().to_string())
    }

    /// Markup of the current page
    pub fn body(&mut self) -> Result<String> {
        self.driver()?.html()
    }

    /// Alias of [`Session::body`]
    pub fn html(&mut self) -> Result<String> {
        self.body()
    }

    pub fn status_code(&mut self) -> Result<u16> {
        self.driver()?.status_code()
    }

    /// Rebind to another driver
    ///
    /// The resolved driver and any server it needed are dropped; the
    /// application and last url are kept.
    pub fn switch_driver(&mut self, name: &str) {
        tracing::debug!(
            from = %self.driver_name,
            to = name,
            state = %SessionState::Unbound,
            "Switching driver"
        );
        self.driver = None;
        self.release_server();
        self.driver_name = name.to_string();
    }

    /// Forget all navigation state and unbind the driver
    pub fn reset(&mut self) {
        if let Some(driver) = self.driver.as_mut() {
            driver.reset();
        }
        tracing::debug!(
            driver = %self.driver_name,
            state = %SessionState::Unbound,
            "Session reset"
        );
        self.driver = None;
        self.release_server();
        self.last_url = None;
    }

    fn release_server(&mut self) {
        if let Some(server) = self.server.take() {
            if let Err(e) = self.registry.servers().release(&server) {
                tracing::warn!(
                    server = %server.server_name(),
                    error = %e,
                    "Failed to release server"
                );
            }
        }
    }

    // === Waiting ===

    /// Deadline used by [`Session::synchronize`]
    pub fn wait_time(&self) -> Duration {
        self.wait_time
            .unwrap_or_else(|| self.registry.default_max_wait_time())
    }

    /// Run `f` with a different wait time, restoring the previous one after
    ///
    /// The previous wait time is restored even if `f` panics.
    pub fn using_wait_time<R>(
        &mut self,
        wait_time: Duration,
        f: impl FnOnce(&mut Session) -> R,
    ) -> R {
        let previous = self.wait_time.replace(wait_time);
        let mut guard = WaitTimeGuard {
            session: self,
            previous,
        };
        f(&mut *guard.session)
    }

    /// Token that cancels this session's waits
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    /// Retry `check` against this session for the current wait time
    pub fn synchronize<T, F>(&mut self, check: F) -> Result<T>
    where
        F: FnMut(&mut Session) -> Attempt<T>,
    {
        let wait_time = self.wait_time();
        self.synchronize_for(wait_time, check)
    }

    /// Retry `check` against this session for `deadline`
    pub fn synchronize_for<T, F>(&mut self, deadline: Duration, mut check: F) -> Result<T>
    where
        F: FnMut(&mut Session) -> Attempt<T>,
    {
        let waiter = Waiter::new().with_cancellation(self.cancel.clone());
        waiter.retry_until(deadline, || check(self))
    }

    /// Wait until the page contains `text`
    pub fn assert_text(&mut self, text: &str) -> Result<()> {
        self.synchronize(|session| match session.body() {
            Ok(body) if body.contains(text) => Attempt::Ready(()),
            Ok(_) => Attempt::not_yet(format!("expected to find text {:?}", text)),
            Err(e) => Attempt::Fatal(e),
        })
    }

    /// Wait until the page no longer contains `text`
    pub fn assert_no_text(&mut self, text: &str) -> Result<()> {
        self.synchronize(|session| match session.body() {
            Ok(body) if !body.contains(text) => Attempt::Ready(()),
            Ok(_) => Attempt::not_yet(format!("expected not to find text {:?}", text)),
            Err(e) => Attempt::Fatal(e),
        })
    }

    /// Wait until the current path equals `path`
    pub fn assert_current_path(&mut self, path: &str) -> Result<()> {
        self.synchronize(|session| match session.current_path() {
            Ok(current) if current == path => Attempt::Ready(()),
            Ok(current) => Attempt::not_yet(format!(
                "expected current path to be {:?} but was {:?}",
                path, current
            )),
            Err(e) => Attempt::Fatal(e),
        })
    }
}

/// Puts back the wait time replaced by [`Session::using_wait_time`]
struct WaitTimeGuard<'a> {
    session: &'a mut Session,
    previous: Option<Duration>,
}

impl Drop for WaitTimeGuard<'_> {
    fn drop(&mut self) {
        self.session.wait_time = self.previous;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("driver_name", &self.driver_name)
            .field("state", &self.state())
            .field("app", &self.app)
            .field("server", &self.server)
            .field("last_url", &self.last_url.as_ref().map(Url::as_str))
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.driver = None;
        self.release_server();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{Request, Response};
    use crate::driver::rack_test::RackTest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Driver whose page finishes rendering after a number of reads
    struct Rendering {
        reads: AtomicUsize,
        ready_after: usize,
        url: Option<Url>,
    }

    impl Driver for Rendering {
        fn name(&self) -> &str {
            "rendering"
        }

        fn visit(&mut self, url: &Url) -> Result<()> {
            self.url = Some(url.clone());
            Ok(())
        }

        fn current_url(&self) -> Result<Url> {
            self.url.clone().map_or_else(crate::driver::blank_url, Ok)
        }

        fn html(&self) -> Result<String> {
            let reads = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if reads >= self.ready_after {
                Ok("<p>Loaded</p>".to_string())
            } else {
                Ok("<p>Loading...</p>".to_string())
            }
        }
    }

    fn hello() -> App {
        App::new(|request: &Request| match request.path.as_str() {
            "/" => Response::html("Hello world!"),
            "/old" => Response::redirect("/new"),
            other => Response::html(format!("page {}", other)),
        })
    }

    fn rack_test_session() -> Session {
        Session::with_registry(Arc::new(Registry::new()), RackTest::NAME, hello())
    }

    fn registry_with_rendering(ready_after: usize) -> Arc<Registry> {
        let registry = Registry::new();
        registry
            .register_driver("rendering", move |_: &App| {
                Ok(Box::new(Rendering {
                    reads: AtomicUsize::new(0),
                    ready_after,
                    url: None,
                }) as Box<dyn Driver>)
            })
            .unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_construction_is_lazy() {
        let mut session = Session::with_registry(Arc::new(Registry::new()), "quox", hello());
        assert_eq!(session.state(), SessionState::Unbound);

        let err = session.driver().err().unwrap();
        assert!(matches!(err, Error::DriverNotFound { .. }));
        assert_eq!(session.state(), SessionState::Unbound);
        assert!(matches!(session.visit("/"), Err(Error::DriverNotFound { .. })));
    }

    #[test]
    fn test_visit_and_body() {
        let mut session = rack_test_session();
        session.visit("/").unwrap();
        assert_eq!(session.state(), SessionState::Bound);
        assert_eq!(session.body().unwrap(), "Hello world!");
        assert_eq!(session.current_url().unwrap().as_str(), "http://www.example.com/");
        assert_eq!(session.status_code().unwrap(), 200);
        assert!(session.server().is_none());
    }

    #[test]
    fn test_visit_uses_app_host_then_default_host() {
        let registry = Arc::new(Registry::new());
        registry.set_default_host("http://default.test").unwrap();
        let mut session = Session::with_registry(registry.clone(), RackTest::NAME, hello());

        session.visit("page").unwrap();
        assert_eq!(session.current_url().unwrap().as_str(), "http://default.test/page");

        registry.set_app_host(Some("http://app.test/prefix/")).unwrap();
        session.visit("/page").unwrap();
        assert_eq!(
            session.current_url().unwrap().as_str(),
            "http://app.test/prefix/page"
        );

        session.visit("https://elsewhere.test/x").unwrap();
        assert_eq!(session.current_path().unwrap(), "/x");
    }

    #[test]
    fn test_redirect_updates_last_url() {
        let mut session = rack_test_session();
        session.visit("/old").unwrap();
        assert_eq!(session.last_url().map(Url::path), Some("/new"));
        assert_eq!(session.body().unwrap(), "page /new");
    }

    #[test]
    fn test_switch_driver_keeps_navigation_state() {
        let registry = registry_with_rendering(1);
        let mut session = Session::with_registry(registry, RackTest::NAME, hello());
        session.visit("/somewhere").unwrap();
        let before = session.last_url().cloned();

        session.switch_driver("rendering");
        assert_eq!(session.state(), SessionState::Unbound);
        assert_eq!(session.driver_name(), "rendering");
        assert_eq!(session.last_url().cloned(), before);

        assert_eq!(session.driver().unwrap().name(), "rendering");
        assert_eq!(session.state(), SessionState::Bound);
    }

    #[test]
    fn test_switch_to_unknown_driver() {
        let mut session = rack_test_session();
        session.visit("/").unwrap();
        session.switch_driver("quox");
        assert!(matches!(session.body(), Err(Error::DriverNotFound { .. })));
        assert_eq!(session.state(), SessionState::Unbound);
    }

    #[test]
    fn test_reset_clears_navigation() {
        let mut session = rack_test_session();
        session.visit("/").unwrap();
        session.reset();
        assert_eq!(session.state(), SessionState::Unbound);
        assert!(session.last_url().is_none());
        assert_eq!(session.current_url().unwrap().as_str(), "about:blank");
    }

    #[test]
    fn test_resolved_driver_outlives_reregistration() {
        let registry = registry_with_rendering(1);
        let mut session = Session::with_registry(registry.clone(), "rendering", hello());
        session.driver().unwrap();

        registry
            .register_driver("rendering", |app: &App| {
                Ok(Box::new(RackTest::new(app.clone())) as Box<dyn Driver>)
            })
            .unwrap();
        assert_eq!(session.driver().unwrap().name(), "rendering");

        session.switch_driver("rendering");
        assert_eq!(session.driver().unwrap().name(), RackTest::NAME);
    }

    #[test]
    fn test_assert_text_waits_for_rendering() {
        let registry = registry_with_rendering(3);
        let mut session = Session::with_registry(registry, "rendering", hello());
        session.visit("/").unwrap();
        session.assert_text("Loaded").unwrap();
    }

    #[test]
    fn test_assert_text_times_out_with_reason() {
        let registry = registry_with_rendering(usize::MAX);
        registry.set_default_max_wait_time(Duration::from_millis(30));
        let mut session = Session::with_registry(registry, "rendering", hello());
        session.visit("/").unwrap();

        let err = session.assert_text("Loaded").unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err.last_reason(), Some(Error::ExpectationNotMet(_))));
    }

    #[test]
    fn test_assert_text_before_visit_is_fatal() {
        let mut session = rack_test_session();
        let err = session.assert_text("Hello").unwrap_err();
        assert!(matches!(err, Error::DriverOperation { .. }));
    }

    #[test]
    fn test_assert_no_text_and_current_path() {
        let mut session = rack_test_session();
        session.visit("/old").unwrap();
        session.assert_current_path("/new").unwrap();
        session.assert_no_text("Hello").unwrap();

        let err = session
            .using_wait_time(Duration::ZERO, |s| s.assert_current_path("/old"))
            .unwrap_err();
        assert!(matches!(err, Error::WaitTimeout { attempts: 1, .. }));
    }

    #[test]
    fn test_using_wait_time_restores_previous() {
        let registry = Arc::new(Registry::new());
        registry.set_default_max_wait_time(Duration::from_secs(3));
        let mut session = Session::with_registry(registry, RackTest::NAME, hello());

        let inner = session.using_wait_time(Duration::from_millis(10), |s| {
            s.using_wait_time(Duration::from_millis(20), |s| s.wait_time())
        });
        assert_eq!(inner, Duration::from_millis(20));
        assert_eq!(session.wait_time(), Duration::from_secs(3));
    }

    #[test]
    fn test_using_wait_time_restores_after_panic() {
        let registry = Arc::new(Registry::new());
        registry.set_default_max_wait_time(Duration::from_secs(3));
        let mut session = Session::with_registry(registry, RackTest::NAME, hello());

        let outcome: std::thread::Result<()> =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                session.using_wait_time(Duration::from_millis(5), |s| {
                    assert_eq!(s.wait_time(), Duration::from_millis(5));
                    panic!("check blew up");
                })
            }));

        assert!(outcome.is_err());
        assert_eq!(session.wait_time(), Duration::from_secs(3));
    }

    #[test]
    fn test_stopped_server_is_acquired_again() {
        let registry = Arc::new(Registry::new());
        let mut session = Session::with_registry(registry.clone(), "http", hello());
        session.visit("/").unwrap();
        let first = session.server().cloned().unwrap();

        registry.servers().shutdown_all().unwrap();
        assert!(!first.is_live());

        session.visit("/").unwrap();
        let second = session.server().cloned().unwrap();
        assert!(second.is_live());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(session.body().unwrap(), "Hello world!");
        assert_eq!(session.current_url().unwrap().port(), Some(second.port()));

        registry.servers().shutdown_all().unwrap();
    }

    #[test]
    fn test_cancelled_session_wait() {
        let registry = registry_with_rendering(usize::MAX);
        let mut session = Session::with_registry(registry, "rendering", hello());
        session.visit("/").unwrap();
        session.cancellation().cancel();

        let err = session.assert_text("Loaded").unwrap_err();
        assert!(matches!(err, Error::WaitCancelled { .. }));

        session.set_cancellation(CancellationToken::new());
        let err = session
            .using_wait_time(Duration::ZERO, |s| s.assert_text("Loaded"))
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
