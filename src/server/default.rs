//! Built-in server
//!
//! Runs an axum listener on a dedicated thread with its own tokio runtime
//! and forwards every request to the application.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::Router;
use tokio::sync::oneshot;

use super::RunningServer;
use crate::app::{App, Request, Response};
use crate::common::{Error, Result};

/// How long to wait for the listener thread to bind
const BIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest request body forwarded to the application
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// The built-in server, bound and listening
pub struct DefaultServer {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// Start the built-in server for `app` on `host:port`
///
/// Returns once the listener is bound.
pub fn run_default_server(app: &App, port: u16, host: &str) -> Result<DefaultServer> {
    let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = app.clone();
    let address = format!("{}:{}", host, port);

    let thread = std::thread::Builder::new()
        .name(format!("webprobe-server-{}", port))
        .spawn({
            let address = address.clone();
            move || serve(app, address, ready_tx, shutdown_rx)
        })?;

    match ready_rx.recv_timeout(BIND_TIMEOUT) {
        Ok(Ok(())) => Ok(DefaultServer {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }),
        Ok(Err(reason)) => {
            let _ = thread.join();
            Err(Error::server_startup("default", &address, reason))
        }
        Err(_) => Err(Error::server_startup(
            "default",
            &address,
            format!("listener not bound after {:?}", BIND_TIMEOUT),
        )),
    }
}

fn serve(
    app: App,
    address: String,
    ready: mpsc::Sender<std::result::Result<(), String>>,
    shutdown: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(format!("failed to build runtime: {}", e)));
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::bind(&address).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = ready.send(Err(e.to_string()));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        tracing::debug!(%address, "Default server listening");

        let router = Router::new().fallback(dispatch).with_state(app);
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.await;
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(%address, error = %e, "Default server stopped with error");
        }
    });
}

async fn dispatch(
    State(app): State<App>,
    request: axum::extract::Request,
) -> axum::response::Response {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => return plain(StatusCode::BAD_REQUEST, format!("unreadable request body: {}", e)),
    };

    let request = Request {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
        body,
    };

    into_axum(app.call(&request))
}

fn into_axum(response: Response) -> axum::response::Response {
    let status = match StatusCode::from_u16(response.status) {
        Ok(status) => status,
        Err(_) => {
            return plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("application returned invalid status {}", response.status),
            )
        }
    };

    let mut converted = axum::response::Response::new(Body::from(response.body));
    *converted.status_mut() = status;
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            converted.headers_mut().append(name, value);
        }
    }
    converted
}

fn plain(status: StatusCode, message: String) -> axum::response::Response {
    let mut response = axum::response::Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

impl RunningServer for DefaultServer {
    fn shutdown(&mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| Error::Internal("default server thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for DefaultServer {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
