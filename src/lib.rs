//! webprobe - driver-agnostic acceptance testing for web applications
//!
//! A [`Registry`] maps driver and server names to factories and holds the
//! global options. A [`Session`] binds an application to a named driver,
//! starts a server for it when the driver needs one, and exposes
//! navigation plus waiting assertions built on the [`Waiter`] retry engine.

pub mod app;
pub mod common;
pub mod driver;
pub mod registry;
pub mod server;
pub mod session;
pub mod wait;

pub use app::{App, Application, Request, Response};
pub use common::{Error, Result};
pub use driver::Driver;
pub use registry::{Options, Registry, ServerChoice, DEFAULT_SERVER};
pub use server::{RunningServer, ServerHandle, ServerPool};
pub use session::{Session, SessionState};
pub use wait::{Attempt, CancellationToken, Clock, SystemClock, Waiter};
