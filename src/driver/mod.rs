//! Driver capability
//!
//! A driver performs the actual interaction with the application under
//! test. Sessions only ever talk to the [`Driver`] trait; variants differ
//! in transport and are picked by the factory registered under a name.

pub mod http;

use url::Url;

use crate::common::{Error, Result};

/// Page shown before the first navigation
pub const BLANK_PAGE: &str = "about:blank";

/// Uniform interface over every transport
///
/// Implementations wrap every transport failure in
/// [`Error::DriverOperation`] and never retry on their own.
pub trait Driver: Send {
    /// Name used in error messages
    fn name(&self) -> &str;

    /// Navigate to an absolute url
    fn visit(&mut self, url: &Url) -> Result<()>;

    /// Url of the current page, [`BLANK_PAGE`] before any navigation
    fn current_url(&self) -> Result<Url>;

    /// Markup of the current page
    fn html(&self) -> Result<String>;

    /// Whether the application must be hosted on a live HTTP endpoint
    fn needs_server(&self) -> bool {
        false
    }

    /// Status code of the last response
    fn status_code(&self) -> Result<u16> {
        Err(Error::not_supported(self.name(), "status_code"))
    }

    /// Forget all navigation state
    fn reset(&mut self) {}
}

/// Url reported before any navigation
pub(crate) fn blank_url() -> Result<Url> {
    Url::parse(BLANK_PAGE).map_err(|e| Error::Internal(format!("Invalid blank page url: {}", e)))
}
