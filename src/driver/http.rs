//! Remote driver talking HTTP to a hosted application

use std::time::Duration;

use url::Url;

use super::{blank_url, Driver};
use crate::common::{Error, Result};

/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Snapshot of the last page fetched
struct Page {
    url: Url,
    status: u16,
    body: String,
}

/// Driver fetching pages from a live server
///
/// Needs a server, so sessions start one before the first visit.
pub struct HttpDriver {
    client: reqwest::blocking::Client,
    page: Option<Page>,
}

impl HttpDriver {
    pub const NAME: &'static str = "http";

    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::driver_operation(Self::NAME, "start", e))?;

        Ok(Self { client, page: None })
    }

    fn page(&self, operation: &'static str) -> Result<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| {
                Error::driver_operation(Self::NAME, operation, "no page has been visited")
            })
    }
}

impl Driver for HttpDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn visit(&mut self, url: &Url) -> Result<()> {
        tracing::debug!(%url, "Fetching page");

        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| Error::driver_operation(Self::NAME, "visit", e))?;

        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| Error::driver_operation(Self::NAME, "read response body", e))?;

        self.page = Some(Page {
            url: final_url,
            status,
            body,
        });
        Ok(())
    }

    fn current_url(&self) -> Result<Url> {
        match &self.page {
            Some(page) => Ok(page.url.clone()),
            None => blank_url(),
        }
    }

    fn html(&self) -> Result<String> {
        Ok(self.page("read html")?.body.clone())
    }

    fn needs_server(&self) -> bool {
        true
    }

    fn status_code(&self) -> Result<u16> {
        Ok(self.page("read status code")?.status)
    }

    fn reset(&mut self) {
        self.page = None;
    }
}
