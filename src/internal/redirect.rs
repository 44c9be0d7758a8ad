use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use reqwest::Url;
use tracing::info;

/// Host capability for the implicit OAuth redirect.
pub trait Redirect: Send + Sync {
    /// Send the user agent to `url`.
    fn initiate(&self, url: &Url) -> Result<()>;

    /// Return the current location's fragment if it carries an access token,
    /// stripping it from the location so it is only ever captured once.
    fn capture_fragment_once(&self) -> Option<String>;
}

/// Opens the system browser and keeps the location the user landed on.
///
/// A terminal has no address bar, so the host hands the callback url to
/// [`BrowserRedirect::land`] once the user has approved access.
#[derive(Default)]
pub struct BrowserRedirect {
    location: Mutex<Option<Url>>,
}

impl BrowserRedirect {
    pub fn new(location: Option<Url>) -> Self {
        Self {
            location: Mutex::new(location),
        }
    }

    pub fn land(&self, location: Url) {
        *self.location.lock().unwrap_or_else(PoisonError::into_inner) = Some(location);
    }

    pub fn location(&self) -> Option<Url> {
        self.location
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Redirect for BrowserRedirect {
    fn initiate(&self, url: &Url) -> Result<()> {
        info!(host = ?url.host_str(), "opening authorization page");
        open::that(url.as_str()).context("Failed to open the authorization page")
    }

    fn capture_fragment_once(&self) -> Option<String> {
        let mut location = self.location.lock().unwrap_or_else(PoisonError::into_inner);
        let url = location.as_mut()?;
        let fragment = url.fragment()?.to_string();
        if !fragment.contains("access_token") {
            return None;
        }
        url.set_fragment(None);
        info!("captured access token fragment and cleared it from the location");
        Some(fragment)
    }
}
