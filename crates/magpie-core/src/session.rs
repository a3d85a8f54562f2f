//! Browser session lifecycle management
//!
//! Owns exactly one browser process, one context, and one page per
//! extraction attempt. Discovery tries the primary engine and at least
//! one alternate before giving up; teardown is idempotent and, on
//! constrained platforms, backed by forced process cleanup.

use crate::download::SessionCookie;
use crate::platform::PlatformProfile;
use crate::{MagpieError, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Desktop-class user agent presented to the target site.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0) Gecko/20100101 Firefox/120.0";

/// Settling delay between close and re-open during reinitialization.
const REINIT_SETTLE: Duration = Duration::from_secs(2);

/// A live browser session: one browser, one page.
///
/// Exclusive owner of its handles; nothing may keep a page reference
/// past `close()`.
pub struct BrowserSession {
    browser: Option<Browser>,
    handler_task: Option<JoinHandle<()>>,
    page: Option<Page>,
    binary: PathBuf,
    profile: PlatformProfile,
}

impl BrowserSession {
    /// Launch a browser and open a blank page using the platform
    /// profile's configuration.
    pub async fn open(profile: &PlatformProfile) -> Result<Self> {
        let binary = find_browser_binary().ok_or_else(|| {
            MagpieError::SessionInit(
                "no Chrome or Chromium engine found (install chromium or google-chrome)"
                    .to_string(),
            )
        })?;
        info!(binary = %binary.display(), "launching browser");

        let config = build_config(&binary, profile)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| MagpieError::SessionInit(format!("browser launch failed: {}", e)))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        // A partial failure here still leaves `close()` safe to call.
        let page = match browser.new_page("about:blank").await {
            Ok(p) => p,
            Err(e) => {
                let mut session = Self {
                    browser: Some(browser),
                    handler_task: Some(handler_task),
                    page: None,
                    binary,
                    profile: profile.clone(),
                };
                session.close().await;
                return Err(MagpieError::SessionInit(format!(
                    "could not open page: {}",
                    e
                )));
            }
        };
        if let Err(e) = page.set_user_agent(USER_AGENT).await {
            debug!("set_user_agent failed (continuing): {}", e);
        }

        Ok(Self {
            browser: Some(browser),
            handler_task: Some(handler_task),
            page: Some(page),
            binary,
            profile: profile.clone(),
        })
    }

    /// The session's single page.
    pub fn page(&self) -> Result<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| MagpieError::SessionInit("session is closed".to_string()))
    }

    /// The underlying browser, for target enumeration.
    pub fn browser(&self) -> Result<&Browser> {
        self.browser
            .as_ref()
            .ok_or_else(|| MagpieError::SessionInit("session is closed".to_string()))
    }

    pub fn profile(&self) -> &PlatformProfile {
        &self.profile
    }

    /// Capture the page's current cookies so the download client can
    /// present them to hosts that validate against the player session.
    pub async fn cookies(&self) -> Result<Vec<SessionCookie>> {
        let cookies = self
            .page()?
            .get_cookies()
            .await
            .map_err(|e| MagpieError::Acquisition(format!("cookie capture failed: {}", e)))?;
        Ok(cookies
            .into_iter()
            .map(|c| SessionCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
            })
            .collect())
    }

    /// Release page, browser, and handler in that order. Safe to call
    /// repeatedly and after a partial `open()`.
    pub async fn close(&mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("page close failed: {}", e);
            }
        }
        if let Some(browser) = self.browser.take() {
            // Dropping the browser ends the CDP connection and lets the
            // child process exit.
            drop(browser);
        }
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
        if self.profile.force_process_cleanup {
            self.kill_leftover_processes().await;
        }
    }

    /// Close, settle, and open a fresh session in place. Used by the
    /// supervisor between pipeline attempts, never by extraction logic.
    pub async fn reinitialize(&mut self) -> Result<()> {
        info!("reinitializing browser session");
        self.close().await;
        tokio::time::sleep(REINIT_SETTLE).await;
        let profile = self.profile.clone();
        *self = Self::open(&profile).await?;
        Ok(())
    }

    /// Constrained platforms occasionally leave orphaned renderer
    /// processes behind a graceful close; terminate them by name.
    async fn kill_leftover_processes(&self) {
        let Some(name) = self.binary.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        debug!(process = name, "forcing leftover browser process cleanup");
        match tokio::process::Command::new("pkill")
            .arg("-f")
            .arg(name)
            .output()
            .await
        {
            Ok(_) => {}
            Err(e) => debug!("pkill unavailable: {}", e),
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        // Async close may already have run; dropping remaining handles
        // is enough to terminate the child process.
        if let Some(task) = self.handler_task.take() {
            task.abort();
        }
    }
}

fn build_config(binary: &Path, profile: &PlatformProfile) -> Result<BrowserConfig> {
    let (width, height) = profile.viewport;
    let mut builder = BrowserConfig::builder()
        .chrome_executable(binary)
        .no_sandbox()
        .window_size(width, height)
        .arg("--disable-dev-shm-usage")
        .arg("--mute-audio")
        .arg("--disable-extensions");

    if profile.is_constrained() {
        // Skip GPU paths entirely on boards without usable acceleration.
        builder = builder
            .arg("--disable-gpu")
            .arg("--disable-software-rasterizer")
            .arg("--disable-accelerated-video-decode");
    }

    builder
        .build()
        .map_err(|e| MagpieError::SessionInit(format!("browser config: {}", e)))
}

/// Engine binaries in preference order: primary (Google Chrome)
/// first, then the Chromium alternate.
const ENGINE_NAMES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

/// Install locations that are typically not on `$PATH`.
const ENGINE_LOCATIONS: &[&str] = &[
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

/// Find a usable browser engine, trying each known engine on `$PATH`
/// before falling back to off-path install locations.
pub fn find_browser_binary() -> Option<PathBuf> {
    for name in ENGINE_NAMES {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }
    ENGINE_LOCATIONS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_browser_binary_does_not_panic() {
        let _result = find_browser_binary();
    }

    #[test]
    fn config_builds_for_both_profiles() {
        let binary = PathBuf::from("/usr/bin/chromium");
        assert!(build_config(&binary, &PlatformProfile::desktop()).is_ok());
        assert!(build_config(&binary, &PlatformProfile::constrained()).is_ok());
    }

    #[tokio::test]
    async fn reinitialize_yields_usable_session() {
        if find_browser_binary().is_none() {
            // No engine on this host; nothing to cycle.
            return;
        }
        let mut session = BrowserSession::open(&PlatformProfile::desktop())
            .await
            .unwrap();
        session.reinitialize().await.unwrap();
        assert!(session.page().is_ok());
        assert!(session.browser().is_ok());
        session.close().await;
        assert!(session.page().is_err());
    }

    #[tokio::test]
    async fn open_without_engine_is_session_init_error() {
        if find_browser_binary().is_some() {
            // Host has a browser; the failure path is not reachable here.
            return;
        }
        let err = BrowserSession::open(&PlatformProfile::desktop())
            .await
            .err()
            .expect("open must fail without an engine");
        assert!(matches!(err, MagpieError::SessionInit(_)));
    }
}
