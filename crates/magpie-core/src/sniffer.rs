//! Passive network sniffing
//!
//! Media URLs are never exposed in the page markup; they only show up
//! as network traffic once the player's JavaScript runs. The sniffer
//! attaches CDP request/response listeners to the page, classifies
//! every observed URL by media-format signature, and accumulates the
//! matches into a deduplicated, order-preserving candidate set.

use crate::providers::{is_ad_url, Provider};
use crate::{MagpieError, Result};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventRequestWillBeSent, EventResponseReceived,
};
use chromiumoxide::cdp::browser_protocol::target::SetAutoAttachParams;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Format classification of a discovered URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    /// HLS playlist (`.m3u8` manifest referencing segments).
    Playlist,
    /// Single progressive file (whole-file MP4).
    Progressive,
}

/// Where a candidate URL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Observed as network traffic.
    Sniffed,
    /// Harvested from a `video` element after direct navigation.
    DirectPage,
    /// Harvested while scanning embedded frames.
    FrameScan,
    /// Matched by regex against the page source.
    PageSourceRegex,
}

/// A discovered media URL with its classification and provenance.
#[derive(Debug, Clone)]
pub struct CandidateUrl {
    pub url: String,
    pub format: MediaFormat,
    pub provenance: Provenance,
}

/// Classify a URL by media-format signature, if it has one.
pub fn classify_media_url(url: &str) -> Option<MediaFormat> {
    let lower = url.to_ascii_lowercase();
    if lower.contains(".m3u8") {
        Some(MediaFormat::Playlist)
    } else if lower.contains(".mp4") {
        Some(MediaFormat::Progressive)
    } else {
        None
    }
}

/// Deduplicated candidate list, insertion order = discovery order.
#[derive(Default)]
pub struct CandidateSet {
    inner: Mutex<Vec<CandidateUrl>>,
}

impl CandidateSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert a candidate. Duplicates (exact string equality) are
    /// dropped regardless of provenance. Returns whether it was new.
    pub fn insert(&self, candidate: CandidateUrl) -> bool {
        let mut inner = self.inner.lock().expect("candidate set poisoned");
        if inner.iter().any(|c| c.url == candidate.url) {
            return false;
        }
        debug!(url = %candidate.url, ?candidate.format, "media URL discovered");
        inner.push(candidate);
        true
    }

    /// Classify and insert a raw URL, applying the provider filter.
    pub fn observe(&self, url: &str, provenance: Provenance, filter: Option<Provider>) -> bool {
        let Some(format) = classify_media_url(url) else {
            return false;
        };
        if is_ad_url(url) {
            trace!(%url, "ignoring ad/tracking URL");
            return false;
        }
        if let Some(provider) = filter {
            if !provider.accepts_url(url) {
                trace!(%url, %provider, "URL rejected by provider allow-list");
                return false;
            }
        }
        self.insert(CandidateUrl {
            url: url.to_string(),
            format,
            provenance,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("candidate set poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("candidate set poisoned").len()
    }

    /// Snapshot of the current candidates in discovery order.
    pub fn snapshot(&self) -> Vec<CandidateUrl> {
        self.inner.lock().expect("candidate set poisoned").clone()
    }
}

/// Network listeners across every target of one browsing session.
///
/// The player embeds are cross-origin iframes, which run as separate
/// CDP targets whose network events never reach the main page's
/// session. The sniffer therefore tracks targets by id: the main page
/// is attached up front, auto-attach routes out-of-process frame
/// sessions through the same connection, and `sweep` picks up any
/// target created later in the session's lifetime. Listener
/// registration and removal are symmetric: `detach` (or Drop) aborts
/// every listener task, so a superseding sniffer never observes the
/// same traffic twice.
pub struct NetworkSniffer {
    set: Arc<CandidateSet>,
    filter: Option<Provider>,
    seen_targets: HashSet<String>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl NetworkSniffer {
    pub fn new(set: Arc<CandidateSet>, filter: Option<Provider>) -> Self {
        Self {
            set,
            filter,
            seen_targets: HashSet::new(),
            tasks: Vec::new(),
        }
    }

    /// Attach request and response listeners to one page target.
    ///
    /// Both event streams are watched: some hosts serve media over
    /// requests that never produce an observable response event and
    /// vice versa. Already-attached targets are skipped; returns
    /// whether this target was new.
    pub async fn attach_page(&mut self, page: &Page) -> Result<bool> {
        if !self.track_target(page.target_id().as_ref()) {
            return Ok(false);
        }

        page.execute(EnableParams::default())
            .await
            .map_err(|e| MagpieError::Other(format!("network domain enable failed: {}", e)))?;

        // Route sessions of out-of-process frames through this target's
        // connection so their traffic is observable too.
        let auto_attach = SetAutoAttachParams::builder()
            .auto_attach(true)
            .wait_for_debugger_on_start(false)
            .flatten(true)
            .build()
            .map_err(MagpieError::Other)?;
        if let Err(e) = page.execute(auto_attach).await {
            debug!("auto-attach unavailable: {}", e);
        }

        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|e| MagpieError::Other(format!("request listener failed: {}", e)))?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| MagpieError::Other(format!("response listener failed: {}", e)))?;

        let filter = self.filter;
        let request_set = self.set.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                request_set.observe(&event.request.url, Provenance::Sniffed, filter);
            }
        }));

        let response_set = self.set.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                response_set.observe(&event.response.url, Provenance::Sniffed, filter);
            }
        }));

        Ok(true)
    }

    /// Attach to every page target the browser currently knows that
    /// has not been seen yet. Called at phase boundaries and during the
    /// settle wait, so targets created after the initial attach (player
    /// popups, late frames) are observed as well.
    pub async fn sweep(&mut self, browser: &Browser) -> Result<usize> {
        let pages = browser
            .pages()
            .await
            .map_err(|e| MagpieError::Other(format!("target enumeration failed: {}", e)))?;
        let mut added = 0;
        for page in &pages {
            if self.attach_page(page).await? {
                added += 1;
            }
        }
        if added > 0 {
            debug!(added, "attached sniffer to new targets");
        }
        Ok(added)
    }

    /// Record a target id; false if it was already tracked.
    fn track_target(&mut self, target_id: &str) -> bool {
        self.seen_targets.insert(target_id.to_string())
    }

    /// Abort the listener tasks.
    pub fn detach(mut self) {
        self.abort_all();
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for NetworkSniffer {
    fn drop(&mut self) {
        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_signature() {
        assert_eq!(
            classify_media_url("https://cdn.x/master.m3u8?token=1"),
            Some(MediaFormat::Playlist)
        );
        assert_eq!(
            classify_media_url("https://cdn.x/video.MP4"),
            Some(MediaFormat::Progressive)
        );
        assert_eq!(classify_media_url("https://cdn.x/app.js"), None);
    }

    #[test]
    fn set_deduplicates_across_listeners() {
        let set = CandidateSet::new();
        // Same URL observed by both the request and the response listener.
        assert!(set.observe("https://cdn.x/a.m3u8", Provenance::Sniffed, None));
        assert!(!set.observe("https://cdn.x/a.m3u8", Provenance::Sniffed, None));
        // And again with a different provenance.
        assert!(!set.observe("https://cdn.x/a.m3u8", Provenance::FrameScan, None));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn discovery_order_is_preserved() {
        let set = CandidateSet::new();
        set.observe("https://cdn.x/1.mp4", Provenance::Sniffed, None);
        set.observe("https://cdn.x/2.m3u8", Provenance::Sniffed, None);
        set.observe("https://cdn.x/3.mp4", Provenance::DirectPage, None);
        let urls: Vec<_> = set.snapshot().into_iter().map(|c| c.url).collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.x/1.mp4",
                "https://cdn.x/2.m3u8",
                "https://cdn.x/3.mp4"
            ]
        );
    }

    #[test]
    fn strict_provider_filter_applies() {
        let set = CandidateSet::new();
        // Ad URL with a media signature, observed during a TAP run.
        assert!(!set.observe(
            "https://sync.popads.example/promo.mp4",
            Provenance::Sniffed,
            Some(Provider::Tap)
        ));
        // Non-streamtape host is rejected too.
        assert!(!set.observe(
            "https://cdn.elsewhere.com/video.mp4",
            Provenance::Sniffed,
            Some(Provider::Tap)
        ));
        assert!(set.observe(
            "https://streamtape.com/get_video?stream=x.mp4",
            Provenance::Sniffed,
            Some(Provider::Tap)
        ));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn each_target_is_attached_once() {
        let mut sniffer = NetworkSniffer::new(CandidateSet::new(), None);
        // Main page, then the same target rediscovered by a sweep.
        assert!(sniffer.track_target("AAAA-0001"));
        assert!(!sniffer.track_target("AAAA-0001"));
        // A player iframe target created later is new.
        assert!(sniffer.track_target("BBBB-0002"));
    }

    #[test]
    fn non_media_urls_are_ignored() {
        let set = CandidateSet::new();
        assert!(!set.observe("https://cdn.x/logo.png", Provenance::Sniffed, None));
        assert!(set.is_empty());
    }
}
