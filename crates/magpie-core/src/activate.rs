//! Source activation state machine
//!
//! Steers the page toward a requested hosting provider by locating its
//! selection control, then either navigating the control's link target
//! or clicking it. Locator strategies are ranked and tried in order;
//! the whole machine is retried a bounded number of times, restarting
//! from `Locating` each attempt.
//!
//! For the Streamtape provider the activation is hardened with a
//! prioritized embedded-frame scan under a strict domain allow-list,
//! so advertising URLs are never mistaken for the media URL.

use crate::platform::PlatformProfile;
use crate::progress::Reporter;
use crate::providers::{is_ad_url, is_streamtape_url, Provider};
use crate::sniffer::{CandidateSet, Provenance};
use crate::Result;
use chromiumoxide::Page;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Bounded retries for the whole state machine.
const MAX_ATTEMPTS: u32 = 3;

/// Backoff between attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(1500);

/// Wait after a successful activation for the embedded player to load.
const PLAYER_WAIT: Duration = Duration::from_secs(4);

/// Terminal outcome of one activation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// The provider control was activated (clicked or navigated).
    Activated,
    /// No matching control after all locator strategies and retries.
    NotFound,
    /// The control's link target failed to load within the timeout.
    NavigationFailed,
}

/// Ranked locator strategies, tried in order until one matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorStrategy {
    /// Labeled control inside the known provider-menu container.
    MenuLabel,
    /// Labeled anchor or button anywhere on the page.
    PageLabel,
    /// Control matched by structural attributes (data attributes,
    /// class-name conventions).
    Structural,
}

impl LocatorStrategy {
    pub const RANKED: [LocatorStrategy; 3] = [
        LocatorStrategy::MenuLabel,
        LocatorStrategy::PageLabel,
        LocatorStrategy::Structural,
    ];
}

/// Record of one bounded attempt to steer the page.
#[derive(Debug, Clone)]
pub struct SourceActivationAttempt {
    pub index: u32,
    pub strategy: Option<LocatorStrategy>,
    pub outcome: ActivationOutcome,
}

/// A located provider control: DOM index within its strategy's match
/// list plus the link target, if any.
#[derive(Debug, Clone)]
struct LocatedControl {
    strategy: LocatorStrategy,
    /// Index into the strategy's selector matches, used to click the
    /// same element programmatically as a fallback.
    dom_index: usize,
    href: Option<String>,
}

/// A link target that cannot be navigated and therefore requires
/// clicking the control instead.
fn href_is_inert(href: &str) -> bool {
    let trimmed = href.trim();
    trimmed.is_empty() || trimmed == "#" || trimmed.eq_ignore_ascii_case("javascript:void(0)")
}

/// CSS selector for a locator strategy's candidate controls.
fn strategy_selector(strategy: LocatorStrategy, provider: Provider) -> String {
    match strategy {
        LocatorStrategy::MenuLabel => {
            "div.subplayermenu a, div.subplayermenu button, div.subplayermenu span".to_string()
        }
        LocatorStrategy::PageLabel => "a, button".to_string(),
        LocatorStrategy::Structural => format!(
            "[data-source='{label}' i], [data-source='{lower}'], a.source-{lower}, .sourcebtn",
            label = provider.label(),
            lower = provider.label().to_ascii_lowercase()
        ),
    }
}

/// Drives the activation state machine over one page.
pub struct SourceActivator<'a> {
    page: &'a Page,
    candidates: Arc<CandidateSet>,
    reporter: Reporter,
    profile: &'a PlatformProfile,
    attempts: Vec<SourceActivationAttempt>,
}

impl<'a> SourceActivator<'a> {
    pub fn new(
        page: &'a Page,
        candidates: Arc<CandidateSet>,
        reporter: Reporter,
        profile: &'a PlatformProfile,
    ) -> Self {
        Self {
            page,
            candidates,
            reporter,
            profile,
            attempts: Vec::new(),
        }
    }

    /// Attempts made so far, for diagnostics.
    pub fn attempts(&self) -> &[SourceActivationAttempt] {
        &self.attempts
    }

    /// Run the state machine: up to [`MAX_ATTEMPTS`] rounds of
    /// Locating → {Activated, NotFound, NavigationFailed}, with a
    /// short backoff between rounds.
    pub async fn activate(&mut self, base: &Url, provider: Provider) -> Result<ActivationOutcome> {
        for attempt in 1..=MAX_ATTEMPTS {
            self.reporter.info(format!(
                "Activating source {} (attempt {}/{})",
                provider.label(),
                attempt,
                MAX_ATTEMPTS
            ));

            let (outcome, strategy) = self.attempt_once(base, provider).await;
            self.attempts.push(SourceActivationAttempt {
                index: attempt,
                strategy,
                outcome,
            });

            match outcome {
                ActivationOutcome::Activated => {
                    tokio::time::sleep(PLAYER_WAIT).await;
                    if provider == Provider::Tap {
                        self.scan_streamtape_frames(base).await;
                    }
                    return Ok(ActivationOutcome::Activated);
                }
                ActivationOutcome::NotFound | ActivationOutcome::NavigationFailed => {
                    if attempt < MAX_ATTEMPTS {
                        self.reporter.warning(format!(
                            "Source {} not active yet ({:?}), retrying",
                            provider.label(),
                            outcome
                        ));
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }

        // All retries spent; the caller decides on provider fallback.
        let last = self
            .attempts
            .last()
            .map(|a| a.outcome)
            .unwrap_or(ActivationOutcome::NotFound);
        Ok(last)
    }

    /// One Locating round: try each strategy in rank order, then act
    /// on the first matched control.
    async fn attempt_once(
        &self,
        base: &Url,
        provider: Provider,
    ) -> (ActivationOutcome, Option<LocatorStrategy>) {
        let control = match self.locate_control(provider).await {
            Some(c) => c,
            None => return (ActivationOutcome::NotFound, None),
        };
        debug!(?control.strategy, href = ?control.href, "provider control located");
        let strategy = control.strategy;

        let outcome = match control.href.as_deref().filter(|h| !href_is_inert(h)) {
            Some(href) => self.navigate_control(base, href).await,
            // Inert or missing link target: requires activation.
            None => self.click_control(provider, &control).await,
        };
        (outcome, Some(strategy))
    }

    /// Search for the provider control, first match wins.
    async fn locate_control(&self, provider: Provider) -> Option<LocatedControl> {
        for strategy in LocatorStrategy::RANKED {
            if let Some(control) = self.locate_with(strategy, provider).await {
                return Some(control);
            }
        }
        None
    }

    async fn locate_with(
        &self,
        strategy: LocatorStrategy,
        provider: Provider,
    ) -> Option<LocatedControl> {
        let selector = strategy_selector(strategy, provider);
        let elements = self.page.find_elements(selector.as_str()).await.ok()?;
        for (dom_index, element) in elements.iter().enumerate() {
            let matches = match strategy {
                // Structural selectors already encode the provider.
                LocatorStrategy::Structural => true,
                _ => {
                    let text = element.inner_text().await.ok().flatten().unwrap_or_default();
                    text.trim().eq_ignore_ascii_case(provider.label())
                }
            };
            if matches {
                let href = element.attribute("href").await.ok().flatten();
                return Some(LocatedControl {
                    strategy,
                    dom_index,
                    href,
                });
            }
        }
        None
    }

    /// Navigate directly to the control's link target. A destination
    /// on a Streamtape host gets an immediate single-shot video scan.
    async fn navigate_control(&self, base: &Url, href: &str) -> ActivationOutcome {
        let target = match base.join(href) {
            Ok(u) => u,
            Err(e) => {
                warn!("unusable link target '{}': {}", href, e);
                return ActivationOutcome::NavigationFailed;
            }
        };
        self.reporter
            .info(format!("Navigating to source URL: {}", target));

        let nav = tokio::time::timeout(self.profile.navigation_timeout, async {
            self.page.goto(target.as_str()).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        })
        .await;

        match nav {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("source navigation failed: {}", e);
                return ActivationOutcome::NavigationFailed;
            }
            Err(_) => {
                warn!("source navigation timed out");
                return ActivationOutcome::NavigationFailed;
            }
        }

        if let Ok(Some(current)) = self.page.url().await {
            if is_streamtape_url(&current) {
                self.harvest_video_src(Provenance::DirectPage).await;
            }
        }
        ActivationOutcome::Activated
    }

    /// Invoke the control's activation; on failure retry once through
    /// a programmatic click before giving up this attempt.
    async fn click_control(&self, provider: Provider, control: &LocatedControl) -> ActivationOutcome {
        let selector = strategy_selector(control.strategy, provider);
        if let Ok(elements) = self.page.find_elements(selector.as_str()).await {
            if let Some(element) = elements.into_iter().nth(control.dom_index) {
                if element.click().await.is_ok() {
                    return ActivationOutcome::Activated;
                }
            }
        }

        // Native click failed (overlay, detached node); try the
        // programmatic path once.
        let js = format!(
            r#"(() => {{
                const els = document.querySelectorAll({selector:?});
                const el = els[{index}];
                if (!el) return false;
                el.click();
                return true;
            }})()"#,
            selector = selector,
            index = control.dom_index,
        );
        let clicked = self
            .page
            .evaluate(js)
            .await
            .map(|result| result.into_value::<bool>().unwrap_or(false));
        match clicked {
            Ok(true) => ActivationOutcome::Activated,
            _ => {
                warn!("programmatic click failed for {}", provider.label());
                ActivationOutcome::NotFound
            }
        }
    }

    /// Prioritized scan of embedded frames after TAP activation.
    ///
    /// Frames on the Streamtape domains are visited first and, if one
    /// yields, exclusively. Ad/analytics/tracker frames are always
    /// skipped. Only allow-listed URLs are accepted as results.
    async fn scan_streamtape_frames(&self, base: &Url) {
        let frame_urls = self.collect_frame_urls(base).await;
        let (tape_frames, other_frames): (Vec<_>, Vec<_>) = frame_urls
            .into_iter()
            .filter(|u| !is_ad_url(u))
            .partition(|u| is_streamtape_url(u));

        for frame_url in tape_frames {
            if self.scan_one_frame(&frame_url).await {
                // Exclusive: a successful Streamtape frame ends the scan.
                return;
            }
        }
        for frame_url in other_frames {
            debug!(frame = %frame_url, "skipping non-streamtape frame for TAP");
        }
    }

    /// All embedded frame addresses on the current page.
    async fn collect_frame_urls(&self, base: &Url) -> Vec<String> {
        let mut urls = Vec::new();
        let Ok(iframes) = self.page.find_elements("iframe").await else {
            return urls;
        };
        for iframe in iframes {
            if let Ok(Some(src)) = iframe.attribute("src").await {
                if let Ok(absolute) = base.join(&src) {
                    urls.push(absolute.to_string());
                }
            }
        }
        urls
    }

    /// Navigate into one frame address and harvest a video element or
    /// script-embedded direct media links. Returns whether anything
    /// was accepted into the candidate set.
    async fn scan_one_frame(&self, frame_url: &str) -> bool {
        info!(frame = %frame_url, "scanning embedded frame");
        let nav = tokio::time::timeout(self.profile.navigation_timeout, async {
            self.page.goto(frame_url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        })
        .await;
        if !matches!(nav, Ok(Ok(()))) {
            warn!(frame = %frame_url, "frame navigation failed");
            return false;
        }

        let before = self.candidates.len();
        self.harvest_video_src(Provenance::FrameScan).await;
        self.harvest_page_source_links().await;
        self.candidates.len() > before
    }

    /// Single-shot scan for a `video` element's source attribute.
    async fn harvest_video_src(&self, provenance: Provenance) {
        let js = "(() => { const v = document.querySelector('video'); \
                  return v && v.src ? v.src : null; })()";
        let src = match self.page.evaluate(js).await {
            Ok(result) => result.into_value::<Option<String>>().unwrap_or(None),
            Err(e) => {
                debug!("video scan failed: {}", e);
                None
            }
        };
        if let Some(src) = src.filter(|s| s.starts_with("http")) {
            if self.candidates.observe(&src, provenance, Some(Provider::Tap)) {
                self.reporter
                    .success(format!("Found media URL from video element: {}", src));
            }
        }
    }

    /// Regex scan of the page source for direct media links embedded
    /// in inline scripts.
    async fn harvest_page_source_links(&self) {
        let html = match self.page.content().await {
            Ok(html) => html,
            Err(e) => {
                debug!("page content unavailable: {}", e);
                return;
            }
        };
        for link in extract_media_links(&html) {
            if self
                .candidates
                .observe(&link, Provenance::PageSourceRegex, Some(Provider::Tap))
            {
                self.reporter
                    .success(format!("Found media URL in page source: {}", link));
            }
        }
    }
}

/// Direct media links (`.m3u8` / `.mp4`) embedded in page markup.
fn extract_media_links(html: &str) -> Vec<String> {
    let re = Regex::new(r#"https?://[^\s"'<>\\]+\.(?:m3u8|mp4)[^\s"'<>\\]*"#).unwrap();
    re.find_iter(html).map(|m| m.as_str().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inert_hrefs_require_activation() {
        assert!(href_is_inert(""));
        assert!(href_is_inert("  "));
        assert!(href_is_inert("#"));
        assert!(href_is_inert("javascript:void(0)"));
        assert!(href_is_inert("JavaScript:Void(0)"));
        assert!(!href_is_inert("/film/matrix/2"));
        assert!(!href_is_inert("https://streamtape.com/e/abc"));
    }

    #[test]
    fn strategies_are_ranked_menu_first() {
        assert_eq!(
            LocatorStrategy::RANKED,
            [
                LocatorStrategy::MenuLabel,
                LocatorStrategy::PageLabel,
                LocatorStrategy::Structural
            ]
        );
    }

    #[test]
    fn structural_selector_names_the_provider() {
        let sel = strategy_selector(LocatorStrategy::Structural, Provider::Tap);
        assert!(sel.contains("TAP") || sel.contains("tap"));
        let menu = strategy_selector(LocatorStrategy::MenuLabel, Provider::Mon);
        assert!(menu.contains("subplayermenu"));
    }

    #[test]
    fn extracts_script_embedded_media_links() {
        let html = r#"
            <script>
              var src = 'https://streamtape.com/get_video?id=1&stream=x.mp4&t=tok';
              player.load("https://cdn.host.example/v/master.m3u8?sig=2");
            </script>
            <img src="https://cdn.host.example/poster.jpg">
        "#;
        let links = extract_media_links(html);
        assert_eq!(links.len(), 2);
        assert!(links[0].contains(".mp4"));
        assert!(links[1].ends_with("master.m3u8?sig=2"));
    }

    #[test]
    fn page_source_harvest_respects_tap_allow_list() {
        let set = CandidateSet::new();
        for link in extract_media_links(
            r#"<script>a="https://ads.exosrv.example/clip.mp4";b="https://streamtape.com/v.mp4"</script>"#,
        ) {
            set.observe(&link, Provenance::PageSourceRegex, Some(Provider::Tap));
        }
        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].url.contains("streamtape.com"));
        assert_eq!(snapshot[0].provenance, Provenance::PageSourceRegex);
    }
}
