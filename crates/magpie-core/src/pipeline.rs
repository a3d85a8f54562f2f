//! End-to-end extraction pipeline with retry supervision
//!
//! One engine run is: normalize the page address, open a browser
//! session, attach the sniffer, navigate, optionally steer to a
//! requested hosting source, settle, pick a candidate, and hand it to
//! the download orchestrator. The supervisor retries the whole
//! sequence on failure with a replaced session each time, and grants
//! the designated alternate source one pass after the requested
//! source's retries run out.

use crate::activate::{ActivationOutcome, SourceActivator};
use crate::download::{derive_output_filename, Container, DownloadTask, Orchestrator};
use crate::normalize::normalize_page_url;
use crate::platform::PlatformProfile;
use crate::progress::Reporter;
use crate::providers::Provider;
use crate::session::BrowserSession;
use crate::sniffer::{CandidateSet, CandidateUrl, MediaFormat, NetworkSniffer};
use crate::{MagpieError, PageTarget, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Total pipeline attempts (first try plus retries).
const MAX_PIPELINE_ATTEMPTS: usize = 3;

/// Delay between pipeline attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Step size of the settle wait, between sniffer target sweeps.
const SETTLE_STEP: Duration = Duration::from_secs(1);

/// Behavior knobs for one engine run.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Explicit output path. When unset, a name is derived from the
    /// page address into `output_dir`.
    pub output: Option<PathBuf>,
    /// Directory for derived output names.
    pub output_dir: PathBuf,
    /// Always produce a playable MP4, transcoding playlists instead of
    /// saving the manifest.
    pub force_mp4: bool,
    pub profile: PlatformProfile,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            output: None,
            output_dir: PathBuf::from("."),
            force_mp4: false,
            profile: PlatformProfile::detect(),
        }
    }
}

/// Drives extraction and download for one page target.
pub struct Engine {
    options: EngineOptions,
    reporter: Reporter,
}

impl Engine {
    pub fn new(options: EngineOptions, reporter: Reporter) -> Self {
        Self { options, reporter }
    }

    /// Run the pipeline to completion, returning the output path.
    ///
    /// Every failed attempt surfaces as a warning event; only the
    /// final failure is terminal.
    pub async fn run(&self, target: &PageTarget) -> Result<PathBuf> {
        let outcome = self.run_supervised(target).await;
        if let Err(e) = &outcome {
            self.reporter.error(format!("Extraction failed: {}", e));
        }
        outcome
    }

    async fn run_supervised(&self, target: &PageTarget) -> Result<PathBuf> {
        let (page_url, redirected) = normalize_page_url(&target.url)?;
        if redirected {
            self.reporter
                .info(format!("Using canonical domain: {}", page_url));
        }

        let mut session = BrowserSession::open(&self.options.profile).await?;
        let result = self
            .run_attempts(&mut session, &page_url, target.source)
            .await;
        session.close().await;
        result
    }

    /// The requested source keeps the whole retry budget; only once it
    /// is exhausted (or activation itself gives up) does the designated
    /// fallback source get its single pass.
    async fn run_attempts(
        &self,
        session: &mut BrowserSession,
        page_url: &str,
        requested: Option<Provider>,
    ) -> Result<PathBuf> {
        let mut source = requested;
        let mut prefer_progressive = false;
        let mut switched = false;
        let mut last_error: Option<MagpieError> = None;

        for attempt in 1..=MAX_PIPELINE_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(RETRY_BACKOFF).await;
                self.reporter.info(format!(
                    "Retrying extraction (attempt {}/{})",
                    attempt, MAX_PIPELINE_ATTEMPTS
                ));
                self.refresh_session(session, attempt).await?;
            }

            match self
                .extract_and_download(session, page_url, source, prefer_progressive)
                .await
            {
                Ok(path) => return Ok(path),
                Err(e) => {
                    warn!(attempt, error = %e, "pipeline attempt failed");
                    self.reporter.warning(format!(
                        "Attempt {}/{} failed: {}",
                        attempt, MAX_PIPELINE_ATTEMPTS, e
                    ));
                    // Activation already spent its own internal retries,
                    // so its failure may switch inside the budget.
                    if !switched {
                        if let Some(fallback) = fallback_source(&e, requested, false) {
                            self.reporter.warning(format!(
                                "Switching to fallback source {}",
                                fallback.label()
                            ));
                            source = Some(fallback);
                            prefer_progressive =
                                fallback.typical_format() == MediaFormat::Progressive;
                            switched = true;
                        }
                    }
                    last_error = Some(e);
                }
            }
        }

        let mut error = last_error.unwrap_or(MagpieError::NoMediaFound);
        if !switched {
            if let Some(fallback) = fallback_source(&error, requested, true) {
                self.reporter.warning(format!(
                    "Retries exhausted, trying fallback source {} once",
                    fallback.label()
                ));
                self.refresh_session(session, MAX_PIPELINE_ATTEMPTS + 1)
                    .await?;
                let prefer = fallback.typical_format() == MediaFormat::Progressive;
                match self
                    .extract_and_download(session, page_url, Some(fallback), prefer)
                    .await
                {
                    Ok(path) => return Ok(path),
                    Err(e) => error = e,
                }
            }
        }
        Err(error)
    }

    /// Replace the session before a retry. The first retry on a
    /// constrained platform reinitializes in place, which also forces
    /// leftover-process cleanup; every other retry gets a plain fresh
    /// session.
    async fn refresh_session(&self, session: &mut BrowserSession, attempt: usize) -> Result<()> {
        if session.profile().is_constrained() && attempt == 2 {
            session.reinitialize().await
        } else {
            session.close().await;
            *session = BrowserSession::open(&self.options.profile).await?;
            Ok(())
        }
    }

    async fn extract_and_download(
        &self,
        session: &BrowserSession,
        page_url: &str,
        source: Option<Provider>,
        prefer_progressive: bool,
    ) -> Result<PathBuf> {
        let profile = session.profile().clone();
        let page = session.page()?;
        let base = Url::parse(page_url)?;

        let candidates = CandidateSet::new();
        let mut sniffer = NetworkSniffer::new(candidates.clone(), source);
        sniffer.attach_page(page).await?;

        self.reporter.info(format!("Loading page: {}", page_url));
        let navigation = async {
            page.goto(page_url).await?;
            page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };
        tokio::time::timeout(profile.navigation_timeout, navigation)
            .await
            .map_err(|_| MagpieError::Navigation(format!("page load timed out: {}", page_url)))?
            .map_err(|e| MagpieError::Navigation(format!("page load failed: {}", e)))?;
        // Player embeds are separate targets; pick up any created by
        // the page load before steering.
        sniffer.sweep(session.browser()?).await?;

        if let Some(provider) = source {
            let mut activator =
                SourceActivator::new(page, candidates.clone(), self.reporter.clone(), &profile);
            match activator.activate(&base, provider).await? {
                ActivationOutcome::Activated => {}
                outcome => {
                    debug!(?outcome, attempts = activator.attempts().len(), "activation gave up");
                    return Err(MagpieError::ActivationNotFound(provider.label().to_string()));
                }
            }
            sniffer.sweep(session.browser()?).await?;
        }

        // The passive wait only pays off while nothing has been
        // sniffed; between steps, new targets are swept in.
        if candidates.is_empty() {
            self.reporter.info("Waiting for player traffic...");
            let deadline = tokio::time::Instant::now() + profile.settle_wait;
            while candidates.is_empty() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(SETTLE_STEP).await;
                sniffer.sweep(session.browser()?).await?;
            }
        } else {
            info!(count = candidates.len(), "media found during load, skipping wait");
        }
        sniffer.detach();

        let snapshot = candidates.snapshot();
        let chosen = choose_candidate(&snapshot, prefer_progressive)
            .ok_or(MagpieError::NoMediaFound)?
            .clone();
        self.reporter.success(format!(
            "Selected media URL ({} candidate{}): {}",
            snapshot.len(),
            if snapshot.len() == 1 { "" } else { "s" },
            chosen.url
        ));

        let container = container_for(chosen.format, self.options.force_mp4);
        let output = match &self.options.output {
            Some(path) => path.clone(),
            None => self
                .options
                .output_dir
                .join(derive_output_filename(&base, container)),
        };

        let cookies = session.cookies().await.unwrap_or_default();
        let task = DownloadTask {
            candidate: chosen,
            output: output.clone(),
            container,
        };
        Orchestrator::new(profile, self.reporter.clone())?
            .run(&task, &cookies)
            .await?;

        self.reporter
            .success(format!("Saved to {}", output.display()));
        Ok(output)
    }
}

/// Pick the candidate to download: playlists beat progressive files,
/// discovery order breaks ties. A fallback source run inverts the
/// preference since its wins are whole-file URLs.
fn choose_candidate(candidates: &[CandidateUrl], prefer_progressive: bool) -> Option<&CandidateUrl> {
    let (first_choice, second_choice) = if prefer_progressive {
        (MediaFormat::Progressive, MediaFormat::Playlist)
    } else {
        (MediaFormat::Playlist, MediaFormat::Progressive)
    };
    candidates
        .iter()
        .find(|c| c.format == first_choice)
        .or_else(|| candidates.iter().find(|c| c.format == second_choice))
}

/// Output container for the chosen format.
fn container_for(format: MediaFormat, force_mp4: bool) -> Container {
    match format {
        MediaFormat::Playlist if force_mp4 => Container::Transcoded,
        MediaFormat::Playlist => Container::PlaylistAsFile,
        MediaFormat::Progressive => Container::ProgressiveFile,
    }
}

/// Decide whether a failure hands the run to the requested source's
/// designated fallback. A failed activation already burned its own
/// internal retries and may switch immediately; an empty candidate set
/// keeps its full retry budget first.
fn fallback_source(
    error: &MagpieError,
    requested: Option<Provider>,
    retries_exhausted: bool,
) -> Option<Provider> {
    match error {
        MagpieError::ActivationNotFound(_) => requested?.fallback(),
        MagpieError::NoMediaFound if retries_exhausted => requested?.fallback(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniffer::Provenance;

    fn candidate(url: &str, format: MediaFormat) -> CandidateUrl {
        CandidateUrl {
            url: url.to_string(),
            format,
            provenance: Provenance::Sniffed,
        }
    }

    #[test]
    fn playlist_wins_over_earlier_progressive() {
        let candidates = vec![
            candidate("https://h/a.mp4", MediaFormat::Progressive),
            candidate("https://h/b.m3u8", MediaFormat::Playlist),
        ];
        let chosen = choose_candidate(&candidates, false).unwrap();
        assert_eq!(chosen.url, "https://h/b.m3u8");
    }

    #[test]
    fn fallback_run_prefers_progressive() {
        let candidates = vec![
            candidate("https://h/b.m3u8", MediaFormat::Playlist),
            candidate("https://h/a.mp4", MediaFormat::Progressive),
        ];
        let chosen = choose_candidate(&candidates, true).unwrap();
        assert_eq!(chosen.url, "https://h/a.mp4");
    }

    #[test]
    fn discovery_order_breaks_ties() {
        let candidates = vec![
            candidate("https://h/first.m3u8", MediaFormat::Playlist),
            candidate("https://h/second.m3u8", MediaFormat::Playlist),
        ];
        assert_eq!(
            choose_candidate(&candidates, false).unwrap().url,
            "https://h/first.m3u8"
        );
        assert!(choose_candidate(&[], false).is_none());
    }

    #[test]
    fn container_respects_mp4_flag() {
        assert_eq!(
            container_for(MediaFormat::Playlist, false),
            Container::PlaylistAsFile
        );
        assert_eq!(
            container_for(MediaFormat::Playlist, true),
            Container::Transcoded
        );
        assert_eq!(
            container_for(MediaFormat::Progressive, false),
            Container::ProgressiveFile
        );
    }

    #[test]
    fn failed_activation_may_switch_inside_the_budget() {
        // Activation already spent its internal retries.
        let not_found = MagpieError::ActivationNotFound("MON".to_string());
        assert_eq!(
            fallback_source(&not_found, Some(Provider::Mon), false),
            Some(Provider::Tap)
        );
        assert_eq!(
            fallback_source(&not_found, Some(Provider::Mon), true),
            Some(Provider::Tap)
        );
    }

    #[test]
    fn empty_runs_keep_their_whole_retry_budget() {
        // A single slow load must not hand the requested source's run
        // to the fallback; only exhaustion does.
        assert_eq!(
            fallback_source(&MagpieError::NoMediaFound, Some(Provider::Mix), false),
            None
        );
        assert_eq!(
            fallback_source(&MagpieError::NoMediaFound, Some(Provider::Mix), true),
            Some(Provider::Tap)
        );
    }

    #[test]
    fn fallback_skips_unrecoverable_failures_and_unrequested_sources() {
        let session = MagpieError::SessionInit("boom".to_string());
        assert_eq!(fallback_source(&session, Some(Provider::Mon), true), None);
        assert_eq!(fallback_source(&MagpieError::NoMediaFound, None, true), None);
        // The designated fallback has nowhere further to go.
        assert_eq!(
            fallback_source(&MagpieError::NoMediaFound, Some(Provider::Tap), true),
            None
        );
    }
}
