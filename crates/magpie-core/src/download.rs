//! Download/transcode orchestration
//!
//! Turns one chosen media URL into a local file. Playlist URLs go
//! through an external ffmpeg stream-copy with machine-readable
//! progress, falling back to in-process segment reconstruction when
//! the transcoder is unavailable or fails. Progressive URLs are
//! streamed to disk in chunks, falling back to an ffmpeg copy.
//!
//! Exactly one strategy succeeds per task or the task fails with the
//! last observed error; a fallback always overwrites the output path
//! so no partial artifact from a failed strategy survives.

use crate::platform::PlatformProfile;
use crate::progress::Reporter;
use crate::providers::is_streamtape_url;
use crate::sniffer::{CandidateUrl, MediaFormat};
use crate::{MagpieError, Result};
use futures::StreamExt;
use m3u8_rs::Playlist;
use percent_encoding::percent_decode_str;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

/// Conservative total used when no metadata is obtainable.
const FALLBACK_TOTAL_FRAMES: u64 = 5000;

/// Frame rate estimate used when only a duration is known.
const ESTIMATED_FPS: f64 = 25.0;

/// Emit cadence for very short media, in frames.
const SHORT_MEDIA_FRAME_CADENCE: u64 = 25;

/// Streaming chunk accounting for size-unknown progressive downloads.
const UNSIZED_REPORT_BYTES: u64 = 5 * 1024 * 1024;

/// Desired on-disk container for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    /// Save the playlist manifest verbatim.
    PlaylistAsFile,
    /// Stream-copy the playlist into a playable container.
    Transcoded,
    /// Save the progressive file verbatim.
    ProgressiveFile,
}

/// A final chosen media URL bound to an output path.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub candidate: CandidateUrl,
    pub output: PathBuf,
    pub container: Container,
}

/// A cookie captured from the browsing session, forwarded to hosts
/// that validate the request against the player session.
#[derive(Debug, Clone)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
}

/// Executes acquisition strategies for one task at a time.
pub struct Orchestrator {
    client: reqwest::Client,
    profile: PlatformProfile,
    reporter: Reporter,
}

impl Orchestrator {
    pub fn new(profile: PlatformProfile, reporter: Reporter) -> Result<Self> {
        // No total-transfer timeout: a large file legitimately takes
        // longer than any fixed budget. Connect setup and per-chunk
        // stalls are bounded separately.
        let client = reqwest::Client::builder()
            .user_agent(crate::session::USER_AGENT)
            .connect_timeout(profile.request_timeout)
            .cookie_store(true)
            .build()?;
        Ok(Self {
            client,
            profile,
            reporter,
        })
    }

    /// Run the branch appropriate to the task's format classification.
    pub async fn run(&self, task: &DownloadTask, cookies: &[SessionCookie]) -> Result<()> {
        match task.candidate.format {
            MediaFormat::Playlist => match task.container {
                Container::PlaylistAsFile => self.save_playlist(task).await,
                _ => self.playlist_with_fallback(task).await,
            },
            MediaFormat::Progressive => self.progressive_with_fallback(task, cookies).await,
        }
    }

    // ------------------------------------------------------------------
    // Playlist branch
    // ------------------------------------------------------------------

    /// One whole-resource fetch of a small body (manifest, segment),
    /// bounded by the profile's request timeout.
    async fn fetch_all(&self, url: &str) -> Result<Vec<u8>> {
        let fetch = async {
            let bytes = self
                .client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            Ok::<_, MagpieError>(bytes.to_vec())
        };
        tokio::time::timeout(self.profile.request_timeout, fetch)
            .await
            .map_err(|_| MagpieError::Acquisition(format!("request timed out: {}", url)))?
    }

    /// Save the `.m3u8` manifest verbatim.
    async fn save_playlist(&self, task: &DownloadTask) -> Result<()> {
        self.reporter
            .info(format!("Saving playlist: {}", task.candidate.url));
        let text = self.fetch_all(&task.candidate.url).await?;
        tokio::fs::write(&task.output, text).await?;
        self.reporter.percent("Playlist saved", 100);
        Ok(())
    }

    /// Primary ffmpeg stream-copy, then in-process segment
    /// reconstruction when the transcoder is unavailable or fails.
    async fn playlist_with_fallback(&self, task: &DownloadTask) -> Result<()> {
        match self.transcode_playlist(task).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reporter.warning(format!(
                    "FFmpeg strategy failed ({}), switching to segment reconstruction",
                    e
                ));
                self.reconstruct_from_segments(task).await
            }
        }
    }

    /// Invoke ffmpeg with stream copy, AAC bitstream fixing, and
    /// machine-readable progress on stdout.
    async fn transcode_playlist(&self, task: &DownloadTask) -> Result<()> {
        let metadata = self.probe_metadata(&task.candidate.url).await;
        let mut progress = TranscodeProgress::new(metadata.total_frames(), metadata.duration);
        self.reporter
            .info(format!("Converting stream ({})", metadata.describe()));

        let mut child = Command::new("ffmpeg")
            .args([
                "-i",
                &task.candidate.url,
                "-c",
                "copy",
                "-bsf:a",
                "aac_adtstoasc",
                "-y",
                "-progress",
                "pipe:1",
                "-nostats",
                "-loglevel",
                "error",
            ])
            .arg(&task.output)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MagpieError::Acquisition(format!("ffmpeg unavailable: {}", e)))?;

        let (status, stderr) = drive_child(child, |line| {
            if let Some((percent, detail)) = progress.observe_line(line) {
                self.reporter
                    .percent(format!("Converting stream ({}%) - {}", percent, detail), percent);
            }
        })
        .await?;
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(MagpieError::Acquisition(format!(
                "ffmpeg exited with {}: {}",
                status,
                stderr.trim()
            )));
        }
        if progress.last_percent() < 100 {
            self.reporter.percent("Converting stream (100%)", 100);
        }
        self.reporter
            .success(format!("Transcode complete: {}", task.output.display()));
        Ok(())
    }

    /// Learn a frame total (or at least a duration) before transcoding,
    /// so progress can be expressed as a percentage.
    async fn probe_metadata(&self, url: &str) -> ProbedMetadata {
        let probe = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-count_frames",
                "-show_entries",
                "stream=nb_frames,duration,avg_frame_rate",
                "-of",
                "csv=p=0",
                url,
            ])
            .output();

        match tokio::time::timeout(self.profile.probe_timeout, probe).await {
            Ok(Ok(out)) if out.status.success() => {
                parse_probe_output(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(Ok(_)) | Ok(Err(_)) | Err(_) => {
                debug!("metadata probe unavailable, using fallback total");
                ProbedMetadata::default()
            }
        }
    }

    /// Fetch the playlist, enumerate its segments, and concatenate
    /// their bytes in playlist order.
    async fn reconstruct_from_segments(&self, task: &DownloadTask) -> Result<()> {
        let playlist_url = Url::parse(&task.candidate.url)?;
        let segments = self.load_segment_urls(&playlist_url).await?;
        if segments.is_empty() {
            return Err(MagpieError::Acquisition(
                "playlist contains no segments".to_string(),
            ));
        }
        let total = segments.len();
        info!(segments = total, "reconstructing stream from segments");

        // Overwrites any partial output of the failed primary strategy.
        let mut file = tokio::fs::File::create(&task.output).await?;
        for (index, segment_url) in segments.iter().enumerate() {
            let percent = (index * 100 / total) as u8;
            self.reporter.percent(
                format!("Downloading segment {}/{} ({}%)", index + 1, total, percent),
                percent,
            );
            let bytes = self.fetch_all(segment_url.as_str()).await?;
            file.write_all(&bytes).await?;
        }
        file.flush().await?;
        self.reporter.percent("Segment reconstruction complete", 100);
        Ok(())
    }

    /// Resolve the playlist to its media segment URLs, following a
    /// master playlist through its first variant.
    async fn load_segment_urls(&self, playlist_url: &Url) -> Result<Vec<Url>> {
        let bytes = self.fetch_all(playlist_url.as_str()).await?;

        match parse_playlist(playlist_url, &bytes)? {
            ParsedPlaylist::Media(segments) => Ok(segments),
            ParsedPlaylist::Master(variant) => {
                debug!(variant = %variant, "following master playlist variant");
                let bytes = self.fetch_all(variant.as_str()).await?;
                match parse_playlist(&variant, &bytes)? {
                    ParsedPlaylist::Media(segments) => Ok(segments),
                    ParsedPlaylist::Master(_) => Err(MagpieError::Acquisition(
                        "nested master playlists are not supported".to_string(),
                    )),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Progressive branch
    // ------------------------------------------------------------------

    /// Chunked streaming first, ffmpeg stream-copy as the fallback.
    async fn progressive_with_fallback(
        &self,
        task: &DownloadTask,
        cookies: &[SessionCookie],
    ) -> Result<()> {
        match self.stream_progressive(task, cookies).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reporter.warning(format!(
                    "Direct streaming failed ({}), retrying with FFmpeg copy",
                    e
                ));
                self.ffmpeg_copy(&task.candidate.url, &task.output).await
            }
        }
    }

    /// Stream the resource to disk, attaching browser-like headers and
    /// the referer/cookies the Streamtape host requires.
    async fn stream_progressive(
        &self,
        task: &DownloadTask,
        cookies: &[SessionCookie],
    ) -> Result<()> {
        let url = &task.candidate.url;
        self.reporter.info(format!("Streaming download: {}", url));

        let mut request = self.client.get(url).header("Accept", "*/*");
        if is_streamtape_url(url) {
            request = request.header("Referer", "https://streamtape.com/");
            let host = Url::parse(url)?.host_str().unwrap_or_default().to_string();
            if let Some(header) = cookie_header_for(&host, cookies) {
                request = request.header("Cookie", header);
            }
        }

        let response = tokio::time::timeout(self.profile.request_timeout, request.send())
            .await
            .map_err(|_| MagpieError::Acquisition(format!("request timed out: {}", url)))??
            .error_for_status()?;
        let total = response.content_length();
        let mut downloaded: u64 = 0;
        let mut last_percent: i64 = -1;
        let mut last_report_bytes: u64 = 0;
        let step = self.profile.progress_step as i64;

        let mut file = tokio::fs::File::create(&task.output).await?;
        let mut stream = response.bytes_stream();
        loop {
            // Bound the gap between chunks, not the whole transfer.
            let chunk = tokio::time::timeout(self.profile.request_timeout, stream.next())
                .await
                .map_err(|_| {
                    MagpieError::Acquisition(format!(
                        "download stalled for {:?}: {}",
                        self.profile.request_timeout, url
                    ))
                })?;
            let Some(chunk) = chunk else {
                break;
            };
            let bytes = chunk?;
            file.write_all(&bytes).await?;
            downloaded += bytes.len() as u64;

            match total {
                Some(total) if total > 0 => {
                    let percent = (downloaded * 100 / total) as i64;
                    if percent >= last_percent + step {
                        self.reporter.percent(
                            format!("Downloading ({}%)", percent),
                            percent.min(100) as u8,
                        );
                        last_percent = percent;
                    }
                }
                _ => {
                    // Size unknown: periodic qualitative updates only.
                    if downloaded - last_report_bytes >= UNSIZED_REPORT_BYTES {
                        self.reporter.info(format!(
                            "Downloading... {} MB",
                            downloaded / (1024 * 1024)
                        ));
                        last_report_bytes = downloaded;
                    }
                }
            }
        }
        file.flush().await?;
        self.reporter.percent("Download complete", 100);
        Ok(())
    }

    /// Plain ffmpeg stream-copy against a URL.
    async fn ffmpeg_copy(&self, url: &str, output: &Path) -> Result<()> {
        let result = Command::new("ffmpeg")
            .args(["-i", url, "-c", "copy", "-y"])
            .arg(output)
            .output()
            .await
            .map_err(|e| MagpieError::Acquisition(format!("ffmpeg unavailable: {}", e)))?;
        if !result.status.success() {
            return Err(MagpieError::Acquisition(format!(
                "ffmpeg copy exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        self.reporter
            .success(format!("FFmpeg copy complete: {}", output.display()));
        Ok(())
    }
}

/// Read a piped child's stdout line by line while a spawned task keeps
/// its stderr drained. Without the drain, a child that writes more
/// than a pipe buffer of diagnostics blocks and never finishes.
async fn drive_child(
    mut child: tokio::process::Child,
    mut on_line: impl FnMut(&str),
) -> Result<(std::process::ExitStatus, Vec<u8>)> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| MagpieError::Acquisition("child stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| MagpieError::Acquisition("child stderr not captured".into()))?;

    let stderr_task = tokio::spawn(async move {
        let mut stderr = stderr;
        let mut buf = Vec::new();
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut buf).await;
        buf
    });

    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        on_line(line.trim());
    }

    let status = child
        .wait()
        .await
        .map_err(|e| MagpieError::Acquisition(format!("child wait failed: {}", e)))?;
    let stderr_buf = stderr_task.await.unwrap_or_default();
    Ok((status, stderr_buf))
}

// ----------------------------------------------------------------------
// Pure helpers
// ----------------------------------------------------------------------

/// Result of the metadata probe pre-pass.
#[derive(Debug, Clone, Default)]
struct ProbedMetadata {
    frames: Option<u64>,
    duration: Option<f64>,
    fps: Option<f64>,
}

impl ProbedMetadata {
    /// Frame total: exact count, else duration x frame rate, else the
    /// conservative fixed fallback.
    fn total_frames(&self) -> u64 {
        if let Some(frames) = self.frames {
            return frames;
        }
        if let Some(duration) = self.duration {
            let fps = self.fps.unwrap_or(ESTIMATED_FPS);
            return (duration * fps) as u64;
        }
        FALLBACK_TOTAL_FRAMES
    }

    fn describe(&self) -> String {
        match (self.frames, self.duration) {
            (Some(f), _) => format!("{} frames", f),
            (None, Some(d)) => format!("estimated {} frames from {:.1}s", self.total_frames(), d),
            (None, None) => "estimating progress".to_string(),
        }
    }
}

/// Parse ffprobe CSV output: `nb_frames,duration,avg_frame_rate`.
fn parse_probe_output(output: &str) -> ProbedMetadata {
    let mut metadata = ProbedMetadata::default();
    for line in output.lines() {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if let Some(frames) = parts.first().and_then(|p| p.parse::<u64>().ok()) {
            metadata.frames = Some(frames);
        }
        if let Some(duration) = parts.get(1).and_then(|p| p.parse::<f64>().ok()) {
            metadata.duration = Some(duration);
        }
        if let Some(fps) = parts.get(2).and_then(|p| parse_frame_rate(p)) {
            metadata.fps = Some(fps);
        }
        if metadata.frames.is_some() {
            break;
        }
    }
    metadata
}

/// Parse an ffprobe rational frame rate such as `25/1` or `30000/1001`.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let (num, den) = raw.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

/// Incremental parser for ffmpeg's `-progress pipe:1` channel.
///
/// Keeps the reported percentage monotonic and below 100 until the
/// explicit completion marker, enlarging the frame total by a fixed
/// proportional margin whenever the observed count overtakes it.
struct TranscodeProgress {
    total_frames: u64,
    duration: Option<f64>,
    last_emitted: i64,
}

impl TranscodeProgress {
    fn new(total_frames: u64, duration: Option<f64>) -> Self {
        Self {
            total_frames: total_frames.max(1),
            duration,
            last_emitted: -1,
        }
    }

    fn last_percent(&self) -> i64 {
        self.last_emitted
    }

    /// Feed one progress line; returns a (percent, detail) pair when an
    /// update should be reported.
    fn observe_line(&mut self, line: &str) -> Option<(u8, String)> {
        if let Some(raw) = line.strip_prefix("frame=") {
            let frame: u64 = raw.trim().parse().ok()?;
            if frame > self.total_frames {
                // Enlarge by a 20% margin to stay monotonic and < 100.
                self.total_frames = frame + frame / 5;
            }
            let percent = ((frame * 100 / self.total_frames) as i64).min(99);
            if percent > self.last_emitted {
                self.last_emitted = percent;
                return Some((
                    percent as u8,
                    format!("{}/{} frames", frame, self.total_frames),
                ));
            }
            // Fixed frame cadence keeps small files visibly moving.
            if frame > 0 && frame % SHORT_MEDIA_FRAME_CADENCE == 0 {
                return Some((
                    self.last_emitted.max(0) as u8,
                    format!("{}/{} frames", frame, self.total_frames),
                ));
            }
            return None;
        }

        if let Some(raw) = line.strip_prefix("out_time_ms=") {
            let duration = self.duration?;
            if duration <= 0.0 {
                return None;
            }
            let micros: i64 = raw.trim().parse().ok()?;
            let seconds = micros as f64 / 1_000_000.0;
            let percent = (((seconds / duration) * 100.0) as i64).min(99);
            if percent > self.last_emitted {
                self.last_emitted = percent;
                return Some((percent as u8, format!("{:.1}s/{:.1}s", seconds, duration)));
            }
            return None;
        }

        if line.starts_with("progress=end") {
            self.last_emitted = 100;
            return Some((100, "done".to_string()));
        }

        None
    }
}

/// A parsed playlist: either media segments or a master variant to
/// follow.
enum ParsedPlaylist {
    Media(Vec<Url>),
    Master(Url),
}

/// Parse playlist bytes, resolving relative references against the
/// playlist URL.
fn parse_playlist(playlist_url: &Url, bytes: &[u8]) -> Result<ParsedPlaylist> {
    match m3u8_rs::parse_playlist_res(bytes) {
        Ok(Playlist::MediaPlaylist(media)) => {
            let mut segments = Vec::with_capacity(media.segments.len());
            for segment in &media.segments {
                segments.push(playlist_url.join(&segment.uri)?);
            }
            Ok(ParsedPlaylist::Media(segments))
        }
        Ok(Playlist::MasterPlaylist(master)) => {
            let variant = master.variants.first().ok_or_else(|| {
                MagpieError::Acquisition("master playlist has no variants".to_string())
            })?;
            Ok(ParsedPlaylist::Master(playlist_url.join(&variant.uri)?))
        }
        Err(e) => Err(MagpieError::Acquisition(format!(
            "playlist parse failed: {}",
            e
        ))),
    }
}

/// Cookie header for `host` from the captured session cookies, scoped
/// by domain suffix match.
fn cookie_header_for(host: &str, cookies: &[SessionCookie]) -> Option<String> {
    let parts: Vec<String> = cookies
        .iter()
        .filter(|c| {
            let domain = c.domain.trim_start_matches('.');
            !domain.is_empty() && host.ends_with(domain)
        })
        .map(|c| format!("{}={}", c.name, c.value))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

/// Derive an output filename from the page path's trailing segments.
///
/// Series pages join the two trailing segments (`show_S01E01`); the
/// structural `film`/`serial` components are skipped. Non-filename-safe
/// characters are replaced.
pub fn derive_output_filename(page_url: &Url, container: Container) -> String {
    // Work on the decoded path parts; the sanitizer sees the real
    // characters, not their percent escapes.
    let segments: Vec<String> = page_url
        .path_segments()
        .map(|s| {
            s.filter(|p| !p.is_empty())
                .map(|p| percent_decode_str(p).decode_utf8_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();

    let base = match segments.as_slice() {
        [] => "downloaded_video".to_string(),
        [single] => single.clone(),
        [.., parent, last] if parent != "film" && parent != "serial" => {
            format!("{}_{}", parent, last)
        }
        [.., last] => last.clone(),
    };

    let safe = Regex::new(r"[^\w\-_.]").unwrap().replace_all(&base, "_");
    let extension = match container {
        Container::PlaylistAsFile => "m3u8",
        Container::Transcoded | Container::ProgressiveFile => "mp4",
    };
    format!("{}.{}", safe, extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn filename_joins_trailing_series_segments() {
        assert_eq!(
            derive_output_filename(&url("https://serial.kukaj.fi/show/S01E01"), Container::Transcoded),
            "show_S01E01.mp4"
        );
    }

    #[test]
    fn filename_skips_structural_components() {
        assert_eq!(
            derive_output_filename(&url("https://film.kukaj.fi/film/matrix"), Container::PlaylistAsFile),
            "matrix.m3u8"
        );
        assert_eq!(
            derive_output_filename(&url("https://kukaj.fi/matrix"), Container::ProgressiveFile),
            "matrix.mp4"
        );
    }

    #[test]
    fn filename_sanitizes_unsafe_characters() {
        assert_eq!(
            derive_output_filename(&url("https://kukaj.fi/show/S01 E01!"), Container::Transcoded),
            "show_S01_E01_.mp4"
        );
    }

    #[test]
    fn filename_falls_back_on_empty_path() {
        assert_eq!(
            derive_output_filename(&url("https://kukaj.fi/"), Container::Transcoded),
            "downloaded_video.mp4"
        );
    }

    #[test]
    fn probe_output_prefers_exact_frame_count() {
        let metadata = parse_probe_output("1234,567.8,25/1\n");
        assert_eq!(metadata.total_frames(), 1234);
    }

    #[test]
    fn probe_output_estimates_from_duration_and_rate() {
        let metadata = parse_probe_output("N/A,100.0,30000/1001\n");
        let total = metadata.total_frames();
        assert!((2995..=2998).contains(&total), "got {}", total);
    }

    #[test]
    fn probe_output_uses_conservative_default() {
        assert_eq!(parse_probe_output("N/A,N/A,N/A\n").total_frames(), FALLBACK_TOTAL_FRAMES);
        assert_eq!(parse_probe_output("").total_frames(), FALLBACK_TOTAL_FRAMES);
    }

    #[test]
    fn transcode_progress_is_monotonic_and_capped() {
        let mut progress = TranscodeProgress::new(1000, None);
        let mut last = -1i64;
        for frame in (0..1500).step_by(10) {
            if let Some((pct, _)) = progress.observe_line(&format!("frame={}", frame)) {
                assert!(pct as i64 >= last, "{} < {}", pct, last);
                assert!(pct <= 99);
                last = pct as i64;
            }
        }
        // Observed count overtook the estimate; the total must have grown.
        assert!(progress.total_frames > 1000);
        let (pct, _) = progress.observe_line("progress=end").unwrap();
        assert_eq!(pct, 100);
    }

    #[test]
    fn transcode_progress_reports_every_percent_increase() {
        let mut progress = TranscodeProgress::new(100, None);
        assert_eq!(progress.observe_line("frame=1").unwrap().0, 1);
        assert_eq!(progress.observe_line("frame=2").unwrap().0, 2);
        // Same percent, not on the frame cadence: no event.
        assert!(progress.observe_line("frame=2").is_none());
    }

    #[test]
    fn transcode_progress_emits_on_frame_cadence_for_short_media() {
        let mut progress = TranscodeProgress::new(100_000, None);
        // 25 frames of 100k is still 0%, but the cadence keeps small
        // files visibly moving.
        let _ = progress.observe_line("frame=10");
        let event = progress.observe_line("frame=25");
        assert!(event.is_some());
    }

    #[test]
    fn transcode_progress_uses_time_when_duration_known() {
        let mut progress = TranscodeProgress::new(FALLBACK_TOTAL_FRAMES, Some(200.0));
        let (pct, detail) = progress.observe_line("out_time_ms=100000000").unwrap();
        assert_eq!(pct, 50);
        assert!(detail.contains("100.0s/200.0s"));
        // Earlier timestamps never move the percentage backwards.
        assert!(progress.observe_line("out_time_ms=50000000").is_none());
    }

    #[test]
    fn media_playlist_segments_resolve_against_playlist_url() {
        let playlist = b"#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n\
            #EXTINF:10.0,\nseg0.ts\n#EXTINF:10.0,\nsub/seg1.ts\n\
            #EXTINF:10.0,\nhttps://other.cdn/seg2.ts\n#EXT-X-ENDLIST\n";
        let base = url("https://cdn.host/stream/index.m3u8");
        let ParsedPlaylist::Media(segments) = parse_playlist(&base, playlist).unwrap() else {
            panic!("expected media playlist");
        };
        let urls: Vec<String> = segments.iter().map(|u| u.to_string()).collect();
        assert_eq!(
            urls,
            vec![
                "https://cdn.host/stream/seg0.ts",
                "https://cdn.host/stream/sub/seg1.ts",
                "https://other.cdn/seg2.ts",
            ]
        );
    }

    #[test]
    fn master_playlist_yields_first_variant() {
        let playlist = b"#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1280000\nlow/index.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=2560000\nhigh/index.m3u8\n";
        let base = url("https://cdn.host/stream/master.m3u8");
        let ParsedPlaylist::Master(variant) = parse_playlist(&base, playlist).unwrap() else {
            panic!("expected master playlist");
        };
        assert_eq!(variant.to_string(), "https://cdn.host/stream/low/index.m3u8");
    }

    use crate::progress::Reporter;
    use crate::sniffer::Provenance;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    /// Serve one HTTP response whose body arrives in `chunks` pieces of
    /// 100 bytes, `gap` apart.
    async fn serve_trickled_body(listener: TcpListener, chunks: usize, gap: Duration) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = sock.read(&mut buf).await;
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            chunks * 100
        );
        sock.write_all(header.as_bytes()).await.unwrap();
        for _ in 0..chunks {
            sock.write_all(&[b'x'; 100]).await.unwrap();
            sock.flush().await.unwrap();
            tokio::time::sleep(gap).await;
        }
    }

    fn trickle_task(url: String, output: std::path::PathBuf) -> DownloadTask {
        DownloadTask {
            candidate: CandidateUrl {
                url,
                format: MediaFormat::Progressive,
                provenance: Provenance::Sniffed,
            },
            output,
            container: Container::ProgressiveFile,
        }
    }

    #[tokio::test]
    async fn steady_transfer_outlives_the_request_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let chunks = 12usize;
        // Whole transfer takes ~600ms; each chunk gap is well inside
        // the 200ms budget, so only a total-transfer cap would fail it.
        tokio::spawn(serve_trickled_body(listener, chunks, Duration::from_millis(50)));

        let mut profile = PlatformProfile::desktop();
        profile.request_timeout = Duration::from_millis(200);
        let orchestrator = Orchestrator::new(profile, Reporter::discard()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let task = trickle_task(format!("http://{}/v.mp4", addr), dir.path().join("v.mp4"));

        orchestrator.stream_progressive(&task, &[]).await.unwrap();
        assert_eq!(
            tokio::fs::read(&task.output).await.unwrap().len(),
            chunks * 100
        );
    }

    #[tokio::test]
    async fn stalled_transfer_is_aborted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            sock.write_all(&[b'x'; 100]).await.unwrap();
            sock.flush().await.unwrap();
            // Keep the socket open without sending further bytes.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut profile = PlatformProfile::desktop();
        profile.request_timeout = Duration::from_millis(200);
        let orchestrator = Orchestrator::new(profile, Reporter::discard()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let task = trickle_task(format!("http://{}/v.mp4", addr), dir.path().join("v.mp4"));

        let err = orchestrator.stream_progressive(&task, &[]).await.unwrap_err();
        assert!(matches!(err, MagpieError::Acquisition(msg) if msg.contains("stalled")));
    }

    #[tokio::test]
    async fn noisy_child_stderr_does_not_block_progress() {
        // Far more stderr than a pipe buffer holds, then one stdout line.
        let child = Command::new("sh")
            .arg("-c")
            .arg("i=0; while [ $i -lt 20000 ]; do echo some-error-noise 1>&2; i=$((i+1)); done; echo frame=42")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        let mut seen = Vec::new();
        let (status, stderr) = drive_child(child, |line| seen.push(line.to_string()))
            .await
            .unwrap();
        assert!(status.success());
        assert!(seen.iter().any(|l| l == "frame=42"));
        assert!(stderr.len() > 64 * 1024);
    }

    #[tokio::test]
    async fn fallback_strategy_overwrites_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        // Leftover from a failed primary strategy.
        tokio::fs::write(&path, b"partial artifact").await.unwrap();

        // The reconstruction path opens with create(), which truncates.
        let mut file = tokio::fs::File::create(&path).await.unwrap();
        for chunk in [b"seg0".as_slice(), b"seg1", b"seg2"] {
            file.write_all(chunk).await.unwrap();
        }
        file.flush().await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"seg0seg1seg2");
    }

    #[test]
    fn cookie_header_is_scoped_to_host() {
        let cookies = vec![
            SessionCookie {
                name: "sid".into(),
                value: "abc".into(),
                domain: ".streamtape.com".into(),
            },
            SessionCookie {
                name: "other".into(),
                value: "x".into(),
                domain: "kukaj.fi".into(),
            },
        ];
        assert_eq!(
            cookie_header_for("streamtape.com", &cookies).as_deref(),
            Some("sid=abc")
        );
        assert_eq!(
            cookie_header_for("cdn.tapecontent.net", &cookies),
            None
        );
    }
}
