//! Magpie Core Library
//!
//! Core functionality for the Magpie stream grabber including:
//! - Browser session lifecycle management
//! - Passive network sniffing for media URLs
//! - Provider (hosting source) activation
//! - Resilient download/transcode orchestration

pub mod activate;
pub mod download;
pub mod normalize;
pub mod pipeline;
pub mod platform;
pub mod progress;
pub mod providers;
pub mod session;
pub mod sniffer;

use thiserror::Error;

// Re-export key types
pub use activate::{ActivationOutcome, SourceActivator};
pub use download::{Container, DownloadTask, Orchestrator, SessionCookie};
pub use normalize::normalize_page_url;
pub use pipeline::{Engine, EngineOptions};
pub use platform::PlatformProfile;
pub use progress::{ProgressEvent, ProgressSink, Severity};
pub use providers::Provider;
pub use session::BrowserSession;
pub use sniffer::{CandidateSet, CandidateUrl, MediaFormat, NetworkSniffer, Provenance};

#[derive(Error, Debug)]
pub enum MagpieError {
    /// No automation engine could be launched. Fatal to the current
    /// attempt; only the supervisor may retry via reinitialization.
    #[error("browser session init failed: {0}")]
    SessionInit(String),

    /// A page or frame failed to load within its timeout.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// No matching provider control after all locator strategies.
    #[error("source '{0}' could not be activated")]
    ActivationNotFound(String),

    /// Extraction completed with an empty candidate set.
    #[error("no media URLs were discovered")]
    NoMediaFound,

    /// A download/transcode strategy failed. Terminal only once every
    /// fallback strategy is exhausted.
    #[error("acquisition failed: {0}")]
    Acquisition(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MagpieError>;

/// An input page address plus an optional preferred hosting provider.
#[derive(Debug, Clone)]
pub struct PageTarget {
    /// The page address. Normalized to the canonical domain before any
    /// browser work begins.
    pub url: String,
    /// Preferred provider label, if the caller requested one.
    pub source: Option<Provider>,
}

impl PageTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: Provider) -> Self {
        self.source = Some(source);
        self
    }
}
