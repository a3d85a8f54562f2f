//! Hosting providers ("sources")
//!
//! The target page can switch between a small fixed set of alternate
//! embedded players. Each has its own URL shapes; one of them
//! (Streamtape) needs strict domain allow-listing because its embed
//! pages are littered with advertising requests that also match the
//! generic media-format signature.

use crate::sniffer::MediaFormat;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// One of the supported alternate hosting providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Streamtape embed. Progressive MP4, strict allow-list.
    Tap,
    /// Filemoon embed. HLS playlists.
    Mon,
    /// Mixdrop embed.
    Mix,
}

/// Streamtape-operated hosts. Only URLs on these domains are accepted
/// as TAP results.
pub const STREAMTAPE_HOSTS: &[&str] = &["streamtape.com", "tapecontent.net", "streamta.pe"];

/// Substrings marking advertising/analytics/tracking hosts. Frames and
/// sniffed URLs matching any of these are always rejected.
const AD_HOST_MARKERS: &[&str] = &[
    "doubleclick",
    "googlesyndication",
    "google-analytics",
    "googletagmanager",
    "adsco",
    "adservice",
    "popads",
    "exosrv",
    "exoclick",
    "propellerads",
    "taboola",
    "outbrain",
];

impl Provider {
    /// Label as it appears on the provider-selection controls.
    pub fn label(&self) -> &'static str {
        match self {
            Provider::Tap => "TAP",
            Provider::Mon => "MON",
            Provider::Mix => "MIX",
        }
    }

    /// The format this provider typically serves. Used when the
    /// supervisor forces the fallback provider's download branch.
    pub fn typical_format(&self) -> MediaFormat {
        match self {
            Provider::Tap => MediaFormat::Progressive,
            Provider::Mon | Provider::Mix => MediaFormat::Playlist,
        }
    }

    /// Designated fallback when this provider exhausts its retries.
    pub fn fallback(&self) -> Option<Provider> {
        match self {
            Provider::Tap => None,
            Provider::Mon | Provider::Mix => Some(Provider::Tap),
        }
    }

    /// Whether results for this provider are restricted to a known
    /// downstream host allow-list.
    pub fn strict_allow_list(&self) -> Option<&'static [&'static str]> {
        match self {
            Provider::Tap => Some(STREAMTAPE_HOSTS),
            _ => None,
        }
    }

    /// Whether `url` is acceptable as a result for this provider.
    pub fn accepts_url(&self, url: &str) -> bool {
        if is_ad_url(url) {
            return false;
        }
        match self.strict_allow_list() {
            Some(hosts) => url_host_matches(url, hosts),
            None => true,
        }
    }
}

/// Whether the URL's host is one of `domains` or a subdomain of one.
/// Matching on the parsed host keeps allow-listed names in the query
/// string (`?u=streamtape.com/...`) from qualifying.
fn url_host_matches(url: &str, domains: &[&str]) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    domains
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
}

/// Whether `url` points at one of the Streamtape-operated hosts.
pub fn is_streamtape_url(url: &str) -> bool {
    url_host_matches(url, STREAMTAPE_HOSTS)
}

/// Whether `url` matches a known advertising/analytics/tracking host.
pub fn is_ad_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    AD_HOST_MARKERS.iter().any(|m| lower.contains(m))
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TAP" => Ok(Provider::Tap),
            "MON" => Ok(Provider::Mon),
            "MIX" => Ok(Provider::Mix),
            _ => Err(format!("unknown source '{}'. Use TAP, MON or MIX", s)),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
