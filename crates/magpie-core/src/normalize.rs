//! Canonical domain normalization
//!
//! The target site is mirrored under a family of top-level domain
//! variants. Everything downstream assumes the canonical variant, so
//! input addresses are rewritten before any browser work begins.

use crate::{MagpieError, Result};
use url::Url;

/// Domain family stem, including the trailing dot.
const DOMAIN_STEM: &str = "kukaj.";

/// Canonical top-level variant.
const CANONICAL_TLD: &str = "fi";

/// Rewrite a page address to the canonical domain variant.
///
/// Hosts of the shape `(sub.)kukaj.<tld>` with a non-canonical `<tld>`
/// become `(sub.)kukaj.fi`, preserving subdomain, path, query, and
/// fragment. Anything else passes through unchanged. Returns the
/// (possibly unchanged) address and whether a rewrite occurred.
pub fn normalize_page_url(input: &str) -> Result<(String, bool)> {
    let mut url = Url::parse(input)?;

    let host = match url.host_str() {
        Some(h) => h.to_string(),
        None => return Ok((input.to_string(), false)),
    };

    if !host.contains(DOMAIN_STEM) {
        return Ok((input.to_string(), false));
    }

    let Some((prefix, tld)) = split_family_host(&host) else {
        return Ok((input.to_string(), false));
    };

    if tld == CANONICAL_TLD {
        return Ok((input.to_string(), false));
    }

    let canonical_host = format!("{}{}{}", prefix, DOMAIN_STEM, CANONICAL_TLD);
    url.set_host(Some(&canonical_host))
        .map_err(|e| MagpieError::Other(format!("host rewrite failed: {}", e)))?;

    Ok((url.to_string(), true))
}

/// Split `(sub.)kukaj.<tld>` into its subdomain prefix and tld.
/// Returns `None` when the host is not part of the domain family.
fn split_family_host(host: &str) -> Option<(&str, &str)> {
    let stem_at = host.rfind(DOMAIN_STEM)?;
    let prefix = &host[..stem_at];
    let tld = &host[stem_at + DOMAIN_STEM.len()..];

    // The stem must sit at a label boundary and the tld must be a
    // plain alphabetic label ("kukaj.fi.evil.com" is not family).
    if !prefix.is_empty() && !prefix.ends_with('.') {
        return None;
    }
    if tld.is_empty() || !tld.chars().all(|c| c.is_ascii_lowercase()) {
        return None;
    }

    Some((prefix, tld))
}
