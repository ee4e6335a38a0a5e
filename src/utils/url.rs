//! URL validation and normalization utilities.
//!
//! Normalization produces the canonical form a request's unique key is
//! derived from, so two spellings of the same resource deduplicate to one
//! frontier entry.

use anyhow::Result;
use url::Url;

/// Check if a URL is crawlable
///
/// Rejects empty strings, non-http(s) schemes, and pseudo-URLs such as
/// `data:`, `javascript:` and `mailto:`.
#[must_use]
pub fn is_valid_url(url: &str) -> bool {
    if url.is_empty() {
        return false;
    }

    if url.starts_with("data:") || url.starts_with("javascript:") || url.starts_with("mailto:") {
        return false;
    }

    match Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

/// Normalize a URL into the canonical form used for deduplication.
///
/// - scheme and host are lowercased (the parser does this)
/// - the fragment is dropped
/// - query parameters are sorted by key, preserving relative order of
///   duplicate keys; common tracking parameters (`utm_*`) are removed
/// - a trailing slash on an otherwise empty path is kept as `/`
pub fn normalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let mut parsed =
        Url::parse(trimmed).map_err(|e| anyhow::anyhow!("invalid URL '{trimmed}': {e}"))?;

    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        // Stable sort keeps duplicate keys in their original relative order
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let query = pairs
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }

    Ok(parsed.to_string())
}

/// Extract the origin (`scheme://host[:port]`) of a URL.
///
/// Used as the cookie-jar key: cookies are scoped per origin, not per page.
pub fn url_origin(raw: &str) -> Result<String> {
    let parsed = Url::parse(raw).map_err(|e| anyhow::anyhow!("invalid URL '{raw}': {e}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("URL has no host: {raw}"))?;

    let origin = match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    };
    Ok(origin)
}
