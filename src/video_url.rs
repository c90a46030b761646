#![forbid(unsafe_code)]

//! Recognising video-host URLs and turning identifiers into watch URLs.

use url::Url;

const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";
const HOST_MARKERS: [&str; 2] = ["youtube.com", "youtu.be"];
const MAX_ID_LEN: usize = 64;

/// True when free text should be treated as a direct video lookup instead of
/// a keyword search.
pub fn is_video_url(query: &str) -> bool {
    let lowered = query.to_ascii_lowercase();
    HOST_MARKERS.iter().any(|marker| lowered.contains(marker))
}

pub fn watch_url(video_id: &str) -> String {
    format!("{WATCH_URL_PREFIX}{video_id}")
}

/// Identifiers the extraction tool accepts without a URL.
pub fn is_bare_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Pulls the video id out of the common YouTube URL shapes: `watch?v=`,
/// `youtu.be/<id>`, `/shorts/<id>`, `/embed/<id>` and `/live/<id>`.
pub fn extract_video_id(raw: &str) -> Option<String> {
    let url = parse_http_url(raw.trim())?;
    let host = url.host_str()?.to_ascii_lowercase();

    let candidate = if host == "youtu.be" || host.ends_with(".youtu.be") {
        url.path_segments()?.next().map(str::to_string)
    } else if host == "youtube.com" || host.ends_with(".youtube.com") {
        if let Some((_, value)) = url.query_pairs().find(|(key, _)| key == "v") {
            Some(value.into_owned())
        } else {
            let mut segments = url.path_segments()?;
            match segments.next() {
                Some("shorts" | "embed" | "live" | "v") => segments.next().map(str::to_string),
                _ => None,
            }
        }
    } else {
        None
    };

    candidate.filter(|id| is_bare_id(id))
}

/// Parses `raw` as an absolute http(s) URL.
pub fn parse_http_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

/// Canonical URL for a download identifier: URLs pass through, bare ids are
/// expanded to a watch URL, anything else is rejected.
pub fn canonical_url(identifier: &str) -> Option<String> {
    let trimmed = identifier.trim();
    if let Some(url) = parse_http_url(trimmed) {
        return Some(url.to_string());
    }
    if is_video_url(trimmed) {
        return parse_http_url(&format!("https://{trimmed}")).map(|url| url.to_string());
    }
    is_bare_id(trimmed).then(|| watch_url(trimmed))
}
