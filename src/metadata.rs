#![forbid(unsafe_code)]

//! The subset of yt-dlp's JSON output this server reads, and the calls that
//! produce it.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::{
    error::UpstreamError,
    tools::{ToolInvocation, ToolKind, Toolbox},
};

/// One video as described by `--dump-json` / `--dump-single-json`. Every
/// field is optional because yt-dlp omits whatever an extractor cannot fill.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub fulltitle: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnails: Option<Vec<Thumbnail>>,
    pub duration: Option<f64>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub view_count: Option<u64>,
    pub webpage_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Thumbnail {
    pub url: Option<String>,
}

impl VideoInfo {
    pub fn video_id(&self) -> Option<&str> {
        non_empty(self.id.as_deref())
    }

    pub fn display_title(&self) -> Option<&str> {
        non_empty(self.title.as_deref()).or_else(|| non_empty(self.fulltitle.as_deref()))
    }

    /// `thumbnail` when present, otherwise the last (largest) entry of
    /// `thumbnails`.
    pub fn thumbnail_url(&self) -> Option<&str> {
        non_empty(self.thumbnail.as_deref()).or_else(|| {
            self.thumbnails
                .as_deref()?
                .iter()
                .rev()
                .find_map(|thumb| non_empty(thumb.url.as_deref()))
        })
    }

    pub fn uploader_name(&self) -> Option<&str> {
        non_empty(self.uploader.as_deref()).or_else(|| non_empty(self.channel.as_deref()))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// Entries parsed from one-object-per-line output.
#[derive(Debug, Default)]
pub struct JsonLines {
    pub entries: Vec<VideoInfo>,
    pub skipped: usize,
}

/// Parses each non-empty line on its own. Lines that are not JSON objects
/// are logged and skipped so one bad line does not sink the whole batch.
pub fn parse_json_lines(raw: &[u8]) -> JsonLines {
    let text = String::from_utf8_lossy(raw);
    let mut parsed = JsonLines::default();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<VideoInfo>(line) {
            Ok(entry) => parsed.entries.push(entry),
            Err(err) => {
                parsed.skipped += 1;
                warn!(line = index + 1, error = %err, "skipping unparsable yt-dlp output line");
            }
        }
    }
    parsed
}

pub fn parse_single(raw: &[u8]) -> Result<VideoInfo, UpstreamError> {
    serde_json::from_slice(raw).map_err(|err| UpstreamError::Malformed {
        tool: ToolKind::Extractor.name(),
        detail: format!("deserializing metadata JSON: {err}"),
    })
}

/// Runs `yt-dlp --dump-single-json` for one URL.
pub async fn fetch_video_info(
    toolbox: &Toolbox,
    program: PathBuf,
    url: &str,
) -> Result<VideoInfo, UpstreamError> {
    let invocation = ToolInvocation::new(ToolKind::Extractor, program, toolbox.tool_timeout)
        .args([
            "--dump-single-json",
            "--skip-download",
            "--no-playlist",
            "--no-warnings",
            "--",
        ])
        .arg(url);
    let output = toolbox.run(invocation).await?;
    parse_single(&output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_lines_skips_garbage() {
        let raw = b"{\"id\":\"a\",\"title\":\"A\"}\n\nnot json\n[1,2]\n{\"id\":\"b\"}\n";
        let parsed = parse_json_lines(raw);
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.skipped, 2);
        assert_eq!(parsed.entries[1].video_id(), Some("b"));
    }

    #[test]
    fn thumbnail_falls_back_to_largest_listed() {
        let info: VideoInfo = serde_json::from_str(
            r#"{"id":"x","thumbnails":[{"url":"small"},{"url":"large"},{"url":null}]}"#,
        )
        .unwrap();
        assert_eq!(info.thumbnail_url(), Some("large"));

        let info: VideoInfo =
            serde_json::from_str(r#"{"id":"x","thumbnail":"main","thumbnails":[{"url":"other"}]}"#)
                .unwrap();
        assert_eq!(info.thumbnail_url(), Some("main"));
    }

    #[test]
    fn tolerates_nulls_and_float_durations() {
        let info: VideoInfo = serde_json::from_str(
            r#"{"id":"x","title":"  ","fulltitle":"Full","duration":12.5,"view_count":null,"thumbnails":null,"channel":"Chan"}"#,
        )
        .unwrap();
        assert_eq!(info.display_title(), Some("Full"));
        assert_eq!(info.duration, Some(12.5));
        assert_eq!(info.uploader_name(), Some("Chan"));
        assert!(info.thumbnail_url().is_none());
    }

    #[test]
    fn parse_single_reports_malformed_output() {
        let err = parse_single(b"WARNING: something\n").unwrap_err();
        assert_eq!(err.kind(), "malformed output");
    }
}
