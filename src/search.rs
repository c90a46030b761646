#![forbid(unsafe_code)]

//! Keyword search and direct URL lookup.

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    error::{AppError, UpstreamError},
    metadata::{VideoInfo, fetch_video_info, parse_json_lines},
    tools::{ToolInvocation, ToolKind, Toolbox},
    video_url::{extract_video_id, is_video_url, watch_url},
};

/// Compact projection returned to the browser.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub thumbnail_url: String,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    pub url: String,
}

impl SearchResult {
    /// `fallback_id` is used when the tool output lacks an id; entries with
    /// neither are dropped.
    fn project(info: &VideoInfo, fallback_id: Option<&str>, url: Option<String>) -> Option<Self> {
        let id = info.video_id().or(fallback_id)?.to_string();
        let thumbnail_url = info
            .thumbnail_url()
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://i.ytimg.com/vi/{id}/hqdefault.jpg"));
        Some(Self {
            title: info.display_title().unwrap_or(&id).to_string(),
            thumbnail_url,
            duration_seconds: info.duration.filter(|value| value.is_finite()).unwrap_or(0.0),
            uploader: info.uploader_name().map(str::to_string),
            view_count: info.view_count,
            url: url.unwrap_or_else(|| watch_url(&id)),
            id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SearchOrchestrator {
    toolbox: Toolbox,
    max_results: usize,
}

impl SearchOrchestrator {
    pub fn new(toolbox: Toolbox, max_results: usize) -> Self {
        Self {
            toolbox,
            max_results: max_results.max(1),
        }
    }

    pub fn max_results(&self) -> usize {
        self.max_results
    }

    /// Runs a direct lookup when the query names a video URL, a keyword
    /// search otherwise. No retries.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>, AppError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::validation("Search query is required"));
        }
        let program = self.toolbox.require(ToolKind::Extractor)?;

        if is_video_url(query) {
            let result = self.lookup_url(program, query).await?;
            info!(query, id = %result.id, "direct video lookup");
            return Ok(vec![result]);
        }

        let results = self.keyword_search(program, query).await?;
        info!(query, count = results.len(), "keyword search");
        Ok(results)
    }

    async fn lookup_url(
        &self,
        program: std::path::PathBuf,
        url: &str,
    ) -> Result<SearchResult, UpstreamError> {
        let info = fetch_video_info(&self.toolbox, program, url).await?;
        let embedded = extract_video_id(url);
        SearchResult::project(&info, embedded.as_deref(), Some(url.to_string())).ok_or_else(|| {
            UpstreamError::Malformed {
                tool: ToolKind::Extractor.name(),
                detail: "metadata has no video id".into(),
            }
        })
    }

    async fn keyword_search(
        &self,
        program: std::path::PathBuf,
        query: &str,
    ) -> Result<Vec<SearchResult>, UpstreamError> {
        let invocation = ToolInvocation::new(ToolKind::Extractor, program, self.toolbox.tool_timeout)
            .args(["--dump-json", "--no-warnings", "--"])
            .arg(format!("ytsearch{}:{query}", self.max_results));
        let output = self.toolbox.run(invocation).await?;
        let parsed = parse_json_lines(&output.stdout);

        // Entries without an id are as useless as lines that are not JSON.
        let mut skipped = parsed.skipped;
        let mut results = Vec::with_capacity(parsed.entries.len().min(self.max_results));
        for entry in &parsed.entries {
            if results.len() == self.max_results {
                break;
            }
            match SearchResult::project(entry, None, None) {
                Some(result) => results.push(result),
                None => {
                    skipped += 1;
                    warn!("skipping search entry without an id");
                }
            }
        }

        if results.is_empty() && skipped > 0 {
            return Err(UpstreamError::Malformed {
                tool: ToolKind::Extractor.name(),
                detail: format!("none of {skipped} output entries were usable"),
            });
        }
        Ok(results)
    }
}
