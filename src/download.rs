#![forbid(unsafe_code)]

//! Audio downloads.
//!
//! Each download runs as a job spawned on the runtime, so it finishes even if
//! the client that asked for it disconnects. Jobs are tracked per output
//! file: a request for a video that is already being fetched joins the
//! running job, and a request for one that was just produced reuses the file
//! while it is still being served. The produced file is deleted when the last
//! response holding it is dropped.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
};

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::fs::File;
use tracing::{debug, info, warn};

use crate::{
    error::{AppError, UpstreamError},
    filename::mp3_filename,
    metadata::fetch_video_info,
    reaper::{ActiveFiles, Reaper, remove_if_exists},
    tools::{ToolInvocation, ToolKind, Toolbox},
    video_url::{canonical_url, extract_video_id},
};

const OUTPUT_EXTENSION: &str = "mp3";
/// yt-dlp's quality scale runs from 0 (best) to 10 (worst).
const BEST_AUDIO_QUALITY: &str = "0";

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub source_identifier: String,
    pub canonical_url: String,
    pub output_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// A finished MP3 on disk. The file is removed when the last `Arc` pointing
/// at it goes away, unless a newer job for the same video has started.
#[derive(Debug)]
pub struct DownloadArtifact {
    pub job: DownloadJob,
    pub filename: String,
    pub size: u64,
    stem: String,
    registry: Arc<Registry>,
}

impl DownloadArtifact {
    pub fn path(&self) -> &Path {
        &self.job.output_path
    }

    pub async fn open(&self) -> Result<File, UpstreamError> {
        File::open(&self.job.output_path)
            .await
            .map_err(|err| UpstreamError::io(format!("opening {}", self.job.output_path.display()), &err))
    }
}

impl Drop for DownloadArtifact {
    fn drop(&mut self) {
        self.registry.release(&self.stem, &self.job.output_path);
    }
}

type JobOutcome = Result<Arc<DownloadArtifact>, AppError>;
type SharedJob = Shared<BoxFuture<'static, JobOutcome>>;

enum Slot {
    Pending(SharedJob),
    Ready(Weak<DownloadArtifact>),
}

impl Slot {
    fn is_live(&self) -> bool {
        match self {
            Slot::Pending(_) => true,
            Slot::Ready(artifact) => artifact.strong_count() > 0,
        }
    }
}

/// In-flight and recently produced downloads, keyed by output file stem.
#[derive(Default)]
struct Registry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

impl Registry {
    fn complete(&self, stem: &str, artifact: &Arc<DownloadArtifact>) {
        self.slots
            .lock()
            .insert(stem.to_string(), Slot::Ready(Arc::downgrade(artifact)));
    }

    /// Drops a failed job. The partial output is deleted before the slot is
    /// freed, so a retry registered afterwards never loses its file.
    fn abandon(&self, stem: &str, path: &Path) {
        let mut slots = self.slots.lock();
        if let Err(err) = remove_if_exists(path) {
            warn!(path = %path.display(), error = %err, "failed to delete partial output");
        }
        slots.remove(stem);
    }

    /// Called when an artifact is dropped. Holding the lock while deleting
    /// keeps a concurrent request from registering a new job for the same
    /// file halfway through.
    fn release(&self, stem: &str, path: &Path) {
        let mut slots = self.slots.lock();
        if slots.get(stem).is_some_and(Slot::is_live) {
            debug!(stem, "newer job owns the file, keeping it");
            return;
        }
        slots.remove(stem);
        match remove_if_exists(path) {
            Ok(true) => debug!(path = %path.display(), "deleted served file"),
            Ok(false) => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to delete served file"),
        }
    }

    fn is_active(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return false;
        };
        self.slots.lock().iter().any(|(stem, slot)| {
            name.strip_prefix(stem.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
                && slot.is_live()
        })
    }

    fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count()
    }
}

#[derive(Debug)]
struct DownloadInner {
    toolbox: Toolbox,
    reaper: Reaper,
    registry: Arc<Registry>,
}

#[derive(Debug, Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<DownloadInner>,
}

impl DownloadOrchestrator {
    pub fn new(toolbox: Toolbox, reaper: Reaper) -> Self {
        Self {
            inner: Arc::new(DownloadInner {
                toolbox,
                reaper,
                registry: Arc::new(Registry::default()),
            }),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        self.inner.reaper.temp_dir()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.registry.in_flight()
    }

    /// Fetches the audio for `identifier` (a bare video id or a URL) as an
    /// MP3 in the temp directory.
    pub async fn download(&self, identifier: &str) -> Result<Arc<DownloadArtifact>, AppError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(AppError::validation("A video id or URL is required"));
        }
        let url = canonical_url(identifier)
            .ok_or_else(|| AppError::validation("Expected a video id or an http(s) URL"))?;
        let extractor = self.inner.toolbox.require(ToolKind::Extractor)?;
        let transcoder = self.inner.toolbox.require(ToolKind::Transcoder)?;

        let stem = output_stem(&url);
        let output_path = self
            .temp_dir()
            .join(format!("{stem}.{OUTPUT_EXTENSION}"));

        let job = {
            let mut slots = self.inner.registry.slots.lock();
            match slots.get(&stem) {
                Some(Slot::Pending(job)) => {
                    debug!(%url, "joining in-flight download");
                    job.clone()
                }
                Some(Slot::Ready(artifact)) => match artifact.upgrade() {
                    Some(artifact) => {
                        debug!(%url, "reusing file that is still being served");
                        return Ok(artifact);
                    }
                    None => self.start_job(
                        &mut slots,
                        identifier,
                        url,
                        stem,
                        output_path,
                        extractor,
                        transcoder,
                    ),
                },
                None => self.start_job(
                    &mut slots,
                    identifier,
                    url,
                    stem,
                    output_path,
                    extractor,
                    transcoder,
                ),
            }
        };

        job.await
    }

    #[allow(clippy::too_many_arguments)]
    fn start_job(
        &self,
        slots: &mut HashMap<String, Slot>,
        identifier: &str,
        url: String,
        stem: String,
        output_path: PathBuf,
        extractor: PathBuf,
        transcoder: PathBuf,
    ) -> SharedJob {
        let job = DownloadJob {
            source_identifier: identifier.to_string(),
            canonical_url: url,
            output_path,
            created_at: Utc::now(),
        };
        info!(url = %job.canonical_url, path = %job.output_path.display(), "starting download job");

        let inner = self.inner.clone();
        let task_stem = stem.clone();
        let handle = tokio::spawn(async move {
            let output_path = job.output_path.clone();
            let outcome = run_job(&inner, job, task_stem.clone(), extractor, transcoder).await;
            match &outcome {
                Ok(artifact) => inner.registry.complete(&task_stem, artifact),
                Err(err) => {
                    inner.registry.abandon(&task_stem, &output_path);
                    warn!(stem = %task_stem, error = %err, "download job failed");
                }
            }
            outcome
        });

        let shared = async move {
            handle.await.unwrap_or_else(|err| {
                Err(AppError::Upstream(UpstreamError::Io {
                    context: "download task".into(),
                    detail: err.to_string(),
                }))
            })
        }
        .boxed()
        .shared();

        slots.insert(stem, Slot::Pending(shared.clone()));
        shared
    }
}

impl ActiveFiles for DownloadOrchestrator {
    fn is_active(&self, path: &Path) -> bool {
        self.inner.registry.is_active(path)
    }
}

async fn run_job(
    inner: &DownloadInner,
    job: DownloadJob,
    stem: String,
    extractor: PathBuf,
    transcoder: PathBuf,
) -> JobOutcome {
    let toolbox = &inner.toolbox;
    let info = fetch_video_info(toolbox, extractor.clone(), &job.canonical_url).await?;
    let title = info
        .display_title()
        .or(info.video_id())
        .unwrap_or(&stem)
        .to_string();

    let template = inner.reaper.temp_dir().join(format!("{stem}.%(ext)s"));
    let invocation = ToolInvocation::new(ToolKind::Extractor, extractor, toolbox.download_timeout)
        .args([
            "-x",
            "--audio-format",
            OUTPUT_EXTENSION,
            "--audio-quality",
            BEST_AUDIO_QUALITY,
            "--no-playlist",
            "--no-part",
            "--no-warnings",
            "--ffmpeg-location",
        ])
        .arg(&transcoder)
        .arg("-o")
        .arg(&template)
        .arg("--")
        .arg(&job.canonical_url);
    toolbox.run(invocation).await?;

    let size = match tokio::fs::metadata(&job.output_path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => {
            return Err(UpstreamError::FileNotProduced {
                path: job.output_path.clone(),
            }
            .into());
        }
    };

    info!(
        url = %job.canonical_url,
        path = %job.output_path.display(),
        size,
        elapsed_ms = (Utc::now() - job.created_at).num_milliseconds(),
        "download finished"
    );
    Ok(Arc::new(DownloadArtifact {
        filename: mp3_filename(&title),
        size,
        job,
        stem,
        registry: inner.registry.clone(),
    }))
}

/// File stem for a canonical URL: the video id when one can be read from the
/// URL, otherwise a short hash of the URL.
pub fn output_stem(url: &str) -> String {
    extract_video_id(url).unwrap_or_else(|| {
        let hash = blake3::hash(url.as_bytes());
        hash.to_hex().as_str()[..16].to_string()
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::{
        count_calls, install_fake_ffmpeg, install_fake_ytdlp, settings_for, toolbox_for,
    };
    use std::time::Duration;
    use tempfile::tempdir;

    fn orchestrator(base: &Path) -> DownloadOrchestrator {
        let settings = settings_for(base);
        DownloadOrchestrator::new(
            toolbox_for(base),
            Reaper::new(settings.temp_dir, settings.retention),
        )
    }

    fn ready(base: &Path) -> (PathBuf, DownloadOrchestrator) {
        let log = install_fake_ytdlp(base);
        install_fake_ffmpeg(base);
        (log, orchestrator(base))
    }

    #[test]
    fn output_stem_prefers_video_id() {
        assert_eq!(output_stem("https://www.youtube.com/watch?v=abc123"), "abc123");
        let hashed = output_stem("https://example.com/video/9");
        assert_eq!(hashed.len(), 16);
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hashed, output_stem("https://example.com/video/9"));
    }

    #[tokio::test]
    async fn downloads_into_deterministic_path_and_cleans_up_on_drop() {
        let dir = tempdir().unwrap();
        let (log, downloads) = ready(dir.path());

        let artifact = downloads.download("abc123").await.unwrap();
        let expected = dir.path().join("temp").join("abc123.mp3");
        assert_eq!(artifact.path(), expected);
        assert_eq!(artifact.filename, "Title abc123.mp3");
        assert_eq!(artifact.job.source_identifier, "abc123");
        assert_eq!(
            artifact.job.canonical_url,
            "https://www.youtube.com/watch?v=abc123"
        );
        assert!(expected.exists());
        assert!(downloads.is_active(&expected));

        let args = fs_read(&log);
        assert!(args.contains("-x --audio-format mp3 --audio-quality 0"));
        assert!(args.contains("--ffmpeg-location"));

        drop(artifact);
        assert!(!expected.exists());
        assert!(!downloads.is_active(&expected));
    }

    #[tokio::test]
    async fn same_identifier_shares_one_invocation() {
        let dir = tempdir().unwrap();
        let (log, downloads) = ready(dir.path());

        let (first, second) = tokio::join!(
            downloads.download("same01"),
            downloads.download("https://youtu.be/same01")
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(count_calls(&log, "-x "), 1);

        let path = first.path().to_path_buf();
        drop(first);
        assert!(path.exists(), "still held by the second response");
        drop(second);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn distinct_identifiers_do_not_collide() {
        let dir = tempdir().unwrap();
        let (log, downloads) = ready(dir.path());

        let (left, right) = tokio::join!(downloads.download("left01"), downloads.download("right01"));
        let (left, right) = (left.unwrap(), right.unwrap());
        assert_ne!(left.path(), right.path());
        assert_eq!(std::fs::read(left.path()).unwrap(), b"ID3-fake-audio-left01");
        assert_eq!(std::fs::read(right.path()).unwrap(), b"ID3-fake-audio-right01");
        assert_eq!(count_calls(&log, "-x "), 2);
    }

    #[tokio::test]
    async fn sanitizes_hostile_titles() {
        let dir = tempdir().unwrap();
        let (_log, downloads) = ready(dir.path());
        let artifact = downloads.download("weird").await.unwrap();
        assert_eq!(artifact.filename, "..evilname.mp3");
        assert_eq!(artifact.path(), dir.path().join("temp").join("weird.mp3"));
    }

    #[tokio::test]
    async fn missing_output_is_reported() {
        let dir = tempdir().unwrap();
        let (_log, downloads) = ready(dir.path());
        let err = downloads.download("noop").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Upstream(UpstreamError::FileNotProduced { .. })
        ));
        assert_eq!(downloads.in_flight(), 0);
        assert!(!dir.path().join("temp").join("noop.mp3").exists());
    }

    #[tokio::test]
    async fn failed_extraction_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let (log, downloads) = ready(dir.path());
        let err = downloads.download("partial").await.unwrap_err();
        assert!(matches!(err, AppError::Upstream(UpstreamError::Exit { .. })));
        assert_eq!(count_calls(&log, "-x "), 1);
        assert!(!dir.path().join("temp").join("partial.mp3").exists());
        assert_eq!(downloads.in_flight(), 0);
    }

    #[tokio::test]
    async fn upstream_failures_are_not_retried() {
        let dir = tempdir().unwrap();
        let (log, downloads) = ready(dir.path());
        let err = downloads.download("broken").await.unwrap_err();
        assert!(matches!(err, AppError::Upstream(UpstreamError::Exit { .. })));
        assert_eq!(count_calls(&log, "broken"), 1);
    }

    #[tokio::test]
    async fn hung_extractor_times_out() {
        let dir = tempdir().unwrap();
        install_fake_ytdlp(dir.path());
        install_fake_ffmpeg(dir.path());
        let settings = settings_for(dir.path());
        let mut toolbox = toolbox_for(dir.path());
        toolbox.tool_timeout = Duration::from_millis(200);
        let downloads =
            DownloadOrchestrator::new(toolbox, Reaper::new(settings.temp_dir, settings.retention));

        let err = downloads.download("hang").await.unwrap_err();
        match err {
            AppError::Upstream(err) => assert!(err.is_timeout()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn validates_identifier_before_running_anything() {
        let dir = tempdir().unwrap();
        let (log, downloads) = ready(dir.path());
        for bad in ["", "  ", "../../etc/passwd", "ftp://example.com/a"] {
            let err = downloads.download(bad).await.unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{bad:?}");
        }
        assert!(!log.exists());
    }

    #[tokio::test]
    async fn missing_transcoder_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let log = install_fake_ytdlp(dir.path());
        let downloads = orchestrator(dir.path());
        let err = downloads.download("abc123").await.unwrap_err();
        assert!(matches!(err, AppError::Configuration { tool: "ffmpeg" }));
        assert!(!log.exists());
    }

    #[tokio::test]
    async fn redownload_after_release_produces_a_fresh_file() {
        let dir = tempdir().unwrap();
        let (log, downloads) = ready(dir.path());
        let first = downloads.download("again01").await.unwrap();
        let path = first.path().to_path_buf();
        drop(first);
        assert!(!path.exists());

        let second = downloads.download("again01").await.unwrap();
        assert!(second.path().exists());
        assert_eq!(count_calls(&log, "-x "), 2);
    }

    fn fs_read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }
}
