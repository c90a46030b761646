#![forbid(unsafe_code)]

//! Locating and running the external binaries.
//!
//! Every invocation gets an explicit executable path and its own `PATH`
//! value (the bin directory prepended) so the process environment of the
//! server is never modified. Each call also carries a deadline; when it
//! elapses the child is killed and the caller sees `UpstreamError::TimedOut`.

use std::{
    env,
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    config::Settings,
    error::{AppError, UpstreamError},
};

const STDERR_TAIL_LINES: usize = 20;
const STDERR_TAIL_BYTES: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Extractor,
    Transcoder,
}

impl ToolKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Extractor => "yt-dlp",
            Self::Transcoder => "ffmpeg",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}{}", self.name(), env::consts::EXE_SUFFIX)
    }

    /// ffmpeg only understands the single-dash spelling.
    pub fn version_flag(self) -> &'static str {
        match self {
            Self::Extractor => "--version",
            Self::Transcoder => "-version",
        }
    }
}

/// Knows where the external tools live and how long each kind of call may
/// take.
#[derive(Debug, Clone)]
pub struct Toolbox {
    bin_dir: PathBuf,
    extractor: Option<PathBuf>,
    transcoder: Option<PathBuf>,
    search_path: Option<OsString>,
    path_lookup: bool,
    pub tool_timeout: Duration,
    pub download_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Toolbox {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bin_dir: absolutize(&settings.bin_dir),
            extractor: settings.extractor_path.clone(),
            transcoder: settings.transcoder_path.clone(),
            search_path: env::var_os("PATH"),
            path_lookup: true,
            tool_timeout: settings.tool_timeout,
            download_timeout: settings.download_timeout,
            probe_timeout: settings.probe_timeout,
        }
    }

    /// Disables the `PATH` fallback so only the bin directory and explicit
    /// paths are considered. Children still inherit the original `PATH`.
    pub fn without_path_lookup(mut self) -> Self {
        self.path_lookup = false;
        self
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    /// Finds the executable for `kind` using only the filesystem: the
    /// explicit path if configured, then the bin directory, then `PATH`.
    pub fn resolve(&self, kind: ToolKind) -> Option<PathBuf> {
        let explicit = match kind {
            ToolKind::Extractor => self.extractor.as_ref(),
            ToolKind::Transcoder => self.transcoder.as_ref(),
        };
        if let Some(path) = explicit {
            return path.is_file().then(|| path.clone());
        }

        let file_name = kind.file_name();
        let local = self.bin_dir.join(&file_name);
        if local.is_file() {
            return Some(local);
        }

        if !self.path_lookup {
            return None;
        }
        let search = self.search_path.as_ref()?;
        env::split_paths(search)
            .map(|dir| dir.join(&file_name))
            .find(|candidate| candidate.is_file())
    }

    /// Same as [`Toolbox::resolve`] but reports a missing tool as a
    /// configuration error.
    pub fn require(&self, kind: ToolKind) -> Result<PathBuf, AppError> {
        self.resolve(kind)
            .ok_or(AppError::Configuration { tool: kind.name() })
    }

    /// `PATH` for child processes: the bin directory first, then whatever the
    /// server was started with.
    pub fn child_path_env(&self) -> OsString {
        let mut dirs = vec![self.bin_dir.clone()];
        if let Some(search) = &self.search_path {
            dirs.extend(env::split_paths(search));
        }
        env::join_paths(dirs).unwrap_or_else(|_| self.bin_dir.clone().into_os_string())
    }

    /// Runs the invocation to completion, failing on spawn errors, non-zero
    /// exit or the deadline.
    pub async fn run(&self, invocation: ToolInvocation) -> Result<Output, UpstreamError> {
        let tool = invocation.kind.name();
        debug!(
            tool,
            program = %invocation.program.display(),
            args = ?invocation.args,
            "running external tool"
        );

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .env("PATH", self.child_path_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Dropping the `output()` future on timeout kills the child.
        let output = match tokio::time::timeout(invocation.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                warn!(tool, error = %err, "failed to launch external tool");
                return Err(UpstreamError::Launch {
                    tool,
                    detail: err.to_string(),
                });
            }
            Err(_) => {
                warn!(
                    tool,
                    timeout_secs = invocation.timeout.as_secs(),
                    "external tool timed out, killed"
                );
                return Err(UpstreamError::TimedOut {
                    tool,
                    timeout: invocation.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = stderr_tail(&output.stderr);
            warn!(tool, status = %output.status, stderr = %stderr, "external tool failed");
            return Err(UpstreamError::Exit {
                tool,
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(output)
    }
}

/// One call to an external tool.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    kind: ToolKind,
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
}

impl ToolInvocation {
    pub fn new(kind: ToolKind, program: PathBuf, timeout: Duration) -> Self {
        Self {
            kind,
            program,
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }
}

fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let mut tail = lines[start..].join("\n");
    if tail.len() > STDERR_TAIL_BYTES {
        let mut cut = tail.len() - STDERR_TAIL_BYTES;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail = tail.split_off(cut);
    }
    tail
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
