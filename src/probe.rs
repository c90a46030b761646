#![forbid(unsafe_code)]

//! Checks that the external tools are installed and answer a version query.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::tools::{ToolInvocation, ToolKind, Toolbox};

/// Availability of one external tool.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    pub present: bool,
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

/// Result of a probe. Recomputed on every call, never cached.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyStatus {
    pub extractor: ToolStatus,
    pub transcoder: ToolStatus,
}

impl DependencyStatus {
    pub fn all_present(&self) -> bool {
        self.extractor.present && self.transcoder.present
    }
}

/// Probes both tools. Never fails: anything that goes wrong turns into
/// `present: false` for that tool.
pub async fn probe(toolbox: &Toolbox) -> DependencyStatus {
    let (extractor, transcoder) = tokio::join!(
        probe_tool(toolbox, ToolKind::Extractor),
        probe_tool(toolbox, ToolKind::Transcoder)
    );
    DependencyStatus {
        extractor,
        transcoder,
    }
}

pub async fn probe_tool(toolbox: &Toolbox, kind: ToolKind) -> ToolStatus {
    let Some(path) = toolbox.resolve(kind) else {
        debug!(tool = kind.name(), "tool not found");
        return ToolStatus::default();
    };

    ensure_executable(&path);
    if !is_executable(&path) {
        debug!(tool = kind.name(), path = %path.display(), "tool is not executable");
        return ToolStatus {
            present: false,
            version: None,
            path: Some(path),
        };
    }

    let invocation = ToolInvocation::new(kind, path.clone(), toolbox.probe_timeout)
        .arg(kind.version_flag());
    match toolbox.run(invocation).await {
        Ok(output) => ToolStatus {
            present: true,
            version: first_line(&output.stdout),
            path: Some(path),
        },
        Err(err) => {
            debug!(tool = kind.name(), error = %err, "version query failed");
            ToolStatus {
                present: false,
                version: None,
                path: Some(path),
            }
        }
    }
}

fn first_line(raw: &[u8]) -> Option<String> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Adds the executable bits when they are missing. Failures are ignored, the
/// subsequent access check reports the outcome.
#[cfg(unix)]
fn ensure_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mut perms = metadata.permissions();
    if perms.mode() & 0o111 == 0o111 {
        return;
    }
    perms.set_mode(perms.mode() | 0o755);
    if let Err(err) = std::fs::set_permissions(path, perms) {
        debug!(path = %path.display(), error = %err, "could not set executable bits");
    }
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) {}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use nix::unistd::{AccessFlags, access};

    access(path, AccessFlags::X_OK).is_ok()
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
