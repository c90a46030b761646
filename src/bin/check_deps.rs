#![forbid(unsafe_code)]

//! Reports whether yt-dlp and ffmpeg are usable and how to install them when
//! they are not. Exits with status 1 if anything is missing.

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use tubegrab::{
    config::{SettingsOverrides, resolve_settings},
    logging::init_tracing,
    probe::{ToolStatus, probe},
    tools::{ToolKind, Toolbox},
};

#[derive(Debug, Parser)]
#[command(about = "Check that yt-dlp and ffmpeg are installed")]
struct CheckArgs {
    /// Directory holding yt-dlp and ffmpeg.
    #[arg(long)]
    bin_dir: Option<PathBuf>,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = CheckArgs::parse();
    init_tracing();
    let settings = resolve_settings(SettingsOverrides {
        bin_dir: args.bin_dir,
        env_path: args.env_file,
        ..SettingsOverrides::default()
    })
    .context("loading settings")?;

    let toolbox = Toolbox::from_settings(&settings);
    let status = probe(&toolbox).await;

    println!("Checking dependencies in {}", toolbox.bin_dir().display());
    let mut missing = Vec::new();
    for (kind, tool) in [
        (ToolKind::Extractor, &status.extractor),
        (ToolKind::Transcoder, &status.transcoder),
    ] {
        println!("{}", describe(kind, tool));
        if !tool.present {
            missing.push(kind);
        }
    }

    if missing.is_empty() {
        println!("All dependencies are installed.");
        return Ok(ExitCode::SUCCESS);
    }

    println!();
    for kind in missing {
        println!("To install {}:", kind.name());
        for hint in install_hints(kind) {
            println!("  {hint}");
        }
        println!(
            "  or place the binary at {}",
            toolbox.bin_dir().join(kind.file_name()).display()
        );
    }
    Ok(ExitCode::FAILURE)
}

fn describe(kind: ToolKind, tool: &ToolStatus) -> String {
    match (tool.present, &tool.version, &tool.path) {
        (true, version, Some(path)) => format!(
            "[ok]      {:<7} {} ({})",
            kind.name(),
            version.as_deref().unwrap_or("unknown version"),
            path.display()
        ),
        (false, _, Some(path)) => format!(
            "[broken]  {:<7} found at {} but it does not run",
            kind.name(),
            path.display()
        ),
        _ => format!("[missing] {:<7} not found", kind.name()),
    }
}

fn install_hints(kind: ToolKind) -> &'static [&'static str] {
    match kind {
        ToolKind::Extractor => &[
            "pip install -U yt-dlp",
            "brew install yt-dlp",
            "or download a release from https://github.com/yt-dlp/yt-dlp/releases",
        ],
        ToolKind::Transcoder => &[
            "sudo apt install ffmpeg",
            "brew install ffmpeg",
            "or download a build from https://ffmpeg.org/download.html",
        ],
    }
}
