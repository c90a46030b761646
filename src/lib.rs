#![forbid(unsafe_code)]

//! tubegrab: search videos and download their audio as MP3 through yt-dlp and
//! ffmpeg, behind a small HTTP API.

pub mod config;
pub mod download;
pub mod error;
pub mod filename;
pub mod logging;
pub mod metadata;
pub mod probe;
pub mod reaper;
pub mod search;
pub mod server;
pub mod tools;
pub mod video_url;

#[cfg(all(test, unix))]
mod testing;
