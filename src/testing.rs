//! Stub executables and fixtures shared by the unit tests.

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use crate::{config::Settings, tools::Toolbox};

/// Writes `body` as a `/bin/sh` script named `name` inside `dir` and marks it
/// executable.
pub fn install_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn settings_for(base: &Path) -> Settings {
    let settings = Settings::rooted_at(base);
    fs::create_dir_all(&settings.temp_dir).unwrap();
    settings
}

/// A toolbox that only looks inside `<base>/bin`, so tools installed on the
/// host never leak into a test.
pub fn toolbox_for(base: &Path) -> Toolbox {
    Toolbox::from_settings(&Settings::rooted_at(base)).without_path_lookup()
}

/// Installs a fake `yt-dlp` into `<base>/bin` that logs each call to
/// `<base>/yt-dlp.log`. Returns the log path.
///
/// Behaviour by video id (taken from `v=` or `youtu.be/`):
/// * `hang` sleeps for 30 seconds,
/// * `broken` fails with an error on stderr,
/// * `noop` exits successfully without writing the audio file,
/// * `partial` writes the audio file and then fails,
/// * `weird` reports a title full of path and shell metacharacters.
///
/// Keyword searches print twelve results with a garbage line and an entry
/// without an id mixed in.
pub fn install_fake_ytdlp(base: &Path) -> PathBuf {
    let log = base.join("yt-dlp.log");
    let script = r#"LOG='__LOG__'
echo "$*" >> "$LOG"
if [ "$1" = "--version" ]; then
  echo "2024.12.13"
  exit 0
fi

mode=""
output=""
target=""
while [ $# -gt 0 ]; do
  case "$1" in
    --dump-single-json) mode="single" ;;
    --dump-json) mode="search" ;;
    -x) mode="extract" ;;
    -o) shift; output="$1" ;;
    --) shift; target="$1" ;;
    ytsearch*) target="$1" ;;
  esac
  shift
done

id=$(printf '%s' "$target" | sed -e 's/.*[?&]v=\([A-Za-z0-9_-]*\).*/\1/' -e 's#.*youtu\.be/\([A-Za-z0-9_-]*\).*#\1#')

case "$id" in
  hang) exec sleep 30 ;;
  broken) echo "ERROR: [youtube] broken: Video unavailable" >&2; exit 1 ;;
esac

if [ "$mode" = "single" ]; then
  if [ "$id" = "weird" ]; then
    printf '{"id":"weird","title":"../evil:\\"na|me\\"?\\u0007","duration":61}\n'
  else
    printf '{"id":"%s","title":"Title %s","thumbnail":"https://i.ytimg.com/vi/%s/hq.jpg","duration":212.5,"uploader":"Uploader","view_count":42}\n' "$id" "$id" "$id"
  fi
  exit 0
fi

if [ "$mode" = "search" ]; then
  i=1
  while [ $i -le 12 ]; do
    printf '{"id":"vid%02d","title":"Result %d","thumbnails":[{"url":"https://t/%d/small.jpg"},{"url":"https://t/%d/large.jpg"}],"duration":%d,"channel":"Channel %d"}\n' $i $i $i $i $((i * 10)) $i
    if [ $i -eq 1 ]; then
      echo "this line is not json"
      echo '{"title":"entry without id"}'
    fi
    i=$((i + 1))
  done
  exit 0
fi

if [ "$mode" = "extract" ]; then
  sleep 0.3
  if [ "$id" = "noop" ]; then
    exit 0
  fi
  out=$(printf '%s' "$output" | sed 's/%(ext)s/mp3/')
  printf 'ID3-fake-audio-%s' "$id" > "$out"
  if [ "$id" = "partial" ]; then
    echo "ERROR: Postprocessing: audio conversion failed" >&2
    exit 1
  fi
  exit 0
fi

exit 0"#
        .replace("__LOG__", &log.to_string_lossy());
    install_stub(&base.join("bin"), "yt-dlp", &script);
    log
}

pub fn install_fake_ffmpeg(base: &Path) -> PathBuf {
    install_stub(
        &base.join("bin"),
        "ffmpeg",
        "echo 'ffmpeg version 6.1.1 Copyright (c) 2000-2023'\nexit 0",
    )
}

/// Number of times the fake `yt-dlp` ran with an argument containing
/// `needle`.
pub fn count_calls(log: &Path, needle: &str) -> usize {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .filter(|line| line.contains(needle))
        .count()
}
