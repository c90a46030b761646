#![forbid(unsafe_code)]

//! Turning arbitrary video titles into safe file names and
//! `Content-Disposition` values.

const MAX_FILENAME_BYTES: usize = 200;
const MP3_EXTENSION: &str = ".mp3";
const FALLBACK_NAME: &str = "audio";
const ILLEGAL: [char; 9] = ['/', '\\', '?', '<', '>', ':', '*', '|', '"'];
const WINDOWS_RESERVED: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Strips separators, characters reserved by common filesystems and control
/// characters. Never returns an empty string, `.` or `..`.
pub fn sanitize_filename(raw: &str) -> String {
    sanitize_within(raw, MAX_FILENAME_BYTES)
}

fn sanitize_within(raw: &str, max_bytes: usize) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !ILLEGAL.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_end_matches(['.', ' ']).trim_start();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') || is_windows_reserved(cleaned) {
        return FALLBACK_NAME.to_string();
    }
    truncate_on_char_boundary(cleaned, max_bytes)
        .trim_end_matches(['.', ' '])
        .to_string()
}

/// `CON`, `nul.txt`, `Lpt3.mp3` and friends.
fn is_windows_reserved(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name).trim_end();
    WINDOWS_RESERVED
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
}

fn truncate_on_char_boundary(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Sanitized `<title>.mp3`, extension included in the length cap.
pub fn mp3_filename(title: &str) -> String {
    let stem = sanitize_within(title, MAX_FILENAME_BYTES - MP3_EXTENSION.len());
    format!("{stem}{MP3_EXTENSION}")
}

/// `attachment` disposition with an ASCII `filename` for old clients and an
/// RFC 5987 `filename*` carrying the UTF-8 name. Expects a name that already
/// went through [`sanitize_filename`] or [`mp3_filename`]; it is encoded, not
/// shortened.
pub fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && !matches!(c, '%' | '"' | '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}
