//! File name sanitization for received files.

/// Longest sanitized name in bytes
pub const MAX_FILENAME_BYTES: usize = 255;

/// Fallback for names that sanitize to nothing
const FALLBACK_NAME: &str = "received-file";

const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Reduce a sender-supplied name to one safe path component.
///
/// Keeps only the last path component, drops control characters and
/// characters that are invalid on common filesystems, trims leading dots
/// and trailing dots or spaces, prefixes Windows device names, and
/// truncates to [`MAX_FILENAME_BYTES`] on a character boundary while
/// keeping the extension where possible.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or("");

    let cleaned: String = last
        .chars()
        .filter(|c| !c.is_control())
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*'))
        .collect();

    let trimmed = cleaned
        .trim_start_matches(['.', ' '])
        .trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        return FALLBACK_NAME.to_string();
    }

    let stem = trimmed.split('.').next().unwrap_or(trimmed);
    let mut safe = if WINDOWS_RESERVED
        .iter()
        .any(|r| r.eq_ignore_ascii_case(stem))
    {
        format!("_{trimmed}")
    } else {
        trimmed.to_string()
    };

    if safe.len() > MAX_FILENAME_BYTES {
        safe = truncate_keeping_extension(&safe);
    }
    safe
}

fn truncate_keeping_extension(name: &str) -> String {
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if name.len() - dot <= 16 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    let budget = MAX_FILENAME_BYTES - ext.len();
    let mut end = budget.min(stem.len());
    while !stem.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &stem[..end], ext)
}
