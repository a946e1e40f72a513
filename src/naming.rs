//! Collision-free names for uploaded files.
//!
//! A desired name is tried unmodified first, then with `_1`, `_2`, ...
//! inserted before the extension. Callers claim each candidate with an
//! exclusive create and move on to the next one on `AlreadyExists`, so the
//! check and the write are a single step.

use crate::config::MAX_NAME_ATTEMPTS;

/// Reduces a client supplied filename to a bare, visible file name.
///
/// Returns `None` when nothing usable is left, e.g. for an empty filename
/// or a bare directory path.
pub fn sanitize_upload_name(raw: &str) -> Option<String> {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim().trim_start_matches('.').trim_start();
    if cleaned.is_empty() {
        return None;
    }
    Some(cleaned.to_string())
}

/// Splits `name` into base and extension, the extension keeping its dot.
///
/// A leading dot does not start an extension.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Lowercased extension without the dot, empty when there is none.
pub fn extension_of(name: &str) -> String {
    let (_, ext) = split_name(name);
    ext.trim_start_matches('.').to_ascii_lowercase()
}

/// Longest prefix of `name` that fits in `max_bytes` without splitting a char.
pub fn truncate_on_char_boundary(name: &str, max_bytes: usize) -> &str {
    if name.len() <= max_bytes {
        return name;
    }
    let mut end = max_bytes;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Candidate name for the given attempt; attempt 0 is the desired name.
pub fn candidate_name(desired: &str, attempt: u32) -> String {
    if attempt == 0 {
        return desired.to_string();
    }
    let (base, ext) = split_name(desired);
    format!("{base}_{attempt}{ext}")
}

/// Iterator over every candidate for `desired`, capped at `MAX_NAME_ATTEMPTS`.
pub fn candidates(desired: &str) -> impl Iterator<Item = String> + '_ {
    (0..MAX_NAME_ATTEMPTS).map(move |attempt| candidate_name(desired, attempt))
}
