//! Utility functions for names, paths and locks

use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Longest cache filename before the segment id is hashed instead
const MAX_CACHE_NAME: usize = 120;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turn a manifest name into a directory-safe slug
///
/// Keeps ASCII alphanumerics, maps every other run of characters to a
/// single `-`, lowercases, and trims dashes from both ends.
///
/// ```
/// use newsweave::utils::slugify;
///
/// assert_eq!(slugify("My Show S01E01 [1080p]"), "my-show-s01e01-1080p");
/// ```
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut dash = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }

    if slug.is_empty() {
        "manifest".to_string()
    } else {
        slug
    }
}

/// Filesystem-safe filename for a cached segment body
///
/// Message ids may contain `/`, `$` and other characters that are awkward in
/// paths. Everything outside `[A-Za-z0-9._-]` becomes `_`; very long ids
/// are replaced by their SHA-256 hex digest.
pub fn cache_file_name(segment_id: &str) -> String {
    let trimmed = segment_id.trim_start_matches('<').trim_end_matches('>');
    let safe: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if safe.is_empty() || safe.len() > MAX_CACHE_NAME || safe.starts_with('.') {
        format!("{:x}", Sha256::digest(segment_id.as_bytes()))
    } else {
        safe
    }
}

/// Derive a manifest name from a URL or a filesystem path
///
/// Uses the last path segment without its extension, falling back to
/// `"manifest"` when there is nothing usable.
pub fn manifest_name(source: &str) -> String {
    if let Ok(parsed_url) = url::Url::parse(source)
        && matches!(parsed_url.scheme(), "http" | "https")
    {
        if let Some(mut segments) = parsed_url.path_segments()
            && let Some(last_segment) = segments.next_back()
            && !last_segment.is_empty()
        {
            return file_stem(last_segment);
        }
        return "manifest".to_string();
    }

    Path::new(source)
        .file_name()
        .and_then(|n| n.to_str())
        .map(file_stem)
        .unwrap_or_else(|| "manifest".to_string())
}

fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| name.to_string())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("a  b__c"), "a-b-c");
        assert_eq!(slugify("--Already-Sluggy--"), "already-sluggy");
        assert_eq!(slugify("???"), "manifest");
    }

    #[test]
    fn cache_file_name_strips_brackets_and_unsafe_chars() {
        assert_eq!(
            cache_file_name("<part1of5.abc$def@news.example.com>"),
            "part1of5.abc_def_news.example.com"
        );
        assert_eq!(cache_file_name("a/b\\c"), "a_b_c");
    }

    #[test]
    fn cache_file_name_hashes_long_or_hidden_ids() {
        let long = "x".repeat(200);
        let hashed = cache_file_name(&long);
        assert_eq!(hashed.len(), 64);
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));

        assert_eq!(cache_file_name("..").len(), 64);
    }

    #[test]
    fn manifest_name_from_url_and_path() {
        assert_eq!(
            manifest_name("https://indexer.example.com/get/show.s01e01.nzb"),
            "show.s01e01"
        );
        assert_eq!(manifest_name("https://indexer.example.com/"), "manifest");
        assert_eq!(manifest_name("/data/nzbs/Some Release.nzb"), "Some Release");
    }

    #[test]
    fn lock_recovers_from_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let clone = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert_eq!(*lock(&mutex), 1);
    }
}
