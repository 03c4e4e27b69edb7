//! Filepath: src/glob.rs
//!
//! Shell-style wildcard matching for the name index.
//!
//! Patterns support `*` (any run of characters), `?` (exactly one
//! character) and the special leading `*/` form, which matches exactly one
//! directory level before the rest of the pattern applies inside it. A
//! pattern may span directory boundaries: matching a child name consumes a
//! *prefix* of the pattern, and the unconsumed remainder continues against
//! the child's own children.
//!
//! Matching is ASCII-case-insensitive, like every name comparison in the
//! tree.

use crate::path::is_separator;

/// Match `name` against the leading portion of `pattern`.
///
/// Returns the index of the first pattern byte left unconsumed once the
/// whole name has matched, or `None` if the name does not match. Leading
/// separators in the pattern are skipped first, so a remainder such as
/// `/x.log` handed down from a directory descent matches like `x.log`.
///
/// # Example
///
/// ```
/// use shmtree::glob::partial_match;
///
/// // Full consumption: the name is a hit.
/// assert_eq!(partial_match(b"foo.txt", b"*.txt"), Some(5));
/// // Partial consumption: `/bar.log` continues inside `foo`.
/// assert_eq!(partial_match(b"foo", b"foo/bar.log"), Some(3));
/// assert_eq!(partial_match(b"foo.txt", b"*.log"), None);
/// ```
#[must_use]
pub fn partial_match(name: &[u8], pattern: &[u8]) -> Option<usize> {
    let skip = pattern
        .iter()
        .position(|&b| !is_separator(b))
        .unwrap_or(pattern.len());
    let pat = &pattern[skip..];
    let rest = match_here(name, pat)?;
    Some(pattern.len() - rest.len())
}

/// Recursive matcher core: returns the unconsumed pattern tail.
fn match_here<'p>(name: &[u8], pat: &'p [u8]) -> Option<&'p [u8]> {
    if name.is_empty() {
        return Some(pat);
    }
    match pat.first() {
        None => None,

        Some(b'*') => {
            // A star may swallow any run of name characters, including
            // none; take the first split whose tail matches.
            (0..=name.len()).find_map(|n| match_here(&name[n..], &pat[1..]))
        }

        Some(b'?') => match_here(&name[1..], &pat[1..]),

        Some(&c) => {
            if c.eq_ignore_ascii_case(&name[0]) {
                match_here(&name[1..], &pat[1..])
            } else {
                None
            }
        }
    }
}

/// True when an unconsumed remainder still counts as a full match.
///
/// An empty remainder matched everything; a bare `*` matches the empty
/// tail of the name.
#[inline]
#[must_use]
pub(crate) fn remainder_is_hit(rest: &[u8]) -> bool {
    rest.is_empty() || rest == b"*"
}

/// True when the pattern starts with the one-directory-level wildcard
/// (`*/` or `*\`).
#[inline]
#[must_use]
pub(crate) fn starts_with_dir_star(pattern: &[u8]) -> bool {
    pattern.len() > 1 && pattern[0] == b'*' && is_separator(pattern[1])
}

/// Split a pattern into its literal directory prefix and the wildcard
/// remainder.
///
/// Everything before the last separator preceding the first `*` or `?` is
/// literal and can be resolved by a plain path walk; matching proper only
/// starts after it. Returns `None` when there is no usable literal prefix
/// (the pattern starts with a wildcard, or contains none before the first
/// separator).
#[must_use]
pub(crate) fn split_fixed_prefix(pattern: &str) -> Option<(&str, &str)> {
    let bytes = pattern.as_bytes();
    let wild = bytes.iter().position(|&b| b == b'*' || b == b'?')?;
    if wild == 0 {
        return None;
    }
    let sep = bytes[..wild].iter().rposition(|&b| is_separator(b))?;
    Some((&pattern[..sep], &pattern[sep + 1..]))
}

// ============================================================================
// Tests
// ============================================================================
