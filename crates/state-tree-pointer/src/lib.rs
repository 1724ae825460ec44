//! JSON Pointer (RFC 6901) utilities.
//!
//! Path segments are escaped per segment (`~` → `~0`, `/` → `~1`) and joined
//! with `/`. Besides absolute pointers this crate understands the relative
//! form used for action replay, where a pointer may start with `..` segments
//! that climb towards the root.
//!
//! # Example
//!
//! ```
//! use state_tree_pointer::{split_pointer, join_pointer};
//!
//! let segments = split_pointer("/todos/0/title");
//! assert_eq!(segments, vec!["todos", "0", "title"]);
//! assert_eq!(join_pointer(&segments), "/todos/0/title");
//! ```

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PointerError {
    #[error("pointer segment index is not a valid number: {0}")]
    NotAnIndex(String),
}

/// Escapes one pointer segment.
///
/// Order matters: `~` must be replaced before `/`.
pub fn escape_segment(segment: &str) -> String {
    if !segment.contains('~') && !segment.contains('/') {
        return segment.to_string();
    }
    segment.replace('~', "~0").replace('/', "~1")
}

/// Unescapes one pointer segment.
///
/// Order matters: `~1` must be replaced before `~0`.
pub fn unescape_segment(segment: &str) -> String {
    if !segment.contains('~') {
        return segment.to_string();
    }
    segment.replace("~1", "/").replace("~0", "~")
}

/// Splits a pointer into unescaped segments.
///
/// A leading `/` (absolute pointer) contributes no segment; an empty string
/// means "the node itself" and splits to no segments. Relative pointers keep
/// every segment, so `"../../b"` splits to `["..", "..", "b"]`.
///
/// Note `"/"` refers to the property with an empty name, not to the root.
pub fn split_pointer(pointer: &str) -> Vec<String> {
    if pointer.is_empty() {
        return Vec::new();
    }
    let segments: Vec<String> = pointer.split('/').map(unescape_segment).collect();
    if segments[0].is_empty() && pointer.starts_with('/') {
        segments[1..].to_vec()
    } else {
        segments
    }
}

/// Formats unescaped segments into an absolute pointer.
///
/// An empty slice formats as `""`, the pointer of the node itself.
pub fn join_pointer<S: AsRef<str>>(segments: &[S]) -> String {
    if segments.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(&escape_segment(segment.as_ref()));
    }
    out
}

/// Interprets a segment as a list index. `"-"` means "append at the end".
pub fn parse_index(segment: &str, len: usize) -> Result<usize, PointerError> {
    if segment == "-" {
        return Ok(len);
    }
    segment
        .parse::<usize>()
        .map_err(|_| PointerError::NotAnIndex(segment.to_string()))
}

/// Computes the relative pointer that leads from `from` to `to`, both given
/// as absolute pointers of nodes in one tree. Shared leading segments are
/// dropped; every remaining `from` segment becomes `..`.
pub fn relative_pointer(from: &str, to: &str) -> String {
    let from_segments = split_pointer(from);
    let to_segments = split_pointer(to);

    let mut common = 0;
    while common < from_segments.len()
        && common < to_segments.len()
        && from_segments[common] == to_segments[common]
    {
        common += 1;
    }

    let ups: Vec<&str> = from_segments[common..].iter().map(|_| "..").collect();
    let down = join_pointer(&to_segments[common..]);
    format!("{}{}", ups.join("/"), down)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_roundtrip() {
        assert_eq!(escape_segment("a/b"), "a~1b");
        assert_eq!(escape_segment("a~b"), "a~0b");
        assert_eq!(unescape_segment("a~1b"), "a/b");
        assert_eq!(unescape_segment("a~0b"), "a~b");
        assert_eq!(unescape_segment(&escape_segment("~/~1")), "~/~1");
    }

    #[test]
    fn split_absolute_and_empty() {
        assert_eq!(split_pointer(""), Vec::<String>::new());
        assert_eq!(split_pointer("/a/b"), vec!["a", "b"]);
        assert_eq!(split_pointer("/"), vec![""]);
        assert_eq!(split_pointer("/a~1b/~0k/0"), vec!["a/b", "~k", "0"]);
    }

    #[test]
    fn split_relative_keeps_climbs() {
        assert_eq!(split_pointer("../../b/c"), vec!["..", "..", "b", "c"]);
    }

    #[test]
    fn join_empty_is_root() {
        assert_eq!(join_pointer(&[] as &[&str]), "");
        assert_eq!(join_pointer(&["a", "b/c"]), "/a/b~1c");
    }

    #[test]
    fn index_parsing() {
        assert_eq!(parse_index("0", 3).unwrap(), 0);
        assert_eq!(parse_index("-", 3).unwrap(), 3);
        assert!(parse_index("x", 3).is_err());
    }

    #[test]
    fn relative_pointer_between_nodes() {
        assert_eq!(relative_pointer("/todos/1", "/todos/1/title"), "/title");
        assert_eq!(relative_pointer("/todos/1", "/filter"), "../../filter");
        assert_eq!(relative_pointer("", "/todos"), "/todos");
        assert_eq!(relative_pointer("/a", "/a"), "");
    }
}
