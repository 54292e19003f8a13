//! Borrowed/owned path strings with an optional NUL terminator.
//!
//! Everything else in this crate (the search tree, the metadata store) keeps
//! absolute paths as plain byte strings rather than a decomposed component
//! tree. [`PathRepr`] is the small value type that lets call sites be explicit
//! about whether they're holding a borrowed slice or an owned,
//! NUL-terminated string, the way backpak keeps `Utf8Path`/`Utf8PathBuf`
//! distinct rather than passing `impl AsRef<Path>` everywhere.

use std::borrow::Cow;
use std::ffi::CStr;

/// A path, represented as bytes, with a flag for whether the byte
/// immediately following the content is `\0`.
///
/// We don't require UTF-8 here (unlike the rest of the crate, which uses
/// [`camino`] for filesystem paths) because the on-disk metadata format and
/// the config grammar both need to round-trip arbitrary bytes a hostile or
/// merely unusual filesystem might hand us.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathRepr<'a> {
    bytes: Cow<'a, [u8]>,
    terminated: bool,
}

impl<'a> PathRepr<'a> {
    /// Wrap a borrowed, non-NUL-terminated slice.
    pub fn borrowed(bytes: &'a [u8]) -> Self {
        Self {
            bytes: Cow::Borrowed(bytes),
            terminated: false,
        }
    }

    /// Wrap a borrowed slice that's known to be immediately followed by a
    /// `\0` byte (e.g., a slice taken from a larger NUL-terminated buffer).
    pub fn borrowed_terminated(bytes: &'a [u8]) -> Self {
        Self {
            bytes: Cow::Borrowed(bytes),
            terminated: true,
        }
    }

    /// Take ownership of a byte string. Never NUL-terminated:
    /// use [`PathRepr::terminate`] to get one that is.
    pub fn owned(bytes: Vec<u8>) -> PathRepr<'static> {
        PathRepr {
            bytes: Cow::Owned(bytes),
            terminated: false,
        }
    }

    pub fn from_str(s: &'a str) -> Self {
        Self::borrowed(s.as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn as_str(&self) -> anyhow::Result<&str> {
        std::str::from_utf8(&self.bytes).map_err(|e| anyhow::anyhow!("path isn't UTF-8: {e}"))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Byte-for-byte equality (length then contents - what `memcmp` gives
    /// you after a length check).
    pub fn byte_eq(&self, other: &PathRepr) -> bool {
        self.bytes == other.bytes
    }

    /// True if the path is empty or made up entirely of whitespace.
    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(|b| b.is_ascii_whitespace())
    }

    /// True if this represents `.` or `..`.
    pub fn is_dot_element(&self) -> bool {
        matches!(self.bytes.as_ref(), b"." | b"..")
    }

    /// Clone into an owned, NUL-terminated representation, copying only if
    /// we aren't already terminated.
    pub fn to_cstring(&self) -> Cow<CStr> {
        if self.terminated {
            // SAFETY: `terminated` is an invariant upheld by every
            // constructor: the byte right after our content is `\0`, and we
            // don't include it in `bytes`, so this slice-plus-NUL is valid
            // CStr data with no interior NUL (one is checked for below on
            // the copying path; callers that set `terminated` by hand on
            // data with an interior NUL have violated the contract).
            let with_nul = {
                let ptr = self.bytes.as_ptr();
                // The terminator byte lives one past the end of `bytes`.
                unsafe { std::slice::from_raw_parts(ptr, self.bytes.len() + 1) }
            };
            Cow::Borrowed(CStr::from_bytes_with_nul(with_nul).expect("interior NUL in path"))
        } else {
            let mut owned = self.bytes.to_vec();
            owned.push(0);
            Cow::Owned(std::ffi::CString::from_vec_with_nul(owned).expect("interior NUL in path"))
        }
    }

    /// Split at the last run of `/` characters, collapsing runs so that
    /// splitting `/home/foo///bar` yields (`/home/foo`, `//bar`) - the
    /// parent loses its trailing slashes, the child keeps whatever preceded
    /// the slash run that was actually matched on (none, for a normal
    /// single-slash path).
    ///
    /// Returns `None` if there's no `/` in the path at all.
    pub fn split_last_slash_group(&self) -> Option<(PathRepr<'_>, PathRepr<'_>)> {
        let bytes = self.as_bytes();
        let last_slash = bytes.iter().rposition(|&b| b == b'/')?;

        // Walk backwards over the run of slashes ending at `last_slash`.
        let mut run_start = last_slash;
        while run_start > 0 && bytes[run_start - 1] == b'/' {
            run_start -= 1;
        }

        let head = &bytes[..run_start];
        let tail = &bytes[last_slash + 1..];
        Some((PathRepr::borrowed(head), PathRepr::borrowed(tail)))
    }

    /// Strip a single trailing run of `/` characters, if any.
    pub fn strip_trailing_slash(&self) -> PathRepr<'_> {
        let bytes = self.as_bytes();
        let mut end = bytes.len();
        while end > 0 && bytes[end - 1] == b'/' {
            end -= 1;
        }
        PathRepr::borrowed(&bytes[..end])
    }

    /// True if `self` is an ancestor directory of `other`: `self` is a
    /// prefix of `other` and is immediately followed there by a `/`.
    pub fn is_parent_of(&self, other: &PathRepr) -> bool {
        let p = self.as_bytes();
        let c = other.as_bytes();
        c.len() > p.len() && &c[..p.len()] == p && c[p.len()] == b'/'
    }
}

/// Append `child` onto `parent`, inserting exactly one `/` between them
/// regardless of what either already has at the join point.
pub fn join(parent: &PathRepr, child: &PathRepr) -> PathRepr<'static> {
    let p = parent.strip_trailing_slash();
    let p = p.as_bytes();
    let c = child.as_bytes();
    let c = if c.first() == Some(&b'/') { &c[1..] } else { c };

    let mut joined = Vec::with_capacity(p.len() + 1 + c.len());
    joined.extend_from_slice(p);
    joined.push(b'/');
    joined.extend_from_slice(c);
    PathRepr::owned(joined)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_collapses_slash_runs() {
        let p = PathRepr::from_str("/home/foo///bar");
        let (head, tail) = p.split_last_slash_group().unwrap();
        assert_eq!(head.as_str().unwrap(), "/home/foo");
        assert_eq!(tail.as_str().unwrap(), "bar");
    }

    #[test]
    fn split_single_slash() {
        let p = PathRepr::from_str("/home/foo");
        let (head, tail) = p.split_last_slash_group().unwrap();
        assert_eq!(head.as_str().unwrap(), "/home");
        assert_eq!(tail.as_str().unwrap(), "foo");
    }

    #[test]
    fn split_then_join_round_trips_modulo_slash_collapse() {
        let original = PathRepr::from_str("/home/foo/bar");
        let (head, tail) = original.split_last_slash_group().unwrap();
        let rejoined = join(&head, &tail);
        assert_eq!(rejoined.as_str().unwrap(), original.as_str().unwrap());
    }

    #[test]
    fn join_inserts_exactly_one_slash() {
        let a = PathRepr::from_str("/home/foo/");
        let b = PathRepr::from_str("/bar");
        assert_eq!(join(&a, &b).as_str().unwrap(), "/home/foo/bar");

        let a = PathRepr::from_str("/home/foo");
        let b = PathRepr::from_str("bar");
        assert_eq!(join(&a, &b).as_str().unwrap(), "/home/foo/bar");
    }

    #[test]
    fn dot_elements() {
        assert!(PathRepr::from_str(".").is_dot_element());
        assert!(PathRepr::from_str("..").is_dot_element());
        assert!(!PathRepr::from_str("...").is_dot_element());
        assert!(!PathRepr::from_str("a").is_dot_element());
    }

    #[test]
    fn parent_test() {
        let parent = PathRepr::from_str("/a/b");
        assert!(parent.is_parent_of(&PathRepr::from_str("/a/b/c")));
        assert!(!parent.is_parent_of(&PathRepr::from_str("/a/bc")));
        assert!(!parent.is_parent_of(&PathRepr::from_str("/a/b")));
    }

    #[test]
    fn cstring_conversion() {
        let p = PathRepr::from_str("/a/b");
        let c = p.to_cstring();
        assert_eq!(c.to_bytes(), b"/a/b");
    }

    #[test]
    fn blank_detection() {
        assert!(PathRepr::from_str("").is_blank());
        assert!(PathRepr::from_str("   \t").is_blank());
        assert!(!PathRepr::from_str(" a ").is_blank());
    }
}
