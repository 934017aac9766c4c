//! CDATA region location and replacement.
//!
//! Pure text functions over host document content. No document model is
//! built: regions are located by scanning for the literal delimiters, and
//! replacement splices bytes around the matched span. Everything the rest of
//! the server does relies on these two functions agreeing on what counts as
//! a region.

use std::sync::LazyLock;

use regex::Regex;

/// Opening delimiter of a CDATA section.
pub const CDATA_OPEN: &str = "<![CDATA[";

/// Closing delimiter of a CDATA section.
pub const CDATA_CLOSE: &str = "]]>";

/// Non-greedy, dot-matches-newline span pattern: each span runs from an open
/// marker to the *nearest* following close marker. A close marker occurring
/// inside what a human would read as nested content terminates the span
/// early; that ambiguity is inherent to the delimiter syntax and is pinned
/// by the tests below.
static CDATA_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").unwrap());

/// Extract the contents of every CDATA region in `host_text`, in document
/// order.
///
/// Contents are the exact substrings between the delimiters: no trimming,
/// no unescaping. Returns an empty vec when the text contains no regions.
pub fn extract_regions(host_text: &str) -> Vec<String> {
    CDATA_SPAN
        .captures_iter(host_text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Return `host_text` with the content of the `index`-th CDATA region (in
/// document order) replaced by `new_content`.
///
/// Every byte outside the replaced span, including all other regions, is
/// returned unchanged. An out-of-range `index` is a silent no-op: the input
/// is returned unmodified. Callers must not assume failure is signaled;
/// this is a documented contract, kept for compatibility with the guard
/// layers above it.
pub fn updated_host_text(host_text: &str, new_content: &str, index: usize) -> String {
    for (count, mat) in CDATA_SPAN.find_iter(host_text).enumerate() {
        if count == index {
            let span_len = mat.end() - mat.start();
            let mut updated = String::with_capacity(
                host_text.len() - span_len
                    + CDATA_OPEN.len()
                    + new_content.len()
                    + CDATA_CLOSE.len(),
            );
            updated.push_str(&host_text[..mat.start()]);
            updated.push_str(CDATA_OPEN);
            updated.push_str(new_content);
            updated.push_str(CDATA_CLOSE);
            updated.push_str(&host_text[mat.end()..]);
            return updated;
        }
    }
    host_text.to_string()
}
