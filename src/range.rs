//! HTTP Range header parsing (C3), restricted to the single-interval subset
//! this proxy serves: no multipart responses, strict bounds checking, and a
//! special case for the `bytes=0-` "range probe" used by media players to
//! detect range support.

/// A single byte interval, always within `[0, total_size)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total_size: u64,
}

impl ByteRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `false` only for the full-file probe `bytes=0-` on the whole object;
    /// every other satisfiable range is partial.
    pub fn is_partial(&self) -> bool {
        !(self.start == 0 && self.end == self.total_size - 1)
    }

    pub fn content_range_header(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total_size)
    }
}

/// Parse a `Range` header value against a known total size.
///
/// Returns `None` for: missing/empty header, wrong unit, multipart (contains
/// `,`), non-integer components, `start > end` after clamping, or
/// `start >= total_size`. `bytes=0-` always yields `Some`, even though it
/// spans the whole object and therefore reports `is_partial() == false`.
pub fn parse_range(header: Option<&str>, total_size: u64) -> Option<ByteRange> {
    let header = header?;
    if total_size == 0 {
        return None;
    }

    let spec = header.strip_prefix("bytes=")?;
    if spec.is_empty() || spec.contains(',') {
        return None;
    }

    let (start_str, end_str) = spec.split_once('-')?;

    let range = if start_str.is_empty() {
        // Suffix range: bytes=-N, last N bytes. bytes=-0 is invalid.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        let start = total_size.saturating_sub(suffix_len);
        ByteRange {
            start,
            end: total_size - 1,
            total_size,
        }
    } else {
        let start: u64 = start_str.parse().ok()?;
        if start >= total_size {
            return None;
        }
        if end_str.is_empty() {
            // Open range: bytes=N-, from N to end.
            ByteRange {
                start,
                end: total_size - 1,
                total_size,
            }
        } else {
            let end: u64 = end_str.parse().ok()?;
            let end = end.min(total_size - 1);
            if start > end {
                return None;
            }
            ByteRange {
                start,
                end,
                total_size,
            }
        }
    };

    Some(range)
}

/// True when `header` parses to a standard bounded range `bytes=A-B` with
/// `A <= B` and both explicit — used to decide whether to launch the
/// speculative `get_range` prefetch in the parallel-dispatch step (§4.7).
pub fn is_standard_bounded_range(header: &str) -> bool {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return false;
    };
    if spec.contains(',') {
        return false;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return false;
    };
    !start.is_empty() && !end.is_empty() && start.parse::<u64>().is_ok() && end.parse::<u64>().is_ok()
}

/// True when a non-`bytes=0-` range header is present, i.e. the request is
/// asking for a genuine partial slice rather than a full-file probe.
pub fn is_partial_range_request(header: &str) -> bool {
    header.strip_prefix("bytes=") != Some("0-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_bounded_range() {
        let r = parse_range(Some("bytes=0-499"), 1000).unwrap();
        assert_eq!((r.start, r.end, r.length()), (0, 499, 500));
        assert!(r.is_partial());
    }

    #[test]
    fn parses_open_and_suffix_ranges() {
        let r = parse_range(Some("bytes=500-"), 1000).unwrap();
        assert_eq!((r.start, r.end), (500, 999));

        let r = parse_range(Some("bytes=-200"), 1000).unwrap();
        assert_eq!((r.start, r.end), (800, 999));
    }

    #[test]
    fn zero_dash_is_full_file_probe_but_not_partial() {
        let r = parse_range(Some("bytes=0-"), 1000).unwrap();
        assert_eq!((r.start, r.end), (0, 999));
        assert!(!r.is_partial());
        assert_eq!(r.content_range_header(), "bytes 0-999/1000");
    }

    #[test]
    fn clamps_end_beyond_total_size() {
        let r = parse_range(Some("bytes=0-9999"), 1000).unwrap();
        assert_eq!((r.start, r.end), (0, 999));
    }

    #[test]
    fn rejects_multipart() {
        assert!(parse_range(Some("bytes=0-100,200-300"), 1000).is_none());
    }

    #[test]
    fn rejects_suffix_zero() {
        assert!(parse_range(Some("bytes=-0"), 1000).is_none());
    }

    #[test]
    fn rejects_start_at_or_beyond_total() {
        assert!(parse_range(Some("bytes=1000-"), 1000).is_none());
        assert!(parse_range(Some("bytes=2000-2500"), 1000).is_none());
    }

    #[test]
    fn rejects_start_after_end() {
        assert!(parse_range(Some("bytes=500-100"), 1000).is_none());
    }

    #[test]
    fn rejects_missing_and_malformed_headers() {
        assert!(parse_range(None, 1000).is_none());
        assert!(parse_range(Some(""), 1000).is_none());
        assert!(parse_range(Some("items=0-499"), 1000).is_none());
        assert!(parse_range(Some("bytes="), 1000).is_none());
        assert!(parse_range(Some("bytes=abc-def"), 1000).is_none());
    }

    #[test]
    fn range_parse_law_holds_for_all_bounded_pairs() {
        let total = 50u64;
        for start in 0..total {
            for end in start..total {
                let header = format!("bytes={start}-{end}");
                let r = parse_range(Some(&header), total).unwrap();
                assert_eq!(r.start, start);
                assert_eq!(r.end, end);
                assert_eq!(r.length(), end - start + 1);
                assert_eq!(r.is_partial(), (start, end) != (0, total - 1));
            }
        }
    }

    #[test]
    fn standard_bounded_range_detection() {
        assert!(is_standard_bounded_range("bytes=0-499"));
        assert!(!is_standard_bounded_range("bytes=-500"));
        assert!(!is_standard_bounded_range("bytes=500-"));
        assert!(!is_standard_bounded_range("bytes=0-100,200-300"));
    }

    #[test]
    fn partial_range_request_excludes_full_file_probe() {
        assert!(!is_partial_range_request("bytes=0-"));
        assert!(is_partial_range_request("bytes=100-199"));
    }
}
