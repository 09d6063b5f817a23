//! HTTP `Range` header handling shared by local reads and the range server.
//!
//! Only single `bytes=` ranges are honoured. Anything else (multiple ranges,
//! other units, garbage) is ignored and the full body is served, which is
//! what RFC 9110 allows a server to do.

use crate::providers::ProviderError;

/// A parsed `bytes=` range, before it is checked against a file size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-` or `bytes=start-end` (end inclusive)
    FromTo { start: u64, end: Option<u64> },
    /// `bytes=-n`: the last n bytes
    Suffix(u64),
}

/// Inclusive byte window resolved against a concrete size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

impl ResolvedRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.size)
    }
}

/// Parse a `Range` header value. Returns `None` when the header should be ignored.
pub fn parse_range_header(value: &str) -> Option<ByteRange> {
    let spec = value.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let n = end.parse::<u64>().ok()?;
        return Some(ByteRange::Suffix(n));
    }

    let start = start.parse::<u64>().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        let end = end.parse::<u64>().ok()?;
        if end < start {
            return None;
        }
        Some(end)
    };
    Some(ByteRange::FromTo { start, end })
}

impl ByteRange {
    /// Clamp against `size`. The end is capped at the last byte; a start at or
    /// past EOF is unsatisfiable.
    pub fn resolve(self, size: u64) -> Result<ResolvedRange, ProviderError> {
        let unsatisfiable = ProviderError::RangeNotSatisfiable { size };
        match self {
            ByteRange::FromTo { start, end } => {
                if start >= size {
                    return Err(unsatisfiable);
                }
                let last = size - 1;
                let end = end.map_or(last, |e| e.min(last));
                Ok(ResolvedRange { start, end, size })
            }
            ByteRange::Suffix(n) => {
                if n == 0 || size == 0 {
                    return Err(unsatisfiable);
                }
                Ok(ResolvedRange {
                    start: size.saturating_sub(n),
                    end: size - 1,
                    size,
                })
            }
        }
    }
}

/// `Content-Range` value sent with a 416 response
pub fn unsatisfied_content_range(size: u64) -> String {
    format!("bytes */{}", size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(
            parse_range_header("bytes=100-199"),
            Some(ByteRange::FromTo { start: 100, end: Some(199) })
        );
        assert_eq!(
            parse_range_header("bytes=500-"),
            Some(ByteRange::FromTo { start: 500, end: None })
        );
        assert_eq!(parse_range_header("bytes=-300"), Some(ByteRange::Suffix(300)));
        assert_eq!(parse_range_header("bytes=0-1,5-6"), None);
        assert_eq!(parse_range_header("items=0-1"), None);
        assert_eq!(parse_range_header("bytes=9-3"), None);
        assert_eq!(parse_range_header("bytes=abc-"), None);
    }

    #[test]
    fn test_resolve_clamps_end() {
        let r = ByteRange::FromTo { start: 100, end: Some(199) }.resolve(1000).unwrap();
        assert_eq!(r.length(), 100);
        assert_eq!(r.content_range(), "bytes 100-199/1000");

        let r = ByteRange::FromTo { start: 900, end: Some(5000) }.resolve(1000).unwrap();
        assert_eq!((r.start, r.end), (900, 999));

        let r = ByteRange::FromTo { start: 10, end: None }.resolve(1000).unwrap();
        assert_eq!(r.end, 999);
    }

    #[test]
    fn test_resolve_suffix() {
        let r = ByteRange::Suffix(100).resolve(1000).unwrap();
        assert_eq!((r.start, r.end), (900, 999));
        let r = ByteRange::Suffix(5000).resolve(1000).unwrap();
        assert_eq!((r.start, r.end), (0, 999));
        assert!(ByteRange::Suffix(0).resolve(1000).is_err());
    }

    #[test]
    fn test_start_past_eof_is_unsatisfiable() {
        let err = ByteRange::FromTo { start: 1000, end: None }.resolve(1000).unwrap_err();
        assert!(matches!(err, ProviderError::RangeNotSatisfiable { size: 1000 }));
        assert!(ByteRange::FromTo { start: 0, end: None }.resolve(0).is_err());
        assert_eq!(unsatisfied_content_range(1000), "bytes */1000");
    }
}
