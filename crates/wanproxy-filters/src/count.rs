//! Byte-counting filter.
//!
//! Counts everything that passes through it into a shared counter and
//! hands the data on untouched. With HTTP detection enabled it watches
//! the stream for `HTTP/` responses and, while a `Content-Length` body
//! larger than the cookie-resource threshold is in flight, tags the data
//! `TO_BE_CONTINUED` so downstream stages know more of the same body is
//! coming. Small bodies are not awaited.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;

use crate::chain::{Effects, Filter, Flags, TO_BE_CONTINUED};
use crate::FilterError;

/// Response bodies below this are treated as cookie-sized resources and
/// not awaited.
const AWAIT_THRESHOLD: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniff {
    /// HTTP detection disabled.
    Off,
    /// Looking for the start of a response.
    Idle,
    /// Accumulating response headers.
    Headers,
    /// Counting a small body; no tagging.
    SmallBody,
    /// Counting a large body; tag data until it completes.
    LargeBody,
}

pub struct CountFilter {
    total: Arc<AtomicU64>,
    sniff: Sniff,
    header: BytesMut,
    expected: u64,
    seen: u64,
}

impl CountFilter {
    pub fn new(total: Arc<AtomicU64>) -> Self {
        Self {
            total,
            sniff: Sniff::Off,
            header: BytesMut::new(),
            expected: 0,
            seen: 0,
        }
    }

    /// A counter that also sniffs HTTP responses for body accounting.
    pub fn with_http_detection(total: Arc<AtomicU64>) -> Self {
        Self {
            sniff: Sniff::Idle,
            ..Self::new(total)
        }
    }

    fn observe(&mut self, buf: &[u8]) {
        match self.sniff {
            Sniff::Off => {}
            Sniff::Idle | Sniff::Headers => {
                self.header.extend_from_slice(buf);
                self.explore();
            }
            Sniff::SmallBody | Sniff::LargeBody => {
                self.seen += buf.len() as u64;
                if self.seen >= self.expected {
                    let spill = self.seen - self.expected;
                    self.sniff = Sniff::Idle;
                    self.header.clear();
                    if spill > 0 && (spill as usize) <= buf.len() {
                        // The tail of this buffer belongs to the next
                        // response already.
                        self.header.extend_from_slice(&buf[buf.len() - spill as usize..]);
                        self.explore();
                    }
                }
            }
        }
    }

    /// Drive the header state machine over whatever is buffered.
    fn explore(&mut self) {
        loop {
            if self.sniff == Sniff::Idle {
                if self.header.len() < 5 {
                    return;
                }
                if !self.header.starts_with(b"HTTP/") {
                    // Not a response stream; stop watching entirely.
                    self.sniff = Sniff::Off;
                    self.header.clear();
                    return;
                }
                self.sniff = Sniff::Headers;
            }

            let Some(body_start) = header_end(&self.header) else {
                return;
            };

            let length = content_length(&self.header[..body_start]);
            let body_seen = (self.header.len() - body_start) as u64;

            match length {
                Some(length) if length > body_seen => {
                    self.expected = length;
                    self.seen = body_seen;
                    self.sniff = if length < AWAIT_THRESHOLD {
                        Sniff::SmallBody
                    } else {
                        Sniff::LargeBody
                    };
                    self.header.clear();
                    return;
                }
                Some(length) => {
                    // Whole body already buffered; look for the next
                    // response behind it.
                    let consumed = body_start + length as usize;
                    let rest = self.header.split_off(consumed);
                    self.header = rest;
                    self.sniff = Sniff::Idle;
                    if self.header.is_empty() {
                        return;
                    }
                }
                None => {
                    // Chunked or unsized response: nothing to account.
                    self.sniff = Sniff::Off;
                    self.header.clear();
                    return;
                }
            }
        }
    }
}

/// Offset just past the blank line terminating the headers, if present.
fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
}

/// Parse `Content-Length` out of a header block, unless the message is
/// `Transfer-Encoding`d.
fn content_length(headers: &[u8]) -> Option<u64> {
    let mut length = None;
    for line in headers.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = &line[..colon];
        if name.eq_ignore_ascii_case(b"transfer-encoding") {
            return None;
        }
        if name.eq_ignore_ascii_case(b"content-length") {
            let value = std::str::from_utf8(&line[colon + 1..]).ok()?.trim();
            length = value.parse::<u64>().ok();
        }
    }
    length
}

impl Filter for CountFilter {
    fn consume(&mut self, buf: BytesMut, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        self.total.fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.observe(&buf);

        let tag = if self.sniff == Sniff::LargeBody {
            TO_BE_CONTINUED
        } else {
            0
        };
        fx.data(buf, flags | tag);
        Ok(())
    }

    fn flush(&mut self, flags: Flags, fx: &mut Effects) -> Result<(), FilterError> {
        if self.sniff != Sniff::Off {
            self.sniff = Sniff::Idle;
        }
        self.header.clear();
        fx.forward_flush(flags);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::FilterChain;

    #[test]
    fn counts_all_bytes() {
        let total = Arc::new(AtomicU64::new(0));
        let mut chain = FilterChain::new();
        chain.push(Box::new(CountFilter::new(total.clone())));

        for chunk in [&b"hello "[..], &b"world"[..]] {
            let run = chain.consume(BytesMut::from(chunk), 0).unwrap();
            assert_eq!(&run.output[..], chunk, "counter must not alter data");
        }
        assert_eq!(total.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn large_body_is_tagged() {
        let total = Arc::new(AtomicU64::new(0));
        let mut filter = CountFilter::with_http_detection(total);

        let head = b"HTTP/1.1 200 OK\r\nContent-Length: 5000\r\n\r\n";
        filter.observe(head);
        assert_eq!(filter.sniff, Sniff::LargeBody);
        assert_eq!(filter.expected, 5000);

        // Body bytes keep the state until the length is satisfied.
        filter.observe(&[0u8; 2500]);
        assert_eq!(filter.sniff, Sniff::LargeBody);
        filter.observe(&[0u8; 2500]);
        assert_eq!(filter.sniff, Sniff::Idle);
    }

    #[test]
    fn small_body_is_not_awaited() {
        let total = Arc::new(AtomicU64::new(0));
        let mut filter = CountFilter::with_http_detection(total);
        filter.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 120\r\n\r\n");
        assert_eq!(filter.sniff, Sniff::SmallBody);
    }

    #[test]
    fn non_http_disables_sniffing() {
        let total = Arc::new(AtomicU64::new(0));
        let mut filter = CountFilter::with_http_detection(total);
        filter.observe(b"BINARYDATA....");
        assert_eq!(filter.sniff, Sniff::Off);
    }

    #[test]
    fn transfer_encoding_wins_over_content_length() {
        let headers = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\nTransfer-Encoding: chunked\r\n";
        assert_eq!(content_length(headers), None);
    }

    #[test]
    fn complete_small_response_resumes_idle() {
        let total = Arc::new(AtomicU64::new(0));
        let mut filter = CountFilter::with_http_detection(total);
        filter.observe(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokHTTP/");
        // Body consumed in place, already watching the next response.
        assert_eq!(filter.sniff, Sniff::Headers);
    }
}
