//! Boundary detection over a stream of chunks.

use std::cmp;

use bytes::{Buf as _, Bytes, BytesMut};
use memchr::memmem;

use crate::error::MultipartError;

const CRLF: &[u8] = b"\r\n";
const CRLF_CRLF: &[u8] = b"\r\n\r\n";
const HYPHENS: &[u8] = b"--";

/// Bytes received but not yet classified.
///
/// Holds the unconsumed tail of the previous window with the newest chunk appended. After a scan
/// that releases payload without finding a delimiter, its length is at most the marker length
/// plus one.
#[derive(Debug, Default)]
pub(crate) struct CarryBuffer {
    buf: BytesMut,
}

impl CarryBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn split_to(&mut self, at: usize) -> Bytes {
        self.buf.split_to(at).freeze()
    }

    fn advance(&mut self, cnt: usize) {
        self.buf.advance(cnt);
    }
}

/// Outcome of a single [`BoundaryScanner::scan`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Scan {
    /// No delimiter is in the window yet. The bytes cannot be part of a delimiter and are safe
    /// to hand to the current part; the rest stays in the carry buffer.
    Payload(Bytes),

    /// A delimiter was found. `payload` is everything before it. `terminal` is true for the
    /// closing `--boundary--` delimiter.
    Boundary { payload: Bytes, terminal: bool },
}

/// Where the first marker sits in the window, and what follows it.
enum Delimiter {
    /// No marker in the window.
    Absent,

    /// Marker at the offset, but the two bytes after it have not arrived yet.
    Incomplete(usize),

    /// Marker at `at` followed by `--` (terminal) or `CRLF`.
    Found { at: usize, terminal: bool },

    /// Marker at the offset followed by anything else.
    Malformed(usize),
}

/// Splits a byte stream into payload and boundary events.
///
/// The delimiter marker is `CRLF "--" boundary`. Each scan looks at the carry buffer (the held
/// back tail of earlier chunks plus whatever was pushed since) and reports the first marker
/// occurrence. When there is none, all but the last `marker.len() - 1` bytes are released, since
/// that tail could still be the start of a marker completed by the next chunk.
pub(crate) struct BoundaryScanner {
    marker: Box<[u8]>,
    finder: memmem::Finder<'static>,
    carry: CarryBuffer,
}

impl BoundaryScanner {
    /// Constructs a scanner for `boundary` (without the leading hyphens).
    ///
    /// The carry buffer starts out holding a line break so that a body beginning directly with
    /// `--boundary` is matched like any later delimiter.
    pub(crate) fn new(boundary: &str) -> Self {
        let marker = [CRLF, HYPHENS, boundary.as_bytes()].concat();
        let finder = memmem::Finder::new(&marker).into_owned();

        let mut carry = CarryBuffer::default();
        carry.extend(CRLF);

        BoundaryScanner {
            marker: marker.into_boxed_slice(),
            finder,
            carry,
        }
    }

    /// Appends a freshly read chunk to the scan window.
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.carry.extend(chunk);
    }

    /// Number of bytes held back in the carry buffer.
    pub(crate) fn buffered(&self) -> usize {
        self.carry.len()
    }

    /// Length of the delimiter marker, `CRLF "--" boundary`.
    #[cfg(test)]
    pub(crate) fn marker_len(&self) -> usize {
        self.marker.len()
    }

    /// Locates the first marker in the window and classifies what follows it.
    fn find_delimiter(&self) -> Delimiter {
        let window = self.carry.as_slice();

        let Some(at) = self.finder.find(window) else {
            return Delimiter::Absent;
        };

        let after = at + self.marker.len();

        match window.get(after..after + 2) {
            None => Delimiter::Incomplete(at),
            Some(HYPHENS) => Delimiter::Found { at, terminal: true },
            Some(CRLF) => Delimiter::Found { at, terminal: false },
            Some(_) => Delimiter::Malformed(at),
        }
    }

    /// Number of bytes at the end of the window that could still begin a marker.
    fn held_back(&self) -> usize {
        cmp::min(self.carry.len(), self.marker.len() - 1)
    }

    /// Scans the window for the next delimiter.
    ///
    /// On a match, the marker and the two bytes following it (`--` or `CRLF`) are consumed and
    /// the carry buffer is left holding whatever comes after them. When the marker is found but
    /// those two bytes have not arrived yet, only the bytes before the marker are released.
    pub(crate) fn scan(&mut self) -> Result<Scan, MultipartError> {
        match self.find_delimiter() {
            Delimiter::Absent => {
                let safe = self.carry.len() - self.held_back();
                Ok(Scan::Payload(self.carry.split_to(safe)))
            }

            Delimiter::Incomplete(at) => Ok(Scan::Payload(self.carry.split_to(at))),

            Delimiter::Found { at, terminal } => {
                log::trace!("delimiter at offset {at} (terminal: {terminal})");

                let payload = self.carry.split_to(at);
                self.carry.advance(self.marker.len() + 2);

                Ok(Scan::Boundary { payload, terminal })
            }

            Delimiter::Malformed(_) => Err(MultipartError::BoundaryDelimiter),
        }
    }

    /// Discards preamble up to and including the first delimiter.
    ///
    /// Returns the delimiter's terminal flag, or `None` if more data is needed. A line that
    /// starts like a delimiter but continues with anything other than `--` or `CRLF` is
    /// preamble too.
    pub(crate) fn skip_preamble(&mut self) -> Option<bool> {
        loop {
            match self.find_delimiter() {
                Delimiter::Absent => {
                    let skipped = self.carry.len() - self.held_back();
                    self.carry.advance(skipped);
                    return None;
                }

                Delimiter::Incomplete(at) => {
                    self.carry.advance(at);
                    return None;
                }

                Delimiter::Found { at, terminal } => {
                    log::trace!("skipped {at} bytes of preamble");
                    self.carry.advance(at + self.marker.len() + 2);
                    return Some(terminal);
                }

                Delimiter::Malformed(at) => {
                    log::trace!("ignoring delimiter-like preamble line at offset {at}");
                    self.carry.advance(at + self.marker.len());
                }
            }
        }
    }

    /// Takes a part's header block, up to and including the blank line that ends it.
    ///
    /// Returns `None` if the blank line has not arrived yet. A block that starts with a line
    /// break is empty and is returned as just that line break.
    pub(crate) fn take_header_block(&mut self) -> Option<Bytes> {
        let window = self.carry.as_slice();

        if window.starts_with(CRLF) {
            return Some(self.carry.split_to(CRLF.len()));
        }

        memmem::find(window, CRLF_CRLF).map(|idx| self.carry.split_to(idx + CRLF_CRLF.len()))
    }
}
