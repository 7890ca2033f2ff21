//! Error and Result module

use std::io;

use derive_more::{Display, Error, From};

/// A set of errors that can occur while parsing a multipart stream.
///
/// Every variant is terminal for the parse that produced it; the parser never retries.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum MultipartError {
    /// Content-Type header has no `boundary` parameter, or the parameter is empty.
    #[display("Multipart boundary is not found")]
    MissingBoundaryParameter,

    /// Boundary is longer than 70 bytes or contains non-ASCII or control characters.
    #[display("Multipart boundary is invalid")]
    InvalidBoundary,

    /// Content-Type header could not be parsed.
    #[display("Can not parse Content-Type header")]
    ContentTypeParse,

    /// Content-Type header is not `multipart/*`.
    #[display("Content-Type is not multipart")]
    ContentTypeIncompatible,

    /// Stream ended before the first boundary was seen.
    #[display("Multipart stream ended before the first boundary")]
    MissingInitialBoundary,

    /// Boundary delimiter was followed by something other than `--` or a line break.
    #[display("Malformed boundary delimiter line")]
    BoundaryDelimiter,

    /// Part header block could not be parsed.
    #[display("{}", _0)]
    HeaderParse(HeaderParseError),

    /// Part header block exceeded the configured maximum size.
    #[display("Part header block exceeds {} bytes", limit)]
    #[from(ignore)]
    HeaderTooLarge { limit: usize },

    /// Nested multipart is not supported.
    #[display("Nested multipart is not supported")]
    Nested,

    /// Stream ended before the terminal boundary was seen.
    #[display("Multipart stream is incomplete")]
    TruncatedStream,

    /// Reading from the byte source failed.
    #[display("Error reading multipart stream: {}", _0)]
    #[from(ignore)]
    Read(io::Error),

    /// Writing a part body to temporary storage failed.
    #[display("Error spooling part to temporary storage: {}", _0)]
    #[from(ignore)]
    Write(io::Error),

    /// A part body exceeded its size limit.
    #[display("Part `{}` exceeds the size limit of {} bytes", field_name, limit)]
    #[from(ignore)]
    PartTooLarge { field_name: String, limit: u64 },

    /// The stream contained more parts than allowed.
    #[display("Multipart stream has more than {} parts", _0)]
    #[from(ignore)]
    TooManyParts(#[error(not(source))] usize),
}

impl MultipartError {
    /// Returns true if the error was caused by malformed or oversized input rather than by I/O.
    ///
    /// Callers serving HTTP usually map these to a 400-class response and everything else to a
    /// 500-class one.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, MultipartError::Read(_) | MultipartError::Write(_))
    }
}

/// Reasons a part header block is rejected.
#[derive(Debug, Display, From, Error)]
#[non_exhaustive]
pub enum HeaderParseError {
    /// Header lines are not well formed.
    #[display("Malformed part headers: {}", _0)]
    Malformed(httparse::Error),

    /// Header block does not end with a blank line.
    #[display("Part header block is incomplete")]
    Incomplete,

    /// Content-Disposition header is not found or is not equal to "form-data".
    ///
    /// According to [RFC 7578 §4.2](https://datatracker.ietf.org/doc/html/rfc7578#section-4.2) a
    /// Content-Disposition header must always be present and equal to "form-data".
    #[display("No Content-Disposition `form-data` header")]
    ContentDispositionMissing,

    /// Content-Disposition header has no `name` parameter.
    #[display("Content-Disposition header has no `name` parameter")]
    NameMissing,

    /// A Content-Disposition parameter is not valid UTF-8 or has an unterminated quoted value.
    #[display("Invalid Content-Disposition parameter")]
    InvalidParameter,
}

impl From<httparse::Error> for MultipartError {
    fn from(err: httparse::Error) -> Self {
        MultipartError::HeaderParse(HeaderParseError::Malformed(err))
    }
}
