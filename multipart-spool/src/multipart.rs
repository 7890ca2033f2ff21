//! Streaming `multipart/form-data` parser.

use std::{fmt, io, mem, rc::Rc, str};

use bytes::Bytes;
use futures_core::stream::Stream;
use mime::Mime;

use crate::{
    config::MultipartConfig,
    error::MultipartError,
    header::PartHeader,
    scanner::{BoundaryScanner, Scan},
    sink::{Body, PartSink, TempFileStorage, TempStorage},
    source::{self, ByteSource},
};

/// Maximum boundary length permitted by RFC 2046.
const MAX_BOUNDARY_LEN: usize = 70;

/// Extracts the boundary from a `Content-Type` header value.
///
/// ```
/// use multipart_spool::boundary_from_content_type;
///
/// let boundary = boundary_from_content_type("multipart/form-data; boundary=\"XYZ\"").unwrap();
/// assert_eq!(boundary, "XYZ");
/// ```
pub fn boundary_from_content_type(content_type: &str) -> Result<String, MultipartError> {
    let content_type = content_type
        .parse::<Mime>()
        .map_err(|_| MultipartError::ContentTypeParse)?;

    if content_type.type_() != mime::MULTIPART {
        return Err(MultipartError::ContentTypeIncompatible);
    }

    let boundary = content_type
        .get_param(mime::BOUNDARY)
        .ok_or(MultipartError::MissingBoundaryParameter)?
        .as_str()
        .to_owned();

    validate_boundary(&boundary)?;

    Ok(boundary)
}

fn validate_boundary(boundary: &str) -> Result<(), MultipartError> {
    if boundary.is_empty() {
        return Err(MultipartError::MissingBoundaryParameter);
    }

    if boundary.len() > MAX_BOUNDARY_LEN
        || !boundary.bytes().all(|b| b.is_ascii_graphic() || b == b' ')
    {
        return Err(MultipartError::InvalidBoundary);
    }

    Ok(())
}

/// Parses a whole multipart body, returning every part in submission order.
///
/// On error, all parts produced so far are released before the error is returned.
pub async fn parse<S>(source: S, boundary: &str) -> Result<Vec<ParsedPart>, MultipartError>
where
    S: ByteSource + Unpin,
{
    Multipart::new(source, boundary)?.collect().await
}

/// A single part of a multipart body, handed to the caller once its closing boundary is seen.
///
/// The caller owns the part's storage. Spooled files are deleted when the part is dropped unless
/// they are persisted first.
#[derive(Debug)]
pub struct ParsedPart {
    header: PartHeader,
    body: Body,
}

impl ParsedPart {
    /// Returns the part's header metadata.
    pub fn header(&self) -> &PartHeader {
        &self.header
    }

    /// Returns the form field name.
    pub fn name(&self) -> &str {
        self.header.name()
    }

    /// Returns the client supplied file name, if this is a file part.
    pub fn file_name(&self) -> Option<&str> {
        self.header.file_name()
    }

    /// Returns the declared content type, if any.
    pub fn content_type(&self) -> Option<&Mime> {
        self.header.content_type()
    }

    /// Returns true if the part carries a `filename` and was spooled to a file.
    pub fn is_file(&self) -> bool {
        self.header.is_file()
    }

    /// Returns the part's body, in memory or on disk.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Returns the value of a field part.
    pub fn bytes(&self) -> Option<&Bytes> {
        self.body.as_bytes()
    }

    /// Returns the value of a field part as text.
    ///
    /// Returns `None` for file parts and for values that are not valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        self.bytes().and_then(|bytes| str::from_utf8(bytes).ok())
    }

    /// Takes the body, dropping the header metadata.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Splits the part into its header metadata and body.
    pub fn into_parts(self) -> (PartHeader, Body) {
        (self.header, self.body)
    }

    /// Deletes the part's spooled file, if any, reporting errors that dropping would swallow.
    pub fn release(self) -> io::Result<()> {
        self.body.release()
    }
}

/// A part whose header has been read and whose body is being routed to a sink.
#[derive(Debug)]
struct OpenPart {
    header: PartHeader,
    sink: PartSink,

    /// Set once the closing delimiter is read; `Some(true)` if it was the terminal one.
    delimiter: Option<bool>,
}

impl OpenPart {
    fn into_parsed(self) -> Result<ParsedPart, MultipartError> {
        let body = self.sink.into_body()?;

        log::debug!(
            "finished part `{}` ({} bytes)",
            self.header.name(),
            body.len()
        );

        Ok(ParsedPart {
            header: self.header,
            body,
        })
    }

    fn abort(self) {
        log::debug!("aborting part `{}`", self.header.name());
        self.sink.abort();
    }
}

#[derive(Debug)]
enum State {
    /// Skip data until first boundary.
    Preamble,

    /// Reading a part's header block.
    Headers,

    /// Routing a part's body to its sink.
    Body(OpenPart),

    /// Terminal boundary seen. Nothing more is read.
    Closed,

    /// Parsing failed. Nothing more is read.
    Error,
}

/// Streaming parser for `multipart/form-data` bodies.
///
/// Pulls chunks from a [`ByteSource`] and yields one [`ParsedPart`] per part, in order, as soon
/// as each part's closing boundary is read. Field parts are collected in memory; file parts are
/// spooled to temporary files obtained from a [`TempStorage`].
///
/// The first error ends the parse: the part being read is discarded along with its temporary
/// file, and later calls to [`next_part`](Self::next_part) return `Ok(None)` without reading.
///
/// A `next_part` future may be dropped before it completes, e.g. by a timeout. Bytes already
/// pulled from the source are kept, and the next call carries on where it stopped.
pub struct Multipart<S> {
    source: S,
    scanner: BoundaryScanner,
    config: MultipartConfig,
    storage: Rc<dyn TempStorage>,
    state: State,
    parts: usize,
    eof: bool,
}

impl<S> Multipart<S>
where
    S: ByteSource + Unpin,
{
    /// Constructs a parser reading from `source`, with parts separated by `boundary`.
    ///
    /// Uses the default [`MultipartConfig`] and spools files to the platform's temporary
    /// directory.
    pub fn new(source: S, boundary: &str) -> Result<Self, MultipartError> {
        validate_boundary(boundary)?;

        Ok(Multipart {
            source,
            scanner: BoundaryScanner::new(boundary),
            config: MultipartConfig::default(),
            storage: Rc::new(TempFileStorage::default()),
            state: State::Preamble,
            parts: 0,
            eof: false,
        })
    }

    /// Sets the parser configuration.
    pub fn config(mut self, config: MultipartConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the provider of temporary files for file parts.
    pub fn storage(mut self, storage: impl TempStorage + 'static) -> Self {
        self.storage = Rc::new(storage);
        self
    }

    /// Returns true once the terminal boundary has been read.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Reads the next part.
    ///
    /// Returns `Ok(None)` after the terminal boundary, or after an error has been returned.
    pub async fn next_part(&mut self) -> Result<Option<ParsedPart>, MultipartError> {
        match self.advance().await {
            Ok(part) => Ok(part),
            Err(err) => {
                log::debug!("multipart parse failed after {} parts: {err}", self.parts);
                self.fail();
                Err(err)
            }
        }
    }

    /// Reads all remaining parts.
    ///
    /// On error, the parts read by this call are released before the error is returned.
    pub async fn collect(mut self) -> Result<Vec<ParsedPart>, MultipartError> {
        let mut parts = Vec::new();

        loop {
            match self.next_part().await {
                Ok(Some(part)) => parts.push(part),
                Ok(None) => return Ok(parts),
                Err(err) => {
                    release_all(parts);
                    return Err(err);
                }
            }
        }
    }

    /// Converts this parser into a stream of parts.
    ///
    /// The stream ends after the terminal boundary or after yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<ParsedPart, MultipartError>> {
        futures_util::stream::try_unfold(self, |mut multipart| async move {
            Ok(multipart
                .next_part()
                .await?
                .map(|part| (part, multipart)))
        })
    }

    /// Abandons the parse, discarding the part being read and its temporary file.
    pub fn abort(mut self) {
        if let State::Body(part) = mem::replace(&mut self.state, State::Closed) {
            part.abort();
        }
    }

    /// Moves to the error state, discarding the part being read.
    fn fail(&mut self) {
        if let State::Body(part) = mem::replace(&mut self.state, State::Error) {
            part.abort();
        }
    }

    // The state is only changed between suspension points, so dropping this future part way
    // through leaves the parser resumable.
    async fn advance(&mut self) -> Result<Option<ParsedPart>, MultipartError> {
        loop {
            match self.state {
                State::Preamble => match self.scanner.skip_preamble() {
                    Some(true) => {
                        log::debug!("multipart body has no parts");
                        self.state = State::Closed;
                        return Ok(None);
                    }

                    Some(false) => self.state = State::Headers,

                    None => {
                        if !self.fill().await? {
                            return Err(MultipartError::MissingInitialBoundary);
                        }
                    }
                },

                State::Headers => {
                    if let Some(block) = self.read_header_block().await? {
                        let part = self.open_part(&block)?;
                        self.state = State::Body(part);
                    }
                }

                State::Body(_) => {
                    if let Some(part) = self.read_body().await? {
                        return Ok(Some(part));
                    }
                }

                State::Closed | State::Error => return Ok(None),
            }
        }
    }

    /// Pulls the next chunk from the source into the scan window.
    ///
    /// Returns `false` at end of stream.
    async fn fill(&mut self) -> Result<bool, MultipartError> {
        if self.eof {
            return Ok(false);
        }

        match source::read(&mut self.source, self.config.get_read_size()).await {
            Some(Ok(chunk)) if chunk.is_empty() => Err(MultipartError::Read(io::Error::new(
                io::ErrorKind::InvalidData,
                "byte source returned an empty chunk",
            ))),

            Some(Ok(chunk)) => {
                self.scanner.push(&chunk);
                Ok(true)
            }

            Some(Err(err)) => Err(MultipartError::Read(err)),

            None => {
                self.eof = true;
                Ok(false)
            }
        }
    }

    /// Reads a header block, or returns `None` after pulling one more chunk when it is not
    /// complete yet.
    async fn read_header_block(&mut self) -> Result<Option<Bytes>, MultipartError> {
        let limit = self.config.get_max_header_size();

        match self.scanner.take_header_block() {
            Some(block) if block.len() > limit => Err(MultipartError::HeaderTooLarge { limit }),
            Some(block) => Ok(Some(block)),

            // the block will be longer than what is already buffered
            None if self.scanner.buffered() > limit => {
                Err(MultipartError::HeaderTooLarge { limit })
            }

            None => {
                if self.fill().await? {
                    Ok(None)
                } else {
                    Err(MultipartError::TruncatedStream)
                }
            }
        }
    }

    fn open_part(&mut self, block: &[u8]) -> Result<OpenPart, MultipartError> {
        let header = PartHeader::parse(block)?;

        let max_parts = self.config.get_max_parts();
        if self.parts >= max_parts {
            return Err(MultipartError::TooManyParts(max_parts));
        }
        self.parts += 1;

        match header.file_name() {
            Some(file_name) => {
                log::debug!("reading file part `{}` ({file_name})", header.name())
            }
            None => log::debug!("reading field part `{}`", header.name()),
        }

        let sink = PartSink::for_header(&header, &self.config, &self.storage);
        Ok(OpenPart {
            header,
            sink,
            delimiter: None,
        })
    }

    /// Routes scanned body bytes to the active part's sink.
    ///
    /// Returns the finished part once its closing delimiter is read and its body is flushed,
    /// or `None` when more data is needed.
    async fn read_body(&mut self) -> Result<Option<ParsedPart>, MultipartError> {
        let State::Body(part) = &mut self.state else {
            return Ok(None);
        };

        if part.delimiter.is_none() {
            match self.scanner.scan()? {
                Scan::Payload(payload) => {
                    part.sink.write(&payload).await?;

                    return if self.fill().await? {
                        Ok(None)
                    } else {
                        Err(MultipartError::TruncatedStream)
                    };
                }

                Scan::Boundary { payload, terminal } => {
                    part.delimiter = Some(terminal);
                    part.sink.write(&payload).await?;
                }
            }
        }

        part.sink.flush().await?;
        let terminal = part.delimiter == Some(true);

        let next = if terminal {
            log::debug!("terminal boundary read after {} parts", self.parts);
            State::Closed
        } else {
            State::Headers
        };

        match mem::replace(&mut self.state, next) {
            State::Body(part) => part.into_parsed().map(Some),
            _ => Ok(None),
        }
    }
}

impl<S> fmt::Debug for Multipart<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multipart")
            .field("state", &self.state)
            .field("parts", &self.parts)
            .field("eof", &self.eof)
            .finish_non_exhaustive()
    }
}

impl<S> Drop for Multipart<S> {
    fn drop(&mut self) {
        if let State::Body(part) = mem::replace(&mut self.state, State::Closed) {
            part.abort();
        }
    }
}

fn release_all(parts: Vec<ParsedPart>) {
    for part in parts {
        let name = part.name().to_owned();
        if let Err(err) = part.release() {
            log::warn!("failed to release part `{name}`: {err}");
        }
    }
}
