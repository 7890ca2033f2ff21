//! Byte sources the parser pulls request bodies from.

use std::{
    cmp, fmt,
    future::poll_fn,
    io,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures_core::stream::{LocalBoxStream, Stream};
use futures_util::TryStreamExt as _;
use tokio::io::{AsyncRead, ReadBuf};

/// A forward-only stream of bytes with a single read operation.
///
/// Implementations never buffer more than they return, except for data an underlying transport
/// has already handed over in one piece. A source performs no retries; timeouts surface as I/O
/// errors.
pub trait ByteSource {
    /// Attempts to read at most `max_len` bytes.
    ///
    /// Returns:
    ///
    /// - `Poll::Ready(Some(Ok(chunk)))` - a non-empty chunk of at most `max_len` bytes
    /// - `Poll::Ready(Some(Err(err)))` - the read failed
    /// - `Poll::Ready(None)` - end of stream
    /// - `Poll::Pending` - no data yet; the current task is woken when there is
    ///
    /// An empty chunk is a protocol violation and is reported as an error by the parser.
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        max_len: usize,
    ) -> Poll<Option<io::Result<Bytes>>>;
}

impl<T: ByteSource + Unpin + ?Sized> ByteSource for &mut T {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        max_len: usize,
    ) -> Poll<Option<io::Result<Bytes>>> {
        Pin::new(&mut **self.get_mut()).poll_read(cx, max_len)
    }
}

impl<T: ByteSource + Unpin + ?Sized> ByteSource for Box<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        max_len: usize,
    ) -> Poll<Option<io::Result<Bytes>>> {
        Pin::new(&mut **self.get_mut()).poll_read(cx, max_len)
    }
}

/// A fully buffered body, handed out in reads of at most `max_len` bytes.
impl ByteSource for Bytes {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        max_len: usize,
    ) -> Poll<Option<io::Result<Bytes>>> {
        let this = self.get_mut();

        if this.is_empty() {
            Poll::Ready(None)
        } else {
            let len = cmp::min(this.len(), max_len);
            Poll::Ready(Some(Ok(this.split_to(len))))
        }
    }
}

/// Adapts a stream of byte chunks, such as a server's request payload.
///
/// Chunks larger than the requested length are split without copying. Empty stream items are
/// skipped since they carry no data.
pub struct StreamSource {
    stream: LocalBoxStream<'static, io::Result<Bytes>>,
    pending: Bytes,
}

impl StreamSource {
    /// Constructs a byte source from a stream of chunks.
    pub fn new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + 'static,
        E: Into<io::Error> + 'static,
    {
        StreamSource {
            stream: Box::pin(stream.map_err(Into::<io::Error>::into)),
            pending: Bytes::new(),
        }
    }
}

impl fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSource")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl ByteSource for StreamSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        max_len: usize,
    ) -> Poll<Option<io::Result<Bytes>>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let len = cmp::min(this.pending.len(), max_len);
                return Poll::Ready(Some(Ok(this.pending.split_to(len))));
            }

            match ready!(this.stream.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => this.pending = chunk,
                Some(Err(err)) => return Poll::Ready(Some(Err(err))),
                None => return Poll::Ready(None),
            }
        }
    }
}

/// Adapts an asynchronous reader, such as a socket or an open file.
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
    buf: BytesMut,
}

impl<R> ReaderSource<R> {
    /// Constructs a byte source from an async reader.
    pub fn new(reader: R) -> Self {
        ReaderSource {
            reader,
            buf: BytesMut::new(),
        }
    }

    /// Unwraps this source, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: AsyncRead + Unpin> ByteSource for ReaderSource<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        max_len: usize,
    ) -> Poll<Option<io::Result<Bytes>>> {
        let this = self.get_mut();

        this.buf.resize(max_len, 0);
        let mut read_buf = ReadBuf::new(&mut this.buf[..]);

        if let Err(err) = ready!(Pin::new(&mut this.reader).poll_read(cx, &mut read_buf)) {
            return Poll::Ready(Some(Err(err)));
        }

        let filled = read_buf.filled().len();

        if filled == 0 {
            // zero bytes from a reader with a non-empty buffer means EOF
            this.buf.clear();
            Poll::Ready(None)
        } else {
            Poll::Ready(Some(Ok(this.buf.split_to(filled).freeze())))
        }
    }
}

/// Reads the next chunk of at most `max_len` bytes from `source`.
pub(crate) async fn read<S>(source: &mut S, max_len: usize) -> Option<io::Result<Bytes>>
where
    S: ByteSource + Unpin + ?Sized,
{
    poll_fn(|cx| Pin::new(&mut *source).poll_read(cx, max_len)).await
}
