//! Destinations for part bodies: memory for fields, temporary files for uploads.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    rc::Rc,
};

use bytes::{Buf as _, Bytes, BytesMut};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt as _;

use crate::{config::MultipartConfig, error::MultipartError, header::PartHeader};

/// Default file name prefix for spooled parts.
const DEFAULT_PREFIX: &str = "upload-";

/// Provider of fresh temporary files for spooled parts.
///
/// Each call must return a new, uniquely named file. Deletion is handled by [`NamedTempFile`]:
/// dropping or closing the returned handle removes the file.
pub trait TempStorage {
    fn create(&self) -> io::Result<NamedTempFile>;
}

impl<F> TempStorage for F
where
    F: Fn() -> io::Result<NamedTempFile>,
{
    fn create(&self) -> io::Result<NamedTempFile> {
        (self)()
    }
}

/// Creates temporary files in a directory, with random unique names.
///
/// The default location is the platform's temporary directory.
#[derive(Debug, Clone)]
pub struct TempFileStorage {
    directory: Option<PathBuf>,
    prefix: String,
}

impl TempFileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directory that temp files will be created in.
    pub fn directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.directory = Some(dir.as_ref().to_owned());
        self
    }

    /// Sets the file name prefix. Defaults to `upload-`.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

impl Default for TempFileStorage {
    fn default() -> Self {
        TempFileStorage {
            directory: None,
            prefix: DEFAULT_PREFIX.to_owned(),
        }
    }
}

impl TempStorage for TempFileStorage {
    fn create(&self) -> io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(&self.prefix);

        if let Some(ref dir) = self.directory {
            builder.tempfile_in(dir)
        } else {
            builder.tempfile()
        }
    }
}

/// A part body written to a temporary file.
///
/// The file is deleted when this value is dropped, unless it is persisted or kept first.
#[derive(Debug)]
pub struct SpooledFile {
    file: NamedTempFile,
    size: u64,
}

impl SpooledFile {
    /// Returns the path of the temporary file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Returns the number of body bytes written.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Opens a new handle to the file, positioned at the start.
    pub fn reopen(&self) -> io::Result<fs::File> {
        self.file.reopen()
    }

    /// Moves the file to `path`, which then outlives this value.
    pub fn persist(self, path: impl AsRef<Path>) -> io::Result<fs::File> {
        self.file.persist(path).map_err(io::Error::from)
    }

    /// Keeps the file at its temporary path, returning that path.
    pub fn keep(self) -> io::Result<PathBuf> {
        self.file
            .keep()
            .map(|(_, path)| path)
            .map_err(io::Error::from)
    }

    /// Deletes the file now, reporting any error that dropping would swallow.
    pub fn remove(self) -> io::Result<()> {
        self.file.close()
    }

    /// Unwraps the underlying temporary file handle.
    pub fn into_temp_file(self) -> NamedTempFile {
        self.file
    }
}

/// Where a finished part's body lives.
#[derive(Debug)]
pub enum Body {
    /// Field part held in memory.
    Memory(Bytes),

    /// File part spooled to temporary storage.
    Spooled(SpooledFile),
}

impl Body {
    /// Returns the body length in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Body::Memory(bytes) => bytes.len() as u64,
            Body::Spooled(file) => file.size(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the in-memory bytes of a field part.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Memory(bytes) => Some(bytes),
            Body::Spooled(_) => None,
        }
    }

    /// Returns the spooled file of a file part.
    pub fn as_spooled(&self) -> Option<&SpooledFile> {
        match self {
            Body::Memory(_) => None,
            Body::Spooled(file) => Some(file),
        }
    }

    /// Releases any storage held by the body, reporting deletion errors.
    pub fn release(self) -> io::Result<()> {
        match self {
            Body::Memory(_) => Ok(()),
            Body::Spooled(file) => file.remove(),
        }
    }
}

/// Receives a part's body bytes as they are scanned.
pub(crate) enum PartSink {
    Memory(MemorySink),
    Spool(SpoolSink),
}

impl PartSink {
    /// Picks the sink for a part: file parts are spooled, field parts are kept in memory.
    pub(crate) fn for_header(
        header: &PartHeader,
        config: &MultipartConfig,
        storage: &Rc<dyn TempStorage>,
    ) -> Self {
        if header.is_file() {
            PartSink::Spool(SpoolSink {
                field_name: header.name().to_owned(),
                storage: Rc::clone(storage),
                limit: config.get_file_limit(),
                spool: None,
                size: 0,
            })
        } else {
            PartSink::Memory(MemorySink {
                field_name: header.name().to_owned(),
                buf: BytesMut::new(),
                limit: config.get_memory_limit(),
            })
        }
    }

    /// Accepts a chunk of body bytes.
    ///
    /// The chunk is taken before the first suspension point. If the returned future is dropped
    /// early, the unwritten bytes stay buffered and go out with the next write or flush.
    pub(crate) async fn write(&mut self, chunk: &[u8]) -> Result<(), MultipartError> {
        match self {
            PartSink::Memory(sink) => sink.write(chunk),
            PartSink::Spool(sink) => sink.write(chunk).await,
        }
    }

    /// Writes out everything accepted so far.
    pub(crate) async fn flush(&mut self) -> Result<(), MultipartError> {
        match self {
            PartSink::Memory(_) => Ok(()),
            PartSink::Spool(sink) => sink.flush().await,
        }
    }

    /// Converts a flushed sink into the part's body.
    pub(crate) fn into_body(self) -> Result<Body, MultipartError> {
        match self {
            PartSink::Memory(sink) => Ok(sink.into_body()),
            PartSink::Spool(sink) => sink.into_body(),
        }
    }

    /// Discards everything written so far.
    pub(crate) fn abort(self) {
        match self {
            PartSink::Memory(_) => {}
            PartSink::Spool(sink) => sink.abort(),
        }
    }
}

impl fmt::Debug for PartSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartSink::Memory(sink) => write!(f, "PartSink::Memory({})", sink.field_name),
            PartSink::Spool(sink) => write!(f, "PartSink::Spool({})", sink.field_name),
        }
    }
}

pub(crate) struct MemorySink {
    field_name: String,
    buf: BytesMut,
    limit: usize,
}

impl MemorySink {
    fn write(&mut self, chunk: &[u8]) -> Result<(), MultipartError> {
        if self.buf.len() + chunk.len() > self.limit {
            return Err(MultipartError::PartTooLarge {
                field_name: self.field_name.clone(),
                limit: self.limit as u64,
            });
        }

        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    fn into_body(self) -> Body {
        Body::Memory(self.buf.freeze())
    }
}

struct Spool {
    temp: NamedTempFile,
    file: tokio::fs::File,

    /// Bytes accepted by the sink that the file has not taken yet.
    pending: BytesMut,
}

impl Spool {
    /// Hands pending bytes to the file.
    ///
    /// Bytes leave `pending` only once a write has taken them, so a dropped drain loses nothing.
    async fn drain(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            let n = self.file.write(&self.pending).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.pending.advance(n);
        }

        Ok(())
    }
}

pub(crate) struct SpoolSink {
    field_name: String,
    storage: Rc<dyn TempStorage>,
    limit: Option<u64>,
    spool: Option<Spool>,
    size: u64,
}

impl SpoolSink {
    /// Creates the temporary file backing this part.
    fn open(&self) -> Result<Spool, MultipartError> {
        let temp = self.storage.create().map_err(MultipartError::Write)?;
        let file = tokio::fs::File::from_std(temp.reopen().map_err(MultipartError::Write)?);

        log::debug!(
            "spooling part `{}` to {}",
            self.field_name,
            temp.path().display()
        );

        Ok(Spool {
            temp,
            file,
            pending: BytesMut::new(),
        })
    }

    /// Returns the open spool, creating the temporary file on first use.
    fn spool(&mut self) -> Result<&mut Spool, MultipartError> {
        let spool = match self.spool.take() {
            Some(spool) => spool,
            None => self.open()?,
        };

        Ok(self.spool.insert(spool))
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), MultipartError> {
        if !chunk.is_empty() {
            let size = self.size + chunk.len() as u64;

            if let Some(limit) = self.limit {
                if size > limit {
                    return Err(MultipartError::PartTooLarge {
                        field_name: self.field_name.clone(),
                        limit,
                    });
                }
            }

            self.spool()?.pending.extend_from_slice(chunk);
            self.size = size;
        }

        // also picks up whatever an interrupted write left behind
        match self.spool.as_mut() {
            Some(spool) => spool.drain().await.map_err(MultipartError::Write),
            None => Ok(()),
        }
    }

    /// Drains and flushes the file, creating it first for an empty upload.
    async fn flush(&mut self) -> Result<(), MultipartError> {
        let spool = self.spool()?;
        spool.drain().await.map_err(MultipartError::Write)?;
        spool.file.flush().await.map_err(MultipartError::Write)
    }

    fn into_body(mut self) -> Result<Body, MultipartError> {
        let Spool { temp, .. } = match self.spool.take() {
            Some(spool) => spool,
            // empty upload; still hand out a (zero length) file
            None => self.open()?,
        };

        Ok(Body::Spooled(SpooledFile {
            file: temp,
            size: self.size,
        }))
    }

    fn abort(self) {
        if let Some(Spool { temp, file, .. }) = self.spool {
            drop(file);

            let path = temp.path().to_owned();
            if let Err(err) = temp.close() {
                log::warn!("failed to remove spooled file {}: {err}", path.display());
            }
        }
    }
}
