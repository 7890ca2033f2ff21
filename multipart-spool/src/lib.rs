//! Streaming `multipart/form-data` parser.
//!
//! Parts are read incrementally from a [`ByteSource`] with bounded buffering. Field parts are
//! collected in memory. File parts (those with a `filename`) are spooled to temporary files that
//! are removed again when the part is dropped, or when parsing fails partway through.
//!
//! # Examples
//!
//! ```
//! use bytes::Bytes;
//! use multipart_spool::Multipart;
//!
//! # #[actix_rt::main]
//! # async fn main() -> Result<(), multipart_spool::MultipartError> {
//! let body = Bytes::from_static(
//!     b"--XYZ\r\n\
//!       Content-Disposition: form-data; name=\"title\"\r\n\
//!       \r\n\
//!       Hello\r\n\
//!       --XYZ\r\n\
//!       Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
//!       \r\n\
//!       abc\r\n\
//!       --XYZ--\r\n",
//! );
//!
//! let mut multipart = Multipart::new(body, "XYZ")?;
//!
//! let title = multipart.next_part().await?.unwrap();
//! assert_eq!(title.name(), "title");
//! assert_eq!(title.text(), Some("Hello"));
//!
//! let upload = multipart.next_part().await?.unwrap();
//! assert_eq!(upload.file_name(), Some("a.txt"));
//! assert_eq!(upload.body().len(), 3);
//!
//! assert!(multipart.next_part().await?.is_none());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_debug_implementations)]

mod config;
mod error;
mod header;
mod multipart;
mod scanner;
mod sink;
mod source;

pub use self::config::{
    MultipartConfig, DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_PARTS, DEFAULT_MEMORY_LIMIT,
    DEFAULT_READ_SIZE,
};
pub use self::error::{HeaderParseError, MultipartError};
pub use self::header::PartHeader;
pub use self::multipart::{boundary_from_content_type, parse, Multipart, ParsedPart};
pub use self::sink::{Body, SpooledFile, TempFileStorage, TempStorage};
pub use self::source::{ByteSource, ReaderSource, StreamSource};
