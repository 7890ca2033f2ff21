//! Parser configuration.

/// Default cap on a single part's header block (8 KiB).
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;

/// Default cap on an in-memory field body (2 MiB).
pub const DEFAULT_MEMORY_LIMIT: usize = 2 * 1024 * 1024;

/// Default maximum number of parts in one body.
pub const DEFAULT_MAX_PARTS: usize = 100;

/// Default number of bytes requested from the byte source per read (8 KiB).
pub const DEFAULT_READ_SIZE: usize = 8 * 1024;

/// Configuration for [`Multipart`](crate::Multipart).
///
/// ```
/// use multipart_spool::MultipartConfig;
///
/// let config = MultipartConfig::default()
///     .memory_limit(64 * 1024)
///     .file_limit(100 * 1024 * 1024)
///     .max_parts(8);
/// assert_eq!(config.get_max_parts(), 8);
/// ```
#[derive(Debug, Clone)]
pub struct MultipartConfig {
    max_header_size: usize,
    memory_limit: usize,
    file_limit: Option<u64>,
    max_parts: usize,
    read_size: usize,
}

const DEFAULT_CONFIG: MultipartConfig = MultipartConfig {
    max_header_size: DEFAULT_MAX_HEADER_SIZE,
    memory_limit: DEFAULT_MEMORY_LIMIT,
    file_limit: None,
    max_parts: DEFAULT_MAX_PARTS,
    read_size: DEFAULT_READ_SIZE,
};

impl MultipartConfig {
    /// Sets the maximum size of a part's header block, including the terminating blank line.
    pub fn max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    /// Sets the maximum size of a field part (one without a `filename`) held in memory.
    pub fn memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Sets the maximum size of a single spooled file. Unlimited by default.
    pub fn file_limit(mut self, limit: u64) -> Self {
        self.file_limit = Some(limit);
        self
    }

    /// Sets the maximum number of parts accepted in one body.
    pub fn max_parts(mut self, max: usize) -> Self {
        self.max_parts = max;
        self
    }

    /// Sets how many bytes are requested from the byte source per read.
    ///
    /// Values of zero are raised to one.
    pub fn read_size(mut self, size: usize) -> Self {
        self.read_size = size.max(1);
        self
    }

    /// Returns the maximum size of a part's header block, in bytes.
    pub fn get_max_header_size(&self) -> usize {
        self.max_header_size
    }

    /// Returns the maximum size of a field part held in memory.
    pub fn get_memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Returns the maximum size of a spooled file part, if limited.
    pub fn get_file_limit(&self) -> Option<u64> {
        self.file_limit
    }

    /// Returns the maximum number of parts per body.
    pub fn get_max_parts(&self) -> usize {
        self.max_parts
    }

    /// Returns the maximum number of bytes requested per read.
    pub fn get_read_size(&self) -> usize {
        self.read_size
    }
}

impl Default for MultipartConfig {
    fn default() -> Self {
        DEFAULT_CONFIG
    }
}
