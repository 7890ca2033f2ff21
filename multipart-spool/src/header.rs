//! Part header block parsing.

use std::str;

use mime::Mime;

use crate::error::{HeaderParseError, MultipartError};

const MAX_HEADERS: usize = 32;

/// Metadata from a part's header block.
///
/// A part whose `Content-Disposition` carries a `filename` parameter is a file part; any other
/// part is a field part.
#[derive(Debug, Clone)]
pub struct PartHeader {
    field_name: String,
    file_name: Option<String>,
    content_type: Option<Mime>,
    headers: Vec<(String, Vec<u8>)>,
}

impl PartHeader {
    /// Parses a header block, up to and including the blank line that terminates it.
    ///
    /// According to [RFC 7578 §4.2](https://datatracker.ietf.org/doc/html/rfc7578#section-4.2),
    /// each part must have a `Content-Disposition: form-data` header with a `name` parameter.
    /// Parts without one are rejected rather than skipped.
    pub fn parse(block: &[u8]) -> Result<Self, MultipartError> {
        let mut hdrs = [httparse::EMPTY_HEADER; MAX_HEADERS];

        let hdrs = match httparse::parse_headers(block, &mut hdrs)? {
            httparse::Status::Complete((_, hdrs)) => hdrs,
            httparse::Status::Partial => return Err(HeaderParseError::Incomplete.into()),
        };

        let headers = hdrs
            .iter()
            .map(|h| (h.name.to_owned(), h.value.to_owned()))
            .collect::<Vec<_>>();

        let disposition = find(&headers, "content-disposition")
            .ok_or(HeaderParseError::ContentDispositionMissing)?;
        let disposition = ContentDisposition::parse(disposition)?;

        let field_name = disposition.name.ok_or(HeaderParseError::NameMissing)?;

        let content_type = find(&headers, "content-type").and_then(|ct| {
            let mime = str::from_utf8(ct).ok().and_then(|ct| ct.parse::<Mime>().ok());
            if mime.is_none() {
                log::warn!("ignoring unparsable Content-Type on part `{field_name}`");
            }
            mime
        });

        // nested multipart stream is not supported
        if let Some(mime) = &content_type {
            if mime.type_() == mime::MULTIPART {
                return Err(MultipartError::Nested);
            }
        }

        Ok(PartHeader {
            field_name,
            file_name: disposition.filename,
            content_type,
            headers,
        })
    }

    /// Returns the form field name from the `name` parameter.
    pub fn name(&self) -> &str {
        &self.field_name
    }

    /// Returns the `filename` parameter, exactly as sent by the client.
    ///
    /// This is client-controlled and may contain path separators; see
    /// [`sanitized_file_name`](Self::sanitized_file_name) before using it on a file system.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Returns the last path component of the `filename` parameter.
    ///
    /// Both `/` and `\` are treated as separators. Returns `None` if there is no file name or if
    /// what remains is empty, `.` or `..`.
    pub fn sanitized_file_name(&self) -> Option<&str> {
        let name = self.file_name.as_deref()?;
        let name = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();

        match name {
            "" | "." | ".." => None,
            name => Some(name),
        }
    }

    /// Returns the part's content (mime) type, if the client supplied a parsable one.
    ///
    /// According to [RFC 7578 §4.4](https://www.rfc-editor.org/rfc/rfc7578#section-4.4), if it
    /// is not present, it should default to "text/plain".
    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type.as_ref()
    }

    /// Returns true if this is a file part.
    pub fn is_file(&self) -> bool {
        self.file_name.is_some()
    }

    /// Returns the raw value of the first header named `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        find(&self.headers, name)
    }

    /// Iterates over all header lines in the order they were received.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_slice()))
    }
}

fn find<'a>(headers: &'a [(String, Vec<u8>)], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_slice())
}

/// The parts of a `Content-Disposition: form-data` header this crate cares about.
#[derive(Debug, Default, PartialEq, Eq)]
struct ContentDisposition {
    name: Option<String>,
    filename: Option<String>,
}

impl ContentDisposition {
    fn parse(value: &[u8]) -> Result<Self, HeaderParseError> {
        let value = str::from_utf8(value).map_err(|_| HeaderParseError::InvalidParameter)?;

        let (disposition, mut rest) = value.split_at(value.find(';').unwrap_or(value.len()));

        if !disposition.trim().eq_ignore_ascii_case("form-data") {
            return Err(HeaderParseError::ContentDispositionMissing);
        }

        let mut cd = ContentDisposition::default();

        loop {
            rest = rest.trim_start();

            let Some(param) = rest.strip_prefix(';') else {
                if rest.is_empty() {
                    break;
                }
                return Err(HeaderParseError::InvalidParameter);
            };

            let param = param.trim_start();
            if param.is_empty() {
                // tolerate a trailing semicolon
                break;
            }

            let (key, value) = param
                .split_once('=')
                .ok_or(HeaderParseError::InvalidParameter)?;
            let key = key.trim();
            let (value, remaining) = parse_param_value(value.trim_start())?;
            rest = remaining;

            let slot = if key.eq_ignore_ascii_case("name") {
                &mut cd.name
            } else if key.eq_ignore_ascii_case("filename") {
                &mut cd.filename
            } else {
                log::trace!("ignoring Content-Disposition parameter `{key}`");
                continue;
            };

            // first occurrence wins
            if slot.is_none() {
                *slot = Some(value);
            }
        }

        Ok(cd)
    }
}

/// Parses a token or quoted-string parameter value, returning it and the unparsed remainder.
fn parse_param_value(input: &str) -> Result<(String, &str), HeaderParseError> {
    let Some(quoted) = input.strip_prefix('"') else {
        let end = input.find(';').unwrap_or(input.len());
        return Ok((input[..end].trim_end().to_owned(), &input[end..]));
    };

    let mut value = String::new();
    let mut chars = quoted.char_indices();

    while let Some((idx, ch)) = chars.next() {
        match ch {
            '"' => return Ok((value, &quoted[idx + 1..])),
            '\\' => {
                let (_, escaped) = chars.next().ok_or(HeaderParseError::InvalidParameter)?;
                value.push(escaped);
            }
            ch => value.push(ch),
        }
    }

    Err(HeaderParseError::InvalidParameter)
}
