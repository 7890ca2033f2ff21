use std::{cell::Cell, fs, io, path::Path, rc::Rc};

use assert_matches::assert_matches;
use bytes::Bytes;
use futures_util::{stream, StreamExt as _};
use multipart_spool::{
    parse, test::FormBuilder, Body, Multipart, MultipartConfig, MultipartError, ParsedPart,
    ReaderSource, StreamSource, TempFileStorage,
};
use tempfile::{NamedTempFile, TempDir};

/// A part reduced to comparable values: name, file name and body contents.
type Summary = (String, Option<String>, Vec<u8>);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn summarize(part: &ParsedPart) -> Summary {
    let contents = match part.body() {
        Body::Memory(bytes) => bytes.to_vec(),
        Body::Spooled(file) => fs::read(file.path()).unwrap(),
    };

    (
        part.name().to_owned(),
        part.file_name().map(ToOwned::to_owned),
        contents,
    )
}

fn spool_dir() -> (TempDir, TempFileStorage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = TempFileStorage::new().directory(dir.path());
    (dir, storage)
}

fn dir_entries(dir: &Path) -> usize {
    fs::read_dir(dir).unwrap().count()
}

fn chunked<I>(body: &Bytes, sizes: I) -> StreamSource
where
    I: IntoIterator<Item = usize>,
    I::IntoIter: Clone,
{
    let mut chunks = Vec::new();
    let mut rest = body.clone();
    let mut sizes = sizes.into_iter().cycle();

    while !rest.is_empty() {
        let len = sizes.next().unwrap_or(rest.len()).min(rest.len());
        chunks.push(Ok::<_, io::Error>(rest.split_to(len)));
    }

    StreamSource::new(tokio_stream::iter(chunks))
}

async fn parse_in(
    dir: &TempDir,
    source: impl multipart_spool::ByteSource + Unpin,
    boundary: &str,
) -> Result<Vec<Summary>, MultipartError> {
    let parts = Multipart::new(source, boundary)?
        .storage(TempFileStorage::new().directory(dir.path()))
        .collect()
        .await?;

    Ok(parts.iter().map(summarize).collect())
}

/// Field and file contents that look a lot like delimiters.
fn tricky_form() -> FormBuilder {
    let form = FormBuilder::new();
    let near_miss = format!("\r\n--{}", &form.boundary()[..form.boundary().len() - 1]);

    form.field("title", "Hello")
        .field("empty", "")
        .field("crlf", "line one\r\nline two\r\n")
        .file("upload", "a.txt", Some(mime::TEXT_PLAIN), "abc")
        .file("near-miss", "b.bin", None, near_miss)
        .file("binary", "c.bin", Some(mime::APPLICATION_OCTET_STREAM), [0u8, 13, 10, 45, 45, 255])
        .file("blank", "d.bin", None, "")
}

fn expected(form: &FormBuilder) -> Vec<Summary> {
    let near_miss = format!("\r\n--{}", &form.boundary()[..form.boundary().len() - 1]);

    vec![
        ("title".to_owned(), None, b"Hello".to_vec()),
        ("empty".to_owned(), None, Vec::new()),
        ("crlf".to_owned(), None, b"line one\r\nline two\r\n".to_vec()),
        ("upload".to_owned(), Some("a.txt".to_owned()), b"abc".to_vec()),
        ("near-miss".to_owned(), Some("b.bin".to_owned()), near_miss.into_bytes()),
        ("binary".to_owned(), Some("c.bin".to_owned()), vec![0, 13, 10, 45, 45, 255]),
        ("blank".to_owned(), Some("d.bin".to_owned()), Vec::new()),
    ]
}

#[actix_rt::test]
async fn round_trip() {
    init_logger();

    let form = tricky_form();
    let expected = expected(&form);
    let boundary = form.boundary().to_owned();
    let body = form.finish();

    let dir = tempfile::tempdir().unwrap();
    let parts = parse_in(&dir, body, &boundary).await.unwrap();
    assert_eq!(parts, expected);
}

#[actix_rt::test]
async fn chunking_does_not_change_result() {
    init_logger();

    let form = tricky_form();
    let expected = expected(&form);
    let boundary = form.boundary().to_owned();
    let body = form.finish();

    let dir = tempfile::tempdir().unwrap();

    let one_byte = parse_in(&dir, chunked(&body, [1]), &boundary).await.unwrap();
    assert_eq!(one_byte, expected);

    let uneven = parse_in(&dir, chunked(&body, [3, 1, 7, 64, 2, 13]), &boundary)
        .await
        .unwrap();
    assert_eq!(uneven, expected);

    // reads smaller than the chunks handed over by the stream
    let small_reads = Multipart::new(chunked(&body, [100]), &boundary)
        .unwrap()
        .config(MultipartConfig::default().read_size(5))
        .storage(TempFileStorage::new().directory(dir.path()))
        .collect()
        .await
        .unwrap();
    assert_eq!(small_reads.iter().map(summarize).collect::<Vec<_>>(), expected);
}

#[actix_rt::test]
async fn delimiter_split_at_every_offset() {
    let body = Bytes::from_static(
        b"--XYZ\r\n\
          Content-Disposition: form-data; name=\"title\"\r\n\
          \r\n\
          Hello\r\n\
          --XYZ\r\n\
          Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
          \r\n\
          abc\r\n\
          --XYZ--\r\n",
    );

    let dir = tempfile::tempdir().unwrap();
    let expected = parse_in(&dir, body.clone(), "XYZ").await.unwrap();

    for at in 1..body.len() {
        let chunks = vec![
            Ok::<_, io::Error>(body.slice(..at)),
            Ok(body.slice(at..)),
        ];
        let source = StreamSource::new(stream::iter(chunks));

        let parts = parse_in(&dir, source, "XYZ").await.unwrap();
        assert_eq!(parts, expected, "split at {at}");
    }

    assert_eq!(dir_entries(dir.path()), 0);
}

#[actix_rt::test]
async fn truncation_leaves_no_files() {
    init_logger();

    let form = FormBuilder::with_boundary("XYZ")
        .field("title", "Hello")
        .file("upload", "a.txt", None, "abc")
        .file("second", "b.txt", None, "defgh");
    let body = form.finish();

    // the body stays valid once the terminal `--XYZ--` is complete
    let complete = body.len() - 2;

    let (dir, _) = spool_dir();

    for len in 0..complete {
        let source = chunked(&body.slice(..len), [4]);
        let res = parse_in(&dir, source, "XYZ").await;

        assert_matches!(
            res,
            Err(MultipartError::MissingInitialBoundary | MultipartError::TruncatedStream),
            "truncated at {len}"
        );
        assert_eq!(dir_entries(dir.path()), 0, "truncated at {len}");
    }

    let parts = parse_in(&dir, body.slice(..complete), "XYZ").await.unwrap();
    assert_eq!(parts.len(), 3);
}

#[actix_rt::test]
async fn preamble_and_epilogue_are_ignored() {
    let form = FormBuilder::with_boundary("XYZ")
        .field("title", "Hello")
        .file("upload", "a.txt", None, "abc");
    let body = form.finish();

    let dir = tempfile::tempdir().unwrap();
    let expected = parse_in(&dir, body.clone(), "XYZ").await.unwrap();

    let mut wrapped = b"This is a preamble.\r\n-- XYZ is mentioned but not a delimiter\r\n".to_vec();
    wrapped.extend_from_slice(&body);
    wrapped.extend_from_slice(b"epilogue that is never parsed --XYZ\r\ngarbage");

    let parts = parse_in(&dir, chunked(&Bytes::from(wrapped), [3]), "XYZ")
        .await
        .unwrap();
    assert_eq!(parts, expected);
}

#[actix_rt::test]
async fn preamble_line_with_longer_boundary_is_skipped() {
    init_logger();

    let body = FormBuilder::with_boundary("XYZ")
        .field("title", "Hello")
        .file("upload", "a.txt", None, "abc")
        .finish();

    let dir = tempfile::tempdir().unwrap();
    let expected = parse_in(&dir, body.clone(), "XYZ").await.unwrap();

    let mut wrapped = b"preamble\r\n--XYZZY is not our boundary\r\n".to_vec();
    wrapped.extend_from_slice(&body);
    let wrapped = Bytes::from(wrapped);

    for size in 1..=9 {
        let parts = parse_in(&dir, chunked(&wrapped, [size]), "XYZ")
            .await
            .unwrap();
        assert_eq!(parts, expected, "chunk size {size}");
    }
}

#[actix_rt::test]
async fn spooled_files_are_independent() {
    let (dir, storage) = spool_dir();

    let body = FormBuilder::with_boundary("XYZ")
        .file("first", "1.txt", None, "one")
        .field("note", "between files")
        .file("second", "2.txt", None, "two")
        .finish();

    let mut parts = Multipart::new(body, "XYZ")
        .unwrap()
        .storage(storage)
        .collect()
        .await
        .unwrap();
    assert_eq!(parts.len(), 3);
    assert_eq!(dir_entries(dir.path()), 2);

    let second = parts.pop().unwrap();
    let note = parts.pop().unwrap();
    let first = parts.pop().unwrap();

    assert_eq!(note.text(), Some("between files"));

    let first_path = first.body().as_spooled().unwrap().path().to_owned();
    let second_path = second.body().as_spooled().unwrap().path().to_owned();
    assert_ne!(first_path, second_path);

    first.release().unwrap();
    assert!(!first_path.exists());
    assert_eq!(fs::read(&second_path).unwrap(), b"two");

    let kept = dir.path().join("kept.txt");
    let Body::Spooled(file) = second.into_body() else {
        panic!("file part should be spooled");
    };
    file.persist(&kept).unwrap();
    assert_eq!(fs::read(&kept).unwrap(), b"two");
}

#[actix_rt::test]
async fn write_failure_releases_earlier_files() {
    let dir = tempfile::tempdir().unwrap();
    let created = Rc::new(Cell::new(0));

    let storage = {
        let created = Rc::clone(&created);
        let dir = dir.path().to_owned();

        move || {
            created.set(created.get() + 1);

            if created.get() > 1 {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
            } else {
                NamedTempFile::new_in(&dir)
            }
        }
    };

    let body = FormBuilder::with_boundary("XYZ")
        .file("first", "1.txt", None, "one")
        .file("second", "2.txt", None, "two")
        .finish();

    let res = Multipart::new(body, "XYZ")
        .unwrap()
        .storage(storage)
        .collect()
        .await;

    assert_matches!(res, Err(MultipartError::Write(err)) if err.kind() == io::ErrorKind::PermissionDenied);
    assert_eq!(created.get(), 2);
    assert_eq!(dir_entries(dir.path()), 0);
}

#[actix_rt::test]
async fn limits() {
    let body = FormBuilder::with_boundary("XYZ")
        .field("small", "ok")
        .field("big", "x".repeat(100))
        .finish();

    let res = Multipart::new(body, "XYZ")
        .unwrap()
        .config(MultipartConfig::default().memory_limit(50))
        .collect()
        .await;
    assert_matches!(
        res,
        Err(MultipartError::PartTooLarge { ref field_name, limit: 50 }) if field_name == "big"
    );

    let (dir, storage) = spool_dir();
    let body = FormBuilder::with_boundary("XYZ")
        .file("upload", "big.bin", None, vec![7u8; 4096])
        .finish();

    let res = Multipart::new(chunked(&body, [512]), "XYZ")
        .unwrap()
        .config(MultipartConfig::default().file_limit(1024))
        .storage(storage)
        .collect()
        .await;
    assert_matches!(res, Err(MultipartError::PartTooLarge { limit: 1024, .. }));
    assert_eq!(dir_entries(dir.path()), 0);
}

#[actix_rt::test]
async fn missing_name_fails_closed() {
    let body = Bytes::from_static(
        b"--XYZ\r\n\
          Content-Disposition: form-data; name=\"ok\"\r\n\
          \r\n\
          1\r\n\
          --XYZ\r\n\
          Content-Disposition: form-data\r\n\
          \r\n\
          2\r\n\
          --XYZ--\r\n",
    );

    let mut multipart = Multipart::new(body, "XYZ").unwrap();
    assert!(multipart.next_part().await.unwrap().is_some());

    let err = multipart.next_part().await.unwrap_err();
    assert!(err.is_client_error());
    assert_eq!(err.to_string(), "Content-Disposition header has no `name` parameter");

    assert!(multipart.next_part().await.unwrap().is_none());
}

#[actix_rt::test]
async fn reader_source() {
    let body = b"--XYZ\r\n\
                 Content-Disposition: form-data; name=\"title\"\r\n\
                 \r\n\
                 Hello\r\n\
                 --XYZ--\r\n";

    let parts = parse(ReaderSource::new(&body[..]), "XYZ").await.unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].text(), Some("Hello"));
}

#[actix_rt::test]
async fn live_stream() {
    let (tx, rx) = tokio::sync::mpsc::channel(1);

    let form = FormBuilder::new()
        .field("title", "Hello")
        .file("upload", "a.txt", None, "abc");
    let content_type = form.content_type();
    let body = form.finish();

    actix_rt::spawn(async move {
        for chunk in body.chunks(5) {
            tx.send(Ok::<_, io::Error>(Bytes::copy_from_slice(chunk)))
                .await
                .unwrap();
        }
    });

    let boundary = multipart_spool::boundary_from_content_type(&content_type).unwrap();
    let source = StreamSource::new(tokio_stream::wrappers::ReceiverStream::new(rx));

    let names = Multipart::new(source, &boundary)
        .unwrap()
        .into_stream()
        .map(|part| part.unwrap().name().to_owned())
        .collect::<Vec<_>>()
        .await;

    assert_eq!(names, ["title", "upload"]);
}
