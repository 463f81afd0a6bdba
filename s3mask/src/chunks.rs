//! Forward-only, chunked byte readers.
//!
//! Both directions of the masking pipeline move object data as a sequence of chunks: object
//! contents read from the bucket become the body of the request to the masking service, and each
//! part of the masking service's response becomes the source of a write back to the bucket (or
//! to the local filesystem).  [`ChunkRead`] is the one interface both directions share.  Every
//! implementation holds at most one chunk in memory at a time, no matter how large the object is.
use crate::{Result, S3MaskError};
use bytes::{Bytes, BytesMut};
use snafu::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// A source of bytes that can be read in chunks of a caller-specified maximum size.
#[async_trait::async_trait]
pub trait ChunkRead: Send {
    /// Read the next chunk of at most `max_bytes` bytes.
    ///
    /// Returns `Ok(None)` at the end of the stream.  The chunks returned are never empty.
    async fn read_chunk(&mut self, max_bytes: usize) -> Result<Option<Bytes>>;
}

#[async_trait::async_trait]
impl<T: ChunkRead + ?Sized> ChunkRead for Box<T> {
    async fn read_chunk(&mut self, max_bytes: usize) -> Result<Option<Bytes>> {
        (**self).read_chunk(max_bytes).await
    }
}

/// [`ChunkRead`] for any [`AsyncRead`] that yields the contents of an object, such as the body of
/// an S3 `GetObject` response.
pub(crate) struct ObjectReader<R> {
    bucket: String,
    key: String,
    reader: R,
}

impl<R> ObjectReader<R> {
    pub(crate) fn new(bucket: impl Into<String>, key: impl Into<String>, reader: R) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            reader,
        }
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Send + Unpin> ChunkRead for ObjectReader<R> {
    async fn read_chunk(&mut self, max_bytes: usize) -> Result<Option<Bytes>> {
        let max_bytes = max_bytes.max(1);
        let mut buffer = BytesMut::with_capacity(max_bytes);

        // `take` keeps the read within `max_bytes` even if the allocation came out larger
        let bytes_read = (&mut self.reader)
            .take(max_bytes as u64)
            .read_buf(&mut buffer)
            .await
            .with_context(|_| crate::error::ReadObjectSnafu {
                bucket: self.bucket.clone(),
                key: self.key.clone(),
            })?;

        if bytes_read == 0 {
            Ok(None)
        } else {
            Ok(Some(buffer.freeze()))
        }
    }
}

/// [`ChunkRead`] for one field of a multipart body.
///
/// The multipart parser yields data in whatever sizes it arrives off the wire, so anything beyond
/// `max_bytes` is held back and returned by the next call.
pub(crate) struct FieldReader {
    key: String,
    field: multer::Field<'static>,
    pending: Bytes,
}

impl FieldReader {
    pub(crate) fn new(key: impl Into<String>, field: multer::Field<'static>) -> Self {
        Self {
            key: key.into(),
            field,
            pending: Bytes::new(),
        }
    }
}

#[async_trait::async_trait]
impl ChunkRead for FieldReader {
    async fn read_chunk(&mut self, max_bytes: usize) -> Result<Option<Bytes>> {
        while self.pending.is_empty() {
            match self
                .field
                .chunk()
                .await
                .with_context(|_| crate::error::MaskResponseSnafu {
                    key: self.key.clone(),
                })? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(None),
            }
        }

        let len = self.pending.len().min(max_bytes.max(1));
        Ok(Some(self.pending.split_to(len)))
    }
}

/// Stream the contents of `reader` as a [`futures::Stream`] of chunks, suitable for use as an HTTP
/// request body.
///
/// The reading is done by a separate async task which sends each chunk on a channel with room
/// for only a single chunk, so no more than two chunks are ever in memory at once.  If the
/// returned stream is dropped, the task stops at its next send.
pub(crate) fn into_stream(
    mut reader: Box<dyn ChunkRead>,
    chunk_size: usize,
) -> ReceiverStream<Result<Bytes, S3MaskError>> {
    let (sender, receiver) = mpsc::channel(1);

    tokio::spawn(async move {
        loop {
            let result = reader.read_chunk(chunk_size).await;
            let done = !matches!(result, Ok(Some(_)));

            let item = match result {
                Ok(Some(chunk)) => Ok(chunk),
                Ok(None) => break,
                Err(e) => {
                    warn!(err = ?e, "Error reading chunk; the request body will be truncated");
                    Err(e)
                }
            };

            if sender.send(item).await.is_err() {
                debug!("chunk receiver was dropped; stopping the reader task");
                break;
            }

            if done {
                break;
            }
        }
    });

    ReceiverStream::new(receiver)
}

/// Copy everything from `reader` into `writer`, one chunk at a time, returning the number of bytes
/// copied.
///
/// `destination` is only used to describe the writer in errors.  The writer is flushed and shut
/// down once the reader is exhausted.
pub(crate) async fn copy_chunks<W>(
    reader: &mut dyn ChunkRead,
    chunk_size: usize,
    writer: &mut W,
    destination: &str,
) -> Result<u64>
where
    W: AsyncWrite + Send + Unpin + ?Sized,
{
    let mut total_bytes = 0u64;

    while let Some(chunk) = reader.read_chunk(chunk_size).await? {
        writer
            .write_all(&chunk)
            .await
            .with_context(|_| crate::error::WriteObjectSnafu {
                key: destination.to_string(),
            })?;
        total_bytes += chunk.len() as u64;
    }

    writer
        .shutdown()
        .await
        .with_context(|_| crate::error::WriteObjectSnafu {
            key: destination.to_string(),
        })?;

    Ok(total_bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::StreamExt;
    use snafu::IntoError;
    use std::io::Cursor;

    /// A [`ChunkRead`] over an in-memory buffer which hands out data in fixed-size pieces regardless
    /// of what the caller asks for, and optionally fails after a certain number of pieces
    pub(crate) struct ScriptedReader {
        pieces: std::collections::VecDeque<Bytes>,
        fail_after: Option<usize>,
    }

    impl ScriptedReader {
        pub(crate) fn new(data: &[u8], piece_size: usize) -> Self {
            Self {
                pieces: data
                    .chunks(piece_size)
                    .map(Bytes::copy_from_slice)
                    .collect(),
                fail_after: None,
            }
        }

        pub(crate) fn failing_after(mut self, pieces: usize) -> Self {
            self.fail_after = Some(pieces);
            self
        }
    }

    #[async_trait::async_trait]
    impl ChunkRead for ScriptedReader {
        async fn read_chunk(&mut self, max_bytes: usize) -> Result<Option<Bytes>> {
            if let Some(remaining) = self.fail_after.as_mut() {
                if *remaining == 0 {
                    return Err(crate::error::ReadObjectSnafu {
                        bucket: "test",
                        key: "scripted",
                    }
                    .into_error(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "scripted failure",
                    )));
                }
                *remaining -= 1;
            }

            match self.pieces.pop_front() {
                None => Ok(None),
                Some(mut piece) => {
                    if piece.len() > max_bytes {
                        let rest = piece.split_off(max_bytes);
                        self.pieces.push_front(rest);
                    }
                    Ok(Some(piece))
                }
            }
        }
    }

    #[tokio::test]
    async fn object_reader_never_exceeds_max_bytes() {
        let data = vec![7u8; 10_000];
        let mut reader = ObjectReader::new("bucket", "key", Cursor::new(data.clone()));

        let mut read_back = Vec::new();
        while let Some(chunk) = reader.read_chunk(4096).await.unwrap() {
            assert!(!chunk.is_empty());
            assert!(chunk.len() <= 4096);
            read_back.extend_from_slice(&chunk);
        }

        assert_eq!(data, read_back);
    }

    #[tokio::test]
    async fn object_reader_short_source_with_huge_chunk_size() {
        let mut reader = ObjectReader::new("bucket", "key", Cursor::new(b"ten bytes!".to_vec()));

        let chunk = reader.read_chunk(64 * 1024 * 1024).await.unwrap().unwrap();
        assert_eq!(Bytes::from_static(b"ten bytes!"), chunk);
        assert!(reader.read_chunk(64 * 1024 * 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn object_reader_empty_object_is_immediately_exhausted() {
        let mut reader = ObjectReader::new("bucket", "key", Cursor::new(Vec::<u8>::new()));

        assert!(reader.read_chunk(8192).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn into_stream_yields_all_chunks_then_ends() {
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let reader: Box<dyn ChunkRead> = Box::new(ScriptedReader::new(&data, 1000));

        let chunks: Vec<_> = into_stream(reader, 300).collect().await;

        assert!(chunks.iter().all(|chunk| chunk.as_ref().unwrap().len() <= 300));
        let joined: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        assert_eq!(data, joined);
    }

    #[tokio::test]
    async fn into_stream_forwards_read_errors_and_stops() {
        let reader: Box<dyn ChunkRead> =
            Box::new(ScriptedReader::new(&[1u8; 100], 10).failing_after(2));

        let chunks: Vec<_> = into_stream(reader, 10).collect().await;

        assert_eq!(3, chunks.len());
        assert!(chunks[0].is_ok());
        assert!(chunks[1].is_ok());
        assert!(chunks[2].is_err());
    }

    #[tokio::test]
    async fn copy_chunks_copies_everything() {
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut reader = ScriptedReader::new(&data, 7);
        let mut output = Vec::new();

        let copied = copy_chunks(&mut reader, 5, &mut output, "output")
            .await
            .unwrap();

        assert_eq!(data.len() as u64, copied);
        assert_eq!(data, output);
    }
}
