//! Turns a [`ChunkRead`] into the pieces an object store upload is made of.
//!
//! Small objects are collected into a single buffer and uploaded in one request.  Anything at or
//! above the multipart threshold is broken up into a stream of [`MultipartChunk`]s of the
//! multipart chunk size, which are produced lazily as the uploader pulls them so that only the
//! parts currently being uploaded are ever in memory.
use crate::{chunks::ChunkRead, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, warn};

/// S3 refuses multipart uploads with more than this many parts
const MAX_PARTS: u64 = 10_000;

pub(crate) struct MultipartChunk {
    /// The part number of the chunk starting from 1, the way S3 numbers parts.
    pub part_number: usize,

    /// The contents of this chunk
    pub data: Bytes,
}

impl std::fmt::Debug for MultipartChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartChunk")
            .field("part_number", &self.part_number)
            .field("len", &self.data.len())
            .finish()
    }
}

/// How the data from a reader should be uploaded.
pub(crate) enum Upload<'a> {
    /// The reader was exhausted before reaching the multipart threshold, so the whole thing is
    /// in this buffer (which may be empty)
    Small(Bytes),

    /// The data is at least as big as the multipart threshold and must be uploaded in parts.
    ///
    /// The stream yields parts in order, and errors if the underlying reader fails.
    Multipart(BoxStream<'a, Result<MultipartChunk>>),
}

/// Upload sizing parameters
#[derive(Clone, Copy, Debug)]
pub(crate) struct UploadSizes {
    /// Objects this size or larger use multipart
    pub threshold: usize,

    /// Size of each multipart part, except possibly the last one
    pub part_size: usize,

    /// Maximum size of each read from the reader
    pub read_size: usize,
}

impl UploadSizes {
    /// Adjust the part size so an object of about `size_hint` bytes won't need more than the
    /// maximum number of parts S3 allows.
    pub(crate) fn for_size_hint(mut self, size_hint: Option<u64>) -> Self {
        self.threshold = self.threshold.max(1);
        self.part_size = self.part_size.max(1);
        self.read_size = self.read_size.max(1);

        if let Some(size_hint) = size_hint {
            let part_size = self.part_size as u64;
            if (size_hint + part_size - 1) / part_size > MAX_PARTS {
                let new_part_size = (size_hint + MAX_PARTS - 1) / MAX_PARTS;
                warn!(
                    size_hint,
                    part_size,
                    new_part_size,
                    "Object is so large that the multipart chunk size will be overridden to keep the total part count under 10K"
                );
                self.part_size = new_part_size as usize;
            }
        }

        self
    }
}

/// Read from `reader` until either it's exhausted or the multipart threshold is reached, and
/// decide how the data will be uploaded.
pub(crate) async fn prepare_upload<'a>(
    reader: &'a mut dyn ChunkRead,
    sizes: UploadSizes,
) -> Result<Upload<'a>> {
    let mut buffer = BytesMut::new();

    while buffer.len() < sizes.threshold {
        match reader.read_chunk(sizes.read_size).await? {
            Some(chunk) => buffer.extend_from_slice(&chunk),
            None => {
                debug!(
                    len = buffer.len(),
                    "Reader exhausted below the multipart threshold"
                );
                return Ok(Upload::Small(buffer.freeze()));
            }
        }
    }

    debug!(
        buffered = buffer.len(),
        part_size = sizes.part_size,
        "Multipart threshold reached"
    );

    Ok(Upload::Multipart(multipart_chunks(reader, buffer, sizes)))
}

struct ChunkerState<'a> {
    reader: &'a mut dyn ChunkRead,
    buffer: BytesMut,
    next_part_number: usize,
    eof: bool,
}

/// Split `buffered` followed by the rest of `reader` into parts of `part_size` bytes.
fn multipart_chunks<'a>(
    reader: &'a mut dyn ChunkRead,
    buffered: BytesMut,
    sizes: UploadSizes,
) -> BoxStream<'a, Result<MultipartChunk>> {
    let state = ChunkerState {
        reader,
        buffer: buffered,
        next_part_number: 1,
        eof: false,
    };

    futures::stream::try_unfold(state, move |mut state| async move {
        while state.buffer.len() < sizes.part_size && !state.eof {
            let wanted = sizes.read_size.min(sizes.part_size - state.buffer.len());
            match state.reader.read_chunk(wanted).await? {
                Some(chunk) => state.buffer.extend_from_slice(&chunk),
                None => state.eof = true,
            }
        }

        if state.buffer.is_empty() {
            return Ok(None);
        }

        let len = state.buffer.len().min(sizes.part_size);
        let chunk = MultipartChunk {
            part_number: state.next_part_number,
            data: state.buffer.split_to(len).freeze(),
        };
        state.next_part_number += 1;

        Ok(Some((chunk, state)))
    })
    .boxed()
}
