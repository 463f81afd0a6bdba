//! An in-process [`Bucket`], for running masking jobs without any object storage service.
//!
//! Uploads go through the same chunking as the S3 implementation, and the number of parts each
//! object was uploaded in is recorded, so callers can see which objects would have been
//! multipart uploads.  Reads and writes of particular keys can be made to fail.
use super::{Bucket, ObjectHandle, ObjectMetadata, DEFAULT_CONTENT_TYPE};
use crate::chunks::{ChunkRead, ObjectReader};
use crate::writers::{self, Upload, UploadSizes};
use crate::{Config, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use snafu::{prelude::*, IntoError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Clone, Debug)]
struct MemoryObject {
    data: Bytes,
    content_type: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, MemoryObject>,
    parts_uploaded: HashMap<String, usize>,
    head_requests: HashMap<String, usize>,
    failing_reads: HashSet<String>,
    failing_writes: HashSet<String>,
}

#[derive(Clone)]
pub struct MemoryBucket {
    inner: Arc<MemoryBucketInner>,
}

struct MemoryBucketInner {
    name: String,
    sizes: UploadSizes,
    state: Mutex<State>,
}

impl MemoryBucket {
    /// Make an empty bucket.  Uploads use the multipart settings from `config`.
    pub fn new(name: impl Into<String>, config: &Config) -> Self {
        Self {
            inner: Arc::new(MemoryBucketInner {
                name: name.into(),
                sizes: UploadSizes {
                    threshold: config.multipart_threshold.get_bytes() as usize,
                    part_size: config.multipart_chunk_size.get_bytes() as usize,
                    read_size: config.chunk_size_bytes(),
                },
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .expect("BUG: memory bucket mutex poisoned")
    }

    /// Store an object, replacing any existing object with the same key.
    pub fn put(&self, key: impl Into<String>, content_type: &str, data: impl Into<Bytes>) {
        self.state().objects.insert(
            key.into(),
            MemoryObject {
                data: data.into(),
                content_type: Some(content_type.to_string()),
            },
        );
    }

    /// Store an object with no content type.
    pub fn put_untyped(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.state().objects.insert(
            key.into(),
            MemoryObject {
                data: data.into(),
                content_type: None,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.state().objects.get(key).map(|object| object.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// How many multipart parts the object at `key` was last written in, or `None` if it was
    /// written in a single request (or never written).
    pub fn parts_uploaded(&self, key: &str) -> Option<usize> {
        self.state().parts_uploaded.get(key).copied()
    }

    /// How many times the metadata of `key` has been requested.
    pub fn head_requests(&self, key: &str) -> usize {
        self.state().head_requests.get(key).copied().unwrap_or(0)
    }

    /// Make every attempt to open `key` for reading fail.
    pub fn fail_reads_of(&self, key: impl Into<String>) {
        self.state().failing_reads.insert(key.into());
    }

    /// Make every write to `key` fail, after the data have been read.
    pub fn fail_writes_to(&self, key: impl Into<String>) {
        self.state().failing_writes.insert(key.into());
    }

    fn object(&self, key: &str) -> Result<MemoryObject> {
        self.state()
            .objects
            .get(key)
            .cloned()
            .with_context(|| crate::error::ObjectNotFoundSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })
    }

    fn injected_failure(&self, key: &str, what: &str) -> std::io::Error {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("injected {what} failure for '{key}'"),
        )
    }
}

#[async_trait::async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn list_objects(
        &self,
        prefix: &str,
    ) -> Result<BoxStream<'static, Result<ObjectHandle>>> {
        let keys: Vec<String> = self
            .state()
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();

        debug!(bucket = %self.inner.name, prefix, count = keys.len(), "Listed objects");

        let me = self.clone();
        Ok(futures::stream::iter(keys)
            .map(move |key| Ok(ObjectHandle::new(Box::new(me.clone()), key)))
            .boxed())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata> {
        *self
            .state()
            .head_requests
            .entry(key.to_string())
            .or_default() += 1;

        let object = self.object(key)?;

        Ok(ObjectMetadata {
            content_type: object
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            size: object.data.len() as u64,
        })
    }

    async fn read_object(&self, key: &str) -> Result<Box<dyn ChunkRead>> {
        if self.state().failing_reads.contains(key) {
            return Err(crate::error::ReadObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            }
            .into_error(self.injected_failure(key, "read")));
        }

        let object = self.object(key)?;

        Ok(Box::new(ObjectReader::new(
            self.inner.name.clone(),
            key,
            std::io::Cursor::new(object.data),
        )))
    }

    async fn write_object(
        &self,
        key: &str,
        reader: &mut dyn ChunkRead,
        size_hint: Option<u64>,
    ) -> Result<u64> {
        let sizes = self.inner.sizes.for_size_hint(size_hint);

        let (data, parts) = match writers::prepare_upload(reader, sizes).await? {
            Upload::Small(data) => (data, None),
            Upload::Multipart(chunks) => {
                let chunks: Vec<_> = chunks.try_collect().await?;
                let mut data = BytesMut::new();
                for chunk in &chunks {
                    data.extend_from_slice(&chunk.data);
                }
                (data.freeze(), Some(chunks.len()))
            }
        };

        let mut state = self.state();

        if state.failing_writes.contains(key) {
            return Err(crate::error::WriteObjectSnafu {
                key: key.to_string(),
            }
            .into_error(self.injected_failure(key, "write")));
        }

        let total_bytes = data.len() as u64;
        debug!(bucket = %self.inner.name, key, total_bytes, ?parts, "Wrote object");

        match parts {
            Some(parts) => state.parts_uploaded.insert(key.to_string(), parts),
            None => state.parts_uploaded.remove(key),
        };
        state.objects.insert(
            key.to_string(),
            MemoryObject {
                data,
                content_type: None,
            },
        );

        Ok(total_bytes)
    }
}

impl std::fmt::Debug for MemoryBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBucket")
            .field("name", &self.inner.name)
            .finish()
    }
}
