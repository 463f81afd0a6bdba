use crate::{chunks::ChunkRead, Config, Result};
use dyn_clone::DynClone;
use futures::stream::BoxStream;
use snafu::prelude::*;
use url::Url;

mod memory;
mod s3;

pub use memory::MemoryBucket;

/// An object storage system like S3.
///
/// Not all object storage systems expose an S3-compatible API, so to ensure we can add support for
/// those other systems in the future, the object storage implementation is abstracted behind a
/// trait.
///
/// Use [`ObjectStorageFactory`] to create an instance of this trait.
#[async_trait::async_trait]
pub(crate) trait ObjectStorage: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Given a URL that contains a bucket (and possibly a key prefix also), extract the bucket
    /// name, validate it against the underlying object storage system, and if it's valid then
    /// return the bucket to the caller
    async fn extract_bucket_from_url(&self, url: &Url) -> Result<Box<dyn Bucket>>;
}

dyn_clone::clone_trait_object!(ObjectStorage);

/// Metadata about an object that decides whether and how it gets masked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// The content type recorded for the object, or `application/octet-stream` if there is none
    pub content_type: String,

    /// Object size in bytes
    pub size: u64,
}

/// The content type assumed for objects that don't have one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A bucket which is like a namespace in which object storage systems store named objects.
///
/// Masking jobs read the objects to mask from a bucket, and write the masked copies (and
/// possibly the results reports) back into the same bucket.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait Bucket: DynClone + std::fmt::Debug + Sync + Send + 'static {
    fn name(&self) -> &str;

    /// List all objects whose keys start with `prefix`.
    ///
    /// Listing is lazy; pages of results are fetched from the object store as the stream is
    /// polled.  Listing errors are yielded on the stream.
    async fn list_objects(&self, prefix: &str)
        -> Result<BoxStream<'static, Result<ObjectHandle>>>;

    /// Query the metadata of the specified object
    async fn head_object(&self, key: &str) -> Result<ObjectMetadata>;

    /// Open the specified object for reading from the beginning.
    async fn read_object(&self, key: &str) -> Result<Box<dyn ChunkRead>>;

    /// Write everything read from `reader` to the object `key`, replacing it if it exists.
    ///
    /// Data are uploaded as they are read; large objects use multipart uploads with the
    /// configured chunk size and concurrency.  If the caller can predict roughly how big the
    /// object will be, it should pass that as `size_hint`.
    ///
    /// Returns the number of bytes written.  Nothing is left at `key` if this fails.
    async fn write_object(
        &self,
        key: &str,
        reader: &mut dyn ChunkRead,
        size_hint: Option<u64>,
    ) -> Result<u64>;
}

dyn_clone::clone_trait_object!(Bucket);

/// An object found by listing a bucket.
///
/// The object's metadata is fetched on first use and cached, so no matter how many times
/// [`Self::metadata`] is called only one metadata request is made per object.
#[derive(Debug)]
pub struct ObjectHandle {
    bucket: Box<dyn Bucket>,
    key: String,
    metadata: tokio::sync::OnceCell<ObjectMetadata>,
}

impl ObjectHandle {
    pub fn new(bucket: Box<dyn Bucket>, key: impl Into<String>) -> Self {
        Self {
            bucket,
            key: key.into(),
            metadata: tokio::sync::OnceCell::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The object's metadata, loaded from the bucket the first time it's needed.
    pub async fn metadata(&self) -> Result<&ObjectMetadata> {
        self.metadata
            .get_or_try_init(|| self.bucket.head_object(&self.key))
            .await
    }

    /// Open the object for reading
    pub async fn open(&self) -> Result<Box<dyn ChunkRead>> {
        self.bucket.read_object(&self.key).await
    }
}

/// Where the objects to mask are found: a bucket and a key prefix within it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub url: Url,
    pub bucket: String,
    pub prefix: String,
}

impl SourceLocation {
    /// Parse a bare bucket name or a `s3://bucket/prefix` URL.
    pub fn parse(input: &str) -> Result<Self> {
        let url = if input.contains("://") {
            Url::parse(input)
        } else {
            Url::parse(&format!("s3://{input}"))
        }
        .with_context(|_| crate::error::InvalidSourceLocationSnafu {
            input: input.to_string(),
        })?;

        Self::from_url(url)
    }

    pub fn from_url(url: Url) -> Result<Self> {
        if url.scheme() != "s3" {
            return crate::error::UnsupportedObjectStorageSnafu { url }.fail();
        }

        let bucket = match url.host_str() {
            Some(bucket) if !bucket.is_empty() => bucket.to_string(),
            _ => return crate::error::MissingBucketSnafu { url }.fail(),
        };

        let prefix = url_path_to_key(url.path()).to_string();

        Ok(Self {
            url,
            bucket,
            prefix,
        })
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.prefix)
    }
}

/// Paths from URLs like `s3://bucket/prefix/object` always start with `/`, but that's not
/// actually part of the S3 object key.  Fix such paths.
pub(crate) fn url_path_to_key(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

/// Constructs [`ObjectStorage`] implementations on demand.
#[derive(Debug)]
pub(crate) struct ObjectStorageFactory {
    config: Config,
}

impl ObjectStorageFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Given the URL to an object storage bucket or prefix, determine which implementation
    /// handles that particular object storage technology and return an instance of it.
    ///
    /// If the URL isn't recognized as being supported by s3mask, an error is returned
    #[allow(clippy::wrong_self_convention)] // For a factory object I think it's obvious what this means
    pub async fn from_url(&self, url: &Url) -> Result<Box<dyn ObjectStorage>> {
        if url.scheme() == "s3" {
            Ok(self.s3().await)
        } else {
            crate::error::UnsupportedObjectStorageSnafu { url: url.clone() }.fail()
        }
    }

    /// Return a [`ObjectStorage`] implementation for S3 or an S3-compatible API
    pub async fn s3(&self) -> Box<dyn ObjectStorage> {
        // A new client every time; AWS SDK clients hold hyper resources tied to the runtime that
        // created them, and tests run many runtimes in one process.
        Box::new(s3::S3::new(self.config.clone()).await)
    }
}
