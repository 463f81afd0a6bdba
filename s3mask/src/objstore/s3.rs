use super::{Bucket, ObjectHandle, ObjectMetadata, ObjectStorage, DEFAULT_CONTENT_TYPE};
use crate::chunks::{ChunkRead, ObjectReader};
use crate::writers::{self, MultipartChunk, Upload, UploadSizes};
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_types::region::Region;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use snafu::{prelude::*, IntoError};
use std::sync::Arc;
use tracing::{debug, error, instrument, Instrument};
use url::Url;

/// Implementation of [`ObjectStorage`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub(super) struct S3 {
    inner: Arc<S3Inner>,
}
struct S3Inner {
    config: Config,
    client: aws_sdk_s3::Client,
}

impl S3 {
    pub(super) async fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(S3Inner {
                client: make_s3_client(&config, None).await,
                config,
            }),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3 {
    async fn extract_bucket_from_url(&self, url: &Url) -> Result<Box<dyn Bucket>> {
        // S3 URLs are of the form:
        // s3://bucket/path
        // In URL terms, the `bucket` part is considered the host name.
        let bucket = url
            .host_str()
            .filter(|bucket| !bucket.is_empty())
            .ok_or_else(|| crate::error::MissingBucketSnafu { url: url.clone() }.build())?;

        Ok(Box::new(S3Bucket::new(self, bucket).await?))
    }
}

impl std::fmt::Debug for S3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S3")
    }
}

#[derive(Clone)]
struct S3Bucket {
    inner: Arc<S3BucketInner>,
}
struct S3BucketInner {
    name: String,

    objstore: S3,

    /// The region this bucket is located in, if it's different from the region specified in the
    /// AWS SDK config.
    ///
    /// If a bucket is in a different region, then we need to use a different
    /// [`aws_sdk_s3::Client`] instance to talk to the S3 APIs when dealing with that bucket.
    region: Option<String>,

    /// The client to use to operate on this bucket.
    client: aws_sdk_s3::Client,
}

impl S3Bucket {
    /// Construct a new instance and validate that the current client has access to the bucket.
    ///
    /// If there is no access to the bucket then fail with an error
    async fn new(objstore: &S3, name: &str) -> Result<Self> {
        debug!(bucket = name, "Validating access to bucket");

        let mut client = objstore.inner.client.clone();

        // If the bucket is in a different region, `head_bucket` will fail and the error will
        // include a header telling us the correct region.  Look for that and handle it properly.
        let region = if let Some(region) = Self::validate_access_and_region(&client, name).await? {
            debug!(bucket = name, %region, "Bucket is in another region; repeating access validation in the correct region");

            client = make_s3_client(&objstore.inner.config, region.clone()).await;

            // Repeat the validation in the new region.  This can fail if we don't have access, but
            // another redirect should never happen.
            if let Some(other_region) = Self::validate_access_and_region(&client, name).await? {
                error!(bucket = name, %region, %other_region, "S3 redirected the bucket to a different region twice");
            }

            Some(region)
        } else {
            None
        };

        debug!(bucket = name, ?region, "Access to bucket is confirmed");

        Ok(Self {
            inner: Arc::new(S3BucketInner {
                name: name.to_string(),
                objstore: objstore.clone(),
                region,
                client,
            }),
        })
    }

    fn config(&self) -> &Config {
        &self.inner.objstore.inner.config
    }

    fn upload_sizes(&self, size_hint: Option<u64>) -> UploadSizes {
        let config = self.config();

        UploadSizes {
            threshold: config.multipart_threshold.get_bytes() as usize,
            part_size: config.multipart_chunk_size.get_bytes() as usize,
            read_size: config.chunk_size_bytes(),
        }
        .for_size_hint(size_hint)
    }

    /// Perform a HEAD on the bucket to check access.
    ///
    /// If the HEAD check passes, it means the client's configured region is correct, the
    /// configured credentials have access to the bucket, and all is well.  In that case this
    /// function returns `Ok(None)`
    ///
    /// If the HEAD check fails with an error that indicates the bucket is in a different region,
    /// then this will return `Ok(Some($region))`, and the check should be repeated again in that
    /// region.
    ///
    /// If the HEAD check fails for any other error, most likely because the bucket doesn't exist
    /// or the credentials don't have access to it, then this returns the corresponding error.
    async fn validate_access_and_region(
        client: &aws_sdk_s3::Client,
        name: &str,
    ) -> Result<Option<String>> {
        if let Err(e) = client.head_bucket().bucket(name).send().await {
            if let aws_sdk_s3::error::SdkError::ServiceError(service_error) = &e {
                let response = service_error.raw();
                if response.status().as_u16() == http::StatusCode::MOVED_PERMANENTLY.as_u16() {
                    if let Some(region) = response.headers().get("x-amz-bucket-region") {
                        // This is AWS's way of telling us we have the right bucket, but it is in
                        // another region so we should use the appropriate region endpoint
                        return Ok(Some(region.to_string()));
                    }
                }
            };

            Err(crate::error::BucketInvalidOrNotAccessibleSnafu {
                bucket: name.to_string(),
            }
            .into_error(e))
        } else {
            Ok(None)
        }
    }

    /// Upload the object identified by `key` using the S3 upload API that takes a single binary
    /// payload for the entire object.
    #[instrument(skip(self, data), fields(bucket = %self.inner.name))]
    async fn unipart_object_writer(&self, key: &str, data: bytes::Bytes) -> Result<u64> {
        let total_bytes = data.len() as u64;

        debug!(total_bytes, "Uploading unipart object");

        self.inner
            .client
            .put_object()
            .bucket(&self.inner.name)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(total_bytes)
    }

    /// Upload the parts produced by `chunks` as a multipart upload, with up to the configured
    /// number of parts in flight at once.
    ///
    /// On failure the multipart upload is aborted, so no partial object remains.
    #[instrument(skip(self, chunks), fields(bucket = %self.inner.name))]
    async fn multipart_object_writer(
        &self,
        key: &str,
        chunks: BoxStream<'_, Result<MultipartChunk>>,
    ) -> Result<u64> {
        // S3 requires that multi-part be initialized in advance, then each individual part can be
        // uploaded in whatever order is convenient
        let response = self
            .inner
            .client
            .create_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;
        let upload_id = response
            .upload_id()
            .expect("BUG: multi-part uploads always have upload ID")
            .to_string();

        let result = self.upload_parts(key, &upload_id, chunks).await;

        if let Err(e) = &result {
            // Before reporting this error, clean up the remains of the multi-part upload
            error!(?e, bucket = %self.inner.name, %key, %upload_id,
                "Multi-part upload failed; aborting multi-part upload on server side");

            if let Err(e) = self
                .inner
                .client
                .abort_multipart_upload()
                .bucket(&self.inner.name)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                error!(?e, bucket = %self.inner.name, %key, %upload_id,
                    "Error aborting multi-part upload.  This will remain on the server forever unless there's a lifecycle policy configured");
            }
        }

        result
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        chunks: BoxStream<'_, Result<MultipartChunk>>,
    ) -> Result<u64> {
        let chunk_futs = chunks.map_ok(|chunk| {
            let part_number = chunk.part_number;
            let chunk_size = chunk.data.len();

            let span = tracing::debug_span!("upload chunk", part_number, chunk_size);
            let me = self.clone();
            let key = key.to_string();
            let upload_id = upload_id.to_string();

            async move {
                debug!("Uploading multi-part chunk");

                let response = me
                    .inner
                    .client
                    .upload_part()
                    .bucket(&me.inner.name)
                    .key(&key)
                    .upload_id(upload_id)
                    .part_number(part_number as i32)
                    .body(aws_sdk_s3::primitives::ByteStream::from(chunk.data))
                    .send()
                    .await
                    .with_context(|_| crate::error::UploadPartSnafu {
                        bucket: me.inner.name.clone(),
                        key: key.clone(),
                        part_number,
                    })?;

                let e_tag = response
                    .e_tag()
                    .expect("BUG: uploaded part missing etag")
                    .to_string();

                debug!(%e_tag, "Uploaded multi-part chunk");

                // Once all of the uploads are done we must provide the information about each part
                // to the CompleteMultipartUpload call, so retain the key bits here
                let completed_part = aws_sdk_s3::types::CompletedPart::builder()
                    .e_tag(e_tag)
                    .part_number(part_number as i32)
                    .build();

                Ok::<_, crate::S3MaskError>((chunk_size, completed_part))
            }
            .instrument(span)
        });

        debug!("Commencing multi-part upload");

        // Poll the part uploads up to a maximum concurrency level to honor the configured max
        // parallel requests.  Parts are read from the chunk stream only as slots free up.
        let mut uploaded_chunks =
            chunk_futs.try_buffer_unordered(self.config().max_concurrent_requests.max(1));

        let mut total_bytes = 0u64;
        let mut completed_parts = Vec::new();

        while let Some((chunk_size, completed_part)) = uploaded_chunks.try_next().await? {
            total_bytes += chunk_size as u64;
            completed_parts.push(completed_part);
        }

        debug!(
            total_parts = completed_parts.len(),
            total_bytes, "All parts uploaded; completing multi-part upload"
        );

        // S3 insists on the parts being listed in order of part number
        completed_parts.sort_unstable_by_key(|part| part.part_number());

        self.inner
            .client
            .complete_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(total_bytes)
    }
}

#[async_trait::async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn list_objects(
        &self,
        prefix: &str,
    ) -> Result<BoxStream<'static, Result<ObjectHandle>>> {
        debug!(bucket = %self.inner.name, prefix, "Listing objects");

        // Use the paginated API to automatically handle dealing with continuation tokens
        let pages = self
            .inner
            .client
            .list_objects_v2()
            .bucket(&self.inner.name)
            .prefix(prefix)
            .into_paginator()
            .send();

        let me = self.clone();
        let prefix = prefix.to_string();

        // The paginator isn't itself a `Stream`, so drive it with `unfold` and then flatten each
        // page into its objects.
        let handles = futures::stream::unfold(pages, |mut pages| async move {
            pages.next().await.map(|page| (page, pages))
        })
        .map(move |page| {
            let page = page.with_context(|_| crate::error::ListObjectsSnafu {
                bucket: me.inner.name.clone(),
                prefix: prefix.clone(),
            })?;

            let bucket: Box<dyn Bucket> = Box::new(me.clone());
            let handles: Vec<Result<ObjectHandle>> = page
                .contents
                .unwrap_or_default()
                .into_iter()
                .filter_map(|object| object.key)
                .map(|key| Ok(ObjectHandle::new(dyn_clone::clone_box(&*bucket), key)))
                .collect();

            Ok(futures::stream::iter(handles))
        })
        .try_flatten();

        Ok(handles.boxed())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata> {
        let metadata = self
            .inner
            .client
            .head_object()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::HeadObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(ObjectMetadata {
            content_type: metadata
                .content_type()
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string(),
            size: metadata.content_length().unwrap_or(0).max(0) as u64,
        })
    }

    async fn read_object(&self, key: &str) -> Result<Box<dyn ChunkRead>> {
        let response = self
            .inner
            .client
            .get_object()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::GetObjectSnafu {
                bucket: self.inner.name.clone(),
                key: key.to_string(),
            })?;

        Ok(Box::new(ObjectReader::new(
            self.inner.name.clone(),
            key,
            response.body.into_async_read(),
        )))
    }

    #[instrument(skip(self, reader), fields(bucket = %self.inner.name))]
    async fn write_object(
        &self,
        key: &str,
        reader: &mut dyn ChunkRead,
        size_hint: Option<u64>,
    ) -> Result<u64> {
        match writers::prepare_upload(reader, self.upload_sizes(size_hint)).await? {
            Upload::Small(data) => self.unipart_object_writer(key, data).await,
            Upload::Multipart(chunks) => self.multipart_object_writer(key, chunks).await,
        }
    }
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.inner.name)
            .field("region", &self.inner.region)
            .field("client", &"<...>")
            .finish()
    }
}

/// Create a new AWS SDK S3 client, using either an explicit region or the default configuration
/// deduced from the environment
async fn make_s3_client(config: &Config, region: impl Into<Option<String>>) -> aws_sdk_s3::Client {
    let region = region.into().or_else(|| config.aws_region.clone());

    let region_provider = if let Some(region) = region {
        RegionProviderChain::first_try(Region::new(region))
    } else {
        // No explicit region; use the environment
        RegionProviderChain::default_provider().or_else("us-east-1")
    };

    let mut loader = aws_config::from_env().region(region_provider);
    if let Some(profile) = &config.aws_profile {
        loader = loader.profile_name(profile);
    }
    let aws_config = loader.load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // S3-compatible services rarely support virtual-host style bucket addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.as_str())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
