//! HTTP client for the masking service.
//!
//! Every endpoint lives under the configured base URL:
//!
//! - `<resource>.create` and `<resource>.destroy` manage the named context resources the service
//!   uses to decide what to search for and how to mask it.
//! - `files/fileSearchContext.mask` masks one file.  The request is a multipart form with a
//!   `context` field naming the file contexts to apply, and a `file` field with the file contents.
//!   The response is a multipart body with a `file` part holding the masked contents, and
//!   optionally a `results` part with a JSON report of what was found.
//!
//! Object contents are streamed into the request and the response parts are streamed out, so the
//! size of the objects being masked has no effect on memory use.
use crate::chunks::{self, ChunkRead, FieldReader};
use crate::{Config, Result};
use reqwest::header::CONTENT_TYPE;
use snafu::prelude::*;
use tracing::{debug, instrument, warn};
use url::Url;

const MASK_ENDPOINT: &str = "files/fileSearchContext.mask";

/// Client for the masking service API.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone, Debug)]
pub(crate) struct MaskingClient {
    client: reqwest::Client,
    base_url: Url,
    chunk_size: usize,
}

impl MaskingClient {
    pub(crate) fn new(config: &Config) -> Self {
        // Without a trailing slash, `Url::join` would replace the last path segment instead of
        // appending to it.
        let mut base_url = config.masking_url.clone();
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        Self {
            client: reqwest::Client::new(),
            base_url,
            chunk_size: config.chunk_size_bytes(),
        }
    }

    fn endpoint(&self, path: &str) -> Url {
        self.base_url
            .join(path)
            .expect("BUG: endpoint paths are always valid relative URLs")
    }

    /// Create the context resource `resource` from its JSON definition.
    #[instrument(skip(self, definition))]
    pub(crate) async fn create_context(
        &self,
        resource: &str,
        definition: &serde_json::Value,
    ) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(&format!("{resource}.create")))
            .json(definition)
            .send()
            .await
            .with_context(|_| crate::error::ContextRequestSnafu { resource })?;

        let status = response.status();
        if !status.is_success() {
            return crate::error::ContextCreateSnafu {
                resource,
                status: status.as_u16(),
                body: error_body(response).await,
            }
            .fail();
        }

        debug!(%status, "Created context resource");

        Ok(())
    }

    /// Destroy the context resource `resource` named `name`.
    #[instrument(skip(self))]
    pub(crate) async fn destroy_context(&self, resource: &str, name: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(&format!("{resource}.destroy")))
            .json(&serde_json::json!({ "name": name }))
            .send()
            .await
            .with_context(|_| crate::error::ContextDestroyRequestSnafu { resource })?;

        let status = response.status();
        if !status.is_success() {
            return crate::error::ContextDestroySnafu {
                resource,
                status: status.as_u16(),
                body: error_body(response).await,
            }
            .fail();
        }

        debug!(%status, "Destroyed context resource");

        Ok(())
    }

    /// Send the contents of object `key` to be masked.
    ///
    /// `context` is the JSON document naming the file contexts to apply.  The contents are read
    /// from `contents` as the request is sent.  If the service responds with an error status, the
    /// error carries the status and the response body.
    #[instrument(skip(self, context, contents))]
    pub(crate) async fn mask(
        &self,
        context: &str,
        key: &str,
        content_type: &str,
        contents: Box<dyn ChunkRead>,
    ) -> Result<MaskResponse> {
        let context_part = reqwest::multipart::Part::text(context.to_string())
            .file_name("context")
            .mime_str("application/json")
            .with_context(|_| crate::error::MaskRequestSnafu { key })?;

        let body = reqwest::Body::wrap_stream(chunks::into_stream(contents, self.chunk_size));
        let file_part = reqwest::multipart::Part::stream(body)
            .file_name(key.to_string())
            .mime_str(request_content_type(content_type))
            .with_context(|_| crate::error::MaskRequestSnafu { key })?;

        let form = reqwest::multipart::Form::new()
            .part("context", context_part)
            .part("file", file_part);

        let response = self
            .client
            .post(self.endpoint(MASK_ENDPOINT))
            .multipart(form)
            .send()
            .await
            .with_context(|_| crate::error::MaskRequestSnafu { key })?;

        let status = response.status();
        if !status.is_success() {
            return crate::error::MaskingServiceSnafu {
                key,
                status: status.as_u16(),
                body: error_body(response).await,
            }
            .fail();
        }

        let response_content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let boundary = multer::parse_boundary(response_content_type)
            .with_context(|_| crate::error::MaskResponseSnafu { key })?;

        debug!(%status, "Masking service accepted the object");

        Ok(MaskResponse {
            key: key.to_string(),
            multipart: multer::Multipart::new(response.bytes_stream(), boundary),
        })
    }
}

/// The content type to declare for an object's contents in the mask request.
///
/// Objects can carry content types that aren't valid MIME types.  Those are sent as
/// `application/octet-stream` rather than failing the request.
fn request_content_type(content_type: &str) -> &str {
    if reqwest::multipart::Part::bytes(Vec::new())
        .mime_str(content_type)
        .is_ok()
    {
        content_type
    } else {
        warn!(
            content_type,
            "Object content type is not a valid MIME type; sending it as {}",
            crate::objstore::DEFAULT_CONTENT_TYPE
        );
        crate::objstore::DEFAULT_CONTENT_TYPE
    }
}

/// Read an error response body for inclusion in an error message
async fn error_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|e| format!("<error reading response body: {e}>"))
}

/// The named parts of a masking response that s3mask knows what to do with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PartKind {
    /// The masked contents of the file
    File,

    /// The JSON report of what was found in the file
    Results,
}

/// One recognized part of a masking response.
pub(crate) struct ResponsePart {
    pub kind: PartKind,
    pub contents: FieldReader,
}

/// A successful masking response, whose parts are read one at a time as they arrive.
pub(crate) struct MaskResponse {
    key: String,
    multipart: multer::Multipart<'static>,
}

impl MaskResponse {
    /// Get the next recognized part of the response, in the order the service sent them.
    ///
    /// Parts with names other than `file` and `results` are skipped.  The previous part must be
    /// dropped before this is called again.
    pub(crate) async fn next_part(&mut self) -> Result<Option<ResponsePart>> {
        loop {
            let Some(field) = self
                .multipart
                .next_field()
                .await
                .with_context(|_| crate::error::MaskResponseSnafu {
                    key: self.key.clone(),
                })?
            else {
                return Ok(None);
            };

            let kind = match field.name() {
                Some("file") => PartKind::File,
                Some("results") => PartKind::Results,
                other => {
                    debug!(key = %self.key, part = ?other, "Ignoring unrecognized response part");
                    continue;
                }
            };

            return Ok(Some(ResponsePart {
                kind,
                contents: FieldReader::new(self.key.clone(), field),
            }));
        }
    }
}
