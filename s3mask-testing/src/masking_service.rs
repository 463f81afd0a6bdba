//! A fake masking service, for testing masking jobs without the real thing.
//!
//! The service is an HTTP mock server which answers context management requests and mask
//! requests with canned responses, and counts how many of each it received.
use httpmock::prelude::*;
use httpmock::Mock;
use url::Url;

/// Path on the mock server under which the masking API lives
pub const API_PATH: &str = "/api/darkshield";

/// The context resources a masking job creates, in the order it creates them
pub const CONTEXT_RESOURCES: [&str; 4] = [
    "searchContext",
    "maskContext",
    "files/fileSearchContext",
    "files/fileMaskContext",
];

const MASK_PATH: &str = "/api/darkshield/files/fileSearchContext.mask";

const BOUNDARY: &str = "s3mask-fake-masking-service-boundary";

/// A `multipart/form-data` response body, built one part at a time
#[derive(Clone, Debug, Default)]
pub struct MultipartResponse {
    body: Vec<u8>,
}

impl MultipartResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a part named `name`.  Parts appear in the body in the order they're added.
    pub fn part(mut self, name: &str, content_type: &str, data: impl AsRef<[u8]>) -> Self {
        self.body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{name}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        self.body.extend_from_slice(data.as_ref());
        self.body.extend_from_slice(b"\r\n");

        self
    }

    /// The `Content-Type` header value to send with this body
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    /// The complete body, including the closing boundary
    pub fn body(&self) -> Vec<u8> {
        let mut body = self.body.clone();
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        body
    }
}

/// Mocks for the create and destroy endpoints of every context resource
pub struct ContextMocks<'a> {
    creates: Vec<(&'static str, Mock<'a>)>,
    destroys: Vec<(&'static str, Mock<'a>)>,
}

impl<'a> ContextMocks<'a> {
    /// How many times `resource` was created
    pub async fn created(&self, resource: &str) -> usize {
        hits_of(&self.creates, resource).await
    }

    /// How many times `resource` was destroyed
    pub async fn destroyed(&self, resource: &str) -> usize {
        hits_of(&self.destroys, resource).await
    }

    pub async fn total_created(&self) -> usize {
        total_hits(&self.creates).await
    }

    pub async fn total_destroyed(&self) -> usize {
        total_hits(&self.destroys).await
    }
}

async fn hits_of(mocks: &[(&'static str, Mock<'_>)], resource: &str) -> usize {
    match mocks.iter().find(|(name, _)| *name == resource) {
        Some((_, mock)) => mock.hits_async().await,
        None => panic!("'{resource}' isn't a context resource"),
    }
}

async fn total_hits(mocks: &[(&'static str, Mock<'_>)]) -> usize {
    let mut total = 0;
    for (_, mock) in mocks {
        total += mock.hits_async().await;
    }

    total
}

/// A mock masking service listening on a local port
pub struct FakeMaskingService {
    server: MockServer,
}

impl FakeMaskingService {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start_async().await,
        }
    }

    /// The URL to configure as the masking service base URL
    pub fn base_url(&self) -> Url {
        self.server
            .url(API_PATH)
            .parse()
            .expect("BUG: mock server URL is valid")
    }

    /// Accept every context create and destroy request
    pub async fn mock_contexts(&self) -> ContextMocks<'_> {
        self.mock_contexts_failing_at(None).await
    }

    /// Accept every context request, except that creating `failing_resource` fails with a 500.
    pub async fn mock_contexts_failing_at(
        &self,
        failing_resource: Option<&str>,
    ) -> ContextMocks<'_> {
        let mut creates = Vec::new();
        let mut destroys = Vec::new();

        for resource in CONTEXT_RESOURCES {
            let create_status = if Some(resource) == failing_resource {
                500
            } else {
                200
            };

            let create = self
                .server
                .mock_async(|when, then| {
                    when.method(POST)
                        .path(format!("{API_PATH}/{resource}.create"));
                    then.status(create_status);
                })
                .await;
            let destroy = self
                .server
                .mock_async(|when, then| {
                    when.method(POST)
                        .path(format!("{API_PATH}/{resource}.destroy"));
                    then.status(200);
                })
                .await;

            creates.push((resource, create));
            destroys.push((resource, destroy));
        }

        ContextMocks { creates, destroys }
    }

    /// Answer every mask request with `response`
    pub async fn mock_mask(&self, response: &MultipartResponse) -> Mock<'_> {
        let content_type = response.content_type();
        let body = response.body();

        self.server
            .mock_async(|when, then| {
                when.method(POST).path(MASK_PATH);
                then.status(200)
                    .header("content-type", content_type)
                    .body(body);
            })
            .await
    }

    /// Fail every mask request with `status` and `body`
    pub async fn mock_mask_failure(&self, status: u16, body: &str) -> Mock<'_> {
        self.server
            .mock_async(|when, then| {
                when.method(POST).path(MASK_PATH);
                then.status(status).body(body);
            })
            .await
    }
}
