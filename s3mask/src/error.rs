use snafu::prelude::*;
use std::path::PathBuf;
use url::Url;

pub type Result<T, E = S3MaskError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum S3MaskError {
    #[snafu(display("The URL '{url}' doesn't correspond to any supported object storage technology.  Supported URL schemes are: s3"))]
    UnsupportedObjectStorage { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the bucket name"))]
    MissingBucket { url: Url },

    #[snafu(display("'{input}' is neither a bucket name nor a valid s3:// URL"))]
    InvalidSourceLocation {
        input: String,
        source: url::ParseError,
    },

    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible {
        bucket: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_bucket::HeadBucketError>,
    },

    #[snafu(display("Error listing objects in S3 bucket '{bucket}' with prefix '{prefix}'"))]
    ListObjects {
        bucket: String,
        prefix: String,
        source:
            aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error>,
    },

    #[snafu(display("Error getting metadata about object '{key}' on S3 bucket '{bucket}'"))]
    HeadObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>,
    },

    #[snafu(display("Error opening object '{key}' on S3 bucket '{bucket}' for reading"))]
    GetObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
    },

    #[snafu(display("The object '{key}' does not exist in bucket '{bucket}'"))]
    ObjectNotFound { bucket: String, key: String },

    #[snafu(display("Error reading contents of object '{key}' in bucket '{bucket}'"))]
    ReadObject {
        bucket: String,
        key: String,
        source: std::io::Error,
    },

    #[snafu(display("Error sending request to create masking context resource '{resource}'"))]
    ContextRequest {
        resource: String,
        source: reqwest::Error,
    },

    #[snafu(display(
        "The masking service refused to create context resource '{resource}' (status {status}): {body}"
    ))]
    ContextCreate {
        resource: String,
        status: u16,
        body: String,
    },

    #[snafu(display(
        "The masking service failed to destroy context resource '{resource}' (status {status}): {body}"
    ))]
    ContextDestroy {
        resource: String,
        status: u16,
        body: String,
    },

    #[snafu(display("Error sending request to destroy masking context resource '{resource}'"))]
    ContextDestroyRequest {
        resource: String,
        source: reqwest::Error,
    },

    #[snafu(display("Error sending object '{key}' to the masking service"))]
    MaskRequest { key: String, source: reqwest::Error },

    #[snafu(display("Masking object '{key}' failed with status {status}:\n\n{body}"))]
    MaskingService {
        key: String,
        status: u16,
        body: String,
    },

    #[snafu(display("Error reading the multipart masking response for object '{key}'"))]
    MaskResponse { key: String, source: multer::Error },

    #[snafu(display(
        "Error creating multi-part upload of object '{key}' in S3 bucket '{bucket}'"
    ))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError,
        >,
    },

    #[snafu(display(
        "Error uploading part {part_number} of object '{key}' to S3 bucket '{bucket}'"
    ))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: usize,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>,
    },

    #[snafu(display(
        "Error completing multi-part upload of object '{key}' to S3 bucket '{bucket}'"
    ))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<
            aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError,
        >,
    },

    #[snafu(display("Error uploading object '{key}' to S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: aws_sdk_s3::error::SdkError<aws_sdk_s3::operation::put_object::PutObjectError>,
    },

    #[snafu(display("Error streaming data into object '{key}'"))]
    WriteObject { key: String, source: std::io::Error },

    #[snafu(display("Error writing results file '{}'", path.display()))]
    WriteResultsFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Invalid configuration: {reason}"))]
    InvalidConfig { reason: String },

    #[snafu(display("The masking job was aborted"))]
    Aborted,

    #[snafu(display("A masking worker task panicked or was cancelled unexpectedly"))]
    WorkerPanicked { source: tokio::task::JoinError },

    #[snafu(display("{failed} object(s) could not be masked; see the log for details"))]
    ObjectsFailed { failed: usize },
}

/// Coarse classification of [`S3MaskError`] values, for callers who need to react differently to
/// failures that happen before the pipeline starts and failures of individual objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The source bucket or prefix couldn't be enumerated
    Enumeration,

    /// The masking context couldn't be established on the masking service
    Setup,

    /// The masking service rejected or failed to process an object
    MaskingService,

    /// An object couldn't be read from the source bucket
    Read,

    /// A masked copy or results report couldn't be written
    Write,

    /// The masking context couldn't be removed from the masking service
    Teardown,

    /// The job was misconfigured or aborted, or some of its objects failed
    Job,
}

impl S3MaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedObjectStorage { .. }
            | Self::MissingBucket { .. }
            | Self::InvalidSourceLocation { .. }
            | Self::BucketInvalidOrNotAccessible { .. }
            | Self::ListObjects { .. } => ErrorKind::Enumeration,

            Self::ContextRequest { .. } | Self::ContextCreate { .. } => ErrorKind::Setup,

            Self::ContextDestroy { .. } | Self::ContextDestroyRequest { .. } => {
                ErrorKind::Teardown
            }

            Self::MaskRequest { .. } | Self::MaskingService { .. } | Self::MaskResponse { .. } => {
                ErrorKind::MaskingService
            }

            Self::HeadObject { .. }
            | Self::GetObject { .. }
            | Self::ObjectNotFound { .. }
            | Self::ReadObject { .. } => ErrorKind::Read,

            Self::CreateMultipartUpload { .. }
            | Self::UploadPart { .. }
            | Self::CompleteMultipartUpload { .. }
            | Self::PutObject { .. }
            | Self::WriteObject { .. }
            | Self::WriteResultsFile { .. } => ErrorKind::Write,

            Self::InvalidConfig { .. }
            | Self::Aborted
            | Self::WorkerPanicked { .. }
            | Self::ObjectsFailed { .. } => ErrorKind::Job,
        }
    }
}
