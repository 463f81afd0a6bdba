use std::path::PathBuf;
use url::Url;

/// What a masking job does when processing of a single object fails.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum FailurePolicy {
    /// The first failed object stops the whole job.
    ///
    /// All other workers are cancelled immediately, and the error from the failed object is the
    /// result of the job.
    #[default]
    FailFast,

    /// Failed objects are logged and counted, and the job carries on with the remaining objects.
    ///
    /// When all objects have been processed the job fails with a summary error if any objects
    /// failed.
    Continue,
}

/// The configuration settings that control the behavior of a masking job.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  If this is set, the AWS region
    /// is ignored.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The name of the AWS profile to use for the connection (otherwise the default is used).
    #[cfg_attr(
        feature = "clap",
        clap(short = 'p', long = "profile", global = true, value_name = "NAME")
    )]
    pub aws_profile: Option<String>,

    /// The AWS region to use.  If not set, the region is taken from the environment.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "REGION"))]
    pub aws_region: Option<String>,

    /// Base URL of the masking service API.
    ///
    /// Context management and masking endpoints are resolved relative to this URL.
    #[cfg_attr(
        feature = "clap",
        clap(
            long,
            default_value = "http://localhost:8080/api/darkshield",
            global = true,
            value_name = "URL"
        )
    )]
    pub masking_url: Url,

    /// The number of objects that are masked concurrently.
    ///
    /// This is also the depth of the queue of objects waiting to be masked, so it bounds how far
    /// the listing of the bucket can run ahead of the masking.
    #[cfg_attr(
        feature = "clap",
        clap(short = 'w', long, default_value = "4", global = true, value_name = "N")
    )]
    pub workers: usize,

    /// The size of the chunks in which object contents are streamed to the masking service and
    /// masking results are streamed back out.
    ///
    /// Can be specified as an integer, ie "8192", or with a suffix ie "64KiB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "8KiB", global = true))]
    pub chunk_size: byte_unit::Byte,

    /// The size threshold s3mask uses for multipart uploads of masked objects.
    ///
    /// If a masked object is this size or larger, then it will be uploaded in chunks of
    /// `multipart_chunk_size` bytes each.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB"
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_threshold: byte_unit::Byte,

    /// The chunk size that s3mask uses for multipart uploads of masked objects.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_chunk_size: byte_unit::Byte,

    /// The maximum number of concurrent part uploads for a single masked object.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub max_concurrent_requests: usize,

    /// Don't ask the masking service for a results report, and don't write any results.
    #[cfg_attr(feature = "clap", clap(long = "no-results", global = true))]
    pub disable_results: bool,

    /// Key prefix under which the masked copy of each object is written.
    ///
    /// Objects whose keys already start with this prefix are never masked again.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "masked/", global = true, value_name = "PREFIX")
    )]
    pub masked_prefix: String,

    /// Key prefix under which the results report for each object is written.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "results/", global = true, value_name = "PREFIX")
    )]
    pub results_prefix: String,

    /// Write results reports to this local directory instead of to the bucket.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "DIR"))]
    pub results_dir: Option<PathBuf>,

    /// What to do when masking one of the objects fails.
    #[cfg_attr(
        feature = "clap",
        clap(long, value_enum, default_value = "fail-fast", global = true)
    )]
    pub failure_policy: FailurePolicy,

    /// The pattern that the search context installed on the masking service looks for.
    #[cfg_attr(
        feature = "clap",
        clap(long, default_value = "test", global = true, value_name = "PATTERN")
    )]
    pub search_pattern: String,

    /// Limit the size of the text buffer the masking service uses for each file, for
    /// memory-constrained environments.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "N"))]
    pub buffer_limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: This is duplicated here and in the `clap` attributes, since the lib crate only takes
        // a clap dependency when the `clap` feature is enabled
        Self {
            s3_endpoint: None,
            aws_profile: None,
            aws_region: None,
            masking_url: "http://localhost:8080/api/darkshield"
                .parse()
                .expect("BUG: default masking URL is valid"),
            workers: 4,
            chunk_size: byte_unit::Byte::from_bytes(8 * 1024),
            multipart_threshold: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            multipart_chunk_size: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            max_concurrent_requests: 10,
            disable_results: false,
            masked_prefix: "masked/".to_string(),
            results_prefix: "results/".to_string(),
            results_dir: None,
            failure_policy: FailurePolicy::FailFast,
            search_pattern: "test".to_string(),
            buffer_limit: None,
        }
    }
}

impl Config {
    /// The streaming chunk size in bytes, never less than one byte
    pub(crate) fn chunk_size_bytes(&self) -> usize {
        (self.chunk_size.get_bytes() as usize).max(1)
    }

    /// The number of workers, never less than one
    pub(crate) fn worker_count(&self) -> usize {
        self.workers.max(1)
    }
}
