//! Mask the contents of every object under an S3 prefix by streaming them through a masking
//! service.
//!
//! Objects are listed lazily onto a bounded work queue and handed to a fixed number of workers.
//! Each worker streams one object at a time to the masking service, and streams the masked copy
//! back into the bucket under a separate prefix, along with (optionally) a JSON report of what
//! was found.  No object is ever held in memory in its entirety.
//!
//! Before any object is masked, the search and mask contexts the service needs are created, and
//! after the last object is done (or the job fails, or is aborted) they are destroyed again.
//!
//! ```no_run
//! # async fn example() -> s3mask::Result<()> {
//! use s3mask::{Config, MaskJobBuilder, MaskSource};
//!
//! let job = MaskJobBuilder::new(Config::default(), MaskSource::parse("s3://my-bucket/data/")?)
//!     .build()
//!     .await?;
//!
//! let summary = job.run_without_progress(futures::future::pending()).await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

mod chunks;
mod config;
mod context;
mod error;
mod job;
mod masking;
mod objstore;
mod queue;
mod worker;
mod writers;

pub use chunks::ChunkRead;
pub use config::{Config, FailurePolicy};
pub use error::{ErrorKind, Result, S3MaskError};
pub use job::*;
pub use objstore::{
    Bucket, MemoryBucket, ObjectHandle, ObjectMetadata, SourceLocation, DEFAULT_CONTENT_TYPE,
};
pub use worker::SkipReason;
