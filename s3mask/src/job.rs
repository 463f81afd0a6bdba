use crate::context::ContextDefinitions;
use crate::masking::MaskingClient;
use crate::objstore::{url_path_to_key, Bucket, ObjectHandle, ObjectStorageFactory, SourceLocation};
use crate::queue::{self, Producer};
use crate::worker::{self, ResultsTarget, SkipReason, Tally, WorkerShared};
use crate::{Config, Result, S3MaskError};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use snafu::{prelude::*, IntoError};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;

/// Where the objects to mask come from
#[derive(Debug)]
pub enum MaskSource {
    /// All objects in the bucket and prefix identified by a URL like `s3://bucket/prefix/`
    ObjectStorage(Url),

    /// All objects in an already-constructed bucket whose keys start with `prefix`
    Bucket {
        bucket: Box<dyn Bucket>,
        prefix: String,
    },
}

impl MaskSource {
    /// Parse a bare bucket name or an `s3://bucket/prefix` URL
    pub fn parse(input: &str) -> Result<Self> {
        Ok(Self::ObjectStorage(SourceLocation::parse(input)?.url))
    }
}

/// Counts of what happened to the objects a masking job found
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaskSummary {
    /// Objects listed under the source prefix
    pub enumerated: usize,

    /// Objects sent to the masking service and written back out
    pub masked: usize,

    /// Objects that didn't need masking, like directory markers and masked copies
    pub skipped: usize,

    /// Objects that couldn't be masked
    pub failed: usize,
}

impl MaskSummary {
    /// The number of enumerated objects that were dealt with one way or another
    pub fn processed(&self) -> usize {
        self.masked + self.skipped + self.failed
    }
}

impl std::fmt::Display for MaskSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} objects found: {} masked, {} skipped, {} failed",
            self.enumerated, self.masked, self.skipped, self.failed
        )
    }
}

/// A trait which callers can implement to get progress updates as objects are masked.
///
/// Calls come from all of the workers concurrently.
#[allow(unused_variables)]
pub trait MaskProgressCallback: Sync + Send {
    /// An object was passed over without being sent for masking
    fn object_skipped(&self, key: &str, reason: SkipReason) {}

    /// An object is about to be sent to the masking service
    fn object_masking_starting(&self, key: &str, size: u64) {}

    /// One part of the masking response for an object was written in its entirety to
    /// `destination`
    fn object_part_written(&self, key: &str, destination: &str, bytes: u64) {}

    /// An object was masked and all of the outputs written
    fn object_masked(&self, key: &str) {}

    /// Masking an object failed.
    ///
    /// Depending on the failure policy, this either ends the job or the job carries on with the
    /// remaining objects.
    fn object_failed(&self, key: &str, error: &S3MaskError) {}

    /// The job is over, successfully or otherwise, and the masking context has been torn down
    fn job_finished(&self, summary: &MaskSummary) {}
}

/// Configures a masking job and checks that it can run.
#[derive(Debug)]
pub struct MaskJobBuilder {
    config: Config,
    source: MaskSource,
}

impl MaskJobBuilder {
    pub fn new(config: Config, source: MaskSource) -> Self {
        Self { config, source }
    }

    /// Validate the configuration and the source, and produce a job ready to run.
    ///
    /// For object storage sources this confirms the bucket exists and is accessible, so that
    /// problems with the source are reported before anything is set up on the masking service.
    pub async fn build(self) -> Result<MaskJob> {
        validate_config(&self.config)?;

        let (bucket, prefix) = match self.source {
            MaskSource::ObjectStorage(url) => {
                let objstore = ObjectStorageFactory::new(self.config.clone())
                    .from_url(&url)
                    .await?;
                let bucket = objstore.extract_bucket_from_url(&url).await?;
                let prefix = url_path_to_key(url.path()).to_string();

                (bucket, prefix)
            }
            MaskSource::Bucket { bucket, prefix } => (bucket, prefix),
        };

        debug!(bucket = bucket.name(), %prefix, "Masking job source is valid");

        Ok(MaskJob {
            client: MaskingClient::new(&self.config),
            config: self.config,
            bucket,
            prefix,
        })
    }
}

fn validate_config(config: &Config) -> Result<()> {
    ensure!(
        !config.masked_prefix.is_empty(),
        crate::error::InvalidConfigSnafu {
            reason: "the masked prefix can't be empty, or masked copies would overwrite the originals"
        }
    );

    if let Some(ResultsTarget::Bucket { prefix }) = ResultsTarget::from_config(config) {
        ensure!(
            !prefix.is_empty(),
            crate::error::InvalidConfigSnafu {
                reason: "the results prefix can't be empty when results are written to the bucket"
            }
        );
        ensure!(
            prefix != config.masked_prefix,
            crate::error::InvalidConfigSnafu {
                reason: "the results prefix and the masked prefix must be different"
            }
        );
    }

    Ok(())
}

/// A masking job ready to run
#[derive(Debug)]
pub struct MaskJob {
    config: Config,
    client: MaskingClient,
    bucket: Box<dyn Bucket>,
    prefix: String,
}

impl MaskJob {
    /// Alternative to [`Self::run`] which doesn't require a [`MaskProgressCallback`]
    /// implementation, for callers that do not care about progress information.
    pub async fn run_without_progress(self, abort: impl Future<Output = ()>) -> Result<MaskSummary> {
        struct NoProgress {}
        impl MaskProgressCallback for NoProgress {}

        self.run(abort, NoProgress {}).await
    }

    /// Run the job, returning only when every object has been processed (or the job failed).
    ///
    /// The masking context is set up on the masking service before any object is masked, and torn
    /// down again whatever happens after that.
    ///
    /// If the `abort` future is completed, it's a signal that the job should be aborted.  Objects
    /// being masked are abandoned and queued objects are dropped, then after teardown this method
    /// returns an abort error.
    pub async fn run<Abort, Progress>(self, abort: Abort, progress: Progress) -> Result<MaskSummary>
    where
        Abort: Future<Output = ()>,
        Progress: MaskProgressCallback + 'static,
    {
        let progress: Arc<dyn MaskProgressCallback> = Arc::new(progress);

        // Start listing before setup, so an invalid prefix fails the job before there's anything
        // to tear down.
        let mut listing = self.bucket.list_objects(&self.prefix).await?;
        let first = listing.try_next().await?;

        info!(bucket = self.bucket.name(), prefix = %self.prefix, "Setting up masking context");
        let context = ContextDefinitions::from_config(&self.config)
            .establish(&self.client)
            .await?;

        let tally = Arc::new(Tally::default());
        let shared = Arc::new(WorkerShared {
            config: self.config.clone(),
            bucket: self.bucket,
            client: self.client,
            request_context: context.request_context().to_string(),
            results: ResultsTarget::from_config(&self.config),
            progress: progress.clone(),
            tally: tally.clone(),
            results_keys: Default::default(),
        });

        let result = run_pipeline(&self.config, shared, first, listing, abort).await;

        info!("Tearing down masking context");
        context.teardown().await;

        let summary = tally.summary();
        progress.job_finished(&summary);

        match result {
            Ok(()) if tally.failed() > 0 => {
                error!(%summary, "Masking job finished with failed objects");
                crate::error::ObjectsFailedSnafu {
                    failed: tally.failed(),
                }
                .fail()
            }
            Ok(()) => {
                info!(%summary, "Masking job finished");
                Ok(summary)
            }
            Err(e) => {
                error!(%summary, err = ?e, "Masking job failed");
                Err(e)
            }
        }
    }
}

/// Run the producer and the workers until the queue drains, a task fails, or the job is aborted.
async fn run_pipeline(
    config: &Config,
    shared: Arc<WorkerShared>,
    first: Option<ObjectHandle>,
    listing: BoxStream<'static, Result<ObjectHandle>>,
    abort: impl Future<Output = ()>,
) -> Result<()> {
    let worker_count = config.worker_count();
    let (producer, consumer) = queue::work_queue(worker_count);

    let mut tasks = JoinSet::new();

    for worker_id in 0..worker_count {
        tasks.spawn(
            worker::run_worker(shared.clone(), consumer.clone())
                .instrument(info_span!("worker", worker_id)),
        );
    }

    tasks.spawn(
        enqueue_objects(first, listing, producer, shared.tally.clone())
            .instrument(info_span!("producer")),
    );

    info!(worker_count, "Masking pipeline started");

    let drained = consumer.drained();
    tokio::pin!(drained);
    tokio::pin!(abort);

    let mut result = loop {
        tokio::select! {
            _ = &mut drained => {
                debug!("Every object has been processed");
                break Ok(());
            }
            _ = &mut abort => {
                warn!("Masking job aborted");
                break crate::error::AbortedSnafu.fail();
            }
            joined = tasks.join_next() => match joined {
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => break Err(e),
                Some(Err(e)) => break Err(crate::error::WorkerPanickedSnafu.into_error(e)),
                None => break Ok(()),
            },
        }
    };

    // Whatever stopped the pipeline, stop the remaining tasks.  A task that already failed before
    // it could be cancelled still fails the job.
    tasks.abort_all();
    while let Some(joined) = tasks.join_next().await {
        let task_result = match joined {
            Ok(task_result) => task_result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(crate::error::WorkerPanickedSnafu.into_error(e)),
        };

        if let (true, Err(e)) = (result.is_ok(), task_result) {
            result = Err(e);
        }
    }

    result
}

/// List every object under the prefix onto the work queue, then close it.
async fn enqueue_objects(
    first: Option<ObjectHandle>,
    listing: BoxStream<'static, Result<ObjectHandle>>,
    producer: Producer<ObjectHandle>,
    tally: Arc<Tally>,
) -> Result<()> {
    let mut objects = futures::stream::iter(first.map(Ok)).chain(listing);

    while let Some(object) = objects.try_next().await? {
        debug!(key = object.key(), "Enqueuing object");
        tally.object_enumerated();

        if producer.put(object).await.is_err() {
            debug!("Work queue consumers are gone; stopping enumeration");
            return Ok(());
        }
    }

    debug!("Every object has been enumerated");
    producer.close();

    Ok(())
}
