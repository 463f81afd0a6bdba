//! The masking workers.
//!
//! Each worker takes one object at a time off the work queue, sends it to the masking service, and
//! writes the parts of the response where they belong: the masked contents next to the original
//! under the masked prefix, and the results report under the results prefix (or into a local
//! directory).  Every object taken off the queue is marked done exactly once, whatever happens to
//! it.
use crate::chunks::copy_chunks;
use crate::job::MaskProgressCallback;
use crate::masking::{MaskingClient, PartKind};
use crate::objstore::{Bucket, ObjectHandle, ObjectMetadata};
use crate::queue::Consumer;
use crate::{Config, FailurePolicy, MaskSummary, Result};
use snafu::prelude::*;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info_span, warn, Instrument};

/// Why an object was passed over without being masked
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The object is a placeholder for a directory, not a file
    DirectoryMarker,

    /// The object is itself the masked copy of another object
    AlreadyMasked,

    /// The object is the results report for another object
    ResultsReport,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::DirectoryMarker => "directory marker",
            Self::AlreadyMasked => "already masked",
            Self::ResultsReport => "results report",
        };

        f.write_str(reason)
    }
}

/// Where results reports are written
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ResultsTarget {
    /// Into the source bucket, under this key prefix
    Bucket { prefix: String },

    /// Into this local directory
    Directory(PathBuf),
}

impl ResultsTarget {
    /// Where the config says results should go, or `None` if results are disabled
    pub(crate) fn from_config(config: &Config) -> Option<Self> {
        if config.disable_results {
            None
        } else if let Some(dir) = &config.results_dir {
            Some(Self::Directory(dir.clone()))
        } else {
            Some(Self::Bucket {
                prefix: config.results_prefix.clone(),
            })
        }
    }
}

/// Decide whether an object should be skipped instead of masked.
pub(crate) fn skip_reason(
    key: &str,
    metadata: &ObjectMetadata,
    config: &Config,
    results: Option<&ResultsTarget>,
) -> Option<SkipReason> {
    if metadata.content_type.starts_with("application/x-directory") || key.ends_with('/') {
        Some(SkipReason::DirectoryMarker)
    } else if key.starts_with(&config.masked_prefix) {
        Some(SkipReason::AlreadyMasked)
    } else if matches!(results, Some(ResultsTarget::Bucket { prefix }) if !prefix.is_empty() && key.starts_with(prefix.as_str()))
    {
        Some(SkipReason::ResultsReport)
    } else {
        None
    }
}

/// The key (relative to the results prefix or directory) of the results report for `key`.
///
/// This is `key` with the extension of its last path segment replaced by `.json`.
pub(crate) fn results_key(key: &str) -> String {
    let name_start = key.rfind('/').map(|slash| slash + 1).unwrap_or(0);
    let name = &key[name_start..];

    let stem = match name.rfind('.') {
        Some(dot) if dot > 0 => &name[..dot],
        _ => name,
    };

    format!("{}{}.json", &key[..name_start], stem)
}

/// Results keys to try for `key`, most preferred first.
///
/// The extension-replaced name comes first, then the full key with `.json` appended, then
/// numbered names, so there's always an unused one.
fn results_key_candidates(key: &str) -> impl Iterator<Item = String> + '_ {
    [results_key(key), format!("{key}.json")]
        .into_iter()
        .chain((1..).map(move |n| format!("{key}.{n}.json")))
}

/// The local path of the results report with results key `results_key` under `dir`.
///
/// Object keys can contain anything, so only the plain path components are used; a key can never
/// name a path outside of `dir`.
pub(crate) fn local_results_path(dir: &Path, results_key: &str) -> PathBuf {
    let mut path = dir.to_path_buf();
    path.extend(
        Path::new(results_key)
            .components()
            .filter_map(|component| match component {
                Component::Normal(name) => Some(name),
                _ => None,
            }),
    );

    path
}

/// The results destinations already handed out in this job.
///
/// Different objects can map to the same results key (`a.txt` and `a.csv` are both `a.json`),
/// and one report must never overwrite another.
#[derive(Debug, Default)]
pub(crate) struct ResultsKeys {
    claimed: Mutex<HashSet<String>>,
}

impl ResultsKeys {
    /// Claim a results key for object `key` that no other object in this job has been given.
    ///
    /// `destination` maps a candidate results key to where it would actually be written; two
    /// candidates collide if their destinations are equal.
    pub(crate) fn claim(&self, key: &str, destination: impl Fn(&str) -> String) -> String {
        let mut claimed = self
            .claimed
            .lock()
            .expect("BUG: results keys mutex poisoned");

        let preferred = results_key(key);
        let candidate = results_key_candidates(key)
            .find(|candidate| claimed.insert(destination(candidate)))
            .expect("BUG: numbered results keys never run out");

        if candidate != preferred {
            warn!(%preferred, results_key = %candidate,
                "Another object's results report already uses the usual results key; using a longer one");
        }

        candidate
    }
}

/// Object counts shared by the producer and all workers
#[derive(Debug, Default)]
pub(crate) struct Tally {
    enumerated: AtomicUsize,
    masked: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
}

impl Tally {
    pub(crate) fn object_enumerated(&self) {
        self.enumerated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn summary(&self) -> MaskSummary {
        MaskSummary {
            enumerated: self.enumerated.load(Ordering::Relaxed),
            masked: self.masked.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Everything the workers share
pub(crate) struct WorkerShared {
    pub config: Config,
    pub bucket: Box<dyn Bucket>,
    pub client: MaskingClient,
    pub request_context: String,
    pub results: Option<ResultsTarget>,
    pub progress: Arc<dyn MaskProgressCallback>,
    pub tally: Arc<Tally>,
    pub results_keys: ResultsKeys,
}

enum Outcome {
    Masked,
    Skipped(SkipReason),
}

/// Process objects from `queue` until it's empty and closed.
///
/// Under [`FailurePolicy::FailFast`], the first object that fails ends the worker with that
/// object's error.  Otherwise failures are logged and counted and the worker carries on.
pub(crate) async fn run_worker(
    shared: Arc<WorkerShared>,
    queue: Consumer<ObjectHandle>,
) -> Result<()> {
    while let Some(object) = queue.get().await {
        let span = info_span!("mask object", key = object.key());
        let result = process_object(&shared, &object).instrument(span).await;

        // The outcome has to be counted before the item is marked done, because the job stops
        // the workers as soon as the queue is drained.
        let fatal = match result {
            Ok(Outcome::Masked) => {
                shared.tally.masked.fetch_add(1, Ordering::Relaxed);
                shared.progress.object_masked(object.key());
                None
            }
            Ok(Outcome::Skipped(reason)) => {
                shared.tally.skipped.fetch_add(1, Ordering::Relaxed);
                shared.progress.object_skipped(object.key(), reason);
                None
            }
            Err(e) => {
                shared.tally.failed.fetch_add(1, Ordering::Relaxed);
                error!(key = object.key(), err = ?e, "Masking object failed");
                shared.progress.object_failed(object.key(), &e);

                (shared.config.failure_policy == FailurePolicy::FailFast).then_some(e)
            }
        };

        queue.task_done();

        if let Some(e) = fatal {
            return Err(e);
        }
    }

    debug!("Work queue closed; worker exiting");

    Ok(())
}

async fn process_object(shared: &WorkerShared, object: &ObjectHandle) -> Result<Outcome> {
    let key = object.key();
    let metadata = object.metadata().await?;

    if let Some(reason) = skip_reason(key, metadata, &shared.config, shared.results.as_ref()) {
        debug!(%reason, "Skipping object");
        return Ok(Outcome::Skipped(reason));
    }

    shared.progress.object_masking_starting(key, metadata.size);
    debug!(size = metadata.size, content_type = %metadata.content_type, "Masking object");

    let contents = object.open().await?;
    let mut response = shared
        .client
        .mask(
            &shared.request_context,
            key,
            &metadata.content_type,
            contents,
        )
        .await?;

    let mut wrote_masked_copy = false;

    while let Some(mut part) = response.next_part().await? {
        match part.kind {
            PartKind::File => {
                let destination = format!("{}{}", shared.config.masked_prefix, key);
                let bytes = shared
                    .bucket
                    .write_object(&destination, &mut part.contents, Some(metadata.size))
                    .await?;

                debug!(%destination, bytes, "Wrote masked copy");
                shared.progress.object_part_written(key, &destination, bytes);
                wrote_masked_copy = true;
            }
            PartKind::Results => match &shared.results {
                None => {
                    debug!("Results are disabled; discarding results part");
                }
                Some(ResultsTarget::Bucket { prefix }) => {
                    let report_key = shared
                        .results_keys
                        .claim(key, |candidate| format!("{prefix}{candidate}"));
                    let destination = format!("{prefix}{report_key}");
                    let bytes = shared
                        .bucket
                        .write_object(&destination, &mut part.contents, None)
                        .await?;

                    debug!(%destination, bytes, "Wrote results report");
                    shared.progress.object_part_written(key, &destination, bytes);
                }
                Some(ResultsTarget::Directory(dir)) => {
                    let report_key = shared.results_keys.claim(key, |candidate| {
                        local_results_path(dir, candidate)
                            .to_string_lossy()
                            .into_owned()
                    });
                    let path = local_results_path(dir, &report_key);
                    let bytes = write_results_file(&path, &mut part.contents, &shared.config).await?;

                    let destination = path.display().to_string();
                    debug!(%destination, bytes, "Wrote results report");
                    shared.progress.object_part_written(key, &destination, bytes);
                }
            },
        }
    }

    if !wrote_masked_copy {
        warn!("The masking service response had no masked file; nothing was written for this object");
    }

    Ok(Outcome::Masked)
}

async fn write_results_file(
    path: &Path,
    contents: &mut dyn crate::chunks::ChunkRead,
    config: &Config,
) -> Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|_| crate::error::WriteResultsFileSnafu { path })?;
    }

    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|_| crate::error::WriteResultsFileSnafu { path })?;

    copy_chunks(
        contents,
        config.chunk_size_bytes(),
        &mut file,
        &path.display().to_string(),
    )
    .await
}
