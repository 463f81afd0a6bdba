//! Test helper that implements [`s3mask::MaskProgressCallback`] which keeps a record of every
//! progress update in order so we can write tests that verify progress reporting.
use s3mask::{MaskProgressCallback, MaskSummary, S3MaskError, SkipReason};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq)]
#[allow(dead_code)] // Not every field is checked by tests but all of them are captured
pub(crate) enum MaskProgressEvent {
    ObjectSkipped { key: String, reason: SkipReason },
    ObjectMaskingStarting { key: String, size: u64 },
    ObjectPartWritten {
        key: String,
        destination: String,
        bytes: u64,
    },
    ObjectMasked { key: String },
    ObjectFailed { key: String, error: String },
    JobFinished { summary: MaskSummary },
}

#[derive(Clone, Default)]
pub(crate) struct TestMaskProgressCallback {
    events: Arc<Mutex<Vec<MaskProgressEvent>>>,
}

impl TestMaskProgressCallback {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: MaskProgressEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<MaskProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Keys of the objects reported masked, sorted since workers finish in any order
    pub fn masked_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .events()
            .into_iter()
            .filter_map(|event| match event {
                MaskProgressEvent::ObjectMasked { key } => Some(key),
                _ => None,
            })
            .collect();
        keys.sort();

        keys
    }

    pub fn skipped(&self) -> Vec<(String, SkipReason)> {
        let mut skipped: Vec<_> = self
            .events()
            .into_iter()
            .filter_map(|event| match event {
                MaskProgressEvent::ObjectSkipped { key, reason } => Some((key, reason)),
                _ => None,
            })
            .collect();
        skipped.sort_by(|a, b| a.0.cmp(&b.0));

        skipped
    }

    pub fn failed_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .events()
            .into_iter()
            .filter_map(|event| match event {
                MaskProgressEvent::ObjectFailed { key, .. } => Some(key),
                _ => None,
            })
            .collect();
        keys.sort();

        keys
    }

    /// Destinations written for `key`, in the order they were written
    pub fn destinations_of(&self, key: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MaskProgressEvent::ObjectPartWritten {
                    key: written,
                    destination,
                    ..
                } if written == key => Some(destination),
                _ => None,
            })
            .collect()
    }

    /// The summary reported when the job finished.  Panics unless the job reported finishing
    /// exactly once, as the very last event.
    pub fn finished_summary(&self) -> MaskSummary {
        let events = self.events();
        let finished: Vec<_> = events
            .iter()
            .enumerate()
            .filter_map(|(index, event)| match event {
                MaskProgressEvent::JobFinished { summary } => Some((index, *summary)),
                _ => None,
            })
            .collect();

        assert_eq!(1, finished.len(), "job_finished reported {} times", finished.len());
        assert_eq!(events.len() - 1, finished[0].0, "job_finished wasn't the last event");

        finished[0].1
    }
}

impl MaskProgressCallback for TestMaskProgressCallback {
    fn object_skipped(&self, key: &str, reason: SkipReason) {
        self.push(MaskProgressEvent::ObjectSkipped {
            key: key.to_string(),
            reason,
        });
    }

    fn object_masking_starting(&self, key: &str, size: u64) {
        self.push(MaskProgressEvent::ObjectMaskingStarting {
            key: key.to_string(),
            size,
        });
    }

    fn object_part_written(&self, key: &str, destination: &str, bytes: u64) {
        self.push(MaskProgressEvent::ObjectPartWritten {
            key: key.to_string(),
            destination: destination.to_string(),
            bytes,
        });
    }

    fn object_masked(&self, key: &str) {
        self.push(MaskProgressEvent::ObjectMasked {
            key: key.to_string(),
        });
    }

    fn object_failed(&self, key: &str, error: &S3MaskError) {
        self.push(MaskProgressEvent::ObjectFailed {
            key: key.to_string(),
            error: error.to_string(),
        });
    }

    fn job_finished(&self, summary: &MaskSummary) {
        self.push(MaskProgressEvent::JobFinished { summary: *summary });
    }
}
