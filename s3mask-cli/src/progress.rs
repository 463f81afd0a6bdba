//! Progress reporting that renders a spinner while objects are masked
use s3mask::{MaskJob, MaskProgressCallback, MaskSummary, Result, S3MaskError, SkipReason};
use std::{borrow::Cow, future::Future, time::Duration};

const TICK_STRINGS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Display a spinner while some long-running but unmeasurable task is running, then hide the
/// spinner when it finishes
pub(crate) async fn with_spinner<S, F, T>(globals: &super::Globals, message: S, task: F) -> T
where
    S: Into<Cow<'static, str>>,
    F: Future<Output = T>,
{
    let spinner = new_spinner(hide_progress(globals), "{spinner:.blue} {msg}");
    spinner.set_message(message);

    let result = task.await;

    spinner.finish_and_clear();

    result
}

/// Run the masking job, reporting each object as it's done and the totals at the end
pub(crate) async fn run_mask_job(
    globals: &super::Globals,
    job: MaskJob,
    abort: impl Future<Output = ()>,
) -> Result<MaskSummary> {
    let progress = MaskProgressReport::new(hide_progress(globals), globals.quiet);

    job.run(abort, progress).await
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the spinner rendering will be all messed up), or quiet mode (because spinners
/// are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

fn new_spinner(hidden: bool, template: &str) -> indicatif::ProgressBar {
    let spinner = if !hidden {
        indicatif::ProgressBar::new_spinner()
    } else {
        indicatif::ProgressBar::hidden()
    };

    spinner.set_style(
        indicatif::ProgressStyle::with_template(template)
            .expect("BUG: progress template is valid")
            .tick_strings(TICK_STRINGS),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));

    spinner
}

/// Receives progress updates from the workers and renders them.
///
/// The spinner position counts masked objects.  Skipped and failed objects are printed above the
/// spinner as they happen.
struct MaskProgressReport {
    spinner: indicatif::ProgressBar,
    quiet: bool,
}

impl MaskProgressReport {
    fn new(hide_progress: bool, quiet: bool) -> Self {
        let spinner = new_spinner(
            hide_progress,
            "{spinner:.green} [{elapsed_precise}] {pos} objects masked {wide_msg}",
        );

        Self { spinner, quiet }
    }
}

impl MaskProgressCallback for MaskProgressReport {
    fn object_skipped(&self, key: &str, reason: SkipReason) {
        self.spinner.println(format!("Skipped {key} ({reason})"));
    }

    fn object_masking_starting(&self, key: &str, size: u64) {
        let size = indicatif::HumanBytes(size);
        self.spinner.set_message(format!("{key} ({size})"));
    }

    fn object_masked(&self, key: &str) {
        self.spinner.inc(1);
        self.spinner.println(format!("Masked {key}"));
    }

    fn object_failed(&self, key: &str, error: &S3MaskError) {
        self.spinner.println(format!("FAILED {key}: {error}"));
    }

    fn job_finished(&self, summary: &MaskSummary) {
        self.spinner.finish_and_clear();

        if !self.quiet {
            println!("{summary}");
        }
    }
}
