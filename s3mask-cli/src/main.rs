use clap::Parser;
use color_eyre::Section;
use s3mask::{ErrorKind, MaskJobBuilder, MaskSource, S3MaskError};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod progress;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_CARGO_TARGET_TRIPLE"),
    ", ",
    env!("VERGEN_CARGO_OPT_LEVEL"),
    ")"
);

/// Mask every object under an S3 prefix using a masking service.
///
/// The masked copy of each object is written back into the same bucket under the masked prefix,
/// and (unless disabled) the masking service's report of what it found is written under the
/// results prefix.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_version = LONG_VERSION)]
struct Args {
    /// The bucket to mask, either a bare bucket name or an S3 URL with an optional prefix.
    ///
    /// EXAMPLES:
    ///
    /// my-bucket             - Mask every object in the bucket `my-bucket`
    ///
    /// s3://my-bucket/data/  - Mask every object in `my-bucket` whose key starts with `data/`
    #[clap(value_name = "BUCKET_OR_URL")]
    source: String,

    #[clap(flatten)]
    config: s3mask::Config,

    #[clap(flatten)]
    globals: Globals,
}

/// Arguments that control the output of the tool itself
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    init_logging(&args.globals);

    debug!(?args, "Starting masking job");

    let source = MaskSource::parse(&args.source).map_err(with_hint)?;
    let job = progress::with_spinner(
        &args.globals,
        format!("Checking access to {}", args.source),
        MaskJobBuilder::new(args.config, source).build(),
    )
    .await
    .map_err(with_hint)?;

    progress::run_mask_job(&args.globals, job, abort_on_ctrl_c())
        .await
        .map_err(with_hint)?;

    Ok(())
}

/// Attach a suggestion of what to check, based on which stage of the job failed
fn with_hint(error: S3MaskError) -> color_eyre::Report {
    let hint = match error.kind() {
        ErrorKind::Enumeration => {
            "Check the bucket name and the AWS credentials and region (--profile, --aws-region)"
        }
        ErrorKind::Setup => "Check that the masking service is reachable at --masking-url",
        ErrorKind::MaskingService => "The masking service's response is included above",
        ErrorKind::Read => "Check that your IAM identity can read the objects in the bucket",
        ErrorKind::Write => {
            "Check that your IAM identity can write to the bucket, and that --results-dir is writable"
        }
        ErrorKind::Teardown => {
            "Masking contexts may have been left behind on the masking service"
        }
        ErrorKind::Job => return color_eyre::Report::new(error),
    };

    color_eyre::Report::new(error).suggestion(hint)
}

/// Log to stderr, so that anything written to stdout is only the job output.
///
/// `RUST_LOG` overrides the level implied by `--verbose` and `--quiet`.
fn init_logging(globals: &Globals) {
    let default_filter = if globals.verbose {
        "info,s3mask=debug"
    } else if globals.quiet {
        "error"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

/// Completes when the user presses Ctrl-C, which aborts the job
async fn abort_on_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a signal handler the job can't be aborted, but it can still run to completion
        warn!(err = ?e, "Unable to listen for Ctrl-C");
        futures::future::pending::<()>().await;
    }

    warn!("Ctrl-C received, aborting the masking job");
}
