//! Per-test log capture.
//!
//! Masking jobs log from many tokio tasks at once, spread across the runtime's worker threads.
//! The usual test subscriber only sees events from the thread that installed it, and output from
//! concurrently running tests gets interleaved, so each test here gets its own runtime whose
//! threads all log to the same buffer, which is printed when the test ends.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{subscriber::DefaultGuard, Dispatch};
use tracing_subscriber::fmt::MakeWriter;

/// Filter used when `RUST_LOG` isn't set.  The HTTP client stack is very chatty at debug level.
const DEFAULT_FILTER: &str = "hyper=info,reqwest=info,httpmock=info,aws=info,debug";

std::thread_local! {
    static RUNTIME_THREAD_DISPATCH: RefCell<Option<DefaultGuard>> = RefCell::new(None);
}

/// Log events captured from every thread of one test's runtime
#[derive(Clone, Default)]
struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Everything logged so far, with invalid UTF-8 replaced
    fn drain(&self) -> String {
        let bytes = std::mem::take(&mut *self.buffer.lock().unwrap());

        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for &CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn capturing_dispatch(logs: CapturedLogs) -> Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // Worker spans carry the worker ID, but thread IDs still help when reading interleaved tasks
    let format = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(logs);

    Dispatch::new(tracing_subscriber::registry().with(filter).with(format))
}

/// Build a multi-threaded runtime whose threads all make `dispatch` their default
fn runtime_with_dispatch(dispatch: &Dispatch) -> std::io::Result<tokio::runtime::Runtime> {
    let on_start = dispatch.clone();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .on_thread_start(move || {
            let guard = tracing::dispatcher::set_default(&on_start);
            RUNTIME_THREAD_DISPATCH.with(|cell| cell.replace(Some(guard)));
        })
        .on_thread_stop(|| {
            RUNTIME_THREAD_DISPATCH.with(|cell| cell.replace(None));
        })
        .build()
}

/// Run an async test on a dedicated runtime, with logging captured for this test only.
///
/// Use in place of `#[tokio::test]`.  Every log event from the test, including events from tasks
/// it spawns on any runtime thread, is printed after the test finishes (or panics), so that the
/// log output of each test reads on its own rather than mixed in with other tests running in
/// parallel.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let logs = CapturedLogs::default();
    let dispatch = capturing_dispatch(logs.clone());

    tracing::dispatcher::with_default(&dispatch, || {
        let runtime = runtime_with_dispatch(&dispatch)?;

        // The test future isn't required to be unwind safe; the panic is re-raised below anyway
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log events from this test: \n{}", logs.drain());

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
