//! Shared plumbing for the rscp tools
//!
//! Holds the pieces every binary in the workspace needs before any transfer
//! starts: logging setup, tokio runtime construction and the [`Summary`]
//! counters reported at the end of a run.
//!
//! # Logging
//!
//! Logs go to stderr through `tracing-subscriber`. The level is derived from
//! [`OutputConfig`]: `-v` INFO, `-vv` DEBUG, `-vvv` TRACE, ERROR otherwise and
//! nothing at all in quiet mode. `RUST_LOG` takes precedence when set.

pub mod config;
pub mod summary;

pub use config::{OutputConfig, RuntimeConfig};
pub use summary::Summary;

/// Install the global fmt subscriber for the given output settings
pub fn init_tracing(output: &OutputConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(output.level_filter().into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err))
}

/// Run `func` to completion on a freshly built runtime.
///
/// Returns `None` if the runtime could not be created or `func` failed; the
/// error is printed to stderr unless `output.quiet` is set.
pub fn run<Fut, S>(output: OutputConfig, runtime: RuntimeConfig, func: impl FnOnce() -> Fut) -> Option<S>
where
    Fut: std::future::Future<Output = anyhow::Result<S>>,
    S: std::fmt::Display,
{
    if let Err(error) = init_tracing(&output) {
        eprintln!("failed to initialize logging: {error:#}");
    }
    let runtime = match runtime.build_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to build tokio runtime: {error:#}");
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.wants_summary() {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::debug!("run failed: {:?}", &error);
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
