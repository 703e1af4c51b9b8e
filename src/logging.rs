//! Tracing subscriber setup.
//!
//! Diagnostics go to stderr so command output on stdout stays clean for
//! piping. The filter comes from `FINSIGHT_LOG` (e.g. `finsight=debug`),
//! defaulting to `warn` for one-shot commands and `info` for the worker.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "FINSIGHT_LOG";

/// Install the global subscriber. Calling it twice is a no-op.
pub fn init(json: bool, default_level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
