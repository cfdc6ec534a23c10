//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Output options for the global subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Emit one JSON object per event instead of human readable lines
    pub json: bool,
    /// Lower the default level from `info` to `debug`
    pub verbose: bool,
}

impl LogOptions {
    fn default_level(&self) -> filter::LevelFilter {
        if self.verbose {
            filter::LevelFilter::DEBUG
        } else {
            filter::LevelFilter::INFO
        }
    }
}

/// initiate the global tracing subscriber
///
/// `RUST_LOG` still overrides the default level chosen by `options`.
pub fn init(options: LogOptions) {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(options.default_level().into())
        .from_env_lossy();

    let fmt_layer = if options.json {
        layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    } else {
        layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed()
    };

    registry().with(fmt_layer.with_filter(env_filter)).init();
}
