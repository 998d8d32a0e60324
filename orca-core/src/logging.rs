use orca_common::LogLevel;
use tracing::*;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Handle for swapping the log level at runtime when the gateway config
/// changes. An explicit `RUST_LOG` always wins over the stored level.
#[derive(Clone)]
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

pub fn init_logging(initial: LogLevel) -> LogLevelHandle {
    let (filter, handle) = reload::Layer::new(make_filter(initial));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    LogLevelHandle { handle }
}

impl LogLevelHandle {
    pub fn apply(&self, level: LogLevel) {
        if std::env::var("RUST_LOG").is_ok() {
            debug!("RUST_LOG is set, ignoring configured log level");
            return;
        }
        if let Err(error) = self.handle.reload(make_filter(level)) {
            warn!(%error, "failed to swap log level");
        }
    }
}

fn make_filter(level: LogLevel) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(spec) => EnvFilter::new(spec),
        Err(_) => {
            let l = level.as_filter();
            EnvFilter::new(format!(
                "orca={l},orca_common={l},orca_core={l},orca_protocol_ssh={l}"
            ))
        }
    }
}
