//! Tracing initialisation for the `gatekeep` binary.
//!
//! Safe to call more than once; only the first call installs a subscriber.

use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` directives are layered over `level`. Logs go to stderr so
/// stdout stays reserved for command output. With `json`, each line is a
/// flat JSON object that carries the fields of the enclosing
/// `gatekeep.drive` / `gatekeep.job` span, so `run_id` and `job` can be
/// filtered on without parsing messages.
pub fn init_tracing(json: bool, level: Level) {
    let (text_layer, json_layer) = if json {
        let layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true);
        (None, Some(layer))
    } else {
        let layer = fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false);
        (Some(layer), None)
    };

    tracing_subscriber::registry()
        .with(filter(level))
        .with(text_layer)
        .with(json_layer)
        .try_init()
        .ok();
}

fn filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}
