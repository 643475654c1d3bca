use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;

const LOG_LEVEL_VAR: &str = "SENSU_ELASTIC_LOG_LEVEL";

/// Install a JSON-lines subscriber on stderr, filtered by
/// `SENSU_ELASTIC_LOG_LEVEL` (default `WARN`).
///
/// Fails if the host already installed a global subscriber; in that case the
/// forwarder's events go to the host's subscriber.
pub fn try_init() -> Result<(), TryInitError> {
    let level = parse_level(std::env::var(LOG_LEVEL_VAR).ok().as_deref());

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .try_init()
}

fn parse_level(raw: Option<&str>) -> LevelFilter {
    raw.and_then(|val| {
        val.parse::<LevelFilter>().ok().or_else(|| {
            eprintln!("invalid {LOG_LEVEL_VAR}: {val:?}, defaulting to WARN");
            None
        })
    })
    .unwrap_or(LevelFilter::WARN)
}
