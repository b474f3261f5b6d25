//! Logging setup.
//!
//! Logs go to stdout through a compact fmt layer, at least at the
//! "ERROR" level. Only events from this crate are shown unless the
//! configured level is a full filter directive like
//! `snapflow=debug,rusqlite=warn`.

use ::tracing::level_filters::LevelFilter;
use ::tracing::Subscriber;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::Error;
use crate::errors::Result;

/// Which events to log.
#[derive(Debug)]
pub(crate) enum LogFilter {
    /// Only this crate, at this level.
    Level(LevelFilter),
    Directive(String),
}

pub(crate) fn get_log_level(level: Option<&str>) -> Result<LogFilter> {
    let Some(level) = level else {
        return Ok(LogFilter::Level(LevelFilter::ERROR));
    };
    let filter = match level.to_lowercase().as_str() {
        "trace" => LogFilter::Level(LevelFilter::TRACE),
        "debug" => LogFilter::Level(LevelFilter::DEBUG),
        "info" => LogFilter::Level(LevelFilter::INFO),
        "warn" => LogFilter::Level(LevelFilter::WARN),
        "error" => LogFilter::Level(LevelFilter::ERROR),
        "off" => LogFilter::Level(LevelFilter::OFF),
        _ if level.contains('=') => {
            EnvFilter::try_new(level)
                .map_err(|err| Error::Config(format!("bad log directive {level:?}: {err}")))?;
            LogFilter::Directive(level.to_owned())
        }
        level => return Err(Error::Config(format!("wrong log level: {level}"))),
    };
    Ok(filter)
}

/// Install the global log subscriber.
///
/// `log_level` is a level name or an env filter directive. Calling
/// this again after a subscriber is installed only logs a warning.
pub fn setup_tracing(log_level: Option<&str>) -> Result<()> {
    let filter = match get_log_level(log_level)? {
        LogFilter::Level(level) => FilterExt::boxed(Targets::new().with_target("snapflow", level)),
        LogFilter::Directive(directive) => FilterExt::boxed(
            EnvFilter::try_new(&directive).map_err(|err| Error::Config(err.to_string()))?,
        ),
    };

    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
        .with_filter(filter);

    set_global_subscriber(Registry::default().with(logs));
    Ok(())
}

// Try to set a global default subscriber, logging the error without
// failing if one was already set.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This fails if tracing was already initialized, which happens
    // when more than one cluster is started in the same process.
    if let Err(err) = ::tracing::subscriber::set_global_default(subscriber) {
        ::tracing::warn!("{err}");
    }
}

#[test]
fn log_levels_parse() {
    assert!(matches!(
        get_log_level(None).unwrap(),
        LogFilter::Level(LevelFilter::ERROR)
    ));
    assert!(matches!(
        get_log_level(Some("DEBUG")).unwrap(),
        LogFilter::Level(LevelFilter::DEBUG)
    ));
    assert!(matches!(
        get_log_level(Some("snapflow=trace,rusqlite=warn")).unwrap(),
        LogFilter::Directive(_)
    ));
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(Error::Config(_))
    ));
}

#[test]
fn setup_twice_is_fine() {
    setup_tracing(Some("info")).unwrap();
    setup_tracing(Some("info")).unwrap();
}
